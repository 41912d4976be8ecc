//! Process-level resource readings from `/proc`.
//!
//! Used by the memory-trend sampler and forensic snapshots. Readings are
//! best effort: on platforms without `/proc` (or when a read fails) the
//! caller gets `None` and records the sample as unavailable.

use std::fs;

/// Bytes per resident page. Linux defaults to 4 KiB; the constant is only
/// used to scale `/proc/self/statm`, which reports pages.
const PAGE_SIZE_BYTES: f64 = 4096.0;

/// Resident set size of this process in megabytes.
#[must_use]
pub fn heap_used_mb() -> Option<f64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * PAGE_SIZE_BYTES / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn resident_size_is_positive_on_linux() {
        let mb = heap_used_mb().expect("statm readable");
        assert!(mb > 0.0);
        assert!(mb < 1024.0 * 64.0);
    }
}
