#![allow(dead_code)] // each test binary uses a different fixture subset
//! Shared fixtures for the end-to-end suites.
//!
//! Each fixture opens a file-backed store in a temp directory (so a second
//! seeding connection can reach the same database), wires the full
//! component graph with a manual clock, and can serve the real HTTP
//! surface on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;

use aegis_core::latency::LatencyTracker;
use aegis_core::metrics::MetricsRegistry;
use aegis_daemon::alert::AlertDispatcher;
use aegis_daemon::clock::{ManualClock, SharedClock};
use aegis_daemon::config::Transports;
use aegis_daemon::health::HealthScorer;
use aegis_daemon::http::{self, AppInner, AppState};
use aegis_daemon::incidents::IncidentManager;
use aegis_daemon::invariants::InvariantEngine;
use aegis_daemon::report::ExecutiveReporter;
use aegis_daemon::scheduler::CronStatusBoard;
use aegis_daemon::security::{SecurityConfig, SecurityEngine};
use aegis_daemon::storage::Storage;
use tempfile::TempDir;

/// Fixture start time: 2024-01-01 00:00:00 UTC.
pub const START_MS: i64 = 1_704_067_200_000;

/// Fully wired control plane over a temp-file store.
pub struct ControlPlane {
    pub storage: Storage,
    pub registry: Arc<MetricsRegistry>,
    pub latency: Arc<LatencyTracker>,
    pub clock: Arc<ManualClock>,
    pub incidents: Arc<IncidentManager>,
    pub invariants: Arc<InvariantEngine>,
    pub security: Arc<SecurityEngine>,
    pub health: Arc<HealthScorer>,
    pub reporter: Arc<ExecutiveReporter>,
    pub cron: CronStatusBoard,
    pub db_path: std::path::PathBuf,
    #[allow(dead_code)]
    temp_dir: TempDir,
}

impl ControlPlane {
    /// Builds the full graph with a rate limit of `rate_limit_per_minute`.
    pub fn new(rate_limit_per_minute: u32) -> Self {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let db_path = temp_dir.path().join("aegis.db");
        let storage = Storage::open(&db_path).expect("open store");
        let registry = Arc::new(MetricsRegistry::new());
        let latency = Arc::new(LatencyTracker::new());
        let clock = Arc::new(ManualClock::new(START_MS));
        let shared_clock: SharedClock = Arc::clone(&clock) as SharedClock;

        let (alerts, _worker) =
            AlertDispatcher::new(Transports::default(), Arc::clone(&registry));
        let incidents = Arc::new(IncidentManager::new(
            storage.clone(),
            alerts.clone(),
            Arc::clone(&shared_clock),
            Arc::clone(&registry),
        ));
        let invariants = Arc::new(InvariantEngine::new(
            storage.clone(),
            Arc::clone(&incidents),
            Arc::clone(&shared_clock),
            Arc::clone(&registry),
        ));
        let security = Arc::new(SecurityEngine::new(
            storage.clone(),
            Arc::clone(&incidents),
            alerts.clone(),
            Arc::clone(&shared_clock),
            Arc::clone(&registry),
            SecurityConfig::default(),
            rate_limit_per_minute,
        ));
        let health = Arc::new(HealthScorer::new(
            storage.clone(),
            Arc::clone(&incidents),
            alerts,
            Arc::clone(&shared_clock),
            Arc::clone(&registry),
        ));
        let reporter = Arc::new(ExecutiveReporter::new(
            storage.clone(),
            Arc::clone(&shared_clock),
            Arc::clone(&registry),
            None,
        ));
        let cron: CronStatusBoard = Arc::new(std::sync::RwLock::new(
            std::collections::HashMap::new(),
        ));

        Self {
            storage,
            registry,
            latency,
            clock,
            incidents,
            invariants,
            security,
            health,
            reporter,
            cron,
            db_path,
            temp_dir,
        }
    }

    /// Opens a second connection for seeding business tables.
    pub fn seed_connection(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.db_path).expect("seed connection")
    }

    /// Creates the business tables the integrity checks read.
    pub fn create_business_tables(&self) {
        self.seed_connection()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS stock_items (id TEXT PRIMARY KEY, shop_id TEXT, \
                     product_id TEXT, quantity INTEGER NOT NULL DEFAULT 0);
                 CREATE TABLE IF NOT EXISTS stock_movements (id TEXT PRIMARY KEY, \
                     stock_item_id TEXT NOT NULL, delta INTEGER NOT NULL, \
                     created_at INTEGER NOT NULL DEFAULT 0);
                 CREATE TABLE IF NOT EXISTS sales (id TEXT PRIMARY KEY, shop_id TEXT, \
                     user_id TEXT, invoice_number TEXT, status TEXT NOT NULL, \
                     total INTEGER NOT NULL DEFAULT 0, \
                     credit_amount INTEGER NOT NULL DEFAULT 0, \
                     created_at INTEGER NOT NULL DEFAULT 0);
                 CREATE TABLE IF NOT EXISTS sale_items (id TEXT PRIMARY KEY, \
                     sale_id TEXT NOT NULL, total INTEGER NOT NULL DEFAULT 0);
                 CREATE TABLE IF NOT EXISTS payments (id TEXT PRIMARY KEY, \
                     sale_id TEXT NOT NULL, amount INTEGER NOT NULL DEFAULT 0, \
                     created_at INTEGER NOT NULL DEFAULT 0);
                 CREATE TABLE IF NOT EXISTS customers (id TEXT PRIMARY KEY, \
                     credit_limit INTEGER NOT NULL DEFAULT 0, \
                     outstanding_credit INTEGER NOT NULL DEFAULT 0);",
            )
            .expect("business schema");
    }

    /// Serves the HTTP surface on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let state = AppState::new(AppInner {
            storage: self.storage.clone(),
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock) as SharedClock,
            latency: Arc::clone(&self.latency),
            security: Arc::clone(&self.security),
            health: Arc::clone(&self.health),
            incidents: Arc::clone(&self.incidents),
            reporter: Arc::clone(&self.reporter),
            cron: Arc::clone(&self.cron),
        });
        let router = http::router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        addr
    }
}
