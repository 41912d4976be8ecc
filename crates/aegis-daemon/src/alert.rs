//! Alert dispatch to the configured webhook transports.
//!
//! Engines emit alerts synchronously through [`AlertDispatcher::send`],
//! which enqueues onto an unbounded channel; the [`AlertWorker`] drains the
//! channel and posts to the configured transports. Delivery uses the
//! network retry policy behind a circuit breaker so a dead webhook cannot
//! stall or cascade into the engines.
//!
//! Transports: the primary alert webhook receives the structured wire
//! shape, the optional secondary channel receives a rendered text message,
//! and the paging integration receives only CRITICAL alerts.

use std::sync::Arc;
use std::time::Duration;

use aegis_core::breaker::{BreakerConfig, CircuitBreaker};
use aegis_core::metrics::{MetricsRegistry, Severity, ThresholdBreach};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Transports;
use crate::selfheal::NetworkRetryError;

/// Webhook request timeout.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// One alert on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Alert severity.
    pub severity: Severity,
    /// Short headline.
    pub title: String,
    /// Longer description.
    pub body: String,
    /// Metric that triggered the alert, when threshold-driven.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    /// Observed value, when threshold-driven.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<f64>,
    /// Configured limit, when threshold-driven.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Alert {
    /// Creates a plain alert.
    #[must_use]
    pub fn new(severity: Severity, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            body: body.into(),
            metric: None,
            actual_value: None,
            threshold: None,
        }
    }

    /// Creates an alert from a metric threshold breach.
    #[must_use]
    pub fn from_breach(breach: &ThresholdBreach) -> Self {
        Self {
            severity: breach.severity,
            title: format!("Metric threshold breached: {}", breach.metric),
            body: format!(
                "{} {} {} (actual {})",
                breach.metric, breach.op, breach.threshold, breach.actual
            ),
            metric: Some(breach.metric.clone()),
            actual_value: Some(breach.actual),
            threshold: Some(breach.threshold),
        }
    }
}

/// Sending half handed to every engine.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::UnboundedSender<Alert>,
    registry: Arc<MetricsRegistry>,
}

impl AlertDispatcher {
    /// Creates the dispatcher/worker pair.
    #[must_use]
    pub fn new(
        transports: Transports,
        registry: Arc<MetricsRegistry>,
    ) -> (Self, AlertWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            tx,
            registry: Arc::clone(&registry),
        };
        let breaker = CircuitBreaker::new(
            "alert_webhook",
            BreakerConfig::default(),
            Arc::clone(&registry),
        );
        let worker = AlertWorker {
            rx,
            transports,
            client: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_default(),
            breaker,
            registry,
        };
        (dispatcher, worker)
    }

    /// Enqueues an alert for delivery. Never blocks; a closed worker only
    /// costs the metric.
    pub fn send(&self, alert: Alert) {
        debug!(severity = %alert.severity, title = %alert.title, "alert queued");
        self.registry.increment("alerts.queued");
        if self.tx.send(alert).is_err() {
            warn!("alert worker gone; alert dropped");
            self.registry.increment("alerts.dropped");
        }
    }

    /// Binds metric threshold breaches to this dispatcher.
    pub fn bind_threshold_breaches(&self, registry: &MetricsRegistry) {
        let forward = self.clone();
        registry.on_threshold_breach(move |breach| {
            forward.send(Alert::from_breach(breach));
        });
    }
}

/// Draining half; run on a background task.
pub struct AlertWorker {
    rx: mpsc::UnboundedReceiver<Alert>,
    transports: Transports,
    client: reqwest::Client,
    breaker: CircuitBreaker,
    registry: Arc<MetricsRegistry>,
}

impl AlertWorker {
    /// Drains the queue until every dispatcher clone is dropped.
    pub async fn run(mut self) {
        while let Some(alert) = self.rx.recv().await {
            self.deliver(&alert).await;
        }
    }

    async fn deliver(&self, alert: &Alert) {
        if let Some(url) = self.transports.alert_webhook_url.clone() {
            let payload = serde_json::to_value(alert).unwrap_or_else(|_| json!({}));
            self.post_with_retry(&url, payload).await;
        }
        if let Some(url) = self.transports.slack_webhook_url.clone() {
            self.post_with_retry(&url, slack_payload(alert)).await;
        }
        if alert.severity == Severity::Critical {
            if let Some(key) = self.transports.pagerduty_routing_key.clone() {
                self.post_with_retry(
                    "https://events.pagerduty.com/v2/enqueue",
                    pagerduty_payload(alert, &key),
                )
                .await;
            }
        }
    }

    /// Posts `payload` with the network retry policy; a rejected breaker is
    /// terminal for this delivery.
    async fn post_with_retry(&self, url: &str, payload: serde_json::Value) {
        let outcome = crate::selfheal::with_network_retry(&self.breaker, &self.registry, || {
            self.post_once(url, &payload)
        })
        .await;
        match outcome {
            Ok(()) => {
                self.registry.increment("alerts.delivered");
            },
            Err(NetworkRetryError::BreakerOpen(_)) => {
                warn!(url, "alert delivery skipped: webhook breaker open");
                self.registry.increment("alerts.breaker_rejected");
            },
            Err(NetworkRetryError::Inner(err)) => {
                warn!(url, error = %err, "alert delivery failed");
                self.registry.increment("alerts.failed");
            },
        }
    }

    async fn post_once(&self, url: &str, payload: &serde_json::Value) -> Result<(), String> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook answered {}", response.status()))
        }
    }
}

fn slack_payload(alert: &Alert) -> serde_json::Value {
    json!({
        "text": format!("[{}] {}\n{}", alert.severity, alert.title, alert.body),
    })
}

fn pagerduty_payload(alert: &Alert, routing_key: &str) -> serde_json::Value {
    json!({
        "routing_key": routing_key,
        "event_action": "trigger",
        "payload": {
            "summary": alert.title,
            "severity": "critical",
            "source": "aegis-daemon",
            "custom_details": { "body": alert.body, "metric": alert.metric },
        },
    })
}
