//! Alert forwarding boundary.
//!
//! The scheduler core does not evaluate rules; an external rule-evaluation
//! collaborator submits alerts here and a background dispatcher forwards
//! them to every configured alertmanager endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

const DISPATCH_QUEUE_CAPACITY: usize = 1000;
const DISPATCH_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DISPATCH_BATCH_LIMIT: usize = 64;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// One alert in the alertmanager v2 wire shape.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(name: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("alertname".to_string(), name.to_string());
        Self {
            labels,
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }
}

/// Submit surface for the external rule-evaluation collaborator.
///
/// `submit` enqueues without blocking; delivery failures are logged by the
/// dispatch task and never propagate to the submitter.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Alert>,
}

impl Notifier {
    /// Create the notifier and start its dispatch task. `endpoints` are
    /// alertmanager base URLs from the agent configuration.
    pub fn new(endpoints: Vec<String>) -> Self {
        let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        tokio::spawn(run_dispatch(rx, endpoints));
        Self { tx }
    }

    pub fn submit(&self, alert: Alert) {
        if let Err(e) = self.tx.try_send(alert) {
            tracing::warn!("Alert queue full, dropping alert: {}", e);
        }
    }
}

/// Accumulate submitted alerts and flush them in batches.
async fn run_dispatch(mut rx: mpsc::Receiver<Alert>, endpoints: Vec<String>) {
    if endpoints.is_empty() {
        tracing::info!("No alertmanager endpoints configured, alerts will be dropped");
    }

    let client = match reqwest::Client::builder().timeout(DELIVERY_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Failed to build alert delivery client: {}", e);
            return;
        }
    };

    let mut buffer: Vec<Alert> = Vec::new();
    let mut flush = tokio::time::interval(DISPATCH_FLUSH_INTERVAL);

    loop {
        tokio::select! {
            alert = rx.recv() => {
                match alert {
                    Some(a) => {
                        buffer.push(a);
                        if buffer.len() >= DISPATCH_BATCH_LIMIT {
                            deliver(&client, &endpoints, &mut buffer).await;
                        }
                    }
                    None => {
                        // All submitters gone, flush remaining and exit.
                        deliver(&client, &endpoints, &mut buffer).await;
                        break;
                    }
                }
            }
            _ = flush.tick() => {
                deliver(&client, &endpoints, &mut buffer).await;
            }
        }
    }
}

async fn deliver(client: &reqwest::Client, endpoints: &[String], buffer: &mut Vec<Alert>) {
    if buffer.is_empty() || endpoints.is_empty() {
        buffer.clear();
        return;
    }

    for endpoint in endpoints {
        let url = format!("{}/api/v2/alerts", endpoint);
        match client.post(&url).json(&buffer).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::error!(
                    "Alertmanager {} rejected {} alerts: HTTP {}",
                    endpoint,
                    buffer.len(),
                    response.status()
                );
            }
            Err(e) => {
                tracing::error!("Failed to deliver alerts to {}: {}", endpoint, e);
            }
        }
    }

    buffer.clear();
}
