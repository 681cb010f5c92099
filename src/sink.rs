//! Health/result sink: the handoff boundary between the scheduler and the
//! external storage/parsing collaborator.

use crate::scrape::ScrapeResult;
use crate::target::TargetDescriptor;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events the scheduler reports downstream.
#[derive(Debug, Clone)]
pub enum ScrapeUpdate {
    Result(ScrapeResult),
    /// A tick that could not fire because the previous fetch for the same
    /// target was still in flight.
    SkippedTick {
        target: Arc<TargetDescriptor>,
        at: DateTime<Utc>,
    },
}

/// Enqueue-only sink handle held by every per-target scheduler.
///
/// `record` never blocks: a slow downstream consumer must not stall the
/// scrape cadence of unrelated targets, so overflow drops the update with a
/// warning instead of applying backpressure to the scheduler.
#[derive(Clone)]
pub struct ResultSink {
    tx: mpsc::Sender<ScrapeUpdate>,
}

impl ResultSink {
    /// Create a sink and the receiver half owned by the downstream consumer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ScrapeUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn record(&self, update: ScrapeUpdate) {
        if let Err(e) = self.tx.try_send(update) {
            tracing::warn!("Result sink full, dropping scrape update: {}", e);
        }
    }
}
