//! HTTP fetch client: one scrape attempt against one target.

use crate::target::TargetDescriptor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Per-scrape failure taxonomy. These are non-fatal: the scheduler records
/// them and the next tick proceeds on schedule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("scrape timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
}

/// Successful fetch payload, handed to the sink untouched; parsing belongs
/// to the downstream collaborator.
#[derive(Debug, Clone)]
pub struct FetchSuccess {
    pub status: u16,
    pub payload: String,
}

/// Outcome of one fetch attempt.
#[derive(Debug, Clone)]
pub enum ScrapeOutcome {
    Success { status: u16, payload: String },
    Failure(FetchError),
}

impl ScrapeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ScrapeOutcome::Success { .. })
    }
}

/// Outcome of one scrape attempt against one target. Produced by the
/// per-target scheduler, consumed once by the result sink.
#[derive(Debug, Clone)]
pub struct ScrapeResult {
    pub target: Arc<TargetDescriptor>,
    /// Fetch start time.
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: ScrapeOutcome,
}

/// The fetch seam between the scheduler and the network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, target: &TargetDescriptor) -> Result<FetchSuccess, FetchError>;
}

/// Production fetcher. Stateless between invocations: every call builds a
/// client configured from the descriptor's timeout and TLS policy.
pub struct HttpFetcher;

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, target: &TargetDescriptor) -> Result<FetchSuccess, FetchError> {
        let client = reqwest::Client::builder()
            // Hard deadline covering connect, request, and body read.
            .timeout(target.scrape_timeout)
            .danger_accept_invalid_certs(target.tls_skip_verify)
            .build()
            .map_err(|e| FetchError::Connection(e.to_string()))?;

        let response = client
            .get(target.url())
            .send()
            .await
            .map_err(|e| classify(e, target.scrape_timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        // Read the full body so the timeout bounds the complete transfer.
        let payload = response
            .text()
            .await
            .map_err(|e| classify(e, target.scrape_timeout))?;

        Ok(FetchSuccess {
            status: status.as_u16(),
            payload,
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        FetchError::Connection(err.to_string())
    }
}
