//! Scrape target model types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// URL scheme used to reach a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// One scrape endpoint, fully resolved from configuration.
///
/// Descriptors are immutable: a configuration change replaces the descriptor
/// (old scheduler torn down, new one installed) rather than mutating it.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDescriptor {
    /// Job this target belongs to; groups targets and labels results.
    pub job_name: String,
    /// host:port, already environment-substituted.
    pub address: String,
    pub scheme: Scheme,
    /// Absolute path on the target serving metrics.
    pub metrics_path: String,
    pub scrape_interval: Duration,
    /// Hard fetch deadline; always <= `scrape_interval`.
    pub scrape_timeout: Duration,
    /// Skip TLS certificate verification. Off unless explicitly configured.
    pub tls_skip_verify: bool,
}

impl TargetDescriptor {
    /// Identity tuple for pool membership.
    pub fn id(&self) -> TargetId {
        TargetId {
            job_name: self.job_name.clone(),
            address: self.address.clone(),
            metrics_path: self.metrics_path.clone(),
        }
    }

    /// Full URL the fetch client issues its GET against.
    pub fn url(&self) -> String {
        let path = if self.metrics_path.starts_with('/') {
            self.metrics_path.clone()
        } else {
            format!("/{}", self.metrics_path)
        };
        format!("{}://{}{}", self.scheme, self.address, path)
    }
}

/// Uniquely identifies a target within the scheduler pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId {
    pub job_name: String,
    pub address: String,
    pub metrics_path: String,
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.job_name, self.address, self.metrics_path)
    }
}
