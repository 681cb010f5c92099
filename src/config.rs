//! Agent configuration loading and validation.
//!
//! Parses the YAML job list, resolves `${NAME}` environment placeholders in
//! target addresses, applies global defaults, and validates every invariant
//! before any scheduler starts. Validation collects all violations so an
//! operator can fix a broken file in one pass.

use crate::target::{Scheme, TargetDescriptor, TargetId};

use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_METRICS_PATH: &str = "/metrics";

fn default_scrape_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_evaluation_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.to_string()
}

/// Configuration errors. `Invalid` is fatal at load and carries every
/// violation found, not just the first.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Top-level shape of the YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub rule_files: Vec<PathBuf>,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub scrape_configs: Vec<ScrapeConfig>,
}

/// Global defaults inherited by every job that does not override them.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_scrape_interval", with = "humantime_serde")]
    pub scrape_interval: Duration,
    #[serde(default = "default_scrape_timeout", with = "humantime_serde")]
    pub scrape_timeout: Duration,
    #[serde(default = "default_evaluation_interval", with = "humantime_serde")]
    pub evaluation_interval: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval: default_scrape_interval(),
            scrape_timeout: default_scrape_timeout(),
            evaluation_interval: default_evaluation_interval(),
        }
    }
}

/// One scrape job: a named group of targets sharing scrape parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,
    #[serde(default, with = "humantime_serde")]
    pub scrape_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub scrape_timeout: Option<Duration>,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default)]
    pub tls_config: TlsConfig,
    #[serde(default)]
    pub static_configs: Vec<StaticConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub alertmanagers: Vec<AlertmanagerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertmanagerConfig {
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default)]
    pub static_configs: Vec<StaticConfig>,
}

/// Fully resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub targets: Vec<TargetDescriptor>,
    /// Base URLs of the alertmanager endpoints alerts are forwarded to.
    pub alertmanagers: Vec<String>,
    /// Rule files consumed by the external evaluation collaborator.
    pub rule_files: Vec<PathBuf>,
    pub evaluation_interval: Duration,
}

/// Load and resolve the configuration file at `path`.
pub fn load(path: &Path) -> Result<AgentConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawConfig = serde_yaml::from_str(&contents)?;
    resolve(raw)
}

/// Resolve a parsed configuration into the validated target set.
pub fn resolve(raw: RawConfig) -> Result<AgentConfig, ConfigError> {
    let mut violations = Vec::new();
    let mut seen: HashSet<TargetId> = HashSet::new();
    let mut targets = Vec::new();

    for job in &raw.scrape_configs {
        if job.job_name.is_empty() {
            violations.push("scrape config with empty job_name".to_string());
            continue;
        }

        let interval = job.scrape_interval.unwrap_or(raw.global.scrape_interval);
        if interval.is_zero() {
            violations.push(format!("job {:?}: scrape_interval must be non-zero", job.job_name));
            continue;
        }

        // An explicitly configured timeout above the interval is an operator
        // error; an inherited global default is clamped to the job interval.
        let timeout = match job.scrape_timeout {
            Some(t) => {
                if t > interval {
                    violations.push(format!(
                        "job {:?}: scrape_timeout {:?} exceeds scrape_interval {:?}",
                        job.job_name, t, interval
                    ));
                }
                t
            }
            None => raw.global.scrape_timeout.min(interval),
        };

        for static_config in &job.static_configs {
            for raw_addr in &static_config.targets {
                let address = match substitute_env(raw_addr) {
                    Ok(a) => a,
                    Err(missing) => {
                        for name in missing {
                            violations.push(format!(
                                "job {:?}: undefined environment variable {} in target {:?}",
                                job.job_name, name, raw_addr
                            ));
                        }
                        continue;
                    }
                };
                if address.is_empty() {
                    violations.push(format!("job {:?}: empty target address", job.job_name));
                    continue;
                }

                let descriptor = TargetDescriptor {
                    job_name: job.job_name.clone(),
                    address,
                    scheme: job.scheme,
                    metrics_path: job.metrics_path.clone(),
                    scrape_interval: interval,
                    scrape_timeout: timeout,
                    tls_skip_verify: job.tls_config.insecure_skip_verify,
                };
                if !seen.insert(descriptor.id()) {
                    violations.push(format!(
                        "job {:?}: duplicate target {}",
                        job.job_name,
                        descriptor.id()
                    ));
                    continue;
                }
                targets.push(descriptor);
            }
        }
    }

    let mut alertmanagers = Vec::new();
    for am in &raw.alerting.alertmanagers {
        for static_config in &am.static_configs {
            for raw_addr in &static_config.targets {
                match substitute_env(raw_addr) {
                    Ok(address) if !address.is_empty() => {
                        alertmanagers.push(format!("{}://{}", am.scheme, address));
                    }
                    Ok(_) => violations.push("alerting: empty alertmanager address".to_string()),
                    Err(missing) => {
                        for name in missing {
                            violations.push(format!(
                                "alerting: undefined environment variable {} in target {:?}",
                                name, raw_addr
                            ));
                        }
                    }
                }
            }
        }
    }

    if !violations.is_empty() {
        return Err(ConfigError::Invalid(violations));
    }

    Ok(AgentConfig {
        targets,
        alertmanagers,
        rule_files: raw.rule_files,
        evaluation_interval: raw.global.evaluation_interval,
    })
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder pattern")
    })
}

/// Replace `${NAME}` placeholders with process environment values.
///
/// Returns the names of all unset variables instead of substituting them
/// with empty strings.
fn substitute_env(address: &str) -> Result<String, Vec<String>> {
    let mut missing = Vec::new();
    let substituted = placeholder_pattern().replace_all(address, |caps: &regex::Captures| {
        let name = &caps[1];
        match env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(substituted.into_owned())
    } else {
        Err(missing)
    }
}
