use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A single configuration problem, reported with the offending property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub property: String,
    pub message: String,
}

impl Violation {
    pub fn new(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self { property: property.into(), message: message.into() }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error in property \"{}\": {}", self.property, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Unable to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("Invalid configuration: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Invalid(Vec<Violation>),
}

/// Failures of a single timed HTTP request.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe URL: {0}")]
    InvalidUrl(String),
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("unable to start browser: {0}")]
    Launch(String),
    #[error("unable to connect to browser at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("page error: {0}")]
    Page(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("page evaluation failed: {0}")]
    Evaluate(String),
    #[error("browser is not connected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("browser could not be started after {attempts} attempts")]
    RestartBudgetExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid InfluxDB settings: {0}")]
    Settings(String),
    #[error("InfluxDB request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("InfluxDB responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Database \"{0}\" not found on InfluxDB server")]
    DatabaseMissing(String),
    #[error("unexpected InfluxDB response: {0}")]
    InvalidResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_lists_every_violation() {
        let error = ConfigError::Invalid(vec![
            Violation::new("site_name", "cannot be empty"),
            Violation::new("check_interval", "too low"),
        ]);
        assert_eq!(
            error.to_string(),
            "Invalid configuration: Error in property \"site_name\": cannot be empty; \
             Error in property \"check_interval\": too low"
        );
    }
}
