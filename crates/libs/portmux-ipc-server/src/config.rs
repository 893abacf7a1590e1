use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ServerError;

const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 20_000;

/// Tunables for a [`Registry`](crate::Registry).
///
/// ```toml
/// trusted_origins = ["chrome-extension://abc"]
/// allow_insecure_origins = ["http://localhost:5173"]
/// approval_timeout_ms = 30000
/// stream_idle_timeout_ms = 0   # 0 disables the idle timeout
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Origins accepted without consulting the approval policy.
    pub trusted_origins: BTreeSet<String>,
    /// Plain `http://` origins that may still go through approval.
    pub allow_insecure_origins: BTreeSet<String>,
    pub approval_timeout_ms: u64,
    pub stream_idle_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            trusted_origins: BTreeSet::new(),
            allow_insecure_origins: BTreeSet::new(),
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
            stream_idle_timeout_ms: DEFAULT_STREAM_IDLE_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    pub fn from_toml(input: &str) -> Result<Self, ServerError> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ServerError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn trust(mut self, origin: impl Into<String>) -> Self {
        self.trusted_origins.insert(origin.into());
        self
    }

    pub fn approval_timeout(&self) -> Option<Duration> {
        (self.approval_timeout_ms > 0)
            .then(|| Duration::from_millis(self.approval_timeout_ms))
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_ms > 0)
            .then(|| Duration::from_millis(self.stream_idle_timeout_ms))
    }
}
