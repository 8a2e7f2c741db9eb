//! Client configuration
//!
//! Loaded from a TOML file, then overridden by `CYXGRID_*` environment
//! variables. Every field has a default, so an empty file is a valid config.
//!
//! Config file format:
//! ```toml
//! segment_size = 131072
//! shares_needed = 3
//! shares_total = 10
//! shares_happy = 7
//! max_put_attempts = 3
//! request_timeout_ms = 10000
//! segment_parallelism = 4
//! convergence_secret = "<base58, 32 bytes>"
//!
//! [breaker]
//! failure_threshold = 5
//! recovery_ms = 30000
//! ```

use crate::health::BreakerConfig;
use cyxgrid_core::{
    CodingParams, ConvergenceSecret, GridError, Result, DEFAULT_SEGMENT_SIZE,
    DEFAULT_SHARES_NEEDED, DEFAULT_SHARES_TOTAL, MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Plaintext segment size in bytes
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    /// Default shares needed to reconstruct (k)
    #[serde(default = "default_shares_needed")]
    pub shares_needed: usize,

    /// Default shares produced (n)
    #[serde(default = "default_shares_total")]
    pub shares_total: usize,

    /// Acknowledged shares required per segment; defaults to n
    #[serde(default)]
    pub shares_happy: Option<usize>,

    /// Put rounds per segment before giving up on a share
    #[serde(default = "default_max_put_attempts")]
    pub max_put_attempts: usize,

    /// Bound on every transport call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Segments fetched concurrently on download
    #[serde(default = "default_segment_parallelism")]
    pub segment_parallelism: usize,

    /// Base58 secret enabling convergent encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convergence_secret: Option<String>,

    /// Endpoint circuit breaker
    #[serde(default)]
    pub breaker: BreakerSettings,
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,

    #[serde(default = "default_recovery_ms")]
    pub recovery_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_ms: default_recovery_ms(),
        }
    }
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

fn default_shares_needed() -> usize {
    DEFAULT_SHARES_NEEDED
}

fn default_shares_total() -> usize {
    DEFAULT_SHARES_TOTAL
}

fn default_max_put_attempts() -> usize {
    3
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_segment_parallelism() -> usize {
    4
}

fn default_failure_threshold() -> u64 {
    5
}

fn default_recovery_ms() -> u64 {
    30_000
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            shares_needed: default_shares_needed(),
            shares_total: default_shares_total(),
            shares_happy: None,
            max_put_attempts: default_max_put_attempts(),
            request_timeout_ms: default_request_timeout_ms(),
            segment_parallelism: default_segment_parallelism(),
            convergence_secret: None,
            breaker: BreakerSettings::default(),
        }
    }
}

fn env_value<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| GridError::Configuration(format!("invalid value for {}: {:?}", name, raw))),
        None => Ok(None),
    }
}

impl GridConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GridError::Configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load from a TOML file if it exists, then apply environment overrides
    pub fn load_with_env(path: &Path) -> Result<Self> {
        Self::load_with_overrides(path, |name| std::env::var(name).ok())
    }

    /// Load from a TOML file if it exists, then apply overrides read through `lookup`
    pub fn load_with_overrides(
        path: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.with_overrides(lookup)
    }

    /// Defaults with environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `CYXGRID_*` overrides read through `lookup`
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = env_value(&lookup, "CYXGRID_SEGMENT_SIZE")? {
            self.segment_size = v;
        }
        if let Some(v) = env_value(&lookup, "CYXGRID_SHARES_NEEDED")? {
            self.shares_needed = v;
        }
        if let Some(v) = env_value(&lookup, "CYXGRID_SHARES_TOTAL")? {
            self.shares_total = v;
        }
        if let Some(v) = env_value(&lookup, "CYXGRID_SHARES_HAPPY")? {
            self.shares_happy = Some(v);
        }
        if let Some(v) = env_value(&lookup, "CYXGRID_MAX_PUT_ATTEMPTS")? {
            self.max_put_attempts = v;
        }
        if let Some(v) = env_value(&lookup, "CYXGRID_REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = v;
        }
        if let Some(v) = env_value(&lookup, "CYXGRID_SEGMENT_PARALLELISM")? {
            self.segment_parallelism = v;
        }
        if let Some(secret) = lookup("CYXGRID_CONVERGENCE_SECRET") {
            self.convergence_secret = Some(secret.trim().to_string());
        }
        self.validate()?;
        Ok(self)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&self.segment_size) {
            return Err(GridError::Configuration(format!(
                "segment_size {} outside {}..={}",
                self.segment_size, MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
            )));
        }
        let params = self
            .params()
            .map_err(|e| GridError::Configuration(e.to_string()))?;
        if let Some(happy) = self.shares_happy {
            if happy < params.needed() || happy > params.total() {
                return Err(GridError::Configuration(format!(
                    "shares_happy {} outside {}..={}",
                    happy,
                    params.needed(),
                    params.total()
                )));
            }
        }
        if self.max_put_attempts == 0 {
            return Err(GridError::Configuration(
                "max_put_attempts must be > 0".to_string(),
            ));
        }
        if self.segment_parallelism == 0 {
            return Err(GridError::Configuration(
                "segment_parallelism must be > 0".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(GridError::Configuration(
                "request_timeout_ms must be > 0".to_string(),
            ));
        }
        self.convergence_secret()?;
        Ok(())
    }

    /// Default coding parameters
    pub fn params(&self) -> Result<CodingParams> {
        CodingParams::new(self.shares_needed, self.shares_total)
    }

    /// Acknowledged shares a segment needs under `params`.
    ///
    /// Clamped into `k..=n` so per-upload parameters that differ from the
    /// configured defaults stay meaningful.
    pub fn shares_happy_for(&self, params: &CodingParams) -> usize {
        self.shares_happy
            .unwrap_or(params.total())
            .clamp(params.needed(), params.total())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parsed convergence secret
    pub fn convergence_secret(&self) -> Result<Option<ConvergenceSecret>> {
        self.convergence_secret
            .as_deref()
            .map(ConvergenceSecret::from_base58)
            .transpose()
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(self.breaker.recovery_ms),
        }
    }
}
