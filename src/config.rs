//! Configuration for index builds
//!
//! `IndexBuildConfig` is assembled through `IndexBuildConfigBuilder`, which
//! fills defaults and validates every value before a coordinator is created.

use std::time::Duration;

use crate::error::ConfigError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Prefix of build identities; the process-wide build counter is appended
pub const DEFAULT_BUILD_NAME_PREFIX: &str = "repl index builder";

/// Default bound on how long a launcher waits for a background build to start (30 seconds)
///
/// Covers acquiring the exclusive database lock and registering the index,
/// which can queue behind other schema operations.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Maximum allowed handshake timeout (5 minutes)
pub const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 300;

/// Documents scanned between interruption checks and scheduler yields
pub const DEFAULT_SCAN_YIELD_INTERVAL: usize = 128;

// ============================================================================
// Core Configuration Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBuildConfig {
    pub build_name_prefix: String,

    /// How long `start_background` waits for the start signal
    pub handshake_timeout: Duration,

    /// Bound on lock waits; `None` waits until interrupted
    pub lock_timeout: Option<Duration>,

    pub scan_yield_interval: usize,
}

impl Default for IndexBuildConfig {
    fn default() -> Self {
        Self {
            build_name_prefix: DEFAULT_BUILD_NAME_PREFIX.to_string(),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            lock_timeout: None,
            scan_yield_interval: DEFAULT_SCAN_YIELD_INTERVAL,
        }
    }
}

impl IndexBuildConfig {
    pub fn builder() -> IndexBuildConfigBuilder {
        IndexBuildConfigBuilder::new()
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

#[derive(Debug, Default)]
pub struct IndexBuildConfigBuilder {
    build_name_prefix: Option<String>,
    handshake_timeout: Option<Duration>,
    lock_timeout: Option<Duration>,
    scan_yield_interval: Option<usize>,
}

impl IndexBuildConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.build_name_prefix = Some(prefix.into());
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn scan_yield_interval(mut self, documents: usize) -> Self {
        self.scan_yield_interval = Some(documents);
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<IndexBuildConfig, ConfigError> {
        let defaults = IndexBuildConfig::default();
        let config = IndexBuildConfig {
            build_name_prefix: self.build_name_prefix.unwrap_or(defaults.build_name_prefix),
            handshake_timeout: self.handshake_timeout.unwrap_or(defaults.handshake_timeout),
            lock_timeout: self.lock_timeout,
            scan_yield_interval: self
                .scan_yield_interval
                .unwrap_or(defaults.scan_yield_interval),
        };

        Self::validate_prefix(&config.build_name_prefix)?;
        Self::validate_timeouts(&config)?;
        if config.scan_yield_interval == 0 {
            return Err(ConfigError::invalid_value(
                "scan_yield_interval",
                "must be greater than zero",
            ));
        }
        Ok(config)
    }

    fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
        if prefix.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "build_name_prefix",
                "cannot be empty",
            ));
        }
        Ok(())
    }

    fn validate_timeouts(config: &IndexBuildConfig) -> Result<(), ConfigError> {
        let handshake = config.handshake_timeout;
        if handshake.is_zero() {
            return Err(ConfigError::invalid_timeout(
                handshake,
                "Handshake timeout must be greater than zero",
            ));
        }
        if handshake > Duration::from_secs(MAX_HANDSHAKE_TIMEOUT_SECS) {
            return Err(ConfigError::invalid_timeout(
                handshake,
                format!("Handshake timeout cannot exceed {MAX_HANDSHAKE_TIMEOUT_SECS} seconds"),
            ));
        }
        if let Some(lock) = config.lock_timeout {
            if lock.is_zero() {
                return Err(ConfigError::invalid_timeout(
                    lock,
                    "Lock timeout must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}
