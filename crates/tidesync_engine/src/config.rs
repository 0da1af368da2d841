//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use std::time::Duration;

/// Configuration for push and pull cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Operations read from the log per push batch.
    pub push_batch_size: usize,
    /// Page size for pulls that do not set their own.
    pub default_page_size: usize,
    /// Upper bound for a single remote call.
    pub request_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            push_batch_size: 100,
            default_page_size: 50,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the default pull page size.
    pub fn with_default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> SyncResult<()> {
        if self.push_batch_size == 0 {
            return Err(SyncError::ValidationFailure(
                "push_batch_size must be at least 1".into(),
            ));
        }
        if self.default_page_size == 0 {
            return Err(SyncError::ValidationFailure(
                "default_page_size must be at least 1".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(SyncError::ValidationFailure(
                "request_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_push_batch_size(25)
            .with_default_page_size(2)
            .with_request_timeout(Duration::from_secs(5));

        assert_eq!(config.push_batch_size, 25);
        assert_eq!(config.default_page_size, 2);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(SyncConfig::new().with_push_batch_size(0).validate().is_err());
        assert!(SyncConfig::new().with_default_page_size(0).validate().is_err());
        assert!(SyncConfig::new()
            .with_request_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
