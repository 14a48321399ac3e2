//! Runtime configuration.

use std::time::Duration;

/// Liveness limits for a [`RuntimeService`](crate::RuntimeService).
///
/// Both limits treat expiry as a transport failure: the backend is torn down
/// and the next request boots a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Maximum time from spawning (or starting a resync) until the backend
    /// acknowledges the sync. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Maximum time a single execution may stay in flight. `None` waits forever.
    pub execution_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(Duration::from_secs(30)),
            execution_timeout: None,
        }
    }
}

impl RuntimeConfig {
    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-execution timeout.
    #[must_use]
    pub const fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.execution_timeout, None);
    }

    #[test]
    fn test_builder_methods() {
        let config = RuntimeConfig::default()
            .with_handshake_timeout(None)
            .with_execution_timeout(Some(Duration::from_millis(250)));
        assert_eq!(config.handshake_timeout, None);
        assert_eq!(config.execution_timeout, Some(Duration::from_millis(250)));
    }
}
