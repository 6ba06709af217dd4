//! Server configuration

use std::time::Duration;

/// Default per-round-trip deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of retransmissions per round-trip
pub const DEFAULT_RETRIES: u32 = 5;

/// Tuning knobs shared by every transfer the server spawns.
///
/// Invalid values fall back to the defaults rather than erroring, so a
/// `ServerConfig` is always usable.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum time one send-and-reply round-trip may take
    pub timeout: Duration,
    /// Maximum retransmissions of one datagram before the transfer is
    /// declared unresponsive
    pub retries: u32,
    /// Whether a receiver lingers after its final ACK to absorb and
    /// re-acknowledge retransmissions of the last DATA block
    pub dally: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            dally: false,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-round-trip deadline. Zero falls back to the default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// Set the retransmission budget. Zero falls back to the default.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = if retries == 0 {
            DEFAULT_RETRIES
        } else {
            retries
        };
        self
    }

    /// Enable or disable dallying termination for receivers
    pub fn dally(mut self, dally: bool) -> Self {
        self.dally = dally;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.retries, 5);
        assert!(!config.dally);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = ServerConfig::new()
            .timeout(Duration::ZERO)
            .retries(0);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.retries, DEFAULT_RETRIES);
    }

    #[test]
    fn valid_values_stick() {
        let config = ServerConfig::new()
            .timeout(Duration::from_millis(250))
            .retries(2)
            .dally(true);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.retries, 2);
        assert!(config.dally);
    }
}
