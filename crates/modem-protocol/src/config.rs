//! Modem configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Power key timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// How long the power key is held low (milliseconds)
    pub pulse_ms: u64,

    /// Delay between status line polls after the pulse (milliseconds)
    pub poll_interval_ms: u64,

    /// Status polls before the toggle is declared failed
    pub poll_attempts: u32,

    /// Pause after a reset power-off before switching back on (milliseconds)
    pub settle_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            pulse_ms: 1000,
            poll_interval_ms: 100,
            poll_attempts: 20,
            settle_ms: 800,
        }
    }
}

impl PowerConfig {
    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// AT handshake timing and retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// `AT` probes sent while waiting for the modem to lock onto the baud rate
    pub baud_attempts: u32,

    /// Wait per `AT` probe (milliseconds)
    pub baud_timeout_ms: u64,

    /// Wait for `ATE0` and `AT+IFC` responses (milliseconds)
    pub command_timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            baud_attempts: 11,
            baud_timeout_ms: 100,
            command_timeout_ms: 1000,
        }
    }
}

impl HandshakeConfig {
    pub fn baud_timeout(&self) -> Duration {
        Duration::from_millis(self.baud_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// What the receive path does when the ring is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Stop reading the port until the consumer frees space
    #[default]
    Wait,
    /// Discard incoming bytes that do not fit
    DropNewest,
    /// Stop the receive path with an error
    Fail,
}

/// Serial link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Baud rate the port is opened at
    pub baud_rate: u32,

    /// Sleep between receive buffer polls while awaiting a response (milliseconds)
    pub rx_poll_interval_ms: u64,

    /// Receive overflow handling
    pub overflow: OverflowPolicy,

    /// Outstanding write requests queued for the serial pump
    pub request_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: crate::at::BAUD_RATE,
            rx_poll_interval_ms: 5,
            overflow: OverflowPolicy::Wait,
            request_queue: 16,
        }
    }
}

impl LinkConfig {
    pub fn rx_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rx_poll_interval_ms)
    }
}

/// Steady-state loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between passes over the receive buffer (milliseconds)
    pub service_interval_ms: u64,

    /// Connection maintenance period once the modem is initialized (milliseconds)
    pub maintenance_interval_ms: u64,

    /// Request GPRS bring-up during maintenance
    pub gprs_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_interval_ms: 500,
            maintenance_interval_ms: 10_000,
            gprs_enabled: false,
        }
    }
}

impl SessionConfig {
    pub fn service_interval(&self) -> Duration {
        Duration::from_millis(self.service_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

/// Full modem configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub power: PowerConfig,
    pub handshake: HandshakeConfig,
    pub link: LinkConfig,
    pub session: SessionConfig,
}

impl ModemConfig {
    /// Shorter timings for simulated runs
    pub fn fast() -> Self {
        Self {
            power: PowerConfig {
                poll_attempts: 10,
                settle_ms: 200,
                ..Default::default()
            },
            session: SessionConfig {
                service_interval_ms: 100,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_modem_timing() {
        let config = ModemConfig::default();
        assert_eq!(config.power.pulse(), Duration::from_millis(1000));
        assert_eq!(config.power.poll_attempts, 20);
        assert_eq!(config.handshake.baud_attempts, 11);
        assert_eq!(config.handshake.baud_timeout(), Duration::from_millis(100));
        assert_eq!(config.link.baud_rate, 115_200);
        assert_eq!(config.link.overflow, OverflowPolicy::Wait);
        assert!(!config.session.gprs_enabled);
    }

    #[test]
    fn test_fast_profile_keeps_pulse() {
        let config = ModemConfig::fast();
        assert_eq!(config.power.pulse_ms, 1000);
        assert_eq!(config.power.settle(), Duration::from_millis(200));
        assert_eq!(config.session.service_interval(), Duration::from_millis(100));
    }
}
