//! Modem Error Types

use crate::handshake::HandshakeStep;
use crate::power::PowerState;
use crate::session::SessionState;
use thiserror::Error;

/// Errors that can occur while driving the modem
#[derive(Debug, Clone, Error)]
pub enum ModemError {
    /// Serial port connection or I/O error
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Power key or status line could not be driven or read
    #[error("GPIO error: {0}")]
    Gpio(String),

    /// Status line never changed after a power key pulse
    #[error("Modem stayed {from} after power key pulse ({attempts} polls)")]
    PowerToggleTimeout { from: PowerState, attempts: u32 },

    /// Status line reports the wrong state after a power sequence
    #[error("Modem power state is {actual}, expected {expected}")]
    PowerStateMismatch {
        expected: PowerState,
        actual: PowerState,
    },

    /// A handshake step exhausted its attempts
    #[error("Handshake step '{step}' failed after {attempts} attempt(s)")]
    Handshake { step: HandshakeStep, attempts: u32 },

    /// Expected response never arrived
    #[error("Timeout waiting for {expected:?} after {command:?} ({attempts} x {timeout_ms}ms)")]
    CommandTimeout {
        command: String,
        expected: String,
        timeout_ms: u64,
        attempts: u32,
    },

    /// Serial pump stopped or the port reached end of stream
    #[error("Serial link closed")]
    LinkClosed,

    /// Receive ring filled up under the fail-loudly overflow policy
    #[error("Receive buffer overflow ({capacity} bytes)")]
    RxOverflow { capacity: usize },

    /// Operation called in the wrong session state
    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    /// Modem announced it is switching itself off
    #[error("Modem powered down unexpectedly: {0}")]
    UnexpectedPowerDown(String),

    /// Feature present only as a disabled extension point
    #[error("Not supported: {0}")]
    Unsupported(&'static str),
}

impl ModemError {
    /// Errors a supervisor can reasonably retry by restarting the session
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ModemError::Unsupported(_) | ModemError::InvalidState { .. })
    }
}

impl From<std::io::Error> for ModemError {
    fn from(err: std::io::Error) -> Self {
        ModemError::Serial(err.to_string())
    }
}

impl From<tokio_serial::Error> for ModemError {
    fn from(err: tokio_serial::Error) -> Self {
        ModemError::Serial(err.to_string())
    }
}
