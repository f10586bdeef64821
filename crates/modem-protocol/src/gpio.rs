//! Power key and status line access
//!
//! The modem exposes two control signals: an active-low power key input and
//! a status output that reads high while the modem is powered.

use crate::error::ModemError;
use tokio_serial::SerialPort;
use tracing::debug;

/// Output driving the modem's power key
pub trait PowerKey {
    /// Pull the power key low
    fn press(&mut self) -> Result<(), ModemError>;

    /// Let the power key float back high
    fn release(&mut self) -> Result<(), ModemError>;
}

/// Input reading the modem's status pin
pub trait StatusLine {
    /// Whether the status pin is electrically high
    fn is_high(&mut self) -> Result<bool, ModemError>;
}

/// Control lines wired through a USB-serial adapter's modem signals.
///
/// DTR drives the power key (asserted DTR pulls the TTL line low) and DSR
/// reads the status pin. The adapter is opened separately from the data
/// port so power sequencing works before the data link exists.
pub struct ControlLines {
    port: Box<dyn SerialPort>,
    device: String,
}

impl ControlLines {
    /// Open the control adapter and leave the power key released
    pub fn open(device: &str) -> Result<Self, ModemError> {
        debug!("Opening control lines on {}", device);
        let port = tokio_serial::new(device, 9600).open()?;

        let mut lines = Self {
            port,
            device: device.to_string(),
        };
        lines.release()?;
        Ok(lines)
    }

    /// Second handle to the same adapter, so key and status can be owned apart
    pub fn try_clone(&self) -> Result<Self, ModemError> {
        Ok(Self {
            port: self.port.try_clone()?,
            device: self.device.clone(),
        })
    }

    /// Device path of the control adapter
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl PowerKey for ControlLines {
    fn press(&mut self) -> Result<(), ModemError> {
        self.port
            .write_data_terminal_ready(true)
            .map_err(|e| ModemError::Gpio(format!("{}: DTR assert failed: {}", self.device, e)))
    }

    fn release(&mut self) -> Result<(), ModemError> {
        self.port
            .write_data_terminal_ready(false)
            .map_err(|e| ModemError::Gpio(format!("{}: DTR release failed: {}", self.device, e)))
    }
}

impl StatusLine for ControlLines {
    fn is_high(&mut self) -> Result<bool, ModemError> {
        self.port
            .read_data_set_ready()
            .map_err(|e| ModemError::Gpio(format!("{}: DSR read failed: {}", self.device, e)))
    }
}
