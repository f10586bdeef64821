//! Cellular Modem Protocol Implementation
//!
//! This crate drives a SIMCom-style cellular modem over a serial link: it
//! sequences the power key, runs the AT handshake (baud detection, echo
//! disable, hardware flow control) and parses the status lines the modem
//! sends while idle.

mod command;
mod config;
mod error;
mod gpio;
mod handshake;
mod link;
mod notification;
mod power;
mod session;
pub mod sim;

pub use command::{CommandChannel, CommandExchange};
pub use config::{HandshakeConfig, LinkConfig, ModemConfig, OverflowPolicy, PowerConfig, SessionConfig};
pub use error::ModemError;
pub use gpio::{ControlLines, PowerKey, StatusLine};
pub use handshake::{HandshakeReport, HandshakeSequencer, HandshakeStep};
pub use link::{
    spawn_pump, Connector, FlowControlled, LinkHandle, LinkRequest, RxConsumer, RxProducer, RxRing, SerialConnector,
    SerialLink, SerialPump, RX_BUFFER_SIZE,
};
pub use notification::Notification;
pub use power::{PowerSequencer, PowerState};
pub use session::{ModemSession, SessionState};

/// Fixed wire constants
pub mod at {
    /// Line ending appended to every command
    pub const LINE_ENDING: &str = "\r\n";
    /// Success sentinel searched for in responses
    pub const OK: &str = "OK\r";
    /// Baud rate the link is opened at
    pub const BAUD_RATE: u32 = 115_200;
    /// Status line sent by the modem once SMS services are up
    pub const SMS_READY: &str = "SMS Ready";
}
