//! Lock-Free Ring Buffer
//!
//! Provides a fixed-capacity SPSC ring buffer for serial receive paths. An
//! interrupt (or a task standing in for one) pushes bytes through a
//! [`Producer`] while the polling loop pulls complete lines out through a
//! [`Consumer`].

mod buffer;
mod error;
mod line;
mod split;

pub use buffer::RingBuffer;
pub use error::BufferError;
pub use line::is_terminator;
pub use split::{Consumer, Producer};

/// Byte ring sized for a modem receive channel
pub type ByteRing<const S: usize> = RingBuffer<u8, S>;
