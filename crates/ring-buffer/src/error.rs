//! Ring Buffer Error Types

use thiserror::Error;

/// Errors returned by ring buffer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Push attempted while every usable slot is occupied
    #[error("Ring buffer full ({capacity} elements)")]
    Full { capacity: usize },
}
