//! Error types for the frame codec.

use thiserror::Error;

/// Errors that can occur while decoding a MAC header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer ended before the header was complete.
    #[error("Header too short: need {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required for this frame type.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown frame type code.
    #[error("Invalid frame type: {0:#04x}")]
    InvalidFrameType(u8),

    /// NAV duration above the 15-bit limit.
    #[error("Duration out of range: {0} us")]
    DurationOutOfRange(u16),
}
