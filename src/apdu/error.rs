//! APDU codec errors

use thiserror::Error;

/// Errors from APDU framing
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// Command data exceeds the one-byte Lc limit
    #[error("command data too long: {len} bytes (max 255)")]
    DataTooLong {
        /// Offending data length
        len: usize,
    },

    /// Reader returned fewer than the two mandatory status bytes
    #[error("response too short: {len} bytes")]
    ResponseTooShort {
        /// Observed response length
        len: usize,
    },
}
