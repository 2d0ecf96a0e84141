//! Command-level errors

use crate::{apdu, apdu::StatusWord, transport};
use thiserror::Error;

/// Errors from encoding a command or decoding its response
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure during a plain exchange
    #[error(transparent)]
    Transport(#[from] transport::Error),

    /// APDU framing failure
    #[error(transparent)]
    Apdu(#[from] apdu::Error),

    /// Tag returned a non-success status word
    #[error("tag returned {0}")]
    Status(StatusWord),

    /// A MAC- or Full-mode command was sent without a session
    #[error("command 0x{ins:02X} requires an authenticated session")]
    SessionRequired {
        /// Instruction byte of the refused command
        ins: u8,
    },

    /// Response body did not match the command's expected shape
    #[error("malformed response to 0x{ins:02X}: {reason} (len {len})")]
    ResponseFormat {
        /// Instruction byte
        ins: u8,
        /// Observed body length
        len: usize,
        /// What was wrong
        reason: &'static str,
    },
}
