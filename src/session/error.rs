//! Session-engine errors

use crate::{apdu, apdu::StatusWord, command, transport};
use thiserror::Error;

/// Errors from opening or driving an authenticated session.
///
/// With the sole exception of command-parse failures, every error here
/// leaves the session terminated: a later `send` returns
/// [`Error::SessionClosed`].
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure; the counter may have advanced on the tag
    #[error(transparent)]
    Transport(#[from] transport::Error),

    /// APDU framing failure
    #[error(transparent)]
    Apdu(#[from] apdu::Error),

    /// Command-level failure (plain exchange or response parsing)
    #[error(transparent)]
    Command(#[from] command::Error),

    /// Tag returned a non-success status word
    #[error("tag returned {0}")]
    Status(StatusWord),

    /// `RndA'` did not verify: wrong key, or not an NTAG424
    #[error("mutual authentication failed (RndA mismatch)")]
    AuthenticationFailed,

    /// Response CMAC did not verify. Host-side integrity bug or a
    /// tampered channel; either way the session is dead.
    #[error("response MAC mismatch")]
    ResponseMac,

    /// Full-mode response failed to decrypt to valid padding
    #[error("response padding invalid")]
    ResponsePadding,

    /// Operation on a session that has already been torn down
    #[error("session closed")]
    SessionClosed,

    /// The 16-bit command counter would wrap
    #[error("command counter exhausted")]
    CounterExhausted,

    /// ISO (`CLA=0x00`) commands are never routed through a session
    #[error("ISO command 0x{ins:02X} cannot run inside a session")]
    IsoCommandInSession {
        /// Instruction byte of the refused command
        ins: u8,
    },
}
