//! SDM validation errors. All of them fail closed.

use crate::{keystore, ndef, uid::Uid};
use thiserror::Error;

/// Why an SDM URL was rejected
#[derive(Debug, Error)]
pub enum Error {
    /// Not parseable as a URL at all
    #[error("malformed URL: {0}")]
    MalformedUrl(String),

    /// A required query parameter is absent
    #[error("missing query parameter `{0}`")]
    MissingParameter(&'static str),

    /// A query parameter has the wrong length or is not hex
    #[error("invalid query parameter `{0}`")]
    InvalidParameter(&'static str),

    /// No record for this UID; an unknown tag is never trusted
    #[error("unknown tag UID {0}")]
    UnknownUid(Uid),

    /// The record exists but the tag was never (fully) provisioned
    #[error("tag {0} is not provisioned")]
    NotProvisioned(Uid),

    /// The tag was provisioned in Android-compat mode; its URLs carry
    /// no CMAC to check
    #[error("tag {0} was provisioned without a CMAC mirror")]
    MacMirrorDisabled(Uid),

    /// Counter at or below the highest one already accepted
    #[error("replay: counter {received} not above last seen {last_seen}")]
    Replay {
        /// Counter in the presented URL
        received: u32,
        /// Highest counter on record
        last_seen: u32,
    },

    /// The recomputed truncated CMAC differs from the presented one
    #[error("CMAC mismatch")]
    CmacMismatch,

    /// The stored URL template no longer yields valid offsets
    #[error(transparent)]
    Template(#[from] ndef::Error),

    /// Key-store failure while looking up or updating the record
    #[error(transparent)]
    KeyStore(#[from] keystore::Error),
}
