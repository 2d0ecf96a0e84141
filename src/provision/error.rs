//! Provisioning errors, each naming the phase that failed

use super::Phase;
use crate::{command, keystore, ndef, session};
use thiserror::Error;

/// Errors from a provisioning or format run
#[derive(Debug, Error)]
pub enum Error {
    /// A tag exchange failed; the phase pins down which one
    #[error("{phase}: {source}")]
    Exchange {
        /// Where in the sequence the failure happened
        phase: Phase,
        /// The underlying session or command failure
        #[source]
        source: session::Error,
    },

    /// The URL template is unusable
    #[error(transparent)]
    Ndef(#[from] ndef::Error),

    /// Key-store failure; the transaction is aborted
    #[error(transparent)]
    KeyStore(#[from] keystore::Error),
}

impl Error {
    pub(super) fn at(phase: Phase) -> impl FnOnce(session::Error) -> Self {
        move |source| Error::Exchange { phase, source }
    }

    pub(super) fn at_plain(phase: Phase) -> impl FnOnce(command::Error) -> Self {
        move |source| Error::Exchange {
            phase,
            source: source.into(),
        }
    }
}
