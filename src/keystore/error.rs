//! Key-store errors

use crate::uid::Uid;
use thiserror::Error;

/// Errors from key-store persistence and transactions
#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem failure reading, writing or snapshotting the store
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored line failed to parse
    #[error("corrupt key store record at line {line}: {reason}")]
    Corrupt {
        /// 1-based line number in the store file
        line: usize,
        /// What was wrong with it
        reason: String,
    },

    /// A provisioning transaction is already open for this UID
    #[error("provisioning already in progress for {0}")]
    UidBusy(Uid),

    /// No record exists for this UID
    #[error("no record for UID {0}")]
    UnknownUid(Uid),

    /// A counter update that does not move forward
    #[error("read counter {received} not above last seen {last_seen}")]
    CounterRegression {
        /// Counter offered
        received: u32,
        /// Highest counter on record
        last_seen: u32,
    },
}
