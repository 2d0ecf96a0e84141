//! Per-UID key records with two-phase provisioning transactions.
//!
//! Storage is a line-oriented file of hex-encoded records, rewritten
//! atomically (temp file + rename) on every mutation, with a timestamped
//! backup copy of the previous state taken first. An interior mutex
//! serializes all access; `begin_provision` additionally holds the UID
//! exclusively until `commit` or `abort`, so two provisioning runs can
//! never interleave on one tag.

mod error;

pub use self::error::Error;

use crate::{crypto::Key, uid::Uid};
use log::{debug, warn};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::Write,
    path::PathBuf,
    sync::Mutex,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Provisioning status of a tag
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    /// Never touched; all keys are the factory default
    Factory,
    /// A provisioning transaction is in flight
    Pending,
    /// Fully provisioned: keys rotated, NDEF written, SDM enabled
    Provisioned,
    /// A provisioning run failed; keys kept for recovery
    Failed,
    /// FormatPICC wiped the files; keys unchanged
    Reformatted,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Factory => "factory",
            Status::Pending => "pending",
            Status::Provisioned => "provisioned",
            Status::Failed => "failed",
            Status::Reformatted => "reformatted",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "factory" => Status::Factory,
            "pending" => Status::Pending,
            "provisioned" => Status::Provisioned,
            "failed" => Status::Failed,
            "reformatted" => Status::Reformatted,
            _ => return None,
        })
    }
}

/// Everything the engine knows about one tag
#[derive(Clone, Debug)]
pub struct KeyRecord {
    /// The tag's UID
    pub uid: Uid,
    /// Key slot 0
    pub picc_master_key: Key,
    /// Key slot 1
    pub app_read_key: Key,
    /// Key slot 3
    pub sdm_mac_key: Key,
    /// Lifecycle status
    pub status: Status,
    /// Whether the tag mirrors a CMAC into its URLs (false in
    /// Android-compat provisioning)
    pub mac_mirror: bool,
    /// Base URL written to the tag
    pub url: Option<String>,
    /// When provisioning committed
    pub provisioned_at: Option<OffsetDateTime>,
    /// Highest SDM read counter ever accepted for this tag
    pub last_seen_counter: u32,
}

impl KeyRecord {
    /// A factory-fresh record: all keys zero, nothing else known
    pub fn factory(uid: Uid) -> Self {
        Self {
            uid,
            picc_master_key: Key::FACTORY,
            app_read_key: Key::FACTORY,
            sdm_mac_key: Key::FACTORY,
            status: Status::Factory,
            mac_mirror: false,
            url: None,
            provisioned_at: None,
            last_seen_counter: 0,
        }
    }

    /// Serialize as one store line. The URL goes last because it is the
    /// only field that may contain arbitrary characters.
    fn to_line(&self) -> String {
        let provisioned_at = self
            .provisioned_at
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_else(|| "-".into());

        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.uid.to_hex(),
            hex::encode(self.picc_master_key.as_bytes()),
            hex::encode(self.app_read_key.as_bytes()),
            hex::encode(self.sdm_mac_key.as_bytes()),
            self.status.as_str(),
            if self.mac_mirror { "cmac" } else { "plain" },
            provisioned_at,
            self.last_seen_counter,
            self.url.as_deref().unwrap_or(""),
        )
    }

    fn from_line(line: &str, line_no: usize) -> Result<Self, Error> {
        let corrupt = |reason: &str| Error::Corrupt {
            line: line_no,
            reason: reason.into(),
        };

        let fields: Vec<&str> = line.splitn(9, ',').collect();
        if fields.len() != 9 {
            return Err(corrupt("expected 9 fields"));
        }

        let uid = Uid::from_hex(fields[0]).ok_or_else(|| corrupt("bad UID"))?;
        let key = |s: &str, name: &str| -> Result<Key, Error> {
            hex::decode(s)
                .ok()
                .and_then(|bytes| Key::from_slice(&bytes))
                .ok_or_else(|| corrupt(&format!("bad {} key", name)))
        };

        let provisioned_at = match fields[6] {
            "-" => None,
            ts => Some(
                OffsetDateTime::parse(ts, &Rfc3339).map_err(|_| corrupt("bad timestamp"))?,
            ),
        };

        Ok(Self {
            uid,
            picc_master_key: key(fields[1], "PICC master")?,
            app_read_key: key(fields[2], "app read")?,
            sdm_mac_key: key(fields[3], "SDM MAC")?,
            status: Status::parse(fields[4]).ok_or_else(|| corrupt("bad status"))?,
            mac_mirror: match fields[5] {
                "cmac" => true,
                "plain" => false,
                _ => return Err(corrupt("bad mirror mode")),
            },
            provisioned_at,
            last_seen_counter: fields[7]
                .parse()
                .map_err(|_| corrupt("bad counter"))?,
            url: if fields[8].is_empty() {
                None
            } else {
                Some(fields[8].to_string())
            },
        })
    }
}

/// The key material a provisioning transaction reserves
#[derive(Clone)]
pub struct ProvisionKeys {
    /// New key for slot 0
    pub picc_master_key: Key,
    /// New key for slot 1
    pub app_read_key: Key,
    /// New key for slot 3
    pub sdm_mac_key: Key,
}

/// Handle over an open provisioning transaction. Holds the UID
/// exclusively until passed back to [`KeyStore::commit`] or
/// [`KeyStore::abort`].
pub struct Transaction {
    uid: Uid,
    /// The freshly generated key material
    pub keys: ProvisionKeys,
}

impl Transaction {
    /// UID this transaction covers
    pub fn uid(&self) -> Uid {
        self.uid
    }
}

struct Inner {
    records: BTreeMap<Uid, KeyRecord>,
    pending: BTreeSet<Uid>,
}

/// File-backed store of [`KeyRecord`]s
pub struct KeyStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl KeyStore {
    /// Open a store, creating the file if it does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let mut records = BTreeMap::new();

        match fs::read_to_string(&path) {
            Ok(contents) => {
                for (index, line) in contents.lines().enumerate() {
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let record = KeyRecord::from_line(line, index + 1)?;
                    records.insert(record.uid, record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!("key store open: {} records from {:?}", records.len(), path);
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                records,
                pending: BTreeSet::new(),
            }),
        })
    }

    /// Fetch a record by UID. Returns a clone; readers never observe a
    /// torn record.
    pub fn get(&self, uid: &Uid) -> Option<KeyRecord> {
        self.lock().records.get(uid).cloned()
    }

    /// Reserve a `Pending` record with freshly generated keys and
    /// persist it, snapshotting whatever was there before.
    ///
    /// The UID stays locked to this transaction until `commit` or
    /// `abort`; a second `begin_provision` meanwhile fails with
    /// [`Error::UidBusy`]. The read counter restarts at zero: rotating
    /// the SDM MAC key starts a new counter epoch on the tag.
    pub fn begin_provision(
        &self,
        uid: Uid,
        url: &str,
        mac_mirror: bool,
    ) -> Result<Transaction, Error> {
        let keys = ProvisionKeys {
            picc_master_key: Key::random(),
            app_read_key: Key::random(),
            sdm_mac_key: Key::random(),
        };

        let mut inner = self.lock();
        if !inner.pending.insert(uid) {
            return Err(Error::UidBusy(uid));
        }

        let record = KeyRecord {
            uid,
            picc_master_key: keys.picc_master_key.clone(),
            app_read_key: keys.app_read_key.clone(),
            sdm_mac_key: keys.sdm_mac_key.clone(),
            status: Status::Pending,
            mac_mirror,
            url: Some(url.to_string()),
            provisioned_at: None,
            last_seen_counter: 0,
        };
        inner.records.insert(uid, record);

        if let Err(e) = self.persist(&inner) {
            inner.pending.remove(&uid);
            return Err(e);
        }
        Ok(Transaction { uid, keys })
    }

    /// Mark a transaction's record `Provisioned` and release the UID
    pub fn commit(&self, txn: Transaction) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.pending.remove(&txn.uid);

        let record = inner
            .records
            .get_mut(&txn.uid)
            .ok_or(Error::UnknownUid(txn.uid))?;
        record.status = Status::Provisioned;
        record.provisioned_at = Some(OffsetDateTime::now_utc());

        self.persist(&inner)
    }

    /// Mark a transaction's record `Failed`, keeping the partial keys
    /// for recovery, and release the UID
    pub fn abort(&self, txn: Transaction, reason: &str) -> Result<(), Error> {
        warn!("provisioning aborted for {}: {}", txn.uid, reason);

        let mut inner = self.lock();
        inner.pending.remove(&txn.uid);

        let record = inner
            .records
            .get_mut(&txn.uid)
            .ok_or(Error::UnknownUid(txn.uid))?;
        record.status = Status::Failed;

        self.persist(&inner)
    }

    /// Advance a tag's read counter, enforcing strict monotonicity under
    /// the store lock. This is the validator's only write path.
    pub fn record_read(&self, uid: &Uid, counter: u32) -> Result<(), Error> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(uid)
            .ok_or(Error::UnknownUid(*uid))?;

        if counter <= record.last_seen_counter {
            return Err(Error::CounterRegression {
                received: counter,
                last_seen: record.last_seen_counter,
            });
        }
        record.last_seen_counter = counter;

        self.persist(&inner)
    }

    /// Record a successful FormatPICC. Keys are unchanged; format wipes
    /// files, not key slots.
    pub fn mark_reformatted(&self, uid: &Uid) -> Result<(), Error> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(uid)
            .ok_or(Error::UnknownUid(*uid))?;
        record.status = Status::Reformatted;
        record.url = None;
        record.mac_mirror = false;

        self.persist(&inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the whole store atomically, preserving the previous file as
    /// a timestamped backup first
    fn persist(&self, inner: &Inner) -> Result<(), Error> {
        if self.path.exists() {
            let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
            let mut backup = self.path.as_os_str().to_owned();
            backup.push(format!(".{}.bak", stamp));
            fs::copy(&self.path, PathBuf::from(backup))?;
        }

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut file = fs::File::create(&tmp)?;
            writeln!(file, "# ntag424-dna key store v1")?;
            for record in inner.records.values() {
                writeln!(file, "{}", record.to_line())?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path().join("keys.csv")).unwrap();
        (dir, store)
    }

    fn uid() -> Uid {
        Uid::from_bytes([0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
    }

    const URL: &str =
        "https://example.com/sdm?uid=00000000000000&ctr=000000&cmac=0000000000000000";

    #[test]
    fn begin_reserves_pending_with_fresh_keys() {
        let (_dir, store) = store();
        let txn = store.begin_provision(uid(), URL, true).unwrap();

        let record = store.get(&uid()).unwrap();
        assert_eq!(record.status, Status::Pending);
        assert_eq!(record.picc_master_key, txn.keys.picc_master_key);
        assert!(!record.picc_master_key.is_factory());
        assert_eq!(record.url.as_deref(), Some(URL));

        // UID is held exclusively
        assert!(matches!(
            store.begin_provision(uid(), URL, true),
            Err(Error::UidBusy(_))
        ));

        store.commit(txn).unwrap();
        let record = store.get(&uid()).unwrap();
        assert_eq!(record.status, Status::Provisioned);
        assert!(record.provisioned_at.is_some());
    }

    #[test]
    fn abort_keeps_partial_keys() {
        let (_dir, store) = store();
        let txn = store.begin_provision(uid(), URL, true).unwrap();
        let keys = txn.keys.clone();

        store.abort(txn, "Session B: ChangeKey(1): test").unwrap();
        let record = store.get(&uid()).unwrap();
        assert_eq!(record.status, Status::Failed);
        assert_eq!(record.picc_master_key, keys.picc_master_key);

        // UID is free again
        store.begin_provision(uid(), URL, true).unwrap();
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.csv");

        let store = KeyStore::open(&path).unwrap();
        let txn = store.begin_provision(uid(), URL, false).unwrap();
        let keys = txn.keys.clone();
        store.commit(txn).unwrap();
        store.record_read(&uid(), 7).unwrap();
        drop(store);

        let store = KeyStore::open(&path).unwrap();
        let record = store.get(&uid()).unwrap();
        assert_eq!(record.status, Status::Provisioned);
        assert_eq!(record.sdm_mac_key, keys.sdm_mac_key);
        assert!(!record.mac_mirror);
        assert_eq!(record.last_seen_counter, 7);
        assert_eq!(record.url.as_deref(), Some(URL));
        assert!(record.provisioned_at.is_some());
    }

    #[test]
    fn counter_is_strictly_monotonic() {
        let (_dir, store) = store();
        let txn = store.begin_provision(uid(), URL, true).unwrap();
        store.commit(txn).unwrap();

        store.record_read(&uid(), 5).unwrap();
        assert!(matches!(
            store.record_read(&uid(), 5),
            Err(Error::CounterRegression {
                received: 5,
                last_seen: 5
            })
        ));
        assert!(matches!(
            store.record_read(&uid(), 4),
            Err(Error::CounterRegression { .. })
        ));
        store.record_read(&uid(), 6).unwrap();
        assert_eq!(store.get(&uid()).unwrap().last_seen_counter, 6);
    }

    #[test]
    fn mutations_leave_backup_snapshots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.csv");

        let store = KeyStore::open(&path).unwrap();
        let txn = store.begin_provision(uid(), URL, true).unwrap();
        store.commit(txn).unwrap();

        let backups = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .count();
        assert!(backups >= 1, "expected at least one snapshot");
    }

    #[test]
    fn unknown_uid_fails_closed() {
        let (_dir, store) = store();
        assert!(store.get(&uid()).is_none());
        assert!(matches!(
            store.record_read(&uid(), 1),
            Err(Error::UnknownUid(_))
        ));
    }

    #[test]
    fn line_round_trip_preserves_url_with_commas() {
        let mut record = KeyRecord::factory(uid());
        record.url = Some("https://example.com/a,b?uid=00000000000000".into());
        record.status = Status::Failed;
        record.last_seen_counter = 42;

        let line = record.to_line();
        let parsed = KeyRecord::from_line(&line, 1).unwrap();
        assert_eq!(parsed.url, record.url);
        assert_eq!(parsed.status, Status::Failed);
        assert_eq!(parsed.last_seen_counter, 42);
    }
}
