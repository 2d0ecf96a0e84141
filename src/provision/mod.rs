//! The factory-to-provisioned state machine.
//!
//! Three authenticated sessions take a tag from delivery state to a
//! signed SDM beacon:
//!
//! - **Session A**: authenticate slot 0 with the current key, rotate
//!   it. The tag invalidates the session; so do we.
//! - **Session B**: authenticate with the new key 0, rotate the app
//!   read key (slot 1) and the SDM MAC key (slot 3).
//! - **Session C**: write the NDEF file over plain ISO commands while
//!   Write is still FREE, then authenticate again and enable SDM with
//!   ChangeFileSettings. Ordering is load-bearing: the offsets name
//!   positions inside file content that must already exist.
//!
//! The whole sequence runs inside a key-store transaction: `Pending`
//! before Session A, `Provisioned` only after ChangeFileSettings
//! succeeds, `Failed` on any error with the partial keys retained.

mod error;

pub use self::error::Error;

use crate::{
    command::{
        read_version, send_plain, ChangeFileSettings, ChangeKey, CommMode, FormatPicc,
        IsoSelectFile, IsoUpdateBinary, SelectPiccApplication,
    },
    crypto::Key,
    keystore::{KeyStore, ProvisionKeys},
    ndef::{
        build_ndef_file, AccessCondition, AccessRights, FileSettings, SdmOffsets, SdmSettings,
        NDEF_FILE_ID, NDEF_FILE_NO,
    },
    session::{Session, MAX_CHUNK_SIZE},
    transport::Transport,
    uid::Uid,
};
use log::{debug, info};
use std::fmt::{self, Display};

/// Key slot assignments this engine provisions
const KEY_SLOT_PICC_MASTER: u8 = 0;
const KEY_SLOT_APP_READ: u8 = 1;
const KEY_SLOT_SDM_MAC: u8 = 3;

/// Which SDM flavor to enable
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SdmMode {
    /// CMAC mirror driven by key slot 3. Strongest integrity, but
    /// reading the file then requires authentication, which Android's
    /// background dispatcher cannot perform.
    Cmac,

    /// `SDMFileRead = NEVER`: free reads, UID and counter mirrors only,
    /// no CMAC. The tag auto-launches on Android but its URLs cannot be
    /// validated.
    AndroidCompat,
}

impl SdmMode {
    fn file_read_access(self) -> AccessCondition {
        match self {
            SdmMode::Cmac => AccessCondition::Key(KEY_SLOT_SDM_MAC),
            SdmMode::AndroidCompat => AccessCondition::Never,
        }
    }

    fn mac_mirror(self) -> bool {
        self == SdmMode::Cmac
    }
}

/// Where in the sequence an exchange happened; rendered into every
/// user-visible failure
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Selecting the PICC application
    SelectApplication,
    /// Reading the UID via GetVersion
    ReadUid,
    /// Session A: authenticating with the current key 0
    SessionAAuth,
    /// Session A: rotating key 0
    SessionAChangeKey0,
    /// Session B: authenticating with the new key 0
    SessionBAuth,
    /// Session B: rotating the app read key
    SessionBChangeKey1,
    /// Session B: rotating the SDM MAC key
    SessionBChangeKey3,
    /// Session C: selecting the NDEF file
    SessionCSelectNdef,
    /// Session C: writing the NDEF file
    SessionCWriteNdef,
    /// Session C: authenticating for ChangeFileSettings
    SessionCAuth,
    /// Session C: enabling SDM
    SessionCChangeFileSettings,
    /// The standalone FormatPICC operation
    FormatPicc,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::SelectApplication => "SelectApplication",
            Phase::ReadUid => "GetVersion",
            Phase::SessionAAuth => "Session A: AuthenticateEV2First",
            Phase::SessionAChangeKey0 => "Session A: ChangeKey(0)",
            Phase::SessionBAuth => "Session B: AuthenticateEV2First",
            Phase::SessionBChangeKey1 => "Session B: ChangeKey(1)",
            Phase::SessionBChangeKey3 => "Session B: ChangeKey(3)",
            Phase::SessionCSelectNdef => "Session C: SelectFile(NDEF)",
            Phase::SessionCWriteNdef => "Session C: UpdateBinary",
            Phase::SessionCAuth => "Session C: AuthenticateEV2First",
            Phase::SessionCChangeFileSettings => "Session C: ChangeFileSettings",
            Phase::FormatPicc => "FormatPICC",
        })
    }
}

/// Outcome of a successful provisioning run
#[derive(Clone, Debug)]
pub struct ProvisionReport {
    /// UID of the provisioned tag
    pub uid: Uid,
    /// URL template written to it
    pub url: String,
    /// SDM flavor enabled
    pub mode: SdmMode,
}

/// Drives tags from factory state to provisioned against a key store
pub struct Provisioner<'a> {
    store: &'a KeyStore,
}

impl<'a> Provisioner<'a> {
    /// Create a provisioner over a key store
    pub fn new(store: &'a KeyStore) -> Self {
        Self { store }
    }

    /// Provision the tag on `transport` with `url` as its SDM template.
    ///
    /// The template must contain the three zero-filled placeholders
    /// (`uid=` + 14, `ctr=` + 6, `cmac=` + 16). On any failure the
    /// record is marked `Failed` and the error names the phase.
    pub fn provision<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        url: &str,
        mode: SdmMode,
    ) -> Result<ProvisionReport, Error> {
        // Validate the template before touching the tag or the store
        let offsets = SdmOffsets::from_template(url)?;
        let file = build_ndef_file(url)?;

        let uid = self.identify(transport)?;
        let current = CurrentKeys::for_record(self.store.get(&uid));

        let txn = self.store.begin_provision(uid, url, mode.mac_mirror())?;
        info!("provisioning {} ({:?})", uid, mode);

        match run_sessions(transport, &txn.keys, &current, &file, &offsets, mode) {
            Ok(()) => {
                self.store.commit(txn)?;
                info!("provisioned {}", uid);
                Ok(ProvisionReport {
                    uid,
                    url: url.to_string(),
                    mode,
                })
            }
            Err(e) => {
                self.store.abort(txn, &e.to_string())?;
                Err(e)
            }
        }
    }

    /// Wipe the tag's files with FormatPICC (single session, slot 0).
    ///
    /// Tags with the command fused off answer `0x911C`; that surfaces as
    /// `IllegalCommand`, is terminal, and leaves the record untouched.
    pub fn format_picc<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<Uid, Error> {
        let uid = self.identify(transport)?;
        let key0 = self
            .store
            .get(&uid)
            .map(|record| record.picc_master_key)
            .unwrap_or(Key::FACTORY);

        let mut session =
            Session::open(transport, KEY_SLOT_PICC_MASTER, &key0).map_err(Error::at(Phase::FormatPicc))?;
        session
            .send(&FormatPicc)
            .map_err(Error::at(Phase::FormatPicc))?;
        session.close();

        match self.store.mark_reformatted(&uid) {
            // Never-seen tags have nothing to mark
            Err(crate::keystore::Error::UnknownUid(_)) => {}
            other => other?,
        }
        info!("formatted {}", uid);
        Ok(uid)
    }

    fn identify<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<Uid, Error> {
        send_plain(transport, &SelectPiccApplication)
            .map_err(Error::at_plain(Phase::SelectApplication))?;
        let version = read_version(transport).map_err(Error::at_plain(Phase::ReadUid))?;
        debug!("tag {} in field", version.uid);
        Ok(version.uid)
    }
}

/// The keys currently on the tag, as far as the store knows. Factory
/// for tags never seen before.
struct CurrentKeys {
    key0: Key,
    key1: Key,
    key3: Key,
}

impl CurrentKeys {
    fn for_record(record: Option<crate::keystore::KeyRecord>) -> Self {
        match record {
            Some(record) => Self {
                key0: record.picc_master_key.clone(),
                key1: record.app_read_key.clone(),
                key3: record.sdm_mac_key.clone(),
            },
            None => Self {
                key0: Key::FACTORY,
                key1: Key::FACTORY,
                key3: Key::FACTORY,
            },
        }
    }
}

fn run_sessions<T: Transport + ?Sized>(
    transport: &mut T,
    keys: &ProvisionKeys,
    current: &CurrentKeys,
    file: &[u8],
    offsets: &SdmOffsets,
    mode: SdmMode,
) -> Result<(), Error> {
    // Session A: rotate the PICC master key. ChangeKey(0) kills the
    // session on the tag; Session::send mirrors that on success.
    let mut session = Session::open(transport, KEY_SLOT_PICC_MASTER, &current.key0)
        .map_err(Error::at(Phase::SessionAAuth))?;
    session
        .send(&ChangeKey {
            key_no: KEY_SLOT_PICC_MASTER,
            new_key: keys.picc_master_key.clone(),
            old_key: current.key0.clone(),
            key_version: 0x00,
        })
        .map_err(Error::at(Phase::SessionAChangeKey0))?;
    session.close();
    debug!("session A complete: key 0 rotated");

    // Session B: rotate the application keys under the new key 0. The
    // XOR masks use whatever is in those slots now: the factory key on
    // first contact, the stored keys on a re-provision.
    let mut session = Session::open(transport, KEY_SLOT_PICC_MASTER, &keys.picc_master_key)
        .map_err(Error::at(Phase::SessionBAuth))?;
    session
        .send(&ChangeKey {
            key_no: KEY_SLOT_APP_READ,
            new_key: keys.app_read_key.clone(),
            old_key: current.key1.clone(),
            key_version: 0x00,
        })
        .map_err(Error::at(Phase::SessionBChangeKey1))?;
    session
        .send(&ChangeKey {
            key_no: KEY_SLOT_SDM_MAC,
            new_key: keys.sdm_mac_key.clone(),
            old_key: current.key3.clone(),
            key_version: 0x00,
        })
        .map_err(Error::at(Phase::SessionBChangeKey3))?;
    session.close();
    debug!("session B complete: app keys rotated");

    // Session C, plain half: write the NDEF file while Write is FREE
    send_plain(transport, &IsoSelectFile { file_id: NDEF_FILE_ID })
        .map_err(Error::at_plain(Phase::SessionCSelectNdef))?;
    for (index, chunk) in file.chunks(MAX_CHUNK_SIZE).enumerate() {
        send_plain(
            transport,
            &IsoUpdateBinary {
                offset: (index * MAX_CHUNK_SIZE) as u16,
                data: chunk.to_vec(),
            },
        )
        .map_err(Error::at_plain(Phase::SessionCWriteNdef))?;
    }
    debug!("session C: NDEF file written ({} bytes)", file.len());

    // Session C, authenticated half: enable SDM over the content that
    // now exists
    let settings = FileSettings {
        comm_mode: CommMode::Plain,
        access: AccessRights {
            read: AccessCondition::Free,
            write: AccessCondition::Key(KEY_SLOT_PICC_MASTER),
            read_write: AccessCondition::Key(KEY_SLOT_PICC_MASTER),
            change: AccessCondition::Key(KEY_SLOT_PICC_MASTER),
        },
        sdm: Some(SdmSettings::for_offsets(offsets, mode.file_read_access())?),
    };
    let change = ChangeFileSettings::new(NDEF_FILE_NO, &settings)?;

    let mut session = Session::open(transport, KEY_SLOT_PICC_MASTER, &keys.picc_master_key)
        .map_err(Error::at(Phase::SessionCAuth))?;
    session
        .send(&change)
        .map_err(Error::at(Phase::SessionCChangeFileSettings))?;
    session.close();
    debug!("session C complete: SDM enabled");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apdu::StatusWord,
        command::GetFileSettings,
        keystore::Status,
        mocktag::MockTag,
        session,
        validator::{self, Validator},
    };
    use tempfile::{tempdir, TempDir};

    const TEMPLATE: &str =
        "https://example.com/sdm?uid=00000000000000&ctr=000000&cmac=0000000000000000";

    fn store() -> (TempDir, KeyStore) {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path().join("keys.csv")).unwrap();
        (dir, store)
    }

    #[test]
    fn factory_tag_reaches_provisioned() {
        let (_dir, store) = store();
        let mut tag = MockTag::new();

        let report = Provisioner::new(&store)
            .provision(&mut tag, TEMPLATE, SdmMode::Cmac)
            .unwrap();
        assert_eq!(report.uid, tag.uid());

        // Record committed with rotated keys and the URL
        let record = store.get(&tag.uid()).unwrap();
        assert_eq!(record.status, Status::Provisioned);
        assert!(record.provisioned_at.is_some());
        assert!(record.mac_mirror);
        assert_eq!(record.url.as_deref(), Some(TEMPLATE));
        assert!(!record.picc_master_key.is_factory());
        assert!(!record.app_read_key.is_factory());
        assert!(!record.sdm_mac_key.is_factory());

        // The tag holds the same keys
        assert_eq!(tag.key(0), &record.picc_master_key);
        assert_eq!(tag.key(1), &record.app_read_key);
        assert_eq!(tag.key(3), &record.sdm_mac_key);

        // File 2 content matches the computed NDEF template exactly
        let file = build_ndef_file(TEMPLATE).unwrap();
        assert_eq!(&tag.ndef_file()[..file.len()], &file[..]);
        assert!(tag.ndef_file()[file.len()..].iter().all(|&b| b == 0));

        // GetFileSettings reflects free read, keyed write, SDM with the
        // offsets the host computed
        let info = crate::command::send_plain(&mut tag, &GetFileSettings { file_no: 0x02 })
            .unwrap();
        assert_eq!(info.settings.access.read, AccessCondition::Free);
        assert_eq!(info.settings.access.write, AccessCondition::Key(0));

        let offsets = SdmOffsets::from_template(TEMPLATE).unwrap();
        let sdm = info.settings.sdm.expect("SDM enabled");
        assert_eq!(sdm.uid_offset, Some(offsets.uid));
        assert_eq!(sdm.ctr_offset, Some(offsets.ctr));
        assert_eq!(sdm.mac_input_offset, Some(offsets.mac_input));
        assert_eq!(sdm.mac_offset, Some(offsets.mac));
        assert_eq!(sdm.access.file_read, AccessCondition::Key(3));
    }

    #[test]
    fn android_compat_mode_drops_the_mac_offsets() {
        let (_dir, store) = store();
        let mut tag = MockTag::new();

        Provisioner::new(&store)
            .provision(&mut tag, TEMPLATE, SdmMode::AndroidCompat)
            .unwrap();

        let sdm = tag.ndef_settings().sdm.expect("SDM enabled");
        assert_eq!(sdm.access.file_read, AccessCondition::Never);
        assert!(sdm.mac_input_offset.is_none());
        assert!(sdm.mac_offset.is_none());
        assert!(sdm.uid_offset.is_some());
        assert!(sdm.ctr_offset.is_some());

        // No CMAC mirror means nothing can ever validate for this UID
        let record = store.get(&tag.uid()).unwrap();
        assert!(!record.mac_mirror);

        let url = tag.emit_sdm_url().unwrap();
        assert!(matches!(
            Validator::new(&store).validate(&url),
            Err(validator::Error::MacMirrorDisabled(_))
        ));
    }

    #[test]
    fn emitted_urls_validate_once_and_replays_are_rejected() {
        let (_dir, store) = store();
        let mut tag = MockTag::new();

        Provisioner::new(&store)
            .provision(&mut tag, TEMPLATE, SdmMode::Cmac)
            .unwrap();
        let validator = Validator::new(&store);

        let first = tag.emit_sdm_url().unwrap();
        let read = validator.validate(&first).unwrap();
        assert_eq!(read.uid, tag.uid());
        assert_eq!(read.counter, 1);

        // Same URL again: the counter no longer moves forward
        assert!(matches!(
            validator.validate(&first),
            Err(validator::Error::Replay {
                received: 1,
                last_seen: 1
            })
        ));

        // The next tap validates
        let second = tag.emit_sdm_url().unwrap();
        assert_eq!(validator.validate(&second).unwrap().counter, 2);

        // A tampered CMAC fails closed without touching the counter
        let third = tag.emit_sdm_url().unwrap();
        let tampered = {
            let (head, tail) = third.split_at(third.len() - 2);
            let flipped = if tail.as_bytes()[0] == b'0' { "1" } else { "0" };
            format!("{}{}{}", head, flipped, &tail[1..])
        };
        assert!(matches!(
            validator.validate(&tampered),
            Err(validator::Error::CmacMismatch)
        ));
        assert_eq!(store.get(&tag.uid()).unwrap().last_seen_counter, 2);
        // The untampered original still validates afterwards
        assert_eq!(validator.validate(&third).unwrap().counter, 3);
    }

    #[test]
    fn unknown_tags_fail_closed() {
        let (_dir, store) = store();
        assert!(matches!(
            Validator::new(&store).validate(
                "https://example.com/sdm?uid=04DE5F1EACC040&ctr=000001&cmac=0123456789ABCDEF"
            ),
            Err(validator::Error::UnknownUid(_))
        ));
    }

    #[test]
    fn fused_off_format_is_terminal_and_leaves_no_trace() {
        let (_dir, store) = store();
        let mut tag = MockTag::new();
        tag.disable_format();

        let result = Provisioner::new(&store).format_picc(&mut tag);
        match result {
            Err(Error::Exchange {
                phase: Phase::FormatPicc,
                source: session::Error::Status(StatusWord::IllegalCommand),
            }) => {}
            other => panic!("expected IllegalCommand, got {:?}", other.err()),
        }

        // The record is untouched (never created)
        assert!(store.get(&tag.uid()).is_none());
    }

    #[test]
    fn format_resets_files_and_marks_the_record() {
        let (_dir, store) = store();
        let mut tag = MockTag::new();

        Provisioner::new(&store)
            .provision(&mut tag, TEMPLATE, SdmMode::Cmac)
            .unwrap();
        let uid = Provisioner::new(&store).format_picc(&mut tag).unwrap();
        assert_eq!(uid, tag.uid());

        let record = store.get(&uid).unwrap();
        assert_eq!(record.status, Status::Reformatted);
        assert!(record.url.is_none());
        // Format wipes files, not keys
        assert_eq!(tag.key(0), &record.picc_master_key);
        assert!(tag.ndef_file().iter().all(|&b| b == 0));
    }

    #[test]
    fn auth_failure_aborts_the_transaction_with_the_phase() {
        let dir = tempdir().unwrap();

        // Rotate the tag's keys under one store...
        let mut tag = MockTag::new();
        let store_a = KeyStore::open(dir.path().join("a.csv")).unwrap();
        Provisioner::new(&store_a)
            .provision(&mut tag, TEMPLATE, SdmMode::Cmac)
            .unwrap();

        // ...then try to provision against a store that still assumes
        // factory keys. Session A's authentication fails and the new
        // store records the failure.
        let store_b = KeyStore::open(dir.path().join("b.csv")).unwrap();
        let result = Provisioner::new(&store_b).provision(&mut tag, TEMPLATE, SdmMode::Cmac);

        match result {
            Err(Error::Exchange {
                phase: Phase::SessionAAuth,
                source: session::Error::Status(StatusWord::AuthenticationError),
            }) => {}
            other => panic!("expected Session A auth failure, got {:?}", other.err()),
        }

        let record = store_b.get(&tag.uid()).unwrap();
        assert_eq!(record.status, Status::Failed);
        // The tag still answers to the keys the first store holds
        assert_eq!(tag.key(0), &store_a.get(&tag.uid()).unwrap().picc_master_key);
    }

    #[test]
    fn format_then_reprovision_uses_the_stored_master_key() {
        let (_dir, store) = store();
        let mut tag = MockTag::new();
        let provisioner = Provisioner::new(&store);

        provisioner.provision(&mut tag, TEMPLATE, SdmMode::Cmac).unwrap();
        let first_key0 = store.get(&tag.uid()).unwrap().picc_master_key;

        // Format wipes the files but not the keys; the second run must
        // open Session A with the stored key, not the factory one
        provisioner.format_picc(&mut tag).unwrap();
        provisioner.provision(&mut tag, TEMPLATE, SdmMode::Cmac).unwrap();

        let record = store.get(&tag.uid()).unwrap();
        assert_eq!(record.status, Status::Provisioned);
        assert_ne!(record.picc_master_key, first_key0);
        assert_eq!(tag.key(0), &record.picc_master_key);
        // A fresh key epoch restarts the replay window
        assert_eq!(record.last_seen_counter, 0);
    }

    #[test]
    fn bad_templates_never_touch_tag_or_store() {
        let (_dir, store) = store();
        let mut tag = MockTag::new();

        let result = Provisioner::new(&store).provision(
            &mut tag,
            "https://example.com/sdm?uid=00000000000000&ctr=000000",
            SdmMode::Cmac,
        );
        assert!(matches!(result, Err(Error::Ndef(_))));
        assert!(store.get(&tag.uid()).is_none());
        assert!(tag.key(0).is_factory());
    }
}
