//! Software simulation of an NTAG424 DNA, implemented as a
//! [`Transport`].
//!
//! Implements the subset of the chip this engine drives: the EV2
//! handshake and counter discipline, key rotation with XOR/CRC
//! verification, the NDEF and CC files, SDM enablement checks and
//! (optionally disabled) FormatPICC. Access control is only partially
//! enforced; it exists to exercise the host stack, and testing against
//! real tags is still recommended.
//!
//! Available to downstream test suites behind the `mocktag` cargo
//! feature; always compiled for this crate's own tests.

mod state;

use self::state::State;
use crate::{
    apdu::{Apdu, ResponseApdu},
    command::CommMode,
    crypto::Key,
    ndef::FileSettings,
    transport::{self, Transport},
    uid::Uid,
};

/// Default UID the simulator ships with
const DEFAULT_UID: [u8; 7] = [0x04, 0x51, 0x2E, 0x8A, 0x2C, 0x5B, 0x80];

/// A simulated factory-fresh NTAG424 DNA
pub struct MockTag {
    state: State,
}

impl MockTag {
    /// Create a tag with the default UID, factory keys and empty files
    pub fn new() -> Self {
        Self::with_uid(Uid::from_bytes(DEFAULT_UID))
    }

    /// Create a tag with a specific UID
    pub fn with_uid(uid: Uid) -> Self {
        Self {
            state: State::new(uid),
        }
    }

    /// The tag's UID
    pub fn uid(&self) -> Uid {
        self.state.uid()
    }

    /// Simulate a production batch with FormatPICC fused off: the
    /// command answers `0x911C` forever
    pub fn disable_format(&mut self) {
        self.state.disable_format();
    }

    /// Force the NDEF file's CommMode (to exercise Full-mode
    /// ReadData/WriteData paths)
    pub fn set_ndef_comm_mode(&mut self, mode: CommMode) {
        self.state.set_ndef_comm_mode(mode);
    }

    /// Inspect a key slot
    pub fn key(&self, slot: usize) -> &Key {
        self.state.key(slot)
    }

    /// Inspect the raw NDEF file
    pub fn ndef_file(&self) -> &[u8] {
        self.state.ndef_file()
    }

    /// Inspect the NDEF file's current settings
    pub fn ndef_settings(&self) -> &FileSettings {
        self.state.ndef_settings()
    }

    /// The tag-side SDM read counter
    pub fn read_counter(&self) -> u32 {
        self.state.read_counter()
    }

    /// Simulate a phone tapping the tag: advance the read counter and
    /// return the URL with mirrors patched in. `None` until SDM is
    /// enabled.
    pub fn emit_sdm_url(&mut self) -> Option<String> {
        self.state.emit_sdm_url()
    }
}

impl Default for MockTag {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTag {
    fn transmit(&mut self, apdu: &Apdu) -> Result<ResponseApdu, transport::Error> {
        Ok(self.state.handle(apdu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{
        read_version, send_plain, IsoReadBinary, IsoSelectFile, SelectPiccApplication,
    };
    use crate::ndef::CC_FILE_ID;

    #[test]
    fn reports_its_uid_through_get_version() {
        let mut tag = MockTag::new();
        send_plain(&mut tag, &SelectPiccApplication).unwrap();
        let version = read_version(&mut tag).unwrap();
        assert_eq!(version.uid, tag.uid());
        assert_eq!(version.hardware.vendor_id, 0x04);
    }

    #[test]
    fn cc_file_is_factory_content() {
        let mut tag = MockTag::new();
        send_plain(&mut tag, &SelectPiccApplication).unwrap();
        send_plain(&mut tag, &IsoSelectFile { file_id: CC_FILE_ID }).unwrap();
        let cc = send_plain(
            &mut tag,
            &IsoReadBinary {
                offset: 0,
                length: 23,
            },
        )
        .unwrap();
        assert_eq!(cc[..2], [0x00, 0x17]);
        // E1 04 with free read access is what Android keys on
        assert_eq!(cc[9..11], [0xE1, 0x04]);
    }

    #[test]
    fn no_sdm_url_before_provisioning() {
        let mut tag = MockTag::new();
        assert!(tag.emit_sdm_url().is_none());
        assert_eq!(tag.read_counter(), 0);
    }
}
