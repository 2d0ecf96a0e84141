//! File option, access-rights and SDM settings encoding.
//!
//! The same layout travels in both directions: `ChangeFileSettings`
//! sends `FileOption || AccessRights || [SDM block]`, and
//! `GetFileSettings` returns it with a file-type byte and the file size
//! spliced in. Encode and decode live together here so they cannot
//! drift apart.

use super::{Error, SdmOffsets};
use crate::command::CommMode;
use bitflags::bitflags;

/// FileOption bit marking SDM as enabled
const FILE_OPTION_SDM: u8 = 0x40;

/// One nibble of the access-rights words
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessCondition {
    /// Requires authentication with the given key slot (0–4)
    Key(u8),
    /// `0xE`: free access, no authentication
    Free,
    /// `0xF`: never
    Never,
}

impl AccessCondition {
    pub(crate) fn nibble(self) -> u8 {
        match self {
            AccessCondition::Key(slot) => slot,
            AccessCondition::Free => 0xE,
            AccessCondition::Never => 0xF,
        }
    }

    pub(crate) fn from_nibble(nibble: u8) -> Result<Self, Error> {
        match nibble {
            0x0..=0x4 => Ok(AccessCondition::Key(nibble)),
            0xE => Ok(AccessCondition::Free),
            0xF => Ok(AccessCondition::Never),
            _ => Err(Error::RfuAccessValue { nibble }),
        }
    }
}

/// The four access rights of a standard data file, nibble-packed on the
/// wire as `[ReadWrite | Change] [Read | Write]`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AccessRights {
    /// Plain read access
    pub read: AccessCondition,
    /// Plain write access
    pub write: AccessCondition,
    /// Combined read/write access
    pub read_write: AccessCondition,
    /// Who may change these settings
    pub change: AccessCondition,
}

impl AccessRights {
    pub(crate) fn encode(&self) -> [u8; 2] {
        [
            self.read_write.nibble() << 4 | self.change.nibble(),
            self.read.nibble() << 4 | self.write.nibble(),
        ]
    }

    pub(crate) fn decode(bytes: [u8; 2]) -> Result<Self, Error> {
        Ok(Self {
            read_write: AccessCondition::from_nibble(bytes[0] >> 4)?,
            change: AccessCondition::from_nibble(bytes[0] & 0x0F)?,
            read: AccessCondition::from_nibble(bytes[1] >> 4)?,
            write: AccessCondition::from_nibble(bytes[1] & 0x0F)?,
        })
    }
}

bitflags! {
    /// SDM option bits
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SdmOptions: u8 {
        /// Mirror the UID into the file at read time
        const UID_MIRROR = 0x80;
        /// Mirror the read counter
        const READ_COUNTER = 0x40;
        /// Enforce a read-counter limit
        const READ_COUNTER_LIMIT = 0x20;
        /// Encrypt part of the file data per read
        const ENC_FILE_DATA = 0x10;
        /// Mirror values as ASCII hex (the only encoding this engine
        /// writes)
        const ASCII_ENCODING = 0x01;
    }
}

/// SDM access rights, nibble-packed as `[RFU | CtrRet] [MetaRead | FileRead]`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SdmAccessRights {
    /// Who may retrieve the read counter over the wire
    pub ctr_ret: AccessCondition,
    /// Meta-read: `Free` mirrors UID/counter in the clear, a key slot
    /// means encrypted PICC data, `Never` disables the mirrors
    pub meta_read: AccessCondition,
    /// File-read: the key slot driving the CMAC mirror, or `Never` to
    /// disable it. `0xE` is RFU here and the tag rejects it.
    pub file_read: AccessCondition,
}

impl SdmAccessRights {
    pub(crate) fn encode(&self) -> Result<[u8; 2], Error> {
        if self.file_read == AccessCondition::Free {
            // SDMFileRead has no "free" meaning; 0xE is RFU on the tag
            return Err(Error::RfuAccessValue { nibble: 0xE });
        }
        Ok([
            0xF0 | self.ctr_ret.nibble(),
            self.meta_read.nibble() << 4 | self.file_read.nibble(),
        ])
    }

    pub(crate) fn decode(bytes: [u8; 2]) -> Result<Self, Error> {
        let file_read = AccessCondition::from_nibble(bytes[1] & 0x0F)?;
        if file_read == AccessCondition::Free {
            return Err(Error::RfuAccessValue { nibble: 0xE });
        }
        Ok(Self {
            ctr_ret: AccessCondition::from_nibble(bytes[0] & 0x0F)?,
            meta_read: AccessCondition::from_nibble(bytes[1] >> 4)?,
            file_read,
        })
    }

    /// Is the CMAC mirror active?
    pub fn mac_mirror_enabled(&self) -> bool {
        matches!(self.file_read, AccessCondition::Key(_))
    }
}

/// The SDM tail of a file-settings payload
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SdmSettings {
    /// Option bits
    pub options: SdmOptions,
    /// SDM access rights
    pub access: SdmAccessRights,
    /// UID mirror offset (present iff `UID_MIRROR`)
    pub uid_offset: Option<u32>,
    /// Read-counter mirror offset (present iff `READ_COUNTER`)
    pub ctr_offset: Option<u32>,
    /// MAC input offset (present iff the CMAC mirror is active)
    pub mac_input_offset: Option<u32>,
    /// CMAC mirror offset (present iff the CMAC mirror is active)
    pub mac_offset: Option<u32>,
}

impl SdmSettings {
    /// Assemble SDM settings from computed mirror offsets.
    ///
    /// `file_read` picks between the two provisioning modes: a key slot
    /// enables the CMAC mirror (reading the file then requires
    /// authentication, which Android's background dispatcher cannot do),
    /// `Never` leaves the file freely readable with UID and counter
    /// mirrors only.
    pub fn for_offsets(offsets: &SdmOffsets, file_read: AccessCondition) -> Result<Self, Error> {
        let access = SdmAccessRights {
            ctr_ret: AccessCondition::Free,
            meta_read: AccessCondition::Free,
            file_read,
        };
        // Validate the nibble early; 0xE would otherwise surface as a
        // 0x919E only once the tag sees it.
        access.encode()?;

        let mac_mirror = access.mac_mirror_enabled();
        Ok(Self {
            options: SdmOptions::UID_MIRROR | SdmOptions::READ_COUNTER | SdmOptions::ASCII_ENCODING,
            access,
            uid_offset: Some(offsets.uid),
            ctr_offset: Some(offsets.ctr),
            mac_input_offset: mac_mirror.then_some(offsets.mac_input),
            mac_offset: mac_mirror.then_some(offsets.mac),
        })
    }
}

/// Settings of one standard data file
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileSettings {
    /// CommMode of ReadData/WriteData against this file
    pub comm_mode: CommMode,
    /// Plain access rights
    pub access: AccessRights,
    /// SDM configuration, if enabled
    pub sdm: Option<SdmSettings>,
}

impl FileSettings {
    /// Encode the `ChangeFileSettings` payload:
    /// `FileOption || AccessRights || [SDMOptions || SDMAccessRights || offsets...]`
    pub fn change_payload(&self) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::with_capacity(17);
        payload.push(self.file_option());
        payload.extend_from_slice(&self.access.encode());

        if let Some(sdm) = &self.sdm {
            payload.push(sdm.options.bits());
            payload.extend_from_slice(&sdm.access.encode()?);
            for offset in [
                sdm.uid_offset,
                sdm.ctr_offset,
                sdm.mac_input_offset,
                sdm.mac_offset,
            ]
            .into_iter()
            .flatten()
            {
                payload.extend_from_slice(&offset.to_le_bytes()[..3]);
            }
        }
        Ok(payload)
    }

    /// Decode a `ChangeFileSettings` payload (the tag side of the wire;
    /// also what `GetFileSettings` returns minus type and size)
    pub fn decode_change_payload(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader(bytes);
        let file_option = reader.byte()?;
        let access = AccessRights::decode([reader.byte()?, reader.byte()?])?;

        let comm_mode = match file_option & 0x03 {
            0x01 => CommMode::Mac,
            0x03 => CommMode::Full,
            _ => CommMode::Plain,
        };

        let sdm = if file_option & FILE_OPTION_SDM != 0 {
            let options = SdmOptions::from_bits_retain(reader.byte()?);
            let sdm_access = SdmAccessRights::decode([reader.byte()?, reader.byte()?])?;
            let mac_mirror = sdm_access.mac_mirror_enabled();

            let uid_offset = options
                .contains(SdmOptions::UID_MIRROR)
                .then(|| reader.offset())
                .transpose()?;
            let ctr_offset = options
                .contains(SdmOptions::READ_COUNTER)
                .then(|| reader.offset())
                .transpose()?;
            let mac_input_offset = mac_mirror.then(|| reader.offset()).transpose()?;
            let mac_offset = mac_mirror.then(|| reader.offset()).transpose()?;

            Some(SdmSettings {
                options,
                access: sdm_access,
                uid_offset,
                ctr_offset,
                mac_input_offset,
                mac_offset,
            })
        } else {
            None
        };

        Ok(Self {
            comm_mode,
            access,
            sdm,
        })
    }

    fn file_option(&self) -> u8 {
        let comm = match self.comm_mode {
            CommMode::Plain => 0x00,
            CommMode::Mac => 0x01,
            CommMode::Full => 0x03,
        };
        if self.sdm.is_some() {
            FILE_OPTION_SDM | comm
        } else {
            comm
        }
    }
}

/// File settings as returned by `GetFileSettings`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileSettingsInfo {
    /// File type byte (`0x00` = standard data file)
    pub file_type: u8,
    /// File size in bytes
    pub size: u32,
    /// The settings proper
    pub settings: FileSettings,
}

impl FileSettingsInfo {
    /// Parse a `GetFileSettings` response body:
    /// `FileType || FileOption || AccessRights || FileSize(3 LE) || [SDM block]`
    pub(crate) fn parse(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 7 {
            return Err(Error::Truncated);
        }
        let file_type = body[0];
        let size = u32::from_le_bytes([body[4], body[5], body[6], 0]);

        let mut stripped = Vec::with_capacity(body.len() - 4);
        stripped.extend_from_slice(&body[1..4]);
        stripped.extend_from_slice(&body[7..]);
        let settings = FileSettings::decode_change_payload(&stripped)?;

        Ok(Self {
            file_type,
            size,
            settings,
        })
    }

    /// Encode a `GetFileSettings` response body (the tag side)
    pub(crate) fn encode(&self) -> Result<Vec<u8>, Error> {
        let payload = self.settings.change_payload()?;
        let mut body = Vec::with_capacity(payload.len() + 4);
        body.push(self.file_type);
        body.push(payload[0]);
        body.extend_from_slice(&payload[1..3]);
        body.extend_from_slice(&self.size.to_le_bytes()[..3]);
        body.extend_from_slice(&payload[3..]);
        Ok(body)
    }
}

struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn byte(&mut self) -> Result<u8, Error> {
        let (&first, rest) = self.0.split_first().ok_or(Error::Truncated)?;
        self.0 = rest;
        Ok(first)
    }

    fn offset(&mut self) -> Result<u32, Error> {
        if self.0.len() < 3 {
            return Err(Error::Truncated);
        }
        let (head, rest) = self.0.split_at(3);
        self.0 = rest;
        Ok(u32::from_le_bytes([head[0], head[1], head[2], 0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_offsets() -> SdmOffsets {
        SdmOffsets {
            uid: 39,
            ctr: 59,
            mac: 75,
            mac_input: 39,
        }
    }

    fn provisioned_settings(file_read: AccessCondition) -> FileSettings {
        FileSettings {
            comm_mode: CommMode::Plain,
            access: AccessRights {
                read: AccessCondition::Free,
                write: AccessCondition::Key(0),
                read_write: AccessCondition::Key(0),
                change: AccessCondition::Key(0),
            },
            sdm: Some(SdmSettings::for_offsets(&sample_offsets(), file_read).unwrap()),
        }
    }

    #[test]
    fn cmac_mode_payload_carries_all_four_offsets() {
        let payload = provisioned_settings(AccessCondition::Key(3))
            .change_payload()
            .unwrap();

        assert_eq!(payload[0], 0x40); // SDM enabled, CommMode plain
        assert_eq!(payload[1], 0x00); // RW = key 0, change = key 0
        assert_eq!(payload[2], 0xE0); // read free, write key 0
        assert_eq!(payload[3], 0xC1); // UID + counter mirrors, ASCII
        assert_eq!(payload[4], 0xFE); // RFU | ctr-ret free
        assert_eq!(payload[5], 0xE3); // meta-read free, file-read key 3
        assert_eq!(&payload[6..9], &[39, 0, 0]);
        assert_eq!(&payload[9..12], &[59, 0, 0]);
        assert_eq!(&payload[12..15], &[39, 0, 0]);
        assert_eq!(&payload[15..18], &[75, 0, 0]);
        assert_eq!(payload.len(), 18);
    }

    #[test]
    fn android_compat_payload_omits_mac_offsets() {
        let payload = provisioned_settings(AccessCondition::Never)
            .change_payload()
            .unwrap();

        assert_eq!(payload[5], 0xEF); // meta-read free, file-read never
        assert_eq!(payload.len(), 12); // UID and CTR offsets only
    }

    #[test]
    fn sdm_file_read_free_is_rejected() {
        assert!(matches!(
            SdmSettings::for_offsets(&sample_offsets(), AccessCondition::Free),
            Err(Error::RfuAccessValue { nibble: 0xE })
        ));
    }

    #[test]
    fn change_payload_round_trips() {
        for file_read in [AccessCondition::Key(3), AccessCondition::Never] {
            let settings = provisioned_settings(file_read);
            let payload = settings.change_payload().unwrap();
            assert_eq!(
                FileSettings::decode_change_payload(&payload).unwrap(),
                settings
            );
        }
    }

    #[test]
    fn get_response_round_trips() {
        let info = FileSettingsInfo {
            file_type: 0x00,
            size: 256,
            settings: provisioned_settings(AccessCondition::Key(3)),
        };
        let body = info.encode().unwrap();
        assert_eq!(FileSettingsInfo::parse(&body).unwrap(), info);
    }
}
