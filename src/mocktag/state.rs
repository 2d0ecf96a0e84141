//! Interior state of the simulated tag: key slots, files, the card side
//! of the EV2 state machine, and per-command handlers.

use crate::{
    apdu::{Apdu, ResponseApdu, StatusWord},
    command::{CommMode, PICC_APPLICATION_AID},
    crypto::{self, kdf, Key, BLOCK_SIZE, MAC_SIZE},
    ndef::{
        AccessCondition, AccessRights, FileSettings, FileSettingsInfo, CC_FILE_ID, NDEF_FILE_ID,
        NDEF_FILE_SIZE,
    },
    session::ZERO_IV,
    uid::Uid,
};
use rand_core::{OsRng, RngCore};
use subtle::ConstantTimeEq;

/// Capability Container content of a factory NTAG424 DNA
const CC_FILE: [u8; 23] = [
    0x00, 0x17, 0x20, 0x01, 0x00, 0x00, 0xFF, 0x04, 0x06, 0xE1, 0x04, 0x01, 0x00, 0x00, 0x00,
    0x05, 0x06, 0xE1, 0x05, 0x00, 0x80, 0x82, 0x83,
];

/// Hardware/software version frames (NXP vendor, NT4H2421Gx shape)
const VERSION_FRAME_HW: [u8; 7] = [0x04, 0x04, 0x02, 0x30, 0x00, 0x11, 0x05];
const VERSION_FRAME_SW: [u8; 7] = [0x04, 0x04, 0x02, 0x01, 0x03, 0x11, 0x05];

/// Card side of the authentication state machine
enum AuthState {
    Idle,
    PendingChallenge {
        key_no: u8,
        rnd_b: [u8; BLOCK_SIZE],
    },
    Active(CardSession),
}

/// Mirror of the host's session state
struct CardSession {
    ti: [u8; 4],
    cmd_ctr: u16,
    enc_key: Key,
    mac_key: Key,
}

pub(super) struct State {
    keys: [Key; 5],
    key_versions: [u8; 5],
    uid: Uid,
    selected_file: Option<u16>,
    ndef_file: Vec<u8>,
    ndef_settings: FileSettings,
    auth: AuthState,
    version_frames: u8,
    format_disabled: bool,
    read_counter: u32,
}

fn reply(data: Vec<u8>, status: StatusWord) -> ResponseApdu {
    let (sw1, sw2) = status.to_bytes();
    ResponseApdu { data, sw1, sw2 }
}

fn status_only(status: StatusWord) -> ResponseApdu {
    reply(Vec::new(), status)
}

fn iso_ok(data: Vec<u8>) -> ResponseApdu {
    ResponseApdu {
        data,
        sw1: 0x90,
        sw2: 0x00,
    }
}

fn factory_ndef_settings() -> FileSettings {
    FileSettings {
        comm_mode: CommMode::Plain,
        access: AccessRights {
            read: AccessCondition::Free,
            write: AccessCondition::Free,
            read_write: AccessCondition::Free,
            change: AccessCondition::Key(0),
        },
        sdm: None,
    }
}

impl State {
    pub(super) fn new(uid: Uid) -> Self {
        Self {
            keys: std::array::from_fn(|_| Key::FACTORY),
            key_versions: [0; 5],
            uid,
            selected_file: None,
            ndef_file: vec![0u8; NDEF_FILE_SIZE],
            ndef_settings: factory_ndef_settings(),
            auth: AuthState::Idle,
            version_frames: 0,
            format_disabled: false,
            read_counter: 0,
        }
    }

    pub(super) fn uid(&self) -> Uid {
        self.uid
    }

    pub(super) fn key(&self, slot: usize) -> &Key {
        &self.keys[slot]
    }

    pub(super) fn ndef_file(&self) -> &[u8] {
        &self.ndef_file
    }

    pub(super) fn ndef_settings(&self) -> &FileSettings {
        &self.ndef_settings
    }

    pub(super) fn read_counter(&self) -> u32 {
        self.read_counter
    }

    pub(super) fn disable_format(&mut self) {
        self.format_disabled = true;
    }

    pub(super) fn set_ndef_comm_mode(&mut self, mode: CommMode) {
        self.ndef_settings.comm_mode = mode;
    }

    pub(super) fn handle(&mut self, apdu: &Apdu) -> ResponseApdu {
        match (apdu.cla, apdu.ins) {
            (0x00, 0xA4) => self.iso_select(apdu),
            (0x00, 0xB0) => self.iso_read_binary(apdu),
            (0x00, 0xD6) => self.iso_update_binary(apdu),
            (0x90, 0x60) => self.get_version_first(),
            (0x90, 0x71) => self.authenticate_first(apdu),
            (0x90, 0xAF) => self.additional_frame(apdu),
            (0x90, ins) => self.native_command(ins, apdu),
            _ => status_only(StatusWord::Other(0x6E, 0x00)),
        }
    }

    // ---- ISO 7816 family -------------------------------------------------

    fn iso_select(&mut self, apdu: &Apdu) -> ResponseApdu {
        match apdu.p1 {
            0x04 => {
                if apdu.data == PICC_APPLICATION_AID {
                    self.selected_file = None;
                    iso_ok(Vec::new())
                } else {
                    status_only(StatusWord::IsoFileNotFound)
                }
            }
            0x00 => {
                let Ok(bytes) = <[u8; 2]>::try_from(apdu.data.as_slice()) else {
                    return status_only(StatusWord::IsoFileNotFound);
                };
                let file_id = u16::from_be_bytes(bytes);
                if file_id == CC_FILE_ID || file_id == NDEF_FILE_ID {
                    self.selected_file = Some(file_id);
                    iso_ok(Vec::new())
                } else {
                    status_only(StatusWord::IsoFileNotFound)
                }
            }
            _ => status_only(StatusWord::IsoFileNotFound),
        }
    }

    fn iso_read_binary(&mut self, apdu: &Apdu) -> ResponseApdu {
        let offset = u16::from_be_bytes([apdu.p1, apdu.p2]) as usize;
        let contents: &[u8] = match self.selected_file {
            Some(CC_FILE_ID) => &CC_FILE,
            Some(NDEF_FILE_ID) => &self.ndef_file,
            _ => return status_only(StatusWord::IsoSecurityStatus),
        };
        if offset > contents.len() {
            return status_only(StatusWord::Other(0x6A, 0x86));
        }

        let requested = match apdu.le.unwrap_or(0) {
            0 => 256,
            n => n as usize,
        };
        let end = contents.len().min(offset + requested);
        iso_ok(contents[offset..end].to_vec())
    }

    fn iso_update_binary(&mut self, apdu: &Apdu) -> ResponseApdu {
        if self.selected_file != Some(NDEF_FILE_ID) {
            return status_only(StatusWord::IsoSecurityStatus);
        }
        if self.ndef_settings.access.write != AccessCondition::Free {
            // Once SDM locks the file down, plain writes are over
            return status_only(StatusWord::IsoSecurityStatus);
        }

        let offset = u16::from_be_bytes([apdu.p1, apdu.p2]) as usize;
        if offset + apdu.data.len() > self.ndef_file.len() {
            return status_only(StatusWord::Other(0x6A, 0x86));
        }
        self.ndef_file[offset..offset + apdu.data.len()].copy_from_slice(&apdu.data);
        iso_ok(Vec::new())
    }

    // ---- GetVersion ------------------------------------------------------

    fn get_version_first(&mut self) -> ResponseApdu {
        self.version_frames = 2;
        reply(VERSION_FRAME_HW.to_vec(), StatusWord::MoreData)
    }

    fn additional_frame(&mut self, apdu: &Apdu) -> ResponseApdu {
        if matches!(self.auth, AuthState::PendingChallenge { .. }) && apdu.data.len() == 32 {
            return self.authenticate_part2(apdu);
        }
        match self.version_frames {
            2 => {
                self.version_frames = 1;
                reply(VERSION_FRAME_SW.to_vec(), StatusWord::MoreData)
            }
            1 => {
                self.version_frames = 0;
                let mut frame = Vec::with_capacity(14);
                frame.extend_from_slice(self.uid.as_bytes());
                frame.extend_from_slice(&[0xBA, 0x14, 0x20, 0x33, 0x91]); // batch
                frame.push(0x49); // fab week (BCD)
                frame.push(0x23); // fab year (BCD)
                reply(frame, StatusWord::Success)
            }
            _ => status_only(StatusWord::Other(0x91, 0xCA)),
        }
    }

    // ---- Authentication --------------------------------------------------

    fn authenticate_first(&mut self, apdu: &Apdu) -> ResponseApdu {
        self.version_frames = 0;
        self.auth = AuthState::Idle;

        let Some(&key_no) = apdu.data.first() else {
            return status_only(StatusWord::LengthError);
        };
        if key_no as usize >= self.keys.len() {
            return status_only(StatusWord::NoSuchKey);
        }

        let mut rnd_b = [0u8; BLOCK_SIZE];
        OsRng.fill_bytes(&mut rnd_b);

        let encrypted = crypto::aes_cbc_encrypt(&self.keys[key_no as usize], &ZERO_IV, &rnd_b);
        self.auth = AuthState::PendingChallenge { key_no, rnd_b };
        reply(encrypted, StatusWord::MoreData)
    }

    fn authenticate_part2(&mut self, apdu: &Apdu) -> ResponseApdu {
        let AuthState::PendingChallenge { key_no, rnd_b } =
            std::mem::replace(&mut self.auth, AuthState::Idle)
        else {
            return status_only(StatusWord::Other(0x91, 0xCA));
        };

        let key = self.keys[key_no as usize].clone();
        let plain = crypto::aes_cbc_decrypt(&key, &ZERO_IV, &apdu.data);
        let rnd_a: [u8; BLOCK_SIZE] = plain[..BLOCK_SIZE].try_into().expect("32-byte input");
        let rnd_b_rotated = crypto::rotate_left_one(&rnd_b);

        if plain[BLOCK_SIZE..].ct_eq(&rnd_b_rotated).unwrap_u8() != 1 {
            return status_only(StatusWord::AuthenticationError);
        }

        let mut ti = [0u8; 4];
        OsRng.fill_bytes(&mut ti);
        let (enc_key, mac_key) = kdf::derive_session_keys(&key, &rnd_a, &rnd_b);

        let mut response = Vec::with_capacity(32);
        response.extend_from_slice(&ti);
        response.extend_from_slice(&crypto::rotate_left_one(&rnd_a));
        response.extend_from_slice(&[0u8; 6]); // PDcap2
        response.extend_from_slice(&[0u8; 6]); // PCDcap2

        self.auth = AuthState::Active(CardSession {
            ti,
            cmd_ctr: 0,
            enc_key,
            mac_key,
        });

        reply(
            crypto::aes_cbc_encrypt(&key, &ZERO_IV, &response),
            StatusWord::Success,
        )
    }

    // ---- Native command family -------------------------------------------

    fn native_command(&mut self, ins: u8, apdu: &Apdu) -> ResponseApdu {
        match ins {
            0x64 => self.get_key_version(apdu),
            0xF5 => self.get_file_settings(apdu),
            0xAD => self.read_data(apdu),
            0x8D => self.write_data(apdu),
            0xC4 => self.change_key(apdu),
            0x5F => self.change_file_settings(apdu),
            0xFC => self.format_picc(apdu),
            _ => status_only(StatusWord::IllegalCommand),
        }
    }

    fn get_key_version(&mut self, apdu: &Apdu) -> ResponseApdu {
        let Some(&key_no) = apdu.data.first() else {
            return status_only(StatusWord::LengthError);
        };
        if key_no as usize >= self.keys.len() {
            return status_only(StatusWord::NoSuchKey);
        }
        let version = self.key_versions[key_no as usize];
        self.respond(CommMode::Plain, vec![version])
    }

    fn get_file_settings(&mut self, apdu: &Apdu) -> ResponseApdu {
        if apdu.data.first() != Some(&0x02) {
            return status_only(StatusWord::FileNotFound);
        }
        let info = FileSettingsInfo {
            file_type: 0x00,
            size: NDEF_FILE_SIZE as u32,
            settings: self.ndef_settings,
        };
        match info.encode() {
            Ok(body) => self.respond(CommMode::Plain, body),
            Err(_) => status_only(StatusWord::Other(0x91, 0xEE)),
        }
    }

    fn read_data(&mut self, apdu: &Apdu) -> ResponseApdu {
        let mode = self.ndef_settings.comm_mode;
        let (header, _data) = match self.unwrap_command(0xAD, 7, mode, &apdu.data) {
            Ok(parts) => parts,
            Err(status) => return status_only(status),
        };

        if header[0] != 0x02 {
            return status_only(StatusWord::FileNotFound);
        }
        let offset = u32::from_le_bytes([header[1], header[2], header[3], 0]) as usize;
        let length = u32::from_le_bytes([header[4], header[5], header[6], 0]) as usize;

        if offset > self.ndef_file.len() {
            return status_only(StatusWord::BoundaryError);
        }
        let end = if length == 0 {
            self.ndef_file.len()
        } else {
            offset + length
        };
        if end > self.ndef_file.len() {
            return status_only(StatusWord::BoundaryError);
        }

        let contents = self.ndef_file[offset..end].to_vec();
        self.respond(mode, contents)
    }

    fn write_data(&mut self, apdu: &Apdu) -> ResponseApdu {
        let mode = self.ndef_settings.comm_mode;
        let (header, data) = match self.unwrap_command(0x8D, 7, mode, &apdu.data) {
            Ok(parts) => parts,
            Err(status) => return status_only(status),
        };

        if header[0] != 0x02 {
            return status_only(StatusWord::FileNotFound);
        }
        let offset = u32::from_le_bytes([header[1], header[2], header[3], 0]) as usize;
        let length = u32::from_le_bytes([header[4], header[5], header[6], 0]) as usize;
        if length != data.len() {
            return status_only(StatusWord::LengthError);
        }
        if offset + data.len() > self.ndef_file.len() {
            return status_only(StatusWord::BoundaryError);
        }

        self.ndef_file[offset..offset + data.len()].copy_from_slice(&data);
        self.respond(mode, Vec::new())
    }

    fn change_key(&mut self, apdu: &Apdu) -> ResponseApdu {
        let (header, plaintext) = match self.unwrap_command(0xC4, 1, CommMode::Full, &apdu.data) {
            Ok(parts) => parts,
            Err(status) => return status_only(status),
        };
        let key_no = header[0];
        if key_no as usize >= self.keys.len() {
            self.auth = AuthState::Idle;
            return status_only(StatusWord::NoSuchKey);
        }

        if key_no == 0 {
            // New key travels bare: the session key already proves the
            // old one
            if plaintext.len() != 17 {
                self.auth = AuthState::Idle;
                return status_only(StatusWord::LengthError);
            }
            let new_key = Key::from_slice(&plaintext[..16]).expect("length checked");
            let response = self.respond(CommMode::Full, Vec::new());
            self.keys[0] = new_key;
            self.key_versions[0] = plaintext[16];
            // ChangeKey on the authenticating slot ends the session
            self.auth = AuthState::Idle;
            response
        } else {
            if plaintext.len() != 21 {
                self.auth = AuthState::Idle;
                return status_only(StatusWord::LengthError);
            }
            let mut new_key = [0u8; 16];
            for (index, byte) in new_key.iter_mut().enumerate() {
                *byte = plaintext[index] ^ self.keys[key_no as usize].as_bytes()[index];
            }
            if crypto::crc32jam(&new_key).ct_eq(&plaintext[17..21]).unwrap_u8() != 1 {
                self.auth = AuthState::Idle;
                return status_only(StatusWord::IntegrityError);
            }
            self.keys[key_no as usize] = Key::from_bytes(new_key);
            self.key_versions[key_no as usize] = plaintext[16];
            self.respond(CommMode::Full, Vec::new())
        }
    }

    fn change_file_settings(&mut self, apdu: &Apdu) -> ResponseApdu {
        let (header, plaintext) = match self.unwrap_command(0x5F, 1, CommMode::Full, &apdu.data) {
            Ok(parts) => parts,
            Err(status) => return status_only(status),
        };
        if header[0] != 0x02 {
            self.auth = AuthState::Idle;
            return status_only(StatusWord::FileNotFound);
        }

        let Ok(settings) = FileSettings::decode_change_payload(&plaintext) else {
            self.auth = AuthState::Idle;
            return status_only(StatusWord::ParameterError);
        };

        if let Some(sdm) = &settings.sdm {
            // SDM offsets name positions inside existing content; a file
            // of zeros means the NDEF write was skipped or mis-ordered
            let content_len = u16::from_be_bytes([self.ndef_file[0], self.ndef_file[1]]);
            if content_len == 0 {
                self.auth = AuthState::Idle;
                return status_only(StatusWord::ParameterError);
            }
            let in_bounds = [
                sdm.uid_offset,
                sdm.ctr_offset,
                sdm.mac_input_offset,
                sdm.mac_offset,
            ]
            .into_iter()
            .flatten()
            .all(|offset| (offset as usize) < self.ndef_file.len());
            if !in_bounds {
                self.auth = AuthState::Idle;
                return status_only(StatusWord::ParameterError);
            }
        }

        self.ndef_settings = settings;
        self.respond(CommMode::Full, Vec::new())
    }

    fn format_picc(&mut self, apdu: &Apdu) -> ResponseApdu {
        if let Err(status) = self.unwrap_command(0xFC, 0, CommMode::Full, &apdu.data) {
            return status_only(status);
        }
        if self.format_disabled {
            self.auth = AuthState::Idle;
            return status_only(StatusWord::IllegalCommand);
        }

        self.ndef_file = vec![0u8; NDEF_FILE_SIZE];
        self.ndef_settings = factory_ndef_settings();
        self.read_counter = 0;
        self.respond(CommMode::Full, Vec::new())
    }

    // ---- Card-side secure messaging --------------------------------------

    /// Split and authenticate an incoming command body per the mode,
    /// returning `(header, plaintext data)`
    fn unwrap_command(
        &mut self,
        ins: u8,
        header_len: usize,
        mode: CommMode,
        body: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), StatusWord> {
        match mode {
            CommMode::Plain => {
                if body.len() < header_len {
                    return Err(StatusWord::LengthError);
                }
                let (header, data) = body.split_at(header_len);
                Ok((header.to_vec(), data.to_vec()))
            }
            CommMode::Mac | CommMode::Full => {
                let AuthState::Active(session) = &self.auth else {
                    return Err(StatusWord::PermissionDenied);
                };
                if body.len() < header_len + MAC_SIZE {
                    return Err(StatusWord::LengthError);
                }

                let (rest, tag) = body.split_at(body.len() - MAC_SIZE);
                let (header, payload) = rest.split_at(header_len);

                let mut mac_input = Vec::with_capacity(7 + rest.len());
                mac_input.push(ins);
                mac_input.extend_from_slice(&session.cmd_ctr.to_le_bytes());
                mac_input.extend_from_slice(&session.ti);
                mac_input.extend_from_slice(header);
                mac_input.extend_from_slice(payload);
                let expected = crypto::cmac_trunc(&session.mac_key, &mac_input);

                if expected.ct_eq(tag).unwrap_u8() != 1 {
                    self.auth = AuthState::Idle;
                    return Err(StatusWord::IntegrityError);
                }

                if mode == CommMode::Full && !payload.is_empty() {
                    if payload.len() % BLOCK_SIZE != 0 {
                        self.auth = AuthState::Idle;
                        return Err(StatusWord::IntegrityError);
                    }
                    let iv = kdf::command_iv(&session.enc_key, &session.ti, session.cmd_ctr);
                    let padded = crypto::aes_cbc_decrypt(&session.enc_key, &iv, payload);
                    let Some(plain) = crypto::iso9797_m2_unpad(&padded) else {
                        self.auth = AuthState::Idle;
                        return Err(StatusWord::IntegrityError);
                    };
                    Ok((header.to_vec(), plain.to_vec()))
                } else {
                    Ok((header.to_vec(), payload.to_vec()))
                }
            }
        }
    }

    /// Build a success response per the mode and advance the card-side
    /// counter
    fn respond(&mut self, mode: CommMode, data: Vec<u8>) -> ResponseApdu {
        match (&mut self.auth, mode) {
            (AuthState::Active(session), CommMode::Plain) => {
                session.cmd_ctr += 1;
                reply(data, StatusWord::Success)
            }
            (AuthState::Idle | AuthState::PendingChallenge { .. }, CommMode::Plain) => {
                reply(data, StatusWord::Success)
            }
            (AuthState::Active(session), CommMode::Mac | CommMode::Full) => {
                let next_ctr = session.cmd_ctr + 1;
                let out = if mode == CommMode::Full && !data.is_empty() {
                    let iv = kdf::response_iv(&session.enc_key, &session.ti, next_ctr);
                    crypto::aes_cbc_encrypt(&session.enc_key, &iv, &crypto::iso9797_m2_pad(&data))
                } else {
                    data
                };

                let mut mac_input = Vec::with_capacity(7 + out.len());
                mac_input.push(0x00); // SW2 of a success
                mac_input.extend_from_slice(&next_ctr.to_le_bytes());
                mac_input.extend_from_slice(&session.ti);
                mac_input.extend_from_slice(&out);
                let tag = crypto::cmac_trunc(&session.mac_key, &mac_input);

                session.cmd_ctr = next_ctr;
                let mut body = out;
                body.extend_from_slice(&tag);
                reply(body, StatusWord::Success)
            }
            _ => status_only(StatusWord::PermissionDenied),
        }
    }

    // ---- SDM read simulation ---------------------------------------------

    /// Simulate a phone tapping the tag: bump the read counter, patch
    /// the mirrors into the file content and return the resulting URL.
    pub(super) fn emit_sdm_url(&mut self) -> Option<String> {
        let sdm = self.ndef_settings.sdm?;
        self.read_counter += 1;

        let content_len = u16::from_be_bytes([self.ndef_file[0], self.ndef_file[1]]) as usize + 2;
        // Strip NDEF framing and the terminator TLV
        let mut tail = self.ndef_file[9..content_len - 1].to_vec();

        let splice = |tail: &mut [u8], offset: u32, text: &str| {
            let start = offset as usize - 9;
            tail[start..start + text.len()].copy_from_slice(text.as_bytes());
        };

        if let Some(offset) = sdm.uid_offset {
            splice(&mut tail, offset, &self.uid.to_hex());
        }
        if let Some(offset) = sdm.ctr_offset {
            splice(&mut tail, offset, &format!("{:06X}", self.read_counter));
        }
        if let (Some(input_offset), Some(mac_offset)) = (sdm.mac_input_offset, sdm.mac_offset) {
            let AccessCondition::Key(slot) = sdm.access.file_read else {
                return None;
            };
            let session_key = kdf::derive_sdm_file_read_mac_key(
                &self.keys[slot as usize],
                &self.uid,
                self.read_counter,
            );
            let span = &tail[input_offset as usize - 9..mac_offset as usize - 9];
            let mac = crypto::cmac_trunc(&session_key, span);
            splice(&mut tail, mac_offset, &hex::encode_upper(mac));
        }

        Some(format!(
            "https://{}",
            String::from_utf8(tail).expect("NDEF content is ASCII")
        ))
    }
}
