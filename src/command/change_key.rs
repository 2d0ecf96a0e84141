//! ChangeKey: rotate one of the five application key slots.
//!
//! The data block layout is the fixed one from the NXP application
//! notes. For slot 0 the tag already knows which key authenticated, so
//! the new key travels without the XOR mask and without a CRC; for
//! slots 1–4 the new key is XORed with the old one and a CRC32 (JAMCRC)
//! of the new key proves the host knew both. The generic Full-mode
//! pipeline applies the ISO 9797-1 M2 padding, which lands the `0x80`
//! marker at byte 17 (slot 0) or byte 21 (slots 1–4) of the 32-byte
//! plaintext, which is exactly the layout the tag checks.

use super::{Command, CommMode, Error};
use crate::crypto::{self, Key};

/// Rotate the key in `key_no` to `new_key`
#[derive(Clone, Debug)]
pub struct ChangeKey {
    /// Target key slot (0–4)
    pub key_no: u8,
    /// Key to install
    pub new_key: Key,
    /// Key currently in the slot. Ignored for slot 0: the session key
    /// already proves knowledge of it.
    pub old_key: Key,
    /// Version byte stored alongside the new key
    pub key_version: u8,
}

impl Command for ChangeKey {
    type Response = ();

    const INS: u8 = 0xC4;
    const COMM_MODE: CommMode = CommMode::Full;

    fn header(&self) -> Vec<u8> {
        vec![self.key_no]
    }

    fn data(&self) -> Vec<u8> {
        if self.key_no == 0 {
            let mut data = Vec::with_capacity(17);
            data.extend_from_slice(self.new_key.as_bytes());
            data.push(self.key_version);
            data
        } else {
            let mut data = Vec::with_capacity(21);
            for (new, old) in self.new_key.as_bytes().iter().zip(self.old_key.as_bytes()) {
                data.push(new ^ old);
            }
            data.push(self.key_version);
            data.extend_from_slice(&crypto::crc32jam(self.new_key.as_bytes()));
            data
        }
    }

    fn invalidates_session(&self) -> bool {
        // Changing the key that carries the session kills it on the tag;
        // the host must mirror that.
        self.key_no == 0
    }

    fn parse_response(_body: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::iso9797_m2_pad;
    use hex_literal::hex;

    #[test]
    fn slot0_block_pads_to_the_mandated_layout() {
        let cmd = ChangeKey {
            key_no: 0,
            new_key: Key::from_bytes(hex!("000102030405060708090A0B0C0D0E0F")),
            old_key: Key::FACTORY,
            key_version: 0x00,
        };

        let padded = iso9797_m2_pad(&cmd.data());
        assert_eq!(padded.len(), 32);
        assert_eq!(&padded[..16], &hex!("000102030405060708090A0B0C0D0E0F"));
        assert_eq!(padded[16], 0x00);
        assert_eq!(padded[17], 0x80);
        assert!(padded[18..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn app_slot_block_xors_and_checksums() {
        let new_key = Key::from_bytes(hex!("FFEEDDCCBBAA99887766554433221100"));
        let old_key = Key::from_bytes(hex!("0F0E0D0C0B0A09080706050403020100"));
        let cmd = ChangeKey {
            key_no: 1,
            new_key: new_key.clone(),
            old_key: old_key.clone(),
            key_version: 0x01,
        };

        let data = cmd.data();
        assert_eq!(data.len(), 21);
        for i in 0..16 {
            assert_eq!(data[i], new_key.as_bytes()[i] ^ old_key.as_bytes()[i]);
        }
        assert_eq!(data[16], 0x01);
        assert_eq!(&data[17..21], &crypto::crc32jam(new_key.as_bytes()));

        let padded = iso9797_m2_pad(&data);
        assert_eq!(padded.len(), 32);
        assert_eq!(padded[21], 0x80);
        assert!(padded[22..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn only_slot0_invalidates_the_session() {
        let template = ChangeKey {
            key_no: 0,
            new_key: Key::FACTORY,
            old_key: Key::FACTORY,
            key_version: 0,
        };
        assert!(template.invalidates_session());
        assert!(!ChangeKey {
            key_no: 3,
            ..template
        }
        .invalidates_session());
    }
}
