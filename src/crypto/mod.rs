//! AES-128 primitives shared by the secure-messaging engine, the
//! provisioning commands and the SDM validator.
//!
//! Everything in here is pure: key material goes in, bytes come out. The
//! session-vector derivations live in [`kdf`].

pub(crate) mod kdf;

use aes::{
    cipher::{
        block_padding::NoPadding, generic_array::GenericArray, BlockDecryptMut, BlockEncrypt,
        BlockEncryptMut, KeyInit, KeyIvInit,
    },
    Aes128,
};
use cmac::{Cmac, Mac};
use rand_core::{OsRng, RngCore};
use std::fmt::{self, Debug};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Size of an AES-128 block in bytes
pub const BLOCK_SIZE: usize = 16;

/// Size of an AES-128 key in bytes. The NTAG424 DNA only carries 128-bit
/// keys; there is no other size to support.
pub const KEY_SIZE: usize = 16;

/// Length of a truncated CMAC tag
pub const MAC_SIZE: usize = 8;

/// An AES-128 key (one of the five PICC key slots, or a derived session
/// key). Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// The all-zero key every NTAG424 DNA ships with in all five slots
    pub const FACTORY: Key = Key([0u8; KEY_SIZE]);

    /// Generate a random key from the platform CSPRNG
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Key(bytes)
    }

    /// Create a key from a byte array
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }

    /// Create a key from a slice, returning `None` unless it is exactly
    /// 16 bytes
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_SIZE] = slice.try_into().ok()?;
        Some(Key(bytes))
    }

    /// Borrow the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Is this the factory-default (all-zero) key?
    pub fn is_factory(&self) -> bool {
        bool::from(self.0.ct_eq(&[0u8; KEY_SIZE]))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for Key {}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Avoid leaking secrets in debug messages
        write!(f, "Key(...)")
    }
}

/// AES-128-ECB encryption of a single block. Used for per-command IV
/// construction only.
pub(crate) fn aes_ecb_encrypt(key: &Key, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let cipher = Aes128::new(key.as_bytes().into());
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// AES-128-CBC encryption. Input must already be block-aligned; CBC
/// itself never pads.
pub(crate) fn aes_cbc_encrypt(key: &Key, iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Vec<u8> {
    assert_eq!(data.len() % BLOCK_SIZE, 0, "CBC input must be block-aligned");

    let mut buf = data.to_vec();
    let len = buf.len();
    Aes128CbcEnc::new(key.as_bytes().into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .expect("block-aligned input");
    buf
}

/// AES-128-CBC decryption of block-aligned input
pub(crate) fn aes_cbc_decrypt(key: &Key, iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Vec<u8> {
    assert_eq!(data.len() % BLOCK_SIZE, 0, "CBC input must be block-aligned");

    let mut buf = data.to_vec();
    Aes128CbcDec::new(key.as_bytes().into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .expect("block-aligned input");
    buf
}

/// Full 16-byte AES-CMAC (NIST SP 800-38B) over a message
pub fn cmac(key: &Key, message: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes()).expect("16-byte key");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Truncate a full CMAC to the 8-byte tag the tag transmits.
///
/// The NTAG424 keeps the bytes at odd zero-based indices, i.e. every
/// second byte starting from index 1. Taking the first eight bytes
/// instead is the classic interop mistake with this chip family.
pub fn truncate_mac(full: &[u8; BLOCK_SIZE]) -> [u8; MAC_SIZE] {
    [
        full[1], full[3], full[5], full[7], full[9], full[11], full[13], full[15],
    ]
}

/// Truncated CMAC over a message in one step
pub fn cmac_trunc(key: &Key, message: &[u8]) -> [u8; MAC_SIZE] {
    truncate_mac(&cmac(key, message))
}

/// ISO/IEC 9797-1 padding method 2: append `0x80`, then zeros up to the
/// next block boundary. A non-empty input that is already block-aligned
/// grows by one whole block.
pub fn iso9797_m2_pad(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.push(0x80);
    while padded.len() % BLOCK_SIZE != 0 {
        padded.push(0x00);
    }
    padded
}

/// Strip ISO/IEC 9797-1 method-2 padding, or `None` if the trailer is
/// not a valid `80 00..00` sequence.
pub(crate) fn iso9797_m2_unpad(data: &[u8]) -> Option<&[u8]> {
    let end = data.iter().rposition(|&b| b != 0x00)?;
    if data[end] != 0x80 {
        return None;
    }
    Some(&data[..end])
}

/// Rotate a 16-byte block left by one byte (the `RndA'`/`RndB'` step of
/// the mutual authentication handshake)
pub(crate) fn rotate_left_one(block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut out = [0u8; BLOCK_SIZE];
    out[..BLOCK_SIZE - 1].copy_from_slice(&block[1..]);
    out[BLOCK_SIZE - 1] = block[0];
    out
}

/// CRC-32/JAMCRC over a buffer, serialized little-endian.
///
/// JAMCRC is the IEEE CRC-32 without the final complement; it is what the
/// ChangeKey data block carries over the new key. None of our crypto
/// dependencies ship a CRC, so this is the bitwise form.
pub(crate) fn crc32jam(data: &[u8]) -> [u8; 4] {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn truncation_keeps_odd_indexed_bytes() {
        let full = hex!("7A1B2C3D4E5F60718293A4B5C6D7E8F9");
        assert_eq!(truncate_mac(&full), hex!("1B3D5F7193B5D7F9"));
    }

    #[test]
    fn padding_always_terminates_on_a_block_boundary() {
        for len in 1..64 {
            let data = vec![0xAB; len];
            let padded = iso9797_m2_pad(&data);
            assert_eq!(padded.len() % BLOCK_SIZE, 0);
            assert!(!padded.is_empty());
            assert_eq!(&padded[..len], &data[..]);
            assert_eq!(padded[len], 0x80);
            assert!(padded[len + 1..].iter().all(|&b| b == 0x00));
            assert_eq!(iso9797_m2_unpad(&padded), Some(&data[..]));
        }
    }

    #[test]
    fn aligned_input_gains_a_whole_extra_block() {
        let data = hex!("0102030405060708090A0B0C0D0E0F10");
        let padded = iso9797_m2_pad(&data);
        assert_eq!(padded.len(), 32);
        assert_eq!(&padded[..16], &data[..]);
        assert_eq!(padded[16], 0x80);
        assert!(padded[17..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn unpad_rejects_missing_marker() {
        assert_eq!(iso9797_m2_unpad(&[0x00; 16]), None);
        assert_eq!(iso9797_m2_unpad(&hex!("0102030405060708090A0B0C0D0E0F10")), None);
    }

    #[test]
    fn rotation_moves_the_first_byte_last() {
        let block = hex!("000102030405060708090A0B0C0D0E0F");
        assert_eq!(
            rotate_left_one(&block),
            hex!("0102030405060708090A0B0C0D0E0F00")
        );
    }

    #[test]
    fn cbc_round_trips() {
        let key = Key::from_bytes(hex!("000102030405060708090A0B0C0D0E0F"));
        let iv = hex!("101112131415161718191A1B1C1D1E1F");
        let plaintext = hex!("00112233445566778899AABBCCDDEEFF00112233445566778899AABBCCDDEEFF");

        let ciphertext = aes_cbc_encrypt(&key, &iv, &plaintext);
        assert_ne!(&ciphertext[..], &plaintext[..]);
        assert_eq!(aes_cbc_decrypt(&key, &iv, &ciphertext), &plaintext[..]);
    }

    #[test]
    fn cmac_matches_nist_aes128_vector() {
        // NIST SP 800-38B example 2 (AES-128, 16-byte message)
        let key = Key::from_bytes(hex!("2B7E151628AED2A6ABF7158809CF4F3C"));
        let message = hex!("6BC1BEE22E409F96E93D7E117393172A");
        assert_eq!(cmac(&key, &message), hex!("070A16B46B4D4144F79BDD9DD04A287C"));
    }

    #[test]
    fn jamcrc_is_uninverted_ieee() {
        // CRC-32/JAMCRC("123456789") = 0x340BC6D9
        assert_eq!(crc32jam(b"123456789"), 0x340B_C6D9u32.to_le_bytes());
    }

    #[test]
    fn factory_key_is_all_zeros() {
        assert!(Key::FACTORY.is_factory());
        assert!(!Key::from_bytes(hex!("000102030405060708090A0B0C0D0E0F")).is_factory());
    }
}
