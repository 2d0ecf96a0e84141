//! Session-vector derivations for EV2 secure messaging and SDM.
//!
//! The NIST SP 800-108 counter-mode KDF collapses to a single CMAC here:
//! every derived key is `CMAC(K, SV)` over a fixed 32-byte (EV2) or
//! 16-byte (SDM) session vector, per NXP AN12196.

use super::{aes_ecb_encrypt, cmac, Key, BLOCK_SIZE};
use crate::uid::Uid;

/// Label bytes opening SV1 (session encryption key)
const SV1_LABEL: [u8; 2] = [0xA5, 0x5A];

/// Label bytes opening SV2 (session MAC key)
const SV2_LABEL: [u8; 2] = [0x5A, 0xA5];

/// Label bytes opening the SDM file-read MAC session vector
const SDM_MAC_LABEL: [u8; 2] = [0x3C, 0xC3];

/// Derive the EV2 session keys from the authentication key and the two
/// handshake randoms. Returns `(SesAuthENCKey, SesAuthMACKey)`.
pub(crate) fn derive_session_keys(
    key: &Key,
    rnd_a: &[u8; BLOCK_SIZE],
    rnd_b: &[u8; BLOCK_SIZE],
) -> (Key, Key) {
    let enc = Key::from_bytes(cmac(key, &session_vector(SV1_LABEL, rnd_a, rnd_b)));
    let mac = Key::from_bytes(cmac(key, &session_vector(SV2_LABEL, rnd_a, rnd_b)));
    (enc, mac)
}

/// Assemble one 32-byte EV2 session vector.
///
/// After the six fixed bytes comes the 26-byte context:
/// `RndA[15..14] || (RndA[13..8] XOR RndB[15..10]) || RndB[9..0] || RndA[7..0]`,
/// where the bracketed ranges are NXP's MSB-first bit-numbering, i.e.
/// `RndA[15..14]` is the first two bytes of the array.
fn session_vector(label: [u8; 2], rnd_a: &[u8; BLOCK_SIZE], rnd_b: &[u8; BLOCK_SIZE]) -> [u8; 32] {
    let mut sv = [0u8; 32];
    sv[0] = label[0];
    sv[1] = label[1];
    // counter 0x0001, separation 0x00, length 0x0080 bits
    sv[2] = 0x00;
    sv[3] = 0x01;
    sv[4] = 0x00;
    sv[5] = 0x80;

    sv[6..8].copy_from_slice(&rnd_a[0..2]);
    for i in 0..6 {
        sv[8 + i] = rnd_a[2 + i] ^ rnd_b[i];
    }
    sv[14..24].copy_from_slice(&rnd_b[6..16]);
    sv[24..32].copy_from_slice(&rnd_a[8..16]);
    sv
}

/// Derive `SesSDMFileReadMACKey` for one `(UID, read counter)` pair.
///
/// The SDM session vector is exactly one AES block:
/// `3C C3 00 01 00 80 || UID(7) || SDMReadCtr(3, LE)`.
pub(crate) fn derive_sdm_file_read_mac_key(sdm_mac_key: &Key, uid: &Uid, counter: u32) -> Key {
    let ctr = counter.to_le_bytes();

    let mut sv = [0u8; BLOCK_SIZE];
    sv[0] = SDM_MAC_LABEL[0];
    sv[1] = SDM_MAC_LABEL[1];
    sv[2] = 0x00;
    sv[3] = 0x01;
    sv[4] = 0x00;
    sv[5] = 0x80;
    sv[6..13].copy_from_slice(uid.as_bytes());
    sv[13..16].copy_from_slice(&ctr[..3]);

    Key::from_bytes(cmac(sdm_mac_key, &sv))
}

/// Per-command CBC IV: `E(SesAuthENCKey, A5 5A || Ti || CmdCtr_LE || 00*8)`
pub(crate) fn command_iv(ses_enc_key: &Key, ti: &[u8; 4], cmd_ctr: u16) -> [u8; BLOCK_SIZE] {
    iv_block(ses_enc_key, [0xA5, 0x5A], ti, cmd_ctr)
}

/// Per-response CBC IV: `E(SesAuthENCKey, 5A A5 || Ti || CmdCtr_LE || 00*8)`
pub(crate) fn response_iv(ses_enc_key: &Key, ti: &[u8; 4], cmd_ctr: u16) -> [u8; BLOCK_SIZE] {
    iv_block(ses_enc_key, [0x5A, 0xA5], ti, cmd_ctr)
}

fn iv_block(ses_enc_key: &Key, label: [u8; 2], ti: &[u8; 4], cmd_ctr: u16) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = label[0];
    block[1] = label[1];
    block[2..6].copy_from_slice(ti);
    block[6..8].copy_from_slice(&cmd_ctr.to_le_bytes());
    aes_ecb_encrypt(ses_enc_key, &block)
}
