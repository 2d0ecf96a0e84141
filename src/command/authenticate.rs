//! The two halves of the EV2 mutual-authentication handshake.
//!
//! Both are Plain by definition: no padding and no CMAC exist until the
//! handshake has produced session keys. The session engine drives these
//! directly and owns all cryptogram handling; the command types only
//! frame bytes.

use super::{Command, Error};

/// `AuthenticateEV2First`: opens the handshake for a key slot. The tag
/// answers `0x91AF` with the encrypted `RndB` challenge.
#[derive(Clone, Debug)]
pub struct AuthenticateEv2First {
    /// Key slot to authenticate (0–4)
    pub key_no: u8,
}

impl Command for AuthenticateEv2First {
    type Response = [u8; 16];

    const INS: u8 = 0x71;

    fn data(&self) -> Vec<u8> {
        // key number followed by an empty PCDcap2 length
        vec![self.key_no, 0x00]
    }

    fn parse_response(body: &[u8]) -> Result<[u8; 16], Error> {
        body.try_into().map_err(|_| Error::ResponseFormat {
            ins: Self::INS,
            len: body.len(),
            reason: "expected 16-byte encrypted RndB",
        })
    }
}

/// Second half of the handshake, carried in an AdditionalFrame: the
/// host's `E(Kx, RndA || RndB')` cryptogram. The tag answers with
/// `E(Kx, Ti || RndA' || PDcap2 || PCDcap2)`.
#[derive(Clone, Debug)]
pub struct AuthenticateEv2Part2 {
    /// 32-byte encrypted `RndA || RndB'`
    pub cryptogram: Vec<u8>,
}

impl Command for AuthenticateEv2Part2 {
    type Response = [u8; 32];

    const INS: u8 = 0xAF;

    fn data(&self) -> Vec<u8> {
        self.cryptogram.clone()
    }

    fn parse_response(body: &[u8]) -> Result<[u8; 32], Error> {
        body.try_into().map_err(|_| Error::ResponseFormat {
            ins: Self::INS,
            len: body.len(),
            reason: "expected 32-byte Ti/RndA' cryptogram",
        })
    }
}
