//! The EV2 secure channel: handshake, per-command wrapping and response
//! verification.
//!
//! AES-128-CBC under counter-derived IVs for confidentiality, truncated
//! AES-CMAC for authenticity. The command counter is the heart of the
//! discipline: the command direction MACs with the current value, the
//! response direction with the incremented one, and the increment
//! commits only after the response MAC verifies.

use super::{Error, ZERO_IV};
use crate::{
    apdu::{Apdu, ResponseApdu, StatusWord, CLA_ISO},
    command::{plain_apdu, AuthenticateEv2First, AuthenticateEv2Part2, Command, CommMode},
    crypto::{
        self,
        kdf::{self, derive_session_keys},
        Key, BLOCK_SIZE, MAC_SIZE,
    },
    transport::{self, Transport},
};
use log::debug;
use rand_core::{OsRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

/// Channel protocol state
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChannelState {
    /// Handshake complete, counter discipline running
    Active,
    /// Closed by error, explicit close or `ChangeKey(0)`
    Terminated,
}

/// Authenticated-session state: `Ti`, the command counter and the two
/// session keys. Keys are zeroized on termination and on drop.
pub(crate) struct SecureChannel {
    ti: [u8; 4],
    cmd_ctr: u16,
    key_no: u8,
    enc_key: Key,
    mac_key: Key,
    state: ChannelState,
}

impl SecureChannel {
    /// Run the two-phase AuthenticateEV2First handshake over a plain
    /// transport and derive the session keys.
    pub(crate) fn open<T: Transport + ?Sized>(
        transport: &mut T,
        key_no: u8,
        key: &Key,
    ) -> Result<Self, Error> {
        // Part 1: the tag answers 0x91AF with E(Kx, RndB)
        let first = AuthenticateEv2First { key_no };
        let response = transport::exchange(transport, &plain_apdu(&first))?;
        match response.status() {
            StatusWord::MoreData => {}
            other => return Err(Error::Status(other)),
        }
        let enc_rnd_b = AuthenticateEv2First::parse_response(&response.data)?;

        let rnd_b: Zeroizing<[u8; BLOCK_SIZE]> = Zeroizing::new(
            crypto::aes_cbc_decrypt(key, &ZERO_IV, &enc_rnd_b)
                .try_into()
                .expect("one block in, one block out"),
        );

        let mut rnd_a = Zeroizing::new([0u8; BLOCK_SIZE]);
        OsRng.fill_bytes(rnd_a.as_mut());

        // Part 2: E(Kx, RndA || RndB'), no padding, 32 bytes exactly
        let mut part2 = Zeroizing::new([0u8; 2 * BLOCK_SIZE]);
        part2[..BLOCK_SIZE].copy_from_slice(rnd_a.as_ref());
        part2[BLOCK_SIZE..].copy_from_slice(&crypto::rotate_left_one(&rnd_b));

        let second = AuthenticateEv2Part2 {
            cryptogram: crypto::aes_cbc_encrypt(key, &ZERO_IV, part2.as_ref()),
        };
        let response = transport::exchange(transport, &plain_apdu(&second))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(status));
        }
        let cryptogram = AuthenticateEv2Part2::parse_response(&response.data)?;

        // Ti(4) || RndA'(16) || PDcap2(6) || PCDcap2(6)
        let plain = Zeroizing::new(crypto::aes_cbc_decrypt(key, &ZERO_IV, &cryptogram));
        let ti: [u8; 4] = plain[..4].try_into().expect("length checked");
        let rnd_a_rotated = crypto::rotate_left_one(&rnd_a);

        if plain[4..20].ct_eq(&rnd_a_rotated).unwrap_u8() != 1 {
            return Err(Error::AuthenticationFailed);
        }

        let (enc_key, mac_key) = derive_session_keys(key, &rnd_a, &rnd_b);
        debug!("session open: key_no={} ti={}", key_no, hex::encode(ti));

        Ok(Self {
            ti,
            cmd_ctr: 0,
            key_no,
            enc_key,
            mac_key,
            state: ChannelState::Active,
        })
    }

    /// Key slot that authenticated this session
    pub(crate) fn key_no(&self) -> u8 {
        self.key_no
    }

    /// Current command counter
    pub(crate) fn cmd_ctr(&self) -> u16 {
        self.cmd_ctr
    }

    /// Is the channel still usable?
    pub(crate) fn is_active(&self) -> bool {
        self.state == ChannelState::Active
    }

    /// Assemble the wire APDU for a command under its CommMode, using
    /// the current counter value
    pub(crate) fn wrap<C: Command>(&mut self, command: &C) -> Result<Apdu, Error> {
        if !self.is_active() {
            return Err(Error::SessionClosed);
        }
        if C::CLA == CLA_ISO {
            // A CMAC on a CLA=0x00 command draws 0x6A87 and desyncs the
            // counter; ISO traffic stays outside the session entirely.
            return Err(Error::IsoCommandInSession { ins: C::INS });
        }
        if self.cmd_ctr == u16::MAX {
            self.terminate();
            return Err(Error::CounterExhausted);
        }

        let header = command.header();
        let data = command.data();
        let (p1, p2) = command.params();

        let body = match command.comm_mode() {
            CommMode::Plain => {
                let mut body = header;
                body.extend_from_slice(&data);
                body
            }
            CommMode::Mac => {
                let tag = self.command_mac(C::INS, &header, &data);
                let mut body = header;
                body.extend_from_slice(&data);
                body.extend_from_slice(&tag);
                body
            }
            CommMode::Full => {
                let encrypted = if data.is_empty() {
                    Vec::new()
                } else {
                    let iv = kdf::command_iv(&self.enc_key, &self.ti, self.cmd_ctr);
                    crypto::aes_cbc_encrypt(&self.enc_key, &iv, &crypto::iso9797_m2_pad(&data))
                };
                let tag = self.command_mac(C::INS, &header, &encrypted);
                let mut body = header;
                body.extend_from_slice(&encrypted);
                body.extend_from_slice(&tag);
                body
            }
        };

        Ok(Apdu::new(C::CLA, C::INS, p1, p2, body, command.le()))
    }

    /// Verify and unwrap a response under the command's CommMode,
    /// committing the counter increment on success.
    ///
    /// Any failure (bad status, bad MAC, bad padding) terminates the
    /// channel: once a response cannot be authenticated the counter can
    /// no longer be trusted.
    pub(crate) fn unwrap(
        &mut self,
        mode: CommMode,
        response: ResponseApdu,
    ) -> Result<Vec<u8>, Error> {
        if !self.is_active() {
            return Err(Error::SessionClosed);
        }

        let status = response.status();
        if !status.is_success() {
            self.terminate();
            return Err(Error::Status(status));
        }

        // The response direction MACs with the incremented counter
        let next_ctr = self.cmd_ctr + 1;

        match mode {
            CommMode::Plain => {
                self.cmd_ctr = next_ctr;
                Ok(response.data)
            }
            CommMode::Mac | CommMode::Full => {
                if response.data.len() < MAC_SIZE {
                    self.terminate();
                    return Err(Error::ResponseMac);
                }
                let (body, tag) = response.data.split_at(response.data.len() - MAC_SIZE);

                let mut mac_input = Vec::with_capacity(7 + body.len());
                mac_input.push(response.sw2);
                mac_input.extend_from_slice(&next_ctr.to_le_bytes());
                mac_input.extend_from_slice(&self.ti);
                mac_input.extend_from_slice(body);
                let expected = crypto::cmac_trunc(&self.mac_key, &mac_input);

                if expected.ct_eq(tag).unwrap_u8() != 1 {
                    self.terminate();
                    return Err(Error::ResponseMac);
                }

                let plaintext = if mode == CommMode::Full && !body.is_empty() {
                    if body.len() % BLOCK_SIZE != 0 {
                        self.terminate();
                        return Err(Error::ResponsePadding);
                    }
                    let iv = kdf::response_iv(&self.enc_key, &self.ti, next_ctr);
                    let padded = crypto::aes_cbc_decrypt(&self.enc_key, &iv, body);
                    match crypto::iso9797_m2_unpad(&padded) {
                        Some(plain) => plain.to_vec(),
                        None => {
                            self.terminate();
                            return Err(Error::ResponsePadding);
                        }
                    }
                } else {
                    body.to_vec()
                };

                self.cmd_ctr = next_ctr;
                Ok(plaintext)
            }
        }
    }

    /// CMAC input for the command direction:
    /// `INS || CmdCtr_LE || Ti || header || data`
    fn command_mac(&self, ins: u8, header: &[u8], data: &[u8]) -> [u8; MAC_SIZE] {
        let mut input = Vec::with_capacity(7 + header.len() + data.len());
        input.push(ins);
        input.extend_from_slice(&self.cmd_ctr.to_le_bytes());
        input.extend_from_slice(&self.ti);
        input.extend_from_slice(header);
        input.extend_from_slice(data);
        crypto::cmac_trunc(&self.mac_key, &input)
    }

    /// Drop the session keys and refuse further use
    pub(crate) fn terminate(&mut self) {
        self.state = ChannelState::Terminated;
        self.enc_key.zeroize();
        self.mac_key.zeroize();
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}
