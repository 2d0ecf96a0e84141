//! Authenticated sessions with an NTAG424 DNA.
//!
//! A [`Session`] is the only way to run commands whose CommMode is MAC
//! or Full: it owns the secure channel (Ti, counter, session keys),
//! borrows the transport exclusively, and tears everything down on any
//! error. Plain unauthenticated traffic goes through
//! [`command::send_plain`](crate::command::send_plain) instead.
//!
//! While a session is open, route *all* native commands through it
//! (even Plain-mode ones) so the host and tag command counters stay in
//! lockstep.

mod error;
mod securechannel;

pub use self::error::Error;
pub(crate) use self::securechannel::SecureChannel;

use crate::{
    command::{Command, CommMode, WriteData},
    crypto::{Key, BLOCK_SIZE},
    transport::{self, Transport},
};
use log::debug;

/// The zero IV used by the handshake and every CMAC
pub(crate) const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Largest WriteData/UpdateBinary payload per chunk. The ACR122U tops
/// out around 52 data bytes once secure-messaging overhead is added;
/// 48 keeps whole AES blocks in play.
pub const MAX_CHUNK_SIZE: usize = 48;

/// An open authenticated session.
///
/// Created by [`Session::open`], destroyed by [`Session::close`], drop
/// or the first error. Session keys are zeroized on every exit path.
pub struct Session<'t, T: Transport + ?Sized> {
    transport: &'t mut T,
    channel: SecureChannel,
}

impl<'t, T: Transport + ?Sized> Session<'t, T> {
    /// Authenticate `key_no` with `key` and open a session.
    ///
    /// Runs AuthenticateEV2First and its AdditionalFrame reply, verifies
    /// the tag's `RndA'` echo, derives the session keys and zeroes the
    /// command counter. On any mismatch no session exists.
    pub fn open(transport: &'t mut T, key_no: u8, key: &Key) -> Result<Self, Error> {
        let channel = SecureChannel::open(transport, key_no, key)?;
        Ok(Self { transport, channel })
    }

    /// Key slot this session authenticated with
    pub fn key_no(&self) -> u8 {
        self.channel.key_no()
    }

    /// Current command counter (diagnostics and tests)
    pub fn cmd_ctr(&self) -> u16 {
        self.channel.cmd_ctr()
    }

    /// Is the session still usable?
    pub fn is_open(&self) -> bool {
        self.channel.is_active()
    }

    /// Run one command through the session.
    ///
    /// Wraps per the command's CommMode, transmits, verifies the
    /// response MAC against the incremented counter, commits the
    /// increment (exactly once per round-trip, data or no data) and
    /// parses the body. A command that invalidates the session on the
    /// tag (`ChangeKey(0)`) closes it here too.
    pub fn send<C: Command>(&mut self, command: &C) -> Result<C::Response, Error> {
        let mode = command.comm_mode();
        let apdu = self.channel.wrap(command)?;

        let response = match transport::exchange(self.transport, &apdu) {
            Ok(response) => response,
            Err(e) => {
                // The tag may or may not have seen the command; the
                // counter is unknowable, so the session is dead.
                self.channel.terminate();
                return Err(e.into());
            }
        };

        let body = self.channel.unwrap(mode, response)?;
        let parsed = C::parse_response(&body)?;

        if command.invalidates_session() {
            debug!("command 0x{:02X} invalidated the session", C::INS);
            self.channel.terminate();
        }
        Ok(parsed)
    }

    /// Write `data` into a file, splitting into chunks of at most
    /// [`MAX_CHUNK_SIZE`] bytes.
    ///
    /// Each chunk is a complete WriteData command with its own offset,
    /// its own CMAC and its own counter tick, not ISO 7816 command
    /// chaining, which the reader path cannot carry.
    pub fn write_data(
        &mut self,
        file_no: u8,
        offset: u32,
        data: &[u8],
        mode: CommMode,
    ) -> Result<(), Error> {
        for (index, chunk) in data.chunks(MAX_CHUNK_SIZE).enumerate() {
            let chunk_offset = offset + (index * MAX_CHUNK_SIZE) as u32;
            self.send(&WriteData {
                file_no,
                offset: chunk_offset,
                data: chunk.to_vec(),
                mode,
            })?;
        }
        Ok(())
    }

    /// Close the session, zeroizing its keys. Dropping the session does
    /// the same; this form just names the intent.
    pub fn close(mut self) {
        self.channel.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apdu::StatusWord,
        command::{ChangeKey, GetFileSettings, GetKeyVersion, ReadData},
        mocktag::MockTag,
    };

    #[test]
    fn open_and_count_every_round_trip_once() {
        let mut tag = MockTag::new();
        let mut session = Session::open(&mut tag, 0, &Key::FACTORY).unwrap();
        assert!(session.is_open());
        assert_eq!(session.cmd_ctr(), 0);

        // Plain-mode commands tick the counter too
        let version = session.send(&GetKeyVersion { key_no: 0 }).unwrap();
        assert_eq!(version, 0);
        assert_eq!(session.cmd_ctr(), 1);

        session.send(&GetFileSettings { file_no: 0x02 }).unwrap();
        assert_eq!(session.cmd_ctr(), 2);
    }

    #[test]
    fn wrong_key_does_not_open_a_session() {
        let mut tag = MockTag::new();
        let wrong = Key::from_bytes([0xAB; 16]);
        match Session::open(&mut tag, 0, &wrong) {
            Err(Error::Status(StatusWord::AuthenticationError)) => {}
            other => panic!("expected authentication error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn change_key0_closes_the_session_on_success() {
        let mut tag = MockTag::new();
        let new_key = Key::from_bytes([0x42; 16]);

        let mut session = Session::open(&mut tag, 0, &Key::FACTORY).unwrap();
        session
            .send(&ChangeKey {
                key_no: 0,
                new_key: new_key.clone(),
                old_key: Key::FACTORY,
                key_version: 0,
            })
            .unwrap();

        assert!(!session.is_open());
        assert!(matches!(
            session.send(&GetKeyVersion { key_no: 0 }),
            Err(Error::SessionClosed)
        ));
        assert_eq!(tag.key(0), &new_key);

        // The rotated key opens the next session
        Session::open(&mut tag, 0, &new_key).unwrap();
    }

    #[test]
    fn error_status_tears_the_session_down() {
        let mut tag = MockTag::new();
        let mut session = Session::open(&mut tag, 0, &Key::FACTORY).unwrap();

        let result = session.send(&ChangeKey {
            key_no: 7, // no such slot
            new_key: Key::from_bytes([0x01; 16]),
            old_key: Key::FACTORY,
            key_version: 0,
        });
        assert!(matches!(
            result,
            Err(Error::Status(StatusWord::NoSuchKey))
        ));

        assert!(!session.is_open());
        assert!(matches!(
            session.send(&GetKeyVersion { key_no: 0 }),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn chunked_write_round_trips_through_full_mode() {
        let mut tag = MockTag::new();
        tag.set_ndef_comm_mode(CommMode::Full);

        let payload: Vec<u8> = (0..182u32).map(|i| (i % 251) as u8).collect();
        let expected_chunks = (payload.len() + MAX_CHUNK_SIZE - 1) / MAX_CHUNK_SIZE;
        assert!(expected_chunks >= 3);

        let mut session = Session::open(&mut tag, 0, &Key::FACTORY).unwrap();
        session.write_data(0x02, 0, &payload, CommMode::Full).unwrap();

        // One counter tick per chunk: every chunk was its own command
        assert_eq!(session.cmd_ctr() as usize, expected_chunks);

        let readback = session
            .send(&ReadData {
                file_no: 0x02,
                offset: 0,
                length: payload.len() as u32,
                mode: CommMode::Full,
            })
            .unwrap();
        assert_eq!(readback, payload);
        drop(session);

        assert_eq!(&tag.ndef_file()[..payload.len()], &payload[..]);
    }

    #[test]
    fn iso_commands_are_refused_inside_a_session() {
        let mut tag = MockTag::new();
        let mut session = Session::open(&mut tag, 0, &Key::FACTORY).unwrap();
        let result = session.send(&crate::command::IsoSelectFile { file_id: 0xE104 });
        assert!(matches!(
            result,
            Err(Error::IsoCommandInSession { ins: 0xA4 })
        ));
    }
}
