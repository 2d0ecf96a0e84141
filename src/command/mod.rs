//! The NTAG424 command catalog.
//!
//! One value type per tag command. Each declares its instruction byte,
//! class family and CommMode, and knows how to render its plain header
//! and data fields and how to parse its response body. Wire assembly
//! (encryption, CMAC, counter bookkeeping) belongs to the session
//! engine; a command never sees the secure-messaging layer.

mod authenticate;
mod change_file_settings;
mod change_key;
mod error;
mod format_picc;
mod get_file_settings;
mod get_key_version;
mod get_version;
mod iso;
mod read_data;
mod select_application;
mod write_data;

pub use self::{
    authenticate::{AuthenticateEv2First, AuthenticateEv2Part2},
    change_file_settings::ChangeFileSettings,
    change_key::ChangeKey,
    error::Error,
    format_picc::FormatPicc,
    get_file_settings::GetFileSettings,
    get_key_version::GetKeyVersion,
    get_version::{read_version, AdditionalFrame, ComponentVersion, GetVersion, VersionInfo},
    iso::{IsoReadBinary, IsoSelectFile, IsoUpdateBinary},
    read_data::ReadData,
    select_application::{SelectPiccApplication, PICC_APPLICATION_AID},
    write_data::WriteData,
};

use crate::{
    apdu::{Apdu, CLA_NATIVE},
    transport::{self, Transport},
};

/// How a command is wrapped on the wire once a session is open
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommMode {
    /// No cryptographic wrapping. The command counter still advances
    /// while a session is active.
    Plain,

    /// Plain data followed by an 8-byte truncated CMAC
    Mac,

    /// Data is ISO 9797-1 M2 padded, CBC-encrypted and CMAC'd
    Full,
}

/// A command in the catalog
pub trait Command {
    /// Parsed response type
    type Response;

    /// Instruction byte
    const INS: u8;

    /// Class byte; `0x90` for the native family, `0x00` for ISO 7816
    const CLA: u8 = CLA_NATIVE;

    /// CommMode this command declares. Commands whose mode follows the
    /// target file override [`Command::comm_mode`] instead.
    const COMM_MODE: CommMode = CommMode::Plain;

    /// Effective CommMode for this instance
    fn comm_mode(&self) -> CommMode {
        Self::COMM_MODE
    }

    /// P1/P2 parameter bytes
    fn params(&self) -> (u8, u8) {
        (0x00, 0x00)
    }

    /// Command header: plain on the wire, but covered by the CMAC in
    /// MAC and Full modes
    fn header(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Command data: the part that is encrypted in Full mode
    fn data(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Trailing Le byte, if any. Native commands always send `Le = 0x00`.
    fn le(&self) -> Option<u8> {
        Some(0x00)
    }

    /// Does a successful execution invalidate the session on the tag?
    /// (`ChangeKey` targeting slot 0 does.)
    fn invalidates_session(&self) -> bool {
        false
    }

    /// Parse a response body. In MAC/Full modes the session engine hands
    /// over the body with the CMAC verified, stripped and (for Full)
    /// decrypted.
    fn parse_response(body: &[u8]) -> Result<Self::Response, Error>;
}

/// Render a command as an unwrapped APDU. This is the only encoding
/// plain (unauthenticated) traffic ever gets; it is also the Plain-mode
/// path inside a session.
pub(crate) fn plain_apdu<C: Command>(command: &C) -> Apdu {
    let (p1, p2) = command.params();
    let mut body = command.header();
    body.extend_from_slice(&command.data());
    Apdu::new(C::CLA, C::INS, p1, p2, body, command.le())
}

/// Send a Plain-mode command outside any session and parse its response.
///
/// Commands declaring any other CommMode are refused here: only a
/// [`Session`](crate::session::Session) may wrap them.
pub fn send_plain<T, C>(transport: &mut T, command: &C) -> Result<C::Response, Error>
where
    T: Transport + ?Sized,
    C: Command,
{
    if command.comm_mode() != CommMode::Plain {
        return Err(Error::SessionRequired { ins: C::INS });
    }

    let response = transport::exchange(transport, &plain_apdu(command))?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Status(status));
    }

    C::parse_response(&response.data)
}
