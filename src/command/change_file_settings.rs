//! ChangeFileSettings: rewrite a file's option byte, access rights and
//! SDM configuration

use super::{Command, CommMode, Error};
use crate::ndef::FileSettings;

/// Apply new settings to a file. The payload is built by
/// [`FileSettings::change_payload`](crate::ndef::FileSettings); by the
/// time it is on the wire the NDEF content the SDM offsets point into
/// must already exist.
#[derive(Clone, Debug)]
pub struct ChangeFileSettings {
    /// Target file number (the NDEF file is `0x02`)
    pub file_no: u8,
    /// Encoded settings payload
    pub payload: Vec<u8>,
}

impl ChangeFileSettings {
    /// Build the command from structured settings
    pub fn new(file_no: u8, settings: &FileSettings) -> Result<Self, crate::ndef::Error> {
        Ok(Self {
            file_no,
            payload: settings.change_payload()?,
        })
    }
}

impl Command for ChangeFileSettings {
    type Response = ();

    const INS: u8 = 0x5F;
    const COMM_MODE: CommMode = CommMode::Full;

    fn header(&self) -> Vec<u8> {
        vec![self.file_no]
    }

    fn data(&self) -> Vec<u8> {
        self.payload.clone()
    }

    fn parse_response(_body: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}
