//! GetFileSettings: read back a file's option byte, access rights, size
//! and SDM configuration

use super::{Command, Error};
use crate::ndef::FileSettingsInfo;

/// Query the settings of a file
#[derive(Clone, Debug)]
pub struct GetFileSettings {
    /// File number to query
    pub file_no: u8,
}

impl Command for GetFileSettings {
    type Response = FileSettingsInfo;

    const INS: u8 = 0xF5;

    fn header(&self) -> Vec<u8> {
        vec![self.file_no]
    }

    fn parse_response(body: &[u8]) -> Result<FileSettingsInfo, Error> {
        FileSettingsInfo::parse(body).map_err(|_| Error::ResponseFormat {
            ins: Self::INS,
            len: body.len(),
            reason: "bad file settings block",
        })
    }
}
