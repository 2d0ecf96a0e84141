//! GetKeyVersion: read the version byte of a key slot

use super::{Command, Error};

/// Read the version of the key in `key_no`
#[derive(Clone, Debug)]
pub struct GetKeyVersion {
    /// Key slot to query (0–4)
    pub key_no: u8,
}

impl Command for GetKeyVersion {
    type Response = u8;

    const INS: u8 = 0x64;

    fn header(&self) -> Vec<u8> {
        vec![self.key_no]
    }

    fn parse_response(body: &[u8]) -> Result<u8, Error> {
        match body {
            [version] => Ok(*version),
            _ => Err(Error::ResponseFormat {
                ins: Self::INS,
                len: body.len(),
                reason: "expected a single version byte",
            }),
        }
    }
}
