//! ISO 7816-4 file commands: SelectFile, ReadBinary, UpdateBinary.
//!
//! These run with `CLA = 0x00` and are never wrapped in secure
//! messaging: the NDEF file is written through them while its Write
//! access is still FREE, before SDM is enabled.

use super::{Command, Error};
use crate::apdu::CLA_ISO;

/// ISO SelectFile by two-byte file identifier (`0xE103` CC, `0xE104` NDEF)
#[derive(Clone, Debug)]
pub struct IsoSelectFile {
    /// File identifier
    pub file_id: u16,
}

impl Command for IsoSelectFile {
    type Response = ();

    const INS: u8 = 0xA4;
    const CLA: u8 = CLA_ISO;

    fn params(&self) -> (u8, u8) {
        // P1 = select EF under current DF, P2 = no FCI
        (0x00, 0x0C)
    }

    fn data(&self) -> Vec<u8> {
        self.file_id.to_be_bytes().to_vec()
    }

    fn le(&self) -> Option<u8> {
        None
    }

    fn parse_response(_body: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

/// ISO ReadBinary from the selected file
#[derive(Clone, Debug)]
pub struct IsoReadBinary {
    /// Byte offset into the file (fits P1/P2)
    pub offset: u16,
    /// Number of bytes to read; `0` means "up to 256"
    pub length: u8,
}

impl Command for IsoReadBinary {
    type Response = Vec<u8>;

    const INS: u8 = 0xB0;
    const CLA: u8 = CLA_ISO;

    fn params(&self) -> (u8, u8) {
        let offset = self.offset.to_be_bytes();
        (offset[0], offset[1])
    }

    fn le(&self) -> Option<u8> {
        Some(self.length)
    }

    fn parse_response(body: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(body.to_vec())
    }
}

/// ISO UpdateBinary into the selected file
#[derive(Clone, Debug)]
pub struct IsoUpdateBinary {
    /// Byte offset into the file (fits P1/P2)
    pub offset: u16,
    /// Bytes to write at the offset
    pub data: Vec<u8>,
}

impl Command for IsoUpdateBinary {
    type Response = ();

    const INS: u8 = 0xD6;
    const CLA: u8 = CLA_ISO;

    fn params(&self) -> (u8, u8) {
        let offset = self.offset.to_be_bytes();
        (offset[0], offset[1])
    }

    fn data(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn le(&self) -> Option<u8> {
        None
    }

    fn parse_response(_body: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}
