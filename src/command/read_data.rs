//! ReadData: read from a standard data file through the native command
//! set

use super::{Command, CommMode, Error};

/// Read `length` bytes at `offset` from file `file_no`. The CommMode
/// follows the file's configured mode, so it is carried per-instance.
#[derive(Clone, Debug)]
pub struct ReadData {
    /// File number
    pub file_no: u8,
    /// Byte offset into the file
    pub offset: u32,
    /// Number of bytes to read; `0` reads to the end of the file
    pub length: u32,
    /// The file's CommMode
    pub mode: CommMode,
}

impl Command for ReadData {
    type Response = Vec<u8>;

    const INS: u8 = 0xAD;

    fn comm_mode(&self) -> CommMode {
        self.mode
    }

    fn header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(7);
        header.push(self.file_no);
        header.extend_from_slice(&self.offset.to_le_bytes()[..3]);
        header.extend_from_slice(&self.length.to_le_bytes()[..3]);
        header
    }

    fn parse_response(body: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(body.to_vec())
    }
}
