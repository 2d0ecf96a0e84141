//! WriteData: write into a standard data file through the native
//! command set.
//!
//! A single WriteData never exceeds one chunk of the session engine's
//! chunker; large payloads become a series of these, each with its own
//! offset, CMAC and counter tick.

use super::{Command, CommMode, Error};

/// Write `data` at `offset` into file `file_no`. The CommMode follows
/// the file's configured mode.
#[derive(Clone, Debug)]
pub struct WriteData {
    /// File number
    pub file_no: u8,
    /// Byte offset into the file
    pub offset: u32,
    /// Bytes to write
    pub data: Vec<u8>,
    /// The file's CommMode
    pub mode: CommMode,
}

impl Command for WriteData {
    type Response = ();

    const INS: u8 = 0x8D;

    fn comm_mode(&self) -> CommMode {
        self.mode
    }

    fn header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(7);
        header.push(self.file_no);
        header.extend_from_slice(&self.offset.to_le_bytes()[..3]);
        header.extend_from_slice(&(self.data.len() as u32).to_le_bytes()[..3]);
        header
    }

    fn data(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn parse_response(_body: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}
