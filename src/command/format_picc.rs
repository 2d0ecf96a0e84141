//! FormatPICC: wipe file contents back to delivery state.
//!
//! Full CommMode with an empty header and empty data; the wire body is
//! the 8-byte CMAC alone. Some production batches ship with this command
//! permanently fused off; those answer `0x911C` and nothing will ever
//! change that.

use super::{Command, CommMode, Error};

/// Format the PICC
#[derive(Clone, Debug, Default)]
pub struct FormatPicc;

impl Command for FormatPicc {
    type Response = ();

    const INS: u8 = 0xFC;
    const COMM_MODE: CommMode = CommMode::Full;

    fn parse_response(_body: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}
