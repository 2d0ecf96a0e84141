//! Select the NDEF Tag Application

use super::{Command, Error};
use crate::apdu::CLA_ISO;

/// The NDEF Tag Application name every NTAG424 DNA answers to
pub const PICC_APPLICATION_AID: [u8; 7] = [0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];

/// ISO SelectFile by DF name for the PICC application. Must run before
/// any native command after the tag enters the field.
#[derive(Clone, Debug, Default)]
pub struct SelectPiccApplication;

impl Command for SelectPiccApplication {
    type Response = ();

    const INS: u8 = 0xA4;
    const CLA: u8 = CLA_ISO;

    fn params(&self) -> (u8, u8) {
        // P1 = select by DF name, P2 = no FCI
        (0x04, 0x0C)
    }

    fn data(&self) -> Vec<u8> {
        PICC_APPLICATION_AID.to_vec()
    }

    fn parse_response(_body: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}
