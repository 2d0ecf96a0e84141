//! ISO 7816-4 APDU encoding and response parsing.
//!
//! The codec is deliberately ignorant of command semantics: it frames
//! `[CLA, INS, P1, P2, Lc, data, Le]` with a one-byte Lc (every NTAG424
//! command fits) and splits responses into `(data, SW1, SW2)`. Which
//! commands belong to the native (`CLA=0x90`) or ISO (`CLA=0x00`) family
//! is the command catalog's knowledge.

mod error;
mod status;

pub use self::{error::Error, status::StatusWord};

/// Largest data field a short APDU can carry
pub const MAX_DATA_LEN: usize = 255;

/// Class byte of the native NTAG424 command family
pub const CLA_NATIVE: u8 = 0x90;

/// Class byte of the ISO 7816-4 command family
pub const CLA_ISO: u8 = 0x00;

/// A command APDU
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Apdu {
    /// Class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// First parameter byte
    pub p1: u8,
    /// Second parameter byte
    pub p2: u8,
    /// Command data field (at most 255 bytes)
    pub data: Vec<u8>,
    /// Expected-length byte, omitted from the wire when `None`
    pub le: Option<u8>,
}

impl Apdu {
    /// Create a new command APDU
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>, le: Option<u8>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
            le,
        }
    }

    /// Serialize to wire bytes: `[CLA, INS, P1, P2, Lc, data, Le]` with
    /// Lc and Le present only where applicable
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.data.len() > MAX_DATA_LEN {
            return Err(Error::DataTooLong {
                len: self.data.len(),
            });
        }

        let mut bytes = Vec::with_capacity(6 + self.data.len());
        bytes.push(self.cla);
        bytes.push(self.ins);
        bytes.push(self.p1);
        bytes.push(self.p2);
        if !self.data.is_empty() {
            bytes.push(self.data.len() as u8);
            bytes.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            bytes.push(le);
        }
        Ok(bytes)
    }
}

/// A response APDU: data followed by the two status bytes
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseApdu {
    /// Response data field
    pub data: Vec<u8>,
    /// First status byte
    pub sw1: u8,
    /// Second status byte
    pub sw2: u8,
}

impl ResponseApdu {
    /// Split raw reader output into data and status words
    pub fn from_bytes(mut bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() < 2 {
            return Err(Error::ResponseTooShort { len: bytes.len() });
        }
        let sw2 = bytes.pop().expect("len checked");
        let sw1 = bytes.pop().expect("len checked");
        Ok(Self {
            data: bytes,
            sw1,
            sw2,
        })
    }

    /// Classify the status words
    pub fn status(&self) -> StatusWord {
        StatusWord::from_bytes(self.sw1, self.sw2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_all_fields() {
        let apdu = Apdu::new(0x90, 0x71, 0x00, 0x00, vec![0x00, 0x00], Some(0x00));
        assert_eq!(
            apdu.to_bytes().unwrap(),
            vec![0x90, 0x71, 0, 0, 0x02, 0, 0, 0]
        );
    }

    #[test]
    fn omits_lc_when_empty_and_le_when_none() {
        let apdu = Apdu::new(0x00, 0xA4, 0x00, 0x0C, vec![], None);
        assert_eq!(apdu.to_bytes().unwrap(), vec![0x00, 0xA4, 0x00, 0x0C]);
    }

    #[test]
    fn rejects_oversized_data() {
        let apdu = Apdu::new(0x90, 0x8D, 0, 0, vec![0u8; 256], Some(0));
        assert!(matches!(
            apdu.to_bytes(),
            Err(Error::DataTooLong { len: 256 })
        ));
    }

    #[test]
    fn splits_response_status() {
        let resp = ResponseApdu::from_bytes(vec![0xAA, 0xBB, 0x91, 0x00]).unwrap();
        assert_eq!(resp.data, vec![0xAA, 0xBB]);
        assert_eq!(resp.status(), StatusWord::Success);

        assert!(matches!(
            ResponseApdu::from_bytes(vec![0x91]),
            Err(Error::ResponseTooShort { len: 1 })
        ));
    }
}
