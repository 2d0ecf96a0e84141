//! GetVersion: hardware info, software info and UID+batch, delivered in
//! three AdditionalFrame rounds

use super::{plain_apdu, Command, Error};
use crate::{
    apdu::StatusWord,
    transport::{self, Transport},
    uid::Uid,
};

/// First frame of the GetVersion sequence
#[derive(Clone, Debug, Default)]
pub struct GetVersion;

impl Command for GetVersion {
    type Response = Vec<u8>;

    const INS: u8 = 0x60;

    fn parse_response(body: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(body.to_vec())
    }
}

/// `0xAF` continuation frame, shared by GetVersion and the handshake
#[derive(Clone, Debug, Default)]
pub struct AdditionalFrame;

impl Command for AdditionalFrame {
    type Response = Vec<u8>;

    const INS: u8 = 0xAF;

    fn parse_response(body: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(body.to_vec())
    }
}

/// One hardware or software version record (7 bytes on the wire)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ComponentVersion {
    /// Vendor; `0x04` is NXP
    pub vendor_id: u8,
    /// Product type
    pub product_type: u8,
    /// Product subtype
    pub product_subtype: u8,
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Storage size code
    pub storage_size: u8,
    /// Communication protocol code
    pub protocol: u8,
}

impl ComponentVersion {
    fn parse(frame: &[u8]) -> Option<Self> {
        let bytes: &[u8; 7] = frame.try_into().ok()?;
        Some(Self {
            vendor_id: bytes[0],
            product_type: bytes[1],
            product_subtype: bytes[2],
            major: bytes[3],
            minor: bytes[4],
            storage_size: bytes[5],
            protocol: bytes[6],
        })
    }
}

/// Everything GetVersion returns across its three frames
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionInfo {
    /// Hardware version (frame 1)
    pub hardware: ComponentVersion,
    /// Software version (frame 2)
    pub software: ComponentVersion,
    /// Manufacturing UID (frame 3)
    pub uid: Uid,
    /// Production batch number
    pub batch: [u8; 5],
    /// Fabrication calendar week (BCD)
    pub fab_week: u8,
    /// Fabrication year (BCD)
    pub fab_year: u8,
}

impl VersionInfo {
    fn parse(frames: &[Vec<u8>]) -> Result<Self, Error> {
        let malformed = |frame: &Vec<u8>, reason| Error::ResponseFormat {
            ins: GetVersion::INS,
            len: frame.len(),
            reason,
        };

        let [hw, sw, prod] = frames else {
            return Err(Error::ResponseFormat {
                ins: GetVersion::INS,
                len: frames.len(),
                reason: "expected three version frames",
            });
        };

        let hardware =
            ComponentVersion::parse(hw).ok_or_else(|| malformed(hw, "bad hardware frame"))?;
        let software =
            ComponentVersion::parse(sw).ok_or_else(|| malformed(sw, "bad software frame"))?;

        if prod.len() != 14 {
            return Err(malformed(prod, "expected 14-byte production frame"));
        }
        let uid = Uid::from_slice(&prod[..7]).expect("length checked");
        let batch = prod[7..12].try_into().expect("length checked");

        Ok(Self {
            hardware,
            software,
            uid,
            batch,
            fab_week: prod[12],
            fab_year: prod[13],
        })
    }
}

/// Run the full three-frame GetVersion exchange on a plain transport
pub fn read_version<T: Transport + ?Sized>(transport: &mut T) -> Result<VersionInfo, Error> {
    let mut frames = Vec::with_capacity(3);
    let mut response = transport::exchange(transport, &plain_apdu(&GetVersion))?;

    loop {
        match response.status() {
            StatusWord::MoreData => {
                frames.push(response.data);
                response = transport::exchange(transport, &plain_apdu(&AdditionalFrame))?;
            }
            StatusWord::Success => {
                frames.push(response.data);
                break;
            }
            other => return Err(Error::Status(other)),
        }
    }

    VersionInfo::parse(&frames)
}
