//! Type-4 NDEF file construction and SDM mirror-offset calculation.
//!
//! The NDEF file this engine writes holds a single short URI record with
//! zero-filled placeholders for the UID, read-counter and CMAC mirrors.
//! The byte offsets of those placeholders, computed here, are what
//! ChangeFileSettings later hands to the tag, so the two layouts must
//! agree to the byte.

mod error;
mod file_settings;

pub use self::{
    error::Error,
    file_settings::{
        AccessCondition, AccessRights, FileSettings, FileSettingsInfo, SdmAccessRights,
        SdmOptions, SdmSettings,
    },
};

/// File number of the NDEF file inside the PICC application
pub const NDEF_FILE_NO: u8 = 0x02;

/// ISO file identifier of the NDEF file
pub const NDEF_FILE_ID: u16 = 0xE104;

/// ISO file identifier of the Capability Container (factory-written,
/// read-only in practice)
pub const CC_FILE_ID: u16 = 0xE103;

/// Size of the NDEF file on an NTAG424 DNA
pub const NDEF_FILE_SIZE: usize = 256;

/// Fixed bytes preceding the URL tail in the file:
/// `NLEN(2) || 03 <len> || D1 01 <plen> 55 || 04`
pub const NDEF_HEADER_LEN: usize = 9;

/// URI identifier code for `https://`
const URI_CODE_HTTPS: u8 = 0x04;

/// Zero-filled mirror placeholders the URL template must contain
const UID_PLACEHOLDER: &str = "uid=00000000000000";
const CTR_PLACEHOLDER: &str = "ctr=000000";
const CMAC_PLACEHOLDER: &str = "cmac=0000000000000000";

/// ASCII lengths of the mirrored values
pub const UID_MIRROR_LEN: u32 = 14;
/// Read-counter mirror length
pub const CTR_MIRROR_LEN: u32 = 6;
/// CMAC mirror length
pub const CMAC_MIRROR_LEN: u32 = 16;

/// Longest URL tail that still fits the single-byte TLV lengths and the
/// 256-byte file
const MAX_TAIL_LEN: usize = NDEF_FILE_SIZE - NDEF_HEADER_LEN - 1;

/// Strip the mandatory `https://` scheme. Offsets are always computed
/// over the URL *without* the scheme; counting the scheme is the
/// classic off-by-(+8 or +6) in this corner of the protocol.
pub(crate) fn url_tail(url: &str) -> Result<&str, Error> {
    url.strip_prefix("https://").ok_or(Error::UrlScheme)
}

/// Build the complete Type-4 NDEF file content for a URL.
///
/// Layout:
///
/// ```text
/// [NLEN hi][NLEN lo]            two-byte length, big-endian
/// 0x03 [TLV-Len]                NDEF Message TLV
/// 0xD1 0x01 [PayloadLen] 0x55   short record, well-known type 'U'
/// 0x04                          URI identifier: "https://"
/// [URL tail]
/// 0xFE                          terminator TLV
/// ```
///
/// The two NLEN bytes are the Type-4-Tag framing Android's background
/// dispatcher insists on; without them the tag reads as empty.
pub fn build_ndef_file(url: &str) -> Result<Vec<u8>, Error> {
    let tail = url_tail(url)?.as_bytes();
    if tail.len() > MAX_TAIL_LEN {
        return Err(Error::UrlTooLong {
            len: tail.len(),
            max: MAX_TAIL_LEN,
        });
    }

    let record_len = 5 + tail.len(); // D1 01 <plen> 55 + (04 || tail)
    let nlen = (2 + record_len + 1) as u16; // TLV tag+len, record, terminator

    let mut file = Vec::with_capacity(NDEF_HEADER_LEN + tail.len() + 1);
    file.extend_from_slice(&nlen.to_be_bytes());
    file.push(0x03);
    file.push(record_len as u8);
    file.push(0xD1);
    file.push(0x01);
    file.push((1 + tail.len()) as u8);
    file.push(0x55);
    file.push(URI_CODE_HTTPS);
    file.extend_from_slice(tail);
    file.push(0xFE);

    debug_assert_eq!(file.len(), NDEF_HEADER_LEN + tail.len() + 1);
    Ok(file)
}

/// Byte positions of the three mirror regions within the NDEF file,
/// plus the start of the CMAC input span
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SdmOffsets {
    /// Start of the 14-character UID mirror
    pub uid: u32,
    /// Start of the 6-character read-counter mirror
    pub ctr: u32,
    /// Start of the 16-character CMAC mirror
    pub mac: u32,
    /// Start of the span the tag MACs at read time
    pub mac_input: u32,
}

impl SdmOffsets {
    /// Locate the placeholders in a URL template and compute their file
    /// offsets.
    ///
    /// Each placeholder must appear literally (`uid=` followed by 14
    /// zeros, and so on), in UID → CTR → CMAC order, without overlap.
    /// The MAC input starts at the UID mirror so the CMAC covers the
    /// UID, the counter and the separators between them.
    pub fn from_template(url: &str) -> Result<Self, Error> {
        let tail = url_tail(url)?;
        if tail.len() > MAX_TAIL_LEN {
            return Err(Error::UrlTooLong {
                len: tail.len(),
                max: MAX_TAIL_LEN,
            });
        }

        let find = |placeholder: &'static str, skip: usize| -> Result<u32, Error> {
            let name = &placeholder[..skip];
            let index = tail
                .find(placeholder)
                .ok_or(Error::MissingPlaceholder(name))?;
            Ok((NDEF_HEADER_LEN + index + skip) as u32)
        };

        let uid = find(UID_PLACEHOLDER, 4)?;
        let ctr = find(CTR_PLACEHOLDER, 4)?;
        let mac = find(CMAC_PLACEHOLDER, 5)?;

        let offsets = Self {
            uid,
            ctr,
            mac,
            mac_input: uid,
        };

        let file_len = (NDEF_HEADER_LEN + tail.len() + 1) as u32;
        let ordered = uid + UID_MIRROR_LEN <= ctr
            && ctr + CTR_MIRROR_LEN <= mac
            && mac + CMAC_MIRROR_LEN <= file_len;
        if !ordered {
            return Err(Error::PlaceholderLayout);
        }

        Ok(offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str =
        "https://example.com/sdm?uid=00000000000000&ctr=000000&cmac=0000000000000000";

    #[test]
    fn file_layout_and_lengths() {
        let file = build_ndef_file(TEMPLATE).unwrap();
        let tail = url_tail(TEMPLATE).unwrap();

        assert_eq!(file.len(), NDEF_HEADER_LEN + tail.len() + 1);
        // NLEN spans everything after itself
        let nlen = u16::from_be_bytes([file[0], file[1]]) as usize;
        assert_eq!(nlen, file.len() - 2);
        assert_eq!(file[2], 0x03);
        assert_eq!(file[3] as usize, 5 + tail.len());
        assert_eq!(&file[4..8], &[0xD1, 0x01, (1 + tail.len()) as u8, 0x55]);
        assert_eq!(file[8], 0x04);
        assert_eq!(&file[9..9 + tail.len()], tail.as_bytes());
        assert_eq!(*file.last().unwrap(), 0xFE);
    }

    #[test]
    fn offsets_are_computed_from_the_scheme_stripped_tail() {
        let offsets = SdmOffsets::from_template(TEMPLATE).unwrap();
        let tail = url_tail(TEMPLATE).unwrap();

        let uid_index = tail.find("uid=").unwrap() + 4;
        let ctr_index = tail.find("ctr=").unwrap() + 4;
        let mac_index = tail.find("cmac=").unwrap() + 5;

        assert_eq!(offsets.uid as usize, NDEF_HEADER_LEN + uid_index);
        assert_eq!(offsets.ctr as usize, NDEF_HEADER_LEN + ctr_index);
        assert_eq!(offsets.mac as usize, NDEF_HEADER_LEN + mac_index);
        assert_eq!(offsets.mac_input, offsets.uid);
    }

    #[test]
    fn template_survives_a_build_and_reparse_round_trip() {
        let file = build_ndef_file(TEMPLATE).unwrap();
        let tail_len = u16::from_be_bytes([file[0], file[1]]) as usize - 8;
        let tail = std::str::from_utf8(&file[NDEF_HEADER_LEN..NDEF_HEADER_LEN + tail_len]).unwrap();
        let rebuilt = format!("https://{}", tail);
        assert_eq!(rebuilt, TEMPLATE);
        assert_eq!(
            SdmOffsets::from_template(&rebuilt).unwrap(),
            SdmOffsets::from_template(TEMPLATE).unwrap()
        );
    }

    #[test]
    fn rejects_http_scheme_and_missing_placeholders() {
        assert!(matches!(
            SdmOffsets::from_template("http://example.com/?uid=00000000000000"),
            Err(Error::UrlScheme)
        ));
        assert!(matches!(
            SdmOffsets::from_template("https://example.com/?uid=00000000000000&ctr=000000"),
            Err(Error::MissingPlaceholder("cmac=")),
        ));
    }

    #[test]
    fn rejects_out_of_order_placeholders() {
        let url = "https://example.com/?cmac=0000000000000000&uid=00000000000000&ctr=000000";
        assert!(matches!(
            SdmOffsets::from_template(url),
            Err(Error::PlaceholderLayout)
        ));
    }
}
