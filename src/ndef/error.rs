//! NDEF / file-settings errors

use thiserror::Error;

/// Errors from NDEF layout or file-settings encoding
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// URL does not start with `https://`
    #[error("URL must start with https://")]
    UrlScheme,

    /// URL tail does not fit the NDEF file
    #[error("URL tail too long: {len} bytes (max {max})")]
    UrlTooLong {
        /// Offending tail length
        len: usize,
        /// Largest tail that fits
        max: usize,
    },

    /// A zero-filled mirror placeholder is missing from the template
    #[error("missing `{0}` placeholder in URL template")]
    MissingPlaceholder(&'static str),

    /// Placeholders overlap or are out of UID → CTR → CMAC order
    #[error("SDM mirror placeholders out of order or overlapping")]
    PlaceholderLayout,

    /// An access-rights nibble is reserved (`SDMFileRead = 0xE` is the
    /// known trap: the tag answers 0x919E)
    #[error("access value 0x{nibble:X} is reserved")]
    RfuAccessValue {
        /// Offending nibble
        nibble: u8,
    },

    /// Settings payload shorter than its own structure claims
    #[error("file settings payload truncated")]
    Truncated,
}
