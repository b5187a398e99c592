use std::str::Utf8Error;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Unsupported format version {found}, expected {expected}")]
    Version { found: u16, expected: u16 },

    #[error("Buffer truncated: needed {needed} bytes but only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("Label string is not valid UTF-8")]
    InvalidUtf8(#[from] Utf8Error),

    #[error("Timestamp varint does not fit in 64 bits")]
    VarintOverflow,

    #[error("{0} unexpected trailing bytes after the last record")]
    TrailingBytes(usize),
}

#[derive(Debug, Error, PartialEq)]
pub enum EncodeError {
    #[error("String of {0} bytes exceeds the 65535 byte length prefix")]
    StringTooLong(usize),

    #[error("{0} labels exceed the 65535 entry limit")]
    TooManyLabels(usize),

    #[error("{0} samples exceed the 65535 sample batch limit")]
    TooManySamples(usize),

    #[error("{0} map entries exceed the 65535 entry limit")]
    TooManyEntries(usize),

    #[error("Batch of {0} bytes is too short to hold a sample count")]
    MissingBatchHeader(usize),
}
