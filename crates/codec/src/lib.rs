//! Binary framing for the pvAccess wire protocol.
//!
//! This crate only knows about bytes: command codes, the 8-byte frame
//! header, QoS flags, and a byte-order-aware payload cursor. It has no
//! notion of sockets, channels or requests — those live in `engine`.

pub mod command;
pub mod cursor;
pub mod header;
pub mod qos;

pub use command::CommandId;
pub use cursor::{PayloadReader, PayloadWriter};
pub use header::{ByteOrder, Header, HEADER_LEN};
pub use qos::QosFlags;

use std::array::TryFromSliceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Fewer bytes were available than the frame claimed to need.
    Truncated,
    /// The magic byte did not match the protocol's fixed value.
    BadMagic,
    /// The command byte did not map to a known `CommandId`.
    UnknownCommand(u8),
    /// A length-prefixed field declared a size larger than the remaining buffer.
    InvalidLength,
    /// A string field was not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated frame"),
            Error::BadMagic => write!(f, "bad magic byte"),
            Error::UnknownCommand(b) => write!(f, "unknown command byte: {b:#04x}"),
            Error::InvalidLength => write!(f, "invalid length prefix"),
            Error::InvalidUtf8 => write!(f, "invalid utf-8 in string field"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TryFromSliceError> for Error {
    fn from(_: TryFromSliceError) -> Self {
        Error::Truncated
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_stable() {
        assert_eq!(Error::BadMagic.to_string(), "bad magic byte");
        assert_eq!(
            Error::UnknownCommand(0xFE).to_string(),
            "unknown command byte: 0xfe"
        );
    }
}
