//! Binary digests identifying the backing content of regular files.
//!
//! A metadata image does not carry file data; regular files reference their
//! content in an external store by a 32-byte digest.  The digest can be
//! recorded explicitly on a node, or derived from the node's backing
//! pathname when the store lays objects out by digest (like
//! `ab/cdef...0123.file`).

use std::fmt;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The size of a digest, in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Errors from parsing or deriving digests.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DigestError {
    /// The input did not contain exactly 64 hex digits.
    #[error("Digest does not contain exactly 64 hex digits")]
    WrongLength,
    /// A character outside `[0-9a-fA-F]` was found where a hex digit was
    /// expected.
    #[error("Digest contains a non-hex character")]
    InvalidHexDigit,
}

/// A 32-byte binary digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(transparent)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Parses a digest from exactly 64 hex digits, case insensitive.
    pub fn from_hex(string: impl AsRef<str>) -> Result<Self, DigestError> {
        let mut value = [0u8; DIGEST_SIZE];
        hex::decode_to_slice(string.as_ref(), &mut value).map_err(|err| match err {
            hex::FromHexError::InvalidHexCharacter { .. } => DigestError::InvalidHexDigit,
            _ => DigestError::WrongLength,
        })?;
        Ok(Self(value))
    }

    /// Derives a digest from a backing file pathname.
    ///
    /// The pathname must spell out the digest in hex, possibly split by
    /// directory separators (`ab/cdef...`).  Scanning stops at the first
    /// `.`, so a filename extension is ignored.  Exactly 64 hex digits must
    /// be seen before the scan ends.
    pub fn from_payload(payload: &[u8]) -> Result<Self, DigestError> {
        let mut value = [0u8; DIGEST_SIZE];
        let mut nibbles = 0;

        for &c in payload {
            if c == b'/' {
                continue;
            }
            if c == b'.' {
                break;
            }
            if nibbles == 2 * DIGEST_SIZE {
                return Err(DigestError::WrongLength);
            }
            let digit = (c as char).to_digit(16).ok_or(DigestError::InvalidHexDigit)?;
            value[nibbles / 2] = value[nibbles / 2] << 4 | digit as u8;
            nibbles += 1;
        }

        if nibbles != 2 * DIGEST_SIZE {
            return Err(DigestError::WrongLength);
        }
        Ok(Self(value))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }
}

impl From<[u8; DIGEST_SIZE]> for Digest {
    fn from(value: [u8; DIGEST_SIZE]) -> Self {
        Self(value)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// Debug prints the hex form: the raw byte array is useless in test output.
impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}
