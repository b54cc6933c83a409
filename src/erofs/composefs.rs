//! Overlayfs metadata stored inside the EROFS image.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::digest::Digest;

pub const DIGEST_ALGO_SHA256: u8 = 1;

/* From linux/fs/overlayfs/overlayfs.h struct ovl_metacopy */
/// The value of the `trusted.overlay.metacopy` xattr: it marks an inode as
/// metadata-only and carries the digest of the backing file.
#[derive(Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct OverlayMetacopy {
    version: u8,
    len: u8,
    flags: u8,
    digest_algo: u8,
    pub digest: Digest,
}

impl OverlayMetacopy {
    pub(super) fn new(digest: Digest) -> Self {
        Self {
            version: 0,
            len: size_of::<Self>() as u8,
            flags: 0,
            digest_algo: DIGEST_ALGO_SHA256,
            digest,
        }
    }

    /// Whether the header fields hold the values this crate writes.
    pub fn valid(&self) -> bool {
        self.version == 0
            && self.len == size_of::<Self>() as u8
            && self.flags == 0
            && self.digest_algo == DIGEST_ALGO_SHA256
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;
    use zerocopy::{FromBytes, IntoBytes};

    use super::*;

    #[test]
    fn test_metacopy_layout() {
        assert_eq!(size_of::<OverlayMetacopy>(), 36);

        let metacopy = OverlayMetacopy::new(Digest::from([0x77; 32]));
        assert!(metacopy.valid());

        let parsed = OverlayMetacopy::read_from_bytes(metacopy.as_bytes()).unwrap();
        assert!(parsed.valid());
        assert_eq!(parsed.digest, Digest::from([0x77; 32]));
    }
}
