//! On-disk definitions for the native composefs image format.
//!
//! The image is a fixed header, an inode section, and a variable-data
//! section.  All integers are little-endian.  Inode records are variable
//! length: a flags word followed by only the fields whose flag bit is set,
//! with well-known defaults for everything omitted.  The type-specific
//! payload (directory table, backing pathname, or symlink target) follows
//! each record directly.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::digest::{Digest, DIGEST_SIZE};

pub const MAGIC: U32 = U32::new(0xc078629a);
pub const VERSION: u8 = 1;

/// Size of the fixed image header; the inode section follows immediately.
pub const HEADER_SIZE: usize = size_of::<Header>();

/// Alignment of inode records and variable-data blobs.
pub const ALIGNMENT: usize = 4;

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Header {
    pub version: u8,
    pub unused1: u8,
    pub unused2: U16,
    pub magic: U32,
    /// Offset of the variable-data section, relative to the image start.
    pub data_offset: U64,
    /// Index (byte offset within the inode section) of the root record.
    pub root_inode: U64,
    pub unused3: [U64; 2],
}

/* Inode record flags, in field order. */
pub const FLAG_PAYLOAD: u32 = 1 << 0;
pub const FLAG_MODE: u32 = 1 << 1;
pub const FLAG_NLINK: u32 = 1 << 2;
pub const FLAG_UIDGID: u32 = 1 << 3;
pub const FLAG_RDEV: u32 = 1 << 4;
pub const FLAG_MTIME: u32 = 1 << 5;
pub const FLAG_MTIME_NSEC: u32 = 1 << 6;
pub const FLAG_LOW_SIZE: u32 = 1 << 7;
pub const FLAG_HIGH_SIZE: u32 = 1 << 8;
pub const FLAG_XATTRS: u32 = 1 << 9;
pub const FLAG_DIGEST: u32 = 1 << 10;
/// No field body: the digest is derived from the payload on read.
pub const FLAG_DIGEST_FROM_PAYLOAD: u32 = 1 << 11;

pub const DEFAULT_MODE: u32 = 0o100644;
pub const DEFAULT_NLINK: u32 = 1;

/// A reference to a blob in the variable-data section.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct VData {
    pub off: U32,
    pub len: U32,
}

/// One directory entry.  Entries are sorted by name; the names themselves
/// are concatenated after the entry table.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirentHeader {
    /// The child's inode index (byte offset in the inode section).
    pub inode_index: U64,
    pub name_len: U16,
    pub d_type: u8,
    pub pad: u8,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirHeader {
    pub n_dentries: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct XattrHeader {
    pub n_attrs: U16,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct XattrEntry {
    pub key_len: U16,
    pub value_len: U16,
}

/// A fully decoded inode record, with defaults applied for omitted fields.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InodeData {
    pub flags: u32,
    /// Length of the payload following the record.
    pub payload_length: u32,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u32,
    pub st_mtim_sec: i64,
    pub st_mtim_nsec: u32,
    pub st_size: u64,
    /// The xattr block reference; zero when the inode has no xattrs.
    pub xattrs: VData,
    pub digest: Option<Digest>,
}

impl Default for InodeData {
    fn default() -> Self {
        Self {
            flags: 0,
            payload_length: 0,
            st_mode: DEFAULT_MODE,
            st_nlink: DEFAULT_NLINK,
            st_uid: 0,
            st_gid: 0,
            st_rdev: 0,
            st_mtim_sec: 0,
            st_mtim_nsec: 0,
            st_size: 0,
            xattrs: VData::default(),
            digest: None,
        }
    }
}

impl InodeData {
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Recomputes the flag word from the field values, keeping only fields
    /// that differ from their defaults.  `FLAG_DIGEST_FROM_PAYLOAD` is
    /// preserved from the existing flags since it has no field body.
    pub fn compute_flags(&mut self) {
        let mut flags = self.flags & FLAG_DIGEST_FROM_PAYLOAD;
        if self.payload_length != 0 {
            flags |= FLAG_PAYLOAD;
        }
        if self.st_mode != DEFAULT_MODE {
            flags |= FLAG_MODE;
        }
        if self.st_nlink != DEFAULT_NLINK {
            flags |= FLAG_NLINK;
        }
        if self.st_uid != 0 || self.st_gid != 0 {
            flags |= FLAG_UIDGID;
        }
        if self.st_rdev != 0 {
            flags |= FLAG_RDEV;
        }
        if self.st_mtim_sec != 0 {
            flags |= FLAG_MTIME;
        }
        if self.st_mtim_nsec != 0 {
            flags |= FLAG_MTIME_NSEC;
        }
        if self.st_size as u32 != 0 {
            flags |= FLAG_LOW_SIZE;
        }
        if self.st_size >> 32 != 0 {
            flags |= FLAG_HIGH_SIZE;
        }
        if self.xattrs.len.get() != 0 {
            flags |= FLAG_XATTRS;
        }
        if self.digest.is_some() {
            flags |= FLAG_DIGEST;
        }
        self.flags = flags;
    }

    /// The encoded size of a record with the given flags, excluding the
    /// payload that follows it.
    pub fn encoded_size(flags: u32) -> usize {
        let field = |flag: u32, size: usize| if flags & flag != 0 { size } else { 0 };
        4 + field(FLAG_PAYLOAD, 4)
            + field(FLAG_MODE, 4)
            + field(FLAG_NLINK, 4)
            + field(FLAG_UIDGID, 8)
            + field(FLAG_RDEV, 4)
            + field(FLAG_MTIME, 8)
            + field(FLAG_MTIME_NSEC, 4)
            + field(FLAG_LOW_SIZE, 4)
            + field(FLAG_HIGH_SIZE, 4)
            + field(FLAG_XATTRS, 8)
            + field(FLAG_DIGEST, DIGEST_SIZE)
    }

    /// Appends the record (flags word plus present fields) to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let flags = self.flags;
        out.extend_from_slice(&flags.to_le_bytes());
        if flags & FLAG_PAYLOAD != 0 {
            out.extend_from_slice(&self.payload_length.to_le_bytes());
        }
        if flags & FLAG_MODE != 0 {
            out.extend_from_slice(&self.st_mode.to_le_bytes());
        }
        if flags & FLAG_NLINK != 0 {
            out.extend_from_slice(&self.st_nlink.to_le_bytes());
        }
        if flags & FLAG_UIDGID != 0 {
            out.extend_from_slice(&self.st_uid.to_le_bytes());
            out.extend_from_slice(&self.st_gid.to_le_bytes());
        }
        if flags & FLAG_RDEV != 0 {
            out.extend_from_slice(&self.st_rdev.to_le_bytes());
        }
        if flags & FLAG_MTIME != 0 {
            out.extend_from_slice(&(self.st_mtim_sec as u64).to_le_bytes());
        }
        if flags & FLAG_MTIME_NSEC != 0 {
            out.extend_from_slice(&self.st_mtim_nsec.to_le_bytes());
        }
        if flags & FLAG_LOW_SIZE != 0 {
            out.extend_from_slice(&(self.st_size as u32).to_le_bytes());
        }
        if flags & FLAG_HIGH_SIZE != 0 {
            out.extend_from_slice(&((self.st_size >> 32) as u32).to_le_bytes());
        }
        if flags & FLAG_XATTRS != 0 {
            out.extend_from_slice(self.xattrs.as_bytes());
        }
        if flags & FLAG_DIGEST != 0 {
            if let Some(digest) = &self.digest {
                out.extend_from_slice(digest.as_bytes());
            }
        }
    }

    /// Decodes one record from the start of `data`, returning it together
    /// with the number of bytes consumed.  `None` means the buffer is too
    /// short for the fields the flags promise.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        let mut cursor = Cursor { data, pos: 0 };
        let flags = cursor.u32()?;
        if data.len() < Self::encoded_size(flags) {
            return None;
        }

        let mut ino = Self {
            flags,
            ..Self::default()
        };
        if flags & FLAG_PAYLOAD != 0 {
            ino.payload_length = cursor.u32()?;
        }
        if flags & FLAG_MODE != 0 {
            ino.st_mode = cursor.u32()?;
        }
        if flags & FLAG_NLINK != 0 {
            ino.st_nlink = cursor.u32()?;
        }
        if flags & FLAG_UIDGID != 0 {
            ino.st_uid = cursor.u32()?;
            ino.st_gid = cursor.u32()?;
        }
        if flags & FLAG_RDEV != 0 {
            ino.st_rdev = cursor.u32()?;
        }
        if flags & FLAG_MTIME != 0 {
            ino.st_mtim_sec = cursor.u64()? as i64;
        }
        if flags & FLAG_MTIME_NSEC != 0 {
            ino.st_mtim_nsec = cursor.u32()?;
        }
        if flags & FLAG_LOW_SIZE != 0 {
            ino.st_size |= cursor.u32()? as u64;
        }
        if flags & FLAG_HIGH_SIZE != 0 {
            ino.st_size |= (cursor.u32()? as u64) << 32;
        }
        if flags & FLAG_XATTRS != 0 {
            ino.xattrs = VData {
                off: cursor.u32()?.into(),
                len: cursor.u32()?.into(),
            };
        }
        if flags & FLAG_DIGEST != 0 {
            ino.digest = Some(Digest::from(cursor.array::<DIGEST_SIZE>()?));
        }
        Some((ino, cursor.pos))
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<Header>(), 40);
        assert_eq!(size_of::<DirentHeader>(), 12);
        assert_eq!(size_of::<DirHeader>(), 4);
        assert_eq!(size_of::<XattrHeader>(), 2);
        assert_eq!(size_of::<XattrEntry>(), 4);
        assert_eq!(size_of::<VData>(), 8);
    }

    #[test]
    fn test_all_defaults_is_four_bytes() {
        let mut ino = InodeData::default();
        ino.compute_flags();
        assert_eq!(ino.flags, 0);
        assert_eq!(InodeData::encoded_size(0), 4);

        let mut encoded = vec![];
        ino.encode_into(&mut encoded);
        assert_eq!(encoded, vec![0, 0, 0, 0]);

        let (decoded, consumed) = InodeData::decode(&encoded).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(decoded, ino);
        assert_eq!(decoded.st_mode, DEFAULT_MODE);
        assert_eq!(decoded.st_nlink, DEFAULT_NLINK);
    }

    #[test]
    fn test_encode_decode_all_fields() {
        let mut ino = InodeData {
            payload_length: 17,
            st_mode: 0o100755,
            st_nlink: 3,
            st_uid: 1000,
            st_gid: 1001,
            st_rdev: 0x0501,
            st_mtim_sec: -1,
            st_mtim_nsec: 999_999_999,
            st_size: 0x1_2345_6789,
            xattrs: VData {
                off: 16.into(),
                len: 32.into(),
            },
            digest: Some(Digest::from([0xab; 32])),
            ..InodeData::default()
        };
        ino.flags = FLAG_DIGEST_FROM_PAYLOAD; // preserved alongside the rest
        ino.compute_flags();

        let mut encoded = vec![];
        ino.encode_into(&mut encoded);
        assert_eq!(encoded.len(), InodeData::encoded_size(ino.flags));

        let (decoded, consumed) = InodeData::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, ino);
        assert!(decoded.has(FLAG_DIGEST_FROM_PAYLOAD));
    }

    #[test]
    fn test_size_splits_into_low_and_high() {
        let mut low_only = InodeData {
            st_size: 0x1000,
            ..InodeData::default()
        };
        low_only.compute_flags();
        assert!(low_only.has(FLAG_LOW_SIZE));
        assert!(!low_only.has(FLAG_HIGH_SIZE));

        // an exact multiple of 2^32 has an all-zero low word
        let mut high_only = InodeData {
            st_size: 1 << 32,
            ..InodeData::default()
        };
        high_only.compute_flags();
        assert!(!high_only.has(FLAG_LOW_SIZE));
        assert!(high_only.has(FLAG_HIGH_SIZE));

        let mut encoded = vec![];
        high_only.encode_into(&mut encoded);
        let (decoded, _) = InodeData::decode(&encoded).unwrap();
        assert_eq!(decoded.st_size, 1 << 32);
    }

    #[test]
    fn test_decode_truncated() {
        let mut ino = InodeData {
            st_uid: 5,
            st_gid: 5,
            ..InodeData::default()
        };
        ino.compute_flags();
        let mut encoded = vec![];
        ino.encode_into(&mut encoded);

        for len in 0..encoded.len() {
            assert!(InodeData::decode(&encoded[..len]).is_none(), "len {len}");
        }
        assert!(InodeData::decode(&encoded).is_some());
    }
}
