//! Bounds-checked, read-only access to native-format images.
//!
//! An [`Image`] borrows the raw bytes and re-validates every structure
//! against them on access, so a truncated or hostile image produces an
//! [`ImageError`], never a panic or an out-of-range read.  A name that
//! simply does not exist is `None`, not an error.

use std::cmp::Ordering;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::cfs::format::{self, DirHeader, DirentHeader, Header, InodeData, XattrEntry, XattrHeader};
use crate::digest::{Digest, DigestError};
use crate::tree::{MAX_NAME_LEN, S_IFDIR, S_IFMT};

/// Errors from opening or querying an image.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Not a composefs image (bad magic)")]
    BadMagic,
    #[error("Unsupported image version {0}")]
    UnsupportedVersion(u8),
    #[error("Image is truncated")]
    Truncated,
    #[error("Structure reference is out of range")]
    OutOfRange,
    #[error("Invalid inode index {0}")]
    InvalidInode(u64),
    #[error("Inode is not a directory")]
    NotADirectory,
    #[error("Malformed directory entry table")]
    BadDirectory,
    #[error("Malformed extended attribute block")]
    BadXattrs,
    #[error("Bad digest: {0}")]
    Digest(#[from] DigestError),
}

#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Array<T>([T]);

/// A read-only view of a native-format image.
pub struct Image<'img> {
    /// The inode section: everything between the header and `data_offset`.
    inodes: &'img [u8],
    /// The variable-data section.
    vdata: &'img [u8],
    root_inode: u64,
}

impl<'img> Image<'img> {
    /// Validates the header and section bounds of an untrusted image.
    pub fn open(image: &'img [u8]) -> Result<Self, ImageError> {
        let (header, _) = Header::ref_from_prefix(image).map_err(|_| ImageError::Truncated)?;
        if header.magic != format::MAGIC {
            return Err(ImageError::BadMagic);
        }
        if header.version != format::VERSION {
            return Err(ImageError::UnsupportedVersion(header.version));
        }

        let data_offset = header.data_offset.get();
        if data_offset < format::HEADER_SIZE as u64 || data_offset > image.len() as u64 {
            return Err(ImageError::OutOfRange);
        }
        let inodes = &image[format::HEADER_SIZE..data_offset as usize];
        let vdata = &image[data_offset as usize..];

        let root_inode = header.root_inode.get();
        if root_inode >= inodes.len() as u64 {
            return Err(ImageError::OutOfRange);
        }

        Ok(Self {
            inodes,
            vdata,
            root_inode,
        })
    }

    /// The wire index of the root directory.
    pub fn root_index(&self) -> u64 {
        self.root_inode
    }

    pub fn root(&self) -> Result<Inode<'img>, ImageError> {
        self.inode(self.root_inode)
    }

    /// Decodes the inode record at the given index.  Indices are byte
    /// offsets into the inode section, exactly as stored in directory
    /// entries, so any inode can be reached without walking from the root.
    pub fn inode(&self, index: u64) -> Result<Inode<'img>, ImageError> {
        let offset = usize::try_from(index).map_err(|_| ImageError::InvalidInode(index))?;
        if offset >= self.inodes.len() || offset % format::ALIGNMENT != 0 {
            return Err(ImageError::InvalidInode(index));
        }

        let (data, consumed) =
            InodeData::decode(&self.inodes[offset..]).ok_or(ImageError::Truncated)?;
        let payload_start = offset + consumed;
        let payload_end = payload_start
            .checked_add(data.payload_length as usize)
            .ok_or(ImageError::Truncated)?;
        let payload = self
            .inodes
            .get(payload_start..payload_end)
            .ok_or(ImageError::Truncated)?;

        Ok(Inode { data, payload })
    }

    /// Looks up `name` in a directory inode and decodes the child.
    /// `Ok(None)` means the name does not exist.
    pub fn lookup(
        &self,
        dir: &Inode<'img>,
        name: &OsStr,
    ) -> Result<Option<Inode<'img>>, ImageError> {
        match dir.dir()?.lookup(name) {
            Some(index) => Ok(Some(self.inode(index)?)),
            None => Ok(None),
        }
    }

    /// Resolves an inode's xattr reference into a parsed block.  Blocks may
    /// be shared between inodes; that is invisible here.
    pub fn xattrs(&self, inode: &Inode) -> Result<Xattrs<'img>, ImageError> {
        let vref = inode.data.xattrs;
        if !inode.data.has(format::FLAG_XATTRS) || vref.len.get() == 0 {
            return Ok(Xattrs::empty());
        }
        let start = vref.off.get() as usize;
        let end = start
            .checked_add(vref.len.get() as usize)
            .ok_or(ImageError::OutOfRange)?;
        let block = self.vdata.get(start..end).ok_or(ImageError::OutOfRange)?;
        Xattrs::parse(block)
    }

    /// Fetches one xattr of an inode by exact name.
    pub fn get_xattr(
        &self,
        inode: &Inode<'img>,
        name: &[u8],
    ) -> Result<Option<&'img [u8]>, ImageError> {
        Ok(self.xattrs(inode)?.get(name))
    }
}

/// A decoded inode record together with its trailing payload.
pub struct Inode<'img> {
    pub data: InodeData,
    payload: &'img [u8],
}

impl<'img> Inode<'img> {
    pub fn is_dir(&self) -> bool {
        self.data.st_mode & S_IFMT == S_IFDIR
    }

    /// The payload of a non-directory inode: the backing pathname of a
    /// regular file, or the target of a symlink.
    pub fn payload(&self) -> Option<&'img [u8]> {
        if self.is_dir() || self.payload.is_empty() {
            None
        } else {
            Some(self.payload)
        }
    }

    /// Parses the directory entry table of a directory inode.
    pub fn dir(&self) -> Result<Directory<'img>, ImageError> {
        if !self.is_dir() {
            return Err(ImageError::NotADirectory);
        }
        Directory::parse(self.payload)
    }

    /// The digest of the backing content, if recorded: either stored in the
    /// record, or derived from the payload pathname when the derive flag is
    /// set.
    pub fn digest(&self) -> Result<Option<Digest>, ImageError> {
        if let Some(digest) = self.data.digest {
            Ok(Some(digest))
        } else if self.data.has(format::FLAG_DIGEST_FROM_PAYLOAD) {
            Ok(Some(Digest::from_payload(self.payload().unwrap_or(&[]))?))
        } else {
            Ok(None)
        }
    }
}

/// A parsed directory entry table.  Entries are sorted by name bytes.
pub struct Directory<'img> {
    dentries: &'img [DirentHeader],
    names: &'img [u8],
    /// Start of each entry's name in `names`, plus one final end offset.
    name_offsets: Vec<usize>,
}

impl<'img> Directory<'img> {
    fn parse(payload: &'img [u8]) -> Result<Self, ImageError> {
        // an empty directory stores no table at all
        if payload.is_empty() {
            return Ok(Self {
                dentries: &[],
                names: &[],
                name_offsets: vec![0],
            });
        }

        let (header, rest) =
            DirHeader::ref_from_prefix(payload).map_err(|_| ImageError::BadDirectory)?;
        let count = header.n_dentries.get() as usize;
        let (dentries, names) = Array::<DirentHeader>::ref_from_prefix_with_elems(rest, count)
            .map_err(|_| ImageError::BadDirectory)?;
        let dentries = &dentries.0;

        let mut name_offsets = Vec::with_capacity(count + 1);
        let mut offset = 0usize;
        for dentry in dentries {
            name_offsets.push(offset);
            offset += dentry.name_len.get() as usize;
        }
        name_offsets.push(offset);
        if offset != names.len() {
            return Err(ImageError::BadDirectory);
        }

        Ok(Self {
            dentries,
            names,
            name_offsets,
        })
    }

    pub fn len(&self) -> usize {
        self.dentries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dentries.is_empty()
    }

    fn name(&self, i: usize) -> &'img [u8] {
        &self.names[self.name_offsets[i]..self.name_offsets[i + 1]]
    }

    pub fn entry(&self, i: usize) -> Option<DirEntry<'img>> {
        let dentry = self.dentries.get(i)?;
        Some(DirEntry {
            name: self.name(i),
            inode_index: dentry.inode_index.get(),
            d_type: dentry.d_type,
        })
    }

    /// Finds an entry's inode index by name with a binary search.  A
    /// missing name is simply `None`; names longer than the format allows
    /// cannot exist, so they are not found either.
    pub fn lookup(&self, name: &OsStr) -> Option<u64> {
        let name = name.as_bytes();
        if name.len() > MAX_NAME_LEN {
            return None;
        }

        let mut lo = 0;
        let mut hi = self.dentries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.name(mid).cmp(name) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(self.dentries[mid].inode_index.get()),
            }
        }
        None
    }

    /// Iterates entries starting at position `pos`, so enumeration can be
    /// resumed from a cursor the caller kept.
    pub fn entries_from(&self, pos: usize) -> Entries<'img, '_> {
        Entries { dir: self, pos }
    }

    pub fn entries(&self) -> Entries<'img, '_> {
        self.entries_from(0)
    }
}

pub struct Entries<'img, 'dir> {
    dir: &'dir Directory<'img>,
    pos: usize,
}

impl<'img> Iterator for Entries<'img, '_> {
    type Item = DirEntry<'img>;

    fn next(&mut self) -> Option<DirEntry<'img>> {
        let entry = self.dir.entry(self.pos)?;
        self.pos += 1;
        Some(entry)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct DirEntry<'img> {
    pub name: &'img [u8],
    pub inode_index: u64,
    pub d_type: u8,
}

/// A parsed extended attribute block.
pub struct Xattrs<'img> {
    entries: &'img [XattrEntry],
    /// Concatenated (name, value) pairs, in entry order.
    data: &'img [u8],
}

impl<'img> Xattrs<'img> {
    fn empty() -> Self {
        Self {
            entries: &[],
            data: &[],
        }
    }

    fn parse(block: &'img [u8]) -> Result<Self, ImageError> {
        let (header, rest) =
            XattrHeader::ref_from_prefix(block).map_err(|_| ImageError::BadXattrs)?;
        let count = header.n_attrs.get() as usize;
        let (entries, data) = Array::<XattrEntry>::ref_from_prefix_with_elems(rest, count)
            .map_err(|_| ImageError::BadXattrs)?;
        let entries = &entries.0;

        let total: usize = entries
            .iter()
            .map(|e| e.key_len.get() as usize + e.value_len.get() as usize)
            .sum();
        if total != data.len() {
            return Err(ImageError::BadXattrs);
        }

        Ok(Self { entries, data })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> XattrIter<'img> {
        XattrIter {
            entries: self.entries.iter(),
            data: self.data,
            offset: 0,
        }
    }

    /// Fetches a value by exact name.  Blocks are small, so this is a
    /// linear scan.
    pub fn get(&self, name: &[u8]) -> Option<&'img [u8]> {
        self.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

pub struct XattrIter<'img> {
    entries: std::slice::Iter<'img, XattrEntry>,
    data: &'img [u8],
    offset: usize,
}

impl<'img> Iterator for XattrIter<'img> {
    type Item = (&'img [u8], &'img [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        let key_len = entry.key_len.get() as usize;
        let value_len = entry.value_len.get() as usize;
        // parse() verified the lengths cover `data` exactly
        let name = &self.data[self.offset..self.offset + key_len];
        let value = &self.data[self.offset + key_len..self.offset + key_len + value_len];
        self.offset += key_len + value_len;
        Some((name, value))
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;
    use zerocopy::IntoBytes;

    use super::*;
    use crate::cfs::writer::mkfs_cfs;
    use crate::tree::{FileSystem, Stat, S_IFDIR};

    fn minimal_image() -> Box<[u8]> {
        let fs = FileSystem::new(Stat {
            st_mode: S_IFDIR | 0o755,
            ..Stat::default()
        })
        .unwrap();
        mkfs_cfs(&fs).unwrap()
    }

    #[test]
    fn test_open_rejects_garbage() {
        assert!(matches!(Image::open(b""), Err(ImageError::Truncated)));
        assert!(matches!(
            Image::open(&[0; format::HEADER_SIZE - 1]),
            Err(ImageError::Truncated)
        ));
        assert!(matches!(
            Image::open(&[0; format::HEADER_SIZE]),
            Err(ImageError::BadMagic)
        ));
    }

    #[test]
    fn test_open_rejects_wrong_magic_and_version() {
        let image = minimal_image();

        let mut flipped = image.clone();
        flipped[4] ^= 0xff; // inside the magic field
        assert!(matches!(Image::open(&flipped), Err(ImageError::BadMagic)));

        let mut versioned = image.clone();
        versioned[0] = 99;
        assert!(matches!(
            Image::open(&versioned),
            Err(ImageError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_open_rejects_bad_offsets() {
        let image = minimal_image();

        // data_offset pointing past the end
        let mut oversized = image.clone().into_vec();
        let header = Header {
            version: format::VERSION,
            magic: format::MAGIC,
            data_offset: (image.len() as u64 + 1).into(),
            root_inode: 0.into(),
            ..Default::default()
        };
        oversized[..format::HEADER_SIZE].copy_from_slice(header.as_bytes());
        assert!(matches!(
            Image::open(&oversized),
            Err(ImageError::OutOfRange)
        ));

        // data_offset inside the header
        let mut inverted = image.clone().into_vec();
        let header = Header {
            version: format::VERSION,
            magic: format::MAGIC,
            data_offset: 8.into(),
            root_inode: 0.into(),
            ..Default::default()
        };
        inverted[..format::HEADER_SIZE].copy_from_slice(header.as_bytes());
        assert!(matches!(Image::open(&inverted), Err(ImageError::OutOfRange)));

        // root inode index outside the inode section
        let mut lost_root = image.clone().into_vec();
        let data_offset = u64::from_le_bytes(lost_root[8..16].try_into().unwrap());
        let header = Header {
            version: format::VERSION,
            magic: format::MAGIC,
            data_offset: data_offset.into(),
            root_inode: (1u64 << 40).into(),
            ..Default::default()
        };
        lost_root[..format::HEADER_SIZE].copy_from_slice(header.as_bytes());
        assert!(matches!(
            Image::open(&lost_root),
            Err(ImageError::OutOfRange)
        ));
    }

    #[test]
    fn test_invalid_inode_index() {
        let image = minimal_image();
        let image = Image::open(&image).unwrap();

        // unaligned
        assert!(matches!(
            image.inode(1),
            Err(ImageError::InvalidInode(1))
        ));
        // past the section
        assert!(matches!(
            image.inode(1 << 30),
            Err(ImageError::InvalidInode(..))
        ));
    }

    #[test]
    fn test_empty_root_directory() {
        let image = minimal_image();
        let image = Image::open(&image).unwrap();

        assert_eq!(image.root_index(), 0);
        let root = image.root().unwrap();
        assert!(root.is_dir());
        assert!(root.payload().is_none());

        let dir = root.dir().unwrap();
        assert!(dir.is_empty());
        assert_eq!(dir.lookup(OsStr::new("anything")), None);
        assert_eq!(dir.entries().count(), 0);
    }

    #[test]
    fn test_malformed_xattr_block() {
        // count promises more entries than the block holds
        let mut block = vec![];
        block.extend_from_slice(XattrHeader { n_attrs: 2.into() }.as_bytes());
        block.extend_from_slice(
            XattrEntry {
                key_len: 1.into(),
                value_len: 1.into(),
            }
            .as_bytes(),
        );
        assert!(matches!(
            Xattrs::parse(&block),
            Err(ImageError::BadXattrs)
        ));

        // entry lengths disagree with the data that follows
        let mut block = vec![];
        block.extend_from_slice(XattrHeader { n_attrs: 1.into() }.as_bytes());
        block.extend_from_slice(
            XattrEntry {
                key_len: 4.into(),
                value_len: 4.into(),
            }
            .as_bytes(),
        );
        block.extend_from_slice(b"ab");
        assert!(matches!(
            Xattrs::parse(&block),
            Err(ImageError::BadXattrs)
        ));
    }

    #[test]
    fn test_malformed_directory_table() {
        // count promises more dentries than the payload holds
        let mut payload = vec![];
        payload.extend_from_slice(
            DirHeader {
                n_dentries: 3.into(),
            }
            .as_bytes(),
        );
        payload.extend_from_slice(&[0; size_of::<DirentHeader>()]);
        assert!(matches!(
            Directory::parse(&payload),
            Err(ImageError::BadDirectory)
        ));

        // name lengths disagree with the name area
        let mut payload = vec![];
        payload.extend_from_slice(
            DirHeader {
                n_dentries: 1.into(),
            }
            .as_bytes(),
        );
        payload.extend_from_slice(
            DirentHeader {
                inode_index: 0.into(),
                name_len: 5.into(),
                d_type: 8,
                pad: 0,
            }
            .as_bytes(),
        );
        payload.extend_from_slice(b"abc");
        assert!(matches!(
            Directory::parse(&payload),
            Err(ImageError::BadDirectory)
        ));
    }
}
