//! Streaming encoder for the native image format.
//!
//! Serialization is two phases over the same breadth-first order: a sizing
//! phase that fixes every record's wire index (its byte offset in the inode
//! section) and deduplicates xattr blocks into the variable-data pool, then
//! a forward streaming phase that emits header, records with their inline
//! payloads, and finally the pool.

use std::ffi::OsStr;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;

use log::trace;
use zerocopy::IntoBytes;

use crate::cfs::format::{
    self, DirHeader, DirentHeader, Header, InodeData, VData, XattrEntry, XattrHeader,
};
use crate::dedup::DedupIndex;
use crate::digest::Digest;
use crate::tree::{FileSystem, FileType, Node};
use crate::writer::{ImageFormat, Layout, Sink, WriteError};

/// The native composefs image format.
pub struct CfsFormat;

struct PendingInode {
    data: InodeData,
    /// Byte offset of the record in the inode section.
    wire_index: u64,
}

impl ImageFormat for CfsFormat {
    fn write_image(
        &self,
        fs: &FileSystem,
        layout: &Layout,
        out: &mut dyn Write,
    ) -> Result<u64, WriteError> {
        // Phase 1: assign wire indices and build the variable-data pool.
        let mut xattr_blocks: DedupIndex<VData> = DedupIndex::new();
        let mut vdata_size = 0usize;
        let mut inodes = Vec::with_capacity(layout.num_inodes());
        let mut offset = 0u64;

        for (idx, &id) in layout.order.iter().enumerate() {
            let node = fs.node(id);
            let file_type = node.file_type()?;

            let xattrs = match encode_xattrs(node)? {
                None => VData::default(),
                Some(blob) => match xattr_blocks.get(&blob) {
                    Some(shared) => *shared,
                    None => {
                        let off = u32::try_from(vdata_size)
                            .map_err(|_| WriteError::FieldOverflow("xattr data offset"))?;
                        let vref = VData {
                            off: off.into(),
                            len: (blob.len() as u32).into(),
                        };
                        vdata_size += blob.len().next_multiple_of(format::ALIGNMENT);
                        xattr_blocks.insert(&blob, vref);
                        vref
                    }
                },
            };

            let payload_size = match file_type {
                FileType::Directory => dir_payload_size(node),
                FileType::Regular | FileType::Symlink => {
                    node.payload().map(|p| p.as_bytes().len()).unwrap_or(0)
                }
                _ => 0,
            };
            let payload_length = u32::try_from(payload_size)
                .map_err(|_| WriteError::FieldOverflow("payload length"))?;

            // Only regular files carry a digest.  An explicit digest is
            // stored; the derive-from-payload flag is validated here but
            // stored as a flag only, and the reader derives on access.
            let mut extra_flags = 0;
            let mut digest = None;
            if file_type == FileType::Regular {
                if let Some(d) = node.digest() {
                    digest = Some(*d);
                } else if node.digest_from_payload() {
                    let payload = node.payload().ok_or(WriteError::MissingPayload)?;
                    Digest::from_payload(payload.as_bytes())?;
                    extra_flags = format::FLAG_DIGEST_FROM_PAYLOAD;
                }
            }

            let mut data = InodeData {
                flags: extra_flags,
                payload_length,
                st_mode: node.stat.st_mode,
                st_nlink: layout.nlink(idx),
                st_uid: node.stat.st_uid,
                st_gid: node.stat.st_gid,
                st_rdev: u32::try_from(node.stat.st_rdev)
                    .map_err(|_| WriteError::FieldOverflow("device number"))?,
                st_mtim_sec: node.stat.st_mtim_sec,
                st_mtim_nsec: node.stat.st_mtim_nsec,
                st_size: node.stat.st_size,
                xattrs,
                digest,
            };
            data.compute_flags();

            let record_size = InodeData::encoded_size(data.flags);
            inodes.push(PendingInode {
                data,
                wire_index: offset,
            });
            offset += ((record_size + payload_size).next_multiple_of(format::ALIGNMENT)) as u64;
        }

        // Phase 2: emit.
        let data_offset = format::HEADER_SIZE as u64 + offset;
        let mut sink = Sink::new(out);

        trace!(
            "cfs header: {} inodes, data section @{data_offset}",
            layout.num_inodes()
        );
        sink.write_struct(Header {
            version: format::VERSION,
            magic: format::MAGIC,
            data_offset: data_offset.into(),
            root_inode: inodes[0].wire_index.into(),
            ..Default::default()
        })?;

        let mut record = Vec::new();
        for (idx, &id) in layout.order.iter().enumerate() {
            let node = fs.node(id);
            let pending = &inodes[idx];
            assert_eq!(
                sink.written() - format::HEADER_SIZE as u64,
                pending.wire_index
            );
            trace!("  inode {idx} @{}", pending.wire_index);

            record.clear();
            pending.data.encode_into(&mut record);
            sink.write(&record)?;

            match node.file_type()? {
                FileType::Directory => write_dir_payload(&mut sink, fs, layout, node, &inodes)?,
                FileType::Regular | FileType::Symlink => {
                    if let Some(payload) = node.payload() {
                        sink.write(payload.as_bytes())?;
                    }
                }
                _ => {}
            }
            sink.pad(format::ALIGNMENT as u64)?;
        }

        trace!("  variable data: {} blobs", xattr_blocks.len());
        for (blob, _) in xattr_blocks.iter() {
            sink.write(blob)?;
            sink.pad(format::ALIGNMENT as u64)?;
        }

        Ok(sink.written())
    }
}

/// Serializes `fs` into a native-format image in memory.
pub fn mkfs_cfs(fs: &FileSystem) -> Result<Box<[u8]>, WriteError> {
    let mut image = Vec::new();
    crate::writer::write_image(fs, &CfsFormat, &mut image)?;
    Ok(image.into_boxed_slice())
}

fn dir_payload_size(node: &Node) -> usize {
    let mut names = 0;
    let mut count = 0;
    for (name, _child) in node.children() {
        names += name.as_bytes().len();
        count += 1;
    }
    // an empty directory canonically has no payload at all
    if count == 0 {
        return 0;
    }
    size_of::<DirHeader>() + count * size_of::<DirentHeader>() + names
}

fn write_dir_payload(
    sink: &mut Sink,
    fs: &FileSystem,
    layout: &Layout,
    node: &Node,
    inodes: &[PendingInode],
) -> Result<(), WriteError> {
    let mut entries: Vec<(&OsStr, u64, u8)> = Vec::new();
    for (name, child) in node.children() {
        let canonical = fs.resolve(child)?;
        let idx = layout.inode_index(canonical) as usize;
        let d_type = fs.node(canonical).file_type()?.dt();
        entries.push((name, inodes[idx].wire_index, d_type));
    }
    if entries.is_empty() {
        return Ok(());
    }
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let count = u32::try_from(entries.len())
        .map_err(|_| WriteError::FieldOverflow("directory entry count"))?;
    sink.write_struct(DirHeader {
        n_dentries: count.into(),
    })?;
    for (name, wire_index, d_type) in &entries {
        sink.write_struct(DirentHeader {
            inode_index: (*wire_index).into(),
            name_len: (name.as_bytes().len() as u16).into(),
            d_type: *d_type,
            pad: 0,
        })?;
    }
    for (name, ..) in &entries {
        sink.write(name.as_bytes())?;
    }
    Ok(())
}

/// Encodes a node's xattrs as one block for the variable-data section, or
/// `None` if it has none.  Attributes are sorted by name so that equal sets
/// deduplicate regardless of insertion order.
fn encode_xattrs(node: &Node) -> Result<Option<Vec<u8>>, WriteError> {
    let mut attrs: Vec<(&[u8], &[u8])> = node.xattrs().collect();
    if attrs.is_empty() {
        return Ok(None);
    }
    attrs.sort_by(|a, b| a.0.cmp(b.0));

    let count =
        u16::try_from(attrs.len()).map_err(|_| WriteError::FieldOverflow("xattr count"))?;
    let mut blob = Vec::new();
    blob.extend_from_slice(
        XattrHeader {
            n_attrs: count.into(),
        }
        .as_bytes(),
    );
    for (name, value) in &attrs {
        blob.extend_from_slice(
            XattrEntry {
                key_len: (name.len() as u16).into(),
                value_len: (value.len() as u16).into(),
            }
            .as_bytes(),
        );
    }
    for (name, value) in &attrs {
        blob.extend_from_slice(name);
        blob.extend_from_slice(value);
    }
    Ok(Some(blob))
}
