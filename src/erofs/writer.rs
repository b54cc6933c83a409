//! EROFS-compatible image generation.
//!
//! The image is produced in two passes over the same structure: the first
//! pass only measures, recording the offset of every inode, shared xattr
//! and directory block, and the second pass writes the actual bytes using
//! the offsets the first pass recorded.

use std::io::Write;
use std::os::unix::ffi::OsStrExt;

use log::trace;
use xxhash_rust::xxh32::xxh32;
use zerocopy::{Immutable, IntoBytes};

use crate::dedup::DedupIndex;
use crate::erofs::composefs::OverlayMetacopy;
use crate::erofs::format;
use crate::tree::{self, FileSystem, Stat};
use crate::writer::{effective_digest, ImageFormat, Layout, WriteError};

#[derive(Clone, Copy, Debug)]
enum Offset {
    Header,
    Superblock,
    Inode,
    XAttr,
    Block,
    End,
}

/// Offsets recorded by the measuring pass, indexed by type and ordinal.
#[derive(Default)]
struct Offsets {
    offset_types: Vec<usize>,
    offsets: Vec<usize>,
}

impl Offsets {
    fn note(&mut self, offset_type: Offset, offset: usize) {
        while self.offset_types.len() <= offset_type as usize {
            self.offset_types.push(self.offsets.len());
        }
        assert_eq!(self.offset_types.len(), offset_type as usize + 1);

        trace!(
            "{:?} #{} @{}",
            offset_type,
            self.offsets.len() - self.offset_types[offset_type as usize],
            offset
        );
        self.offsets.push(offset);
    }

    fn get(&self, offset_type: Offset, idx: usize) -> usize {
        let start = self.offset_types[offset_type as usize];
        self.offsets[start + idx]
    }
}

trait Output {
    fn note_offset(&mut self, offset_type: Offset);
    fn get(&self, offset_type: Offset, idx: usize) -> usize;
    fn write(&mut self, data: &[u8]);
    fn pad(&mut self, alignment: usize);
    fn len(&self) -> usize;

    fn get_div(&self, offset_type: Offset, idx: usize, div: usize) -> usize {
        let offset = self.get(offset_type, idx);
        assert_eq!(offset % div, 0);
        offset / div
    }

    fn get_nid(&self, idx: usize) -> u64 {
        self.get_div(Offset::Inode, idx, 32) as u64
    }

    fn get_xattr(&self, idx: usize) -> u32 {
        self.get_div(Offset::XAttr, idx, 4).try_into().unwrap()
    }

    fn write_struct(&mut self, st: impl IntoBytes + Immutable) {
        self.write(st.as_bytes());
    }
}

#[derive(Default)]
struct FirstPass {
    offset: usize,
    offsets: Offsets,
}

impl Output for FirstPass {
    fn note_offset(&mut self, offset_type: Offset) {
        self.offsets.note(offset_type, self.offset);
    }

    fn get(&self, _: Offset, _: usize) -> usize {
        0 // offsets are unknown in the measuring pass
    }

    fn write(&mut self, data: &[u8]) {
        self.offset += data.len();
    }

    fn pad(&mut self, alignment: usize) {
        self.offset = self.offset.next_multiple_of(alignment);
    }

    fn len(&self) -> usize {
        self.offset
    }
}

struct SecondPass {
    output: Vec<u8>,
    offsets: Offsets,
}

impl Output for SecondPass {
    fn note_offset(&mut self, _offset_type: Offset) {
        /* no-op */
    }

    fn get(&self, offset_type: Offset, idx: usize) -> usize {
        self.offsets.get(offset_type, idx)
    }

    fn write(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
    }

    fn pad(&mut self, alignment: usize) {
        self.output
            .resize(self.output.len().next_multiple_of(alignment), 0);
    }

    fn len(&self) -> usize {
        self.output.len()
    }
}

/// One extended attribute, with its name split into a well-known prefix
/// index and the remaining suffix.
#[derive(Clone, PartialEq, Eq)]
struct XAttr {
    prefix: u8,
    suffix: Box<[u8]>,
    value: Box<[u8]>,
}

impl XAttr {
    fn full_key(&self) -> Vec<u8> {
        let prefix = format::XATTR_PREFIXES[self.prefix as usize];
        let mut key = Vec::with_capacity(prefix.len() + self.suffix.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(&self.suffix);
        key
    }

    /// An unambiguous byte encoding of (name, value) for the dedup index.
    fn dedup_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(3 + self.suffix.len() + self.value.len());
        key.push(self.prefix);
        key.extend_from_slice(&(self.suffix.len() as u16).to_le_bytes());
        key.extend_from_slice(&self.suffix);
        key.extend_from_slice(&self.value);
        key
    }

    fn write(&self, output: &mut impl Output) {
        output.write_struct(format::XAttrHeader {
            name_len: self.suffix.len() as u8,
            name_index: self.prefix,
            value_size: (self.value.len() as u16).into(),
        });
        output.write(&self.suffix);
        output.write(&self.value);
        output.pad(4);
    }
}

impl PartialOrd for XAttr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for XAttr {
    // Sorted by full key name, then by value.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.full_key().cmp(&other.full_key()) {
            std::cmp::Ordering::Equal => self.value.cmp(&other.value),
            ord => ord,
        }
    }
}

#[derive(Default)]
struct InodeXAttrs {
    shared: Vec<usize>,
    local: Vec<XAttr>,
    filter: u32,
}

impl InodeXAttrs {
    // The tree already bounds user-set xattrs, but synthesized values (the
    // overlayfs redirect embeds the backing path) can be anything, and the
    // on-disk size field is 16 bits.
    fn add(&mut self, name: &[u8], value: &[u8]) -> Result<(), WriteError> {
        if value.len() > u16::MAX as usize {
            return Err(WriteError::FieldOverflow("xattr value"));
        }
        for (idx, prefix) in format::XATTR_PREFIXES.iter().enumerate().rev() {
            if let Some(suffix) = name.strip_prefix(*prefix) {
                self.filter |= 1 << (xxh32(suffix, format::XATTR_FILTER_SEED + idx as u32) % 32);
                self.local.push(XAttr {
                    prefix: idx as u8,
                    suffix: Box::from(suffix),
                    value: Box::from(value),
                });
                return Ok(());
            }
        }
        unreachable!(); // worst case: we matched the empty prefix (0)
    }

    fn write(&self, output: &mut impl Output) {
        if self.filter != 0 {
            trace!("  write xattrs block");
            output.write_struct(format::InodeXAttrHeader {
                name_filter: (!self.filter).into(),
                shared_count: self.shared.len() as u8,
                ..Default::default()
            });
            for idx in &self.shared {
                trace!("    shared {} @{}", idx, output.len());
                output.write(&output.get_xattr(*idx).to_le_bytes());
            }
            // local xattrs were sorted by share_xattrs()
            for attr in &self.local {
                trace!("    local @{}", output.len());
                attr.write(output);
            }
        }
        // our alignment is equal to xattr alignment: no need to pad
    }

    /// The encoded size of the inline xattr area, measured by a dry run.
    fn size(&self) -> usize {
        let mut sizer = FirstPass::default();
        self.write(&mut sizer);
        sizer.offset
    }
}

struct DirEnt<'a> {
    name: &'a [u8],
    inode: usize,
    file_type: format::FileType,
}

#[derive(Default)]
struct Directory<'a> {
    blocks: Box<[Box<[DirEnt<'a>]>]>,
    inline: Box<[DirEnt<'a>]>,
    size: u64,
}

impl<'a> Directory<'a> {
    fn from_entries(entries: Vec<DirEnt<'a>>) -> Self {
        let mut blocks = vec![];
        let mut rest = vec![];
        let mut n_bytes = 0u64;

        trace!("Directory with {} items", entries.len());

        // The content of the directory is fixed at this point so we may as
        // well split it into blocks.  This lets us avoid measuring and
        // re-measuring.
        for entry in entries.into_iter() {
            let entry_size =
                (size_of::<format::DirectoryEntryHeader>() + entry.name.len()) as u64;

            n_bytes += entry_size;
            if n_bytes <= format::BLOCK_SIZE as u64 {
                rest.push(entry);
            } else {
                // It won't fit, so the existing entries become a full block.
                trace!("    block {}", rest.len());
                blocks.push(rest.into_boxed_slice());
                rest = vec![entry];
                n_bytes = entry_size;
            }
        }

        // Don't try to store more than 2048 bytes of tail data
        if n_bytes > 2048 {
            blocks.push(rest.into_boxed_slice());
            rest = vec![];
            n_bytes = 0;
        }

        let size = (format::BLOCK_SIZE * blocks.len()) as u64 + n_bytes;
        Self {
            blocks: blocks.into_boxed_slice(),
            inline: rest.into_boxed_slice(),
            size,
        }
    }

    fn write_block(&self, output: &mut impl Output, block: &[DirEnt]) {
        let mut nameofs = size_of::<format::DirectoryEntryHeader>() * block.len();

        for entry in block {
            output.write_struct(format::DirectoryEntryHeader {
                name_offset: (nameofs as u16).into(),
                inode_offset: output.get_nid(entry.inode).into(),
                file_type: entry.file_type.into(),
                ..Default::default()
            });
            nameofs += entry.name.len();
        }

        for entry in block {
            output.write(entry.name);
        }
    }

    fn write_inline(&self, output: &mut impl Output) {
        self.write_block(output, &self.inline);
    }

    fn write_blocks(&self, output: &mut impl Output) {
        for block in &self.blocks {
            assert_eq!(output.len() % format::BLOCK_SIZE, 0);
            self.write_block(output, block);
            output.pad(format::BLOCK_SIZE);
        }
    }

    fn inode_meta(&self, block_offset: usize) -> (format::DataLayout, u32, u64) {
        let block = (block_offset / format::BLOCK_SIZE) as u32;
        let (layout, u) = if self.inline.is_empty() {
            (format::DataLayout::FlatPlain, block)
        } else if !self.blocks.is_empty() {
            (format::DataLayout::FlatInline, block)
        } else {
            (format::DataLayout::FlatInline, 0)
        };
        (layout, u, self.size)
    }
}

enum InodeContent<'a> {
    Directory(Directory<'a>),
    /// Small content stored next to the inode.
    Inline(&'a [u8]),
    /// Backed by an external file of the given size; the data area is a
    /// single null chunk.
    External(u64),
    Device(u32),
    Empty,
}

struct Inode<'a> {
    stat: &'a Stat,
    file_type: format::FileType,
    nlink: u32,
    xattrs: InodeXAttrs,
    content: InodeContent<'a>,
}

impl Inode<'_> {
    fn inode_meta(&self, output: &impl Output, idx: usize) -> (format::DataLayout, u32, u64) {
        match &self.content {
            InodeContent::Directory(dir) => dir.inode_meta(output.get(Offset::Block, idx)),
            InodeContent::Inline(data) => {
                if data.is_empty() {
                    (format::DataLayout::FlatPlain, 0, 0)
                } else {
                    (format::DataLayout::FlatInline, 0, data.len() as u64)
                }
            }
            InodeContent::External(size) => (format::DataLayout::ChunkBased, 31, *size),
            InodeContent::Device(rdev) => (format::DataLayout::FlatPlain, *rdev, 0),
            InodeContent::Empty => (format::DataLayout::FlatPlain, 0, 0),
        }
    }

    fn write_inode(&self, output: &mut impl Output, idx: usize, build_time: (i64, u32)) {
        let (layout, u, size) = self.inode_meta(output, idx);

        // The compact header drops the mtime (the superblock build time
        // applies) and narrows several fields, so it is only usable when
        // everything fits.
        let compact = self.stat.st_uid <= u16::MAX.into()
            && self.stat.st_gid <= u16::MAX.into()
            && self.nlink <= u16::MAX.into()
            && size <= u32::MAX.into()
            && (self.stat.st_mtim_sec, self.stat.st_mtim_nsec) == build_time;
        let header_size = match compact {
            true => size_of::<format::CompactInodeHeader>(),
            false => size_of::<format::ExtendedInodeHeader>(),
        };

        let xattr_size = self.xattrs.size();
        let xattr_icount = match xattr_size {
            0 => 0u16,
            n => (1 + (n - 12) / 4) as u16,
        };

        // The inline part must not overlap a block boundary
        output.pad(32);
        if matches!(layout, format::DataLayout::FlatInline) {
            let block_size = format::BLOCK_SIZE as u64;
            let inline_start = output.len() as u64 + (header_size + xattr_size) as u64;
            let end_of_metadata = inline_start - 1;
            let inline_end = inline_start + (size % block_size);
            if end_of_metadata / block_size != inline_end / block_size {
                // Add padding so that the inline data starts close to a
                // fresh block boundary, while keeping inode alignment.
                let pad_size = (block_size - end_of_metadata % block_size) as usize;
                trace!("added pad {pad_size}");
                output.write(&vec![0; pad_size]);
                output.pad(32);
            }
        }

        output.note_offset(Offset::Inode);
        trace!(
            "write inode {idx} nid {} {:?} icount{xattr_icount} @{}",
            output.len() / 32,
            self.file_type,
            output.len()
        );

        let ino = (output.len() / 32) as u32;
        let mode = format::ModeField((self.stat.st_mode as u16).into());
        if compact {
            output.write_struct(format::CompactInodeHeader {
                format: format::InodeLayout::Compact | layout,
                xattr_icount: xattr_icount.into(),
                mode,
                nlink: (self.nlink as u16).into(),
                size: (size as u32).into(),
                u: u.into(),
                ino: ino.into(),
                uid: (self.stat.st_uid as u16).into(),
                gid: (self.stat.st_gid as u16).into(),
                ..Default::default()
            });
        } else {
            output.write_struct(format::ExtendedInodeHeader {
                format: format::InodeLayout::Extended | layout,
                xattr_icount: xattr_icount.into(),
                mode,
                size: size.into(),
                u: u.into(),
                ino: ino.into(),
                uid: self.stat.st_uid.into(),
                gid: self.stat.st_gid.into(),
                mtime: (self.stat.st_mtim_sec as u64).into(),
                mtime_nsec: self.stat.st_mtim_nsec.into(),
                nlink: self.nlink.into(),
                ..Default::default()
            });
        }

        self.xattrs.write(output);

        match &self.content {
            InodeContent::Directory(dir) => dir.write_inline(output),
            InodeContent::Inline(data) => output.write(data),
            InodeContent::External(..) => output.write(b"\xff\xff\xff\xff"), // null chunk
            InodeContent::Device(..) | InodeContent::Empty => {}
        }

        output.pad(32);
    }

    fn write_blocks(&self, output: &mut impl Output) {
        if let InodeContent::Directory(dir) = &self.content {
            dir.write_blocks(output);
        }
    }
}

fn erofs_file_type(file_type: tree::FileType) -> format::FileType {
    match file_type {
        tree::FileType::Regular => format::FileType::RegularFile,
        tree::FileType::Directory => format::FileType::Directory,
        tree::FileType::Symlink => format::FileType::Symlink,
        tree::FileType::CharacterDevice => format::FileType::CharacterDevice,
        tree::FileType::BlockDevice => format::FileType::BlockDevice,
        tree::FileType::Fifo => format::FileType::Fifo,
        tree::FileType::Socket => format::FileType::Socket,
    }
}

fn insert_sorted<'a>(
    entries: &mut Vec<DirEnt<'a>>,
    name: &'a [u8],
    inode: usize,
    file_type: format::FileType,
) {
    let point = entries.partition_point(|e| e.name < name);
    entries.insert(
        point,
        DirEnt {
            name,
            inode,
            file_type,
        },
    );
}

/// Builds the flat inode list in image order, synthesizing the overlayfs
/// xattrs and the `.`/`..` directory entries along the way.
fn collect<'a>(fs: &'a FileSystem, layout: &Layout) -> Result<Vec<Inode<'a>>, WriteError> {
    let mut inodes = Vec::with_capacity(layout.num_inodes());

    for (idx, &id) in layout.order.iter().enumerate() {
        let node = fs.node(id);
        let file_type = node.file_type()?;
        let mut xattrs = InodeXAttrs::default();

        let content = match file_type {
            tree::FileType::Directory => InodeContent::Directory(Directory::default()),
            tree::FileType::Regular => {
                if let Some(payload) = node.payload() {
                    // Externally backed: overlayfs finds the backing file
                    // through the redirect, and the metacopy digest lets it
                    // verify what it finds.
                    if let Some(digest) = effective_digest(node)? {
                        let metacopy = OverlayMetacopy::new(digest);
                        xattrs.add(b"trusted.overlay.metacopy", metacopy.as_bytes())?;
                    }
                    let redirect = [b"/" as &[u8], payload.as_bytes()].concat();
                    xattrs.add(b"trusted.overlay.redirect", &redirect)?;
                    InodeContent::External(node.stat.st_size)
                } else if let Some(data) = node.content() {
                    if data.len() >= format::BLOCK_SIZE {
                        return Err(WriteError::FieldOverflow("inline file content"));
                    }
                    InodeContent::Inline(data)
                } else {
                    InodeContent::Empty
                }
            }
            tree::FileType::Symlink => {
                let target = node.payload().ok_or(WriteError::MissingPayload)?;
                InodeContent::Inline(target.as_bytes())
            }
            tree::FileType::CharacterDevice | tree::FileType::BlockDevice => {
                let rdev = u32::try_from(node.stat.st_rdev)
                    .map_err(|_| WriteError::FieldOverflow("device number"))?;
                InodeContent::Device(rdev)
            }
            tree::FileType::Fifo | tree::FileType::Socket => InodeContent::Empty,
        };

        let mut attrs: Vec<(&[u8], &[u8])> = node.xattrs().collect();
        attrs.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in attrs {
            // A real trusted.overlay.* xattr would be interpreted by
            // overlayfs itself, so it gets escaped on the way in.
            if let Some(escapee) = name.strip_prefix(b"trusted.overlay." as &[u8]) {
                let escaped = [b"trusted.overlay.overlay." as &[u8], escapee].concat();
                xattrs.add(&escaped, value)?;
            } else {
                xattrs.add(name, value)?;
            }
        }

        inodes.push(Inode {
            stat: &node.stat,
            file_type: erofs_file_type(file_type),
            nlink: layout.nlink(idx),
            xattrs,
            content,
        });
    }

    // Directory content can only be filled in once every child has an
    // image-order index.
    for (idx, &id) in layout.order.iter().enumerate() {
        let node = fs.node(id);
        if !node.is_dir() {
            continue;
        }

        let mut entries = vec![];
        for (name, child) in node.children() {
            let canonical = fs.resolve(child)?;
            let child_idx = layout.inode_index(canonical) as usize;
            insert_sorted(
                &mut entries,
                name.as_bytes(),
                child_idx,
                inodes[child_idx].file_type,
            );
        }

        insert_sorted(&mut entries, b".", idx, format::FileType::Directory);
        let parent = match node.parent() {
            Some(parent) => layout.inode_index(parent) as usize,
            None => idx, // the root is its own parent
        };
        insert_sorted(&mut entries, b"..", parent, format::FileType::Directory);

        inodes[idx].content = InodeContent::Directory(Directory::from_entries(entries));
    }

    Ok(inodes)
}

/// Moves (name, value) pairs used by more than one inode out of the inodes
/// and into the shared xattr table.  Table entries are numbered in
/// first-seen image order; each inode's shared references end up sorted by
/// key because the local lists are sorted first.
fn share_xattrs(inodes: &mut [Inode]) -> Result<Vec<XAttr>, WriteError> {
    for inode in inodes.iter_mut() {
        inode.xattrs.local.sort();
    }

    let mut users: DedupIndex<u32> = DedupIndex::new();
    for inode in inodes.iter() {
        for attr in &inode.xattrs.local {
            let key = attr.dedup_key();
            match users.get_mut(&key) {
                Some(count) => *count += 1,
                None => {
                    users.insert(&key, 1);
                }
            }
        }
    }

    let mut table: Vec<XAttr> = vec![];
    let mut slots: DedupIndex<usize> = DedupIndex::new();
    for inode in inodes.iter_mut() {
        let shared = &mut inode.xattrs.shared;
        inode.xattrs.local.retain(|attr| {
            let key = attr.dedup_key();
            if users.get(&key).map_or(true, |count| *count < 2) {
                return true; // keep it local
            }
            let idx = match slots.get(&key) {
                Some(idx) => *idx,
                None => {
                    let idx = table.len();
                    table.push(attr.clone());
                    slots.insert(&key, idx);
                    idx
                }
            };
            shared.push(idx);
            false // converted to a shared reference
        });
        // the per-inode shared reference count is stored in a u8
        if inode.xattrs.shared.len() > u8::MAX as usize {
            return Err(WriteError::FieldOverflow("shared xattr count"));
        }
    }
    Ok(table)
}

fn write_erofs(
    output: &mut impl Output,
    inodes: &[Inode],
    xattrs: &[XAttr],
    build_time: (i64, u32),
) {
    output.note_offset(Offset::Header);
    output.write_struct(format::ComposefsHeader {
        magic: format::COMPOSEFS_MAGIC,
        version: format::VERSION,
        flags: 0.into(),
        composefs_version: format::COMPOSEFS_VERSION,
        ..Default::default()
    });
    output.pad(1024);

    output.note_offset(Offset::Superblock);
    output.write_struct(format::Superblock {
        magic: format::MAGIC_V1,
        blkszbits: format::BLOCK_BITS,
        feature_compat: format::FEATURE_COMPAT_MTIME | format::FEATURE_COMPAT_XATTR_FILTER,
        root_nid: (output.get_nid(0) as u16).into(),
        inos: (inodes.len() as u64).into(),
        build_time: (build_time.0 as u64).into(),
        build_time_nsec: build_time.1.into(),
        blocks: ((output.get(Offset::End, 0) / format::BLOCK_SIZE) as u32).into(),
        ..Default::default()
    });

    // The inode may pad in front of itself, so it notes its own offset
    for (idx, inode) in inodes.iter().enumerate() {
        inode.write_inode(output, idx, build_time);
    }

    for xattr in xattrs {
        output.note_offset(Offset::XAttr);
        xattr.write(output);
    }

    output.pad(format::BLOCK_SIZE);
    for inode in inodes.iter() {
        output.note_offset(Offset::Block);
        inode.write_blocks(output);
    }

    output.note_offset(Offset::End);
}

fn build_image(fs: &FileSystem, layout: &Layout) -> Result<Box<[u8]>, WriteError> {
    let mut inodes = collect(fs, layout)?;
    let xattrs = share_xattrs(&mut inodes)?;

    let mut first_pass = FirstPass::default();
    write_erofs(&mut first_pass, &inodes, &xattrs, layout.min_mtime);

    // The superblock addresses the root by a 16-bit nid
    let root_nid = first_pass.offsets.get(Offset::Inode, 0) / 32;
    if u16::try_from(root_nid).is_err() {
        return Err(WriteError::TooManyInodes);
    }

    let mut second_pass = SecondPass {
        output: vec![],
        offsets: first_pass.offsets,
    };
    write_erofs(&mut second_pass, &inodes, &xattrs, layout.min_mtime);

    Ok(second_pass.output.into_boxed_slice())
}

/// The EROFS-compatible composefs image format.
pub struct ErofsFormat;

impl ImageFormat for ErofsFormat {
    fn write_image(
        &self,
        fs: &FileSystem,
        layout: &Layout,
        out: &mut dyn Write,
    ) -> Result<u64, WriteError> {
        let image = build_image(fs, layout)?;
        out.write_all(&image)?;
        Ok(image.len() as u64)
    }
}

/// Serializes `fs` into an EROFS-compatible image in memory.
pub fn mkfs_erofs(fs: &FileSystem) -> Result<Box<[u8]>, WriteError> {
    let layout = Layout::compute(fs)?;
    build_image(fs, &layout)
}
