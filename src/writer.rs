//! Image serialization: the shared tree linearizer and format dispatch.
//!
//! Both image formats start from the same [`Layout`]: a breadth-first
//! ordering of the tree that fixes every inode's index before a single byte
//! is written.  The format-specific encoders live in [`crate::cfs`] and
//! [`crate::erofs`] and plug in through [`ImageFormat`].

use std::collections::VecDeque;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;

use thiserror::Error;
use zerocopy::{Immutable, IntoBytes};

use crate::digest::{Digest, DigestError};
use crate::tree::{FileSystem, Node, NodeId, TreeError};

/// Errors from serializing a tree.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("Bad digest: {0}")]
    Digest(#[from] DigestError),
    #[error("Digest requested from payload, but the node has no payload")]
    MissingPayload,
    #[error("{0} does not fit in its on-disk field")]
    FieldOverflow(&'static str),
    #[error("Too many inodes for the image format")]
    TooManyInodes,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The result of linearizing a tree: a stable breadth-first ordering of all
/// reachable nodes, plus the quantities that need the whole tree in view.
pub struct Layout {
    /// The canonical node of each inode, in image order.  The root is
    /// always first.
    pub order: Vec<NodeId>,
    index: Vec<Option<u32>>,
    nlink: Vec<u32>,
    /// The smallest modification time of any reachable node, as
    /// (seconds, nanoseconds).  The EROFS encoder stores this as the
    /// superblock build time.
    pub min_mtime: (i64, u32),
}

impl Layout {
    /// Walks the tree breadth-first and assigns inode indices.
    ///
    /// The root gets index 0.  Each directory's children are visited in
    /// insertion order; hard-link aliases resolve to their canonical node
    /// and reuse its index; every newly seen node gets the next sequential
    /// index.  All nodes at depth N are numbered before any node at depth
    /// N+1.
    ///
    /// Link counts are computed here and only here: a directory counts
    /// `2 + subdirectories`, a leaf counts the directory entries that
    /// reference it.
    pub fn compute(fs: &FileSystem) -> Result<Self, WriteError> {
        let root = FileSystem::ROOT;
        let root_stat = &fs.node(root).stat;

        let mut index: Vec<Option<u32>> = vec![None; fs.len()];
        let mut order = vec![root];
        let mut nlink = vec![2];
        let mut min_mtime = (root_stat.st_mtim_sec, root_stat.st_mtim_nsec);

        index[root.0 as usize] = Some(0);

        let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();
        queue.push_back((root, 0));

        while let Some((dir_id, me)) = queue.pop_front() {
            for (_name, child) in fs.node(dir_id).children() {
                let canonical = fs.resolve(child)?;
                let node = fs.node(canonical);
                let is_dir = node.is_dir();

                let idx = match index[canonical.0 as usize] {
                    Some(idx) => idx as usize,
                    None => {
                        let idx = order.len();
                        index[canonical.0 as usize] = Some(idx as u32);
                        order.push(canonical);
                        nlink.push(if is_dir { 2 } else { 0 });
                        let mtime = (node.stat.st_mtim_sec, node.stat.st_mtim_nsec);
                        min_mtime = min_mtime.min(mtime);
                        if is_dir {
                            queue.push_back((canonical, idx));
                        }
                        idx
                    }
                };

                if is_dir {
                    nlink[me] += 1;
                } else {
                    nlink[idx] += 1;
                }
            }
        }

        Ok(Self {
            order,
            index,
            nlink,
            min_mtime,
        })
    }

    pub fn num_inodes(&self) -> usize {
        self.order.len()
    }

    /// The image-order index of a canonical node.  Resolve aliases first.
    pub(crate) fn inode_index(&self, id: NodeId) -> u32 {
        self.index[id.0 as usize].expect("node was not reached during linearization")
    }

    /// The computed link count of the inode at the given image-order index.
    pub fn nlink(&self, inode: usize) -> u32 {
        self.nlink[inode]
    }
}

/// A node's effective digest: explicit if set, otherwise derived from the
/// payload when the derive flag is on.
pub(crate) fn effective_digest(node: &Node) -> Result<Option<Digest>, WriteError> {
    if let Some(digest) = node.digest() {
        Ok(Some(*digest))
    } else if node.digest_from_payload() {
        let payload = node.payload().ok_or(WriteError::MissingPayload)?;
        Ok(Some(Digest::from_payload(payload.as_bytes())?))
    } else {
        Ok(None)
    }
}

/// A counting writer over the caller's output.
pub(crate) struct Sink<'a> {
    out: &'a mut dyn Write,
    written: u64,
}

impl<'a> Sink<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self { out, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.out.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn write_struct(&mut self, st: impl IntoBytes + Immutable) -> std::io::Result<()> {
        self.write(st.as_bytes())
    }

    /// Writes zero padding up to the next multiple of `alignment`.
    pub fn pad(&mut self, alignment: u64) -> std::io::Result<()> {
        self.zeroes(self.written.next_multiple_of(alignment) - self.written)
    }

    pub fn zeroes(&mut self, mut count: u64) -> std::io::Result<()> {
        const ZEROES: [u8; 64] = [0; 64];
        while count > 0 {
            let n = count.min(ZEROES.len() as u64) as usize;
            self.write(&ZEROES[..n])?;
            count -= n as u64;
        }
        Ok(())
    }
}

/// A serialization format for metadata images.
pub trait ImageFormat {
    /// Serializes a linearized tree, returning the number of bytes written.
    fn write_image(
        &self,
        fs: &FileSystem,
        layout: &Layout,
        out: &mut dyn Write,
    ) -> Result<u64, WriteError>;
}

/// Linearizes `fs` and serializes it with the given format into `out`,
/// returning the number of bytes written.
pub fn write_image(
    fs: &FileSystem,
    format: &dyn ImageFormat,
    out: &mut dyn Write,
) -> Result<u64, WriteError> {
    let layout = Layout::compute(fs)?;
    format.write_image(fs, &layout, out)
}

#[cfg(test)]
mod test {
    use std::ffi::OsStr;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::tree::{Stat, S_IFDIR, S_IFREG};

    fn dir_stat(mtime: i64) -> Stat {
        Stat {
            st_mode: S_IFDIR | 0o755,
            st_mtim_sec: mtime,
            ..Stat::default()
        }
    }

    fn file_stat(mtime: i64) -> Stat {
        Stat {
            st_mode: S_IFREG | 0o644,
            st_mtim_sec: mtime,
            ..Stat::default()
        }
    }

    fn add(fs: &mut FileSystem, parent: NodeId, name: &str, stat: Stat) -> NodeId {
        let id = fs.new_node(stat).unwrap();
        fs.add_child(parent, OsStr::new(name), id).unwrap();
        id
    }

    #[test]
    fn test_breadth_first_order() {
        // /
        // ├── a/
        // │   ├── b/
        // │   │   └── file1
        // │   └── file2
        // └── x/
        //     └── y/
        //         └── file3
        let mut fs = FileSystem::new(dir_stat(100)).unwrap();
        let root = FileSystem::ROOT;
        let a = add(&mut fs, root, "a", dir_stat(50));
        let b = add(&mut fs, a, "b", dir_stat(70));
        let file1 = add(&mut fs, b, "file1", file_stat(90));
        let file2 = add(&mut fs, a, "file2", file_stat(10));
        let x = add(&mut fs, root, "x", dir_stat(60));
        let y = add(&mut fs, x, "y", dir_stat(80));
        let file3 = add(&mut fs, y, "file3", file_stat(40));

        let layout = Layout::compute(&fs).unwrap();
        assert_eq!(layout.order, vec![root, a, x, b, file2, y, file1, file3]);
        assert_eq!(layout.num_inodes(), 8);
        assert_eq!(layout.min_mtime, (10, 0));

        assert_eq!(layout.nlink(0), 4); // root: 2 + a + x
        assert_eq!(layout.nlink(1), 3); // a: 2 + b
        assert_eq!(layout.nlink(layout.inode_index(file1) as usize), 1);
    }

    #[test]
    fn test_insertion_order_not_sorted() {
        let mut fs = FileSystem::new(dir_stat(0)).unwrap();
        let z = add(&mut fs, FileSystem::ROOT, "zzz", file_stat(0));
        let a = add(&mut fs, FileSystem::ROOT, "aaa", file_stat(0));

        let layout = Layout::compute(&fs).unwrap();
        // "zzz" was inserted first, so it is numbered first
        assert_eq!(layout.order, vec![FileSystem::ROOT, z, a]);
    }

    #[test]
    fn test_hardlinks_share_an_index() {
        let mut fs = FileSystem::new(dir_stat(0)).unwrap();
        let file = add(&mut fs, FileSystem::ROOT, "file", file_stat(0));
        let alias = fs.new_node(file_stat(0)).unwrap();
        fs.make_hardlink(alias, file).unwrap();
        fs.add_child(FileSystem::ROOT, OsStr::new("link"), alias)
            .unwrap();

        let layout = Layout::compute(&fs).unwrap();
        assert_eq!(layout.num_inodes(), 2); // root + one file
        assert_eq!(layout.inode_index(file), 1);
        assert_eq!(layout.nlink(1), 2); // two dentries reference it
    }

    #[test]
    fn test_min_mtime_includes_nsec() {
        let mut fs = FileSystem::new(dir_stat(5)).unwrap();
        let mut stat = file_stat(5);
        stat.st_mtim_nsec = 999;
        add(&mut fs, FileSystem::ROOT, "f", stat);

        let layout = Layout::compute(&fs).unwrap();
        assert_eq!(layout.min_mtime, (5, 0));

        let mut fs = FileSystem::new(dir_stat(5)).unwrap();
        let mut stat = file_stat(4);
        stat.st_mtim_nsec = 999;
        add(&mut fs, FileSystem::ROOT, "f", stat);

        let layout = Layout::compute(&fs).unwrap();
        assert_eq!(layout.min_mtime, (4, 999));
    }

    #[test]
    fn test_detached_nodes_are_not_numbered() {
        let mut fs = FileSystem::new(dir_stat(0)).unwrap();
        fs.new_node(file_stat(0)).unwrap(); // never linked

        let layout = Layout::compute(&fs).unwrap();
        assert_eq!(layout.num_inodes(), 1);
    }
}
