//! A metadata-only filesystem tree backed by an arena of nodes.
//!
//! [`FileSystem`] owns every node; nodes address each other with [`NodeId`],
//! a plain index into the arena.  Parent links, children, and hard-link
//! aliases are all integers, so there is no reference-counted pointer graph
//! to keep consistent and the whole tree drops in one go.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use thiserror::Error;

use crate::digest::Digest;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Maximum length of a directory entry name or xattr name, in bytes.
pub const MAX_NAME_LEN: usize = 255;
/// Maximum length of an extended attribute value, in bytes.
pub const MAX_XATTR_VALUE_LEN: usize = u16::MAX as usize;
/// Maximum encoded size of one inode's extended attribute block.  The limit
/// comes from the 16-bit size fields used by both image formats.
pub const MAX_XATTR_BLOCK_SIZE: usize = u16::MAX as usize;

const XATTR_BLOCK_HEADER_SIZE: usize = 12;
const XATTR_ENTRY_HEADER_SIZE: usize = 4;

/// Errors from building or mutating a tree.
#[derive(Error, Debug)]
pub enum TreeError {
    /// The mode does not name one of the seven POSIX file types.
    #[error("Invalid file mode 0{0:o}")]
    InvalidMode(u32),
    /// The filename is empty, `.`, `..`, or contains `/` or NUL.
    #[error("Invalid filename {0:?}")]
    InvalidFilename(Box<OsStr>),
    #[error("Filename {0:?} is longer than 255 bytes")]
    NameTooLong(Box<OsStr>),
    #[error("Directory entry {0:?} already exists")]
    Exists(Box<OsStr>),
    #[error("Node is not a directory")]
    NotADirectory,
    #[error("Node is a directory")]
    IsADirectory,
    /// The node already appears in some directory.
    #[error("Node is already linked into the tree")]
    AlreadyLinked,
    #[error("Hard link chain contains a cycle")]
    LinkCycle,
    #[error("Too many nodes")]
    TooManyNodes,
    #[error("Extended attribute name is empty or longer than 255 bytes")]
    XattrNameTooLong,
    #[error("Extended attribute value is larger than 65535 bytes")]
    XattrValueTooLarge,
    #[error("Extended attributes exceed the 16-bit block size limit")]
    XattrBlockTooLarge,
}

/// The seven POSIX file types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Result<Self, TreeError> {
        match mode & S_IFMT {
            S_IFREG => Ok(Self::Regular),
            S_IFDIR => Ok(Self::Directory),
            S_IFLNK => Ok(Self::Symlink),
            S_IFCHR => Ok(Self::CharacterDevice),
            S_IFBLK => Ok(Self::BlockDevice),
            S_IFIFO => Ok(Self::Fifo),
            S_IFSOCK => Ok(Self::Socket),
            _ => Err(TreeError::InvalidMode(mode)),
        }
    }

    /// The `d_type` value used in directory entries, as per getdents(2).
    pub fn dt(self) -> u8 {
        match self {
            Self::Fifo => 1,
            Self::CharacterDevice => 2,
            Self::Directory => 4,
            Self::BlockDevice => 6,
            Self::Regular => 8,
            Self::Symlink => 10,
            Self::Socket => 12,
        }
    }
}

/// File metadata similar to `struct stat` from POSIX.
///
/// There is deliberately no link count here: link counts are recomputed
/// during linearization and never trusted from input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    /// File type bits plus permissions.
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    /// Device number, for character and block devices.
    pub st_rdev: u64,
    /// Size of the backing content, in bytes.
    pub st_size: u64,
    /// Modification time in seconds since the Unix epoch.
    pub st_mtim_sec: i64,
    /// Nanoseconds part of the modification time.
    pub st_mtim_nsec: u32,
}

/// One extended attribute.
#[derive(Clone, Debug)]
pub struct Xattr {
    pub name: Box<[u8]>,
    pub value: Box<[u8]>,
}

/// An index into the node arena of a [`FileSystem`].
///
/// Ids are only meaningful to the arena that created them: handing one to
/// a different `FileSystem` names an arbitrary node there, or panics if it
/// is out of range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

/// A single filesystem node.
#[derive(Debug)]
pub struct Node {
    pub stat: Stat,
    children: Vec<(Box<OsStr>, NodeId)>,
    parent: Option<NodeId>,
    link_to: Option<NodeId>,
    payload: Option<Box<OsStr>>,
    content: Option<Box<[u8]>>,
    xattrs: Vec<Xattr>,
    xattr_size: usize,
    digest: Option<Digest>,
    digest_from_payload: bool,
}

impl Node {
    fn new(stat: Stat) -> Self {
        Self {
            stat,
            children: Vec::new(),
            parent: None,
            link_to: None,
            payload: None,
            content: None,
            xattrs: Vec::new(),
            xattr_size: 0,
            digest: None,
            digest_from_payload: false,
        }
    }

    /// The node's file type.  The mode is validated on node creation, but
    /// `stat` is a public field, so this re-validates.
    pub fn file_type(&self) -> Result<FileType, TreeError> {
        FileType::from_mode(self.stat.st_mode)
    }

    pub fn is_dir(&self) -> bool {
        self.stat.st_mode & S_IFMT == S_IFDIR
    }

    /// Children in insertion order.  The encoders sort where their format
    /// requires it.
    pub fn children(&self) -> impl Iterator<Item = (&OsStr, NodeId)> {
        self.children.iter().map(|(name, child)| (&**name, *child))
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// The hard link alias target, if this node is an alias.
    pub fn link_to(&self) -> Option<NodeId> {
        self.link_to
    }

    /// The type-specific payload: the backing pathname for regular files,
    /// the target for symlinks.
    pub fn payload(&self) -> Option<&OsStr> {
        self.payload.as_deref()
    }

    pub fn set_payload(&mut self, payload: &OsStr) {
        self.payload = Some(Box::from(payload));
    }

    /// Raw inline content.  Only the EROFS encoder stores this; it must
    /// stay small enough to sit next to the inode.
    pub fn content(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }

    pub fn set_content(&mut self, data: &[u8]) {
        self.content = Some(Box::from(data));
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn set_digest(&mut self, digest: Digest) {
        self.digest = Some(digest);
    }

    /// Whether the digest should be derived from the payload pathname.  An
    /// explicitly set digest takes precedence.
    pub fn digest_from_payload(&self) -> bool {
        self.digest_from_payload
    }

    pub fn set_digest_from_payload(&mut self, enable: bool) {
        self.digest_from_payload = enable;
    }

    pub fn xattrs(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.xattrs.iter().map(|x| (&*x.name, &*x.value))
    }

    pub fn get_xattr(&self, name: &[u8]) -> Option<&[u8]> {
        self.xattrs
            .iter()
            .find(|x| &*x.name == name)
            .map(|x| &*x.value)
    }

    fn xattr_entry_size(name_len: usize, value_len: usize) -> usize {
        (XATTR_ENTRY_HEADER_SIZE + name_len + value_len).next_multiple_of(4)
    }

    /// Sets an extended attribute, replacing any existing value under the
    /// same name.  The running encoded size of the xattr block (header plus
    /// 4-aligned entries) must stay within the 16-bit on-disk limit.
    pub fn set_xattr(&mut self, name: &[u8], value: &[u8]) -> Result<(), TreeError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(TreeError::XattrNameTooLong);
        }
        if value.len() > MAX_XATTR_VALUE_LEN {
            return Err(TreeError::XattrValueTooLarge);
        }

        let pos = self.xattrs.iter().position(|x| &*x.name == name);
        let mut size = match self.xattr_size {
            0 => XATTR_BLOCK_HEADER_SIZE,
            n => n,
        };
        if let Some(pos) = pos {
            let old = &self.xattrs[pos];
            size -= Self::xattr_entry_size(old.name.len(), old.value.len());
        }
        size += Self::xattr_entry_size(name.len(), value.len());
        if size > MAX_XATTR_BLOCK_SIZE {
            return Err(TreeError::XattrBlockTooLarge);
        }

        self.xattr_size = size;
        match pos {
            Some(pos) => self.xattrs[pos].value = Box::from(value),
            None => self.xattrs.push(Xattr {
                name: Box::from(name),
                value: Box::from(value),
            }),
        }
        Ok(())
    }
}

/// The arena of nodes making up one tree.  The root directory is created
/// with the filesystem and always has id [`FileSystem::ROOT`].
pub struct FileSystem {
    nodes: Vec<Node>,
}

impl FileSystem {
    /// The id of the root directory.
    pub const ROOT: NodeId = NodeId(0);

    pub fn new(root_stat: Stat) -> Result<Self, TreeError> {
        if FileType::from_mode(root_stat.st_mode)? != FileType::Directory {
            return Err(TreeError::NotADirectory);
        }
        Ok(Self {
            nodes: vec![Node::new(root_stat)],
        })
    }

    /// The number of nodes in the arena, including detached ones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the root always exists
    }

    /// Creates a detached node.  The mode must name a valid file type.
    pub fn new_node(&mut self, stat: Stat) -> Result<NodeId, TreeError> {
        FileType::from_mode(stat.st_mode)?;
        let id = u32::try_from(self.nodes.len()).map_err(|_| TreeError::TooManyNodes)?;
        self.nodes.push(Node::new(stat));
        Ok(NodeId(id))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    fn validate_name(name: &OsStr) -> Result<(), TreeError> {
        let bytes = name.as_bytes();
        if bytes.is_empty()
            || bytes == b"."
            || bytes == b".."
            || bytes.contains(&b'/')
            || bytes.contains(&0)
        {
            return Err(TreeError::InvalidFilename(Box::from(name)));
        }
        if bytes.len() > MAX_NAME_LEN {
            return Err(TreeError::NameTooLong(Box::from(name)));
        }
        Ok(())
    }

    /// Appends `child` to the directory `parent` under `name`.  Sibling
    /// names must be unique; a node can appear in at most one directory.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: &OsStr,
        child: NodeId,
    ) -> Result<(), TreeError> {
        Self::validate_name(name)?;
        if !self.node(parent).is_dir() {
            return Err(TreeError::NotADirectory);
        }
        if self.node(child).parent.is_some() || child == Self::ROOT {
            return Err(TreeError::AlreadyLinked);
        }
        if self
            .node(parent)
            .children
            .iter()
            .any(|(existing, _)| &**existing == name)
        {
            return Err(TreeError::Exists(Box::from(name)));
        }
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.push((Box::from(name), child));
        Ok(())
    }

    /// Turns `node` into a hard link alias of `target`.  Directories cannot
    /// be hard linked, and an alias chain leading back to `node` is
    /// rejected here rather than left for traversal to run into.
    pub fn make_hardlink(&mut self, node: NodeId, target: NodeId) -> Result<(), TreeError> {
        if self.node(node).is_dir() {
            return Err(TreeError::IsADirectory);
        }

        let mut cursor = target;
        for _ in 0..=self.nodes.len() {
            if cursor == node {
                return Err(TreeError::LinkCycle);
            }
            match self.node(cursor).link_to {
                Some(next) => cursor = next,
                None => {
                    if self.node(cursor).is_dir() {
                        return Err(TreeError::IsADirectory);
                    }
                    self.node_mut(node).link_to = Some(target);
                    return Ok(());
                }
            }
        }
        Err(TreeError::LinkCycle)
    }

    /// Follows hard link aliases to the canonical node.  The walk is
    /// bounded by the arena size, so a corrupt chain reports a cycle
    /// instead of looping.
    pub fn resolve(&self, id: NodeId) -> Result<NodeId, TreeError> {
        let mut cursor = id;
        for _ in 0..=self.nodes.len() {
            match self.node(cursor).link_to {
                Some(next) => cursor = next,
                None => return Ok(cursor),
            }
        }
        Err(TreeError::LinkCycle)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn new_fs() -> FileSystem {
        FileSystem::new(Stat {
            st_mode: S_IFDIR | 0o755,
            ..Stat::default()
        })
        .unwrap()
    }

    fn file_stat() -> Stat {
        Stat {
            st_mode: S_IFREG | 0o644,
            ..Stat::default()
        }
    }

    #[test]
    fn test_root_must_be_a_directory() {
        assert!(matches!(
            FileSystem::new(file_stat()),
            Err(TreeError::NotADirectory)
        ));
        assert!(matches!(
            FileSystem::new(Stat::default()),
            Err(TreeError::InvalidMode(0))
        ));
    }

    #[test]
    fn test_mode_validation() {
        let mut fs = new_fs();
        assert!(matches!(
            fs.new_node(Stat {
                st_mode: 0o170000,
                ..Stat::default()
            }),
            Err(TreeError::InvalidMode(..))
        ));
        assert!(fs.new_node(file_stat()).is_ok());
    }

    #[test]
    fn test_name_validation() {
        let mut fs = new_fs();
        let file = fs.new_node(file_stat()).unwrap();

        for bad in ["", ".", "..", "a/b", "a\0b"] {
            assert!(matches!(
                fs.add_child(FileSystem::ROOT, OsStr::new(bad), file),
                Err(TreeError::InvalidFilename(..))
            ));
        }

        let long = "x".repeat(256);
        assert!(matches!(
            fs.add_child(FileSystem::ROOT, OsStr::new(&long), file),
            Err(TreeError::NameTooLong(..))
        ));

        let ok = "x".repeat(255);
        fs.add_child(FileSystem::ROOT, OsStr::new(&ok), file)
            .unwrap();
    }

    #[test]
    fn test_duplicate_and_double_link() {
        let mut fs = new_fs();
        let a = fs.new_node(file_stat()).unwrap();
        let b = fs.new_node(file_stat()).unwrap();

        fs.add_child(FileSystem::ROOT, OsStr::new("a"), a).unwrap();
        assert!(matches!(
            fs.add_child(FileSystem::ROOT, OsStr::new("a"), b),
            Err(TreeError::Exists(..))
        ));
        // a node can appear in at most one directory
        assert!(matches!(
            fs.add_child(FileSystem::ROOT, OsStr::new("b"), a),
            Err(TreeError::AlreadyLinked)
        ));
        // non-directory parent
        assert!(matches!(
            fs.add_child(a, OsStr::new("c"), b),
            Err(TreeError::NotADirectory)
        ));
    }

    #[test]
    fn test_hardlinks_and_cycles() {
        let mut fs = new_fs();
        let a = fs.new_node(file_stat()).unwrap();
        let b = fs.new_node(file_stat()).unwrap();
        let c = fs.new_node(file_stat()).unwrap();

        fs.make_hardlink(a, b).unwrap();
        assert_eq!(fs.resolve(a).unwrap(), b);

        // chains resolve through intermediate aliases
        fs.make_hardlink(c, a).unwrap();
        assert_eq!(fs.resolve(c).unwrap(), b);

        // closing the loop is rejected
        assert!(matches!(fs.make_hardlink(b, c), Err(TreeError::LinkCycle)));
        assert!(matches!(fs.make_hardlink(b, a), Err(TreeError::LinkCycle)));
        assert!(matches!(fs.make_hardlink(a, a), Err(TreeError::LinkCycle)));

        // directories cannot be hard linked
        let dir = fs
            .new_node(Stat {
                st_mode: S_IFDIR | 0o755,
                ..Stat::default()
            })
            .unwrap();
        let d = fs.new_node(file_stat()).unwrap();
        assert!(matches!(
            fs.make_hardlink(d, dir),
            Err(TreeError::IsADirectory)
        ));
        assert!(matches!(
            fs.make_hardlink(dir, d),
            Err(TreeError::IsADirectory)
        ));
    }

    #[test]
    fn test_xattr_replacement() {
        let mut fs = new_fs();
        let file = fs.new_node(file_stat()).unwrap();
        let node = fs.node_mut(file);

        node.set_xattr(b"user.a", b"one").unwrap();
        node.set_xattr(b"user.b", b"").unwrap();
        node.set_xattr(b"user.a", b"two").unwrap();

        assert_eq!(node.get_xattr(b"user.a"), Some(b"two" as &[u8]));
        assert_eq!(node.get_xattr(b"user.b"), Some(b"" as &[u8]));
        assert_eq!(node.get_xattr(b"user.c"), None);
        assert_eq!(node.xattrs().count(), 2);
    }

    #[test]
    fn test_xattr_limits() {
        let mut fs = new_fs();
        let file = fs.new_node(file_stat()).unwrap();
        let node = fs.node_mut(file);

        assert!(matches!(
            node.set_xattr(b"", b"v"),
            Err(TreeError::XattrNameTooLong)
        ));
        assert!(matches!(
            node.set_xattr(&[b'n'; 256], b"v"),
            Err(TreeError::XattrNameTooLong)
        ));
        assert!(matches!(
            node.set_xattr(b"user.big", &vec![0; 65536]),
            Err(TreeError::XattrValueTooLarge)
        ));

        // each of these encodes to 4 + 8 + 60000 bytes; the second would
        // push the block over the 16-bit limit
        node.set_xattr(b"user.aa1", &vec![0; 60000]).unwrap();
        assert!(matches!(
            node.set_xattr(b"user.aa2", &vec![0; 60000]),
            Err(TreeError::XattrBlockTooLarge)
        ));

        // replacing the big value with a small one frees the space
        node.set_xattr(b"user.aa1", b"small").unwrap();
        node.set_xattr(b"user.aa2", &vec![0; 60000]).unwrap();
    }
}
