//! Build and query composefs metadata images.
//!
//! A [`tree::FileSystem`] describes a filesystem as metadata only: stat
//! data, directory structure, extended attributes and references to
//! backing content, but no file data.  The tree can be serialized into the
//! compact native format ([`cfs::mkfs_cfs`]) or into an EROFS-compatible
//! image ([`erofs::mkfs_erofs`]), and native images can be queried in
//! place with [`cfs::Image`] without decoding them up front.
//!
//! Both encoders are deterministic: the same tree always serializes to the
//! same bytes.

pub mod cfs;
pub mod dedup;
pub mod digest;
pub mod erofs;
pub mod tree;
pub mod writer;
