//! EROFS-compatible image support: serializes a tree into an image that
//! the EROFS kernel driver can mount directly, with overlay metadata
//! pointing at the backing content.

pub mod composefs;
pub mod format;
pub mod writer;

pub use writer::{mkfs_erofs, ErofsFormat};
