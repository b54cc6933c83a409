//! The native composefs image format: a compact, alignment-friendly
//! metadata serialization with an in-place query engine.

pub mod format;
pub mod reader;
pub mod writer;

pub use reader::{Image, ImageError};
pub use writer::{mkfs_cfs, CfsFormat};
