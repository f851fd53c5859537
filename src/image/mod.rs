//! Backing image access
//!
//! Responsibilities:
//! - Validate the disk image at startup and capture the fixed export size.
//! - Hand out read-write descriptors, one per FUSE open.
//! - Forward positioned reads and writes to the host via pread/pwrite,
//!   passing OS error codes through unchanged.
//!
//! Submodules:
//! - `store`: the `Image` descriptor factory and per-open `ImageFile`
pub mod store;

pub use store::{Image, ImageFile};
