use bitflags::bitflags;

// Flags used by the OPEN reply.
/// Bypass page cache for this open file.
const FOPEN_DIRECT_IO: u32 = 1;

/// Don't invalidate the data cache on open.
const FOPEN_KEEP_CACHE: u32 = 2;

/// The file is not seekable.
const FOPEN_NONSEEKABLE: u32 = 4;

bitflags! {
    /// Options replied to the kernel when the export is opened. Every open
    /// replies DIRECT_IO so reads and writes reach the image instead of the
    /// page cache.
    pub struct OpenReplyFlags: u32 {
        /// Bypass page cache for this open file.
        const DIRECT_IO = FOPEN_DIRECT_IO;
        /// Don't invalidate the data cache on open.
        const KEEP_CACHE = FOPEN_KEEP_CACHE;
        /// The file is not seekable.
        const NONSEEKABLE = FOPEN_NONSEEKABLE;
    }
}
