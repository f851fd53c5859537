//! FUSE adapter and request handling
//!
//! Translates kernel FUSE requests into operations on the backing image.
//! The namespace is static: inode 1 is the mount root and inode 2 is the
//! single exported file, so lookup and attribute handling reduce to a name
//! comparison and read/write reduce to positioned I/O on the image.
//!
//! Main components:
//! - implementation of the `rfuse3` `Filesystem` trait for [`ImageFs`],
//! - `handle`: the table of descriptors opened per FUSE open,
//! - `mount`: helpers for privileged and unprivileged mounts,
//! - `open_flags`: the FOPEN_* bits replied on open.
//!
//! Requests the export cannot honor are still accepted where the shim
//! promises so (truncate, setxattr, unlink) and discarded; everything else
//! answers with the host errno unchanged.
pub mod handle;
pub mod mount;
pub mod open_flags;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType, Result as FuseResult, SetAttr, Timestamp};

use self::handle::HandleTable;
use self::open_flags::OpenReplyFlags;
use crate::image::Image;

/// Inode of the mount root directory.
const ROOT_INO: u64 = 1;
/// Inode of the exported file.
const EXPORT_INO: u64 = 2;
/// Entry/attribute TTL handed to the kernel. The namespace never changes,
/// but a short TTL keeps behavior close to a regular filesystem.
const TTL: Duration = Duration::from_secs(1);
/// Maximum write size advertised at init.
const MAX_WRITE: u32 = 1024 * 1024;
/// Block size reported in attributes and statfs.
const BLOCK_SIZE: u32 = 4096;

/// The FUSE view of the backing image: a root directory holding exactly one
/// regular file whose bytes are the image's bytes.
pub struct ImageFs {
    image: Image,
    export_name: OsString,
    handles: HandleTable,
}

impl ImageFs {
    pub fn new(image: Image, export_name: &str) -> Self {
        Self {
            image,
            export_name: OsString::from(export_name),
            handles: HandleTable::new(),
        }
    }

    /// Name of the exported file as it appears in the mount root.
    pub fn export_name(&self) -> &OsStr {
        &self.export_name
    }

    fn root_attr(&self, req: &Request) -> FileAttr {
        let ts = Timestamp::from(self.image.modified());
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: ts,
            mtime: ts,
            ctime: ts,
            #[cfg(target_os = "macos")]
            crtime: ts,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: req.uid,
            gid: req.gid,
            rdev: 0,
            #[cfg(target_os = "macos")]
            flags: 0,
            blksize: BLOCK_SIZE,
        }
    }

    fn export_attr(&self, req: &Request) -> FileAttr {
        let ts = Timestamp::from(self.image.modified());
        let size = self.image.size();
        FileAttr {
            ino: EXPORT_INO,
            size,
            blocks: size.div_ceil(512),
            atime: ts,
            mtime: ts,
            ctime: ts,
            #[cfg(target_os = "macos")]
            crtime: ts,
            kind: FileType::RegularFile,
            perm: 0o666,
            nlink: 1,
            uid: req.uid,
            gid: req.gid,
            rdev: 0,
            #[cfg(target_os = "macos")]
            flags: 0,
            blksize: BLOCK_SIZE,
        }
    }

    /// Directory-only operations: ENOTDIR for the export, ENOENT for
    /// anything not in the two-inode namespace.
    fn expect_root_dir(&self, inode: u64) -> FuseResult<()> {
        match inode {
            ROOT_INO => Ok(()),
            EXPORT_INO => Err(libc::ENOTDIR.into()),
            _ => Err(libc::ENOENT.into()),
        }
    }

    /// The three entries of the root directory, offsets 1-based so the
    /// kernel can resume listing after any of them.
    fn root_entries(&self) -> [DirectoryEntry; 3] {
        [
            DirectoryEntry {
                inode: ROOT_INO,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
            },
            DirectoryEntry {
                inode: ROOT_INO,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
            },
            DirectoryEntry {
                inode: EXPORT_INO,
                kind: FileType::RegularFile,
                name: self.export_name.clone(),
                offset: 3,
            },
        ]
    }
}

impl Filesystem for ImageFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(MAX_WRITE).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {}

    // Only the export under the root resolves; any other path is unknown.
    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        if parent != ROOT_INO || name != self.export_name.as_os_str() {
            return Err(libc::ENOENT.into());
        }
        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.export_attr(&req),
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let attr = match inode {
            ROOT_INO => self.root_attr(&req),
            EXPORT_INO => self.export_attr(&req),
            _ => return Err(libc::ENOENT.into()),
        };
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    // Accepted and discarded: the export's attributes are fixed. This also
    // covers truncate, which arrives as a size change.
    async fn setattr(
        &self,
        req: Request,
        inode: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        if let Some(size) = set_attr.size
            && inode == EXPORT_INO
            && size != self.image.size()
        {
            debug!(
                "ignoring truncate to {size} bytes, export stays at {}",
                self.image.size()
            );
        }
        self.getattr(req, inode, None, 0).await
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> FuseResult<ReplyOpen> {
        match inode {
            EXPORT_INO => {}
            ROOT_INO => return Err(libc::EISDIR.into()),
            _ => return Err(libc::ENOENT.into()),
        }
        let file = match self.image.open_rw().await {
            Ok(f) => f,
            Err(e) => {
                error!("open backing image {}: {e}", self.image.path().display());
                return Err(e.into());
            }
        };
        let fh = self.handles.insert(file);
        debug!("opened export fh {fh} (flags {flags:#x})");
        Ok(ReplyOpen {
            fh,
            flags: OpenReplyFlags::DIRECT_IO.bits(),
        })
    }

    // Opening the root is stateless, fh 0.
    async fn opendir(&self, _req: Request, inode: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        self.expect_root_dir(inode)?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        if inode != EXPORT_INO {
            return Err(libc::ENOENT.into());
        }
        let Some(file) = self.handles.get(fh) else {
            return Err(libc::EBADF.into());
        };
        let total = self.image.size();
        if offset >= total {
            return Ok(ReplyData { data: Bytes::new() });
        }
        let len = (size as u64).min(total - offset) as usize;
        let data = match file.read_at(offset, len).await {
            Ok(d) => d,
            Err(e) => {
                error!("read {len} bytes at {offset} failed: {e}");
                return Err(e.into());
            }
        };
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        if inode != EXPORT_INO {
            return Err(libc::ENOENT.into());
        }
        let Some(file) = self.handles.get(fh) else {
            return Err(libc::EBADF.into());
        };
        let total = self.image.size();
        if offset >= total {
            return Ok(ReplyWrite { written: 0 });
        }
        if data.len() as u64 > total - offset {
            warn!(
                "refusing write of {} bytes at {offset}: would cross the fixed size {total}",
                data.len()
            );
            return Err(libc::ENOSPC.into());
        }
        let written = match file.write_at(offset, data.to_vec()).await {
            Ok(n) => n as u32,
            Err(e) => {
                error!("write {} bytes at {offset} failed: {e}", data.len());
                return Err(e.into());
            }
        };
        Ok(ReplyWrite { written })
    }

    async fn statfs(&self, _req: Request, _inode: u64) -> FuseResult<ReplyStatFs> {
        // A full fixed-capacity device holding a single file.
        let blocks = self.image.size().div_ceil(BLOCK_SIZE as u64);
        Ok(ReplyStatFs {
            blocks,
            bfree: 0,
            bavail: 0,
            files: 1,
            ffree: 0,
            bsize: BLOCK_SIZE,
            namelen: 255,
            frsize: BLOCK_SIZE,
        })
    }

    // Accepted and discarded; nothing is stored.
    async fn setxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> FuseResult<()> {
        match inode {
            ROOT_INO | EXPORT_INO => {
                debug!("discarding xattr {name:?} on inode {inode}");
                Ok(())
            }
            _ => Err(libc::ENOENT.into()),
        }
    }

    // Accepted and discarded: the reply is success but the export stays.
    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        self.expect_root_dir(parent)?;
        if name != self.export_name.as_os_str() {
            return Err(libc::ENOENT.into());
        }
        debug!("ignoring unlink of the export");
        Ok(())
    }

    // No permission enforcement; the two known inodes are always accessible.
    async fn access(&self, _req: Request, inode: u64, _mask: u32) -> FuseResult<()> {
        match inode {
            ROOT_INO | EXPORT_INO => Ok(()),
            _ => Err(libc::ENOENT.into()),
        }
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        self.expect_root_dir(parent)?;
        let start = if offset <= 0 { 0 } else { offset as usize };
        let rest: Vec<DirectoryEntry> = self.root_entries().into_iter().skip(start).collect();
        let entries: Self::DirEntryStream<'a> = Box::pin(stream::iter(rest.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        self.expect_root_dir(parent)?;
        let all: Vec<DirectoryEntryPlus> = self
            .root_entries()
            .into_iter()
            .map(|e| {
                let attr = match e.inode {
                    EXPORT_INO => self.export_attr(&req),
                    _ => self.root_attr(&req),
                };
                DirectoryEntryPlus {
                    inode: e.inode,
                    generation: 0,
                    kind: e.kind,
                    name: e.name,
                    offset: e.offset,
                    attr,
                    entry_ttl: TTL,
                    attr_ttl: TTL,
                }
            })
            .skip(offset as usize)
            .collect();
        let entries: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries })
    }

    // ===== release and sync =====

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        if self.handles.remove(fh).is_some() {
            debug!("released fh {fh}");
        }
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        if inode != EXPORT_INO {
            return Err(libc::ENOENT.into());
        }
        let Some(file) = self.handles.get(fh) else {
            return Err(libc::EBADF.into());
        };
        file.sync().await?;
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    // The namespace is static; there is no per-inode state to reclaim.
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}
