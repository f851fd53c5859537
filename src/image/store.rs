//! The backing store: a raw disk image exposed through positioned I/O.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use nix::sys::uio::{pread, pwrite};
use tokio::task;

/// A validated backing image with a size that stays fixed for the lifetime
/// of the mount.
///
/// `size` defaults to the image length at open time; an override lets the
/// export stay at a fixed capacity independent of the physical length, e.g.
/// for sparse images or block devices that stat as zero bytes.
pub struct Image {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

impl Image {
    /// Stat the image and capture the fixed export size.
    ///
    /// Fails if the path is missing or a directory. The image is not held
    /// open here; descriptors are opened per FUSE open via [`Image::open_rw`].
    pub async fn open<P: AsRef<Path>>(path: P, size_override: Option<u64>) -> io::Result<Image> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "backing image is a directory",
            ));
        }
        let size = size_override.unwrap_or(meta.len());
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(Image {
            path,
            size,
            modified,
        })
    }

    /// The fixed export size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Modification time of the image when it was opened.
    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open one read-write descriptor on the image. Called once per FUSE
    /// open, so concurrent opens never share (or clobber) a descriptor.
    pub async fn open_rw(&self) -> io::Result<ImageFile> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        Ok(ImageFile {
            file: Arc::new(file.into_std().await),
        })
    }
}

/// One open descriptor on the backing image.
///
/// Cloning is cheap (the descriptor is shared); positioned I/O never moves a
/// file cursor, so clones can issue requests concurrently without locking.
#[derive(Clone)]
pub struct ImageFile {
    file: Arc<std::fs::File>,
}

impl ImageFile {
    /// Read up to `len` bytes at `offset` with a single pread. May return
    /// fewer bytes than requested when the read crosses the physical end of
    /// the image; that short count is the host's answer, not an error.
    pub async fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let file = self.file.clone();
        task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut buf = vec![0u8; len];
            let n = pread(&*file, &mut buf, offset as libc::off_t).map_err(io::Error::from)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Write `data` at `offset` with a single pwrite, returning the count
    /// the host reports (which may be short).
    pub async fn write_at(&self, offset: u64, data: Vec<u8>) -> io::Result<usize> {
        let file = self.file.clone();
        task::spawn_blocking(move || -> io::Result<usize> {
            pwrite(&*file, &data, offset as libc::off_t).map_err(io::Error::from)
        })
        .await
        .map_err(io::Error::other)?
    }

    /// fsync pass-through.
    pub async fn sync(&self) -> io::Result<()> {
        let file = self.file.clone();
        task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(io::Error::other)?
    }
}
