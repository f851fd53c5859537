//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we support unprivileged
//!   mount via fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

#[cfg(target_os = "linux")]
use rfuse3::MountOptions;

use super::ImageFs;

/// Build default mount options for imagefs.
#[cfg(target_os = "linux")]
fn default_mount_options() -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let mut mo = MountOptions::default();
    mo.fs_name("imagefs")
        .force_readdir_plus(true)
        .uid(uid)
        .gid(gid);
    // Keep defaults conservative: no allow_other, require empty mountpoint.
    mo
}

/// Mount the filesystem on the given empty directory. Requires privileges
/// for the mount syscall.
#[cfg(target_os = "linux")]
pub async fn mount_imagefs(
    fs: ImageFs,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    session.mount(fs, mount_point).await
}

/// Mount the filesystem on the given empty directory without privileges
/// (requires fusermount3 in PATH).
#[cfg(target_os = "linux")]
pub async fn mount_imagefs_unprivileged(
    fs: ImageFs,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_imagefs(
    _fs: ImageFs,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_imagefs_unprivileged(
    _fs: ImageFs,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
