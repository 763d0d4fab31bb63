//! Mount helpers, thin wrappers over the rfuse3 raw Session API.

use std::ffi::OsStr;
use std::io;

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};

use crate::passthrough::ConcatFs;

fn mount_options() -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut options = MountOptions::default();
    options
        .fs_name("concatfs")
        .force_readdir_plus(true)
        .uid(uid)
        .gid(gid);
    options
}

/// Mount via fusermount3, no privileges required.
pub async fn mount_unprivileged(fs: ConcatFs, mountpoint: &OsStr) -> io::Result<MountHandle> {
    Session::new(mount_options())
        .mount_with_unprivileged(fs, mountpoint)
        .await
}

/// Privileged mount for environments without fusermount3.
pub async fn mount_privileged(fs: ConcatFs, mountpoint: &OsStr) -> io::Result<MountHandle> {
    Session::new(mount_options()).mount(fs, mountpoint).await
}
