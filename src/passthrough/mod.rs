//! Passthrough dispatcher over a source directory.
//!
//! Every FUSE operation forwards 1:1 to the mirrored tree, with one
//! exception: paths whose file name contains the descriptor marker divert
//! `getattr` size, `open`, `read` and `release` into the materialization
//! engine in [`crate::concat`]. Virtual files are strictly read-only;
//! writing through a descriptor handle returns `EINVAL`.

mod inode;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io;
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use nix::sys::stat::{Mode, SFlag};
use nix::sys::statvfs::statvfs;
use nix::unistd::{AccessFlags, access};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, Inode, Result as FuseResult, SetAttr, Timestamp};

use crate::concat::{self, OpenFileRegistry, VirtualFile};
use inode::{InodeTable, ROOT_INODE};

const TTL: Duration = Duration::from_secs(1);

/// Passthrough filesystem with virtual concatenation files.
pub struct ConcatFs {
    root: PathBuf,
    marker: String,
    inodes: Mutex<InodeTable>,
    /// Open handles of ordinary passthrough files.
    handles: Mutex<HashMap<u64, Arc<File>>>,
    /// Open handles of materialized descriptor files.
    registry: OpenFileRegistry,
    next_fh: AtomicU64,
}

impl ConcatFs {
    /// Create a filesystem mirroring `root`. `marker` is the substring that
    /// turns a file name into a descriptor file.
    pub fn new(root: impl AsRef<Path>, marker: impl Into<String>) -> io::Result<ConcatFs> {
        let root = root.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("source root {} is not a directory", root.display()),
            ));
        }
        Ok(ConcatFs {
            inodes: Mutex::new(InodeTable::new(root.clone())),
            root,
            marker: marker.into(),
            handles: Mutex::new(HashMap::new()),
            registry: OpenFileRegistry::new(),
            next_fh: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn inodes(&self) -> MutexGuard<'_, InodeTable> {
        self.inodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, Arc<File>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path_of(&self, inode: Inode) -> FuseResult<PathBuf> {
        self.inodes()
            .path_of(inode)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child_path(&self, parent: Inode, name: &OsStr) -> FuseResult<PathBuf> {
        Ok(self.path_of(parent)?.join(name))
    }

    fn is_descriptor(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| concat::is_descriptor_name(name, &self.marker))
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    /// lstat a source path, reporting the materialized size for descriptors.
    fn attr_for(&self, inode: Inode, path: &Path) -> FuseResult<FileAttr> {
        let meta = fs::symlink_metadata(path).map_err(Errno::from)?;
        let mut attr = attr_from_meta(inode, &meta);
        if meta.is_file() && self.is_descriptor(path) {
            attr.size = VirtualFile::probe_size(path);
            attr.blocks = attr.size.div_ceil(512);
        }
        Ok(attr)
    }

    fn entry_for(&self, path: PathBuf) -> FuseResult<ReplyEntry> {
        let inode = self.inodes().assign(path.clone());
        let attr = self.attr_for(inode, &path)?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }
}

impl Filesystem for ConcatFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: Inode, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        fs::symlink_metadata(&path).map_err(Errno::from)?;
        self.entry_for(path)
    }

    async fn getattr(
        &self,
        _req: Request,
        inode: Inode,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(inode)?;
        let attr = self.attr_for(inode, &path)?;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn setattr(
        &self,
        _req: Request,
        inode: Inode,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(inode)?;

        if let Some(mode) = set_attr.mode {
            let perm = std::os::unix::fs::PermissionsExt::from_mode(mode);
            fs::set_permissions(&path, perm).map_err(Errno::from)?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            std::os::unix::fs::lchown(&path, set_attr.uid, set_attr.gid)
                .map_err(Errno::from)?;
        }
        if let Some(size) = set_attr.size {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(Errno::from)?;
            file.set_len(size).map_err(Errno::from)?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let mut times = FileTimes::new();
            if let Some(atime) = set_attr.atime {
                times = times.set_accessed(timestamp_to_system(atime));
            }
            if let Some(mtime) = set_attr.mtime {
                times = times.set_modified(timestamp_to_system(mtime));
            }
            let file = File::open(&path).map_err(Errno::from)?;
            file.set_times(times).map_err(Errno::from)?;
        }

        let attr = self.attr_for(inode, &path)?;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn readlink(&self, _req: Request, inode: Inode) -> FuseResult<ReplyData> {
        let path = self.path_of(inode)?;
        let target = fs::read_link(&path).map_err(Errno::from)?;
        Ok(ReplyData {
            data: Bytes::from(target.as_os_str().as_bytes().to_vec()),
        })
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        nix::sys::stat::mknod(&path, kind, perm, rdev as libc::dev_t)
            .map_err(|e| Errno::from(io::Error::from(e)))?;
        self.entry_for(path)
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        fs::DirBuilder::new()
            .mode(mode)
            .create(&path)
            .map_err(Errno::from)?;
        self.entry_for(path)
    }

    async fn unlink(&self, _req: Request, parent: Inode, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        fs::remove_file(&path).map_err(Errno::from)?;
        self.inodes().forget_path(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: Inode, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        fs::remove_dir(&path).map_err(Errno::from)?;
        self.inodes().forget_path(&path);
        Ok(())
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        std::os::unix::fs::symlink(link, &path).map_err(Errno::from)?;
        self.entry_for(path)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        new_parent: Inode,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.child_path(parent, name)?;
        let new = self.child_path(new_parent, new_name)?;
        fs::rename(&old, &new).map_err(Errno::from)?;
        self.inodes().rename(&old, &new);
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        inode: Inode,
        new_parent: Inode,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let source = self.path_of(inode)?;
        let path = self.child_path(new_parent, new_name)?;
        fs::hard_link(&source, &path).map_err(Errno::from)?;
        self.entry_for(path)
    }

    async fn open(&self, _req: Request, inode: Inode, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(inode)?;
        let fh = self.alloc_fh();

        if self.is_descriptor(&path) {
            // Virtual files are read-only; the descriptor handle itself is
            // kept open for the lifetime of the materialization.
            let descriptor = File::open(&path).map_err(Errno::from)?;
            let file = VirtualFile::open(&path, descriptor).map_err(Errno::from)?;
            debug!(
                "materialized {} as {} bytes under fh {fh}",
                path.display(),
                file.size()
            );
            self.registry.insert(fh, file);
        } else {
            let access = flags as i32 & libc::O_ACCMODE;
            let file = OpenOptions::new()
                .read(access == libc::O_RDONLY || access == libc::O_RDWR)
                .write(access == libc::O_WRONLY || access == libc::O_RDWR)
                .custom_flags(flags as i32 & !libc::O_ACCMODE)
                .open(&path)
                .map_err(Errno::from)?;
            self.handles().insert(fh, Arc::new(file));
        }

        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _inode: Inode,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let mut buf = vec![0u8; size as usize];

        // Look the handle up under the lock, read without it: positioned
        // reads carry their own offset and need no serialization.
        let n = if let Some(file) = self.registry.find(fh) {
            file.read_at(&mut buf, offset).map_err(Errno::from)?
        } else {
            let handle = self.handles().get(&fh).cloned();
            let Some(file) = handle else {
                return Err(Errno::from(libc::EBADF));
            };
            file.read_at(&mut buf, offset).map_err(Errno::from)?
        };

        buf.truncate(n);
        Ok(ReplyData {
            data: Bytes::from(buf),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _inode: Inode,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        if self.registry.find(fh).is_some() {
            return Err(Errno::from(libc::EINVAL));
        }
        let handle = self.handles().get(&fh).cloned();
        let Some(file) = handle else {
            return Err(Errno::from(libc::EBADF));
        };
        let written = file.write_at(data, offset).map_err(Errno::from)? as u32;
        Ok(ReplyWrite { written })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: Inode,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        // Dropping the registry entry releases the descriptor handle and
        // every chunk handle; releasing an unknown fh is a no-op.
        if self.registry.remove(fh).is_none() {
            self.handles().remove(&fh);
        }
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: Inode,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: Inode, fh: u64, datasync: bool) -> FuseResult<()> {
        let file = self.handles().get(&fh).cloned();
        if let Some(file) = file {
            if datasync {
                file.sync_data().map_err(Errno::from)?;
            } else {
                file.sync_all().map_err(Errno::from)?;
            }
        }
        Ok(())
    }

    async fn opendir(&self, _req: Request, inode: Inode, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(inode)?;
        let meta = fs::symlink_metadata(&path).map_err(Errno::from)?;
        if !meta.is_dir() {
            return Err(Errno::from(libc::ENOTDIR));
        }
        // Directory listing is stateless.
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        inode: Inode,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path_of(inode)?;
        let parent_inode = self.parent_inode(inode, &path);

        let mut all = vec![
            DirectoryEntry {
                inode,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
            },
            DirectoryEntry {
                inode: parent_inode,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
            },
        ];
        for (i, (name, child, kind)) in self.list_dir(&path)?.into_iter().enumerate() {
            all.push(DirectoryEntry {
                inode: self.inodes().assign(child),
                kind,
                name,
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let stream_iter = stream::iter(slice.into_iter().map(Ok));
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream_iter);
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: Inode,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.path_of(parent)?;
        let parent_inode = self.parent_inode(parent, &path);

        let self_attr = self.attr_for(parent, &path)?;
        let parent_path = self.path_of(parent_inode)?;
        let parent_attr = self.attr_for(parent_inode, &parent_path)?;

        let mut all = vec![
            DirectoryEntryPlus {
                inode: parent,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
                attr: self_attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            },
            DirectoryEntryPlus {
                inode: parent_inode,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
                attr: parent_attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            },
        ];
        for (i, (name, child, kind)) in self.list_dir(&path)?.into_iter().enumerate() {
            let child_inode = self.inodes().assign(child.clone());
            // Entries vanishing mid-listing are skipped, not fatal.
            let Ok(attr) = self.attr_for(child_inode, &child) else {
                continue;
            };
            all.push(DirectoryEntryPlus {
                inode: child_inode,
                generation: 0,
                kind,
                name,
                offset: (i as i64) + 3,
                attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let stream_iter = stream::iter(slice.into_iter().map(Ok));
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream_iter);
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: Inode,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: Inode,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, inode: Inode, mask: u32) -> FuseResult<()> {
        let path = self.path_of(inode)?;
        access(&path, AccessFlags::from_bits_truncate(mask as i32))
            .map_err(|e| Errno::from(io::Error::from(e)))
    }

    async fn statfs(&self, _req: Request, _inode: Inode) -> FuseResult<ReplyStatFs> {
        let st = statvfs(&self.root).map_err(|e| Errno::from(io::Error::from(e)))?;
        Ok(ReplyStatFs {
            blocks: st.blocks(),
            bfree: st.blocks_free(),
            bavail: st.blocks_available(),
            files: st.files(),
            ffree: st.files_free(),
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
        })
    }

    async fn create(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child_path(parent, name)?;
        let access = flags as i32 & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .create(true)
            .custom_flags(flags as i32 & !libc::O_ACCMODE)
            .mode(mode)
            .open(&path)
            .map_err(Errno::from)?;

        let fh = self.alloc_fh();
        self.handles().insert(fh, Arc::new(file));

        let inode = self.inodes().assign(path.clone());
        let attr = self.attr_for(inode, &path)?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr,
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn forget(&self, _req: Request, _inode: Inode, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(Inode, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

impl ConcatFs {
    /// Inode reported for `..`: the table entry of the parent path, or the
    /// root for the root itself.
    fn parent_inode(&self, inode: Inode, path: &Path) -> Inode {
        if inode == ROOT_INODE {
            return ROOT_INODE;
        }
        match path.parent() {
            Some(parent) if parent.starts_with(&self.root) => {
                self.inodes().assign(parent.to_path_buf())
            }
            _ => ROOT_INODE,
        }
    }

    fn list_dir(&self, path: &Path) -> FuseResult<Vec<(OsString, PathBuf, FileType)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(Errno::from)? {
            let entry = entry.map_err(Errno::from)?;
            let kind = entry
                .file_type()
                .map(fuse_kind)
                .unwrap_or(FileType::RegularFile);
            entries.push((entry.file_name(), entry.path(), kind));
        }
        Ok(entries)
    }
}

fn fuse_kind(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn attr_from_meta(inode: Inode, meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        ino: inode,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: Timestamp::new(meta.atime(), meta.atime_nsec() as u32),
        mtime: Timestamp::new(meta.mtime(), meta.mtime_nsec() as u32),
        ctime: Timestamp::new(meta.ctime(), meta.ctime_nsec() as u32),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::new(meta.ctime(), meta.ctime_nsec() as u32),
        kind: fuse_kind(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: meta.blksize() as u32,
    }
}

fn timestamp_to_system(ts: Timestamp) -> SystemTime {
    if ts.sec >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(ts.sec as u64, ts.nsec)
    } else {
        SystemTime::UNIX_EPOCH - Duration::new(ts.sec.unsigned_abs(), 0)
    }
}
