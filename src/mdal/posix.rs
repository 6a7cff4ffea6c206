//! POSIX reference implementation of the MDAL: a namespace is a directory
//! tree on a secure root, addressed strictly through directory FDs.
//!
//! Every open verifies that the resolved target still lives on the
//! context's device, which closes the symlink-mediated escape: a link
//! pointing outside the secure root lands on a different `st_dev` and the
//! operation fails `CrossDevice`.

use std::any::Any;
use std::ffi::CString;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Component, Path, PathBuf};

use log::warn;
use nix::dir::Dir;
use nix::fcntl::{openat, AtFlags, OFlag};
use nix::sys::stat::{fchmodat, fstat, fstatat, futimens, utimensat, FchmodatFlags, Mode,
                     UtimensatFlags};
use nix::sys::statvfs::{fstatvfs, Statvfs};
use nix::sys::time::TimeSpec;
use nix::unistd::{fchownat, unlinkat, FchownatFlags, Gid, Uid, UnlinkatFlags};

use crate::error::{Error, Result};

use super::{
    FileStat, Mdal, MdalCtxt, MdalFile, MdalScanner, ScanEntry, TimePair, DATA_USAGE_FILE,
    HIDDEN_XATTR_PREFIX, INODE_USAGE_FILE, REF_DIR, RESERVED_PREFIX, SUBSPACE_DIR,
};

const XATTR_VALUE_MAX: usize = 16 * 1024;

pub struct PosixMdal;

impl PosixMdal {
    pub fn new() -> PosixMdal {
        PosixMdal
    }
}

impl Default for PosixMdal {
    fn default() -> Self {
        PosixMdal::new()
    }
}

fn cstr(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("NUL in path {:?}", path)))
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Reject absolute paths, parent traversal, and any component colliding
/// with the reserved internal prefix.
fn check_path(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "context-relative path expected, got {:?}",
            path
        )));
    }
    for comp in p.components() {
        match comp {
            Component::Normal(name) => {
                if name.to_string_lossy().starts_with(RESERVED_PREFIX) {
                    return Err(Error::PermissionDenied(format!(
                        "reserved path component in {:?}",
                        path
                    )));
                }
            }
            Component::CurDir => {}
            _ => {
                return Err(Error::PermissionDenied(format!(
                    "path may not traverse upward: {:?}",
                    path
                )))
            }
        }
    }
    Ok(p)
}

/// Like `check_path` but without the reserved-prefix rule; reference paths
/// are internal and may (but need not) use it.
fn check_ref_path(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    if p.is_absolute() || p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::InvalidArgument(format!(
            "bad reference path {:?}",
            path
        )));
    }
    Ok(p)
}

fn open_dirfd(path: &Path) -> Result<File> {
    let fd = nix::fcntl::open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
        .map_err(|e| Error::from_nix(e, path))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

impl Mdal for PosixMdal {
    fn create_namespace(&self, root: &Path, mode: u32) -> Result<()> {
        std::fs::create_dir_all(root)?;
        let dirmode = Mode::from_bits_truncate(mode);
        nix::sys::stat::fchmodat(None, root, dirmode, FchmodatFlags::FollowSymlink)
            .map_err(|e| Error::from_nix(e, root))?;
        for sub in &[REF_DIR, SUBSPACE_DIR] {
            let path = root.join(sub);
            match nix::unistd::mkdir(&path, Mode::S_IRWXU) {
                Ok(()) | Err(nix::Error::Sys(nix::errno::Errno::EEXIST)) => {}
                Err(e) => return Err(Error::from_nix(e, path)),
            }
        }
        Ok(())
    }

    fn destroy_namespace(&self, root: &Path) -> Result<()> {
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match name.as_ref() {
                REF_DIR | SUBSPACE_DIR => {
                    if std::fs::read_dir(entry.path())?.next().is_some() {
                        return Err(Error::NotEmpty(entry.path()));
                    }
                }
                DATA_USAGE_FILE | INODE_USAGE_FILE => {}
                _ => return Err(Error::NotEmpty(root.to_path_buf())),
            }
        }
        for sub in &[REF_DIR, SUBSPACE_DIR] {
            let path = root.join(sub);
            if path.exists() {
                std::fs::remove_dir(&path)?;
            }
        }
        for counter in &[DATA_USAGE_FILE, INODE_USAGE_FILE] {
            let path = root.join(counter);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        std::fs::remove_dir(root)?;
        Ok(())
    }

    fn new_ctxt(&self, root: &Path) -> Result<Box<dyn MdalCtxt>> {
        let root_fd = open_dirfd(root)?;
        let ref_fd = open_dirfd(&root.join(REF_DIR))?;

        let root_st = fstat(root_fd.as_raw_fd()).map_err(|e| Error::from_nix(e, root))?;
        let ref_st = fstat(ref_fd.as_raw_fd()).map_err(|e| Error::from_nix(e, root))?;
        if root_st.st_dev != ref_st.st_dev {
            return Err(Error::CrossDevice(root.to_path_buf()));
        }

        Ok(Box::new(PosixCtxt {
            root: root_fd,
            refs: ref_fd,
            dev: root_st.st_dev,
            base: root.to_path_buf(),
        }))
    }

    fn checksec(&self, root: &Path, fix: bool) -> Result<()> {
        let euid = nix::unistd::Uid::effective().as_raw();
        for ancestor in root.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            if let Ok(st) = nix::sys::stat::stat(ancestor) {
                if (st.st_mode & 0o777) == 0o700 && st.st_uid == euid {
                    return Ok(());
                }
            }
        }
        let parent = match root.parent() {
            Some(p) => p,
            None => {
                return Err(Error::PermissionDenied(
                    "no securable ancestor for metadata root".into(),
                ))
            }
        };
        if !fix {
            return Err(Error::PermissionDenied(format!(
                "no 0700 ancestor above {:?}",
                root
            )));
        }
        warn!("securing metadata parent {:?} (chown/chmod 0700)", parent);
        nix::unistd::chown(parent, Some(Uid::effective()), None)
            .map_err(|e| Error::from_nix(e, parent))?;
        fchmodat(None, parent, Mode::S_IRWXU, FchmodatFlags::FollowSymlink)
            .map_err(|e| Error::from_nix(e, parent))?;
        Ok(())
    }
}

pub struct PosixCtxt {
    root: File,
    refs: File,
    dev: u64,
    base: PathBuf,
}

impl PosixCtxt {
    fn rootfd(&self) -> RawFd {
        self.root.as_raw_fd()
    }

    fn reffd(&self) -> RawFd {
        self.refs.as_raw_fd()
    }

    fn open_at(&self, dirfd: RawFd, path: &Path, flags: OFlag, mode: u32) -> Result<PosixFile> {
        let fd = openat(dirfd, path, flags, Mode::from_bits_truncate(mode))
            .map_err(|e| Error::from_nix(e, self.base.join(path)))?;
        let file = unsafe { File::from_raw_fd(fd) };
        let st = fstat(fd).map_err(|e| Error::from_nix(e, self.base.join(path)))?;
        if st.st_dev != self.dev {
            return Err(Error::CrossDevice(self.base.join(path)));
        }
        Ok(PosixFile {
            file,
            path: self.base.join(path),
        })
    }

    fn counter_set(&self, file: &str, value: u64) -> Result<()> {
        if value == 0 {
            return match unlinkat(Some(self.rootfd()), file, UnlinkatFlags::NoRemoveDir) {
                Ok(()) | Err(nix::Error::Sys(nix::errno::Errno::ENOENT)) => Ok(()),
                Err(e) => Err(Error::from_nix(e, self.base.join(file))),
            };
        }
        let fd = openat(
            self.rootfd(),
            file,
            OFlag::O_CREAT | OFlag::O_WRONLY,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| Error::from_nix(e, self.base.join(file)))?;
        let handle = unsafe { File::from_raw_fd(fd) };
        nix::unistd::ftruncate(handle.as_raw_fd(), value as i64)
            .map_err(|e| Error::from_nix(e, self.base.join(file)))?;
        Ok(())
    }

    fn counter_get(&self, file: &str) -> Result<u64> {
        match fstatat(self.rootfd(), file, AtFlags::AT_SYMLINK_NOFOLLOW) {
            Ok(st) => Ok(st.st_size as u64),
            Err(nix::Error::Sys(nix::errno::Errno::ENOENT)) => Ok(0),
            Err(e) => Err(Error::from_nix(e, self.base.join(file))),
        }
    }
}

impl MdalCtxt for PosixCtxt {
    fn dup(&self) -> Result<Box<dyn MdalCtxt>> {
        let root = nix::unistd::dup(self.rootfd()).map_err(|e| Error::from_nix(e, &self.base))?;
        let root = unsafe { File::from_raw_fd(root) };
        let refs = nix::unistd::dup(self.reffd()).map_err(|e| Error::from_nix(e, &self.base))?;
        let refs = unsafe { File::from_raw_fd(refs) };
        Ok(Box::new(PosixCtxt {
            root,
            refs,
            dev: self.dev,
            base: self.base.clone(),
        }))
    }

    fn device_id(&self) -> u64 {
        self.dev
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn ns_stat(&self) -> Result<FileStat> {
        let mut st = fstat(self.rootfd()).map_err(|e| Error::from_nix(e, &self.base))?;
        // Hide the two internal subtrees.
        st.st_nlink = st.st_nlink.saturating_sub(2);
        Ok(st)
    }

    fn statvfs(&self) -> Result<Statvfs> {
        fstatvfs(&self.root).map_err(|e| Error::from_nix(e, &self.base))
    }

    fn set_data_usage(&self, bytes: u64) -> Result<()> {
        self.counter_set(DATA_USAGE_FILE, bytes)
    }

    fn get_data_usage(&self) -> Result<u64> {
        self.counter_get(DATA_USAGE_FILE)
    }

    fn set_inode_usage(&self, count: u64) -> Result<()> {
        self.counter_set(INODE_USAGE_FILE, count)
    }

    fn get_inode_usage(&self) -> Result<u64> {
        self.counter_get(INODE_USAGE_FILE)
    }

    fn access(&self, path: &str, mode: u32, _follow: bool) -> Result<()> {
        let p = check_path(path)?;
        let c = cstr(p)?;
        let rc = unsafe { libc::faccessat(self.rootfd(), c.as_ptr(), mode as libc::c_int, 0) };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), self.base.join(p)));
        }
        Ok(())
    }

    fn mknod(&self, path: &str, mode: u32) -> Result<()> {
        if (mode & libc::S_IFMT) == libc::S_IFDIR {
            return Err(Error::InvalidArgument(
                "mknod cannot create directories".into(),
            ));
        }
        let p = check_path(path)?;
        let c = cstr(p)?;
        let rc = unsafe { libc::mknodat(self.rootfd(), c.as_ptr(), mode, 0) };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), self.base.join(p)));
        }
        Ok(())
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let p = check_path(path)?;
        let c = cstr(p)?;
        let rc = unsafe { libc::mkdirat(self.rootfd(), c.as_ptr(), mode) };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), self.base.join(p)));
        }
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        let p = check_path(path)?;
        unlinkat(Some(self.rootfd()), p, UnlinkatFlags::RemoveDir)
            .map_err(|e| Error::from_nix(e, self.base.join(p)))
    }

    fn unlink(&self, path: &str) -> Result<()> {
        let p = check_path(path)?;
        unlinkat(Some(self.rootfd()), p, UnlinkatFlags::NoRemoveDir)
            .map_err(|e| Error::from_nix(e, self.base.join(p)))
    }

    fn link(&self, old: &str, new: &str) -> Result<()> {
        let oldp = cstr(check_path(old)?)?;
        let newp = cstr(check_path(new)?)?;
        let rc =
            unsafe { libc::linkat(self.rootfd(), oldp.as_ptr(), self.rootfd(), newp.as_ptr(), 0) };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), self.base.join(new)));
        }
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let l = check_path(link)?;
        nix::unistd::symlinkat(target, Some(self.rootfd()), l)
            .map_err(|e| Error::from_nix(e, self.base.join(l)))
    }

    fn readlink(&self, path: &str) -> Result<PathBuf> {
        let p = check_path(path)?;
        let target = nix::fcntl::readlinkat(self.rootfd(), p)
            .map_err(|e| Error::from_nix(e, self.base.join(p)))?;
        Ok(PathBuf::from(target.to_os_string()))
    }

    fn rename(&self, old: &str, dst: Option<&dyn MdalCtxt>, new: &str) -> Result<()> {
        let oldp = cstr(check_path(old)?)?;
        let newp = cstr(check_path(new)?)?;
        let dst_fd = match dst {
            None => self.rootfd(),
            Some(other) => {
                let other = other
                    .as_any()
                    .downcast_ref::<PosixCtxt>()
                    .ok_or_else(|| Error::InvalidArgument("foreign MDAL context".into()))?;
                if other.dev != self.dev {
                    return Err(Error::CrossDevice(other.base.clone()));
                }
                other.rootfd()
            }
        };
        let rc = unsafe { libc::renameat(self.rootfd(), oldp.as_ptr(), dst_fd, newp.as_ptr()) };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), self.base.join(new)));
        }
        Ok(())
    }

    fn rename_to_ref(&self, old: &str, dst: &dyn MdalCtxt, new_rpath: &str) -> Result<()> {
        let oldp = cstr(check_path(old)?)?;
        let newp = cstr(check_ref_path(new_rpath)?)?;
        let dst = dst
            .as_any()
            .downcast_ref::<PosixCtxt>()
            .ok_or_else(|| Error::InvalidArgument("foreign MDAL context".into()))?;
        if dst.dev != self.dev {
            return Err(Error::CrossDevice(dst.base.clone()));
        }
        let rc = unsafe { libc::renameat(self.rootfd(), oldp.as_ptr(), dst.reffd(), newp.as_ptr()) };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), dst.base.join(new_rpath)));
        }
        Ok(())
    }

    fn stat(&self, path: &str, follow: bool) -> Result<FileStat> {
        let p = check_path(path)?;
        let flags = if follow {
            AtFlags::empty()
        } else {
            AtFlags::AT_SYMLINK_NOFOLLOW
        };
        fstatat(self.rootfd(), p, flags).map_err(|e| Error::from_nix(e, self.base.join(p)))
    }

    fn chmod(&self, path: &str, mode: u32, follow: bool) -> Result<()> {
        let p = check_path(path)?;
        let flag = if follow {
            FchmodatFlags::FollowSymlink
        } else {
            FchmodatFlags::NoFollowSymlink
        };
        fchmodat(
            Some(self.rootfd()),
            p,
            Mode::from_bits_truncate(mode),
            flag,
        )
        .map_err(|e| Error::from_nix(e, self.base.join(p)))
    }

    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>, follow: bool) -> Result<()> {
        let p = check_path(path)?;
        let flag = if follow {
            FchownatFlags::FollowSymlink
        } else {
            FchownatFlags::NoFollowSymlink
        };
        fchownat(
            Some(self.rootfd()),
            p,
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
            flag,
        )
        .map_err(|e| Error::from_nix(e, self.base.join(p)))
    }

    fn utimens(&self, path: &str, atime: TimePair, mtime: TimePair, follow: bool) -> Result<()> {
        let p = check_path(path)?;
        let flag = if follow {
            UtimensatFlags::FollowSymlink
        } else {
            UtimensatFlags::NoFollowSymlink
        };
        utimensat(
            Some(self.rootfd()),
            p,
            &timespec(atime),
            &timespec(mtime),
            flag,
        )
        .map_err(|e| Error::from_nix(e, self.base.join(p)))
    }

    fn open(&self, path: &str, flags: OFlag, mode: u32) -> Result<Box<dyn MdalFile>> {
        let p = check_path(path)?;
        Ok(Box::new(self.open_at(self.rootfd(), p, flags, mode)?))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let p = if path.is_empty() { Path::new(".") } else { check_path(path)? };
        let mut dir = Dir::openat(
            self.rootfd(),
            p,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .map_err(|e| Error::from_nix(e, self.base.join(p)))?;
        let mut names = Vec::new();
        for entry in dir.iter() {
            let entry = entry.map_err(|e| Error::from_nix(e, self.base.join(p)))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "." || name == ".." || name.starts_with(RESERVED_PREFIX) {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    fn create_refdir(&self, rpath: &str, mode: u32) -> Result<()> {
        let p = check_ref_path(rpath)?;
        let mut sofar = PathBuf::new();
        for comp in p.components() {
            sofar.push(comp);
            let c = cstr(&sofar)?;
            let rc = unsafe { libc::mkdirat(self.reffd(), c.as_ptr(), mode) };
            if rc < 0 && last_errno() != libc::EEXIST {
                return Err(Error::from_errno(last_errno(), self.base.join(&sofar)));
            }
        }
        Ok(())
    }

    fn destroy_refdir(&self, rpath: &str) -> Result<()> {
        let p = check_ref_path(rpath)?;
        unlinkat(Some(self.reffd()), p, UnlinkatFlags::RemoveDir)
            .map_err(|e| Error::from_nix(e, self.base.join(p)))
    }

    fn link_ref(&self, rpath: &str, new_path: &str, into_ref: bool) -> Result<()> {
        let oldp = cstr(check_ref_path(rpath)?)?;
        let (dst_fd, newp) = if into_ref {
            (self.reffd(), cstr(check_ref_path(new_path)?)?)
        } else {
            (self.rootfd(), cstr(check_path(new_path)?)?)
        };
        let rc = unsafe { libc::linkat(self.reffd(), oldp.as_ptr(), dst_fd, newp.as_ptr(), 0) };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), self.base.join(new_path)));
        }
        Ok(())
    }

    fn rename_ref(&self, old_rpath: &str, new_rpath: &str) -> Result<()> {
        let oldp = cstr(check_ref_path(old_rpath)?)?;
        let newp = cstr(check_ref_path(new_rpath)?)?;
        let rc = unsafe { libc::renameat(self.reffd(), oldp.as_ptr(), self.reffd(), newp.as_ptr()) };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), self.base.join(new_rpath)));
        }
        Ok(())
    }

    fn unlink_ref(&self, rpath: &str) -> Result<()> {
        let p = check_ref_path(rpath)?;
        unlinkat(Some(self.reffd()), p, UnlinkatFlags::NoRemoveDir)
            .map_err(|e| Error::from_nix(e, self.base.join(p)))
    }

    fn stat_ref(&self, rpath: &str) -> Result<FileStat> {
        let p = check_ref_path(rpath)?;
        fstatat(self.reffd(), p, AtFlags::AT_SYMLINK_NOFOLLOW)
            .map_err(|e| Error::from_nix(e, self.base.join(p)))
    }

    fn open_ref(&self, rpath: &str, flags: OFlag, mode: u32) -> Result<Box<dyn MdalFile>> {
        let p = check_ref_path(rpath)?;
        Ok(Box::new(self.open_at(self.reffd(), p, flags, mode)?))
    }

    fn open_scanner(&self, rdir: &str) -> Result<Box<dyn MdalScanner>> {
        let p = if rdir.is_empty() {
            Path::new(".")
        } else {
            check_ref_path(rdir)?
        };
        let dir = Dir::openat(
            self.reffd(),
            p,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .map_err(|e| Error::from_nix(e, self.base.join(p)))?;
        Ok(Box::new(PosixScanner {
            dir,
            base: self.base.join(p),
        }))
    }
}

fn timespec(pair: TimePair) -> TimeSpec {
    TimeSpec::from(libc::timespec {
        tv_sec: pair.0,
        tv_nsec: pair.1,
    })
}

pub struct PosixFile {
    file: File,
    path: PathBuf,
}

impl PosixFile {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn xattr_name(&self, name: &str, hidden: bool) -> Result<CString> {
        let full = if hidden {
            format!("{}{}", HIDDEN_XATTR_PREFIX, name)
        } else {
            if name.starts_with(HIDDEN_XATTR_PREFIX) {
                return Err(Error::PermissionDenied(format!(
                    "xattr '{}' is system-reserved",
                    name
                )));
            }
            name.to_string()
        };
        CString::new(full).map_err(|_| Error::InvalidArgument("NUL in xattr name".into()))
    }
}

impl MdalFile for PosixFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        use std::io::Write;
        Ok(self.file.write(buf)?)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.file.write_at(buf, offset)?)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos)?)
    }

    fn ftruncate(&self, len: u64) -> Result<()> {
        nix::unistd::ftruncate(self.fd(), len as i64).map_err(|e| Error::from_nix(e, &self.path))
    }

    fn fstat(&self) -> Result<FileStat> {
        fstat(self.fd()).map_err(|e| Error::from_nix(e, &self.path))
    }

    fn futimens(&self, atime: TimePair, mtime: TimePair) -> Result<()> {
        futimens(self.fd(), &timespec(atime), &timespec(mtime))
            .map_err(|e| Error::from_nix(e, &self.path))
    }

    fn get_xattr(&self, name: &str, hidden: bool) -> Result<Option<Vec<u8>>> {
        let cname = self.xattr_name(name, hidden)?;
        let mut buf = vec![0u8; XATTR_VALUE_MAX];
        let rc = unsafe {
            libc::fgetxattr(
                self.fd(),
                cname.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if rc < 0 {
            let errno = last_errno();
            if errno == libc::ENODATA {
                return Ok(None);
            }
            return Err(Error::from_errno(errno, &self.path));
        }
        buf.truncate(rc as usize);
        Ok(Some(buf))
    }

    fn set_xattr(&self, name: &str, value: &[u8], hidden: bool) -> Result<()> {
        let cname = self.xattr_name(name, hidden)?;
        let rc = unsafe {
            libc::fsetxattr(
                self.fd(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), &self.path));
        }
        Ok(())
    }

    fn remove_xattr(&self, name: &str, hidden: bool) -> Result<()> {
        let cname = self.xattr_name(name, hidden)?;
        let rc = unsafe { libc::fremovexattr(self.fd(), cname.as_ptr()) };
        if rc < 0 {
            let errno = last_errno();
            if errno == libc::ENODATA {
                return Err(Error::NotFound(self.path.clone()));
            }
            return Err(Error::from_errno(errno, &self.path));
        }
        Ok(())
    }

    fn list_xattrs(&self) -> Result<Vec<String>> {
        let mut buf = vec![0u8; XATTR_VALUE_MAX];
        let rc = unsafe {
            libc::flistxattr(self.fd(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if rc < 0 {
            return Err(Error::from_errno(last_errno(), &self.path));
        }
        buf.truncate(rc as usize);
        let names = buf
            .split(|&b| b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .filter(|name| !name.starts_with(HIDDEN_XATTR_PREFIX))
            .collect();
        Ok(names)
    }
}

pub struct PosixScanner {
    dir: Dir,
    base: PathBuf,
}

impl PosixScanner {
    fn dirfd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }
}

impl MdalScanner for PosixScanner {
    fn next_entry(&mut self) -> Result<Option<ScanEntry>> {
        loop {
            let next = self.dir.iter().next();
            let entry = match next {
                None => return Ok(None),
                Some(entry) => entry.map_err(|e| Error::from_nix(e, &self.base))?,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }
            return Ok(Some(ScanEntry {
                name,
                inode: entry.ino(),
            }));
        }
    }

    fn sstat(&self, name: &str) -> Result<FileStat> {
        fstatat(self.dirfd(), name, AtFlags::AT_SYMLINK_NOFOLLOW)
            .map_err(|e| Error::from_nix(e, self.base.join(name)))
    }

    fn sopen(&self, name: &str, flags: OFlag) -> Result<Box<dyn MdalFile>> {
        let fd = openat(self.dirfd(), name, flags, Mode::empty())
            .map_err(|e| Error::from_nix(e, self.base.join(name)))?;
        Ok(Box::new(PosixFile {
            file: unsafe { File::from_raw_fd(fd) },
            path: self.base.join(name),
        }))
    }

    fn sunlink(&self, name: &str) -> Result<()> {
        unlinkat(Some(self.dirfd()), name, UnlinkatFlags::NoRemoveDir)
            .map_err(|e| Error::from_nix(e, self.base.join(name)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctxt(dir: &Path) -> Box<dyn MdalCtxt> {
        let mdal = PosixMdal::new();
        mdal.create_namespace(dir, 0o750).unwrap();
        mdal.new_ctxt(dir).unwrap()
    }

    #[test]
    fn reserved_components_are_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let ctxt = ctxt(&tmp.path().join("ns"));
        assert!(matches!(
            ctxt.mknod("MDAL_sneaky", 0o100644),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            ctxt.stat("a/MDAL_reference/x", false),
            Err(Error::PermissionDenied(_))
        ));
        assert!(ctxt.mknod("plain", 0o100644).is_ok());
    }

    #[test]
    fn usage_counters_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let ctxt = ctxt(&tmp.path().join("ns"));
        assert_eq!(ctxt.get_data_usage().unwrap(), 0);
        ctxt.set_data_usage(1 << 33).unwrap();
        assert_eq!(ctxt.get_data_usage().unwrap(), 1 << 33);
        ctxt.set_data_usage(0).unwrap();
        assert_eq!(ctxt.get_data_usage().unwrap(), 0);
    }

    #[test]
    fn hidden_xattrs_are_mapped_and_guarded() {
        let tmp = tempfile::tempdir().unwrap();
        let ctxt = ctxt(&tmp.path().join("ns"));
        ctxt.mknod("f", 0o100600).unwrap();
        let fh = ctxt.open("f", OFlag::O_RDWR, 0).unwrap();

        fh.set_xattr("objid", b"some-id", true).unwrap();
        assert_eq!(fh.get_xattr("objid", true).unwrap().unwrap(), b"some-id");

        // Direct use of the reserved prefix is refused...
        assert!(matches!(
            fh.set_xattr("user.marfs_objid", b"x", false),
            Err(Error::PermissionDenied(_))
        ));
        // ...and hidden attrs stay out of plain listings.
        assert!(fh.list_xattrs().unwrap().is_empty());
    }

    #[test]
    fn scanner_walks_ref_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let ctxt = ctxt(&tmp.path().join("ns"));
        ctxt.create_refdir("shard0", 0o700).unwrap();
        for name in &["shard0/a", "shard0/b"] {
            ctxt.open_ref(name, OFlag::O_CREAT | OFlag::O_WRONLY, 0o600)
                .unwrap();
        }
        let mut scanner = ctxt.open_scanner("shard0").unwrap();
        let mut seen = Vec::new();
        while let Some(entry) = scanner.next_entry().unwrap() {
            assert!(scanner.sstat(&entry.name).is_ok());
            seen.push(entry.name);
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn destroy_refuses_populated_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let mdal = PosixMdal::new();
        let root = tmp.path().join("ns");
        mdal.create_namespace(&root, 0o750).unwrap();
        {
            let ctxt = mdal.new_ctxt(&root).unwrap();
            ctxt.mknod("keep", 0o100644).unwrap();
        }
        assert!(matches!(
            mdal.destroy_namespace(&root),
            Err(Error::NotEmpty(_))
        ));
        let ctxt = mdal.new_ctxt(&root).unwrap();
        ctxt.unlink("keep").unwrap();
        drop(ctxt);
        mdal.destroy_namespace(&root).unwrap();
        assert!(!root.exists());
    }
}
