//! Metadata abstraction layer.
//!
//! The engine addresses its metadata store through these capability
//! traits; the reference implementation is POSIX-on-a-secure-root
//! ([`PosixMdal`]). Two kinds of paths coexist inside every namespace:
//! **user paths** (what the mount shows) and **reference paths** (internal,
//! used for safe rename-into-place and N:1 staging). A namespace root
//! holds two hidden subtrees for them plus two sparse counter files:
//!
//! ```text
//! <ns-root>/MDAL_reference/...    reference tree
//! <ns-root>/MDAL_subspaces/...    child namespaces
//! <ns-root>/MDAL_datasize         sparse file, size == bytes used
//! <ns-root>/MDAL_inodecount       sparse file, size == inodes used
//! ```
//!
//! User-supplied paths with any component starting in `MDAL_` are rejected
//! before they reach the backend, so user names can never collide with the
//! internal structure.

use std::any::Any;
use std::path::PathBuf;

use nix::fcntl::OFlag;
use nix::sys::statvfs::Statvfs;

use crate::error::Result;

mod posix;
pub use posix::*;

/// Reserved component prefix for internal structure.
pub const RESERVED_PREFIX: &str = "MDAL_";

pub const REF_DIR: &str = "MDAL_reference";
pub const SUBSPACE_DIR: &str = "MDAL_subspaces";
pub const DATA_USAGE_FILE: &str = "MDAL_datasize";
pub const INODE_USAGE_FILE: &str = "MDAL_inodecount";

/// Prefix the backend applies to hidden (system) xattrs. Non-hidden
/// operations naming it are refused.
pub const HIDDEN_XATTR_PREFIX: &str = "user.marfs_";

pub type FileStat = nix::sys::stat::FileStat;

/// `(seconds, nanoseconds)` pair for utimens-style calls.
pub type TimePair = (i64, i64);

/// One entry out of a reference-dir scan.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub name: String,
    pub inode: u64,
}

/// Backend entry point: namespace lifecycle plus context construction.
pub trait Mdal: Send + Sync {
    /// Create a namespace root together with its internal subtrees.
    fn create_namespace(&self, root: &std::path::Path, mode: u32) -> Result<()>;

    /// Remove a namespace. Refuses (`NotEmpty`) while any user content or
    /// reference entry remains.
    fn destroy_namespace(&self, root: &std::path::Path) -> Result<()>;

    fn new_ctxt(&self, root: &std::path::Path) -> Result<Box<dyn MdalCtxt>>;

    /// Verify an ancestor of `root` denies traversal to other users
    /// (mode `0700`, owned by us). With `fix`, repair the immediate
    /// parent instead of failing.
    fn checksec(&self, root: &std::path::Path, fix: bool) -> Result<()>;
}

/// A context bound to one namespace root (and its reference tree).
///
/// Contexts are not thread-safe in the aggregate-state sense; each thread
/// should obtain its own via [`MdalCtxt::dup`].
pub trait MdalCtxt: Send + Sync {
    fn dup(&self) -> Result<Box<dyn MdalCtxt>>;

    /// Device holding this context's root; split contexts must agree.
    fn device_id(&self) -> u64;

    fn as_any(&self) -> &dyn Any;

    // ---- namespace-level state ----

    /// Stat of the namespace root. `st_nlink` is adjusted down by two to
    /// hide the internal subtrees.
    fn ns_stat(&self) -> Result<FileStat>;

    fn statvfs(&self) -> Result<Statvfs>;

    fn set_data_usage(&self, bytes: u64) -> Result<()>;
    fn get_data_usage(&self) -> Result<u64>;
    fn set_inode_usage(&self, count: u64) -> Result<()>;
    fn get_inode_usage(&self) -> Result<u64>;

    // ---- user-path operations (relative to the user root) ----

    fn access(&self, path: &str, mode: u32, follow: bool) -> Result<()>;
    /// Regular files and device nodes only; directories go through `mkdir`.
    fn mknod(&self, path: &str, mode: u32) -> Result<()>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn link(&self, old: &str, new: &str) -> Result<()>;
    fn symlink(&self, target: &str, link: &str) -> Result<()>;
    fn readlink(&self, path: &str) -> Result<PathBuf>;
    /// `dst` of `None` renames within this context. A cross-context rename
    /// requires both contexts on one device.
    fn rename(&self, old: &str, dst: Option<&dyn MdalCtxt>, new: &str) -> Result<()>;
    /// Move a user-path file into `dst`'s reference tree (same-device
    /// rename-into-place; this is how files reach the trash).
    fn rename_to_ref(&self, old: &str, dst: &dyn MdalCtxt, new_rpath: &str) -> Result<()>;
    fn stat(&self, path: &str, follow: bool) -> Result<FileStat>;
    fn chmod(&self, path: &str, mode: u32, follow: bool) -> Result<()>;
    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>, follow: bool) -> Result<()>;
    fn utimens(&self, path: &str, atime: TimePair, mtime: TimePair, follow: bool) -> Result<()>;
    fn open(&self, path: &str, flags: OFlag, mode: u32) -> Result<Box<dyn MdalFile>>;
    /// Directory listing with internal entries filtered out.
    fn read_dir(&self, path: &str) -> Result<Vec<String>>;

    // ---- reference-path operations (relative to the reference tree) ----

    fn create_refdir(&self, rpath: &str, mode: u32) -> Result<()>;
    fn destroy_refdir(&self, rpath: &str) -> Result<()>;
    /// Hardlink a reference path into user space (`into_ref == false`) or
    /// to another reference path (`into_ref == true`).
    fn link_ref(&self, rpath: &str, new_path: &str, into_ref: bool) -> Result<()>;
    fn rename_ref(&self, old_rpath: &str, new_rpath: &str) -> Result<()>;
    fn unlink_ref(&self, rpath: &str) -> Result<()>;
    fn stat_ref(&self, rpath: &str) -> Result<FileStat>;
    fn open_ref(&self, rpath: &str, flags: OFlag, mode: u32) -> Result<Box<dyn MdalFile>>;
    fn open_scanner(&self, rdir: &str) -> Result<Box<dyn MdalScanner>>;
}

/// An open metadata file.
pub trait MdalFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    fn seek(&mut self, pos: std::io::SeekFrom) -> Result<u64>;
    fn ftruncate(&self, len: u64) -> Result<()>;
    fn fstat(&self) -> Result<FileStat>;
    fn futimens(&self, atime: TimePair, mtime: TimePair) -> Result<()>;

    /// Hidden xattrs are system-owned: the backend maps them under
    /// [`HIDDEN_XATTR_PREFIX`]. Non-hidden calls naming that prefix fail
    /// `PermissionDenied`. Returns `None` when the attribute is absent.
    fn get_xattr(&self, name: &str, hidden: bool) -> Result<Option<Vec<u8>>>;
    fn set_xattr(&self, name: &str, value: &[u8], hidden: bool) -> Result<()>;
    fn remove_xattr(&self, name: &str, hidden: bool) -> Result<()>;
    /// Non-hidden attribute names; hidden ones are filtered out.
    fn list_xattrs(&self) -> Result<Vec<String>>;
}

/// Iterates one reference directory via its directory FD, so GC can work
/// without re-resolving paths.
pub trait MdalScanner: Send {
    fn next_entry(&mut self) -> Result<Option<ScanEntry>>;
    fn sstat(&self, name: &str) -> Result<FileStat>;
    fn sopen(&self, name: &str, flags: OFlag) -> Result<Box<dyn MdalFile>>;
    fn sunlink(&self, name: &str) -> Result<()>;
}
