//! The user-facing operation surface: every filesystem call a front-end
//! (fuse binding, pftool) issues lands here, gets permission-gated and
//! resolved, and is carried out against the MDAL/DAL plus the file-handle
//! engine.
//!
//! Unlinked files are never deleted in place: the MD file is renamed into
//! the namespace's trash (with a `.path` companion recording the original
//! user path) and the garbage collector reclaims the objects later.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, info};
use nix::fcntl::OFlag;

use crate::config::{MarfsConfig, Namespace};
use crate::dal::Dal;
use crate::error::{Error, Result};
use crate::format::{
    epoch_to_str, MultiChunkInfo, ObjType, Post, PostFlags, Pre, Restart, RestartFlags,
    MULTI_CHUNK_INFO_SIZE, XATTR_OBJID, XATTR_POST, XATTR_RESTART,
};
use crate::handle::{FhFlags, FileHandle, HandleState, PackedWriter, ReadQueue};
use crate::mdal::{FileStat, Mdal, MdalCtxt, MdalFile, REF_DIR};
use crate::resolve::{check_perms, check_quotas, expand_path, OpClass, PathInfo};

/// Filesystem-level usage/capacity summary (`statvfs`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namemax: u64,
}

/// Parsed system xattrs of one MD file.
#[derive(Default)]
pub(crate) struct MdXattrs {
    pub pre: Option<Pre>,
    pub post: Option<Post>,
    pub restart: Option<Restart>,
}

impl MdXattrs {
    pub fn any(&self) -> bool {
        self.pre.is_some() || self.post.is_some() || self.restart.is_some()
    }

    /// Invariant: a complete file carries the full `{Pre, Post}` set.
    pub fn complete(&self) -> bool {
        self.pre.is_some() && self.post.is_some()
    }
}

pub(crate) fn stat_xattrs(md: &dyn MdalFile) -> Result<MdXattrs> {
    let mut out = MdXattrs::default();
    if let Some(raw) = md.get_xattr(XATTR_OBJID, true)? {
        out.pre = Some(Pre::parse(&String::from_utf8_lossy(&raw))?);
    }
    if let Some(raw) = md.get_xattr(XATTR_POST, true)? {
        out.post = Some(Post::parse(&String::from_utf8_lossy(&raw))?);
    }
    if let Some(raw) = md.get_xattr(XATTR_RESTART, true)? {
        out.restart = Some(Restart::parse(&String::from_utf8_lossy(&raw))?);
    }
    Ok(out)
}

pub struct Marfs {
    config: Arc<MarfsConfig>,
    mdal: Arc<dyn Mdal>,
    dals: HashMap<String, Arc<dyn Dal>>,
    /// Interactive (fuse) engines check iperms and write via the
    /// interactive repo; batch engines (pftool) use bperms and the
    /// size-keyed range list.
    interactive: bool,
}

impl Marfs {
    pub fn new(
        config: Arc<MarfsConfig>,
        mdal: Arc<dyn Mdal>,
        dals: HashMap<String, Arc<dyn Dal>>,
        interactive: bool,
    ) -> Result<Marfs> {
        for repo in config.repos() {
            if !repo.is_direct() && !dals.contains_key(&repo.name) {
                return Err(Error::InvalidArgument(format!(
                    "repo '{}' has no data backend",
                    repo.name
                )));
            }
        }
        Ok(Marfs {
            config,
            mdal,
            dals,
            interactive,
        })
    }

    pub fn config(&self) -> &Arc<MarfsConfig> {
        &self.config
    }

    fn resolve(&self, path: &str) -> Result<PathInfo> {
        expand_path(&self.config, path)
    }

    fn ctxt(&self, ns: &Namespace) -> Result<Box<dyn MdalCtxt>> {
        self.mdal.new_ctxt(&ns.md_path)
    }

    fn dal_for(&self, repo_name: &str) -> Result<Arc<dyn Dal>> {
        self.dals
            .get(repo_name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no backend for repo '{}'", repo_name)))
    }

    fn gate(&self, info: &PathInfo, op: OpClass) -> Result<()> {
        check_perms(&info.ns, op, self.interactive)
    }

    fn file_path<'a>(&self, info: &'a PathInfo) -> Result<&'a str> {
        if info.sub_path.is_empty() {
            return Err(Error::InvalidArgument(
                "operation needs a file, not a namespace root".into(),
            ));
        }
        Ok(&info.sub_path)
    }

    // ---------------- pure-metadata operations ----------------

    pub fn access(&self, path: &str, mode: u32) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::ReadMeta)?;
        if info.sub_path.is_empty() {
            return Ok(());
        }
        self.ctxt(&info.ns)?.access(&info.sub_path, mode, true)
    }

    pub fn getattr(&self, path: &str) -> Result<FileStat> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::ReadMeta)?;
        let ctxt = self.ctxt(&info.ns)?;
        if info.sub_path.is_empty() {
            ctxt.ns_stat()
        } else {
            ctxt.stat(&info.sub_path, false)
        }
    }

    pub fn opendir(&self, path: &str) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::ReadMeta)
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::ReadMeta)?;
        self.ctxt(&info.ns)?.read_dir(&info.sub_path)
    }

    pub fn releasedir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<PathBuf> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::ReadMeta)?;
        self.ctxt(&info.ns)?.readlink(self.file_path(&info)?)
    }

    pub fn statvfs(&self, path: &str) -> Result<StatFs> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::ReadMeta)?;
        if info.ns.is_root() {
            // The root namespace has no store of its own; aggregate the
            // per-namespace fsinfo sizes where present.
            let mut used = 0u64;
            for ns in self.config.namespaces().filter(|ns| !ns.is_root()) {
                if let Ok(meta) = std::fs::metadata(&ns.fsinfo_path) {
                    used += meta.len();
                }
            }
            return Ok(StatFs {
                bsize: 4096,
                frsize: 4096,
                blocks: (used + 4095) / 4096,
                namemax: 255,
                ..StatFs::default()
            });
        }
        let vfs = self.ctxt(&info.ns)?.statvfs()?;
        Ok(StatFs {
            bsize: vfs.block_size() as u64,
            frsize: vfs.fragment_size() as u64,
            blocks: vfs.blocks() as u64,
            bfree: vfs.blocks_free() as u64,
            bavail: vfs.blocks_available() as u64,
            files: vfs.files() as u64,
            ffree: vfs.files_free() as u64,
            namemax: vfs.name_max() as u64,
        })
    }

    pub fn fsync(&self, _path: &str) -> Result<()> {
        // Data reaches the object store on flush; nothing buffers here.
        Ok(())
    }

    pub fn fsyncdir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    pub fn ioctl(&self, _path: &str) -> Result<()> {
        Err(Error::Unsupported("ioctl"))
    }

    // ---------------- metadata mutation ----------------

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::WriteMeta)?;
        self.ctxt(&info.ns)?.mkdir(self.file_path(&info)?, mode)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::WriteMeta)?;
        self.ctxt(&info.ns)?.rmdir(self.file_path(&info)?)
    }

    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let info = self.resolve(link)?;
        self.gate(&info, OpClass::WriteMeta)?;
        self.ctxt(&info.ns)?.symlink(target, self.file_path(&info)?)
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_info = self.resolve(old)?;
        let new_info = self.resolve(new)?;
        self.gate(&old_info, OpClass::WriteMeta)?;
        self.gate(&new_info, OpClass::WriteMeta)?;
        let old_ctxt = self.ctxt(&old_info.ns)?;
        if old_info.ns.name == new_info.ns.name {
            old_ctxt.rename(&old_info.sub_path, None, &new_info.sub_path)
        } else {
            let new_ctxt = self.ctxt(&new_info.ns)?;
            old_ctxt.rename(&old_info.sub_path, Some(new_ctxt.as_ref()), &new_info.sub_path)
        }
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::WriteMeta)?;
        self.ctxt(&info.ns)?.chmod(self.file_path(&info)?, mode, true)
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::WriteMeta)?;
        self.ctxt(&info.ns)?
            .chown(self.file_path(&info)?, uid, gid, true)
    }

    pub fn utimens(&self, path: &str, atime: (i64, i64), mtime: (i64, i64)) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::WriteMeta)?;
        self.ctxt(&info.ns)?
            .utimens(self.file_path(&info)?, atime, mtime, true)
    }

    // ---------------- xattr surface ----------------

    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::ReadMeta)?;
        if info.ns.is_root() {
            // The root namespace exposes no attributes at all.
            return Err(Error::NotFound(PathBuf::from(path)));
        }
        let md = self
            .ctxt(&info.ns)?
            .open(self.file_path(&info)?, OFlag::O_RDONLY, 0)?;
        md.get_xattr(name, false)?
            .ok_or_else(|| Error::NotFound(PathBuf::from(path)))
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::WriteMeta)?;
        let md = self
            .ctxt(&info.ns)?
            .open(self.file_path(&info)?, OFlag::O_RDONLY, 0)?;
        md.set_xattr(name, value, false)
    }

    pub fn listxattr(&self, path: &str) -> Result<Vec<String>> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::ReadMeta)?;
        let md = self
            .ctxt(&info.ns)?
            .open(self.file_path(&info)?, OFlag::O_RDONLY, 0)?;
        md.list_xattrs()
    }

    pub fn removexattr(&self, path: &str, name: &str) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::WriteMeta)?;
        let md = self
            .ctxt(&info.ns)?
            .open(self.file_path(&info)?, OFlag::O_RDONLY, 0)?;
        md.remove_xattr(name, false)
    }

    // ---------------- create / open ----------------

    /// Create an MD entry and stamp its storage identity. The restart
    /// marker stays on until a successful close; if the requested mode
    /// would forbid xattr manipulation, the file is created writable and
    /// the intended mode parks inside the restart marker.
    pub fn mknod(&self, path: &str, mode: u32) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::Create)?;
        let ctxt = self.ctxt(&info.ns)?;
        check_quotas(&info.ns, ctxt.as_ref())?;
        let sub = self.file_path(&info)?;

        let repo = crate::resolve::repo_for_write(&self.config, &info.ns, None, self.interactive)?;
        let perm_bits = mode & 0o7777;
        let owner_writable = perm_bits & 0o200 != 0;
        let create_bits = if owner_writable { perm_bits } else { 0o600 };
        ctxt.mknod(sub, libc::S_IFREG | create_bits)?;

        if repo.is_direct() {
            return Ok(());
        }

        let md = ctxt.open(sub, OFlag::O_RDWR, 0)?;
        let st = md.fstat()?;
        let obj_type = if self.interactive {
            ObjType::Fuse
        } else {
            ObjType::Nto1
        };
        let pre = Pre::new(obj_type, &info.ns, &repo, st.st_ino, st.st_ctime);
        let post = Post::new(ObjType::Uni);
        let restart = if owner_writable {
            Restart::new()
        } else {
            Restart::with_mode(perm_bits)
        };
        md.set_xattr(XATTR_OBJID, pre.objid()?.as_bytes(), true)?;
        md.set_xattr(XATTR_POST, post.emit(false)?.as_bytes(), true)?;
        md.set_xattr(XATTR_RESTART, restart.emit().as_bytes(), true)?;
        debug!("mknod '{}' -> {}", path, pre.objid()?);
        Ok(())
    }

    /// Flag-driven open, the shape a fuse binding calls. Append mode,
    /// read-write opens, creation without a prior mknod, and truncating
    /// opens are all unsupported by design.
    pub fn open(&self, path: &str, flags: OFlag) -> Result<Arc<FileHandle>> {
        if flags.contains(OFlag::O_APPEND) {
            return Err(Error::Unsupported("append mode"));
        }
        if flags & OFlag::O_ACCMODE == OFlag::O_RDWR {
            return Err(Error::Unsupported("read-write opens"));
        }
        if flags.contains(OFlag::O_TRUNC) {
            return Err(Error::Unsupported("truncating open (truncate first)"));
        }
        if flags & OFlag::O_ACCMODE == OFlag::O_WRONLY {
            self.open_write(path)
        } else {
            self.open_read(path)
        }
    }

    pub fn open_read(&self, path: &str) -> Result<Arc<FileHandle>> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::OpenRead)?;
        let ctxt = self.ctxt(&info.ns)?;
        let sub = self.file_path(&info)?;
        let md = ctxt.open(sub, OFlag::O_RDONLY, 0)?;
        let st = md.fstat()?;
        let xattrs = stat_xattrs(md.as_ref())?;

        if !xattrs.any() {
            // Data lives in the MD file itself.
            let repo = self.config.repo(&info.ns.iwrite_repo)?;
            let pre_dummy = Pre::new(ObjType::None, &info.ns, &repo, st.st_ino, st.st_ctime);
            return Ok(self.build_handle(
                info,
                path,
                repo,
                None,
                md,
                &st,
                FhFlags::READING | FhFlags::DIRECT,
                pre_dummy,
                Post::new(ObjType::None),
                None,
            ));
        }
        if xattrs.restart.is_some() {
            return Err(Error::InvalidArgument(format!(
                "'{}' is incomplete (restart marker present)",
                path
            )));
        }
        if !xattrs.complete() {
            return Err(Error::InvalidArgument(format!(
                "'{}' carries a partial xattr set",
                path
            )));
        }

        let pre = xattrs.pre.unwrap();
        let post = xattrs.post.unwrap();
        let repo = self.config.repo(&pre.repo)?;
        let dal = self.dal_for(&repo.name)?;
        let mut flags = FhFlags::READING;
        if post.obj_type == ObjType::Packed {
            flags |= FhFlags::PACKED;
        }
        Ok(self.build_handle(info, path, repo, Some(dal), md, &st, flags, pre, post, None))
    }

    pub fn open_write(&self, path: &str) -> Result<Arc<FileHandle>> {
        self.open_write_at(path, 0, 0, false)
    }

    /// pftool ranged ingest: open for writing at `offset` (which must land
    /// on a chunk boundary). `length` is the announced span; 0 = unknown.
    /// Each parallel writer installs its own chunk-info records; the
    /// whole-file finalize happens once through [`Marfs::finalize_parallel`].
    pub fn open_at_offset(&self, path: &str, offset: u64, length: u64) -> Result<Arc<FileHandle>> {
        self.open_write_at(path, offset, length, true)
    }

    fn open_write_at(
        &self,
        path: &str,
        offset: u64,
        _length: u64,
        n_to_1: bool,
    ) -> Result<Arc<FileHandle>> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::OpenWrite)?;
        let ctxt = self.ctxt(&info.ns)?;
        check_quotas(&info.ns, ctxt.as_ref())?;
        let sub = self.file_path(&info)?;
        let md = ctxt.open(sub, OFlag::O_RDWR, 0)?;
        let st = md.fstat()?;
        let xattrs = stat_xattrs(md.as_ref())?;

        if !xattrs.any() {
            let repo = self.config.repo(&info.ns.iwrite_repo)?;
            if !repo.is_direct() {
                return Err(Error::Unsupported("open for write without prior mknod"));
            }
            if offset != 0 || n_to_1 {
                return Err(Error::InvalidArgument(
                    "DIRECT files take no ranged opens".into(),
                ));
            }
            let pre_dummy = Pre::new(ObjType::None, &info.ns, &repo, st.st_ino, st.st_ctime);
            return Ok(self.build_handle(
                info,
                path,
                repo,
                None,
                md,
                &st,
                FhFlags::WRITING | FhFlags::DIRECT,
                pre_dummy,
                Post::new(ObjType::None),
                None,
            ));
        }
        if xattrs.restart.is_none() {
            return Err(Error::Unsupported(
                "overwrite of a complete file without truncate",
            ));
        }
        let mut pre = xattrs.pre.ok_or_else(|| {
            Error::InvalidArgument(format!("'{}' carries a partial xattr set", path))
        })?;
        let post = xattrs
            .post
            .unwrap_or_else(|| Post::new(ObjType::Uni));
        let repo = self.config.repo(&pre.repo)?;
        let dal = self.dal_for(&repo.name)?;

        let mut flags = FhFlags::WRITING;
        if n_to_1 || offset != 0 {
            flags |= FhFlags::N_TO_1;
            let stride = repo.capacity();
            if offset % stride != 0 {
                return Err(Error::OffsetNotAligned { offset, stride });
            }
            pre.chunk_no = offset / stride;
        }

        Ok(self.build_handle(
            info,
            path,
            repo,
            Some(dal),
            md,
            &st,
            flags,
            pre,
            post,
            xattrs.restart,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_handle(
        &self,
        info: PathInfo,
        path: &str,
        repo: Arc<crate::config::Repo>,
        dal: Option<Arc<dyn Dal>>,
        md: Box<dyn MdalFile>,
        st: &FileStat,
        flags: FhFlags,
        pre: Pre,
        post: Post,
        restart: Option<Restart>,
    ) -> Arc<FileHandle> {
        let open_offset = pre.chunk_no * repo.capacity();
        let state = HandleState {
            flags,
            pre,
            post,
            restart,
            md: Some(md),
            md_size: st.st_size as u64,
            md_mode: st.st_mode,
            md_uid: st.st_uid,
            md_gid: st.st_gid,
            md_mtime: st.st_mtime,
            os: None,
            log_offset: 0,
            queue: ReadQueue::default(),
            open_offset,
            logical_end: open_offset,
            user_in_obj: 0,
            sys_writes: 0,
            chunks_closed: 0,
            hasher: crc32fast::Hasher::new(),
            pending_record: None,
            first_errno: None,
        };
        Arc::new(FileHandle {
            repo,
            dal,
            md_path: info.md_path,
            user_path: path.to_string(),
            state: Mutex::new(state),
            cv: Condvar::new(),
        })
    }

    /// Ingest many small files into shared packed objects.
    pub fn packed_writer(&self, ns_path: &str) -> Result<PackedWriter> {
        let info = self.resolve(ns_path)?;
        check_perms(&info.ns, OpClass::OpenWrite, false)?;
        let repo =
            crate::resolve::repo_for_write(&self.config, &info.ns, None, false)?;
        let dal = self.dal_for(&repo.name)?;
        PackedWriter::new(
            self.config.clone(),
            self.mdal.as_ref(),
            dal,
            info.ns,
            repo,
        )
    }

    // ---------------- unlink / truncate / trash ----------------

    pub fn unlink(&self, path: &str) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::Unlink)?;
        let ctxt = self.ctxt(&info.ns)?;
        let sub = self.file_path(&info)?;

        let md = ctxt.open(sub, OFlag::O_RDWR, 0)?;
        let xattrs = stat_xattrs(md.as_ref())?;
        if !xattrs.any() {
            drop(md);
            return ctxt.unlink(sub);
        }
        self.move_to_trash(&info, ctxt.as_ref(), md, xattrs, path)?;
        Ok(())
    }

    /// Only whole-file truncation is supported: the existing storage goes
    /// to the trash and the path is recreated empty with a fresh identity.
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        if len != 0 {
            return Err(Error::Unsupported("partial truncate"));
        }
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::Truncate)?;
        let ctxt = self.ctxt(&info.ns)?;
        let sub = self.file_path(&info)?;

        let md = ctxt.open(sub, OFlag::O_RDWR, 0)?;
        let st = md.fstat()?;
        let xattrs = stat_xattrs(md.as_ref())?;
        if !xattrs.any() {
            return md.ftruncate(0);
        }
        let old_pre = xattrs.pre.clone();
        self.move_to_trash(&info, ctxt.as_ref(), md, xattrs, path)?;

        // Recreate the path with a fresh storage identity. When the
        // overwrite lands within the same second as the original, the
        // unique byte keeps the new object-ID distinct.
        let perm_bits = st.st_mode & 0o7777;
        ctxt.mknod(sub, libc::S_IFREG | (perm_bits | 0o200))?;
        let md = ctxt.open(sub, OFlag::O_RDWR, 0)?;
        let new_st = md.fstat()?;
        let repo = crate::resolve::repo_for_write(&self.config, &info.ns, None, self.interactive)?;
        let obj_type = if self.interactive {
            ObjType::Fuse
        } else {
            ObjType::Nto1
        };
        let mut pre = Pre::new(obj_type, &info.ns, &repo, new_st.st_ino, new_st.st_ctime);
        if let Some(old) = old_pre {
            if old.md_ctime == pre.md_ctime && old.obj_ctime == pre.obj_ctime {
                pre.unique = old.unique.wrapping_add(1);
            }
        }
        let restart = if perm_bits & 0o200 != 0 {
            Restart::new()
        } else {
            Restart::with_mode(perm_bits)
        };
        md.set_xattr(XATTR_OBJID, pre.objid()?.as_bytes(), true)?;
        md.set_xattr(
            XATTR_POST,
            Post::new(ObjType::Uni).emit(false)?.as_bytes(),
            true,
        )?;
        md.set_xattr(XATTR_RESTART, restart.emit().as_bytes(), true)?;
        Ok(())
    }

    fn move_to_trash(
        &self,
        info: &PathInfo,
        ctxt: &dyn MdalCtxt,
        md: Box<dyn MdalFile>,
        xattrs: MdXattrs,
        user_path: &str,
    ) -> Result<()> {
        let st = md.fstat()?;
        self.mdal.create_namespace(&info.ns.trash_path, 0o700)?;
        let trash_ctxt = self.mdal.new_ctxt(&info.ns.trash_path)?;

        let base = info
            .sub_path
            .rsplit('/')
            .next()
            .unwrap_or(&info.sub_path);
        let stamp = epoch_to_str(now_epoch())?;
        let trash_name = format!("{}.trash_{:010x}_{}", base, st.st_ino, stamp);
        let trash_md_path = info
            .ns
            .trash_path
            .join(REF_DIR)
            .join(&trash_name);

        // Post gains the TRASH bit and the absolute trash location, so a
        // later inode scan needs no tree walk to find the file.
        let mut post = xattrs.post.unwrap_or_else(|| Post::new(ObjType::Uni));
        post.flags.insert(PostFlags::TRASH);
        post.md_path = trash_md_path.display().to_string();
        md.set_xattr(XATTR_POST, post.emit(true)?.as_bytes(), true)?;
        drop(md);

        // Companion file holds the original user path, for undelete.
        let mut companion = trash_ctxt.open_ref(
            &format!("{}.path", trash_name),
            OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC,
            0o600,
        )?;
        companion.write(user_path.as_bytes())?;
        drop(companion);

        ctxt.rename_to_ref(&info.sub_path, trash_ctxt.as_ref(), &trash_name)?;
        info!("trashed '{}' as {}", user_path, trash_name);
        Ok(())
    }

    // ---------------- N:1 completion ----------------

    /// pftool post-processing after all parallel writers finished: verify
    /// the chunk-info records, finalize `Post`, trim the MD file and lift
    /// the restart marker. Reached through the utime path in the original
    /// surface.
    pub fn finalize_parallel(&self, path: &str, total_size: u64) -> Result<()> {
        let info = self.resolve(path)?;
        self.gate(&info, OpClass::WriteMeta)?;
        let ctxt = self.ctxt(&info.ns)?;
        let sub = self.file_path(&info)?;
        let md = ctxt.open(sub, OFlag::O_RDWR, 0)?;
        let xattrs = stat_xattrs(md.as_ref())?;

        let mut pre = xattrs
            .pre
            .ok_or_else(|| Error::InvalidArgument(format!("'{}' has no storage identity", path)))?;
        let restart = xattrs.restart.ok_or_else(|| {
            Error::InvalidArgument(format!("'{}' is not awaiting N:1 completion", path))
        })?;

        let repo = self.config.repo(&pre.repo)?;
        let capacity = repo.capacity();
        let chunks = if total_size == 0 {
            1
        } else {
            (total_size + capacity - 1) / capacity
        };

        // Every chunk slot must have been installed by some writer.
        let mut buf = [0u8; MULTI_CHUNK_INFO_SIZE];
        for chunk in 0..chunks {
            let n = md.read_at(&mut buf, MultiChunkInfo::offset_of(chunk))?;
            let record = if n == MULTI_CHUNK_INFO_SIZE {
                MultiChunkInfo::from_bytes(&buf)?
            } else {
                MultiChunkInfo::default()
            };
            if record.is_blank() || record.chunk_data_bytes == 0 {
                return Err(Error::InvalidArgument(format!(
                    "'{}' is missing chunk {} of {}",
                    path, chunk, chunks
                )));
            }
        }

        let mut post = xattrs.post.unwrap_or_else(|| Post::new(ObjType::Uni));
        post.obj_type = if chunks > 1 { ObjType::Multi } else { ObjType::Uni };
        post.chunks = chunks;
        post.chunk_info_bytes = chunks * MULTI_CHUNK_INFO_SIZE as u64;

        md.ftruncate(total_size)?;
        pre.chunk_no = 0;
        md.set_xattr(XATTR_OBJID, pre.objid()?.as_bytes(), true)?;
        md.set_xattr(XATTR_POST, post.emit(false)?.as_bytes(), true)?;
        md.remove_xattr(XATTR_RESTART, true).or_else(|err| match err {
            Error::NotFound(_) => Ok(()),
            other => Err(other),
        })?;
        if restart.flags.contains(RestartFlags::MODE_VALID) {
            ctxt.chmod(sub, restart.mode, true)?;
        }
        Ok(())
    }
}

fn now_epoch() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}
