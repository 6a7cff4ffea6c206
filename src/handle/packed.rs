//! Packed-object ingest: many small files share one physical object.
//!
//! A `PackedWriter` keeps one PUT stream open across member files (the
//! stream outlives each member's close, which is why packed handles
//! survive release). Members are appended as `[data][recovery-body]`
//! units; `finish` writes the single TAIL, closes the object, and only
//! then finalizes every member's `Post` with the real member count and
//! lifts their restart markers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::config::{MarfsConfig, Namespace, Repo};
use crate::dal::Dal;
use crate::error::{Error, Result};
use crate::format::{
    write_body, write_tail, ObjType, Post, Pre, RecoveryBody, Restart, RECOVERY_BODY_SIZE,
    RECOVERY_TAIL_SIZE, XATTR_OBJID, XATTR_POST, XATTR_RESTART,
};
use crate::mdal::{Mdal, MdalCtxt, MdalFile};
use crate::resolve::{check_perms, check_quotas, expand_path, OpClass};

use super::ObjectStream;

struct PackedMember {
    sub_path: String,
    dsize: u64,
}

struct CurrentMember {
    sub_path: String,
    md_path: PathBuf,
    md: Box<dyn MdalFile>,
    announced: u64,
    written: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    hasher: crc32fast::Hasher,
}

pub struct PackedWriter {
    config: Arc<MarfsConfig>,
    ns: Arc<Namespace>,
    repo: Arc<Repo>,
    dal: Arc<dyn Dal>,
    ctxt: Box<dyn MdalCtxt>,

    pre: Option<Pre>,
    os: Option<ObjectStream>,
    /// Bytes already in the object: member data plus their bodies.
    cursor: u64,
    members: Vec<PackedMember>,
    current: Option<CurrentMember>,
    finished: bool,
}

impl PackedWriter {
    pub(crate) fn new(
        config: Arc<MarfsConfig>,
        mdal: &dyn Mdal,
        dal: Arc<dyn Dal>,
        ns: Arc<Namespace>,
        repo: Arc<Repo>,
    ) -> Result<PackedWriter> {
        if !repo.packs() {
            return Err(Error::NotPackable);
        }
        let ctxt = mdal.new_ctxt(&ns.md_path)?;
        Ok(PackedWriter {
            config,
            ns,
            repo,
            dal,
            ctxt,
            pre: None,
            os: None,
            cursor: 0,
            members: Vec::new(),
            current: None,
            finished: false,
        })
    }

    pub fn member_count(&self) -> u64 {
        self.members.len() as u64
    }

    pub fn objid(&self) -> Option<String> {
        self.pre.as_ref().and_then(|pre| pre.objid().ok())
    }

    /// Start one member file of `length` bytes. Fails `NotPackable` when
    /// the file does not qualify for packing at all, and `HandleFull` when
    /// it would overflow this object or its member quota (the caller then
    /// finishes this writer and starts a new one).
    pub fn begin(&mut self, path: &str, length: u64) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidArgument("packed writer is finished".into()));
        }
        if self.current.is_some() {
            return Err(Error::InvalidArgument(
                "previous packed member still open".into(),
            ));
        }
        if length < self.repo.min_pack_file_size
            || (self.repo.max_pack_file_size > 0 && length > self.repo.max_pack_file_size)
        {
            return Err(Error::NotPackable);
        }
        if self.members.len() as u64 + 1 > self.repo.max_pack_file_count {
            return Err(Error::HandleFull);
        }
        let need = length + RECOVERY_BODY_SIZE as u64 + RECOVERY_TAIL_SIZE as u64;
        if self.cursor + need > self.repo.chunk_size {
            return Err(Error::HandleFull);
        }

        let info = expand_path(&self.config, path)?;
        if info.ns.name != self.ns.name {
            return Err(Error::InvalidArgument(format!(
                "'{}' is outside namespace '{}'",
                path, self.ns.name
            )));
        }
        check_perms(&self.ns, OpClass::OpenWrite, false)?;
        check_quotas(&self.ns, self.ctxt.as_ref())?;

        match self.ctxt.mknod(&info.sub_path, 0o100600) {
            Ok(()) | Err(Error::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
        let md = self.ctxt.open(
            &info.sub_path,
            nix::fcntl::OFlag::O_RDWR,
            0,
        )?;
        let st = md.fstat()?;

        if self.pre.is_none() {
            // The shared object takes its identity from the first member.
            let pre = Pre::new(
                ObjType::Packed,
                &self.ns,
                &self.repo,
                st.st_ino,
                st.st_ctime,
            );
            let timeout = Duration::from_secs(self.repo.write_timeout_s);
            self.os = Some(ObjectStream::open_put(
                &self.dal,
                pre.objid()?,
                None,
                timeout,
                false,
            )?);
            self.pre = Some(pre);
        }

        let pre = self.pre.as_ref().unwrap();
        let mut post = Post::new(ObjType::Packed);
        post.obj_offset = self.cursor;

        md.set_xattr(XATTR_OBJID, pre.objid()?.as_bytes(), true)?;
        md.set_xattr(XATTR_POST, post.emit(false)?.as_bytes(), true)?;
        md.set_xattr(XATTR_RESTART, Restart::new().emit().as_bytes(), true)?;

        debug!(
            "packing '{}' at offset {} of {}",
            path,
            self.cursor,
            pre.objid()?
        );
        self.current = Some(CurrentMember {
            sub_path: info.sub_path,
            md_path: info.md_path,
            md,
            announced: length,
            written: 0,
            mode: st.st_mode,
            uid: st.st_uid,
            gid: st.st_gid,
            mtime: st.st_mtime,
            hasher: crc32fast::Hasher::new(),
        });
        Ok(())
    }

    /// Append bytes of the current member.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let cur = self
            .current
            .as_mut()
            .ok_or(Error::InvalidArgument("no packed member open".into()))?;
        if cur.written + buf.len() as u64 > cur.announced {
            return Err(Error::ContentLengthMismatch {
                announced: cur.announced,
                written: cur.written + buf.len() as u64,
            });
        }
        let os = self.os.as_mut().expect("packed stream open while packing");
        os.put_all(buf)?;
        cur.hasher.update(buf);
        cur.written += buf.len() as u64;
        Ok(buf.len())
    }

    /// Seal the current member: its recovery body goes into the shared
    /// object; its `Post` stays provisional until `finish`.
    pub fn end_member(&mut self) -> Result<()> {
        let cur = self
            .current
            .take()
            .ok_or(Error::InvalidArgument("no packed member open".into()))?;
        if cur.written != cur.announced {
            return Err(Error::ContentLengthMismatch {
                announced: cur.announced,
                written: cur.written,
            });
        }
        let pre = self.pre.as_ref().expect("pre set by begin");

        let mut post = Post::new(ObjType::Packed);
        post.obj_offset = self.cursor;
        post.correct_info = cur.hasher.finalize() as u64;

        let body = RecoveryBody::new(
            cur.written,
            cur.mode,
            cur.uid,
            cur.gid,
            cur.mtime,
            pre.objid()?,
            post.emit(false)?,
            cur.md_path.display().to_string(),
        );
        let mut footer = Vec::with_capacity(RECOVERY_BODY_SIZE);
        write_body(&mut footer, &body)?;
        let os = self.os.as_mut().expect("packed stream open while packing");
        os.put_all(&footer)?;

        cur.md.set_xattr(XATTR_POST, post.emit(false)?.as_bytes(), true)?;
        cur.md.ftruncate(cur.written)?;

        self.cursor += cur.written + RECOVERY_BODY_SIZE as u64;
        self.members.push(PackedMember {
            sub_path: cur.sub_path,
            dsize: cur.written,
        });
        Ok(())
    }

    /// Write the TAIL, close the object, then finalize every member:
    /// `Post.chunks` becomes the member count and the restart markers go
    /// away. Nothing is finalized if the object close fails.
    pub fn finish(mut self) -> Result<String> {
        if self.current.is_some() {
            return Err(Error::InvalidArgument(
                "packed member still open at finish".into(),
            ));
        }
        self.finished = true;
        let pre = match self.pre.take() {
            Some(pre) => pre,
            None => return Err(Error::InvalidArgument("empty packed writer".into())),
        };

        let mut tail = Vec::with_capacity(RECOVERY_TAIL_SIZE);
        write_tail(&mut tail, self.members.len() as u64)?;
        let mut os = self.os.take().expect("packed stream open at finish");
        os.put_all(&tail)?;
        os.close(false)?;

        let objid = pre.objid()?;
        let nfiles = self.members.len() as u64;
        for member in &self.members {
            let md = self
                .ctxt
                .open(&member.sub_path, nix::fcntl::OFlag::O_RDWR, 0)?;
            let value = md
                .get_xattr(XATTR_POST, true)?
                .ok_or_else(|| Error::NotFound(PathBuf::from(&member.sub_path)))?;
            let mut post = Post::parse(&String::from_utf8_lossy(&value))?;
            post.chunks = nfiles;
            md.set_xattr(XATTR_POST, post.emit(false)?.as_bytes(), true)?;
            md.remove_xattr(XATTR_RESTART, true).or_else(|err| match err {
                Error::NotFound(_) => Ok(()),
                other => Err(other),
            })?;
        }
        let user_bytes: u64 = self.members.iter().map(|m| m.dsize).sum();
        info!("packed {} files ({} user bytes) into {}", nfiles, user_bytes, objid);
        Ok(objid)
    }

    /// Drop the object without making it visible; member MD files keep
    /// their restart markers and fall to GC.
    pub fn abort(mut self) {
        self.finished = true;
        if let Some(mut os) = self.os.take() {
            let _ = os.close(true);
        }
    }
}
