//! Packed-object repacking: rebuild sparsely-referenced packed objects
//! into dense replacements.
//!
//! When GC finds a packed object with fewer trash references than its
//! declared member count, the surviving members still pin the whole
//! object. Tooling resolves those survivors (an inode scan over the live
//! MDFS) and hands them here: each survivor's bytes stream out of the old
//! object at its recorded offset and into a fresh packed object whose
//! `unique` byte is bumped so the identity differs. The member MD files
//! are then repointed, which strands the old object with zero references;
//! the next GC pass reaps it. The whole pass is advisory: anything that
//! does not fit is skipped with a warning, never broken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use nix::fcntl::OFlag;

use crate::config::MarfsConfig;
use crate::dal::{Dal, OpenSpec};
use crate::error::{Error, Result};
use crate::format::{
    write_body, write_tail, ObjType, Post, Pre, RecoveryBody, RECOVERY_BODY_SIZE,
    RECOVERY_TAIL_SIZE, XATTR_OBJID, XATTR_POST,
};
use crate::handle::ObjectStream;
use crate::mdal::Mdal;

/// One packed object to rebuild: its ID plus the surviving members'
/// MD paths (relative to the namespace context root).
#[derive(Debug, Clone)]
pub struct RepackEntry {
    pub ns: String,
    pub objid: String,
    pub members: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RepackTally {
    pub objects_repacked: u64,
    pub members_moved: u64,
    pub skipped: u64,
}

pub struct Repacker {
    config: Arc<MarfsConfig>,
    mdal: Arc<dyn Mdal>,
    dals: HashMap<String, Arc<dyn Dal>>,
}

impl Repacker {
    pub fn new(
        config: Arc<MarfsConfig>,
        mdal: Arc<dyn Mdal>,
        dals: HashMap<String, Arc<dyn Dal>>,
    ) -> Repacker {
        Repacker { config, mdal, dals }
    }

    pub fn run(&self, entries: &[RepackEntry]) -> Result<RepackTally> {
        let mut tally = RepackTally::default();
        for entry in entries {
            match self.repack_one(entry) {
                Ok(moved) => {
                    tally.objects_repacked += 1;
                    tally.members_moved += moved;
                }
                Err(err) => {
                    warn!("repack of {} skipped: {}", entry.objid, err);
                    tally.skipped += 1;
                }
            }
        }
        Ok(tally)
    }

    fn repack_one(&self, entry: &RepackEntry) -> Result<u64> {
        if entry.members.is_empty() {
            return Err(Error::InvalidArgument("no surviving members".into()));
        }
        let ns = self
            .config
            .namespace(&entry.ns)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown namespace '{}'", entry.ns)))?;
        let old_pre = Pre::parse(&entry.objid)?;
        let repo = self.config.repo(&old_pre.repo)?;
        let dal = self
            .dals
            .get(&repo.name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no backend for '{}'", repo.name)))?;
        let ctxt = self.mdal.new_ctxt(&ns.md_path)?;

        // Gather survivors and make sure the dense pack will fit before
        // touching anything.
        struct Survivor {
            sub_path: String,
            md: Box<dyn crate::mdal::MdalFile>,
            old_offset: u64,
            dsize: u64,
            mode: u32,
            uid: u32,
            gid: u32,
            mtime: i64,
        }
        let mut survivors = Vec::new();
        let mut need = RECOVERY_TAIL_SIZE as u64;
        for sub_path in &entry.members {
            let md = ctxt.open(sub_path, OFlag::O_RDWR, 0)?;
            let st = md.fstat()?;
            let post_raw = md
                .get_xattr(XATTR_POST, true)?
                .ok_or_else(|| Error::InvalidArgument(format!("'{}' has no post", sub_path)))?;
            let post = Post::parse(&String::from_utf8_lossy(&post_raw))?;
            if post.obj_type != ObjType::Packed {
                return Err(Error::InvalidArgument(format!(
                    "'{}' is not packed",
                    sub_path
                )));
            }
            need += st.st_size as u64 + RECOVERY_BODY_SIZE as u64;
            survivors.push(Survivor {
                sub_path: sub_path.clone(),
                md,
                old_offset: post.obj_offset,
                dsize: st.st_size as u64,
                mode: st.st_mode,
                uid: st.st_uid,
                gid: st.st_gid,
                mtime: st.st_mtime,
            });
        }
        if need > repo.chunk_size {
            return Err(Error::RepackOverflow {
                need,
                chunk_size: repo.chunk_size,
            });
        }

        let mut new_pre = old_pre.clone();
        new_pre.unique = new_pre.unique.wrapping_add(1);
        new_pre.obj_ctime = epoch_now();
        new_pre.seed = rand::random();
        let new_objid = new_pre.objid()?;

        let timeout = Duration::from_secs(repo.write_timeout_s);
        let mut os = ObjectStream::open_put(&dal, new_objid.clone(), None, timeout, false)?;

        let nfiles = survivors.len() as u64;
        let mut cursor = 0u64;
        let mut updates = Vec::new();
        for s in &survivors {
            // Stream the member's bytes straight across.
            let mut reader = dal.open(
                &entry.objid,
                OpenSpec::get(s.old_offset, Some(s.dsize), timeout),
            )?;
            let mut copied = 0u64;
            let mut hasher = crc32fast::Hasher::new();
            let mut buf = vec![0u8; 64 * 1024];
            while copied < s.dsize {
                let n = reader.get(&mut buf)?;
                if n == 0 {
                    return Err(Error::Truncated("packed member data"));
                }
                os.put_all(&buf[..n])?;
                hasher.update(&buf[..n]);
                copied += n as u64;
            }
            reader.close(false)?;

            let mut post = Post::new(ObjType::Packed);
            post.obj_offset = cursor;
            post.chunks = nfiles;
            post.correct_info = hasher.finalize() as u64;

            let body = RecoveryBody::new(
                s.dsize,
                s.mode,
                s.uid,
                s.gid,
                s.mtime,
                new_objid.clone(),
                post.emit(false)?,
                ns.md_path.join(&s.sub_path).display().to_string(),
            );
            let mut footer = Vec::with_capacity(RECOVERY_BODY_SIZE);
            write_body(&mut footer, &body)?;
            os.put_all(&footer)?;

            cursor += s.dsize + RECOVERY_BODY_SIZE as u64;
            updates.push(post);
        }

        let mut tail = Vec::with_capacity(RECOVERY_TAIL_SIZE);
        write_tail(&mut tail, nfiles)?;
        os.put_all(&tail)?;
        os.close(false)?;

        // Only after the replacement object is durable do the MD files
        // flip over; the old object keeps every reference until then.
        for (s, post) in survivors.iter().zip(updates.iter()) {
            s.md.set_xattr(XATTR_OBJID, new_objid.as_bytes(), true)?;
            s.md.set_xattr(XATTR_POST, post.emit(false)?.as_bytes(), true)?;
        }
        info!(
            "repacked {} members of {} into {}",
            nfiles, entry.objid, new_objid
        );
        Ok(nfiles)
    }
}

fn epoch_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}
