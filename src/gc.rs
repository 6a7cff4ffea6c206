//! Trash garbage collection.
//!
//! Phase 1 walks a namespace's trash through the MDAL scanner (ascending
//! inode order, xattrs attached), classifies every entry by
//! `(Post.obj_type, restart, Pre.obj_type)`, and feeds object deletions to
//! a bounded worker pool. Packed entries are only recorded: whether a
//! packed object may die depends on *all* of its members, so phase 2 runs
//! after the scan completes and reconciles observed member counts against
//! the declared count in each `Post`.
//!
//! A per-entry failure never aborts the run; it lands in the tally and the
//! scan moves on. With `dry_run`, workers log what they would delete and
//! touch nothing, while the reconciliation map fills in exactly the same
//! way so the counters stay meaningful.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::bounded;
use log::{debug, info, warn};
use nix::fcntl::OFlag;

use crate::config::MarfsConfig;
use crate::dal::Dal;
use crate::error::{Error, Result};
use crate::format::{
    MultiChunkInfo, ObjType, Post, PostFlags, Pre, Restart, MULTI_CHUNK_INFO_SIZE, XATTR_OBJID,
    XATTR_POST, XATTR_RESTART,
};
use crate::mdal::{Mdal, MdalFile};

/// Backlog bound of the delete queue; producers block when it fills.
const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Seconds an entry must have been in the trash before it qualifies.
    pub age_threshold_s: u64,
    /// Log instead of deleting.
    pub dry_run: bool,
    pub workers: usize,
}

impl Default for GcOptions {
    fn default() -> Self {
        GcOptions {
            age_threshold_s: 0,
            dry_run: false,
            workers: 4,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct GcTally {
    pub scanned: u64,
    pub candidates: u64,
    pub objects_deleted: u64,
    pub objects_missing: u64,
    pub failures: u64,
    pub md_files_removed: u64,
    pub would_delete: u64,
    pub packed_deferred: u64,
    pub packed_deleted: u64,
    pub packed_retained: u64,
}

impl GcTally {
    fn absorb(&mut self, other: &GcTally) {
        self.objects_deleted += other.objects_deleted;
        self.objects_missing += other.objects_missing;
        self.failures += other.failures;
        self.md_files_removed += other.md_files_removed;
        self.would_delete += other.would_delete;
    }
}

/// A packed object that must stay alive because files outside the trash
/// still reference it; tooling feeds these to the repacker.
#[derive(Debug, Clone)]
pub struct RepackCandidate {
    pub ns: String,
    pub objid: String,
    pub observed: u64,
    pub declared: u64,
}

pub struct GcReport {
    pub tally: GcTally,
    pub repack_candidates: Vec<RepackCandidate>,
}

/// One trash entry queued for deletion.
struct DeleteJob {
    trash_root: std::path::PathBuf,
    entry_name: String,
    repo: String,
    objids: Vec<String>,
}

struct PackedGroup {
    declared: u64,
    repo: String,
    entries: Vec<String>,
    entry_ages_ok: bool,
}

pub struct GarbageCollector {
    config: Arc<MarfsConfig>,
    mdal: Arc<dyn Mdal>,
    dals: HashMap<String, Arc<dyn Dal>>,
    options: GcOptions,
}

impl GarbageCollector {
    pub fn new(
        config: Arc<MarfsConfig>,
        mdal: Arc<dyn Mdal>,
        dals: HashMap<String, Arc<dyn Dal>>,
        options: GcOptions,
    ) -> GarbageCollector {
        GarbageCollector {
            config,
            mdal,
            dals,
            options,
        }
    }

    /// Run over every namespace's trash.
    pub fn run(&self) -> Result<GcReport> {
        let (tx, rx) = bounded::<DeleteJob>(QUEUE_DEPTH);

        let mut workers = Vec::new();
        for id in 0..self.options.workers.max(1) {
            let rx = rx.clone();
            let dals = self.dals.clone();
            let mdal = self.mdal.clone();
            let dry_run = self.options.dry_run;
            workers.push(std::thread::spawn(move || {
                worker_loop(id, rx, dals, mdal, dry_run)
            }));
        }
        drop(rx);

        let mut tally = GcTally::default();
        let mut packed: HashMap<String, PackedGroup> = HashMap::new();
        let mut repack_candidates = Vec::new();

        for ns in self.config.namespaces() {
            if ns.is_root() {
                continue;
            }
            if let Err(err) = self.scan_namespace(ns, &tx, &mut tally, &mut packed) {
                warn!("trash scan of '{}' failed: {}", ns.name, err);
                tally.failures += 1;
            }

            // Phase 2: strictly after the whole phase-1 scan of this
            // namespace, reconcile the packed map.
            for (objid, group) in packed.drain() {
                let observed = group.entries.len() as u64;
                if observed == group.declared && group.entry_ages_ok {
                    // Fully orphaned: the object dies with all its MD files.
                    tally.packed_deleted += 1;
                    let job = DeleteJob {
                        trash_root: ns.trash_path.clone(),
                        entry_name: group.entries[0].clone(),
                        repo: group.repo.clone(),
                        objids: vec![objid.clone()],
                    };
                    self.enqueue(&tx, job, &mut tally);
                    for extra in &group.entries[1..] {
                        let job = DeleteJob {
                            trash_root: ns.trash_path.clone(),
                            entry_name: extra.clone(),
                            repo: group.repo.clone(),
                            objids: Vec::new(),
                        };
                        self.enqueue(&tx, job, &mut tally);
                    }
                } else if observed < group.declared {
                    let reason = Error::PartialPack {
                        objid: objid.clone(),
                        observed,
                        declared: group.declared,
                    };
                    info!("{}; object retained, repack candidate", reason);
                    tally.packed_retained += 1;
                    repack_candidates.push(RepackCandidate {
                        ns: ns.name.clone(),
                        objid,
                        observed,
                        declared: group.declared,
                    });
                } else {
                    warn!(
                        "packed {} observed {} members but declares {}; leaving alone \
                         (possible faulty xattr)",
                        objid, observed, group.declared
                    );
                    tally.packed_retained += 1;
                }
            }
        }

        drop(tx);
        for worker in workers {
            match worker.join() {
                Ok(worker_tally) => tally.absorb(&worker_tally),
                Err(_) => tally.failures += 1,
            }
        }

        info!(
            "gc done: scanned={} candidates={} deleted={} md_removed={} would_delete={} failures={}",
            tally.scanned,
            tally.candidates,
            tally.objects_deleted,
            tally.md_files_removed,
            tally.would_delete,
            tally.failures
        );
        Ok(GcReport {
            tally,
            repack_candidates,
        })
    }

    fn enqueue(&self, tx: &crossbeam_channel::Sender<DeleteJob>, job: DeleteJob, tally: &mut GcTally) {
        if tx.send(job).is_err() {
            tally.failures += 1;
        }
    }

    fn scan_namespace(
        &self,
        ns: &Arc<crate::config::Namespace>,
        tx: &crossbeam_channel::Sender<DeleteJob>,
        tally: &mut GcTally,
        packed: &mut HashMap<String, PackedGroup>,
    ) -> Result<()> {
        if !ns.trash_path.join(crate::mdal::REF_DIR).exists() {
            debug!("namespace '{}' has no trash yet", ns.name);
            return Ok(());
        }
        let trash_ctxt = self.mdal.new_ctxt(&ns.trash_path)?;
        let mut scanner = trash_ctxt.open_scanner("")?;

        // The scan must be consistent and inode-ordered; gather first.
        let mut entries = Vec::new();
        while let Some(entry) = scanner.next_entry()? {
            if entry.name.ends_with(".path") {
                continue;
            }
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.inode);

        let now = epoch_now();
        for entry in entries {
            tally.scanned += 1;
            let result = self.classify_entry(ns, scanner.as_ref(), &entry.name, now, tally, packed, tx);
            if let Err(err) = result {
                warn!("gc: entry '{}' skipped: {}", entry.name, err);
                tally.failures += 1;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn classify_entry(
        &self,
        ns: &Arc<crate::config::Namespace>,
        scanner: &dyn crate::mdal::MdalScanner,
        name: &str,
        now: i64,
        tally: &mut GcTally,
        packed: &mut HashMap<String, PackedGroup>,
        tx: &crossbeam_channel::Sender<DeleteJob>,
    ) -> Result<()> {
        let st = scanner.sstat(name)?;
        let md = scanner.sopen(name, OFlag::O_RDONLY)?;

        let pre_raw = md
            .get_xattr(XATTR_OBJID, true)?
            .ok_or_else(|| Error::InvalidArgument(format!("'{}' has no objid xattr", name)))?;
        let pre = Pre::parse(&String::from_utf8_lossy(&pre_raw))?;
        let post_raw = md
            .get_xattr(XATTR_POST, true)?
            .ok_or_else(|| Error::InvalidArgument(format!("'{}' has no post xattr", name)))?;
        let post = Post::parse(&String::from_utf8_lossy(&post_raw))?;
        let restart = match md.get_xattr(XATTR_RESTART, true)? {
            Some(raw) => Some(Restart::parse(&String::from_utf8_lossy(&raw))?),
            None => None,
        };

        if !post.flags.contains(PostFlags::TRASH) {
            warn!("gc: '{}' lives in trash without the TRASH bit; skipping", name);
            return Ok(());
        }
        let age_ok = now - st.st_ctime >= self.options.age_threshold_s as i64;

        if post.obj_type == ObjType::Packed {
            // Deferred to phase 2 regardless of age; the age gate applies
            // to the group as a whole.
            tally.packed_deferred += 1;
            let group = packed.entry(pre.objid()?).or_insert(PackedGroup {
                declared: post.chunks,
                repo: pre.repo.clone(),
                entries: Vec::new(),
                entry_ages_ok: true,
            });
            group.entries.push(name.to_string());
            group.entry_ages_ok &= age_ok;
            return Ok(());
        }

        if !age_ok {
            debug!("gc: '{}' younger than threshold", name);
            return Ok(());
        }
        tally.candidates += 1;

        let objids = match (post.obj_type, restart.is_some(), pre.obj_type) {
            (ObjType::Uni, false, _) => vec![pre.objid_for_chunk(0)?],
            (ObjType::Multi, false, _) => (0..post.chunks)
                .map(|k| pre.objid_for_chunk(k))
                .collect::<Result<Vec<_>>>()?,
            (_, true, ObjType::Nto1) => {
                // Only the chunks some writer actually finished exist.
                self.written_chunks(md.as_ref(), &pre, false)?
            }
            (_, true, _) => {
                // A fuse writer is sequential, so whatever exists is a
                // prefix; probe one past the last recorded chunk for the
                // object that was mid-write at the crash.
                self.written_chunks(md.as_ref(), &pre, true)?
            }
            (other, false, _) => {
                return Err(Error::InvalidArgument(format!(
                    "'{}' has unexpected complete obj_type {:?}",
                    name, other
                )));
            }
        };

        let job = DeleteJob {
            trash_root: ns.trash_path.clone(),
            entry_name: name.to_string(),
            repo: pre.repo.clone(),
            objids,
        };
        self.enqueue(tx, job, tally);
        Ok(())
    }

    /// Chunk object-IDs recorded in the MD file's chunk-info area. With
    /// `probe_next`, also name the chunk after the last record (sequential
    /// writers may have died mid-object).
    fn written_chunks(
        &self,
        md: &dyn MdalFile,
        pre: &Pre,
        probe_next: bool,
    ) -> Result<Vec<String>> {
        let mut objids = Vec::new();
        let mut last = 0u64;
        let mut chunk = 0u64;
        let mut buf = [0u8; MULTI_CHUNK_INFO_SIZE];
        loop {
            let n = md.read_at(&mut buf, MultiChunkInfo::offset_of(chunk))?;
            if n < MULTI_CHUNK_INFO_SIZE {
                break;
            }
            let record = MultiChunkInfo::from_bytes(&buf)?;
            if !record.is_blank() && record.chunk_data_bytes != 0 {
                objids.push(pre.objid_for_chunk(record.chunk_no)?);
                last = record.chunk_no;
            }
            chunk += 1;
        }
        if probe_next {
            let next = if objids.is_empty() { 0 } else { last + 1 };
            objids.push(pre.objid_for_chunk(next)?);
        }
        Ok(objids)
    }
}

/// Workers never hold shared state while talking to the backend; each has
/// its own MDAL context and reports its tally on join.
fn worker_loop(
    id: usize,
    rx: crossbeam_channel::Receiver<DeleteJob>,
    dals: HashMap<String, Arc<dyn Dal>>,
    mdal: Arc<dyn Mdal>,
    dry_run: bool,
) -> GcTally {
    let mut tally = GcTally::default();
    while let Ok(job) = rx.recv() {
        let dal = match dals.get(&job.repo) {
            Some(dal) => dal.clone(),
            None => {
                warn!("gc[{}]: no backend for repo '{}'", id, job.repo);
                tally.failures += 1;
                continue;
            }
        };

        let mut entry_ok = true;
        for objid in &job.objids {
            if dry_run {
                info!("gc[{}]: ID'd for deletion: {}", id, objid);
                tally.would_delete += 1;
                continue;
            }
            match dal.delete(objid) {
                Ok(()) => tally.objects_deleted += 1,
                Err(Error::NotFound(_)) => {
                    debug!("gc[{}]: {} already gone", id, objid);
                    tally.objects_missing += 1;
                }
                Err(err) => {
                    warn!("gc[{}]: delete {} failed: {}", id, objid, err);
                    tally.failures += 1;
                    entry_ok = false;
                }
            }
        }

        if dry_run {
            info!(
                "gc[{}]: ID'd for removal: {} (+ companion)",
                id, job.entry_name
            );
            tally.would_delete += 1;
            continue;
        }
        if !entry_ok {
            // Leave the MD entry so the next run retries the objects.
            continue;
        }
        match mdal.new_ctxt(&job.trash_root) {
            Ok(ctxt) => {
                match ctxt.unlink_ref(&job.entry_name) {
                    Ok(()) => tally.md_files_removed += 1,
                    Err(err) => {
                        warn!("gc[{}]: unlink {} failed: {}", id, job.entry_name, err);
                        tally.failures += 1;
                        continue;
                    }
                }
                let companion = format!("{}.path", job.entry_name);
                match ctxt.unlink_ref(&companion) {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(err) => {
                        warn!("gc[{}]: unlink {} failed: {}", id, companion, err);
                        tally.failures += 1;
                    }
                }
            }
            Err(err) => {
                warn!("gc[{}]: no trash context: {}", id, err);
                tally.failures += 1;
            }
        }
    }
    tally
}

fn epoch_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}
