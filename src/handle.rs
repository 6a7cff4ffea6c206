//! Per-open file-handle engine: the read/write state machines that stream
//! user data across chunk boundaries, splice recovery info into object
//! tails, and serialize concurrent readers sharing one handle.
//!
//! A handle's mutable state lives behind one mutex (the `read_lock` of the
//! original design); reads are serialized by it and writes are contiguous
//! by contract. NFS-style clients that re-dispatch one open handle across
//! worker threads are detected at run time and switch the handle into
//! multi-thread mode, where out-of-order reads park on an offset-ordered
//! queue instead of thrashing the stream with close/reopen cycles.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::Repo;
use crate::dal::Dal;
use crate::error::{Error, Result};
use crate::format::{
    write_body, write_tail, MultiChunkInfo, ObjType, Post, Pre, RecoveryBody, Restart,
    MULTI_CHUNK_INFO_SIZE, RECOVERY_SIZE, XATTR_OBJID, XATTR_POST, XATTR_RESTART,
};
use crate::mdal::MdalFile;

mod stream;
pub use stream::*;

mod read_queue;
pub use read_queue::*;

mod packed;
pub use packed::*;

bitflags::bitflags! {
    pub struct FhFlags: u32 {
        const READING      = 0x0001;
        const WRITING      = 0x0002;
        const PACKED       = 0x0004;
        const N_TO_1       = 0x0008;
        /// Several threads observed reading one handle; queue discipline on.
        const MULTI_THREAD = 0x0010;
        const RELEASING    = 0x0020;
        const FLUSHED      = 0x0040;
        const ERRORS       = 0x0080;
        const ABORTED      = 0x0100;
        /// No object storage behind this file; the MD file holds the data.
        const DIRECT       = 0x0200;
    }
}

/// How long a single-thread discontiguous read waits for the stream to
/// catch up before concluding it must close/reopen.
const DISCONTIG_RETRIES: u32 = 5;
const DISCONTIG_WAIT: Duration = Duration::from_millis(20);
/// Timed wait of a queued reader before the head waiter elects itself.
const QUEUED_READ_WAIT: Duration = Duration::from_secs(4);

pub(crate) struct HandleState {
    pub flags: FhFlags,
    pub pre: Pre,
    pub post: Post,
    pub restart: Option<Restart>,

    pub md: Option<Box<dyn MdalFile>>,
    /// Logical file size (`stat` of the MD file) captured at open; bounds
    /// every read so footer bytes never leak to the user.
    pub md_size: u64,
    // Creation-time identity baked into recovery records.
    pub md_mode: u32,
    pub md_uid: u32,
    pub md_gid: u32,
    pub md_mtime: i64,

    pub os: Option<ObjectStream>,

    // read side
    pub log_offset: u64,
    pub queue: ReadQueue,

    // write side
    pub open_offset: u64,
    pub logical_end: u64,
    pub user_in_obj: u64,
    pub sys_writes: u64,
    pub chunks_closed: u64,
    pub hasher: crc32fast::Hasher,
    /// Record of the first sealed chunk, held back until the file is
    /// known to go Multi (a file of exactly one chunk stays Uni and
    /// keeps its MD file free of records).
    pub pending_record: Option<MultiChunkInfo>,

    pub first_errno: Option<i32>,
}

/// One open of one MarFS file.
pub struct FileHandle {
    pub(crate) repo: Arc<Repo>,
    /// Absent only for DIRECT (MD-resident) files.
    pub(crate) dal: Option<Arc<dyn Dal>>,
    /// Absolute MD path (what recovery records and trash bookkeeping see).
    pub(crate) md_path: PathBuf,
    /// User-visible path, for diagnostics.
    pub(crate) user_path: String,

    pub(crate) state: Mutex<HandleState>,
    pub(crate) cv: Condvar,
}

impl FileHandle {
    fn dal(&self) -> Result<&Arc<dyn Dal>> {
        self.dal
            .as_ref()
            .ok_or(Error::InvalidArgument("no data backend for DIRECT file".into()))
    }

    pub fn flags(&self) -> FhFlags {
        self.state.lock().unwrap().flags
    }

    pub fn is_multi_thread(&self) -> bool {
        self.flags().contains(FhFlags::MULTI_THREAD)
    }

    /// Mark the handle failed without I/O; further writes short-circuit.
    pub fn abort(&self) {
        let mut st = self.state.lock().unwrap();
        st.flags.insert(FhFlags::ABORTED);
    }

    // ---------------- write path ----------------

    /// Contiguous streaming write. `offset` must equal the logical end of
    /// everything written so far on this handle.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        if !st.flags.contains(FhFlags::WRITING) {
            return Err(Error::InvalidArgument("handle not open for write".into()));
        }
        if st.flags.contains(FhFlags::ABORTED) {
            return Err(Error::HandleReleasing);
        }
        if let Some(errno) = st.first_errno {
            // First unrecoverable error wins; no further backend I/O.
            return Err(Error::from_errno(errno, &self.md_path));
        }
        if st.flags.contains(FhFlags::DIRECT) {
            let md = st.md.as_mut().expect("direct handle keeps MD open");
            return md.write_at(buf, offset);
        }
        if offset != st.logical_end {
            return Err(Error::NonContiguousWrite {
                offset,
                expected: st.logical_end,
            });
        }
        match self.write_inner(&mut st, buf) {
            Ok(n) => Ok(n),
            Err(err) => {
                warn!("write failed on {}: {}", self.user_path, err);
                st.flags.insert(FhFlags::ERRORS);
                st.first_errno = Some(err.errno());
                Err(err)
            }
        }
    }

    fn write_inner(&self, st: &mut HandleState, buf: &[u8]) -> Result<usize> {
        let capacity = self.repo.capacity();
        let timeout = Duration::from_secs(self.repo.write_timeout_s);
        let mut remaining = buf;

        while !remaining.is_empty() {
            if st.os.is_none() {
                if st.chunks_closed > 0 && !st.flags.contains(FhFlags::N_TO_1) {
                    // More data past a sealed chunk: definitely Multi now,
                    // and the held-back first record becomes real.
                    st.post.obj_type = ObjType::Multi;
                    if let Some(record) = st.pending_record.take() {
                        self.install_chunk_info(st, record)?;
                    }
                }
                let objid = st.pre.objid()?;
                let continuation = st.chunks_closed > 0;
                st.os = Some(ObjectStream::open_put(
                    self.dal()?,
                    objid,
                    None,
                    timeout,
                    continuation,
                )?);
                st.user_in_obj = 0;
                st.hasher = crc32fast::Hasher::new();
            }

            let room = (capacity - st.user_in_obj) as usize;
            let n = remaining.len().min(room);
            if n > 0 {
                let chunk = &remaining[..n];
                st.os.as_mut().unwrap().put_all(chunk)?;
                st.hasher.update(chunk);
                st.user_in_obj += n as u64;
                st.logical_end += n as u64;
                remaining = &remaining[n..];
            }

            if st.user_in_obj == capacity {
                self.close_chunk(st)?;
            }
        }
        Ok(buf.len())
    }

    /// Seal the current object: recovery footer, stream close, chunk-info
    /// record, advance to the next chunk number.
    fn close_chunk(&self, st: &mut HandleState) -> Result<()> {
        let crc = std::mem::replace(&mut st.hasher, crc32fast::Hasher::new()).finalize();
        st.post.correct_info = crc as u64;

        self.emit_recovery(st)?;
        let os = st.os.as_mut().expect("chunk close needs an open stream");
        debug!(
            "closing chunk {} of {} ({} object bytes, {} system so far)",
            st.pre.chunk_no, self.user_path, os.written, st.sys_writes
        );
        os.close(false)?;
        st.os = None;

        // Every writer installs its own records at their seek slots; an
        // N:1 writer's chunk numbers land in the sparse array exactly
        // where the post-processing pass expects them.
        let record = self.chunk_record(st, crc);
        if st.flags.contains(FhFlags::N_TO_1) || st.post.obj_type == ObjType::Multi {
            self.install_chunk_info(st, record)?;
        } else {
            // First sealed chunk of a file that may still end up Uni.
            st.pending_record = Some(record);
        }

        st.pre.chunk_no += 1;
        st.chunks_closed += 1;
        st.user_in_obj = 0;
        Ok(())
    }

    fn chunk_record(&self, st: &HandleState, crc: u32) -> MultiChunkInfo {
        let capacity = self.repo.capacity();
        let mut info = MultiChunkInfo::new(
            st.pre.chunk_no,
            st.pre.chunk_no * capacity,
            st.user_in_obj,
        );
        info.correct_info = crc as u64;
        info
    }

    fn install_chunk_info(&self, st: &mut HandleState, record: MultiChunkInfo) -> Result<()> {
        let bytes = record.to_bytes()?;
        let md = st
            .md
            .as_ref()
            .ok_or(Error::InvalidArgument("MD file not open".into()))?;
        md.write_at(&bytes, MultiChunkInfo::offset_of(record.chunk_no))?;
        st.post.chunk_info_bytes += MULTI_CHUNK_INFO_SIZE as u64;
        Ok(())
    }

    /// Append the recovery footer (one body, the tail) to the open object.
    /// The bytes are tracked as system writes so the logical offset stays
    /// pure user data.
    fn emit_recovery(&self, st: &mut HandleState) -> Result<()> {
        let body = RecoveryBody::new(
            st.user_in_obj,
            st.md_mode,
            st.md_uid,
            st.md_gid,
            st.md_mtime,
            st.pre.objid()?,
            st.post.emit(false)?,
            self.md_path.display().to_string(),
        );
        let mut footer = Vec::with_capacity(RECOVERY_SIZE as usize);
        write_body(&mut footer, &body)?;
        write_tail(&mut footer, 1)?;
        let os = st
            .os
            .as_mut()
            .ok_or(Error::InvalidArgument("no open stream for recovery".into()))?;
        os.put_all(&footer)?;
        st.sys_writes += footer.len() as u64;
        Ok(())
    }

    // ---------------- read path ----------------

    /// Read at `offset`. Serialized with other readers of this handle;
    /// discontiguous requests wait for the stream to catch up (or queue,
    /// in multi-thread mode) before falling back to close/reopen.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        if !st.flags.contains(FhFlags::READING) {
            return Err(Error::InvalidArgument("handle not open for read".into()));
        }
        if st.flags.contains(FhFlags::RELEASING) {
            return Ok(0);
        }

        // Single-thread mode: give another thread's sequential reads a
        // short chance to make this request contiguous.
        if !st.flags.contains(FhFlags::MULTI_THREAD)
            && st.os.is_some()
            && offset > st.log_offset
        {
            for retry in 0..DISCONTIG_RETRIES {
                let before = st.log_offset;
                let (guard, _) = self
                    .cv
                    .wait_timeout(st, DISCONTIG_WAIT)
                    .map_err(|_| Error::HandleReleasing)?;
                st = guard;
                if st.flags.contains(FhFlags::RELEASING) {
                    return Ok(0);
                }
                if st.log_offset != before {
                    info!(
                        "threaded reads detected on {} (retry {})",
                        self.user_path, retry
                    );
                    st.flags.insert(FhFlags::MULTI_THREAD);
                    break;
                }
                if offset <= st.log_offset {
                    break;
                }
            }
        }

        if st.flags.contains(FhFlags::MULTI_THREAD) && offset > st.log_offset {
            let ticket = st.queue.enqueue(offset);
            let mut timed_out = false;
            loop {
                if st.flags.contains(FhFlags::RELEASING) {
                    st.queue.dequeue(ticket);
                    self.cv.notify_all();
                    return Ok(0);
                }
                if st.log_offset == offset {
                    break;
                }
                if timed_out && !st.queue.is_rewinding(ticket) && st.queue.is_head(ticket) {
                    // Nobody is reading us into order; rewind the stream
                    // ourselves and keep the others parked meanwhile.
                    debug!(
                        "queued read at {} on {} timed out, rewinding",
                        offset, self.user_path
                    );
                    st.queue.mark_all_rewinding();
                    break;
                }
                let (guard, timeout) = self
                    .cv
                    .wait_timeout(st, QUEUED_READ_WAIT)
                    .map_err(|_| Error::HandleReleasing)?;
                st = guard;
                timed_out = timeout.timed_out();
            }
            st.queue.dequeue(ticket);
        }

        let result = self.read_internal(&mut st, offset, buf);

        // Wake waiters: one of them may line up with the cursor now.
        if !st.queue.is_empty() {
            self.cv.notify_all();
        }
        result
    }

    fn read_internal(&self, st: &mut HandleState, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if st.flags.contains(FhFlags::DIRECT) {
            let md = st.md.as_ref().expect("direct handle keeps MD open");
            return md.read_at(buf, offset);
        }
        if st.restart.is_some() {
            return Err(Error::InvalidArgument(format!(
                "'{}' is still being written",
                self.user_path
            )));
        }

        if offset != st.log_offset {
            if let Some(mut os) = st.os.take() {
                os.close(false)?;
            }
            st.log_offset = offset;
        }

        let md_size = st.md_size;
        if offset >= md_size {
            return Ok(0);
        }

        let capacity = self.repo.capacity();
        let timeout = Duration::from_secs(self.repo.read_timeout_s);
        let max_get = self.repo.max_get_size;
        let mut want = buf.len().min((md_size - offset) as usize);
        let mut filled = 0usize;

        while want > 0 {
            let logical = st.log_offset;
            let phys = st.post.obj_offset + logical;
            let file_remain = md_size - logical;

            // Packed members live inside chunk 0 of their shared object;
            // everything else maps through the chunk geometry.
            let (chunk_no, chunk_off, span) = if st.post.obj_type == ObjType::Packed {
                (0, phys, file_remain)
            } else {
                let chunk_no = phys / capacity;
                let chunk_off = phys % capacity;
                (chunk_no, chunk_off, (capacity - chunk_off).min(file_remain))
            };

            let needs_open = match st.os.as_ref() {
                Some(os) => os.chunk_no != chunk_no,
                None => true,
            };
            if needs_open {
                if let Some(mut os) = st.os.take() {
                    os.close(false)?;
                }
                let mut open_len = span;
                if max_get > 0 {
                    open_len = open_len.min(max_get);
                }
                let objid = st.pre.objid_for_chunk(chunk_no)?;
                let continuation = chunk_no != 0 || logical != offset;
                st.os = Some(ObjectStream::open_get(
                    self.dal()?,
                    objid,
                    chunk_no,
                    chunk_off,
                    open_len,
                    timeout,
                    continuation,
                )?);
            }

            let os = st.os.as_mut().unwrap();
            let n = os.get(&mut buf[filled..filled + want])?;
            if n == 0 {
                // Sub-range exhausted (chunk end or max_get cap); reopen
                // at the new position next iteration.
                os.close(false)?;
                st.os = None;
                continue;
            }
            st.log_offset += n as u64;
            filled += n;
            want -= n;
        }
        Ok(filled)
    }

    /// Whole-file truncation only, and only before any byte has gone to
    /// the backend; anything else needs the path-level truncate (which
    /// trashes the old storage).
    pub fn ftruncate(&self, len: u64) -> Result<()> {
        if len != 0 {
            return Err(Error::Unsupported("partial truncate"));
        }
        let st = self.state.lock().unwrap();
        if st.flags.contains(FhFlags::DIRECT) {
            if let Some(md) = st.md.as_ref() {
                return md.ftruncate(0);
            }
        }
        if st.flags.contains(FhFlags::WRITING)
            && st.logical_end == st.open_offset
            && st.chunks_closed == 0
        {
            return Ok(());
        }
        Err(Error::Unsupported("truncate of a written handle"))
    }

    // ---------------- flush / release ----------------

    /// Error-reporting boundary of a write: emits the final recovery
    /// footer, closes the stream, finalizes `Post`, trims the MD file to
    /// its logical size, and lifts the restart marker.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.flags.contains(FhFlags::FLUSHED) {
            return Ok(());
        }
        if !st.flags.contains(FhFlags::WRITING) || st.flags.contains(FhFlags::DIRECT) {
            st.flags.insert(FhFlags::FLUSHED);
            return Ok(());
        }

        if st.flags.intersects(FhFlags::ERRORS | FhFlags::ABORTED) {
            // Release server-side resources without persisting anything.
            if let Some(mut os) = st.os.take() {
                let _ = os.close(true);
            }
            st.md = None;
            st.flags.insert(FhFlags::FLUSHED);
            return Ok(());
        }

        // An N:1 writer with nothing to add creates no trailing object;
        // a fuse open always leaves one, even for an empty file.
        let wrote_final_object =
            st.user_in_obj > 0 || (st.chunks_closed == 0 && !st.flags.contains(FhFlags::N_TO_1));

        if wrote_final_object {
            if st.os.is_none() {
                // Nothing written since the last boundary (or at all):
                // the final object carries only its recovery record.
                let objid = st.pre.objid()?;
                let timeout = Duration::from_secs(self.repo.write_timeout_s);
                st.os = Some(ObjectStream::open_put(
                    self.dal()?,
                    objid,
                    None,
                    timeout,
                    st.chunks_closed > 0,
                )?);
                st.hasher = crc32fast::Hasher::new();
                st.user_in_obj = 0;
            }
            let crc = std::mem::replace(&mut st.hasher, crc32fast::Hasher::new()).finalize();
            st.post.correct_info = crc as u64;
            self.emit_recovery(&mut st)?;
            if !st.flags.contains(FhFlags::PACKED) {
                let os = st.os.as_mut().unwrap();
                os.close(false)?;
                st.os = None;
            }
            if st.flags.contains(FhFlags::N_TO_1) || st.post.obj_type == ObjType::Multi {
                let record = self.chunk_record(&st, crc);
                self.install_chunk_info(&mut st, record)?;
            }
        }

        if !st.flags.contains(FhFlags::N_TO_1) {
            st.post.chunks = if st.post.obj_type == ObjType::Multi {
                if wrote_final_object {
                    st.pre.chunk_no + 1
                } else {
                    st.pre.chunk_no
                }
            } else {
                1
            };

            let logical_size = st.logical_end;
            if let Some(md) = st.md.as_ref() {
                md.ftruncate(logical_size)?;
            }

            // The stored Pre always names chunk 0; chunk URLs substitute.
            st.pre.chunk_no = 0;
            let objid = st.pre.objid()?;
            let post = st.post.emit(false)?;
            let md = st
                .md
                .as_ref()
                .ok_or(Error::InvalidArgument("MD file not open".into()))?;
            md.set_xattr(XATTR_OBJID, objid.as_bytes(), true)?;
            md.set_xattr(XATTR_POST, post.as_bytes(), true)?;
            md.remove_xattr(XATTR_RESTART, true).or_else(|err| match err {
                Error::NotFound(_) => Ok(()),
                other => Err(other),
            })?;

            // Install the mode the restart marker was preserving.
            if let Some(restart) = st.restart.take() {
                if restart.flags.contains(crate::format::RestartFlags::MODE_VALID) {
                    self.chmod_md(restart.mode)?;
                }
            }
        }

        st.md = None;
        st.flags.insert(FhFlags::FLUSHED);
        Ok(())
    }

    fn chmod_md(&self, mode: u32) -> Result<()> {
        // The MD file may now be read-only for its owner; go through the
        // path so the chmod applies to the inode, not the open flags.
        let md_path = self.md_path.clone();
        nix::sys::stat::fchmodat(
            None,
            &md_path,
            nix::sys::stat::Mode::from_bits_truncate(mode),
            nix::sys::stat::FchmodatFlags::FollowSymlink,
        )
        .map_err(|e| Error::from_nix(e, md_path))
    }

    /// Async cleanup: idempotent, accepts no new errors. Wakes every
    /// queued reader (they return 0 bytes) and drops the streams.
    pub fn release(&self) {
        let mut st = self.state.lock().unwrap();
        st.flags.insert(FhFlags::RELEASING);
        self.cv.notify_all();
        if let Some(mut os) = st.os.take() {
            let abort =
                st.flags.contains(FhFlags::WRITING) && !st.flags.contains(FhFlags::FLUSHED);
            if let Err(err) = os.close(abort) {
                debug!("release: stream close on {}: {}", self.user_path, err);
            }
        }
        st.md = None;
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.release();
    }
}
