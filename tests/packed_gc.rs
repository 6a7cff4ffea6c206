//! Packed-object ingest, trash reclamation, and repacking.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{fixture, md_xattr, TestFs};

use marfs::dal::Dal;
use marfs::error::Error;
use marfs::format::{self, MultiChunkInfo, ObjType, Post, RECOVERY_BODY_SIZE};
use marfs::gc::{GarbageCollector, GcOptions, GcReport};
use marfs::mdal::{Mdal, REF_DIR};
use marfs::repack::{RepackEntry, Repacker};

fn run_gc(fs: &TestFs, dry_run: bool, age_threshold_s: u64) -> GcReport {
    let mut dals: HashMap<String, Arc<dyn Dal>> = HashMap::new();
    dals.insert("objstore".into(), Arc::new(fs.dal.clone()));
    let gc = GarbageCollector::new(
        fs.config.clone(),
        fs.mdal.clone(),
        dals,
        GcOptions {
            age_threshold_s,
            dry_run,
            workers: 2,
        },
    );
    gc.run().unwrap()
}

fn trash_entries(fs: &TestFs) -> Vec<String> {
    let trash = fs.config.namespace("proj").unwrap().trash_path.clone();
    if !trash.join(REF_DIR).exists() {
        return Vec::new();
    }
    let mut names: Vec<String> = std::fs::read_dir(trash.join(REF_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn pack_three(fs: &TestFs) -> String {
    let mut writer = fs.batch.packed_writer("/proj").unwrap();
    for (name, fill) in &[("a", 0xaau8), ("b", 0xbb), ("c", 0xcc)] {
        writer.begin(&format!("/proj/{}", name), 10).unwrap();
        writer.write(&[*fill; 10]).unwrap();
        writer.end_member().unwrap();
    }
    writer.finish().unwrap()
}

#[test]
fn packed_ingest_shares_one_object() {
    let fs = fixture(4096);
    let objid = pack_three(&fs);

    assert_eq!(fs.dal.object_count(), 1);
    let proj_md = fs.config.namespace("proj").unwrap().md_path.clone();

    let rec = RECOVERY_BODY_SIZE as u64;
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        assert_eq!(md_xattr(&fs, &proj_md, name, "objid").unwrap(), objid);
        let post = Post::parse(&md_xattr(&fs, &proj_md, name, "post").unwrap()).unwrap();
        assert_eq!(post.obj_type, ObjType::Packed);
        assert_eq!(post.chunks, 3);
        assert_eq!(post.obj_offset, i as u64 * (10 + rec));
        assert!(md_xattr(&fs, &proj_md, name, "restart").is_none());
    }

    // The object carries three BODY records and one tail.
    let blob = fs.dal.object(&objid).unwrap();
    let (files, tail) = format::parse_object(&blob).unwrap();
    assert_eq!(tail.nfiles, 3);
    assert_eq!(files.len(), 3);
    assert!(files[1].body.md_path.ends_with("mdfs/proj/b"));

    // Members read back through the ordinary path.
    let fh = fs.fuse.open_read("/proj/b").unwrap();
    let mut buf = [0u8; 32];
    let n = fh.read(0, &mut buf).unwrap();
    assert_eq!(&buf[..n], &[0xbb; 10]);
}

#[test]
fn packed_member_limits_are_enforced() {
    let fs = fixture(4096);
    let mut writer = fs.batch.packed_writer("/proj").unwrap();

    // Oversized member: not packable at all.
    match writer.begin("/proj/huge", 4096) {
        Err(Error::NotPackable) => {}
        other => panic!("expected NotPackable, got {:?}", other),
    }

    // Fill the object, then the next member must signal a full handle.
    writer.begin("/proj/one", 1500).unwrap();
    writer.write(&vec![1u8; 1500]).unwrap();
    writer.end_member().unwrap();
    match writer.begin("/proj/two", 1500) {
        Err(Error::HandleFull) => {}
        other => panic!("expected HandleFull, got {:?}", other),
    }
    writer.finish().unwrap();
}

#[test]
fn gc_retains_partially_referenced_packed_object() {
    let fs = fixture(4096);
    let objid = pack_three(&fs);

    fs.fuse.unlink("/proj/a").unwrap();
    let report = run_gc(&fs, false, 0);

    // One of three members in the trash: the object must survive and the
    // group becomes a repack candidate.
    assert_eq!(fs.dal.object_count(), 1);
    assert_eq!(report.tally.packed_retained, 1);
    assert_eq!(report.repack_candidates.len(), 1);
    let candidate = &report.repack_candidates[0];
    assert_eq!(candidate.objid, objid);
    assert_eq!(candidate.observed, 1);
    assert_eq!(candidate.declared, 3);
    // The trash entry stays for the next pass.
    assert_eq!(trash_entries(&fs).len(), 2); // MD entry + .path companion
}

#[test]
fn gc_reaps_fully_orphaned_packed_object() {
    let fs = fixture(4096);
    pack_three(&fs);

    for name in &["a", "b", "c"] {
        fs.fuse.unlink(&format!("/proj/{}", name)).unwrap();
    }
    let report = run_gc(&fs, false, 0);

    assert_eq!(report.tally.packed_deleted, 1);
    assert_eq!(fs.dal.object_count(), 0);
    assert!(trash_entries(&fs).is_empty());
}

#[test]
fn gc_dry_run_touches_nothing() {
    let fs = fixture(3072);
    let data = common::payload(5120, 11); // three chunks

    fs.fuse.mknod("/proj/victim", 0o100644).unwrap();
    let fh = fs.fuse.open_write("/proj/victim").unwrap();
    fh.write(0, &data).unwrap();
    fh.flush().unwrap();
    fh.release();
    assert_eq!(fs.dal.object_count(), 3);

    fs.fuse.unlink("/proj/victim").unwrap();
    let report = run_gc(&fs, true, 0);

    // Three chunk deletions plus the MD entry were identified, nothing
    // was touched.
    assert_eq!(report.tally.would_delete, 4);
    assert_eq!(fs.dal.delete_count(), 0);
    assert_eq!(fs.dal.object_count(), 3);
    assert_eq!(trash_entries(&fs).len(), 2);

    // The real pass reclaims all of it.
    let report = run_gc(&fs, false, 0);
    assert_eq!(report.tally.objects_deleted, 3);
    assert_eq!(report.tally.md_files_removed, 1);
    assert_eq!(fs.dal.object_count(), 0);
    assert!(trash_entries(&fs).is_empty());
}

#[test]
fn gc_honors_age_threshold() {
    let fs = fixture(3072);
    fs.fuse.mknod("/proj/young", 0o100644).unwrap();
    let fh = fs.fuse.open_write("/proj/young").unwrap();
    fh.write(0, b"fresh").unwrap();
    fh.flush().unwrap();
    fh.release();

    fs.fuse.unlink("/proj/young").unwrap();
    let report = run_gc(&fs, false, 3600);
    assert_eq!(report.tally.candidates, 0);
    assert_eq!(fs.dal.object_count(), 1);
}

#[test]
fn gc_walks_chunk_records_of_interrupted_parallel_ingest() {
    let fs = fixture(3072);
    let cap = 2048usize;

    // A parallel worker wrote only chunk 1 of a larger file before the
    // job died. The writer installs its own chunk-info record at slot 1;
    // slot 0 stays a hole.
    fs.batch.mknod("/proj/n1", 0o100644).unwrap();
    let fh = fs.batch.open_at_offset("/proj/n1", cap as u64, 0).unwrap();
    fh.write(cap as u64, &common::payload(cap, 12)).unwrap();
    fh.flush().unwrap();
    fh.release();
    assert_eq!(fs.dal.object_count(), 1);

    let proj_md = fs.config.namespace("proj").unwrap().md_path.clone();
    {
        let ctxt = fs.mdal.new_ctxt(&proj_md).unwrap();
        let md = ctxt.open("n1", nix::fcntl::OFlag::O_RDONLY, 0).unwrap();
        let mut buf = [0u8; marfs::format::MULTI_CHUNK_INFO_SIZE];
        md.read_at(&mut buf, MultiChunkInfo::offset_of(0)).unwrap();
        assert!(MultiChunkInfo::from_bytes(&buf).unwrap().is_blank());
        md.read_at(&mut buf, MultiChunkInfo::offset_of(1)).unwrap();
        let rec = MultiChunkInfo::from_bytes(&buf).unwrap();
        assert_eq!(rec.chunk_no, 1);
        assert_eq!(rec.chunk_data_bytes, cap as u64);
    }

    fs.fuse.unlink("/proj/n1").unwrap();
    let report = run_gc(&fs, false, 0);

    // Only the chunk that exists was deleted; no probe for chunk 0
    // counted as a failure.
    assert_eq!(report.tally.objects_deleted, 1);
    assert_eq!(report.tally.failures, 0);
    assert_eq!(fs.dal.object_count(), 0);
    assert!(trash_entries(&fs).is_empty());
}

#[test]
fn repack_densifies_surviving_members() {
    let fs = fixture(4096);
    let old_objid = pack_three(&fs);

    fs.fuse.unlink("/proj/a").unwrap();
    let report = run_gc(&fs, false, 0);
    assert_eq!(report.repack_candidates.len(), 1);

    let mut dals: HashMap<String, Arc<dyn Dal>> = HashMap::new();
    dals.insert("objstore".into(), Arc::new(fs.dal.clone()));
    let repacker = Repacker::new(fs.config.clone(), fs.mdal.clone(), dals);
    let tally = repacker
        .run(&[RepackEntry {
            ns: "proj".into(),
            objid: old_objid.clone(),
            members: vec!["b".into(), "c".into()],
        }])
        .unwrap();
    assert_eq!(tally.objects_repacked, 1);
    assert_eq!(tally.members_moved, 2);

    // Members now point at a distinct object with dense offsets.
    let proj_md = fs.config.namespace("proj").unwrap().md_path.clone();
    let new_objid = md_xattr(&fs, &proj_md, "b", "objid").unwrap();
    assert_ne!(new_objid, old_objid);
    let post_b = Post::parse(&md_xattr(&fs, &proj_md, "b", "post").unwrap()).unwrap();
    let post_c = Post::parse(&md_xattr(&fs, &proj_md, "c", "post").unwrap()).unwrap();
    assert_eq!(post_b.obj_offset, 0);
    assert_eq!(post_b.chunks, 2);
    assert_eq!(post_c.obj_offset, 10 + RECOVERY_BODY_SIZE as u64);

    // Both objects exist until GC reconciles the old one away.
    assert_eq!(fs.dal.object_count(), 2);

    // Data still reads correctly through the new identity.
    let fh = fs.fuse.open_read("/proj/c").unwrap();
    let mut buf = [0u8; 32];
    let n = fh.read(0, &mut buf).unwrap();
    assert_eq!(&buf[..n], &[0xcc; 10]);
}

#[test]
fn gc_survives_backend_failures() {
    let fs = fixture(3072);
    fs.fuse.mknod("/proj/flaky", 0o100644).unwrap();
    let fh = fs.fuse.open_write("/proj/flaky").unwrap();
    fh.write(0, b"doomed data").unwrap();
    fh.flush().unwrap();
    fh.release();

    fs.fuse.unlink("/proj/flaky").unwrap();
    fs.dal.fail_next_deletes(1);
    let report = run_gc(&fs, false, 0);

    // The failure is tallied, the MD entry is kept for a retry, and the
    // run as a whole still completes.
    assert_eq!(report.tally.failures, 1);
    assert_eq!(trash_entries(&fs).len(), 2);

    let report = run_gc(&fs, false, 0);
    assert_eq!(report.tally.objects_deleted, 1);
    assert!(trash_entries(&fs).is_empty());
}
