#![allow(dead_code)] // each test binary uses a different slice of this

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use marfs::config::{
    AccessProtocol, AuthMethod, MarfsConfig, Namespace, NsPerms, Repo,
};
use marfs::dal::{Dal, MemDal};
use marfs::fs::Marfs;
use marfs::mdal::{Mdal, PosixMdal};

pub struct TestFs {
    pub dir: TempDir,
    pub config: Arc<MarfsConfig>,
    pub dal: MemDal,
    pub mdal: Arc<PosixMdal>,
    /// fuse-style engine (interactive permissions, interactive repo).
    pub fuse: Marfs,
    /// pftool-style engine.
    pub batch: Marfs,
}

pub fn fixture(chunk_size: u64) -> TestFs {
    fixture_with_dal(chunk_size, MemDal::new())
}

/// Fixture whose backend serves GETs in deliberately small slices.
pub fn fixture_short_reads(chunk_size: u64, limit: usize) -> TestFs {
    fixture_with_dal(chunk_size, MemDal::with_short_reads(limit))
}

fn fixture_with_dal(chunk_size: u64, dal: MemDal) -> TestFs {
    let dir = tempfile::tempdir().unwrap();
    let config = build_config(dir.path(), chunk_size);
    let mdal = Arc::new(PosixMdal::new());
    for ns in config.namespaces() {
        mdal.create_namespace(&ns.md_path, 0o750).unwrap();
    }

    let mut dals: HashMap<String, Arc<dyn Dal>> = HashMap::new();
    dals.insert("objstore".to_string(), Arc::new(dal.clone()));

    let fuse = Marfs::new(
        config.clone(),
        mdal.clone() as Arc<dyn Mdal>,
        dals.clone(),
        true,
    )
    .unwrap();
    let batch = Marfs::new(config.clone(), mdal.clone() as Arc<dyn Mdal>, dals, false).unwrap();

    TestFs {
        dir,
        config,
        dal,
        mdal,
        fuse,
        batch,
    }
}

pub fn build_config(base: &Path, chunk_size: u64) -> Arc<MarfsConfig> {
    let repos = vec![
        Repo {
            name: "objstore".into(),
            hosts: vec!["10.1.0.1".into(), "10.1.0.2".into()],
            port: None,
            https: false,
            access: AccessProtocol::SemiDirect,
            auth: AuthMethod::None,
            chunk_size,
            max_get_size: 0,
            min_pack_file_size: 1,
            max_pack_file_size: chunk_size / 2,
            min_pack_file_count: 2,
            max_pack_file_count: 16,
            read_timeout_s: 5,
            write_timeout_s: 5,
            checksums: true,
        },
        Repo {
            name: "mdonly".into(),
            hosts: vec!["localhost".into()],
            port: None,
            https: false,
            access: AccessProtocol::Direct,
            auth: AuthMethod::None,
            chunk_size,
            max_get_size: 0,
            min_pack_file_size: 0,
            max_pack_file_size: 0,
            min_pack_file_count: 0,
            max_pack_file_count: 0,
            read_timeout_s: 5,
            write_timeout_s: 5,
            checksums: false,
        },
    ];
    let namespaces = vec![
        Namespace {
            name: "proj".into(),
            alias: "p".into(),
            mnt_suffix: "/proj".into(),
            md_path: base.join("mdfs/proj"),
            trash_path: base.join("trash/proj"),
            fsinfo_path: base.join("fsinfo/proj"),
            iperms: NsPerms::all(),
            bperms: NsPerms::all(),
            iwrite_repo: "objstore".into(),
            range_list: vec![],
            quota_space: None,
            quota_inodes: None,
        },
        Namespace {
            name: "scratch".into(),
            alias: "s".into(),
            mnt_suffix: "/scratch".into(),
            md_path: base.join("mdfs/scratch"),
            trash_path: base.join("trash/scratch"),
            fsinfo_path: base.join("fsinfo/scratch"),
            iperms: NsPerms::all(),
            bperms: NsPerms::all(),
            iwrite_repo: "mdonly".into(),
            range_list: vec![],
            quota_space: None,
            quota_inodes: None,
        },
        Namespace {
            name: "root".into(),
            alias: "r".into(),
            mnt_suffix: "/".into(),
            md_path: base.join("mdfs/rootns"),
            trash_path: base.join("trash/rootns"),
            fsinfo_path: base.join("fsinfo/rootns"),
            iperms: NsPerms::empty(),
            bperms: NsPerms::empty(),
            iwrite_repo: "objstore".into(),
            range_list: vec![],
            quota_space: None,
            quota_inodes: None,
        },
    ];
    MarfsConfig::from_parts(base.join("mnt"), base.join("mdfs"), namespaces, repos)
        .map(Arc::new)
        .unwrap()
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Read a hidden system xattr straight off the MD file.
pub fn md_xattr(fs: &TestFs, ns_md_root: &Path, sub: &str, key: &str) -> Option<String> {
    let ctxt = fs.mdal.new_ctxt(ns_md_root).unwrap();
    let md = ctxt
        .open(sub, nix::fcntl::OFlag::O_RDONLY, 0)
        .unwrap();
    md.get_xattr(key, true)
        .unwrap()
        .map(|v| String::from_utf8_lossy(&v).into_owned())
}
