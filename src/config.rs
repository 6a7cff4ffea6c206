//! Engine configuration: namespaces, repos, and the indexed lookups built
//! over them at load time.
//!
//! The configuration is read once, validated, and then shared read-only
//! (`Arc<MarfsConfig>`) by every component; nothing in the crate consults
//! process-wide state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

mod namespace;
pub use namespace::*;

mod repo;
pub use repo::*;

/// On-disk form of the configuration (JSON document).
#[derive(Debug, Serialize, Deserialize)]
struct RawConfig {
    mnt_top: PathBuf,
    mdfs_top: PathBuf,
    namespaces: Vec<Namespace>,
    repos: Vec<Repo>,
}

pub struct MarfsConfig {
    pub mnt_top: PathBuf,
    /// Top of the underlying metadata store. User paths resolving under it
    /// are rejected to prevent aliasing with the mount.
    pub mdfs_top: PathBuf,

    /// Namespaces sorted by descending mount-suffix length, so the first
    /// prefix match is the longest one.
    namespaces: Vec<Arc<Namespace>>,
    repos: HashMap<String, Arc<Repo>>,
}

impl MarfsConfig {
    pub fn load(path: &Path) -> anyhow::Result<Arc<MarfsConfig>> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config {:?}", path))?;
        let raw: RawConfig = serde_json::from_str(&contents)
            .with_context(|| format!("unable to parse config {:?}", path))?;
        let config = Self::from_parts(raw.mnt_top, raw.mdfs_top, raw.namespaces, raw.repos)?;
        Ok(Arc::new(config))
    }

    pub fn from_parts(
        mnt_top: PathBuf,
        mdfs_top: PathBuf,
        namespaces: Vec<Namespace>,
        repos: Vec<Repo>,
    ) -> Result<MarfsConfig> {
        let mut repo_map = HashMap::new();
        for repo in repos {
            repo.validate()?;
            if repo_map
                .insert(repo.name.clone(), Arc::new(repo))
                .is_some()
            {
                return Err(Error::InvalidArgument("duplicate repo name".into()));
            }
        }

        let mut ns_list = Vec::new();
        for ns in namespaces {
            ns.validate()?;
            for name in std::iter::once(ns.iwrite_repo.as_str())
                .chain(ns.range_list.iter().map(|r| r.repo.as_str()))
            {
                if !repo_map.contains_key(name) {
                    return Err(Error::InvalidArgument(format!(
                        "namespace '{}' references unknown repo '{}'",
                        ns.name, name
                    )));
                }
            }
            ns_list.push(Arc::new(ns));
        }
        ns_list.sort_by(|a, b| b.mnt_suffix.len().cmp(&a.mnt_suffix.len()));

        Ok(MarfsConfig {
            mnt_top,
            mdfs_top,
            namespaces: ns_list,
            repos: repo_map,
        })
    }

    pub fn repo(&self, name: &str) -> Result<Arc<Repo>> {
        self.repos
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown repo '{}'", name)))
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.iter().find(|ns| ns.name == name).cloned()
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &Arc<Namespace>> {
        self.namespaces.iter()
    }

    pub fn repos(&self) -> impl Iterator<Item = &Arc<Repo>> {
        self.repos.values()
    }

    /// Longest-suffix namespace match for a mount-relative path. Linear in
    /// the namespace count, which is small; a suffix tree can replace this
    /// if configs grow.
    pub fn namespace_for_path(&self, mnt_path: &str) -> Option<(Arc<Namespace>, String)> {
        for ns in &self.namespaces {
            let suffix = ns.mnt_suffix.as_str();
            if suffix == "/" {
                return Some((ns.clone(), mnt_path.to_string()));
            }
            if let Some(rest) = mnt_path.strip_prefix(suffix) {
                if rest.is_empty() || rest.starts_with('/') {
                    return Some((ns.clone(), rest.to_string()));
                }
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A two-namespace, two-repo config rooted under `base`, small enough
    /// that multi-chunk behavior is cheap to exercise.
    pub fn small_config(base: &Path, chunk_size: u64) -> Arc<MarfsConfig> {
        let repos = vec![
            Repo {
                name: "objstore".into(),
                hosts: vec!["10.0.0.1".into(), "10.0.0.2".into()],
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
                name: "direct".into(),
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
                name: "root".into(),
                alias: "r".into(),
                mnt_suffix: "/".into(),
                md_path: base.join("mdfs/root"),
                trash_path: base.join("trash/root"),
                fsinfo_path: base.join("fsinfo/root"),
                iperms: NsPerms::empty(),
                bperms: NsPerms::empty(),
                iwrite_repo: "objstore".into(),
                range_list: vec![],
                quota_space: None,
                quota_inodes: None,
            },
        ];
        Arc::new(
            MarfsConfig::from_parts(
                PathBuf::from("/marfs"),
                base.join("mdfs"),
                namespaces,
                repos,
            )
            .unwrap(),
        )
    }
}
