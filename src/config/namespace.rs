use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Operation classes a namespace may permit. Interactive (fuse) and
    /// batch (pftool) callers carry separate masks.
    #[derive(Serialize, Deserialize)]
    pub struct NsPerms: u32 {
        const R_META = 0x01;
        const W_META = 0x02;
        const R_DATA = 0x04;
        const W_DATA = 0x08;
        const T_DATA = 0x10;
        const U_DATA = 0x20;
    }
}

impl NsPerms {
    pub fn all_ops() -> Self {
        NsPerms::all()
    }
}

/// One entry of a size-keyed write-repo selection list: files whose
/// announced size falls in `[min_size, max_size)` go to `repo`. A
/// `max_size` of `None` means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRange {
    pub min_size: u64,
    #[serde(default)]
    pub max_size: Option<u64>,
    pub repo: String,
}

/// A named mount-relative subtree with its own metadata root, trash,
/// permissions, quotas and write-repo policy.
///
/// Namespace names must not contain '-': '/' in the user-visible name is
/// encoded to '-' when the name is embedded in object-IDs (S3 buckets
/// disallow '/'), and that encoding must stay losslessly invertible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,

    /// Short alias reserved alongside the repo name in the bucket.
    pub alias: String,

    /// User-visible subtree below the mount top.
    pub mnt_suffix: String,

    pub md_path: PathBuf,
    pub trash_path: PathBuf,
    pub fsinfo_path: PathBuf,

    /// Interactive (fuse) permissions.
    pub iperms: NsPerms,
    /// Batch (pftool) permissions.
    pub bperms: NsPerms,

    /// Repo used for interactive writes.
    pub iwrite_repo: String,
    /// Size-keyed repo selection for batch writes.
    #[serde(default)]
    pub range_list: Vec<RepoRange>,

    /// Soft byte quota; `None` disables the check.
    #[serde(default)]
    pub quota_space: Option<u64>,
    /// Soft inode quota; `None` disables the check.
    #[serde(default)]
    pub quota_inodes: Option<u64>,
}

impl Namespace {
    pub fn is_root(&self) -> bool {
        self.mnt_suffix == "/"
    }

    /// Repo name for a write of `size` bytes (`None` when unknown, e.g.
    /// interactive writes, which always use `iwrite_repo`).
    pub fn write_repo_name(&self, size: Option<u64>) -> &str {
        let size = match size {
            Some(s) if !self.range_list.is_empty() => s,
            _ => return &self.iwrite_repo,
        };
        for range in &self.range_list {
            let below_max = range.max_size.map(|max| size < max).unwrap_or(true);
            if size >= range.min_size && below_max {
                return &range.repo;
            }
        }
        &self.iwrite_repo
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("empty namespace name".into()));
        }
        if self.name.contains('-') {
            return Err(Error::InvalidArgument(format!(
                "namespace '{}': names must not contain '-' (reserved for '/' encoding)",
                self.name
            )));
        }
        if !self.mnt_suffix.starts_with('/') {
            return Err(Error::InvalidArgument(format!(
                "namespace '{}': mnt_suffix must be absolute",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ns(range_list: Vec<RepoRange>) -> Namespace {
        Namespace {
            name: "proj".into(),
            alias: "p".into(),
            mnt_suffix: "/proj".into(),
            md_path: "/gpfs/marfs/proj".into(),
            trash_path: "/gpfs/marfs/trash/proj".into(),
            fsinfo_path: "/gpfs/marfs/fsinfo/proj".into(),
            iperms: NsPerms::all(),
            bperms: NsPerms::all(),
            iwrite_repo: "interactive".into(),
            range_list,
            quota_space: None,
            quota_inodes: None,
        }
    }

    #[test]
    fn repo_selection_by_size() {
        let ns = ns(vec![
            RepoRange { min_size: 0, max_size: Some(1048576), repo: "small".into() },
            RepoRange { min_size: 1048576, max_size: None, repo: "large".into() },
        ]);
        assert_eq!(ns.write_repo_name(Some(10)), "small");
        assert_eq!(ns.write_repo_name(Some(1048576)), "large");
        assert_eq!(ns.write_repo_name(None), "interactive");
    }

    #[test]
    fn dash_in_name_rejected() {
        let mut bad = ns(vec![]);
        bad.name = "has-dash".into();
        assert!(bad.validate().is_err());
    }
}
