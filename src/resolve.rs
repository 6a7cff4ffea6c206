//! Path and namespace resolution.
//!
//! Maps a mount-relative user path to its namespace, metadata path, and
//! write-repo policy, and gates every operation class on the namespace
//! permission masks before any mutation happens.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::config::{MarfsConfig, Namespace, NsPerms, Repo};
use crate::error::{Error, Result};
use crate::mdal::MdalCtxt;

/// Resolved identity of one user path.
#[derive(Clone)]
pub struct PathInfo {
    pub ns: Arc<Namespace>,
    /// Absolute path of the MD file (recorded in `Post` for trash).
    pub md_path: PathBuf,
    /// Same path relative to the namespace context root.
    pub sub_path: String,
}

/// Operation classes and their required permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// access, stat, getxattr, listxattr, opendir, readdir, readlink, statvfs
    ReadMeta,
    /// chmod, chown, mkdir, rename, rmdir, setxattr, symlink, utime*
    WriteMeta,
    /// mknod
    Create,
    OpenRead,
    OpenWrite,
    Truncate,
    Unlink,
}

pub fn required_perms(op: OpClass) -> NsPerms {
    match op {
        OpClass::ReadMeta => NsPerms::R_META,
        OpClass::WriteMeta => NsPerms::R_META | NsPerms::W_META,
        OpClass::Create => {
            NsPerms::R_META | NsPerms::W_META | NsPerms::R_DATA | NsPerms::W_DATA | NsPerms::T_DATA
        }
        OpClass::OpenRead => NsPerms::R_META | NsPerms::R_DATA,
        OpClass::OpenWrite => {
            NsPerms::R_META | NsPerms::W_META | NsPerms::R_DATA | NsPerms::W_DATA
        }
        OpClass::Truncate => {
            NsPerms::R_META | NsPerms::W_META | NsPerms::R_DATA | NsPerms::T_DATA
        }
        OpClass::Unlink => {
            NsPerms::R_META | NsPerms::W_META | NsPerms::R_DATA | NsPerms::U_DATA
        }
    }
}

/// Gate an operation on the namespace mask. Runs before any mutation.
pub fn check_perms(ns: &Namespace, op: OpClass, interactive: bool) -> Result<()> {
    let have = if interactive { ns.iperms } else { ns.bperms };
    let need = required_perms(op);
    if !have.contains(need) {
        return Err(Error::PermissionDenied(format!(
            "namespace '{}' denies {:?} (have {:?}, need {:?})",
            ns.name, op, have, need
        )));
    }
    Ok(())
}

/// Resolve a mount-relative path. Fails `PermissionDenied` for anything
/// reaching under the metadata top, which would alias user access with the
/// backing store.
pub fn expand_path(config: &MarfsConfig, path: &str) -> Result<PathInfo> {
    if !path.starts_with('/') {
        return Err(Error::InvalidArgument(format!(
            "mount-relative path expected, got '{}'",
            path
        )));
    }
    for comp in Path::new(path).components() {
        if matches!(comp, Component::ParentDir) {
            return Err(Error::PermissionDenied(format!(
                "path '{}' may not traverse upward",
                path
            )));
        }
    }
    if Path::new(path).starts_with(&config.mdfs_top) {
        return Err(Error::PermissionDenied(format!(
            "path '{}' reaches under the metadata store",
            path
        )));
    }

    let (ns, remainder) = config
        .namespace_for_path(path)
        .ok_or_else(|| Error::NotFound(PathBuf::from(path)))?;

    let sub_path = remainder.trim_start_matches('/').to_string();
    let md_path = if sub_path.is_empty() {
        ns.md_path.clone()
    } else {
        ns.md_path.join(&sub_path)
    };
    if md_path.starts_with(&config.mdfs_top) && !md_path.starts_with(&ns.md_path) {
        return Err(Error::PermissionDenied(format!(
            "path '{}' escapes its namespace",
            path
        )));
    }

    Ok(PathInfo {
        ns,
        md_path,
        sub_path,
    })
}

/// Pick the write repo: interactive (fuse) writers always use the
/// namespace's interactive repo; batch writers go through the size-keyed
/// range list when a size hint is available.
pub fn repo_for_write(
    config: &MarfsConfig,
    ns: &Namespace,
    size_hint: Option<u64>,
    interactive: bool,
) -> Result<Arc<Repo>> {
    let name = if interactive {
        ns.iwrite_repo.as_str()
    } else {
        ns.write_repo_name(size_hint)
    };
    config.repo(name)
}

/// Soft-quota check against the namespace usage counters.
pub fn check_quotas(ns: &Namespace, ctxt: &dyn MdalCtxt) -> Result<()> {
    if let Some(limit) = ns.quota_space {
        let used = ctxt.get_data_usage()?;
        if used >= limit {
            return Err(Error::QuotaExceeded(ns.name.clone()));
        }
    }
    if let Some(limit) = ns.quota_inodes {
        let used = ctxt.get_inode_usage()?;
        if used >= limit {
            return Err(Error::QuotaExceeded(ns.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::test_support::small_config;

    #[test]
    fn resolves_into_namespace() {
        let base = std::env::temp_dir();
        let config = small_config(&base, 4096);
        let info = expand_path(&config, "/proj/dir/file").unwrap();
        assert_eq!(info.ns.name, "proj");
        assert_eq!(info.sub_path, "dir/file");
        assert_eq!(info.md_path, base.join("mdfs/proj/dir/file"));
    }

    #[test]
    fn mdfs_top_is_walled_off() {
        let base = std::env::temp_dir();
        let config = small_config(&base, 4096);
        let inside = format!("{}/proj/x", config.mdfs_top.display());
        assert!(matches!(
            expand_path(&config, &inside),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            expand_path(&config, "/proj/../escape"),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn perm_table_matches_operation_classes() {
        let base = std::env::temp_dir();
        let config = small_config(&base, 4096);
        let proj = config.namespace("proj").unwrap();
        let root = config.namespace("root").unwrap();

        assert!(check_perms(&proj, OpClass::Create, true).is_ok());
        // The root namespace is X-only by default.
        assert!(check_perms(&root, OpClass::ReadMeta, true).is_err());
        assert!(check_perms(&root, OpClass::OpenWrite, false).is_err());
    }
}
