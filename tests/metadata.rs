//! Metadata surface: namespace gating, directory ops, xattr guards.

mod common;

use common::fixture;

use marfs::Error;

#[test]
fn directory_lifecycle_and_listing() {
    let fs = fixture(3072);
    fs.fuse.mkdir("/proj/dir", 0o750).unwrap();
    fs.fuse.mknod("/proj/dir/one", 0o100644).unwrap();
    fs.fuse.mknod("/proj/dir/two", 0o100644).unwrap();

    let mut names = fs.fuse.readdir("/proj/dir").unwrap();
    names.sort();
    assert_eq!(names, vec!["one", "two"]);

    // Internal structure stays invisible at the namespace root.
    let names = fs.fuse.readdir("/proj").unwrap();
    assert!(names.iter().all(|n| !n.starts_with("MDAL_")));

    fs.fuse.rename("/proj/dir/one", "/proj/dir/renamed").unwrap();
    let mut names = fs.fuse.readdir("/proj/dir").unwrap();
    names.sort();
    assert_eq!(names, vec!["renamed", "two"]);

    assert!(matches!(
        fs.fuse.rmdir("/proj/dir"),
        Err(Error::NotEmpty(_))
    ));
}

#[test]
fn symlinks_resolve_within_namespace() {
    let fs = fixture(3072);
    fs.fuse.mknod("/proj/target", 0o100644).unwrap();
    fs.fuse.symlink("target", "/proj/alias").unwrap();
    assert_eq!(
        fs.fuse.readlink("/proj/alias").unwrap(),
        std::path::PathBuf::from("target")
    );
}

#[test]
fn reserved_xattrs_are_walled_off() {
    let fs = fixture(3072);
    fs.fuse.mknod("/proj/f", 0o100644).unwrap();

    // User attributes work normally.
    fs.fuse.setxattr("/proj/f", "user.color", b"teal").unwrap();
    assert_eq!(fs.fuse.getxattr("/proj/f", "user.color").unwrap(), b"teal");
    assert_eq!(fs.fuse.listxattr("/proj/f").unwrap(), vec!["user.color"]);

    // The system prefix is refused in every direction, and the system
    // attributes never show up in listings.
    for result in [
        fs.fuse
            .setxattr("/proj/f", "user.marfs_objid", b"forged")
            .err(),
        fs.fuse.getxattr("/proj/f", "user.marfs_post").err(),
        fs.fuse.removexattr("/proj/f", "user.marfs_restart").err(),
    ] {
        assert!(matches!(result, Some(Error::PermissionDenied(_))));
    }

    fs.fuse.removexattr("/proj/f", "user.color").unwrap();
    assert!(fs.fuse.listxattr("/proj/f").unwrap().is_empty());
}

#[test]
fn root_namespace_denies_and_hides() {
    let fs = fixture(3072);
    // X-only root namespace: even metadata reads are gated off.
    assert!(matches!(
        fs.fuse.readdir("/"),
        Err(Error::PermissionDenied(_))
    ));
    assert!(matches!(
        fs.fuse.mknod("/stray", 0o100644),
        Err(Error::PermissionDenied(_))
    ));
}

#[test]
fn statvfs_reports_for_namespace() {
    let fs = fixture(3072);
    let vfs = fs.fuse.statvfs("/proj").unwrap();
    assert!(vfs.bsize > 0);
    assert!(vfs.blocks > 0);
}

#[test]
fn metadata_paths_cannot_reach_the_store() {
    let fs = fixture(3072);
    let inside = format!("{}/proj/anything", fs.config.mdfs_top.display());
    assert!(matches!(
        fs.fuse.getattr(&inside),
        Err(Error::PermissionDenied(_))
    ));
}

#[test]
fn utime_and_chmod_pass_through() {
    let fs = fixture(3072);
    fs.fuse.mknod("/proj/t", 0o100644).unwrap();
    fs.fuse.chmod("/proj/t", 0o640).unwrap();
    fs.fuse
        .utimens("/proj/t", (1_500_000_000, 0), (1_500_000_123, 0))
        .unwrap();
    let st = fs.fuse.getattr("/proj/t").unwrap();
    assert_eq!(st.st_mode & 0o7777, 0o640);
    assert_eq!(st.st_mtime, 1_500_000_123);
}
