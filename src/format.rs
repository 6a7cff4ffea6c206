//! Identifier and recovery codec.
//!
//! Everything stored outside the engine's memory goes through this module:
//! object-IDs, the three reserved xattr value strings (`Pre`, `Post`,
//! `Restart`), the per-chunk binary records of Multi MD files, and the
//! recovery footer written at the tail of every object. All functions here
//! are pure and allocation-bounded; none perform I/O.
//!
//! Each stringification starts with the config version that wrote it.
//! Parsers gate on the major version, so a layout change bumps
//! `CONFIG_VERS_MAJ` and old readers fail with `UnsupportedVersion`
//! instead of misparsing.

use crate::error::{Error, Result};

mod objid;
pub use objid::*;

mod xattrs;
pub use xattrs::*;

mod chunk_info;
pub use chunk_info::*;

mod recovery;
pub use recovery::*;

pub const CONFIG_VERS_MAJ: u16 = 1;
pub const CONFIG_VERS_MIN: u16 = 0;

/// S3 bucket-name ceiling.
pub const MAX_BUCKET: usize = 63;
/// Reserved for the namespace alias riding along in the bucket.
pub const NS_ALIAS_RESERVE: usize = 8;
pub const MAX_REPO_NAME: usize = MAX_BUCKET - NS_ALIAS_RESERVE;

pub const MAX_OBJID: usize = 512;
pub const MAX_MD_PATH: usize = 512;

/// Logical names of the three system xattrs. The MDAL maps hidden
/// attributes under its reserved prefix, so these land on disk as
/// `user.marfs_objid` and friends.
pub const XATTR_OBJID: &str = "objid";
pub const XATTR_POST: &str = "post";
pub const XATTR_RESTART: &str = "restart";

/// Timestamp layout inside object-IDs. Emitted in UTC (so the offset is
/// always `+0000`); parsed with any offset so IDs written under older
/// local-time configurations keep resolving.
pub const DATE_FORMAT: &str = "%Y%m%d_%H%M%S%z";

pub fn epoch_to_str(secs: i64) -> Result<String> {
    use chrono::TimeZone;
    let when = chrono::Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or(Error::Overflow("timestamp"))?;
    Ok(when.format(DATE_FORMAT).to_string())
}

pub fn str_to_epoch(s: &str) -> Result<i64> {
    let when = chrono::DateTime::parse_from_str(s, DATE_FORMAT).map_err(|err| {
        Error::BadFormat {
            field: "timestamp",
            detail: format!("'{}': {}", s, err),
        }
    })?;
    Ok(when.timestamp())
}

pub(crate) fn check_version(major: u16, minor: u16) -> Result<()> {
    if major != CONFIG_VERS_MAJ {
        return Err(Error::UnsupportedVersion { major, minor });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn date_round_trip() {
        let s = epoch_to_str(1_700_000_000).unwrap();
        assert!(s.ends_with("+0000"));
        assert_eq!(str_to_epoch(&s).unwrap(), 1_700_000_000);
    }

    #[test]
    fn date_accepts_nonzero_offset() {
        // An ID stamped under a local-time configuration.
        assert_eq!(
            str_to_epoch("20231114_161320-0600").unwrap(),
            1_700_000_000
        );
    }
}
