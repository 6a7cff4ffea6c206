use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::{MAX_REPO_NAME, RECOVERY_SIZE};

/// How the DAL reaches the backend holding a repo's objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessProtocol {
    S3,
    S3Emc,
    Sproxyd,
    /// "Objects" are plain files on a parallel filesystem.
    SemiDirect,
    /// No objects at all - data lives in the MD file.
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    None,
    S3AwsUser,
    S3AwsMaster,
}

/// A named backend binding. Chunk geometry is fixed at write time and
/// recorded in every object-ID, so changing these values does not break
/// previously written files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub name: String,

    /// Host, or host pool for randomized dispersal.
    pub hosts: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub https: bool,

    pub access: AccessProtocol,
    pub auth: AuthMethod,

    /// Maximum bytes per stored object, recovery footer included.
    pub chunk_size: u64,

    /// Cap on a single ranged GET; 0 means uncapped.
    #[serde(default)]
    pub max_get_size: u64,

    #[serde(default)]
    pub min_pack_file_size: u64,
    #[serde(default)]
    pub max_pack_file_size: u64,
    #[serde(default)]
    pub min_pack_file_count: u64,
    #[serde(default)]
    pub max_pack_file_count: u64,

    #[serde(default = "default_timeout")]
    pub read_timeout_s: u64,
    #[serde(default = "default_timeout")]
    pub write_timeout_s: u64,

    /// Compute CRC32 per chunk into `correct_info`.
    #[serde(default)]
    pub checksums: bool,
}

fn default_timeout() -> u64 {
    20
}

impl Repo {
    /// User-data capacity of one stored object.
    pub fn capacity(&self) -> u64 {
        self.chunk_size - RECOVERY_SIZE
    }

    pub fn is_direct(&self) -> bool {
        self.access == AccessProtocol::Direct
    }

    /// Packing is enabled when the config gives a positive member bound.
    pub fn packs(&self) -> bool {
        self.max_pack_file_count > 0
    }

    /// Pick a host for an object, spreading load across the pool with the
    /// per-file randomization seed recorded in `Pre`.
    pub fn host_for(&self, seed: u32) -> &str {
        &self.hosts[seed as usize % self.hosts.len()]
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_REPO_NAME {
            return Err(Error::InvalidArgument(format!(
                "repo name '{}' must be 1..={} bytes",
                self.name, MAX_REPO_NAME
            )));
        }
        if self.hosts.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "repo '{}' has no hosts",
                self.name
            )));
        }
        // An object must fit its recovery footer plus enough user data
        // that a Multi MD file's chunk-info records always stay below the
        // logical size it is truncated to.
        if self.chunk_size < RECOVERY_SIZE + 128 {
            return Err(Error::InvalidArgument(format!(
                "repo '{}': chunk_size {} must exceed the recovery reservation {} by at least 128",
                self.name, self.chunk_size, RECOVERY_SIZE
            )));
        }
        if self.max_pack_file_size > 0 && self.max_pack_file_size >= self.chunk_size {
            return Err(Error::InvalidArgument(format!(
                "repo '{}': max_pack_file_size must stay below chunk_size",
                self.name
            )));
        }
        Ok(())
    }
}
