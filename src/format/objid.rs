use lazy_static::lazy_static;
use regex::Regex;

use crate::config::{Namespace, Repo};
use crate::error::{Error, Result};

use super::{
    check_version, epoch_to_str, str_to_epoch, CONFIG_VERS_MAJ, CONFIG_VERS_MIN, MAX_BUCKET,
    MAX_OBJID, NS_ALIAS_RESERVE,
};

/// How objects are used to store files.
///
/// `Fuse` and `Nto1` appear only in object-IDs (they record the writer);
/// the final storage type is what `Post` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjType {
    None,
    Uni,
    Multi,
    Packed,
    Striped,
    Fuse,
    Nto1,
}

impl ObjType {
    pub fn code(self) -> char {
        match self {
            ObjType::None => '_',
            ObjType::Uni => 'U',
            ObjType::Multi => 'M',
            ObjType::Packed => 'P',
            ObjType::Striped => 'S',
            ObjType::Fuse => 'F',
            ObjType::Nto1 => 'N',
        }
    }

    pub fn from_code(c: char) -> Result<ObjType> {
        Ok(match c {
            '_' => ObjType::None,
            'U' => ObjType::Uni,
            'M' => ObjType::Multi,
            'P' => ObjType::Packed,
            'S' => ObjType::Striped,
            'F' => ObjType::Fuse,
            'N' => ObjType::Nto1,
            other => {
                return Err(Error::BadFormat {
                    field: "obj_type",
                    detail: format!("unknown code '{}'", other),
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    None,
    Crc32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    None,
}

impl Compression {
    pub fn code(self) -> char {
        '_'
    }
    pub fn from_code(c: char) -> Result<Self> {
        match c {
            '_' => Ok(Compression::None),
            other => Err(Error::BadFormat {
                field: "compression",
                detail: format!("unknown code '{}'", other),
            }),
        }
    }
}

impl Correction {
    pub fn code(self) -> char {
        match self {
            Correction::None => '_',
            Correction::Crc32 => 'C',
        }
    }
    pub fn from_code(c: char) -> Result<Self> {
        match c {
            '_' => Ok(Correction::None),
            'C' => Ok(Correction::Crc32),
            other => Err(Error::BadFormat {
                field: "correction",
                detail: format!("unknown code '{}'", other),
            }),
        }
    }
}

impl Encryption {
    pub fn code(self) -> char {
        '_'
    }
    pub fn from_code(c: char) -> Result<Self> {
        match c {
            '_' => Ok(Encryption::None),
            other => Err(Error::BadFormat {
                field: "encryption",
                detail: format!("unknown code '{}'", other),
            }),
        }
    }
}

/// Encode a namespace name for embedding in an object-ID: buckets cannot
/// contain '/', so it becomes '-'. Config load rejects '-' in namespace
/// names, keeping the mapping invertible.
pub fn encode_namespace(name: &str) -> String {
    name.replace('/', "-")
}

pub fn decode_namespace(encoded: &str) -> String {
    encoded.replace('-', "/")
}

bitflags::bitflags! {
    pub struct PreFlags: u8 {
        /// Older stringifications of this ID are obsolete.
        const UPDATED = 0x01;
    }
}

/// Storage identity of a file, known at create time. Stringified into the
/// `user.marfs_objid` xattr and into every object name derived from it.
///
/// The flags byte and the host-randomization seed ride in memory only;
/// they are not part of the stringification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pre {
    pub config_vers_maj: u16,
    pub config_vers_min: u16,

    /// Repo name; doubles as the object bucket.
    pub repo: String,
    /// Namespace name (decoded form, may contain '/').
    pub ns: String,

    /// Only `{Packed, Fuse, Nto1, None}` here; `Post` records the final type.
    pub obj_type: ObjType,
    pub compression: Compression,
    pub correction: Correction,
    pub encryption: Encryption,

    pub md_inode: u64,
    pub md_ctime: i64,
    pub obj_ctime: i64,
    /// Disambiguates overwrites landing within one second of each other.
    pub unique: u8,

    pub chunk_size: u64,
    pub chunk_no: u64,

    pub flags: PreFlags,
    /// Seed for randomized host dispersal; not stringified.
    pub seed: u32,
}

lazy_static! {
    static ref OBJID_RE: Regex = Regex::new(concat!(
        r"^(?P<bucket>[^/]+)/ver\.(?P<maj>\d{3})_(?P<min>\d{3})/ns\.(?P<ns>[^/]+)",
        r"/(?P<otype>.)(?P<comp>.)(?P<corr>.)(?P<enc>.)/inode\.(?P<inode>[0-9a-f]+)",
        r"/md_ctime\.(?P<mdct>[^/]+)/obj_ctime\.(?P<objct>[^/]+)/unq\.(?P<unq>\d+)",
        r"/chnksz\.(?P<chnksz>[0-9a-f]+)/chnkno\.(?P<chnkno>\d+)$"
    ))
    .unwrap();
}

impl Pre {
    /// Identity for a file about to be written: object creation time is
    /// now, chunk 0, a fresh dispersal seed.
    pub fn new(
        obj_type: ObjType,
        ns: &Namespace,
        repo: &Repo,
        md_inode: u64,
        md_ctime: i64,
    ) -> Pre {
        Pre {
            config_vers_maj: CONFIG_VERS_MAJ,
            config_vers_min: CONFIG_VERS_MIN,
            repo: repo.name.clone(),
            ns: ns.name.clone(),
            obj_type,
            compression: Compression::None,
            correction: if repo.checksums {
                Correction::Crc32
            } else {
                Correction::None
            },
            encryption: Encryption::None,
            md_inode,
            md_ctime,
            obj_ctime: now_epoch(),
            unique: 0,
            chunk_size: repo.chunk_size,
            chunk_no: 0,
            flags: PreFlags::empty(),
            seed: rand::random(),
        }
    }

    /// Full object-ID (bucket included); also the `user.marfs_objid` value.
    pub fn objid(&self) -> Result<String> {
        if self.repo.len() > MAX_BUCKET - NS_ALIAS_RESERVE {
            return Err(Error::Overflow("bucket"));
        }
        let id = format!(
            "{}/ver.{:03}_{:03}/ns.{}/{}{}{}{}/inode.{:010x}/md_ctime.{}/obj_ctime.{}/unq.{}/chnksz.{:x}/chnkno.{}",
            self.repo,
            self.config_vers_maj,
            self.config_vers_min,
            encode_namespace(&self.ns),
            self.obj_type.code(),
            self.compression.code(),
            self.correction.code(),
            self.encryption.code(),
            self.md_inode,
            epoch_to_str(self.md_ctime)?,
            epoch_to_str(self.obj_ctime)?,
            self.unique,
            self.chunk_size,
            self.chunk_no,
        );
        if id.len() > MAX_BUCKET + 1 + MAX_OBJID {
            return Err(Error::Overflow("objid"));
        }
        Ok(id)
    }

    pub fn parse(s: &str) -> Result<Pre> {
        let caps = OBJID_RE.captures(s).ok_or(Error::BadFormat {
            field: "objid",
            detail: format!("'{}'", s),
        })?;

        let maj: u16 = caps["maj"].parse().unwrap();
        let min: u16 = caps["min"].parse().unwrap();
        check_version(maj, min)?;

        let field = |name: &'static str, detail: &str| Error::BadFormat {
            field: name,
            detail: detail.to_string(),
        };

        let mut chars = caps["otype"].chars().chain(
            caps["comp"]
                .chars()
                .chain(caps["corr"].chars().chain(caps["enc"].chars())),
        );
        let obj_type = ObjType::from_code(chars.next().unwrap())?;
        let compression = Compression::from_code(chars.next().unwrap())?;
        let correction = Correction::from_code(chars.next().unwrap())?;
        let encryption = Encryption::from_code(chars.next().unwrap())?;

        Ok(Pre {
            config_vers_maj: maj,
            config_vers_min: min,
            repo: caps["bucket"].to_string(),
            ns: decode_namespace(&caps["ns"]),
            obj_type,
            compression,
            correction,
            encryption,
            md_inode: u64::from_str_radix(&caps["inode"], 16)
                .map_err(|e| field("inode", &e.to_string()))?,
            md_ctime: str_to_epoch(&caps["mdct"])?,
            obj_ctime: str_to_epoch(&caps["objct"])?,
            unique: caps["unq"]
                .parse()
                .map_err(|_| field("unq", &caps["unq"]))?,
            chunk_size: u64::from_str_radix(&caps["chnksz"], 16)
                .map_err(|e| field("chnksz", &e.to_string()))?,
            chunk_no: caps["chnkno"]
                .parse()
                .map_err(|_| field("chnkno", &caps["chnkno"]))?,
            flags: PreFlags::empty(),
            seed: 0,
        })
    }

    /// The per-chunk object name: same identity, substituted chunk number.
    pub fn objid_for_chunk(&self, chunk_no: u64) -> Result<String> {
        let mut pre = self.clone();
        pre.chunk_no = chunk_no;
        pre.objid()
    }

    /// Object URL against the repo's host pool, spread by this file's seed.
    pub fn url(&self, repo: &Repo) -> Result<url::Url> {
        let scheme = if repo.https { "https" } else { "http" };
        let host = repo.host_for(self.seed);
        let raw = match repo.port {
            Some(port) => format!("{}://{}:{}/{}", scheme, host, port, self.objid()?),
            None => format!("{}://{}/{}", scheme, host, self.objid()?),
        };
        url::Url::parse(&raw).map_err(|err| Error::BadFormat {
            field: "url",
            detail: err.to_string(),
        })
    }
}

fn now_epoch() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Pre {
        Pre {
            config_vers_maj: CONFIG_VERS_MAJ,
            config_vers_min: CONFIG_VERS_MIN,
            repo: "objstore".into(),
            ns: "proj/sub".into(),
            obj_type: ObjType::Fuse,
            compression: Compression::None,
            correction: Correction::Crc32,
            encryption: Encryption::None,
            md_inode: 0x1a2b3c,
            md_ctime: 1_600_000_000,
            obj_ctime: 1_600_000_001,
            unique: 3,
            chunk_size: 0x100000,
            chunk_no: 7,
            flags: PreFlags::empty(),
            seed: 0,
        }
    }

    #[test]
    fn objid_round_trip() {
        let pre = sample();
        let id = pre.objid().unwrap();
        assert!(id.starts_with("objstore/ver.001_000/ns.proj-sub/F_C_/inode.00001a2b3c/"));
        let back = Pre::parse(&id).unwrap();
        assert_eq!(back, pre);
    }

    #[test]
    fn chunk_substitution_only_touches_chnkno() {
        let pre = sample();
        let id0 = pre.objid_for_chunk(0).unwrap();
        let id9 = pre.objid_for_chunk(9).unwrap();
        assert_eq!(
            id0.trim_end_matches(char::is_numeric),
            id9.trim_end_matches(char::is_numeric)
        );
        assert!(id9.ends_with("/chnkno.9"));
    }

    #[test]
    fn version_gate() {
        let pre = sample();
        let id = pre.objid().unwrap().replace("ver.001", "ver.002");
        match Pre::parse(&id) {
            Err(crate::error::Error::UnsupportedVersion { major: 2, .. }) => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn url_targets_a_pool_host() {
        let repo = crate::config::Repo {
            name: "objstore".into(),
            hosts: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            port: Some(9020),
            https: false,
            access: crate::config::AccessProtocol::S3,
            auth: crate::config::AuthMethod::S3AwsUser,
            chunk_size: 1 << 20,
            max_get_size: 0,
            min_pack_file_size: 0,
            max_pack_file_size: 0,
            min_pack_file_count: 0,
            max_pack_file_count: 0,
            read_timeout_s: 20,
            write_timeout_s: 20,
            checksums: false,
        };
        let mut pre = sample();
        pre.seed = 1;
        let url = pre.url(&repo).unwrap();
        assert_eq!(url.host_str(), Some("10.0.0.2"));
        assert_eq!(url.port(), Some(9020));
        assert!(url.path().starts_with("/objstore/ver.001_000/"));
    }

    #[test]
    fn namespace_encoding_is_invertible() {
        assert_eq!(encode_namespace("a/b/c"), "a-b-c");
        assert_eq!(decode_namespace("a-b-c"), "a/b/c");
    }
}
