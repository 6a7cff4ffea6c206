use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

use super::{check_version, ObjType, CONFIG_VERS_MAJ, CONFIG_VERS_MIN, MAX_MD_PATH};

bitflags::bitflags! {
    pub struct PostFlags: u8 {
        /// The MD file has been renamed into the trash.
        const TRASH = 0x01;
    }
}

bitflags::bitflags! {
    pub struct RestartFlags: u8 {
        const OLD        = 0x01;
        /// `mode` preserves the user's intended final mode.
        const MODE_VALID = 0x02;
    }
}

/// Completion-time storage info, stringified into `user.marfs_post`.
///
/// `chunks` is context-dependent: for Multi it counts the MultiChunkInfo
/// records in the MD file; for Packed it counts the user files sharing
/// the object. The absolute MD path is carried so that an inode scan can
/// find the file without a tree walk; it is only stamped for trash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub config_vers_maj: u16,
    pub config_vers_min: u16,

    pub obj_type: ObjType,
    /// Intra-object byte offset of this file's data (Packed only).
    pub obj_offset: u64,
    pub correct_info: u64,
    pub encrypt_info: u64,
    pub chunks: u64,
    /// Total bytes of chunk-info records in the MD file (Multi).
    pub chunk_info_bytes: u64,
    pub flags: PostFlags,
    pub md_path: String,
}

lazy_static! {
    static ref POST_RE: Regex = Regex::new(concat!(
        r"^ver\.(?P<maj>\d{3})_(?P<min>\d{3})/(?P<otype>.)/off\.(?P<off>\d+)",
        r"/objs\.(?P<objs>\d+)/bytes\.(?P<bytes>\d+)/corr\.(?P<corr>[0-9a-f]{16})",
        r"/crypt\.(?P<crypt>[0-9a-f]{16})/flags\.(?P<flags>[0-9A-F]{2})/mdfs\.(?P<mdfs>.*)$"
    ))
    .unwrap();
    static ref RESTART_RE: Regex = Regex::new(
        r"^ver\.(?P<maj>\d{3})_(?P<min>\d{3})/flags\.0x(?P<flags>[0-9A-F]{2})/mode\.oct(?P<mode>[0-7]{6})$"
    )
    .unwrap();
}

impl Post {
    pub fn new(obj_type: ObjType) -> Post {
        Post {
            config_vers_maj: CONFIG_VERS_MAJ,
            config_vers_min: CONFIG_VERS_MIN,
            obj_type,
            obj_offset: 0,
            correct_info: 0,
            encrypt_info: 0,
            chunks: 0,
            chunk_info_bytes: 0,
            flags: PostFlags::empty(),
            md_path: String::new(),
        }
    }

    pub fn emit(&self, with_md_path: bool) -> Result<String> {
        if self.md_path.len() > MAX_MD_PATH {
            return Err(Error::Overflow("md_path"));
        }
        let md_path = if with_md_path {
            self.md_path.as_str()
        } else {
            ""
        };
        Ok(format!(
            "ver.{:03}_{:03}/{}/off.{}/objs.{}/bytes.{}/corr.{:016x}/crypt.{:016x}/flags.{:02X}/mdfs.{}",
            self.config_vers_maj,
            self.config_vers_min,
            self.obj_type.code(),
            self.obj_offset,
            self.chunks,
            self.chunk_info_bytes,
            self.correct_info,
            self.encrypt_info,
            self.flags.bits(),
            md_path,
        ))
    }

    pub fn parse(s: &str) -> Result<Post> {
        let caps = POST_RE.captures(s).ok_or(Error::BadFormat {
            field: "post",
            detail: format!("'{}'", s),
        })?;
        let maj: u16 = caps["maj"].parse().unwrap();
        let min: u16 = caps["min"].parse().unwrap();
        check_version(maj, min)?;

        let num = |field: &'static str, text: &str| -> Result<u64> {
            text.parse().map_err(|_| Error::BadFormat {
                field,
                detail: text.to_string(),
            })
        };

        Ok(Post {
            config_vers_maj: maj,
            config_vers_min: min,
            obj_type: ObjType::from_code(caps["otype"].chars().next().unwrap())?,
            obj_offset: num("off", &caps["off"])?,
            chunks: num("objs", &caps["objs"])?,
            chunk_info_bytes: num("bytes", &caps["bytes"])?,
            correct_info: u64::from_str_radix(&caps["corr"], 16).unwrap(),
            encrypt_info: u64::from_str_radix(&caps["crypt"], 16).unwrap(),
            flags: PostFlags::from_bits_truncate(
                u8::from_str_radix(&caps["flags"], 16).unwrap(),
            ),
            md_path: caps["mdfs"].to_string(),
        })
    }
}

/// Present for the duration of a write; its mere presence marks the file
/// incomplete. Optionally preserves the intended final mode when the file
/// was opened with a mode that would forbid xattr writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restart {
    pub config_vers_maj: u16,
    pub config_vers_min: u16,
    pub flags: RestartFlags,
    pub mode: u32,
}

impl Restart {
    pub fn new() -> Restart {
        Restart {
            config_vers_maj: CONFIG_VERS_MAJ,
            config_vers_min: CONFIG_VERS_MIN,
            flags: RestartFlags::empty(),
            mode: 0,
        }
    }

    pub fn with_mode(mode: u32) -> Restart {
        Restart {
            flags: RestartFlags::MODE_VALID,
            mode,
            ..Restart::new()
        }
    }

    pub fn emit(&self) -> String {
        format!(
            "ver.{:03}_{:03}/flags.0x{:02X}/mode.oct{:06o}",
            self.config_vers_maj,
            self.config_vers_min,
            self.flags.bits(),
            self.mode
        )
    }

    pub fn parse(s: &str) -> Result<Restart> {
        let caps = RESTART_RE.captures(s).ok_or(Error::BadFormat {
            field: "restart",
            detail: format!("'{}'", s),
        })?;
        let maj: u16 = caps["maj"].parse().unwrap();
        let min: u16 = caps["min"].parse().unwrap();
        check_version(maj, min)?;
        Ok(Restart {
            config_vers_maj: maj,
            config_vers_min: min,
            flags: RestartFlags::from_bits_truncate(
                u8::from_str_radix(&caps["flags"], 16).unwrap(),
            ),
            mode: u32::from_str_radix(&caps["mode"], 8).unwrap(),
        })
    }
}

impl Default for Restart {
    fn default() -> Self {
        Restart::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn post_round_trip() {
        let mut post = Post::new(ObjType::Multi);
        post.chunks = 12;
        post.chunk_info_bytes = 12 * 44;
        post.correct_info = 0xdead_beef_0110;
        post.flags = PostFlags::TRASH;
        post.md_path = "/gpfs/marfs/proj/trash/file.0001".into();

        let s = post.emit(true).unwrap();
        assert_eq!(Post::parse(&s).unwrap(), post);

        // Without the path, everything else still survives.
        let s = post.emit(false).unwrap();
        let back = Post::parse(&s).unwrap();
        assert_eq!(back.chunks, 12);
        assert!(back.md_path.is_empty());
    }

    #[test]
    fn restart_preserves_mode() {
        let restart = Restart::with_mode(0o440);
        let s = restart.emit();
        assert_eq!(s, "ver.001_000/flags.0x02/mode.oct000440");
        assert_eq!(Restart::parse(&s).unwrap(), restart);
    }

    #[test]
    fn garbage_rejected() {
        assert!(Post::parse("ver.001_000/bogus").is_err());
        assert!(Restart::parse("").is_err());
    }
}
