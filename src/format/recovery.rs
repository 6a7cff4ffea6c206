use std::io::Write;
use std::ops::Range;

use byteorder::{BigEndian, ByteOrder};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

use super::{check_version, CONFIG_VERS_MAJ, CONFIG_VERS_MIN};

/// Fixed reservation of one per-file recovery record.
pub const RECOVERY_BODY_SIZE: usize = 1000;
/// Magic + two network-byte-order u64s; the very last bytes of every object.
pub const RECOVERY_TAIL_SIZE: usize = 24;
/// Per-object recovery reservation for Uni/Multi (one body + the tail).
pub const RECOVERY_SIZE: u64 = (RECOVERY_BODY_SIZE + RECOVERY_TAIL_SIZE) as u64;

pub const RECOVERY_TAIL_MAGIC: [u8; 8] = *b"MarFStl1";

// The tail layout may never drift from RECOVERY_TAIL_SIZE; the final two
// 8-byte fields must land exactly at end-of-object.
const _TAIL_LAYOUT: [u8; RECOVERY_TAIL_SIZE] = [0u8; 8 + 8 + 8];

/// One file's recovery record: enough to regenerate its metadata from the
/// object alone. Captured at create time; not maintained across later
/// chmod/chown/rename/utime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryBody {
    pub config_vers_maj: u16,
    pub config_vers_min: u16,
    /// User-data bytes belonging to this record, in this object only.
    pub dsize: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    /// Stringified `Pre` (the object-ID).
    pub pre: String,
    /// Stringified `Post`.
    pub post: String,
    pub md_path: String,
}

lazy_static! {
    static ref REC_HEAD_RE: Regex = Regex::new(concat!(
        r"^HEAD:/ver\.(?P<maj>\d{3})_(?P<min>\d{3})/rsize\.(?P<rsize>\d{8})",
        r"/dsize\.(?P<dsize>\d+)/mode\.oct(?P<mode>[0-7]{8})/uid\.(?P<uid>\d+)",
        r"/gid\.(?P<gid>\d+)/md_mtime\.0x(?P<mtime>[0-9a-f]{16})$"
    ))
    .unwrap();
}

impl RecoveryBody {
    pub fn new(
        dsize: u64,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
        pre: String,
        post: String,
        md_path: String,
    ) -> RecoveryBody {
        RecoveryBody {
            config_vers_maj: CONFIG_VERS_MAJ,
            config_vers_min: CONFIG_VERS_MIN,
            dsize,
            mode,
            uid,
            gid,
            mtime,
            pre,
            post,
            md_path,
        }
    }

    /// Serialize into the fixed reservation, NUL-padded.
    pub fn emit(&self) -> Result<[u8; RECOVERY_BODY_SIZE]> {
        let text = format!(
            "HEAD:/ver.{:03}_{:03}/rsize.{:08}/dsize.{}/mode.oct{:08o}/uid.{}/gid.{}/md_mtime.0x{:016x}\n{}\n{}\n{}\n",
            self.config_vers_maj,
            self.config_vers_min,
            RECOVERY_BODY_SIZE,
            self.dsize,
            self.mode,
            self.uid,
            self.gid,
            self.mtime as u64,
            self.pre,
            self.post,
            self.md_path,
        );
        if text.len() > RECOVERY_BODY_SIZE {
            return Err(Error::Overflow("recovery body"));
        }
        let mut buf = [0u8; RECOVERY_BODY_SIZE];
        buf[..text.len()].copy_from_slice(text.as_bytes());
        Ok(buf)
    }

    pub fn parse(buf: &[u8]) -> Result<RecoveryBody> {
        if buf.len() < RECOVERY_BODY_SIZE {
            return Err(Error::Truncated("recovery body"));
        }
        let end = buf[..RECOVERY_BODY_SIZE]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(RECOVERY_BODY_SIZE);
        let text = std::str::from_utf8(&buf[..end]).map_err(|_| Error::BadFormat {
            field: "recovery body",
            detail: "not utf-8".into(),
        })?;

        let mut lines = text.split('\n');
        let head = lines.next().ok_or(Error::Truncated("recovery head"))?;
        let caps = REC_HEAD_RE.captures(head).ok_or(Error::BadFormat {
            field: "recovery head",
            detail: format!("'{}'", head),
        })?;
        let maj: u16 = caps["maj"].parse().unwrap();
        let min: u16 = caps["min"].parse().unwrap();
        check_version(maj, min)?;

        let pre = lines.next().ok_or(Error::Truncated("recovery pre"))?;
        let post = lines.next().ok_or(Error::Truncated("recovery post"))?;
        let md_path = lines.next().ok_or(Error::Truncated("recovery path"))?;

        Ok(RecoveryBody {
            config_vers_maj: maj,
            config_vers_min: min,
            dsize: caps["dsize"].parse().map_err(|_| Error::BadFormat {
                field: "dsize",
                detail: caps["dsize"].to_string(),
            })?,
            mode: u32::from_str_radix(&caps["mode"], 8).unwrap(),
            uid: caps["uid"].parse().unwrap(),
            gid: caps["gid"].parse().unwrap(),
            mtime: u64::from_str_radix(&caps["mtime"], 16).unwrap() as i64,
            pre: pre.to_string(),
            post: post.to_string(),
            md_path: md_path.to_string(),
        })
    }
}

/// Terminates every object. `reclen` spans the trailing recovery region
/// (the last body plus this tail), so `object_size - reclen` always lands
/// on a body's HEAD line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryTail {
    pub nfiles: u64,
    pub reclen: u64,
}

impl RecoveryTail {
    pub fn new(nfiles: u64) -> RecoveryTail {
        RecoveryTail {
            nfiles,
            reclen: RECOVERY_SIZE,
        }
    }

    pub fn emit(&self) -> [u8; RECOVERY_TAIL_SIZE] {
        let mut buf = [0u8; RECOVERY_TAIL_SIZE];
        buf[..8].copy_from_slice(&RECOVERY_TAIL_MAGIC);
        BigEndian::write_u64(&mut buf[8..16], self.nfiles);
        BigEndian::write_u64(&mut buf[16..24], self.reclen);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<RecoveryTail> {
        if buf.len() < RECOVERY_TAIL_SIZE {
            return Err(Error::Truncated("recovery tail"));
        }
        let tail = &buf[buf.len() - RECOVERY_TAIL_SIZE..];
        if tail[..8] != RECOVERY_TAIL_MAGIC {
            return Err(Error::BadFormat {
                field: "recovery tail",
                detail: "bad magic".into(),
            });
        }
        Ok(RecoveryTail {
            nfiles: BigEndian::read_u64(&tail[8..16]),
            reclen: BigEndian::read_u64(&tail[16..24]),
        })
    }
}

/// Streaming emission against any byte sink (usually an open PUT stream).
pub fn write_body<W: Write>(writer: &mut W, body: &RecoveryBody) -> Result<()> {
    writer.write_all(&body.emit()?)?;
    Ok(())
}

pub fn write_tail<W: Write>(writer: &mut W, nfiles: u64) -> Result<()> {
    writer.write_all(&RecoveryTail::new(nfiles).emit())?;
    // Belt and suspenders: everything after the tail would corrupt the
    // object, so flush through to the sink now.
    writer.flush()?;
    Ok(())
}

/// Bytes of recovery info an object carries for `nfiles` packed members
/// (Uni/Multi pass 1).
pub fn recovery_reservation(nfiles: u64) -> u64 {
    nfiles * RECOVERY_BODY_SIZE as u64 + RECOVERY_TAIL_SIZE as u64
}

/// One recovered file: its record plus the byte extent of its user data
/// within the object.
#[derive(Debug, Clone)]
pub struct RecoveredFile {
    pub body: RecoveryBody,
    pub data: Range<usize>,
}

/// Reconstruct the files stored in an object from its bytes alone: read
/// the tail, back up to the last body, then walk the interleaved
/// `[data][body]` units front-ward. Records come back in pack order.
pub fn parse_object(blob: &[u8]) -> Result<(Vec<RecoveredFile>, RecoveryTail)> {
    let tail = RecoveryTail::parse(blob)?;
    if tail.reclen != RECOVERY_SIZE {
        return Err(Error::BadFormat {
            field: "recovery tail",
            detail: format!("reclen {} != {}", tail.reclen, RECOVERY_SIZE),
        });
    }

    let mut files = Vec::with_capacity(tail.nfiles as usize);
    let mut pos = blob.len() - RECOVERY_TAIL_SIZE;
    for _ in 0..tail.nfiles {
        if pos < RECOVERY_BODY_SIZE {
            return Err(Error::Truncated("recovery record"));
        }
        let body_start = pos - RECOVERY_BODY_SIZE;
        let body = RecoveryBody::parse(&blob[body_start..pos])?;
        let dsize = body.dsize as usize;
        if body_start < dsize {
            return Err(Error::Truncated("recovery data extent"));
        }
        let data_start = body_start - dsize;
        files.push(RecoveredFile {
            body,
            data: data_start..body_start,
        });
        pos = data_start;
    }
    files.reverse();
    Ok((files, tail))
}

#[cfg(test)]
mod test {
    use super::*;

    fn body(dsize: u64, path: &str) -> RecoveryBody {
        RecoveryBody::new(
            dsize,
            0o100644,
            1000,
            1000,
            1_600_000_000,
            "repo/ver.001_000/ns.ns/U___/inode.0000000001/md_ctime.x/obj_ctime.x/unq.0/chnksz.400/chnkno.0".into(),
            "ver.001_000/U/off.0/objs.1/bytes.0/corr.0000000000000000/crypt.0000000000000000/flags.00/mdfs.".into(),
            path.into(),
        )
    }

    #[test]
    fn tail_is_exactly_24_bytes() {
        let tail = RecoveryTail::new(3);
        let buf = tail.emit();
        assert_eq!(buf.len(), RECOVERY_TAIL_SIZE);
        assert_eq!(RecoveryTail::parse(&buf).unwrap(), tail);
    }

    #[test]
    fn body_round_trip() {
        let b = body(512, "/mdfs/ns/file");
        let buf = b.emit().unwrap();
        assert_eq!(buf.len(), RECOVERY_BODY_SIZE);
        assert_eq!(RecoveryBody::parse(&buf).unwrap(), b);
    }

    #[test]
    fn uni_object_walks_back() {
        let mut blob = vec![7u8; 300];
        write_body(&mut blob, &body(300, "/mdfs/a")).unwrap();
        write_tail(&mut blob, 1).unwrap();

        let (files, tail) = parse_object(&blob).unwrap();
        assert_eq!(tail.nfiles, 1);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].data, 0..300);
        assert_eq!(files[0].body.md_path, "/mdfs/a");
    }

    #[test]
    fn packed_object_recovers_all_members() {
        let mut blob = Vec::new();
        for (i, len) in [10usize, 20, 30].iter().enumerate() {
            blob.extend(std::iter::repeat(i as u8).take(*len));
            write_body(&mut blob, &body(*len as u64, &format!("/mdfs/f{}", i))).unwrap();
        }
        write_tail(&mut blob, 3).unwrap();

        let (files, tail) = parse_object(&blob).unwrap();
        assert_eq!(tail.nfiles, 3);
        let extents: Vec<_> = files.iter().map(|f| f.data.clone()).collect();
        assert_eq!(extents[0], 0..10);
        assert_eq!(extents[1], 10 + RECOVERY_BODY_SIZE..30 + RECOVERY_BODY_SIZE);
        assert_eq!(files[2].body.md_path, "/mdfs/f2");
        assert!(blob[extents[1].clone()].iter().all(|&b| b == 1));
    }

    #[test]
    fn oversized_path_overflows() {
        let b = body(1, &"x".repeat(RECOVERY_BODY_SIZE));
        assert!(matches!(b.emit(), Err(Error::Overflow(_))));
    }
}
