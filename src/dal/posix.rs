//! Semi-direct backend: objects are files under a root directory on a
//! (parallel) filesystem, named by their object-ID. PUTs land in a
//! temporary sibling and rename into place on close, so a crashed writer
//! never leaves a half-visible object.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};

use super::{Dal, DalMode, DalStream, OpenSpec};

const TMP_SUFFIX: &str = ".marfs-partial";

pub struct PosixDal {
    root: PathBuf,
}

impl PosixDal {
    pub fn new(root: impl Into<PathBuf>) -> PosixDal {
        PosixDal { root: root.into() }
    }

    fn object_path(&self, objid: &str) -> Result<PathBuf> {
        let rel = Path::new(objid);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::InvalidArgument(format!(
                "bad object id '{}'",
                objid
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl Dal for PosixDal {
    fn open(&self, objid: &str, spec: OpenSpec) -> Result<Box<dyn DalStream>> {
        let path = self.object_path(objid)?;
        match spec.mode {
            DalMode::Put => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let tmp = PathBuf::from(format!(
                    "{}.{:08x}{}",
                    path.display(),
                    rand::random::<u32>(),
                    TMP_SUFFIX
                ));
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&tmp)?;
                debug!("put {} (staged as {:?})", objid, tmp.file_name());
                Ok(Box::new(PosixPutStream {
                    file: Some(file),
                    tmp,
                    dest: path,
                    announced: spec.length,
                    written: 0,
                }))
            }
            DalMode::Get => {
                let mut file = File::open(&path)
                    .map_err(|e| Error::from_errno(e.raw_os_error().unwrap_or(libc::EIO), &path))?;
                let size = file.metadata()?.len();
                if spec.offset > size {
                    return Err(Error::InvalidArgument(format!(
                        "range start {} beyond object size {}",
                        spec.offset, size
                    )));
                }
                file.seek(SeekFrom::Start(spec.offset))?;
                let end = spec
                    .length
                    .map(|len| (spec.offset + len).min(size))
                    .unwrap_or(size);
                Ok(Box::new(PosixGetStream {
                    file,
                    remaining: end - spec.offset,
                }))
            }
        }
    }

    fn delete(&self, objid: &str) -> Result<()> {
        let path = self.object_path(objid)?;
        fs::remove_file(&path)
            .map_err(|e| Error::from_errno(e.raw_os_error().unwrap_or(libc::EIO), &path))
    }

    fn stat(&self, objid: &str) -> Result<u64> {
        let path = self.object_path(objid)?;
        let meta = fs::metadata(&path)
            .map_err(|e| Error::from_errno(e.raw_os_error().unwrap_or(libc::EIO), &path))?;
        Ok(meta.len())
    }

    /// Sweep the object root for staging leftovers from crashed writers.
    fn verify(&self, fix: bool) -> Result<()> {
        fn sweep(dir: &Path, fix: bool, leftovers: &mut u64) -> Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    sweep(&path, fix, leftovers)?;
                } else if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                    *leftovers += 1;
                    if fix {
                        warn!("removing stale staging file {:?}", path);
                        fs::remove_file(&path)?;
                    } else {
                        warn!("stale staging file {:?}", path);
                    }
                }
            }
            Ok(())
        }
        let mut leftovers = 0;
        if self.root.exists() {
            sweep(&self.root, fix, &mut leftovers)?;
        }
        if leftovers > 0 && !fix {
            return Err(Error::InvalidArgument(format!(
                "{} stale staging files under {:?}",
                leftovers, self.root
            )));
        }
        Ok(())
    }
}

struct PosixPutStream {
    file: Option<File>,
    tmp: PathBuf,
    dest: PathBuf,
    announced: Option<u64>,
    written: u64,
}

impl DalStream for PosixPutStream {
    fn put(&mut self, buf: &[u8]) -> Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or(Error::InvalidArgument("put on closed stream".into()))?;
        file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn get(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::InvalidArgument("get on a PUT stream".into()))
    }

    fn close(mut self: Box<Self>, abort: bool) -> Result<()> {
        let file = match self.file.take() {
            Some(f) => f,
            None => return Ok(()),
        };
        if abort {
            drop(file);
            let _ = fs::remove_file(&self.tmp);
            return Ok(());
        }
        if let Some(announced) = self.announced {
            if announced != self.written {
                let _ = fs::remove_file(&self.tmp);
                return Err(Error::ContentLengthMismatch {
                    announced,
                    written: self.written,
                });
            }
        }
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp, &self.dest)?;
        Ok(())
    }
}

struct PosixGetStream {
    file: File,
    remaining: u64,
}

impl DalStream for PosixGetStream {
    fn put(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::InvalidArgument("put on a GET stream".into()))
    }

    fn get(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let mut filled = 0;
        // Short reads are retried until the sub-range is satisfied.
        while filled < want {
            match self.file.read(&mut buf[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.remaining -= filled as u64;
        Ok(filled)
    }

    fn close(self: Box<Self>, _abort: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn spec_put(len: Option<u64>) -> OpenSpec {
        OpenSpec::put(len, Duration::from_secs(5))
    }

    #[test]
    fn put_then_ranged_get() {
        let tmp = tempfile::tempdir().unwrap();
        let dal = PosixDal::new(tmp.path());
        let mut s = dal.open("bucket/obj.0", spec_put(Some(10))).unwrap();
        s.put(b"0123456789").unwrap();
        s.close(false).unwrap();

        assert_eq!(dal.stat("bucket/obj.0").unwrap(), 10);

        let mut s = dal
            .open(
                "bucket/obj.0",
                OpenSpec::get(3, Some(4), Duration::from_secs(5)),
            )
            .unwrap();
        let mut buf = [0u8; 16];
        let n = s.get(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"3456");
        assert_eq!(s.get(&mut buf).unwrap(), 0);
        s.close(false).unwrap();
    }

    #[test]
    fn aborted_put_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let dal = PosixDal::new(tmp.path());
        let mut s = dal.open("b/partial", spec_put(None)).unwrap();
        s.put(b"doomed").unwrap();
        s.close(true).unwrap();
        assert!(matches!(dal.stat("b/partial"), Err(Error::NotFound(_))));
        dal.verify(false).unwrap();
    }

    #[test]
    fn content_length_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let dal = PosixDal::new(tmp.path());
        let mut s = dal.open("b/short", spec_put(Some(100))).unwrap();
        s.put(b"only-a-little").unwrap();
        assert!(matches!(
            s.close(false),
            Err(Error::ContentLengthMismatch { .. })
        ));
        assert!(matches!(dal.stat("b/short"), Err(Error::NotFound(_))));
    }
}
