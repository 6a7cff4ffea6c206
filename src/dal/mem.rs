//! In-memory DAL used by the test suite: journals every backend call,
//! supports fault injection, and can serve deliberately short GET
//! responses to exercise the engine's retry paths.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

use super::{Dal, DalMode, DalStream, OpenSpec};

#[derive(Default)]
struct MemInner {
    objects: BTreeMap<String, Vec<u8>>,
    journal: Vec<String>,
    /// Fail the nth upcoming delete (test hook).
    fail_deletes: usize,
    /// Serve GETs in slices of at most this many bytes.
    short_read_limit: Option<usize>,
}

#[derive(Clone, Default)]
pub struct MemDal {
    inner: Arc<Mutex<MemInner>>,
}

impl MemDal {
    pub fn new() -> MemDal {
        MemDal::default()
    }

    pub fn with_short_reads(limit: usize) -> MemDal {
        let dal = MemDal::new();
        dal.inner.lock().unwrap().short_read_limit = Some(limit);
        dal
    }

    /// Make the next `n` deletes fail with a transient transport error.
    pub fn fail_next_deletes(&self, n: usize) {
        self.inner.lock().unwrap().fail_deletes = n;
    }

    pub fn journal(&self) -> Vec<String> {
        self.inner.lock().unwrap().journal.clone()
    }

    pub fn object(&self, objid: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().objects.get(objid).cloned()
    }

    pub fn object_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    pub fn delete_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .journal
            .iter()
            .filter(|line| line.starts_with("delete "))
            .count()
    }
}

impl Dal for MemDal {
    fn open(&self, objid: &str, spec: OpenSpec) -> Result<Box<dyn DalStream>> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .journal
            .push(format!("open {:?} {}", spec.mode, objid));
        match spec.mode {
            DalMode::Put => Ok(Box::new(MemPutStream {
                dal: self.inner.clone(),
                objid: objid.to_string(),
                staged: Vec::new(),
                announced: spec.length,
            })),
            DalMode::Get => {
                let data = inner
                    .objects
                    .get(objid)
                    .ok_or_else(|| Error::NotFound(objid.into()))?;
                let size = data.len() as u64;
                if spec.offset > size {
                    return Err(Error::InvalidArgument(format!(
                        "range start {} beyond object size {}",
                        spec.offset, size
                    )));
                }
                let end = spec
                    .length
                    .map(|len| (spec.offset + len).min(size))
                    .unwrap_or(size);
                Ok(Box::new(MemGetStream {
                    data: data[spec.offset as usize..end as usize].to_vec(),
                    pos: 0,
                    short_read_limit: inner.short_read_limit,
                }))
            }
        }
    }

    fn delete(&self, objid: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_deletes > 0 {
            inner.fail_deletes -= 1;
            inner.journal.push(format!("delete-failed {}", objid));
            return Err(Error::Transport {
                fatal: false,
                detail: format!("injected delete failure for {}", objid),
            });
        }
        inner.journal.push(format!("delete {}", objid));
        inner
            .objects
            .remove(objid)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(objid.into()))
    }

    fn stat(&self, objid: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(objid)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Error::NotFound(objid.into()))
    }

    fn verify(&self, _fix: bool) -> Result<()> {
        Ok(())
    }
}

struct MemPutStream {
    dal: Arc<Mutex<MemInner>>,
    objid: String,
    staged: Vec<u8>,
    announced: Option<u64>,
}

impl DalStream for MemPutStream {
    fn put(&mut self, buf: &[u8]) -> Result<usize> {
        self.staged.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn get(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::InvalidArgument("get on a PUT stream".into()))
    }

    fn close(self: Box<Self>, abort: bool) -> Result<()> {
        let mut inner = self.dal.lock().unwrap();
        if abort {
            inner.journal.push(format!("abort {}", self.objid));
            return Ok(());
        }
        if let Some(announced) = self.announced {
            if announced != self.staged.len() as u64 {
                return Err(Error::ContentLengthMismatch {
                    announced,
                    written: self.staged.len() as u64,
                });
            }
        }
        inner.journal.push(format!("commit {}", self.objid));
        inner.objects.insert(self.objid, self.staged);
        Ok(())
    }
}

struct MemGetStream {
    data: Vec<u8>,
    pos: usize,
    short_read_limit: Option<usize>,
}

impl DalStream for MemGetStream {
    fn put(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::InvalidArgument("put on a GET stream".into()))
    }

    fn get(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.data.len() - self.pos;
        let mut n = buf.len().min(remaining);
        if let Some(limit) = self.short_read_limit {
            n = n.min(limit);
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn close(self: Box<Self>, _abort: bool) -> Result<()> {
        Ok(())
    }
}
