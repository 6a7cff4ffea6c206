use std::sync::Arc;
use std::time::Duration;

use crate::dal::{Dal, DalStream, OpenSpec};
use crate::error::{Error, Result};

/// One open data stream against one stored object, plus the counters the
/// engine needs to keep logical offsets straight. `written` counts every
/// byte pushed to the object (user data and recovery info alike); the
/// caller tracks how much of that was system-written.
pub struct ObjectStream {
    stream: Option<Box<dyn DalStream>>,
    pub objid: String,
    /// Chunk this stream addresses (GET side bookkeeping).
    pub chunk_no: u64,
    pub written: u64,
}

impl ObjectStream {
    pub fn open_put(
        dal: &Arc<dyn Dal>,
        objid: String,
        length: Option<u64>,
        timeout: Duration,
        continuation: bool,
    ) -> Result<ObjectStream> {
        let mut spec = OpenSpec::put(length, timeout);
        if continuation {
            spec = spec.continuation();
        }
        let stream = dal.open(&objid, spec)?;
        Ok(ObjectStream {
            stream: Some(stream),
            objid,
            chunk_no: 0,
            written: 0,
        })
    }

    pub fn open_get(
        dal: &Arc<dyn Dal>,
        objid: String,
        chunk_no: u64,
        offset: u64,
        length: u64,
        timeout: Duration,
        continuation: bool,
    ) -> Result<ObjectStream> {
        let mut spec = OpenSpec::get(offset, Some(length), timeout);
        if continuation {
            spec = spec.continuation();
        }
        let stream = dal.open(&objid, spec)?;
        Ok(ObjectStream {
            stream: Some(stream),
            objid,
            chunk_no,
            written: 0,
        })
    }

    pub fn put(&mut self, buf: &[u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(Error::InvalidArgument("stream already closed".into()))?;
        let n = stream.put(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    pub fn put_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.put(buf)?;
            if n == 0 {
                return Err(Error::Transport {
                    fatal: true,
                    detail: format!("backend accepted 0 bytes for {}", self.objid),
                });
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    pub fn get(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(Error::InvalidArgument("stream already closed".into()))?;
        stream.get(buf)
    }

    pub fn close(&mut self, abort: bool) -> Result<()> {
        match self.stream.take() {
            Some(stream) => stream.close(abort),
            None => Ok(()),
        }
    }
}

impl Drop for ObjectStream {
    fn drop(&mut self) {
        // Leaked streams abort; a commit must be explicit.
        if let Some(stream) = self.stream.take() {
            let _ = stream.close(true);
        }
    }
}
