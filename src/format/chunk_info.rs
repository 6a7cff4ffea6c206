use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

use super::{check_version, CONFIG_VERS_MAJ, CONFIG_VERS_MIN};

/// Per-chunk record in a Multi MD file.
///
/// Written raw in network byte order at fixed offsets so a reader can seek
/// straight to chunk *k* (`k * MULTI_CHUNK_INFO_SIZE`). N:1 writers install
/// their records sparsely; a hole reads back as an all-zero record, which
/// [`MultiChunkInfo::is_blank`] detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MultiChunkInfo {
    pub config_vers_maj: u16,
    pub config_vers_min: u16,
    pub chunk_no: u64,
    /// Offset of this chunk's data within the user's file.
    pub logical_offset: u64,
    /// User bytes in the chunk, recovery footer excluded.
    pub chunk_data_bytes: u64,
    pub correct_info: u64,
    pub encrypt_info: u64,
}

pub const MULTI_CHUNK_INFO_SIZE: usize = 2 + 2 + 8 * 5;

impl MultiChunkInfo {
    pub fn new(chunk_no: u64, logical_offset: u64, chunk_data_bytes: u64) -> MultiChunkInfo {
        MultiChunkInfo {
            config_vers_maj: CONFIG_VERS_MAJ,
            config_vers_min: CONFIG_VERS_MIN,
            chunk_no,
            logical_offset,
            chunk_data_bytes,
            correct_info: 0,
            encrypt_info: 0,
        }
    }

    /// Byte offset of record `chunk_no` within the MD file body.
    pub fn offset_of(chunk_no: u64) -> u64 {
        chunk_no * MULTI_CHUNK_INFO_SIZE as u64
    }

    /// An unwritten slot of a sparse N:1 record array.
    pub fn is_blank(&self) -> bool {
        *self == MultiChunkInfo::default()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.config_vers_maj)?;
        writer.write_u16::<BigEndian>(self.config_vers_min)?;
        writer.write_u64::<BigEndian>(self.chunk_no)?;
        writer.write_u64::<BigEndian>(self.logical_offset)?;
        writer.write_u64::<BigEndian>(self.chunk_data_bytes)?;
        writer.write_u64::<BigEndian>(self.correct_info)?;
        writer.write_u64::<BigEndian>(self.encrypt_info)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(MULTI_CHUNK_INFO_SIZE);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<MultiChunkInfo> {
        let info = MultiChunkInfo {
            config_vers_maj: reader.read_u16::<BigEndian>()?,
            config_vers_min: reader.read_u16::<BigEndian>()?,
            chunk_no: reader.read_u64::<BigEndian>()?,
            logical_offset: reader.read_u64::<BigEndian>()?,
            chunk_data_bytes: reader.read_u64::<BigEndian>()?,
            correct_info: reader.read_u64::<BigEndian>()?,
            encrypt_info: reader.read_u64::<BigEndian>()?,
        };
        // Blank slots (N:1 holes) are legitimate; anything else must carry
        // a version we understand.
        if !info.is_blank() {
            check_version(info.config_vers_maj, info.config_vers_min)?;
        }
        Ok(info)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<MultiChunkInfo> {
        if buf.len() < MULTI_CHUNK_INFO_SIZE {
            return Err(Error::Truncated("chunk-info record"));
        }
        Self::read_from(&mut &buf[..MULTI_CHUNK_INFO_SIZE])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_size_is_fixed() {
        let info = MultiChunkInfo::new(4, 4 * 1024, 1024);
        assert_eq!(info.to_bytes().unwrap().len(), MULTI_CHUNK_INFO_SIZE);
        assert_eq!(MultiChunkInfo::offset_of(3), 3 * 44);
    }

    #[test]
    fn round_trip() {
        let mut info = MultiChunkInfo::new(2, 2048, 1000);
        info.correct_info = 0x1234_5678;
        let buf = info.to_bytes().unwrap();
        assert_eq!(MultiChunkInfo::from_bytes(&buf).unwrap(), info);
    }

    #[test]
    fn blank_slot_parses_without_version_error() {
        let zeros = [0u8; MULTI_CHUNK_INFO_SIZE];
        let info = MultiChunkInfo::from_bytes(&zeros).unwrap();
        assert!(info.is_blank());
        assert_eq!(info.chunk_data_bytes, 0);
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert!(matches!(
            MultiChunkInfo::from_bytes(&[0u8; 10]),
            Err(Error::Truncated(_))
        ));
    }
}
