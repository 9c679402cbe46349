//! Index record codec (§3.1, §4.2, §6.2). Same versioning discipline as
//! the header: decode understands v6-v13, encode always emits v13.

use crate::crc::crc32;
use crate::error::{Error, Result};
use crate::flags::{SystemFlags, UserFlags};
use crate::ident::MessageGuid;

use super::{Cursor, Reader};

pub const RECORD_SIZE_V9: u32 = 108;
pub const RECORD_SIZE_V12: u32 = 120;
pub const RECORD_SIZE_V13: u32 = 128;

#[derive(Clone, Debug, PartialEq)]
pub struct IndexRecord {
    pub uid: u32,
    pub internaldate: u64,
    pub sentdate: u64,
    pub size: u32,
    pub header_size: u32,
    pub gmtime: u64,
    pub cache_offset: u64,
    pub last_updated: u64,
    pub system_flags: SystemFlags,
    pub user_flags: UserFlags,
    pub content_lines: u32,
    pub cache_version: u32,
    pub message_guid: MessageGuid,
    pub modseq: u64,
    pub cid: u64,
    pub cache_crc: u32,
}

impl IndexRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut c = Cursor::new();
        c.put_u32(self.uid);
        c.put_u64(self.internaldate);
        c.put_u64(self.sentdate);
        c.put_u32(self.size);
        c.put_u32(self.header_size);
        c.put_u64(self.gmtime);
        c.put_u64(self.cache_offset);
        c.put_u64(self.last_updated);
        c.put_u32(self.system_flags.bits());
        c.put_bytes(&self.user_flags.to_be_bytes());
        c.put_u32(self.content_lines);
        c.put_u32(self.cache_version);
        c.put_bytes(&self.message_guid.0);
        c.put_u64(self.modseq);
        c.put_u64(self.cid);
        c.put_u32(self.cache_crc);

        assert_eq!(c.buf.len() as u32, RECORD_SIZE_V13 - 4, "record codec drifted from RECORD_SIZE_V13");
        let crc = crc32(&c.buf);
        c.put_u32(crc);
        c.buf
    }

    /// Decode a record of `record_size` bytes written under `minor_version`.
    pub fn decode(buf: &[u8], minor_version: u16) -> Result<Self> {
        match minor_version {
            6..=9 => Self::decode_v9(buf),
            10..=12 => Self::decode_v12(buf),
            13 => Self::decode_v13(buf),
            _ => Err(Error::BadFormat),
        }
    }

    fn verify_crc(buf: &[u8], crc_offset: usize) -> Result<()> {
        if buf.len() < crc_offset + 4 {
            return Err(Error::BadFormat);
        }
        let expected = u32::from_be_bytes(buf[crc_offset..crc_offset + 4].try_into().unwrap());
        if crc32(&buf[..crc_offset]) != expected {
            return Err(Error::Checksum);
        }
        Ok(())
    }

    fn decode_v13(buf: &[u8]) -> Result<Self> {
        Self::verify_crc(buf, RECORD_SIZE_V13 as usize - 4)?;
        let mut r = Reader::new(buf);
        let uid = r.get_u32()?;
        let internaldate = r.get_u64()?;
        let sentdate = r.get_u64()?;
        let size = r.get_u32()?;
        let header_size = r.get_u32()?;
        let gmtime = r.get_u64()?;
        let cache_offset = r.get_u64()?;
        let last_updated = r.get_u64()?;
        let system_flags = SystemFlags::from_bits_truncate(r.get_u32()?);
        let user_flags = UserFlags::from_be_bytes(r.get_bytes(16)?.try_into().unwrap());
        let content_lines = r.get_u32()?;
        let cache_version = r.get_u32()?;
        let message_guid = MessageGuid(r.get_bytes(20)?.try_into().unwrap());
        let modseq = r.get_u64()?;
        let cid = r.get_u64()?;
        let cache_crc = r.get_u32()?;

        Ok(IndexRecord {
            uid,
            internaldate,
            sentdate,
            size,
            header_size,
            gmtime,
            cache_offset,
            last_updated,
            system_flags,
            user_flags,
            content_lines,
            cache_version,
            message_guid,
            modseq,
            cid,
            cache_crc,
        })
    }

    fn decode_v12(buf: &[u8]) -> Result<Self> {
        Self::verify_crc(buf, RECORD_SIZE_V12 as usize - 4)?;
        let mut r = Reader::new(buf);
        let uid = r.get_u32()?;
        let internaldate = r.get_u64()?;
        let sentdate = r.get_u64()?;
        let size = r.get_u32()?;
        let header_size = r.get_u32()?;
        let gmtime = r.get_u64()?;
        let cache_offset = r.get_u64()?;
        let last_updated = r.get_u64()?;
        let system_flags = SystemFlags::from_bits_truncate(r.get_u32()?);
        let user_flags = UserFlags::from_be_bytes(r.get_bytes(16)?.try_into().unwrap());
        let content_lines = r.get_u32()?;
        let cache_version = r.get_u32()?;
        let message_guid = MessageGuid(r.get_bytes(20)?.try_into().unwrap());
        let modseq = r.get_u64()?;
        let cache_crc = r.get_u32()?;

        Ok(IndexRecord {
            uid,
            internaldate,
            sentdate,
            size,
            header_size,
            gmtime,
            cache_offset,
            last_updated,
            system_flags,
            user_flags,
            content_lines,
            cache_version,
            message_guid,
            modseq,
            cid: 0,
            cache_crc,
        })
    }

    fn decode_v9(buf: &[u8]) -> Result<Self> {
        Self::verify_crc(buf, RECORD_SIZE_V9 as usize - 4)?;
        let mut r = Reader::new(buf);
        let uid = r.get_u32()?;
        let internaldate = r.get_u64()?;
        let sentdate = r.get_u64()?;
        let size = r.get_u32()?;
        let header_size = r.get_u32()?;
        let gmtime = r.get_u64()?;
        let cache_offset = r.get_u64()?;
        let last_updated = r.get_u64()?;
        let system_flags = SystemFlags::from_bits_truncate(r.get_u32()?);
        let user_flags = UserFlags::from_be_bytes(r.get_bytes(16)?.try_into().unwrap());
        let content_lines = r.get_u32()?;
        let message_guid = MessageGuid(r.get_bytes(20)?.try_into().unwrap());
        let cache_crc = r.get_u32()?;

        Ok(IndexRecord {
            uid,
            internaldate,
            sentdate,
            size,
            header_size,
            gmtime,
            cache_offset,
            last_updated,
            system_flags,
            user_flags,
            content_lines,
            cache_version: 0,
            message_guid,
            modseq: 0,
            cid: 0,
            cache_crc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IndexRecord {
        IndexRecord {
            uid: 1,
            internaldate: 1_000,
            sentdate: 900,
            size: 128,
            header_size: 32,
            gmtime: 1_000,
            cache_offset: 4,
            last_updated: 1_000,
            system_flags: SystemFlags::SEEN,
            user_flags: UserFlags::default(),
            content_lines: 10,
            cache_version: 1,
            message_guid: MessageGuid::compute(b"hello"),
            modseq: 1,
            cid: 0,
            cache_crc: 0,
        }
    }

    #[test]
    fn roundtrip() {
        let rec = sample();
        let encoded = rec.encode();
        assert_eq!(encoded.len(), RECORD_SIZE_V13 as usize);
        let decoded = IndexRecord::decode(&encoded, 13).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn corrupt_crc_is_detected() {
        let rec = sample();
        let mut encoded = rec.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(
            IndexRecord::decode(&encoded, 13),
            Err(Error::Checksum)
        ));
    }
}
