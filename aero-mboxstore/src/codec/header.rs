//! Index header codec (§3.1, §4.2, §6.2).
//!
//! The writer always emits [`CURRENT_MINOR_VERSION`]'s layout (§4.2: "the
//! writer always writes the current minor_version's layout"). Older
//! versions are decode-only, encountered when opening a mailbox that has
//! not yet been repacked; fields absent from the stored layout are
//! synthesized on read per the rules given inline below.

use crate::crc::crc32;
use crate::error::{Error, Result};
use crate::flags::HeaderOptions;

use super::{Cursor, Reader};

/// Size in bytes of the v6-v9 header layout (no `exists`, `deletedmodseq`,
/// `sync_crc_vers`, `recentuid`, `recenttime`, `pop3_show_after`,
/// `quota_annot_used`).
pub const HEADER_SIZE_V9: u32 = 108;
/// Size in bytes of the v10-v12 header layout (still missing `exists` and
/// `deletedmodseq`, synthesized per §4.2).
pub const HEADER_SIZE_V12: u32 = 140;
/// Size in bytes of the current (v13) header layout.
pub const HEADER_SIZE_V13: u32 = 156;

#[derive(Clone, Debug, PartialEq)]
pub struct IndexHeader {
    pub generation_no: u32,
    pub format: u32,
    pub minor_version: u16,
    pub start_offset: u16,
    pub record_size: u16,
    pub num_records: u32,
    pub last_appenddate: u64,
    pub last_uid: u32,
    pub quota_mailbox_used: u64,
    pub uidvalidity: u32,
    pub answered: u32,
    pub flagged: u32,
    pub deleted: u32,
    pub exists: u32,
    pub options: HeaderOptions,
    pub leaked_cache_records: u32,
    pub highestmodseq: u64,
    pub deletedmodseq: u64,
    pub first_expunged: u64,
    pub last_repack_time: u64,
    pub header_file_crc: u32,
    pub sync_crc: u32,
    pub sync_crc_vers: u16,
    pub recentuid: u32,
    pub recenttime: u64,
    pub pop3_show_after: u64,
    pub quota_annot_used: u64,
}

impl IndexHeader {
    /// A fresh header for a newly created, empty mailbox (§3.3 "Created").
    pub fn new_empty(uidvalidity: u32) -> Self {
        IndexHeader {
            generation_no: 1,
            format: 0,
            minor_version: super::CURRENT_MINOR_VERSION,
            start_offset: HEADER_SIZE_V13 as u16,
            record_size: super::record::RECORD_SIZE_V13 as u16,
            num_records: 0,
            last_appenddate: 0,
            last_uid: 0,
            quota_mailbox_used: 0,
            uidvalidity,
            answered: 0,
            flagged: 0,
            deleted: 0,
            exists: 0,
            options: HeaderOptions::empty(),
            leaked_cache_records: 0,
            highestmodseq: 1,
            deletedmodseq: 0,
            first_expunged: 0,
            last_repack_time: 0,
            header_file_crc: 0,
            sync_crc: 0,
            sync_crc_vers: 1,
            recentuid: 0,
            recenttime: 0,
            pop3_show_after: 0,
            quota_annot_used: 0,
        }
    }

    /// Encode using the current minor_version's layout, regardless of
    /// `self.minor_version` (§4.2: encoding is always current-version).
    pub fn encode(&self) -> Vec<u8> {
        let mut c = Cursor::new();
        c.put_u32(self.generation_no);
        c.put_u32(self.format);
        c.put_u16(super::CURRENT_MINOR_VERSION);
        c.put_u16(HEADER_SIZE_V13 as u16);
        c.put_u16(super::record::RECORD_SIZE_V13 as u16);
        c.align(4);
        c.put_u32(self.num_records);
        c.put_u64(self.last_appenddate);
        c.put_u32(self.last_uid);
        c.put_u64(self.quota_mailbox_used);
        c.put_u32(self.uidvalidity);
        c.put_u32(self.answered);
        c.put_u32(self.flagged);
        c.put_u32(self.deleted);
        c.put_u32(self.exists);
        c.put_u32(self.options.bits());
        c.put_u32(self.leaked_cache_records);
        c.put_u64(self.highestmodseq);
        c.put_u64(self.deletedmodseq);
        c.put_u64(self.first_expunged);
        c.put_u64(self.last_repack_time);
        c.put_u32(self.header_file_crc);
        c.put_u32(self.sync_crc);
        c.put_u16(self.sync_crc_vers);
        c.align(4);
        c.put_u32(self.recentuid);
        c.align(8);
        c.put_u64(self.recenttime);
        c.put_u64(self.pop3_show_after);
        c.put_u64(self.quota_annot_used);

        assert_eq!(c.buf.len() as u32, HEADER_SIZE_V13 - 4, "header codec drifted from HEADER_SIZE_V13");
        let crc = crc32(&c.buf);
        c.put_u32(crc);
        c.buf
    }

    /// Decode, validating `header_crc` (§8 invariant 4) and dispatching to
    /// the per-version layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 14 {
            return Err(Error::BadFormat);
        }
        let mut probe = Reader::new(buf);
        let _generation_no = probe.get_u32()?;
        let _format = probe.get_u32()?;
        let minor_version = probe.get_u16()?;

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
        Self::verify_crc(buf, HEADER_SIZE_V13 as usize - 4)?;
        let mut r = Reader::new(buf);
        let generation_no = r.get_u32()?;
        let format = r.get_u32()?;
        let minor_version = r.get_u16()?;
        let start_offset = r.get_u16()?;
        let record_size = r.get_u16()?;
        r.align(4);
        let num_records = r.get_u32()?;
        let last_appenddate = r.get_u64()?;
        let last_uid = r.get_u32()?;
        let quota_mailbox_used = r.get_u64()?;
        let uidvalidity = r.get_u32()?;
        let answered = r.get_u32()?;
        let flagged = r.get_u32()?;
        let deleted = r.get_u32()?;
        let exists = r.get_u32()?;
        let options = HeaderOptions::from_bits_truncate(r.get_u32()?);
        let leaked_cache_records = r.get_u32()?;
        let highestmodseq = r.get_u64()?;
        let deletedmodseq = r.get_u64()?;
        let first_expunged = r.get_u64()?;
        let last_repack_time = r.get_u64()?;
        let header_file_crc = r.get_u32()?;
        let sync_crc = r.get_u32()?;
        let sync_crc_vers = r.get_u16()?;
        r.align(4);
        let recentuid = r.get_u32()?;
        r.align(8);
        let recenttime = r.get_u64()?;
        let pop3_show_after = r.get_u64()?;
        let quota_annot_used = r.get_u64()?;

        Ok(IndexHeader {
            generation_no,
            format,
            minor_version,
            start_offset,
            record_size,
            num_records,
            last_appenddate,
            last_uid,
            quota_mailbox_used,
            uidvalidity,
            answered,
            flagged,
            deleted,
            exists,
            options,
            leaked_cache_records,
            highestmodseq,
            deletedmodseq,
            first_expunged,
            last_repack_time,
            header_file_crc,
            sync_crc,
            sync_crc_vers,
            recentuid,
            recenttime,
            pop3_show_after,
            quota_annot_used,
        })
    }

    /// v10-v12: same prefix as v13 minus `exists`/`deletedmodseq`, which
    /// are synthesized (§4.2: "exists := num_records, deletedmodseq :=
    /// highestmodseq").
    fn decode_v12(buf: &[u8]) -> Result<Self> {
        Self::verify_crc(buf, HEADER_SIZE_V12 as usize - 4)?;
        let mut r = Reader::new(buf);
        let generation_no = r.get_u32()?;
        let format = r.get_u32()?;
        let minor_version = r.get_u16()?;
        let start_offset = r.get_u16()?;
        let record_size = r.get_u16()?;
        r.align(4);
        let num_records = r.get_u32()?;
        let last_appenddate = r.get_u64()?;
        let last_uid = r.get_u32()?;
        let quota_mailbox_used = r.get_u64()?;
        let uidvalidity = r.get_u32()?;
        let answered = r.get_u32()?;
        let flagged = r.get_u32()?;
        let deleted = r.get_u32()?;
        let options = HeaderOptions::from_bits_truncate(r.get_u32()?);
        let leaked_cache_records = r.get_u32()?;
        let highestmodseq = r.get_u64()?;
        let first_expunged = r.get_u64()?;
        let last_repack_time = r.get_u64()?;
        let header_file_crc = r.get_u32()?;
        let sync_crc = r.get_u32()?;
        let sync_crc_vers = r.get_u16()?;
        r.align(4);
        let recentuid = r.get_u32()?;
        r.align(8);
        let recenttime = r.get_u64()?;
        let pop3_show_after = r.get_u64()?;
        let quota_annot_used = r.get_u64()?;

        Ok(IndexHeader {
            generation_no,
            format,
            minor_version,
            start_offset,
            record_size,
            num_records,
            last_appenddate,
            last_uid,
            quota_mailbox_used,
            uidvalidity,
            answered,
            flagged,
            deleted,
            exists: num_records,
            options,
            leaked_cache_records,
            highestmodseq,
            deletedmodseq: highestmodseq,
            first_expunged,
            last_repack_time,
            header_file_crc,
            sync_crc,
            sync_crc_vers,
            recentuid,
            recenttime,
            pop3_show_after,
            quota_annot_used,
        })
    }

    /// v6-v9: narrower layout, additionally lacking `sync_crc_vers`,
    /// `recentuid`, `recenttime`, `pop3_show_after`, `quota_annot_used`,
    /// all synthesized as zero / version 1.
    fn decode_v9(buf: &[u8]) -> Result<Self> {
        Self::verify_crc(buf, HEADER_SIZE_V9 as usize - 4)?;
        let mut r = Reader::new(buf);
        let generation_no = r.get_u32()?;
        let format = r.get_u32()?;
        let minor_version = r.get_u16()?;
        let start_offset = r.get_u16()?;
        let record_size = r.get_u16()?;
        r.align(4);
        let num_records = r.get_u32()?;
        let last_appenddate = r.get_u64()?;
        let last_uid = r.get_u32()?;
        let quota_mailbox_used = r.get_u64()?;
        let uidvalidity = r.get_u32()?;
        let answered = r.get_u32()?;
        let flagged = r.get_u32()?;
        let deleted = r.get_u32()?;
        let options = HeaderOptions::from_bits_truncate(r.get_u32()?);
        let leaked_cache_records = r.get_u32()?;
        let highestmodseq = r.get_u64()?;
        let first_expunged = r.get_u64()?;
        let last_repack_time = r.get_u64()?;
        let header_file_crc = r.get_u32()?;
        let sync_crc = r.get_u32()?;

        Ok(IndexHeader {
            generation_no,
            format,
            minor_version,
            start_offset,
            record_size,
            num_records,
            last_appenddate,
            last_uid,
            quota_mailbox_used,
            uidvalidity,
            answered,
            flagged,
            deleted,
            exists: num_records,
            options,
            leaked_cache_records,
            highestmodseq,
            deletedmodseq: highestmodseq,
            first_expunged,
            last_repack_time,
            header_file_crc,
            sync_crc,
            sync_crc_vers: 1,
            recentuid: 0,
            recenttime: 0,
            pop3_show_after: 0,
            quota_annot_used: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_current_version() {
        let mut h = IndexHeader::new_empty(42);
        h.num_records = 3;
        h.last_uid = 3;
        h.highestmodseq = 7;
        h.header_file_crc = 0xdead_beef;

        let encoded = h.encode();
        assert_eq!(encoded.len(), HEADER_SIZE_V13 as usize);

        let decoded = IndexHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.num_records, 3);
        assert_eq!(decoded.last_uid, 3);
        assert_eq!(decoded.highestmodseq, 7);
        assert_eq!(decoded.header_file_crc, 0xdead_beef);
        assert_eq!(decoded.minor_version, super::super::CURRENT_MINOR_VERSION);
    }

    #[test]
    fn corrupt_crc_is_detected() {
        let h = IndexHeader::new_empty(1);
        let mut encoded = h.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(IndexHeader::decode(&encoded), Err(Error::Checksum)));
    }
}
