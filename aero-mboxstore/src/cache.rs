//! Cache Manager (§4.3): append-only per-role cache files holding derived,
//! re-computable message metadata (envelope, body structure, per-header
//! cache). Readers mmap the file; writers append new records and never
//! rewrite bytes already committed, so no lock is required to read while
//! another process appends (§4.1, §5).
//!
//! Record format: an item count, then that many length-prefixed,
//! 4-byte-aligned items, then a trailing CRC-32 over everything before it
//! — the same append-only, checksum-terminated shape as the index codec,
//! adapted from a TLV item list rather than fixed fields.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::crc::crc32;
use crate::error::{Error, Result};

/// One cache record's logical contents: a fixed sequence of named items
/// (§3.1 "cache record" — envelope, bodystructure, body, section, header
/// fields, from/to/cc/bcc, in-reply-to, subject).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheItems {
    pub items: Vec<Vec<u8>>,
}

impl CacheItems {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.items.len() as u32).to_be_bytes());
        for item in &self.items {
            buf.extend_from_slice(&(item.len() as u32).to_be_bytes());
            buf.extend_from_slice(item);
            let pad = (4 - buf.len() % 4) % 4;
            buf.resize(buf.len() + pad, 0);
        }
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::BadFormat);
        }
        let crc_offset = buf.len() - 4;
        let expected = u32::from_be_bytes(buf[crc_offset..].try_into().unwrap());
        if crc32(&buf[..crc_offset]) != expected {
            return Err(Error::Checksum);
        }

        let mut pos = 0usize;
        let count = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        pos += 4;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            if pos + 4 > crc_offset {
                return Err(Error::BadFormat);
            }
            let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > crc_offset {
                return Err(Error::BadFormat);
            }
            items.push(buf[pos..pos + len].to_vec());
            pos += len;
            let pad = (4 - pos % 4) % 4;
            pos += pad;
        }
        Ok(CacheItems { items })
    }
}

/// A single role's cache file (`cyrus.cache` or `cyrus.archivecache`).
/// `append` opens for writing and seeks to the end; reads go through a
/// read-only mmap that is re-created whenever the file has grown past
/// what's currently mapped.
pub struct CacheFile {
    write_handle: File,
    path: std::path::PathBuf,
    map: Option<Mmap>,
    mapped_len: u64,
    generation_no: u32,
}

/// Byte offset of the first cache record, past the 4-byte generation
/// prefix every cache file starts with (§3.1 "cache record", §6.1).
pub const GENERATION_PREFIX_LEN: u64 = 4;

impl CacheFile {
    /// Open (creating if absent) the cache file for generation
    /// `generation_no`. A brand new file gets the 4-byte generation
    /// prefix written and fsynced before first use (§4.3 "On creation").
    pub fn open(path: &Path, generation_no: u32) -> Result<Self> {
        let existed = path.exists();
        let mut write_handle = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        if !existed || write_handle.metadata()?.len() == 0 {
            write_handle.write_all(&generation_no.to_be_bytes())?;
            write_handle.sync_all()?;
        }
        Ok(CacheFile {
            write_handle,
            path: path.to_path_buf(),
            map: None,
            mapped_len: 0,
            generation_no,
        })
    }

    pub fn generation_no(&self) -> u32 {
        self.generation_no
    }

    /// Append a record, returning its byte offset for storage in the
    /// owning [`crate::codec::IndexRecord::cache_offset`].
    pub fn append(&mut self, items: &CacheItems) -> Result<(u64, u32)> {
        let offset = self.write_handle.seek(SeekFrom::End(0))?;
        let encoded = items.encode();
        self.write_handle.write_all(&encoded)?;
        self.write_handle.flush()?;
        self.map = None;
        Ok((offset, crc32(&encoded[..encoded.len() - 4])))
    }

    fn ensure_mapped(&mut self) -> Result<()> {
        let len = self.write_handle.metadata()?.len();
        if self.map.is_none() || len != self.mapped_len {
            if len == 0 {
                self.map = None;
                self.mapped_len = 0;
                return Ok(());
            }
            let ro = File::open(&self.path)?;
            self.map = Some(unsafe { Mmap::map(&ro)? });
            self.mapped_len = len;
        }
        Ok(())
    }

    /// Read and validate the record at `offset`. The caller supplies the
    /// total record length read from the owning index record's header
    /// metadata is not tracked here: instead the length prefix embedded
    /// in the TLV payload plus trailing CRC lets us self-delimit, so we
    /// scan forward from `offset` to find the CRC boundary.
    pub fn read_at(&mut self, offset: u64) -> Result<CacheItems> {
        self.ensure_mapped()?;
        let map = self.map.as_ref().ok_or(Error::BadFormat)?;
        let start = offset as usize;
        if start + 4 > map.len() {
            return Err(Error::BadFormat);
        }
        let count = u32::from_be_bytes(map[start..start + 4].try_into().unwrap()) as usize;
        let mut pos = start + 4;
        for _ in 0..count {
            if pos + 4 > map.len() {
                return Err(Error::BadFormat);
            }
            let len = u32::from_be_bytes(map[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4 + len;
            let pad = (4 - pos % 4) % 4;
            pos += pad;
        }
        let end = pos + 4;
        if end > map.len() {
            return Err(Error::BadFormat);
        }
        CacheItems::decode(&map[start..end])
    }

    /// Truncate the file to `len` bytes, used by repack when rebuilding
    /// under a fresh generation number discards a partially-written
    /// `.NEW` cache (§4.5).
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.write_handle.set_len(len)?;
        self.map = None;
        Ok(())
    }

    pub fn len(&mut self) -> Result<u64> {
        Ok(self.write_handle.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyrus.cache");
        let mut cache = CacheFile::open(&path, 1).unwrap();

        let rec1 = CacheItems {
            items: vec![b"envelope-one".to_vec(), b"bodystructure-one".to_vec()],
        };
        let rec2 = CacheItems {
            items: vec![b"envelope-two".to_vec()],
        };

        let (off1, _) = cache.append(&rec1).unwrap();
        let (off2, _) = cache.append(&rec2).unwrap();
        assert!(off2 > off1);

        assert_eq!(cache.read_at(off1).unwrap(), rec1);
        assert_eq!(cache.read_at(off2).unwrap(), rec2);
    }

    #[test]
    fn corrupted_record_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyrus.cache");
        let mut cache = CacheFile::open(&path, 1).unwrap();
        let rec = CacheItems {
            items: vec![b"x".to_vec()],
        };
        let (off, _) = cache.append(&rec).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let mut reopened = CacheFile::open(&path, 1).unwrap();
        assert!(matches!(reopened.read_at(off), Err(Error::Checksum)));
    }
}
