//! Sync-CRC engine (§4.9): a cheap, incrementally maintained content
//! fingerprint for a mailbox, used by replication peers to detect
//! divergence without transferring the whole mailbox. Two algorithm
//! versions coexist; which one a mailbox uses is `sync_crc_vers` in its
//! index header (§3.1).
//!
//! Both versions are order-independent: XOR-ing a per-message
//! contribution together means append/expunge/rewrite update the running
//! total in O(1) (§4.9 "maintains the current CRC incrementally") without
//! re-scanning the mailbox, at the cost of being only a weak
//! collision-resistance guarantee (good enough for "did anything change",
//! not a content hash). `mailbox_sync_crc` recomputes from scratch, used
//! by repack and reconstruct, which already walk every record anyway.

use md5::{Digest as Md5Digest, Md5};

use crate::codec::IndexRecord;
use crate::crc::crc32;
use crate::flags::SystemFlags;

/// The tagged enumeration of supported algorithm versions (§9 "Dynamic
/// dispatch over sync-CRC algorithms").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    V1,
    V2,
}

impl Algorithm {
    pub fn from_vers(vers: u16) -> Self {
        if vers >= 2 {
            Algorithm::V2
        } else {
            Algorithm::V1
        }
    }

    pub fn vers(self) -> u16 {
        match self {
            Algorithm::V1 => 1,
            Algorithm::V2 => 2,
        }
    }
}

/// Pick the newest algorithm a replication peer accepts, within
/// `[min, max]` (§9 "a function selecting the best algorithm in a
/// [min,max] range").
pub fn select_algorithm(min: u16, max: u16) -> Algorithm {
    Algorithm::from_vers(max.min(2).max(min.min(2)))
}

/// v1 per-record summary: `"{uid} {modseq} {last_updated} ({flagcrc})
/// {internaldate} {guid_hex}"`, `flagcrc` itself an XOR of `crc32` over
/// each set flag's case-folded name (§4.9).
fn summary_v1(rec: &IndexRecord) -> String {
    let flagcrc = flag_crc(rec);
    format!(
        "{} {} {} ({}) {} {}",
        rec.uid, rec.modseq, rec.last_updated, flagcrc, rec.internaldate, rec.message_guid
    )
}

/// v2 per-record summary: flags sorted then space-joined (no flagcrc
/// folding), plus `cid` (§4.9 "additionally includes cid").
fn summary_v2(rec: &IndexRecord) -> String {
    let mut names: Vec<&'static str> = rec.system_flags.names();
    names.sort_unstable();
    format!(
        "{} {} {} {} {} {} {}",
        rec.uid,
        rec.modseq,
        rec.last_updated,
        names.join(" "),
        rec.internaldate,
        rec.message_guid,
        rec.cid
    )
}

fn flag_crc(rec: &IndexRecord) -> u32 {
    rec.system_flags
        .names()
        .iter()
        .fold(0u32, |acc, name| acc ^ crc32(name.to_ascii_lowercase().as_bytes()))
}

fn md5_first4(s: &str) -> u32 {
    let digest = Md5::digest(s.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// This record's contribution to the running sync-CRC under `algo`, or
/// `None` if `algo` has no contribution for it (§3.1 invariant: only
/// non-expunged records are summed; callers filter EXPUNGED before
/// calling this).
pub fn message_contribution(rec: &IndexRecord, algo: Algorithm) -> u32 {
    match algo {
        Algorithm::V1 => crc32(summary_v1(rec).as_bytes()),
        Algorithm::V2 => md5_first4(&summary_v2(rec)),
    }
}

/// Per-annotation fingerprint folded into the running total by v2 only
/// (§4.9 "also XORs in per-annotation fingerprints"; §9 "Annotation
/// contribution may be absent for some algorithms").
pub fn annotation_contribution(uid: u32, entry: &str, userid: &str, value: &[u8], algo: Algorithm) -> Option<u32> {
    match algo {
        Algorithm::V1 => None,
        Algorithm::V2 => {
            let summary = format!("{} {} {} {}", uid, entry, userid, String::from_utf8_lossy(value));
            Some(md5_first4(&summary))
        }
    }
}

/// Running total maintained alongside the index header's `sync_crc`
/// field. Incorporating a message is `total ^= contribution`; removing
/// it is the same XOR applied again, since XOR is self-inverse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncCrc(pub u32);

impl SyncCrc {
    pub fn toggle(&mut self, contribution: u32) {
        self.0 ^= contribution;
    }
}

/// `mailbox_sync_crc(vers, force)` (§4.9): recompute from scratch over
/// every non-expunged record. Used by repack (already rebuilding every
/// record) and reconstruct (already re-deriving every counter).
pub fn recompute<'a>(records: impl Iterator<Item = &'a IndexRecord>, algo: Algorithm) -> u32 {
    let mut total = SyncCrc::default();
    for rec in records {
        if rec.system_flags.contains(SystemFlags::EXPUNGED) {
            continue;
        }
        total.toggle(message_contribution(rec, algo));
    }
    total.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::UserFlags;
    use crate::ident::MessageGuid;

    fn sample_record(uid: u32) -> IndexRecord {
        IndexRecord {
            uid,
            internaldate: 1000,
            sentdate: 900,
            size: 0,
            header_size: 0,
            gmtime: 1000,
            cache_offset: 0,
            last_updated: 1000,
            system_flags: SystemFlags::SEEN,
            user_flags: UserFlags::default(),
            content_lines: 0,
            cache_version: 0,
            message_guid: MessageGuid::compute(format!("msg{uid}").as_bytes()),
            modseq: uid as u64,
            cid: 0,
            cache_crc: 0,
        }
    }

    #[test]
    fn append_then_expunge_returns_to_zero() {
        for algo in [Algorithm::V1, Algorithm::V2] {
            let mut crc = SyncCrc::default();
            let rec = sample_record(1);
            crc.toggle(message_contribution(&rec, algo));
            assert_ne!(crc.0, 0);
            crc.toggle(message_contribution(&rec, algo));
            assert_eq!(crc.0, 0);
        }
    }

    #[test]
    fn order_independent() {
        for algo in [Algorithm::V1, Algorithm::V2] {
            let a = sample_record(1);
            let b = sample_record(2);

            let mut forward = SyncCrc::default();
            forward.toggle(message_contribution(&a, algo));
            forward.toggle(message_contribution(&b, algo));

            let mut backward = SyncCrc::default();
            backward.toggle(message_contribution(&b, algo));
            backward.toggle(message_contribution(&a, algo));

            assert_eq!(forward, backward);
        }
    }

    #[test]
    fn v2_changes_with_cid() {
        let mut with_cid = sample_record(1);
        with_cid.cid = 42;
        let without_cid = sample_record(1);
        assert_ne!(
            message_contribution(&with_cid, Algorithm::V2),
            message_contribution(&without_cid, Algorithm::V2)
        );
    }

    #[test]
    fn annotation_contribution_only_on_v2() {
        assert!(annotation_contribution(1, "/comment", "alice", b"hi", Algorithm::V1).is_none());
        assert!(annotation_contribution(1, "/comment", "alice", b"hi", Algorithm::V2).is_some());
    }

    #[test]
    fn recompute_matches_incremental_toggling() {
        let records = vec![sample_record(1), sample_record(2)];
        let mut incremental = SyncCrc::default();
        for rec in &records {
            incremental.toggle(message_contribution(rec, Algorithm::V1));
        }
        assert_eq!(recompute(records.iter(), Algorithm::V1), incremental.0);
    }
}
