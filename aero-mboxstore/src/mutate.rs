//! Append / rewrite / expunge / archive primitives (§4.4).
//!
//! These are the only functions that mutate a mailbox's visible state;
//! `repack` and `reconstruct` rebuild from scratch but call back into
//! `rewrite_record`-shaped logic for the per-record bookkeeping. Every
//! function here requires the handle's index lock to be EXCLUSIVE —
//! enforced with an assertion, not a `Result`, per the programming-invariant
//! policy recorded in DESIGN.md.

use chrono::{NaiveDateTime, Timelike};

use crate::cache::CacheItems;
use crate::codec::IndexRecord;
use crate::collab::Collaborators;
use crate::error::{Error, Result};
use crate::flags::{HeaderOptions, SystemFlags, UserFlags};
use crate::ident::MessageGuid;
use crate::layout::Role;
use crate::mailbox::MailboxHandle;
use crate::message;
use crate::synccrc::{self, Algorithm};

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Floor `unix_time` to midnight. Chrono is built without the `clock`
/// feature here (matching the rest of this workspace), so there is no
/// local timezone database to consult; this floors in UTC, a documented
/// simplification of the spec's "midnight in local time" rule.
fn midnight_of(unix_time: u64) -> u64 {
    let Some(dt) = NaiveDateTime::from_timestamp_opt(unix_time as i64, 0) else {
        return unix_time;
    };
    let secs_into_day = dt.num_seconds_from_midnight() as u64;
    unix_time - secs_into_day
}

/// Set a payload file's mtime to its `internaldate` (§4.4.1 step 3).
fn set_mtime(path: &std::path::Path, unix_time: u64) -> Result<()> {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;

    let spec = TimeSpec::new(unix_time as i64, 0);
    utimensat(None, path, &spec, &spec, UtimensatFlags::FollowSymlink)
        .map_err(|e| Error::Io(std::io::Error::from(e)))
}

/// Input to [`append_record`]: a freshly delivered message not yet known to
/// the index.
pub struct NewMessage<'a> {
    pub raw: &'a [u8],
    pub internaldate: Option<u64>,
    pub system_flags: SystemFlags,
    pub user_flags: UserFlags,
    pub role: Role,
    pub cid: u64,
    pub silent: bool,
}

impl<'a> NewMessage<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        NewMessage {
            raw,
            internaldate: None,
            system_flags: SystemFlags::empty(),
            user_flags: UserFlags::default(),
            role: Role::Spool,
            cid: 0,
            silent: false,
        }
    }
}

/// `append_record` (§4.4.1). Preconditions: index EXCLUSIVE, `uid >
/// last_uid`, non-empty message. Returns the assigned record's index
/// (`recno`).
pub fn append_record(
    handle: &mut MailboxHandle,
    uid: u32,
    msg: NewMessage,
    collab: &mut Collaborators,
) -> Result<usize> {
    assert!(handle.is_writable(), "append_record requires an EXCLUSIVE index lock");
    assert!(
        uid > handle.header.last_uid,
        "append_record requires a strictly increasing uid"
    );
    assert!(!msg.raw.is_empty(), "append_record requires a non-empty message");

    let guid = MessageGuid::compute(msg.raw);
    assert!(!guid.is_null(), "append_record requires a non-null guid");

    let quotaroot = handle.header_file.quotaroot.clone();
    if let Some(limit) = collab.quota.limit_bytes(&quotaroot)? {
        let used = collab.quota.used_bytes(&quotaroot)?;
        if used + msg.raw.len() as u64 > limit {
            return Err(Error::QuotaExceeded);
        }
    }

    let now = now_unix();
    let internaldate = msg.internaldate.unwrap_or(now);
    let sentdate = midnight_of(internaldate);

    let parsed = message::parse(msg.raw);
    let unlinked = msg.system_flags.contains(SystemFlags::UNLINKED);

    let mut system_flags = msg.system_flags;
    if msg.role == Role::Archive {
        system_flags |= SystemFlags::ARCHIVED;
    }

    let mut record = IndexRecord {
        uid,
        internaldate,
        sentdate,
        size: msg.raw.len() as u32,
        header_size: header_len(msg.raw),
        gmtime: internaldate,
        cache_offset: 0,
        last_updated: now,
        system_flags,
        user_flags: msg.user_flags,
        content_lines: count_all_lines(msg.raw),
        cache_version: message::CURRENT_CACHE_VERSION,
        message_guid: guid,
        modseq: handle.header.highestmodseq,
        cid: msg.cid,
        cache_crc: 0,
    };

    if !unlinked {
        let path = handle.layout.payload_path(msg.role, uid);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, msg.raw)?;
        set_mtime(&path, internaldate)?;

        let items = parsed.to_cache_items();
        let cache = handle.cache_file(msg.role)?;
        let (offset, crc) = cache.append(&items)?;
        record.cache_offset = offset;
        record.cache_crc = crc;
    }

    if !msg.silent {
        handle.header.highestmodseq += 1;
        record.modseq = handle.header.highestmodseq;
    }

    if record.system_flags.contains(SystemFlags::EXPUNGED) {
        handle.header.first_expunged = if handle.header.first_expunged == 0 {
            record.last_updated
        } else {
            handle.header.first_expunged.min(record.last_updated)
        };
    }

    apply_counters(&mut handle.header, &record, 1);
    if !record.system_flags.contains(SystemFlags::EXPUNGED) {
        let algo = Algorithm::from_vers(handle.header.sync_crc_vers);
        handle.header.sync_crc ^= synccrc::message_contribution(&record, algo);
    }
    handle.header.last_uid = uid;
    handle.records.push(record);

    if msg.cid != 0 {
        collab.conversations.record_message(msg.cid, guid)?;
    }
    // Usage-delta push is best-effort (§4.10 "failure to update is logged,
    // not fatal"); only the limit check above can fail the append.
    if let Err(e) = collab.quota.charge(&quotaroot, msg.raw.len() as i64) {
        tracing::warn!(mailbox = %quotaroot, error = %e, "quota usage update failed");
    }

    handle.dirty_header = true;
    handle.commit()?;
    Ok(handle.records.len() - 1)
}

/// `rewrite_record` (§4.4.2). Preconditions: index EXCLUSIVE, `recno` in
/// range. `mutate` receives a clone of the existing record and returns the
/// new value; UID, guid and non-decreasing modseq/EXPUNGED are enforced
/// on the result.
pub fn rewrite_record(
    handle: &mut MailboxHandle,
    recno: usize,
    silent: bool,
    immediate_expunge: bool,
    mutate: impl FnOnce(&mut IndexRecord),
) -> Result<()> {
    assert!(handle.is_writable(), "rewrite_record requires an EXCLUSIVE index lock");
    let old = handle.records.get(recno).cloned().ok_or(Error::NotFound)?;

    let mut new = old.clone();
    mutate(&mut new);

    assert_eq!(new.uid, old.uid, "rewrite_record must not change uid");
    assert_eq!(
        new.message_guid, old.message_guid,
        "rewrite_record must not change message_guid"
    );
    assert!(
        new.modseq >= old.modseq,
        "rewrite_record must not decrease modseq"
    );
    assert!(
        !old.system_flags.contains(SystemFlags::EXPUNGED) || new.system_flags.contains(SystemFlags::EXPUNGED),
        "rewrite_record must not unset EXPUNGED"
    );

    if immediate_expunge && new.system_flags.contains(SystemFlags::EXPUNGED) {
        new.system_flags |= SystemFlags::UNLINKED;
    }

    if !silent {
        handle.header.highestmodseq += 1;
        new.modseq = handle.header.highestmodseq;
        new.last_updated = now_unix();
    }

    if new.system_flags.contains(SystemFlags::UNLINKED) {
        handle.header.options |= HeaderOptions::NEEDS_UNLINK;
        if immediate_expunge {
            handle.header.options |= HeaderOptions::NEEDS_REPACK;
        }
    }

    if !old.system_flags.contains(SystemFlags::EXPUNGED) && new.system_flags.contains(SystemFlags::EXPUNGED) {
        handle.header.first_expunged = if handle.header.first_expunged == 0 {
            new.last_updated
        } else {
            handle.header.first_expunged.min(new.last_updated)
        };
    }

    apply_counters(&mut handle.header, &old, -1);
    apply_counters(&mut handle.header, &new, 1);

    let algo = Algorithm::from_vers(handle.header.sync_crc_vers);
    if !old.system_flags.contains(SystemFlags::EXPUNGED) {
        handle.header.sync_crc ^= synccrc::message_contribution(&old, algo);
    }
    if !new.system_flags.contains(SystemFlags::EXPUNGED) {
        handle.header.sync_crc ^= synccrc::message_contribution(&new, algo);
    }

    handle.records[recno] = new;
    handle.dirty_header = true;
    handle.commit()
}

fn apply_counters(header: &mut crate::codec::IndexHeader, rec: &IndexRecord, sign: i64) {
    let expunged = rec.system_flags.contains(SystemFlags::EXPUNGED);
    if !expunged {
        header.exists = (header.exists as i64 + sign).max(0) as u32;
        header.quota_mailbox_used = (header.quota_mailbox_used as i64 + sign * rec.size as i64).max(0) as u64;
        if rec.system_flags.contains(SystemFlags::ANSWERED) {
            header.answered = (header.answered as i64 + sign).max(0) as u32;
        }
        if rec.system_flags.contains(SystemFlags::FLAGGED) {
            header.flagged = (header.flagged as i64 + sign).max(0) as u32;
        }
        if rec.system_flags.contains(SystemFlags::DELETED) {
            header.deleted = (header.deleted as i64 + sign).max(0) as u32;
        }
    }
}

/// `expunge(decider)` (§4.4.3). Default decider (pass `None`): records
/// with `\Deleted` set.
pub fn expunge(
    handle: &mut MailboxHandle,
    decider: Option<&dyn Fn(&IndexRecord) -> bool>,
) -> Result<usize> {
    assert!(handle.is_writable(), "expunge requires an EXCLUSIVE index lock");
    let decide = |r: &IndexRecord| match decider {
        Some(f) => f(r),
        None => r.system_flags.contains(SystemFlags::DELETED),
    };

    let mut count = 0;
    let candidates: Vec<usize> = handle
        .records
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.system_flags.contains(SystemFlags::EXPUNGED) && decide(r))
        .map(|(i, _)| i)
        .collect();

    for recno in candidates {
        rewrite_record(handle, recno, false, false, |r| {
            r.system_flags |= SystemFlags::EXPUNGED;
        })?;
        count += 1;
    }
    Ok(count)
}

/// `expunge_cleanup(expunge_mark)` (§4.4.4): UNLINK every EXPUNGED record
/// whose `last_updated <= expunge_mark`, silently. Tracks the earliest
/// ineligible `last_updated` back into `first_expunged` so the next sweep
/// knows where to resume.
pub fn expunge_cleanup(handle: &mut MailboxHandle, expunge_mark: u64) -> Result<usize> {
    assert!(handle.is_writable(), "expunge_cleanup requires an EXCLUSIVE index lock");
    let mut count = 0;
    let mut next_first_expunged = 0u64;

    let candidates: Vec<usize> = (0..handle.records.len()).collect();
    for recno in candidates {
        let rec = &handle.records[recno];
        if !rec.system_flags.contains(SystemFlags::EXPUNGED) || rec.system_flags.contains(SystemFlags::UNLINKED) {
            continue;
        }
        if rec.last_updated <= expunge_mark {
            rewrite_record(handle, recno, true, false, |r| {
                r.system_flags |= SystemFlags::UNLINKED;
            })?;
            count += 1;
        } else if next_first_expunged == 0 || rec.last_updated < next_first_expunged {
            next_first_expunged = rec.last_updated;
        }
    }
    handle.header.first_expunged = next_first_expunged;
    handle.dirty_header = true;
    handle.commit()?;
    Ok(count)
}

/// `unlink_sweep`: physically remove the payload file of every UNLINKED
/// record whose spool file still exists, run from opportunistic close
/// cleanup (§4.6) when `NEEDS_UNLINK` is set.
pub fn unlink_sweep(handle: &mut MailboxHandle) -> Result<usize> {
    assert!(handle.is_writable(), "unlink_sweep requires an EXCLUSIVE index lock");
    let mut count = 0;
    for rec in &handle.records {
        if !rec.system_flags.contains(SystemFlags::UNLINKED) {
            continue;
        }
        let role = if rec.system_flags.contains(SystemFlags::ARCHIVED) {
            Role::Archive
        } else {
            Role::Spool
        };
        let path = handle.layout.payload_path(role, rec.uid);
        if path.exists() {
            std::fs::remove_file(&path)?;
            count += 1;
        }
    }
    handle.header.options.remove(HeaderOptions::NEEDS_UNLINK);
    handle.dirty_header = true;
    handle.commit()?;
    Ok(count)
}

/// `archive(decider)` / unarchive (§4.4.5). `to_role` is the destination
/// tier; records already on `to_role` are skipped.
pub fn archive(
    handle: &mut MailboxHandle,
    to_role: Role,
    decider: &dyn Fn(&IndexRecord) -> bool,
) -> Result<usize> {
    assert!(handle.is_writable(), "archive requires an EXCLUSIVE index lock");
    let from_role = match to_role {
        Role::Archive => Role::Spool,
        Role::Spool => Role::Archive,
    };

    let candidates: Vec<usize> = handle
        .records
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            !r.system_flags.contains(SystemFlags::EXPUNGED)
                && !r.system_flags.contains(SystemFlags::UNLINKED)
                && r.system_flags.contains(SystemFlags::ARCHIVED) == matches!(from_role, Role::Archive)
                && decider(r)
        })
        .map(|(i, _)| i)
        .collect();

    let mut count = 0;
    for recno in candidates {
        let rec = handle.records[recno].clone();
        let src = handle.layout.payload_path(from_role, rec.uid);
        let dst = handle.layout.payload_path(to_role, rec.uid);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = std::fs::read(&src)?;
        std::fs::write(&dst, &raw)?;

        let parsed = message::parse(&raw);
        let items = parsed.to_cache_items();
        let (offset, crc) = handle.cache_file(to_role)?.append(&items)?;

        rewrite_record(handle, recno, true, false, |r| {
            match to_role {
                Role::Archive => r.system_flags |= SystemFlags::ARCHIVED,
                Role::Spool => r.system_flags.remove(SystemFlags::ARCHIVED),
            }
            r.cache_offset = offset;
            r.cache_crc = crc;
        })?;

        std::fs::remove_file(&src)?;
        count += 1;
    }
    Ok(count)
}

/// `set_acl` (§3.3): updates the textual header's ACL field and marks it
/// for CRC recomputation at the next commit.
pub fn set_acl(handle: &mut MailboxHandle, acl: &str) {
    handle.header_file.acl = acl.to_string();
    handle.dirty_header = true;
}

pub fn set_quotaroot(handle: &mut MailboxHandle, quotaroot: &str) {
    handle.header_file.quotaroot = quotaroot.to_string();
    handle.dirty_header = true;
}

pub fn user_flag_add(handle: &mut MailboxHandle, name: &str) -> Result<usize> {
    let slot = handle.header_file.add_user_flag(name)?;
    handle.dirty_header = true;
    Ok(slot)
}

pub fn user_flag_remove(handle: &mut MailboxHandle, name: &str) {
    handle.header_file.remove_user_flag(name);
    handle.dirty_header = true;
}

/// `delete(handle)` (§3.3, §6.3): mark `DELETED` and commit. Physical
/// removal happens later via `Store::delete_cleanup`.
pub fn delete(handle: &mut MailboxHandle) -> Result<()> {
    assert!(handle.is_writable(), "delete requires an EXCLUSIVE index lock");
    handle.header.options |= HeaderOptions::DELETED;
    handle.dirty_header = true;
    handle.commit()
}

fn header_len(raw: &[u8]) -> u32 {
    for idx in 0..raw.len() {
        if raw[idx..].starts_with(b"\r\n\r\n") {
            return (idx + 4) as u32;
        }
        if raw[idx..].starts_with(b"\n\n") {
            return (idx + 2) as u32;
        }
    }
    raw.len() as u32
}

fn count_all_lines(raw: &[u8]) -> u32 {
    raw.iter().filter(|&&b| b == b'\n').count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{
        InMemoryAnnotationStore, InMemoryConversationStore, InMemoryQuotaStore, InMemorySeenStore,
    };
    use crate::mailbox::{OpenMode, Store};
    use crate::lock::Wait;

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

    fn collaborators() -> Collaborators {
        Collaborators {
            seen: Box::new(InMemorySeenStore::default()),
            conversations: Box::new(InMemoryConversationStore::default()),
            annotations: Box::new(InMemoryAnnotationStore::default()),
            quota: Box::new(InMemoryQuotaStore::default()),
        }
    }

    fn test_store(dir: &std::path::Path) -> Store {
        Store::new(Box::new(FixedCatalog { root: dir.to_path_buf() }))
    }

    #[test]
    fn append_then_read_s6() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store
            .create("user.alice", "alice lrswipkxtecda", "user.alice", None, 1, 13)
            .unwrap();

        let mut collab = collaborators();
        let mut handle = store.open("user.alice", OpenMode::Write, Wait::Block).unwrap();

        let raw = b"Subject: hi\r\n\r\nbody";
        let recno = append_record(&mut handle, 1, NewMessage::new(raw), &mut collab).unwrap();
        assert_eq!(recno, 0);
        assert_eq!(handle.header.num_records, 1);
        assert_eq!(handle.header.last_uid, 1);
        assert_eq!(handle.header.exists, 1);
        assert_eq!(handle.read_record(0).unwrap().uid, 1);

        let before_modseq = handle.header.highestmodseq;
        let recno2 = append_record(&mut handle, 2, NewMessage::new(raw), &mut collab).unwrap();
        assert_eq!(recno2, 1);
        assert!(handle.header.highestmodseq > before_modseq);
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn append_rejects_non_increasing_uid() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store
            .create("user.bob", "bob lrswipkxtecda", "user.bob", None, 1, 13)
            .unwrap();
        let mut collab = collaborators();
        let mut handle = store.open("user.bob", OpenMode::Write, Wait::Block).unwrap();

        let raw = b"Subject: hi\r\n\r\nbody";
        append_record(&mut handle, 1, NewMessage::new(raw), &mut collab).unwrap();
        let _ = append_record(&mut handle, 1, NewMessage::new(raw), &mut collab);
    }

    #[test]
    fn expunge_then_cleanup_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store
            .create("user.carol", "carol lrswipkxtecda", "user.carol", None, 1, 13)
            .unwrap();
        let mut collab = collaborators();
        let mut handle = store.open("user.carol", OpenMode::Write, Wait::Block).unwrap();

        let raw = b"Subject: hi\r\n\r\nbody";
        let mut new_msg = NewMessage::new(raw);
        new_msg.system_flags = SystemFlags::DELETED;
        append_record(&mut handle, 1, new_msg, &mut collab).unwrap();

        let expunged = expunge(&mut handle, None).unwrap();
        assert_eq!(expunged, 1);
        assert!(handle.records[0].system_flags.contains(SystemFlags::EXPUNGED));

        let unlinked = expunge_cleanup(&mut handle, u64::MAX).unwrap();
        assert_eq!(unlinked, 1);
        assert!(handle.records[0].system_flags.contains(SystemFlags::UNLINKED));
    }
}
