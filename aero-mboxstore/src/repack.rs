//! Repack (§4.5): rebuild the index and both cache files under a fresh
//! generation number, optionally migrating `minor_version`. Runs entirely
//! under the handle's existing EXCLUSIVE index-lock (already required to
//! call any mutator); the `.NEW` rename discipline is what makes a crash
//! mid-repack leave the mailbox at its last-committed state rather than a
//! torn one.

use std::fs::{File, OpenOptions};
use std::io::Write;

use crate::cache::CacheFile;
use crate::codec::IndexHeader;
use crate::error::Result;
use crate::flags::SystemFlags;
use crate::layout::Role;
use crate::mailbox::MailboxHandle;

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `repack(new_minor_version)`. Leaves the handle open against the
/// repacked files on success; on any I/O error the `.NEW` files are
/// removed (best-effort) and the mailbox is left unchanged, per §4.5
/// "Abort at any step".
pub fn repack(handle: &mut MailboxHandle, new_minor_version: u16) -> Result<()> {
    assert!(handle.is_writable(), "repack requires an EXCLUSIVE index lock");

    match try_repack(handle, new_minor_version) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(handle.layout.index_new());
            let _ = std::fs::remove_file(handle.layout.cache_new());
            let _ = std::fs::remove_file(handle.layout.archivecache_new());
            Err(e)
        }
    }
}

fn try_repack(handle: &mut MailboxHandle, new_minor_version: u16) -> Result<()> {
    let new_generation = handle.header.generation_no + 1;

    let mut new_spool_cache = CacheFile::open(&handle.layout.cache_new(), new_generation)?;
    let mut new_archive_cache = CacheFile::open(&handle.layout.archivecache_new(), new_generation)?;

    let mut new_header = IndexHeader {
        generation_no: new_generation,
        minor_version: new_minor_version,
        num_records: 0,
        answered: 0,
        flagged: 0,
        deleted: 0,
        exists: 0,
        quota_mailbox_used: 0,
        deletedmodseq: handle.header.deletedmodseq,
        last_repack_time: now_unix(),
        ..handle.header.clone()
    };

    let mut old_records = handle.records.clone();
    old_records.sort_by_key(|r| r.uid);

    let mut new_records = Vec::with_capacity(old_records.len());
    for old in old_records {
        if old.uid == 0 {
            // Tombstone left by reconstruct (§4.7 step 4); dropped on repack.
            continue;
        }

        let mut rec = old.clone();

        if rec.system_flags.contains(SystemFlags::UNLINKED) {
            let role = if rec.system_flags.contains(SystemFlags::ARCHIVED) {
                Role::Archive
            } else {
                Role::Spool
            };
            let path = handle.layout.payload_path(role, rec.uid);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            new_header.deletedmodseq = new_header.deletedmodseq.max(rec.modseq);
        }

        if rec.cache_offset != 0 || !rec.system_flags.contains(SystemFlags::UNLINKED) {
            let role = if rec.system_flags.contains(SystemFlags::ARCHIVED) {
                Role::Archive
            } else {
                Role::Spool
            };
            let old_cache = handle.cache_file(role)?;
            if let Ok(items) = old_cache.read_at(rec.cache_offset) {
                let dest = match role {
                    Role::Spool => &mut new_spool_cache,
                    Role::Archive => &mut new_archive_cache,
                };
                let (offset, crc) = dest.append(&items)?;
                rec.cache_offset = offset;
                rec.cache_crc = crc;
            }
        }

        if !rec.system_flags.contains(SystemFlags::EXPUNGED) {
            new_header.exists += 1;
            new_header.quota_mailbox_used += rec.size as u64;
            if rec.system_flags.contains(SystemFlags::ANSWERED) {
                new_header.answered += 1;
            }
            if rec.system_flags.contains(SystemFlags::FLAGGED) {
                new_header.flagged += 1;
            }
            if rec.system_flags.contains(SystemFlags::DELETED) {
                new_header.deleted += 1;
            }
        }

        new_records.push(rec);
    }

    new_header.num_records = new_records.len() as u32;
    new_header.header_file_crc = handle.header_file.crc();
    let algo = crate::synccrc::Algorithm::from_vers(new_header.sync_crc_vers);
    new_header.sync_crc = crate::synccrc::recompute(new_records.iter(), algo);

    write_index_new(handle, &new_header, &new_records)?;

    drop(new_spool_cache);
    drop(new_archive_cache);

    std::fs::rename(handle.layout.index_new(), handle.layout.index())?;
    std::fs::rename(handle.layout.cache_new(), handle.layout.cache())?;
    std::fs::rename(handle.layout.archivecache_new(), handle.layout.archivecache())?;

    handle.reopen_after_repack(new_header, new_records)
}

fn write_index_new(
    handle: &MailboxHandle,
    header: &IndexHeader,
    records: &[crate::codec::IndexRecord],
) -> Result<()> {
    let mut file: File = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(handle.layout.index_new())?;
    file.write_all(&header.encode())?;
    for rec in records {
        file.write_all(&rec.encode())?;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{
        InMemoryAnnotationStore, InMemoryConversationStore, InMemoryQuotaStore, InMemorySeenStore,
    };
    use crate::collab::Collaborators;
    use crate::lock::Wait;
    use crate::mailbox::{OpenMode, Store};
    use crate::mutate::{append_record, expunge, NewMessage};

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

    #[test]
    fn repack_preserves_records_and_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Box::new(FixedCatalog { root: dir.path().to_path_buf() }));
        store
            .create("user.dave", "dave lrswipkxtecda", "user.dave", None, 1, 13)
            .unwrap();

        let mut collab = collaborators();
        let mut handle = store.open("user.dave", OpenMode::Write, Wait::Block).unwrap();
        let raw = b"Subject: hi\r\n\r\nbody";
        append_record(&mut handle, 1, NewMessage::new(raw), &mut collab).unwrap();
        append_record(&mut handle, 2, NewMessage::new(raw), &mut collab).unwrap();
        expunge(&mut handle, None).unwrap();

        let generation_before = handle.header.generation_no;
        let uid_before = handle.header.last_uid;
        let exists_before = handle.header.exists;
        let sync_crc_before = handle.header.sync_crc;

        repack(&mut handle, 13).unwrap();

        assert!(handle.header.generation_no > generation_before);
        assert_eq!(handle.header.last_uid, uid_before);
        assert_eq!(handle.header.exists, exists_before);
        assert_eq!(handle.header.num_records, 2);
        // Repack identity (§8 invariant 10): sync_crc is a function of the
        // non-expunged record set, unchanged by a same-version repack.
        assert_eq!(handle.header.sync_crc, sync_crc_before);
    }
}
