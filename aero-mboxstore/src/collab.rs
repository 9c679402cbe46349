//! Collaborator interfaces (§4.10): the four pieces of mailbox state this
//! engine treats as externally owned — seen state, conversations,
//! annotations, quota — plus the catalog that maps mailbox names to
//! on-disk partitions. The engine only needs the narrow interface it
//! calls out to; each is a trait here, with a functional in-memory stub
//! implementation standing in for the real backend, the same split this
//! codebase uses between a storage trait and its `in_memory` realization.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::ident::UniqueId;

/// Per-user \Seen state, kept outside the index because it is
/// per-reader, not per-message (§4.10, §9 open question on SHAREDSEEN).
pub trait SeenStore: Send + Sync {
    fn get_seen_uids(&self, user: &str, mailbox_uniqueid: &UniqueId) -> Result<Vec<u32>>;
    fn set_seen_uids(&self, user: &str, mailbox_uniqueid: &UniqueId, uids: Vec<u32>) -> Result<()>;
}

/// Cross-mailbox conversation/thread roots keyed by message guid, fed by
/// References/In-Reply-To at append time (§4.10).
pub trait ConversationStore: Send + Sync {
    fn conversation_id(&self, references: &[String]) -> Result<Option<u64>>;
    fn record_message(&self, conversation_id: u64, guid: crate::ident::MessageGuid) -> Result<()>;
}

/// Arbitrary client metadata attached to a message outside the index
/// record (IMAP METADATA, §4.10), keyed by UID/entry/userid the way the
/// sync-CRC v2 fingerprint (`MD5(uid " " entry " " userid " " value)`,
/// §4.9) keys it.
pub trait AnnotationStore: Send + Sync {
    fn get(&self, uid: u32, entry: &str, userid: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, uid: u32, entry: &str, userid: &str, value: Option<Vec<u8>>) -> Result<()>;
    /// Every annotation on `uid`, sorted by entry then userid.
    fn list_for_uid(&self, uid: u32) -> Result<Vec<(String, String, Vec<u8>)>>;
    /// Every UID carrying at least one annotation, sorted ascending —
    /// the `annots` enumeration reconstruct's reconcile step walks
    /// alongside the index (§4.7 step 3).
    fn list_uids(&self) -> Result<Vec<u32>>;
    /// Drop every annotation on `uid` (reconstruct's `delannots`, §4.7
    /// step 7, and message expunge/unlink cleanup).
    fn delete_uid(&self, uid: u32) -> Result<()>;
}

/// Storage accounting against a quota root (§3.1 `quotaroot`, §6.4
/// `QuotaExceeded`).
pub trait QuotaStore: Send + Sync {
    fn used_bytes(&self, quotaroot: &str) -> Result<u64>;
    fn limit_bytes(&self, quotaroot: &str) -> Result<Option<u64>>;
    fn charge(&self, quotaroot: &str, delta_bytes: i64) -> Result<()>;
}

/// Maps mailbox names to their partition directory, standing in for the
/// external mailbox-list database reconstruct and rename consult (§4.7,
/// §4.10).
pub trait MailboxCatalog: Send + Sync {
    fn partition_root(&self, mailbox_name: &str) -> Result<std::path::PathBuf>;
    fn mangled_path(&self, mailbox_name: &str) -> Result<String>;
}

/// A bundle of the four per-message/per-mailbox collaborators, passed to
/// mutation primitives that need to consult or update them (§4.4).
pub struct Collaborators {
    pub seen: Box<dyn SeenStore>,
    pub conversations: Box<dyn ConversationStore>,
    pub annotations: Box<dyn AnnotationStore>,
    pub quota: Box<dyn QuotaStore>,
}

#[derive(Default)]
pub struct InMemorySeenStore {
    state: Mutex<HashMap<(String, UniqueId), Vec<u32>>>,
}

impl SeenStore for InMemorySeenStore {
    fn get_seen_uids(&self, user: &str, mailbox_uniqueid: &UniqueId) -> Result<Vec<u32>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .get(&(user.to_string(), *mailbox_uniqueid))
            .cloned()
            .unwrap_or_default())
    }

    fn set_seen_uids(&self, user: &str, mailbox_uniqueid: &UniqueId, uids: Vec<u32>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.insert((user.to_string(), *mailbox_uniqueid), uids);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    by_reference: Mutex<HashMap<String, u64>>,
    next_id: Mutex<u64>,
}

impl ConversationStore for InMemoryConversationStore {
    fn conversation_id(&self, references: &[String]) -> Result<Option<u64>> {
        let table = self.by_reference.lock().unwrap();
        Ok(references.iter().find_map(|r| table.get(r).copied()))
    }

    fn record_message(&self, conversation_id: u64, _guid: crate::ident::MessageGuid) -> Result<()> {
        let mut next_id = self.next_id.lock().unwrap();
        if conversation_id >= *next_id {
            *next_id = conversation_id + 1;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryAnnotationStore {
    state: Mutex<HashMap<u32, HashMap<(String, String), Vec<u8>>>>,
}

impl AnnotationStore for InMemoryAnnotationStore {
    fn get(&self, uid: u32, entry: &str, userid: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(&uid)
            .and_then(|by_key| by_key.get(&(entry.to_string(), userid.to_string())))
            .cloned())
    }

    fn set(&self, uid: u32, entry: &str, userid: &str, value: Option<Vec<u8>>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let by_key = state.entry(uid).or_default();
        let key = (entry.to_string(), userid.to_string());
        match value {
            Some(v) => {
                by_key.insert(key, v);
            }
            None => {
                by_key.remove(&key);
            }
        }
        if by_key.is_empty() {
            state.remove(&uid);
        }
        Ok(())
    }

    fn list_for_uid(&self, uid: u32) -> Result<Vec<(String, String, Vec<u8>)>> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<(String, String, Vec<u8>)> = state
            .get(&uid)
            .map(|by_key| {
                by_key
                    .iter()
                    .map(|((entry, userid), value)| (entry.clone(), userid.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        Ok(out)
    }

    fn list_uids(&self) -> Result<Vec<u32>> {
        let mut uids: Vec<u32> = self.state.lock().unwrap().keys().copied().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn delete_uid(&self, uid: u32) -> Result<()> {
        self.state.lock().unwrap().remove(&uid);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryQuotaStore {
    used: Mutex<HashMap<String, u64>>,
    limits: Mutex<HashMap<String, u64>>,
}

impl QuotaStore for InMemoryQuotaStore {
    fn used_bytes(&self, quotaroot: &str) -> Result<u64> {
        Ok(*self.used.lock().unwrap().get(quotaroot).unwrap_or(&0))
    }

    fn limit_bytes(&self, quotaroot: &str) -> Result<Option<u64>> {
        Ok(self.limits.lock().unwrap().get(quotaroot).copied())
    }

    fn charge(&self, quotaroot: &str, delta_bytes: i64) -> Result<()> {
        let mut used = self.used.lock().unwrap();
        let entry = used.entry(quotaroot.to_string()).or_insert(0);
        *entry = (*entry as i64 + delta_bytes).max(0) as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_store_roundtrips() {
        let store = InMemorySeenStore::default();
        let id = UniqueId::generate();
        store.set_seen_uids("alice", &id, vec![1, 2, 3]).unwrap();
        assert_eq!(store.get_seen_uids("alice", &id).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn annotation_store_lists_by_uid() {
        let store = InMemoryAnnotationStore::default();
        store.set(1, "/comment", "alice", Some(b"hi".to_vec())).unwrap();
        store.set(1, "/flags", "alice", Some(b"urgent".to_vec())).unwrap();
        store.set(2, "/comment", "bob", Some(b"later".to_vec())).unwrap();

        assert_eq!(store.list_uids().unwrap(), vec![1, 2]);
        assert_eq!(store.list_for_uid(1).unwrap().len(), 2);

        store.delete_uid(1).unwrap();
        assert_eq!(store.list_uids().unwrap(), vec![2]);
        assert!(store.get(1, "/comment", "alice").unwrap().is_none());
    }

    #[test]
    fn quota_store_charges_and_floors_at_zero() {
        let store = InMemoryQuotaStore::default();
        store.charge("user.alice", 100).unwrap();
        store.charge("user.alice", -200).unwrap();
        assert_eq!(store.used_bytes("user.alice").unwrap(), 0);
    }
}
