//! Per-mailbox file layout under `partition/name_mangled/` (§6.1).

use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct MailboxLayout {
    pub dir: PathBuf,
}

impl MailboxLayout {
    pub fn new(partition_root: &std::path::Path, mangled_name: &str) -> Self {
        MailboxLayout {
            dir: partition_root.join(mangled_name),
        }
    }

    pub fn header(&self) -> PathBuf {
        self.dir.join("cyrus.header")
    }

    pub fn index(&self) -> PathBuf {
        self.dir.join("cyrus.index")
    }

    pub fn index_new(&self) -> PathBuf {
        self.dir.join("cyrus.index.NEW")
    }

    pub fn cache(&self) -> PathBuf {
        self.dir.join("cyrus.cache")
    }

    pub fn cache_new(&self) -> PathBuf {
        self.dir.join("cyrus.cache.NEW")
    }

    pub fn archivecache(&self) -> PathBuf {
        self.dir.join("cyrus.archivecache")
    }

    pub fn archivecache_new(&self) -> PathBuf {
        self.dir.join("cyrus.archivecache.NEW")
    }

    /// Legacy stale-format expunge records (§4.1 step 8, §4.7 step 9, §6.1).
    pub fn legacy_expunge(&self) -> PathBuf {
        self.dir.join("cyrus.expunge")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.dir.join("data")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join("archive")
    }

    /// Per-message payload path for a given role and UID. `hash` buckets
    /// files into subdirectories the way cyrus does (`data/<hash>/<uid>.`).
    pub fn payload_path(&self, role: Role, uid: u32) -> PathBuf {
        let base = match role {
            Role::Spool => self.spool_dir(),
            Role::Archive => self.archive_dir(),
        };
        base.join(format!("{:x}", uid % 256)).join(format!("{}.", uid))
    }

    pub fn cache_path(&self, role: Role) -> PathBuf {
        match role {
            Role::Spool => self.cache(),
            Role::Archive => self.archivecache(),
        }
    }

    pub fn cache_new_path(&self, role: Role) -> PathBuf {
        match role {
            Role::Spool => self.cache_new(),
            Role::Archive => self.archivecache_new(),
        }
    }
}

/// Storage tier a message payload lives on (§3.1, `ARCHIVED` flag).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Spool,
    Archive,
}
