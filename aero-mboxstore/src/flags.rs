//! Bitmaps carried in the index header and in index records.
//!
//! These mirror the `OPT_*` / flag bits of the cyrus.index format (§3.1,
//! §3.2 invariants 3-4). User flags are a fixed 128-bit vector (4 x u32),
//! named by the textual header file.

use std::fmt;

bitflags::bitflags! {
    /// Per-record system flags (index record `system_flags` bitmap).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SystemFlags: u32 {
        const ANSWERED = 0x0001;
        const FLAGGED  = 0x0002;
        const DELETED  = 0x0004;
        const DRAFT    = 0x0008;
        const SEEN     = 0x0010;
        const EXPUNGED = 0x0020;
        const UNLINKED = 0x0040;
        const ARCHIVED = 0x0080;
    }
}

impl SystemFlags {
    /// Names matching flag CRC computation order in the sync-CRC v1 engine (§4.9).
    pub const NAMED: &'static [(SystemFlags, &'static str)] = &[
        (SystemFlags::ANSWERED, "\\Answered"),
        (SystemFlags::FLAGGED, "\\Flagged"),
        (SystemFlags::DELETED, "\\Deleted"),
        (SystemFlags::DRAFT, "\\Draft"),
        (SystemFlags::SEEN, "\\Seen"),
    ];

    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

bitflags::bitflags! {
    /// Index header `options` bitmap (§3.1).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct HeaderOptions: u32 {
        const DELETED        = 0x0001;
        const NEEDS_REPACK    = 0x0002;
        const NEEDS_UNLINK    = 0x0004;
        const SHAREDSEEN      = 0x0008;
        const POP3_NEW_UIDL   = 0x0010;
    }
}

/// 128-bit vector of user-defined flag slots, stored as 4 x u32 in the
/// index record. Names for each slot live in the textual header file
/// (§3.1, §6.1).
pub const MAX_USER_FLAGS: usize = 128;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserFlags(pub [u32; 4]);

impl UserFlags {
    pub fn is_set(&self, slot: usize) -> bool {
        assert!(slot < MAX_USER_FLAGS, "user flag slot out of range");
        (self.0[slot / 32] >> (slot % 32)) & 1 != 0
    }

    pub fn set(&mut self, slot: usize, value: bool) {
        assert!(slot < MAX_USER_FLAGS, "user flag slot out of range");
        let word = &mut self.0[slot / 32];
        if value {
            *word |= 1 << (slot % 32);
        } else {
            *word &= !(1 << (slot % 32));
        }
    }

    pub fn to_be_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, word) in self.0.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    pub fn from_be_bytes(buf: &[u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_be_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        }
        UserFlags(words)
    }
}

impl fmt::Display for UserFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}{:08x}{:08x}{:08x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_flags_roundtrip() {
        let mut uf = UserFlags::default();
        uf.set(0, true);
        uf.set(42, true);
        uf.set(127, true);
        assert!(uf.is_set(0));
        assert!(uf.is_set(42));
        assert!(uf.is_set(127));
        assert!(!uf.is_set(1));

        let bytes = uf.to_be_bytes();
        let back = UserFlags::from_be_bytes(&bytes);
        assert_eq!(uf, back);
    }

    #[test]
    fn system_flags_names_order() {
        let f = SystemFlags::SEEN | SystemFlags::ANSWERED;
        assert_eq!(f.names(), vec!["\\Answered", "\\Seen"]);
    }
}
