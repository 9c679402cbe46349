//! Stable identifiers: the mailbox `uniqueid` and the per-message `guid`.
//!
//! Modeled after the fixed-width hex-encodable identifier idiom used
//! elsewhere in this codebase (`UniqueIdent`), but sized and sourced
//! per this engine's own rules: `uniqueid` is 32 random bytes minted at
//! mailbox creation or INBOX-to-archive rename (§3.1, invariant 10);
//! `message_guid` is a 20-byte content hash computed by the parser
//! (§3.1, §4.8) and is therefore a pure function of the message bytes,
//! never randomly generated.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use sha1::{Digest, Sha1};

#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct UniqueId(pub [u8; 32]);

impl UniqueId {
    pub fn generate() -> Self {
        let mut buf = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut buf);
        UniqueId(buf)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for UniqueId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(s).map_err(|_| "invalid hex")?;
        if bytes.len() != 32 {
            return Err("bad length");
        }
        let mut tmp = [0u8; 32];
        tmp.copy_from_slice(&bytes);
        Ok(UniqueId(tmp))
    }
}

/// Content hash of a message's raw bytes (§3.1 "Message guid").
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug, Default)]
pub struct MessageGuid(pub [u8; 20]);

impl MessageGuid {
    pub fn compute(raw_message: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(raw_message);
        let digest = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        MessageGuid(out)
    }

    pub const fn null() -> Self {
        MessageGuid([0u8; 20])
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for MessageGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for MessageGuid {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(s).map_err(|_| "invalid hex")?;
        if bytes.len() != 20 {
            return Err("bad length");
        }
        let mut tmp = [0u8; 20];
        tmp.copy_from_slice(&bytes);
        Ok(MessageGuid(tmp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_is_deterministic() {
        let a = MessageGuid::compute(b"hello world");
        let b = MessageGuid::compute(b"hello world");
        assert_eq!(a, b);
        let c = MessageGuid::compute(b"hello world!");
        assert_ne!(a, c);
    }

    #[test]
    fn guid_roundtrip_hex() {
        let g = MessageGuid::compute(b"some message bytes");
        let s = g.to_string();
        let back: MessageGuid = s.parse().unwrap();
        assert_eq!(g, back);
    }

    #[test]
    fn uniqueid_are_distinct() {
        assert_ne!(UniqueId::generate(), UniqueId::generate());
    }
}
