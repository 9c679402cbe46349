//! Textual header file (`cyrus.header`, §3.1, §6.1).
//!
//! Format: a magic line, then `quotaroot \t uniqueid`, then a line of
//! space-separated user-flag names, then the ACL, each newline-terminated.
//! The binary index header stores a CRC of these exact bytes
//! (`header_file_crc`); mismatch is detected on open (§4.1 step 6, §8
//! invariant 4).

use crate::crc::crc32;
use crate::error::{Error, Result};
use crate::flags::MAX_USER_FLAGS;
use crate::ident::UniqueId;

const MAGIC: &str = "* MAILBOX HEADER MAGIC V1\n";

#[derive(Clone, Debug, PartialEq)]
pub struct HeaderFile {
    pub quotaroot: String,
    pub uniqueid: UniqueId,
    pub user_flags: Vec<String>,
    pub acl: String,
}

impl HeaderFile {
    pub fn new(quotaroot: String, uniqueid: UniqueId) -> Self {
        HeaderFile {
            quotaroot,
            uniqueid,
            user_flags: Vec::new(),
            acl: String::new(),
        }
    }

    /// Canonical on-write form (§9: "tolerant parser, canonical writer").
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(MAGIC);
        out.push_str(&self.quotaroot);
        out.push('\t');
        out.push_str(&self.uniqueid.to_string());
        out.push('\n');
        out.push_str(&self.user_flags.join(" "));
        out.push('\n');
        out.push_str(&self.acl);
        out.push('\n');
        out.into_bytes()
    }

    /// `crc32` of the exact bytes [`encode`] would produce for this value.
    pub fn crc(&self) -> u32 {
        crc32(&self.encode())
    }

    /// Tolerant of legacy forms: a missing uniqueid or a missing
    /// quotaroot/uniqueid tab (§9 "Textual-header parsing").
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(buf).map_err(|_| Error::BadFormat)?;
        let mut lines = text.lines();
        let magic = lines.next().ok_or(Error::BadFormat)?;
        if !magic.starts_with("* MAILBOX HEADER MAGIC") {
            return Err(Error::BadFormat);
        }

        let id_line = lines.next().unwrap_or("");
        let (quotaroot, uniqueid) = match id_line.split_once('\t') {
            Some((q, u)) => (
                q.to_string(),
                u.parse::<UniqueId>().unwrap_or_else(|_| UniqueId::generate()),
            ),
            None => (id_line.to_string(), UniqueId::generate()),
        };

        let user_flags = lines
            .next()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let acl = lines.next().unwrap_or("").to_string();

        Ok(HeaderFile {
            quotaroot,
            uniqueid,
            user_flags,
            acl,
        })
    }

    /// Add a user flag name, failing if all 128 slots are already in use
    /// (§6.4 `USERFLAG_EXHAUSTED`).
    pub fn add_user_flag(&mut self, name: &str) -> Result<usize> {
        if let Some(slot) = self.user_flags.iter().position(|f| f == name) {
            return Ok(slot);
        }
        if self.user_flags.len() >= MAX_USER_FLAGS {
            return Err(Error::UserFlagExhausted);
        }
        self.user_flags.push(name.to_string());
        Ok(self.user_flags.len() - 1)
    }

    pub fn remove_user_flag(&mut self, name: &str) {
        self.user_flags.retain(|f| f != name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut h = HeaderFile::new("user.alice".into(), UniqueId::generate());
        h.add_user_flag("$Junk").unwrap();
        h.acl = "alice lrswipkxtecda".into();

        let encoded = h.encode();
        let decoded = HeaderFile::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn tolerates_missing_uniqueid_tab() {
        let buf = format!("{}user.bob\n\n\n", MAGIC);
        let decoded = HeaderFile::decode(buf.as_bytes()).unwrap();
        assert_eq!(decoded.quotaroot, "user.bob");
    }

    #[test]
    fn exhausts_user_flags() {
        let mut h = HeaderFile::new("user.alice".into(), UniqueId::generate());
        for i in 0..MAX_USER_FLAGS {
            h.add_user_flag(&format!("flag{i}")).unwrap();
        }
        assert!(matches!(
            h.add_user_flag("one_too_many"),
            Err(Error::UserFlagExhausted)
        ));
    }
}
