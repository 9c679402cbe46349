//! Single-node mailbox storage engine.
//!
//! This crate owns the on-disk formats, lock hierarchy and mutation
//! primitives for a single mailbox: the binary index (header + fixed-size
//! records), the append-only cache files, the textual header file, and the
//! filesystem layout of per-message payloads. Everything above it
//! (protocol front-ends, the mailbox-list catalog, quota/seen/annotation
//! databases) is a collaborator this crate calls through a narrow trait,
//! never a thing it owns.

pub mod cache;
pub mod codec;
pub mod collab;
pub mod config;
pub mod crc;
pub mod error;
pub mod flags;
pub mod headerfile;
pub mod ident;
pub mod layout;
pub mod lock;
pub mod mailbox;
pub mod message;
pub mod mutate;
pub mod reconstruct;
pub mod repack;
pub mod synccrc;

pub use error::{Error, Result};
pub use mailbox::{MailboxHandle, OpenMode};
