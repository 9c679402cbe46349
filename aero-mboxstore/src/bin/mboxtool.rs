//! Offline administration CLI: create/repack/reconstruct a mailbox
//! without a running server attached to it, the same role `ctl_mboxlist`
//! and friends play in front of the on-disk format this crate implements.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use aero_mboxstore::codec;
use aero_mboxstore::collab::{
    Collaborators, InMemoryAnnotationStore, InMemoryConversationStore, InMemoryQuotaStore,
    InMemorySeenStore, MailboxCatalog,
};
use aero_mboxstore::config::{read_config, CollaboratorBackend, StoreConfig};
use aero_mboxstore::lock::Wait;
use aero_mboxstore::mailbox::{OpenMode, Store};
use aero_mboxstore::mutate::{self, NewMessage};
use aero_mboxstore::reconstruct::{self, ReconstructFlags};
use aero_mboxstore::repack;
use aero_mboxstore::synccrc;

/// Build the collaborator bundle named by `config.collaborators` (§10.3,
/// §10.6). Only the in-memory stub ships in this crate, so this is the
/// only arm for now.
fn collaborators_for(backend: &CollaboratorBackend) -> Collaborators {
    match backend {
        CollaboratorBackend::InMemory => Collaborators {
            seen: Box::new(InMemorySeenStore::default()),
            conversations: Box::new(InMemoryConversationStore::default()),
            annotations: Box::new(InMemoryAnnotationStore::default()),
            quota: Box::new(InMemoryQuotaStore::default()),
        },
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, env = "AERO_MBOXSTORE_CONFIG", default_value = "mboxstore.toml")]
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lay down an empty mailbox.
    Create {
        name: String,
        #[clap(long, default_value = "")]
        acl: String,
        #[clap(long)]
        quotaroot: Option<String>,
        #[clap(long, default_value_t = 1)]
        uidvalidity: u32,
    },
    /// Append a message read from `file` as a new record.
    Append {
        name: String,
        file: PathBuf,
        #[clap(long)]
        uid: Option<u32>,
    },
    /// Mark every \Deleted message EXPUNGED.
    Expunge { name: String },
    /// Rebuild the index and both cache files under a fresh generation.
    Repack {
        name: String,
        #[clap(long)]
        minor_version: Option<u16>,
    },
    /// Print the index header and every record, for manual inspection.
    Dump { name: String },
    /// Rebuild a mailbox's metadata from what is actually on disk.
    Reconstruct {
        name: String,
        /// Without this, report what would change without writing it.
        #[clap(long)]
        make_changes: bool,
        #[clap(long)]
        quiet: bool,
    },
}

struct ConfigCatalog {
    config: StoreConfig,
}

impl MailboxCatalog for ConfigCatalog {
    fn partition_root(&self, _mailbox_name: &str) -> aero_mboxstore::Result<PathBuf> {
        self.config
            .partitions
            .get(&self.config.default_partition)
            .cloned()
            .ok_or(aero_mboxstore::Error::Internal(format!(
                "no partition named '{}' in configuration",
                self.config.default_partition
            )))
    }

    fn mangled_path(&self, mailbox_name: &str) -> aero_mboxstore::Result<String> {
        Ok(mailbox_name.replace('.', "^"))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = read_config(args.config_file.clone())
        .with_context(|| format!("'{:?}' must be a mboxstore config file", args.config_file))?;
    let default_minor_version = config.default_minor_version;
    let collab_backend = config.collaborators.clone();
    let sync_crc_range = (config.sync_crc.min, config.sync_crc.max);
    let store = Store::new(Box::new(ConfigCatalog { config }));

    match args.command {
        Command::Create {
            name,
            acl,
            quotaroot,
            uidvalidity,
        } => {
            let quotaroot = quotaroot.unwrap_or_else(|| name.clone());
            store.create(&name, &acl, &quotaroot, None, uidvalidity, default_minor_version)?;
            let algo = synccrc::select_algorithm(sync_crc_range.0, sync_crc_range.1);
            let mut handle = store.open(&name, OpenMode::Exclusive, Wait::Block)?;
            handle.header.sync_crc_vers = algo.vers();
            handle.commit()?;
            println!("created {}", name);
        }
        Command::Append { name, file, uid } => {
            let raw = std::fs::read(&file)
                .with_context(|| format!("reading message body from '{:?}'", file))?;
            let mut handle = store.open(&name, OpenMode::Write, Wait::Block)?;
            let uid = uid.unwrap_or(handle.header.last_uid + 1);
            let mut collab = collaborators_for(&collab_backend);
            let recno = mutate::append_record(&mut handle, uid, NewMessage::new(&raw), &mut collab)?;
            println!("appended {} as uid {} (recno {})", name, uid, recno);
        }
        Command::Expunge { name } => {
            let mut handle = store.open(&name, OpenMode::Write, Wait::Block)?;
            let count = mutate::expunge(&mut handle, None)?;
            println!("expunged {} messages in {}", count, name);
        }
        Command::Repack { name, minor_version } => {
            let mut handle = store.open(&name, OpenMode::Exclusive, Wait::Block)?;
            let target = minor_version.unwrap_or(codec::CURRENT_MINOR_VERSION);
            repack::repack(&mut handle, target)?;
            println!("repacked {} to generation {}", name, handle.header.generation_no);
        }
        Command::Reconstruct {
            name,
            make_changes,
            quiet,
        } => {
            let mut flags = ReconstructFlags::empty();
            if make_changes {
                flags |= ReconstructFlags::MAKE_CHANGES;
            }
            if quiet {
                flags |= ReconstructFlags::QUIET;
            }
            let (_handle, report) = reconstruct::reconstruct(&store, &name, flags)?;
            if !quiet {
                if report.discovered.is_empty()
                    && report.wiped.is_empty()
                    && report.fixed.is_empty()
                    && report.oddfiles.is_empty()
                {
                    println!("{}: no changes needed", name);
                } else {
                    println!(
                        "{}: discovered={:?} wiped={:?} fixed={:?} oddfiles={}",
                        name,
                        report.discovered,
                        report.wiped,
                        report.fixed,
                        report.oddfiles.len()
                    );
                }
                if !make_changes {
                    println!("(dry run: pass --make-changes to persist)");
                }
            }
        }
        Command::Dump { name } => {
            let handle = store.open(&name, OpenMode::Read, Wait::Block)?;
            let h = &handle.header;
            println!(
                "generation={} minor_version={} num_records={} last_uid={} highestmodseq={} \
exists={} answered={} flagged={} deleted={} quota_mailbox_used={} sync_crc={:#x} options={:?}",
                h.generation_no,
                h.minor_version,
                h.num_records,
                h.last_uid,
                h.highestmodseq,
                h.exists,
                h.answered,
                h.flagged,
                h.deleted,
                h.quota_mailbox_used,
                h.sync_crc,
                h.options,
            );
            for (recno, rec) in handle.records().iter().enumerate() {
                println!(
                    "  [{}] uid={} size={} modseq={} flags={:?} guid={}",
                    recno, rec.uid, rec.size, rec.modseq, rec.system_flags, rec.message_guid
                );
            }
        }
    }

    Ok(())
}
