//! Engine configuration (§10.3): partition roots, the default
//! `minor_version` newly created mailboxes get, and knobs for the
//! reconstruct/repack tools. Loaded the same way the rest of this
//! codebase reads its TOML configuration: a plain `serde`-derived
//! struct and a `read_config` that deserializes it from a file.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    /// Named partitions, each a directory root mailboxes are laid out
    /// under (§6.1). Most deployments have one, named `default`.
    pub partitions: HashMap<String, PathBuf>,

    /// Partition new mailboxes are created in when the caller does not
    /// name one explicitly.
    pub default_partition: String,

    #[serde(default = "default_minor_version")]
    pub default_minor_version: u16,

    /// The `[min, max]` sync-CRC algorithm version range this node
    /// accepts from a replication peer (§4.9, §9 "a function selecting
    /// the best algorithm in a [min,max] range").
    #[serde(default)]
    pub sync_crc: SyncCrcConfig,

    #[serde(default)]
    pub reconstruct: ReconstructConfig,

    /// Which backend serves the seen/conversation/annotation/quota
    /// collaborator traits (§4.10, §10.6). Only `InMemory` ships here;
    /// the tag exists so a real backend can be added without changing
    /// the shape callers read config into.
    #[serde(default)]
    pub collaborators: CollaboratorBackend,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SyncCrcConfig {
    #[serde(default = "default_sync_crc_min")]
    pub min: u16,
    #[serde(default = "default_sync_crc_max")]
    pub max: u16,
}

impl Default for SyncCrcConfig {
    fn default() -> Self {
        SyncCrcConfig {
            min: default_sync_crc_min(),
            max: default_sync_crc_max(),
        }
    }
}

fn default_sync_crc_min() -> u16 {
    1
}

fn default_sync_crc_max() -> u16 {
    2
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReconstructConfig {
    #[serde(default)]
    pub remove_oddfiles: bool,
    #[serde(default)]
    pub always_parse: bool,
}

/// Tagged the way this codebase tags its storage/auth backend choices:
/// a `kind` discriminant selecting the adapter, with per-kind fields
/// alongside it.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CollaboratorBackend {
    #[default]
    InMemory,
}

fn default_minor_version() -> u16 {
    crate::codec::CURRENT_MINOR_VERSION
}

pub fn read_config(config_file: PathBuf) -> Result<StoreConfig> {
    let text = std::fs::read_to_string(&config_file)?;
    Ok(toml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_text = r#"
            default_partition = "default"

            [partitions]
            default = "/var/spool/mail"
        "#;
        let cfg: StoreConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.default_partition, "default");
        assert_eq!(cfg.default_minor_version, crate::codec::CURRENT_MINOR_VERSION);
        assert_eq!(cfg.sync_crc.min, 1);
        assert_eq!(cfg.sync_crc.max, 2);
        assert!(matches!(cfg.collaborators, CollaboratorBackend::InMemory));
    }

    #[test]
    fn parses_explicit_sync_crc_range() {
        let toml_text = r#"
            default_partition = "default"

            [partitions]
            default = "/var/spool/mail"

            [sync_crc]
            min = 2
            max = 2
        "#;
        let cfg: StoreConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.sync_crc.min, 2);
        assert_eq!(cfg.sync_crc.max, 2);
    }
}
