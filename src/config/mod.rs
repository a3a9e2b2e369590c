//! Channel and store configuration.
//!
//! Connection details (hosts, credentials, TLS) belong to the drivers; this
//! module only models the policy the sync engine acts on.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::{Pair, Side};

/// How hard written state is pushed to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncLevel {
    /// Trust the OS to get buffers out eventually.
    None,
    /// fdatasync the state file before the commit rename.
    #[default]
    Normal,
    /// Additionally fdatasync the journal after every TUID assignment, so a
    /// copy never outruns its journal entry.
    Thorough,
}

/// Propagation operations enabled for one side of a channel. Each applies to
/// changes arriving *at* that side.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpsConfig {
    /// Copy messages that have no counterpart here yet.
    pub new: bool,
    /// Retry messages that were skipped (e.g. over the size limit) before.
    pub renew: bool,
    /// Mark messages deleted when their counterpart disappeared.
    pub delete: bool,
    /// Propagate flag changes.
    pub flags: bool,
    /// Expunge deleted messages when closing the box.
    pub expunge: bool,
    /// Create the mailbox when selecting it.
    pub create: bool,
}

/// Store-level policy the engine needs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Store name; used in sync-state file names. Filled from the config
    /// table key by the loader.
    #[serde(skip)]
    pub name: String,
    /// Mailbox name that maps to INBOX.
    pub map_inbox: Option<String>,
    /// Hierarchy delimiter that `/` is flattened to in mailbox names.
    pub flatten: Option<String>,
    /// Trash mailbox, if the store has one.
    pub trash: Option<String>,
    /// Only trash messages that were never propagated.
    pub trash_only_new: bool,
    /// Accept trashed messages copied over from the other side.
    pub trash_remote_new: bool,
    /// Messages above this size are not propagated into this store.
    pub max_size: Option<u64>,
}

impl StoreSettings {
    pub fn size_limit(&self) -> u64 {
        self.max_size.unwrap_or(u64::MAX)
    }
}

/// A channel: a directed pair of stores plus the propagation policy.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub stores: Pair<StoreSettings>,
    pub ops: Pair<OpsConfig>,
    /// Cap on the slave's message count; 0 means unlimited.
    pub max_messages: u32,
    /// Sync-state location override: a path prefix, or `*` for in-box state.
    pub sync_state: Option<String>,
}

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Global sync-state location: a path prefix, or `*` for in-box state.
    pub sync_state: String,
    pub fsync: FsyncLevel,
    /// Leave the journal and new-state file in place after a successful run.
    pub keep_journal: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    sync_state: Option<String>,
    #[serde(default)]
    fsync: FsyncLevel,
    #[serde(default)]
    stores: BTreeMap<String, StoreSettings>,
    #[serde(default)]
    channels: Vec<ChannelDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChannelDef {
    name: String,
    master: BoxRef,
    slave: BoxRef,
    #[serde(default)]
    sync_state: Option<String>,
    #[serde(default)]
    max_messages: u32,
    #[serde(default)]
    master_ops: OpsConfig,
    #[serde(default)]
    slave_ops: OpsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BoxRef {
    store: String,
    #[serde(default)]
    mailbox: Option<String>,
}

/// A channel resolved against its stores, plus the mailbox names to sync.
#[derive(Debug, Clone)]
pub struct ResolvedChannel {
    pub chan: ChannelConfig,
    pub boxes: Pair<Option<String>>,
}

/// The loaded configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: SyncSettings,
    pub channels: Vec<ResolvedChannel>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        let mut stores = file.stores;
        for (key, store) in stores.iter_mut() {
            store.name = key.clone();
        }

        let mut channels = Vec::new();
        for def in file.channels {
            let resolve = |r: &BoxRef| -> Result<StoreSettings> {
                stores.get(&r.store).cloned().ok_or_else(|| {
                    anyhow::anyhow!(
                        "channel '{}' references unknown store '{}'",
                        def.name,
                        r.store
                    )
                })
            };
            let chan = ChannelConfig {
                name: def.name.clone(),
                stores: Pair::new(resolve(&def.master)?, resolve(&def.slave)?),
                ops: Pair::new(def.master_ops, def.slave_ops),
                max_messages: def.max_messages,
                sync_state: def.sync_state,
            };
            channels.push(ResolvedChannel {
                chan,
                boxes: Pair::new(def.master.mailbox, def.slave.mailbox),
            });
        }

        Ok(Config {
            settings: SyncSettings {
                sync_state: file.sync_state.unwrap_or_else(|| ".".to_string()),
                fsync: file.fsync,
                keep_journal: false,
            },
            channels,
        })
    }
}

impl ChannelConfig {
    /// The effective sync-state location for this channel.
    pub fn sync_state<'a>(&'a self, settings: &'a SyncSettings) -> &'a str {
        self.sync_state.as_deref().unwrap_or(&settings.sync_state)
    }

    /// Whether any operation on `side` is enabled at all.
    pub fn active(&self, side: Side) -> bool {
        let ops = self.ops[side];
        ops.new || ops.renew || ops.delete || ops.flags || ops.expunge
    }
}
