#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use mbmirror::config::{ChannelConfig, FsyncLevel, OpsConfig, StoreSettings, SyncSettings};
use mbmirror::driver::mem::MemStore;
use mbmirror::driver::Driver;
use mbmirror::state::{load_state, LoadedState, StatePaths};
use mbmirror::sync::{sync_boxes, SyncReport};
use mbmirror::types::Pair;

/// A channel between two in-memory stores with state kept in a tempdir.
pub struct Fixture {
    pub master: Arc<MemStore>,
    pub slave: Arc<MemStore>,
    pub chan: ChannelConfig,
    pub settings: SyncSettings,
    pub tmp: TempDir,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Fixture {
    pub fn new() -> Fixture {
        init_tracing();
        let tmp = tempfile::tempdir().expect("tempdir");
        let prefix = format!("{}/", tmp.path().join("state").display());
        Fixture {
            master: Arc::new(MemStore::new("near")),
            slave: Arc::new(MemStore::new("far")),
            chan: ChannelConfig {
                name: "test".into(),
                stores: Pair::new(
                    StoreSettings {
                        name: "near".into(),
                        ..StoreSettings::default()
                    },
                    StoreSettings {
                        name: "far".into(),
                        ..StoreSettings::default()
                    },
                ),
                ops: Pair::default(),
                max_messages: 0,
                sync_state: None,
            },
            settings: SyncSettings {
                sync_state: prefix,
                fsync: FsyncLevel::None,
                keep_journal: false,
            },
            tmp,
        }
    }

    pub async fn run(&self) -> SyncReport {
        sync_boxes(
            Pair::new(
                self.master.clone() as Arc<dyn Driver>,
                self.slave.clone() as Arc<dyn Driver>,
            ),
            Pair::new(None, None),
            &self.chan,
            &self.settings,
        )
        .await
    }

    pub fn state_paths(&self) -> StatePaths {
        let state = PathBuf::from(format!("{}:near:INBOX_:far:INBOX", self.settings.sync_state));
        let suffixed = |suffix: &str| PathBuf::from(format!("{}{}", state.display(), suffix));
        StatePaths {
            new: suffixed(".new"),
            journal: suffixed(".journal"),
            lock: suffixed(".lock"),
            state,
        }
    }

    /// The committed state, as the next run would see it.
    pub fn loaded(&self) -> LoadedState {
        load_state(&self.state_paths()).expect("loading sync state")
    }
}

pub fn ops(new: bool, flags: bool, delete: bool, expunge: bool) -> OpsConfig {
    OpsConfig {
        new,
        flags,
        delete,
        expunge,
        ..OpsConfig::default()
    }
}

pub fn msg(subject: &str) -> Vec<u8> {
    format!("From: someone@example.org\nSubject: {subject}\n\nhello there\n").into_bytes()
}
