//! mbmirror: bidirectional mailbox synchronization engine.
//!
//! The engine pairs messages across two stores through a persisted sync
//! state and a crash-safe write-ahead journal, and propagates new messages,
//! flag changes, deletions and expirations according to the channel policy.
//! Mailbox backends plug in through the [`driver::Driver`] trait.

pub mod config;
pub mod driver;
pub mod errors;
pub mod state;
pub mod sync;
pub mod types;

pub use config::{ChannelConfig, Config, FsyncLevel, OpsConfig, StoreSettings, SyncSettings};
pub use driver::{Driver, DriverError};
pub use sync::{sync_boxes, SyncReport, SyncStatus};
pub use types::{Flags, Pair, Side, Tuid, UidSlot};
