//! The mailbox driver contract.
//!
//! Backends (maildir, IMAP, ...) implement [`Driver`]; the engine only ever
//! talks to this trait. Many calls may be in flight per store at once, so
//! implementations take `&self` and guard their session state internally.

pub mod mem;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Flags, Tuid};

pub type DriverResult<T> = Result<T, DriverError>;

/// Driver call outcomes the engine distinguishes.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The message is unusable; the mailbox itself is fine.
    #[error("message is unusable: {0}")]
    MsgBad(String),
    /// The mailbox is unusable; the channel cannot continue.
    #[error("mailbox failure: {0}")]
    BoxBad(String),
    /// The store connection is gone (network drop, lost authentication).
    #[error("store failure: {0}")]
    StoreBad(String),
    /// The operation was canceled.
    #[error("operation canceled")]
    Canceled,
}

/// Static facts about a store.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub name: String,
    /// Filesystem location, for stores that can hold in-box sync state.
    pub path: Option<PathBuf>,
    /// The store accepts CRLF line endings; without this the engine converts
    /// message bodies to bare LF before storing.
    pub crlf: bool,
}

/// Result of selecting a mailbox.
#[derive(Debug, Clone, Copy)]
pub struct SelectInfo {
    pub uidvalidity: u32,
    pub uidnext: u32,
}

/// What the upcoming load has to deliver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOpts {
    /// Messages already known to the sync state.
    pub old: bool,
    /// Messages beyond the last propagated UID.
    pub new: bool,
    /// Message flags.
    pub flags: bool,
    /// Message sizes.
    pub size: bool,
    /// The box will be expunged on close.
    pub expunge: bool,
    /// Flags will be modified.
    pub setflags: bool,
    /// Messages will be appended.
    pub append: bool,
    /// TUIDs must be recovered from message headers.
    pub find: bool,
    /// Message arrival times.
    pub time: bool,
}

/// Per-message metadata delivered by [`Driver::load`] and
/// [`Driver::find_new`].
#[derive(Debug, Clone, Copy)]
pub struct MsgMeta {
    pub uid: u32,
    pub flags: Flags,
    /// Whether `flags` was actually fetched.
    pub flags_known: bool,
    /// 0 means the size was not fetched.
    pub size: u64,
    pub time: Option<DateTime<Utc>>,
    /// Arrived since the previous session.
    pub recent: bool,
    /// Expunged behind our back; listed anyway so pairing sees it.
    pub dead: bool,
    pub tuid: Option<Tuid>,
}

/// A loaded mailbox: messages in arrival order plus box-level counts.
#[derive(Debug, Clone, Default)]
pub struct MailboxView {
    pub msgs: Vec<MsgMeta>,
    pub total: usize,
    pub recent: usize,
}

/// Message payload moving between stores.
#[derive(Debug, Clone)]
pub struct MsgData {
    pub bytes: Vec<u8>,
    pub flags: Flags,
    pub time: Option<DateTime<Utc>>,
}

/// A mailbox backend, opened and connected, with one mailbox selected at a
/// time.
#[async_trait]
pub trait Driver: Send + Sync {
    fn info(&self) -> StoreInfo;

    /// Select the mailbox, optionally creating it first.
    async fn select(&self, create: bool) -> DriverResult<SelectInfo>;

    /// Announce which message attributes the coming load must provide.
    async fn prepare(&self, opts: OpenOpts) -> DriverResult<()>;

    /// List messages with `min_uid <= uid <= max_uid`, skipping `excludes`.
    /// TUIDs are extracted for messages with `uid >= new_uid_floor` when
    /// `find` was prepared.
    async fn load(
        &self,
        min_uid: u32,
        max_uid: u32,
        new_uid_floor: u32,
        excludes: &[u32],
    ) -> DriverResult<MailboxView>;

    /// Fetch a message body with its flags and arrival time.
    async fn fetch(&self, uid: u32) -> DriverResult<MsgData>;

    /// Append a message to the mailbox or its trash folder. `Ok(None)` means
    /// the UID is not known synchronously and must be recovered through
    /// [`Driver::find_new`].
    async fn store(&self, data: MsgData, to_trash: bool) -> DriverResult<Option<u32>>;

    /// Messages that appeared since `select`, with their TUIDs where present.
    async fn find_new(&self) -> DriverResult<Vec<MsgMeta>>;

    async fn set_flags(&self, uid: u32, add: Flags, del: Flags) -> DriverResult<()>;

    /// Move a message to the store's trash folder.
    async fn trash(&self, uid: u32) -> DriverResult<()>;

    /// Close the mailbox, expunging deleted messages.
    async fn close_box(&self) -> DriverResult<()>;

    /// Flush any deferred flag updates.
    async fn commit(&self);

    /// Abort pending commands; subsequent calls report
    /// [`DriverError::Canceled`].
    fn cancel(&self);

    /// Tear down the store connection after a fatal store error.
    fn cancel_store(&self);
}
