//! In-memory mailbox driver.
//!
//! Backs the integration tests: a plain message map with UID allocation, a
//! trash folder, expunge-on-close, and knobs to provoke the awkward paths
//! (UIDs withheld from `store`, TUID headers stripped, a store connection
//! going bad).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    Driver, DriverError, DriverResult, MailboxView, MsgData, MsgMeta, OpenOpts, SelectInfo,
    StoreInfo,
};
use crate::types::{Flags, Tuid, TUID_LEN};

#[derive(Debug, Clone)]
struct StoredMsg {
    uid: u32,
    flags: Flags,
    time: DateTime<Utc>,
    recent: bool,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    msgs: BTreeMap<u32, StoredMsg>,
    trash: Vec<StoredMsg>,
    uidvalidity: u32,
    uidnext: u32,
    select_uidnext: u32,
    opts: OpenOpts,
    withhold_uids: bool,
    strip_tuids: bool,
    refuse_stores: u32,
    refuse_trash: bool,
}

pub struct MemStore {
    name: String,
    path: Option<PathBuf>,
    crlf: bool,
    canceled: AtomicBool,
    broken: AtomicBool,
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new(name: &str) -> MemStore {
        MemStore {
            name: name.to_string(),
            path: None,
            crlf: false,
            canceled: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                uidvalidity: 1,
                uidnext: 1,
                select_uidnext: 1,
                ..Inner::default()
            }),
        }
    }

    pub fn with_crlf(mut self, crlf: bool) -> MemStore {
        self.crlf = crlf;
        self
    }

    pub fn with_path(mut self, path: PathBuf) -> MemStore {
        self.path = Some(path);
        self
    }

    fn check(&self) -> DriverResult<()> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(DriverError::Canceled);
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(DriverError::StoreBad("connection torn down".into()));
        }
        Ok(())
    }

    // ---- direct mailbox access for tests ----

    pub async fn append(&self, body: &[u8], flags: Flags) -> u32 {
        let mut inner = self.inner.lock().await;
        let uid = inner.uidnext;
        inner.uidnext += 1;
        inner.msgs.insert(
            uid,
            StoredMsg {
                uid,
                flags,
                time: Utc::now(),
                recent: false,
                body: body.to_vec(),
            },
        );
        uid
    }

    pub async fn mark(&self, uid: u32, add: Flags, del: Flags) {
        let mut inner = self.inner.lock().await;
        if let Some(msg) = inner.msgs.get_mut(&uid) {
            msg.flags = (msg.flags | add) - del;
        }
    }

    /// Remove a message outright, as an expunge done behind our back.
    pub async fn remove(&self, uid: u32) {
        self.inner.lock().await.msgs.remove(&uid);
    }

    pub async fn set_uidvalidity(&self, uidvalidity: u32) {
        self.inner.lock().await.uidvalidity = uidvalidity;
    }

    pub async fn uids(&self) -> Vec<u32> {
        self.inner.lock().await.msgs.keys().copied().collect()
    }

    pub async fn flags_of(&self, uid: u32) -> Option<Flags> {
        self.inner.lock().await.msgs.get(&uid).map(|m| m.flags)
    }

    pub async fn body_of(&self, uid: u32) -> Option<Vec<u8>> {
        self.inner.lock().await.msgs.get(&uid).map(|m| m.body.clone())
    }

    pub async fn trash_len(&self) -> usize {
        self.inner.lock().await.trash.len()
    }

    // ---- fault injection ----

    /// Pretend the store cannot report UIDs from `store`; the engine must
    /// fall back to TUID lookup.
    pub async fn withhold_uids(&self, on: bool) {
        self.inner.lock().await.withhold_uids = on;
    }

    /// Drop `X-TUID:` headers from stored messages, losing the copies.
    pub async fn strip_tuids(&self, on: bool) {
        self.inner.lock().await.strip_tuids = on;
    }

    /// Refuse the next `n` message stores with a per-message error.
    pub async fn refuse_stores(&self, n: u32) {
        self.inner.lock().await.refuse_stores = n;
    }

    /// Make trash moves fail with a per-message error.
    pub async fn refuse_trash(&self, on: bool) {
        self.inner.lock().await.refuse_trash = on;
    }

    /// Simulate the connection dropping: every call fails from now on.
    pub fn break_store(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

fn extract_tuid(body: &[u8]) -> Option<Tuid> {
    let mut start = 0usize;
    for (i, &c) in body.iter().enumerate() {
        if c != b'\n' {
            continue;
        }
        let line = &body[start..i];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return None;
        }
        if let Some(tag) = line.strip_prefix(b"X-TUID: ") {
            return (tag.len() == TUID_LEN).then(|| Tuid::from_bytes(tag)).flatten();
        }
        start = i + 1;
    }
    None
}

fn strip_tuid_header(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut start = 0usize;
    let mut in_header = true;
    for (i, &c) in body.iter().enumerate() {
        if c != b'\n' {
            continue;
        }
        let line = &body[start..=i];
        let bare = line.strip_suffix(b"\n").unwrap_or(line);
        let bare = bare.strip_suffix(b"\r").unwrap_or(bare);
        if in_header && bare.is_empty() {
            in_header = false;
        }
        if !(in_header && bare.starts_with(b"X-TUID: ")) {
            out.extend_from_slice(line);
        }
        start = i + 1;
    }
    out.extend_from_slice(&body[start..]);
    out
}

fn meta_of(msg: &StoredMsg, opts: OpenOpts, tuid_floor: Option<u32>) -> MsgMeta {
    MsgMeta {
        uid: msg.uid,
        flags: msg.flags,
        flags_known: true,
        size: if opts.size { msg.body.len() as u64 } else { 0 },
        time: Some(msg.time),
        recent: msg.recent,
        dead: false,
        tuid: tuid_floor
            .filter(|floor| msg.uid >= *floor)
            .and_then(|_| extract_tuid(&msg.body)),
    }
}

#[async_trait]
impl Driver for MemStore {
    fn info(&self) -> StoreInfo {
        StoreInfo {
            name: self.name.clone(),
            path: self.path.clone(),
            crlf: self.crlf,
        }
    }

    async fn select(&self, _create: bool) -> DriverResult<SelectInfo> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner.select_uidnext = inner.uidnext;
        // A new session; whatever was recent has been seen by now.
        for msg in inner.msgs.values_mut() {
            msg.recent = false;
        }
        Ok(SelectInfo {
            uidvalidity: inner.uidvalidity,
            uidnext: inner.uidnext,
        })
    }

    async fn prepare(&self, opts: OpenOpts) -> DriverResult<()> {
        self.check()?;
        self.inner.lock().await.opts = opts;
        Ok(())
    }

    async fn load(
        &self,
        min_uid: u32,
        max_uid: u32,
        new_uid_floor: u32,
        excludes: &[u32],
    ) -> DriverResult<MailboxView> {
        self.check()?;
        let inner = self.inner.lock().await;
        let opts = inner.opts;
        let tuid_floor = opts.find.then_some(new_uid_floor);
        let msgs: Vec<MsgMeta> = inner
            .msgs
            .values()
            .filter(|m| m.uid >= min_uid && m.uid <= max_uid && !excludes.contains(&m.uid))
            .map(|m| meta_of(m, opts, tuid_floor))
            .collect();
        let recent = msgs.iter().filter(|m| m.recent).count();
        Ok(MailboxView {
            total: msgs.len(),
            recent,
            msgs,
        })
    }

    async fn fetch(&self, uid: u32) -> DriverResult<MsgData> {
        self.check()?;
        let inner = self.inner.lock().await;
        let msg = inner
            .msgs
            .get(&uid)
            .ok_or_else(|| DriverError::MsgBad(format!("no message {uid}")))?;
        Ok(MsgData {
            bytes: msg.body.clone(),
            flags: msg.flags,
            time: Some(msg.time),
        })
    }

    async fn store(&self, data: MsgData, to_trash: bool) -> DriverResult<Option<u32>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if inner.refuse_stores > 0 {
            inner.refuse_stores -= 1;
            return Err(DriverError::MsgBad("message refused".into()));
        }
        let body = if inner.strip_tuids {
            strip_tuid_header(&data.bytes)
        } else {
            data.bytes
        };
        let uid = inner.uidnext;
        inner.uidnext += 1;
        let msg = StoredMsg {
            uid,
            flags: data.flags,
            time: data.time.unwrap_or_else(Utc::now),
            recent: true,
            body,
        };
        if to_trash {
            inner.trash.push(msg);
            return Ok(Some(uid));
        }
        inner.msgs.insert(uid, msg);
        Ok((!inner.withhold_uids).then_some(uid))
    }

    async fn find_new(&self) -> DriverResult<Vec<MsgMeta>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let opts = inner.opts;
        let floor = inner.select_uidnext;
        Ok(inner
            .msgs
            .values()
            .filter(|m| m.uid >= floor)
            .map(|m| meta_of(m, opts, Some(floor)))
            .collect())
    }

    async fn set_flags(&self, uid: u32, add: Flags, del: Flags) -> DriverResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let msg = inner
            .msgs
            .get_mut(&uid)
            .ok_or_else(|| DriverError::MsgBad(format!("no message {uid}")))?;
        msg.flags = (msg.flags | add) - del;
        Ok(())
    }

    async fn trash(&self, uid: u32) -> DriverResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if inner.refuse_trash {
            return Err(DriverError::MsgBad(format!("cannot trash message {uid}")));
        }
        let msg = inner
            .msgs
            .remove(&uid)
            .ok_or_else(|| DriverError::MsgBad(format!("no message {uid}")))?;
        inner.trash.push(msg);
        Ok(())
    }

    async fn close_box(&self) -> DriverResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner.msgs.retain(|_, m| !m.flags.contains(Flags::TRASHED));
        Ok(())
    }

    async fn commit(&self) {}

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn cancel_store(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.broken.store(true, Ordering::SeqCst);
    }
}
