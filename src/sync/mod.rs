//! The per-channel synchronization engine.
//!
//! One [`sync_boxes`] call drives a channel to completion: select both
//! mailboxes, load the persisted state (replaying the journal after a
//! crash), pair messages to sync records, propagate new messages, flag
//! changes, deletions and expirations, and finally commit the new state
//! atomically. Every intended mutation is journaled before the driver call
//! that performs it, so an interrupted run resumes without duplicating work.

mod pairing;
mod plan;
pub mod rewrite;

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelConfig, SyncSettings};
use crate::driver::{Driver, DriverError, DriverResult, MailboxView, MsgMeta};
use crate::state::{
    self, Journal, StateHeader, StateLock, StatePaths, SyncRec,
};
use crate::types::{Flags, Pair, Side, Tuid, UidSlot};

/// Outcome bits of a channel run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// The channel failed (mailbox error, state trouble, lock contention).
    pub failed: bool,
    /// Nothing was attempted; reserved for callers driving many channels.
    pub failed_all: bool,
    /// The store connection broke down, per side.
    pub bad: Pair<bool>,
}

impl SyncStatus {
    pub fn ok(self) -> bool {
        !self.failed && !self.failed_all && !self.bad.master && !self.bad.slave
    }

    /// The classic exit bitmask: FAIL=1, FAIL_ALL=2, BAD_MASTER=4,
    /// BAD_SLAVE=8.
    pub fn as_bits(self) -> u32 {
        (self.failed as u32)
            | ((self.failed_all as u32) << 1)
            | ((self.bad.master as u32) << 2)
            | ((self.bad.slave as u32) << 3)
    }
}

/// Per-side progress counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub new_total: usize,
    pub new_done: usize,
    pub flags_total: usize,
    pub flags_done: usize,
    pub trash_total: usize,
    pub trash_done: usize,
}

/// What a channel run did, and how it ended.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub progress: Pair<Progress>,
    /// Copies whose TUID could not be found again; they will be retried.
    pub lost_tuids: usize,
}

/// Synchronize one pair of mailboxes. Both drivers must be connected;
/// mailbox names default to INBOX.
pub async fn sync_boxes(
    drivers: Pair<Arc<dyn Driver>>,
    names: Pair<Option<String>>,
    chan: &ChannelConfig,
    settings: &SyncSettings,
) -> SyncReport {
    SyncEngine::new(drivers, chan.clone(), settings.clone())
        .run(names)
        .await
}

/// The channel aborted; per-message work stops and the run bails out
/// through cleanup.
pub(crate) struct Halted;

pub(crate) type Flow<T> = Result<T, Halted>;

/// A loaded message on one side, plus its pairing.
pub(crate) struct SideMsg {
    pub meta: MsgMeta,
    pub srec: Option<usize>,
}

/// A message copy to perform: fetch from `dest.other()`, rewrite, store on
/// `dest`.
pub(crate) struct CopyTask {
    pub dest: Side,
    /// The record being satisfied; `None` for remote-trash copies.
    pub rec: Option<usize>,
    pub src_idx: usize,
    pub src_uid: u32,
    pub tuid: Option<Tuid>,
    pub to_trash: bool,
}

#[derive(Clone, Copy)]
pub(crate) enum FlagKind {
    /// The counterpart vanished; add DELETED here.
    PropagateDelete,
    Sync { add: Flags, del: Flags },
}

#[derive(Clone, Copy)]
pub(crate) struct FlagAction {
    pub ri: usize,
    pub side: Side,
    pub kind: FlagKind,
}

struct TrashDone {
    /// Side whose trash counters this operation belongs to.
    src: Side,
    /// Native trash move, as opposed to a cross-side copy.
    local: bool,
    result: DriverResult<()>,
}

pub(crate) struct SyncEngine {
    drv: Pair<Arc<dyn Driver>>,
    chan: ChannelConfig,
    settings: SyncSettings,
    names: Pair<String>,
    paths: Option<StatePaths>,
    lock: Option<StateLock>,
    pub(crate) journal: Option<Journal>,
    pub(crate) recs: Vec<SyncRec>,
    pub(crate) msgs: Pair<Vec<SideMsg>>,
    total: Pair<usize>,
    recent: Pair<usize>,
    pub(crate) uidnext: Pair<u32>,
    box_uidval: Pair<u32>,
    uidval: Pair<Option<u32>>,
    pub(crate) maxuid: Pair<u32>,
    newuid: Pair<u32>,
    pub(crate) smaxxuid: u32,
    pub(crate) opts: Pair<crate::driver::OpenOpts>,
    find: Pair<bool>,
    did_expunge: Pair<bool>,
    pub(crate) progress: Pair<Progress>,
    lost: usize,
    status: SyncStatus,
    canceled: bool,
}

impl SyncEngine {
    fn new(drv: Pair<Arc<dyn Driver>>, chan: ChannelConfig, settings: SyncSettings) -> SyncEngine {
        SyncEngine {
            drv,
            chan,
            settings,
            names: Pair::new(String::new(), String::new()),
            paths: None,
            lock: None,
            journal: None,
            recs: Vec::new(),
            msgs: Pair::new(Vec::new(), Vec::new()),
            total: Pair::default(),
            recent: Pair::default(),
            uidnext: Pair::default(),
            box_uidval: Pair::default(),
            uidval: Pair::default(),
            maxuid: Pair::default(),
            newuid: Pair::default(),
            smaxxuid: 0,
            opts: Pair::default(),
            find: Pair::default(),
            did_expunge: Pair::default(),
            progress: Pair::default(),
            lost: 0,
            status: SyncStatus::default(),
            canceled: false,
        }
    }

    async fn run(mut self, names: Pair<Option<String>>) -> SyncReport {
        let _ = self.run_channel(names).await;
        self.finish()
    }

    async fn run_channel(&mut self, names: Pair<Option<String>>) -> Flow<()> {
        self.resolve_names(names)?;
        self.select_boxes().await?;
        self.setup_state()?;
        self.load_boxes().await?;
        self.record_uidvalidity();
        info!(channel = %self.chan.name, "synchronizing");
        let boundary = self.recs.len();
        let copies = self.plan_new();
        self.run_copies(copies).await?;
        self.find_copied().await?;
        let mut actions = self.plan_old(boundary);
        self.plan_expiration();
        actions.extend(self.plan_flags(boundary));
        self.run_flags(actions).await?;
        self.run_trash().await?;
        self.close_boxes().await?;
        self.final_purge();
        self.commit();
        Ok(())
    }

    fn finish(mut self) -> SyncReport {
        // On a bailed run the journal and new-state file stay behind for the
        // next run to recover from.
        self.journal = None;
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
        SyncReport {
            status: self.status,
            progress: self.progress,
            lost_tuids: self.lost,
        }
    }

    fn resolve_names(&mut self, given: Pair<Option<String>>) -> Flow<()> {
        for t in Side::ALL {
            let store = &self.chan.stores[t];
            let orig = match &given[t] {
                Some(n) if store.map_inbox.as_deref() != Some(n.as_str()) => n.clone(),
                _ => "INBOX".to_string(),
            };
            if let Some(delim) = &store.flatten {
                if orig.contains(delim.as_str()) {
                    error!(
                        mailbox = %orig,
                        delimiter = %delim,
                        "canonical mailbox name contains the flattened hierarchy delimiter"
                    );
                    self.status.failed = true;
                    return Err(Halted);
                }
                self.names[t] = orig.replace('/', delim);
            } else {
                self.names[t] = orig;
            }
        }
        Ok(())
    }

    async fn select_boxes(&mut self) -> Flow<()> {
        info!(mailbox = %self.names.master, "selecting master");
        info!(mailbox = %self.names.slave, "selecting slave");
        let (rm, rs) = futures::join!(
            self.drv.master.select(self.chan.ops.master.create),
            self.drv.slave.select(self.chan.ops.slave.create),
        );
        for (t, r) in [(Side::Master, rm), (Side::Slave, rs)] {
            match r {
                Ok(sel) => {
                    self.box_uidval[t] = sel.uidvalidity;
                    self.uidnext[t] = sel.uidnext;
                }
                Err(e) => return Err(self.driver_failed(t, &e)),
            }
        }
        Ok(())
    }

    fn setup_state(&mut self) -> Flow<()> {
        let slave_info = self.drv.slave.info();
        let paths = match StatePaths::resolve(
            &self.chan,
            &self.settings,
            slave_info.path.as_deref(),
            Pair::new(self.names.master.as_str(), self.names.slave.as_str()),
        ) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "cannot resolve sync state location");
                self.status.failed = true;
                return Err(Halted);
            }
        };

        match StateLock::acquire(&paths.lock) {
            Ok(lock) => self.lock = Some(lock),
            Err(e) => {
                error!(channel = %self.chan.name, error = %e, "cannot lock channel");
                self.status.failed = true;
                return Err(Halted);
            }
        }

        let st = match state::load_state(&paths) {
            Ok(st) => st,
            Err(e) => {
                error!(error = %e, "cannot load sync state");
                self.status.failed = true;
                return Err(Halted);
            }
        };
        self.recs = st.recs;
        self.uidval = st.uidval;
        self.maxuid = st.maxuid;
        self.smaxxuid = st.smaxxuid;
        self.newuid = st.newuid;

        let mut mismatch = false;
        for t in Side::ALL {
            if let Some(expected) = self.uidval[t] {
                if expected != self.box_uidval[t] {
                    error!(
                        side = t.label(),
                        got = self.box_uidval[t],
                        expected,
                        "UIDVALIDITY changed"
                    );
                    mismatch = true;
                }
            }
        }
        if mismatch {
            self.status.failed = true;
            return Err(Halted);
        }

        if let Err(e) = paths.create_new_marker() {
            error!(error = %e, "cannot write new sync state");
            self.status.failed = true;
            return Err(Halted);
        }
        match Journal::open(&paths.journal, self.settings.fsync, st.replayed) {
            Ok(j) => self.journal = Some(j),
            Err(e) => {
                error!(error = %e, "cannot write journal");
                self.status.failed = true;
                return Err(Halted);
            }
        }

        self.compute_opts(st.replayed);
        self.paths = Some(paths);
        Ok(())
    }

    fn compute_opts(&mut self, replayed: bool) {
        let mut opts: Pair<crate::driver::OpenOpts> = Pair::default();
        for t in Side::ALL {
            let o = t.other();
            let ops = self.chan.ops[t];
            if ops.delete || ops.flags {
                opts[t].setflags = true;
                opts[o].old = true;
                if ops.flags {
                    opts[o].flags = true;
                }
            }
            if ops.new || ops.renew {
                opts[t].append = true;
                if ops.renew {
                    opts[o].old = true;
                }
                if ops.new {
                    opts[o].new = true;
                }
                if ops.expunge {
                    opts[o].flags = true;
                }
                if self.chan.stores[t].max_size.is_some() {
                    opts[o].size = true;
                }
            }
            if ops.expunge {
                opts[t].expunge = true;
                if self.chan.stores[t].trash.is_some() {
                    if !self.chan.stores[t].trash_only_new {
                        opts[t].old = true;
                    }
                    opts[t].new = true;
                    opts[t].flags = true;
                } else if self.chan.stores[o].trash.is_some()
                    && self.chan.stores[o].trash_remote_new
                {
                    opts[t].new = true;
                    opts[t].flags = true;
                }
            }
        }
        if (self.chan.ops.slave.new || self.chan.ops.slave.renew) && self.chan.max_messages > 0 {
            opts.slave.old = true;
            opts.slave.new = true;
            opts.slave.flags = true;
            opts.slave.time = true;
        }
        if replayed {
            // Journal recovery may leave transitions that need extra data.
            for rec in self.recs.iter().filter(|r| r.live()) {
                if rec.expire_transition() {
                    opts.slave.old = true;
                    opts.slave.flags = true;
                }
                if rec.uid.master.tuid().is_some() {
                    opts.master.new = true;
                    opts.master.find = true;
                    self.find.master = true;
                } else if rec.uid.slave.tuid().is_some() {
                    opts.slave.new = true;
                    opts.slave.find = true;
                    self.find.slave = true;
                }
            }
        }
        self.opts = opts;
    }

    fn load_bounds(&self, t: Side, mut minwuid: u32) -> (u32, u32) {
        let opts = self.opts[t];
        let maxwuid = if opts.new {
            let floor = self.maxuid[t].saturating_add(1);
            if minwuid > floor {
                minwuid = floor;
            }
            u32::MAX
        } else if opts.old {
            self.recs
                .iter()
                .filter(|r| r.live())
                .filter_map(|r| r.uid[t].uid())
                .max()
                .unwrap_or(0)
        } else {
            0
        };
        (minwuid, maxwuid)
    }

    async fn load_boxes(&mut self) -> Flow<()> {
        for t in Side::ALL {
            if let Err(e) = self.drv[t].prepare(self.opts[t]).await {
                return Err(self.driver_failed(t, &e));
            }
        }

        if self.smaxxuid == 0 {
            let (min_m, max_m) =
                self.load_bounds(Side::Master, if self.opts.master.old { 1 } else { u32::MAX });
            let (min_s, max_s) =
                self.load_bounds(Side::Slave, if self.opts.slave.old { 1 } else { u32::MAX });
            info!("loading master");
            info!("loading slave");
            let (rm, rs) = futures::join!(
                self.drv.master.load(min_m, max_m, self.newuid.master, &[]),
                self.drv.slave.load(min_s, max_s, self.newuid.slave, &[]),
            );
            self.box_loaded(Side::Master, rm)?;
            self.box_loaded(Side::Slave, rs)?;
        } else {
            // Expired entries constrain which part of the master is worth
            // looking at; load the slave first to find out.
            let (min_s, max_s) =
                self.load_bounds(Side::Slave, if self.opts.slave.old { 1 } else { u32::MAX });
            info!("loading slave");
            let rs = self
                .drv
                .slave
                .load(min_s, max_s, self.newuid.slave, &[])
                .await;
            self.box_loaded(Side::Slave, rs)?;
            let (minwuid, excludes) = self.prepare_master_window();
            let (min_m, max_m) = self.load_bounds(Side::Master, minwuid);
            info!("loading master");
            let rm = self
                .drv
                .master
                .load(min_m, max_m, self.newuid.master, &excludes)
                .await;
            self.box_loaded(Side::Master, rm)?;
        }
        Ok(())
    }

    fn box_loaded(&mut self, t: Side, r: DriverResult<MailboxView>) -> Flow<()> {
        let view = match r {
            Ok(v) => v,
            Err(e) => return Err(self.driver_failed(t, &e)),
        };
        self.msgs[t] = view
            .msgs
            .into_iter()
            .map(|meta| SideMsg { meta, srec: None })
            .collect();
        self.total[t] = view.total;
        self.recent[t] = view.recent;
        info!(
            side = t.label(),
            messages = self.total[t],
            recent = self.recent[t],
            "mailbox loaded"
        );
        if self.find[t] {
            self.find[t] = false;
            debug!(side = t.label(), "matching previously copied messages");
            self.match_tuids(t);
        }
        self.pair_by_uid(t);
        Ok(())
    }

    fn record_uidvalidity(&mut self) {
        if self.uidval.master.is_none() || self.uidval.slave.is_none() {
            self.uidval = Pair::new(Some(self.box_uidval.master), Some(self.box_uidval.slave));
            if let Some(j) = self.journal.as_mut() {
                j.uidvalidity(self.box_uidval);
            }
        }
    }

    async fn run_copies(&mut self, tasks: Vec<CopyTask>) -> Flow<()> {
        let mut pending = FuturesUnordered::new();
        for task in tasks {
            pending.push(self.copy_future(task));
        }
        let mut res = Ok(());
        while let Some((task, r)) = pending.next().await {
            if res.is_ok() {
                res = self.copy_done(task, r);
            }
        }
        res
    }

    fn copy_future(
        &self,
        task: CopyTask,
    ) -> impl std::future::Future<Output = (CopyTask, DriverResult<Option<u32>>)> {
        let src = self.drv[task.dest.other()].clone();
        let dst = self.drv[task.dest].clone();
        let src_crlf = src.info().crlf;
        let dst_crlf = dst.info().crlf;
        async move {
            let mut data = match src.fetch(task.src_uid).await {
                Ok(d) => d,
                Err(e) => return (task, Err(e)),
            };
            if task.tuid.is_some() || src_crlf != dst_crlf {
                match rewrite::rewrite_message(&data.bytes, task.tuid.as_ref(), src_crlf, dst_crlf)
                {
                    Ok(bytes) => data.bytes = bytes,
                    Err(_) => {
                        return (
                            task,
                            Err(DriverError::MsgBad("incomplete message header".into())),
                        )
                    }
                }
            }
            let r = dst.store(data, task.to_trash).await;
            (task, r)
        }
    }

    fn copy_done(&mut self, task: CopyTask, r: DriverResult<Option<u32>>) -> Flow<()> {
        let t = task.dest;
        match r {
            Ok(uid) => {
                if let Some(ri) = task.rec {
                    match uid {
                        Some(u) => {
                            debug!(uid = u, side = t.label(), "copy stored");
                            self.resolve_uid(ri, t, UidSlot::Uid(u));
                        }
                        // The UID comes in later, via the TUID.
                        None => self.find[t] = true,
                    }
                    self.link_source(ri, t.other(), task.src_idx);
                }
            }
            Err(DriverError::MsgBad(e)) => {
                warn!(
                    uid = task.src_uid,
                    from = t.other().label(),
                    error = %e,
                    "message not propagated"
                );
                if let Some(ri) = task.rec {
                    debug!("  killing pair");
                    self.kill_rec(ri);
                }
            }
            Err(DriverError::Canceled) => return Err(Halted),
            Err(e) => return Err(self.driver_failed(t, &e)),
        }
        self.progress[t].new_done += 1;
        self.stats();
        Ok(())
    }

    async fn find_copied(&mut self) -> Flow<()> {
        for t in Side::ALL {
            if !self.find[t] {
                continue;
            }
            debug!(side = t.label(), "finding just copied messages");
            match self.drv[t].find_new().await {
                Ok(found) => self.absorb_found(t, found),
                Err(DriverError::Canceled) => return Err(Halted),
                Err(DriverError::MsgBad(e)) => {
                    warn!(side = t.label(), error = %e, "cannot find newly stored messages");
                }
                Err(e) => return Err(self.driver_failed(t, &e)),
            }
            debug!(side = t.label(), "matching just copied messages");
            self.match_tuids(t);
            self.find[t] = false;
        }
        Ok(())
    }

    async fn run_flags(&mut self, actions: Vec<FlagAction>) -> Flow<()> {
        let mut pending = FuturesUnordered::new();
        for action in actions {
            let drv = self.drv[action.side].clone();
            let uid = self.recs[action.ri].uid[action.side].uid();
            let (add, del) = match action.kind {
                FlagKind::PropagateDelete => (Flags::TRASHED, Flags::NONE),
                FlagKind::Sync { add, del } => (add, del),
            };
            pending.push(async move {
                let r = match uid {
                    Some(u) => drv.set_flags(u, add, del).await,
                    None => Ok(()),
                };
                (action, r)
            });
        }

        let mut res = Ok(());
        while let Some((action, r)) = pending.next().await {
            if res.is_err() {
                continue;
            }
            let (ri, t) = (action.ri, action.side);
            match r {
                Ok(()) => match action.kind {
                    FlagKind::PropagateDelete => {
                        self.recs[ri].del[t] = true;
                        self.resolve_uid(ri, t.other(), UidSlot::Absent);
                    }
                    FlagKind::Sync { add, del } => {
                        if add.contains(Flags::TRASHED) {
                            self.recs[ri].del[t] = true;
                        } else if del.contains(Flags::TRASHED) {
                            self.recs[ri].del[t] = false;
                        }
                        self.flags_applied(ri, t);
                    }
                },
                Err(DriverError::Canceled) => {
                    res = Err(Halted);
                    continue;
                }
                Err(DriverError::MsgBad(e)) => {
                    warn!(side = t.label(), error = %e, "cannot update message flags");
                }
                Err(e) => {
                    res = Err(self.driver_failed(t, &e));
                    continue;
                }
            }
            self.progress[t].flags_done += 1;
            self.stats();
        }
        res?;
        for t in Side::ALL {
            self.drv[t].commit().await;
        }
        Ok(())
    }

    async fn run_trash(&mut self) -> Flow<()> {
        let mut local_ops: Vec<(Side, u32)> = Vec::new();
        let mut remote_ops: Vec<CopyTask> = Vec::new();

        for t in Side::ALL {
            let o = t.other();
            if !self.chan.ops[t].expunge {
                continue;
            }
            let local_trash = self.chan.stores[t].trash.is_some();
            let remote_trash =
                self.chan.stores[o].trash.is_some() && self.chan.stores[o].trash_remote_new;
            if !local_trash && !remote_trash {
                continue;
            }
            debug!(side = t.label(), "trashing");
            for mi in 0..self.msgs[t].len() {
                let meta = self.msgs[t][mi].meta;
                if !meta.flags.contains(Flags::TRASHED) {
                    continue;
                }
                let fresh = match self.msgs[t][mi].srec {
                    None => true,
                    Some(ri) => self.recs[ri].uid[o].is_placeholder(),
                };
                if local_trash {
                    if !self.chan.stores[t].trash_only_new || fresh {
                        debug!(uid = meta.uid, side = t.label(), "trashing message");
                        self.progress[t].trash_total += 1;
                        self.stats();
                        local_ops.push((t, meta.uid));
                    } else {
                        debug!(uid = meta.uid, "not trashing: not new");
                    }
                } else if fresh {
                    if meta.size <= self.chan.stores[o].size_limit() {
                        debug!(uid = meta.uid, side = t.label(), "remote trashing message");
                        self.progress[t].trash_total += 1;
                        self.stats();
                        remote_ops.push(CopyTask {
                            dest: o,
                            rec: None,
                            src_idx: mi,
                            src_uid: meta.uid,
                            tuid: None,
                            to_trash: true,
                        });
                    } else {
                        debug!(uid = meta.uid, "not remote trashing: too big");
                    }
                } else {
                    debug!(uid = meta.uid, "not remote trashing: not new");
                }
            }
        }

        let mut pending: FuturesUnordered<BoxFuture<'static, TrashDone>> = FuturesUnordered::new();
        for (t, uid) in local_ops {
            let drv = self.drv[t].clone();
            pending.push(
                async move {
                    TrashDone {
                        src: t,
                        local: true,
                        result: drv.trash(uid).await,
                    }
                }
                .boxed(),
            );
        }
        for task in remote_ops {
            let src = task.dest.other();
            let fut = self.copy_future(task);
            pending.push(
                async move {
                    let (_, r) = fut.await;
                    TrashDone {
                        src,
                        local: false,
                        result: r.map(drop),
                    }
                }
                .boxed(),
            );
        }

        let mut res = Ok(());
        while let Some(done) = pending.next().await {
            if res.is_err() {
                continue;
            }
            let op_side = if done.local { done.src } else { done.src.other() };
            match done.result {
                Ok(()) => {}
                Err(DriverError::MsgBad(e)) if done.local => {
                    // A failed trash move leaves the mailbox untrustworthy.
                    res = Err(self.driver_failed(op_side, &DriverError::BoxBad(e)));
                    continue;
                }
                // The remote copy found the message gone or busted; so be it.
                Err(DriverError::MsgBad(_)) => {}
                Err(DriverError::Canceled) => {
                    res = Err(Halted);
                    continue;
                }
                Err(e) => {
                    res = Err(self.driver_failed(op_side, &e));
                    continue;
                }
            }
            self.progress[done.src].trash_done += 1;
            self.stats();
        }
        res
    }

    async fn close_boxes(&mut self) -> Flow<()> {
        for t in Side::ALL {
            if !self.chan.ops[t].expunge {
                continue;
            }
            debug!(side = t.label(), "expunging");
            match self.drv[t].close_box().await {
                Ok(()) => self.did_expunge[t] = true,
                Err(DriverError::Canceled) => return Err(Halted),
                Err(e) => return Err(self.driver_failed(t, &e)),
            }
        }
        Ok(())
    }

    /// After expunging, drop or orphan records whose messages are gone, so
    /// the next run starts from a clean list.
    fn final_purge(&mut self) {
        if !(self.did_expunge.master || self.did_expunge.slave) {
            return;
        }

        let mut minwuid = i64::MAX;
        if self.smaxxuid > 0 {
            debug!(smaxxuid = self.smaxxuid, "preparing entry purge");
            for rec in self.recs.iter().filter(|r| r.live()) {
                let gone_s =
                    rec.uid.slave.disk() <= 0 || (rec.del.slave && self.did_expunge.slave);
                let gone_m = rec.uid.master.disk() <= 0
                    || (rec.del.master && self.did_expunge.master)
                    || rec.expired;
                if !(gone_s && gone_m)
                    && (self.smaxxuid as i64) < rec.uid.slave.disk()
                    && minwuid > rec.uid.master.disk()
                {
                    minwuid = rec.uid.master.disk();
                }
            }
            debug!(minwuid, "min non-orphaned master uid");
        }

        for ri in 0..self.recs.len() {
            let rec = &self.recs[ri];
            if rec.dead {
                continue;
            }
            let uid_m = rec.uid.master.disk();
            let gone_s = rec.uid.slave.disk() <= 0 || (rec.del.slave && self.did_expunge.slave);
            let gone_m = (rec.del.master && self.did_expunge.master) || uid_m <= 0;
            if gone_s {
                if gone_m
                    || (rec.expired && self.maxuid.master as i64 >= uid_m && minwuid > uid_m)
                {
                    debug!(
                        uid_m,
                        uid_s = rec.uid.slave.disk(),
                        "  killing purged pair"
                    );
                    self.kill_rec(ri);
                } else if rec.uid.slave.uid().is_some() {
                    debug!(uid_m, uid_s = rec.uid.slave.disk(), "  orphaning slave side");
                    self.resolve_uid(ri, Side::Slave, UidSlot::Absent);
                }
            } else if rec.uid.master.uid().is_some()
                && rec.del.master
                && self.did_expunge.master
            {
                debug!(uid_m, uid_s = rec.uid.slave.disk(), "  orphaning master side");
                self.resolve_uid(ri, Side::Master, UidSlot::Absent);
            }
        }
    }

    fn commit(&mut self) {
        let Some(paths) = self.paths.clone() else {
            return;
        };
        let header = StateHeader {
            uidval: Pair::new(
                self.uidval.master.unwrap_or(self.box_uidval.master),
                self.uidval.slave.unwrap_or(self.box_uidval.slave),
            ),
            maxuid: self.maxuid,
            smaxxuid: self.smaxxuid,
        };
        state::write_new_state(&paths, &header, &self.recs, self.settings.fsync);
        self.journal = None;
        if !self.settings.keep_journal {
            state::commit_state(&paths);
        }
    }

    // ---- shared record mutations; every change is journaled first ----

    pub(crate) fn kill_rec(&mut self, ri: usize) {
        let uid = self.recs[ri].uid;
        if let Some(j) = self.journal.as_mut() {
            j.kill(uid);
        }
        self.recs[ri].dead = true;
    }

    pub(crate) fn resolve_uid(&mut self, ri: usize, t: Side, to: UidSlot) {
        if self.recs[ri].uid[t] == to {
            return;
        }
        let uid = self.recs[ri].uid;
        if let Some(j) = self.journal.as_mut() {
            j.resolve(t, uid, to);
        }
        self.recs[ri].uid[t] = to;
    }

    /// Bind a source message to its record; the first binding advances the
    /// source side's high-water mark.
    pub(crate) fn link_source(&mut self, ri: usize, src: Side, mi: usize) {
        if self.msgs[src][mi].srec.is_some() {
            return;
        }
        self.msgs[src][mi].srec = Some(ri);
        let uid = self.msgs[src][mi].meta.uid;
        if self.maxuid[src] < uid {
            self.maxuid[src] = uid;
            if let Some(j) = self.journal.as_mut() {
                j.max_uid(src, uid);
            }
        }
    }

    /// A side's flag update went through (or there was nothing to send):
    /// fold the change into the record and, on the slave, settle any
    /// expire transition.
    pub(crate) fn flags_applied(&mut self, ri: usize, t: Side) {
        let rec = &self.recs[ri];
        let uid = rec.uid;
        let nflags = (rec.flags | rec.aflags[t]) - rec.dflags[t];
        if rec.flags != nflags {
            debug!(
                uid_m = uid.master.disk(),
                uid_s = uid.slave.disk(),
                flags = %nflags,
                "updating record flags"
            );
            if let Some(j) = self.journal.as_mut() {
                j.flags(uid, nflags);
            }
            self.recs[ri].flags = nflags;
        }
        if t != Side::Slave {
            return;
        }
        let rec = &self.recs[ri];
        let nex = rec.nexpire;
        if nex != rec.expired {
            if nex {
                if let Some(u) = rec.uid.slave.uid() {
                    if self.smaxxuid < u {
                        self.smaxxuid = u;
                    }
                }
            }
            debug!(
                uid_m = uid.master.disk(),
                uid_s = uid.slave.disk(),
                expired = nex,
                "committing expire state"
            );
            if let Some(j) = self.journal.as_mut() {
                j.expire_commit(uid);
            }
            self.recs[ri].expired = nex;
        } else if nex != rec.expire {
            debug!(
                uid_m = uid.master.disk(),
                uid_s = uid.slave.disk(),
                expire = nex,
                "reverting expire intent"
            );
            if let Some(j) = self.journal.as_mut() {
                j.expire_revert(uid);
            }
            self.recs[ri].expire = nex;
        }
    }

    fn cancel_sync(&mut self) {
        if self.canceled {
            return;
        }
        self.canceled = true;
        for t in Side::ALL {
            if !self.status.bad[t] {
                self.drv[t].cancel();
            }
        }
    }

    pub(crate) fn driver_failed(&mut self, t: Side, err: &DriverError) -> Halted {
        match err {
            DriverError::Canceled => {}
            DriverError::StoreBad(e) => {
                error!(side = t.label(), error = %e, "store failed");
                self.drv[t].cancel_store();
                self.status.bad[t] = true;
                self.cancel_sync();
            }
            e => {
                error!(side = t.label(), error = %e, "mailbox operation failed");
                self.status.failed = true;
                self.cancel_sync();
            }
        }
        Halted
    }

    pub(crate) fn stats(&self) {
        let m = self.progress.master;
        let s = self.progress.slave;
        debug!(
            "progress M +{}/{} *{}/{} #{}/{}  S +{}/{} *{}/{} #{}/{}",
            m.new_done,
            m.new_total,
            m.flags_done,
            m.flags_total,
            m.trash_done,
            m.trash_total,
            s.new_done,
            s.new_total,
            s.flags_done,
            s.flags_total,
            s.trash_done,
            s.trash_total
        );
    }
}
