//! Propagation planning: new messages, existing pairs, and slave-side
//! expiration.

use tracing::{debug, info};

use super::{CopyTask, FlagAction, FlagKind, SyncEngine};
use crate::state::SyncRec;
use crate::types::{Flags, Pair, Side, Tuid, UidSlot};

impl SyncEngine {
    /// Decide which unpaired (or renewable) messages get copied. Journals
    /// the record creation, its flags, and the TUID before the copy is
    /// dispatched, so a crash can pick the transfer back up.
    pub(crate) fn plan_new(&mut self) -> Vec<CopyTask> {
        debug!("synchronizing new entries");
        let mut tasks = Vec::new();
        for t in Side::ALL {
            let o = t.other();
            let floor = self.uidnext[t];
            if let Some(j) = self.journal.as_mut() {
                j.new_uid_floor(t, floor);
            }
            for mi in 0..self.msgs[o].len() {
                let meta = self.msgs[o][mi].meta;
                let srec = self.msgs[o][mi].srec;
                let wanted = match srec {
                    Some(ri) => match self.recs[ri].uid[t] {
                        UidSlot::Skipped => self.chan.ops[t].renew,
                        UidSlot::Pending(_) => self.chan.ops[t].new,
                        _ => false,
                    },
                    None => self.chan.ops[t].new,
                };
                if !wanted {
                    continue;
                }
                debug!(uid = meta.uid, on = o.label(), "new message");
                if self.chan.ops[t].expunge && meta.flags.contains(Flags::TRASHED) {
                    debug!("  would be expunged anyway; skipping");
                    continue;
                }
                let ri = match srec {
                    Some(ri) => {
                        self.recs[ri].done = true;
                        debug!(
                            uid_m = self.recs[ri].uid.master.disk(),
                            uid_s = self.recs[ri].uid.slave.disk(),
                            "  pair exists"
                        );
                        ri
                    }
                    None => {
                        let mut uid = Pair::<UidSlot>::default();
                        uid[o] = UidSlot::Uid(meta.uid);
                        uid[t] = UidSlot::Pending(None);
                        let mut rec = SyncRec::new(uid);
                        rec.done = true;
                        self.recs.push(rec);
                        if let Some(j) = self.journal.as_mut() {
                            j.new_rec(uid);
                        }
                        debug!(
                            uid_m = uid.master.disk(),
                            uid_s = uid.slave.disk(),
                            "  pair created"
                        );
                        self.recs.len() - 1
                    }
                };
                if meta.flags.contains(Flags::FLAGGED)
                    || meta.size <= self.chan.stores[t].size_limit()
                {
                    if !meta.flags.is_empty() {
                        self.recs[ri].flags = meta.flags;
                        let uid = self.recs[ri].uid;
                        if let Some(j) = self.journal.as_mut() {
                            j.flags(uid, meta.flags);
                        }
                        debug!(flags = %meta.flags, "  seeding record flags");
                    }
                    let tuid = Tuid::random();
                    self.recs[ri].uid[t] = UidSlot::Pending(Some(tuid));
                    let uid = self.recs[ri].uid;
                    if let Some(j) = self.journal.as_mut() {
                        j.tuid(uid, &tuid);
                    }
                    self.progress[t].new_total += 1;
                    self.stats();
                    debug!(tuid = %tuid, dir = t.dir(), "  copying message");
                    tasks.push(CopyTask {
                        dest: t,
                        rec: Some(ri),
                        src_idx: mi,
                        src_uid: meta.uid,
                        tuid: Some(tuid),
                        to_trash: false,
                    });
                } else if srec.is_some() {
                    debug!("  still too big");
                } else {
                    debug!("  too big; not copying");
                    self.resolve_uid(ri, t, UidSlot::Skipped);
                    self.link_source(ri, o, mi);
                }
            }
        }
        tasks
    }

    /// Walk the pre-existing records: detect vanished pairs, plan delete
    /// propagation, and compute per-side flag diffs.
    pub(crate) fn plan_old(&mut self, boundary: usize) -> Vec<FlagAction> {
        debug!("synchronizing old entries");
        let mut actions = Vec::new();
        for ri in 0..boundary {
            if self.recs[ri].dead || self.recs[ri].done {
                continue;
            }
            let uid = self.recs[ri].uid;
            debug!(uid_m = uid.master.disk(), uid_s = uid.slave.disk(), "pair");

            let mut no = Pair::new(false, false);
            let mut del = Pair::new(false, false);
            for t in Side::ALL {
                no[t] = self.recs[ri].msg[t].is_none() && self.opts[t].old;
                del[t] = no[t] && uid[t].uid().is_some();
            }
            if no.master && no.slave {
                debug!("  vanished");
                self.kill_rec(ri);
                continue;
            }

            for t in Side::ALL {
                let o = t.other();
                self.recs[ri].aflags[t] = Flags::NONE;
                self.recs[ri].dflags[t] = Flags::NONE;
                if let Some(mi) = self.recs[ri].msg[t] {
                    if self.msgs[t][mi].meta.flags.contains(Flags::TRASHED) {
                        self.recs[ri].del[t] = true;
                    }
                }
                if uid[t].disk() == 0 {
                    debug!(side = t.label(), "  no counterpart");
                } else if del[o] {
                    if let Some(mi) = self.recs[ri].msg[t] {
                        let m = &self.msgs[t][mi].meta;
                        if m.flags_known && m.flags != self.recs[ri].flags {
                            info!(
                                uid_m = uid.master.disk(),
                                uid_s = uid.slave.disk(),
                                "conflicting changes"
                            );
                        }
                    }
                    if self.chan.ops[t].delete {
                        debug!(dir = t.dir(), "  propagating delete");
                        self.progress[t].flags_total += 1;
                        self.stats();
                        actions.push(FlagAction {
                            ri,
                            side: t,
                            kind: FlagKind::PropagateDelete,
                        });
                    } else {
                        debug!(dir = t.dir(), "  not propagating delete");
                    }
                } else if self.recs[ri].msg[o].is_none() {
                    // Counterpart not loaded; nothing to diff against.
                } else if uid[t].is_placeholder() {
                    // Handled with the new messages.
                } else if !del[t] {
                    if self.chan.ops[t].flags {
                        if let Some(mi) = self.recs[ri].msg[o] {
                            let mut sflags = self.msgs[o][mi].meta.flags;
                            if t == Side::Master
                                && (self.recs[ri].expire || self.recs[ri].expired)
                            {
                                // A slave-side DELETED may be an expiration
                                // artifact; the master must not inherit it.
                                sflags = sflags - Flags::TRASHED;
                            }
                            let rec = &mut self.recs[ri];
                            rec.aflags[t] = sflags - rec.flags;
                            rec.dflags[t] = rec.flags - sflags;
                            debug!(
                                dir = t.dir(),
                                add = %rec.aflags[t],
                                del = %rec.dflags[t],
                                "  flag diff"
                            );
                        }
                    } else {
                        debug!(dir = t.dir(), "  not propagating flags");
                    }
                }
            }
        }
        actions
    }

    /// Enforce the slave's message cap: pick stable, unflagged, seen
    /// messages for expiration and journal the intent. The flags that make
    /// it happen go out with the regular flag batch.
    pub(crate) fn plan_expiration(&mut self) {
        let ops = self.chan.ops.slave;
        if !(ops.new || ops.renew || ops.flags) || self.chan.max_messages == 0 {
            return;
        }

        let mut excess = self.total.slave as i64 + self.progress.slave.new_total as i64
            - self.chan.max_messages as i64;
        debug!(excess, "scheduling excess messages for expiration");

        // Messages already deleted outside the expiration machinery will
        // vanish on their own.
        for mi in 0..self.msgs.slave.len() {
            if excess <= 0 {
                break;
            }
            let msg = &self.msgs.slave[mi];
            if msg.meta.dead {
                continue;
            }
            let Some(ri) = msg.srec else { continue };
            let rec = &self.recs[ri];
            let eff = (msg.meta.flags | rec.aflags.slave) - rec.dflags.slave;
            if eff.contains(Flags::TRASHED) && !(rec.expire || rec.expired) {
                excess -= 1;
            }
        }
        debug!(excess, "non-deleted excess messages");

        for mi in 0..self.msgs.slave.len() {
            let meta = self.msgs.slave[mi].meta;
            if meta.dead {
                continue;
            }
            match self.msgs.slave[mi].srec {
                Some(ri) if self.recs[ri].uid.master.uid().is_some() => {
                    let rec = &self.recs[ri];
                    let eff = (meta.flags | rec.aflags.slave) - rec.dflags.slave;
                    if !eff.contains(Flags::TRASHED) || rec.expire || rec.expired {
                        if eff.contains(Flags::FLAGGED) {
                            // Flagged messages are never expired but still
                            // count against the cap.
                            excess -= 1;
                        } else if (!meta.recent || meta.flags.contains(Flags::SEEN))
                            && (excess > 0
                                || (rec.expire && rec.expired)
                                || ((rec.expire || rec.expired)
                                    && meta.flags.contains(Flags::TRASHED)))
                        {
                            debug!(
                                uid_m = rec.uid.master.disk(),
                                uid_s = rec.uid.slave.disk(),
                                "  expiring pair"
                            );
                            self.recs[ri].nexpire = true;
                            excess -= 1;
                        }
                    }
                }
                _ => excess -= 1,
            }
        }
        debug!(excess, "excess messages remaining");

        for ri in 0..self.recs.len() {
            let rec = &self.recs[ri];
            if rec.dead || rec.done || rec.msg.slave.is_none() {
                continue;
            }
            let nex = rec.nexpire;
            if nex == rec.expired {
                continue;
            }
            if nex != rec.expire {
                let uid = rec.uid;
                debug!(
                    uid_m = uid.master.disk(),
                    uid_s = uid.slave.disk(),
                    expire = nex,
                    "  recording expire intent"
                );
                if let Some(j) = self.journal.as_mut() {
                    j.expire_intent(uid, nex);
                }
                self.recs[ri].expire = nex;
            } else {
                debug!(
                    uid_m = rec.uid.master.disk(),
                    uid_s = rec.uid.slave.disk(),
                    expire = nex,
                    "  expire transition still pending"
                );
            }
        }
    }

    /// Turn the accumulated per-record flag diffs into driver actions,
    /// folding in expire transitions and dropping updates the expunge will
    /// make moot.
    pub(crate) fn plan_flags(&mut self, boundary: usize) -> Vec<FlagAction> {
        debug!("synchronizing flags");
        let mut actions = Vec::new();
        for ri in 0..boundary {
            if self.recs[ri].dead || self.recs[ri].done {
                continue;
            }
            for t in Side::ALL {
                let rec = &self.recs[ri];
                let mut add = rec.aflags[t];
                let mut del = rec.dflags[t];
                if t == Side::Slave && rec.expire_transition() {
                    if rec.nexpire {
                        add |= Flags::TRASHED;
                    } else {
                        del |= Flags::TRASHED;
                    }
                }
                let msg_meta = rec.msg[t].map(|mi| self.msgs[t][mi].meta);
                let msg_flags = msg_meta.map(|m| m.flags).unwrap_or(Flags::NONE);
                if self.chan.ops[t].expunge
                    && ((msg_flags | add) - del).contains(Flags::TRASHED)
                    && (self.chan.stores[t].trash.is_none()
                        || self.chan.stores[t].trash_only_new)
                {
                    // The box gets expunged anyway; only the deletion is
                    // worth sending.
                    add = add & Flags::TRASHED;
                    del = Flags::NONE;
                    let rec = &mut self.recs[ri];
                    rec.aflags[t] = rec.aflags[t] & Flags::TRASHED;
                    rec.dflags[t] = Flags::NONE;
                }
                if let Some(m) = msg_meta {
                    if m.flags_known {
                        add = add - m.flags;
                        del = del & m.flags;
                    }
                }
                if add.is_empty() && del.is_empty() {
                    self.flags_applied(ri, t);
                } else {
                    self.progress[t].flags_total += 1;
                    self.stats();
                    actions.push(FlagAction {
                        ri,
                        side: t,
                        kind: FlagKind::Sync { add, del },
                    });
                }
            }
        }
        actions
    }

    /// With expired entries on file, the master is only partially loaded:
    /// compute the lowest master UID still worth looking at, plus the
    /// exception list of older UIDs whose pairs are still live. Fully
    /// orphaned expired entries are dropped along the way.
    pub(crate) fn prepare_master_window(&mut self) -> (u32, Vec<u32>) {
        debug!(smaxxuid = self.smaxxuid, "preparing master selection");
        let sx = self.smaxxuid as i64;
        let mut minwuid = i64::MAX;
        for rec in self.recs.iter_mut() {
            if rec.dead {
                continue;
            }
            if rec.expired {
                if rec.uid.slave.disk() == 0 || (self.opts.slave.old && rec.msg.slave.is_none()) {
                    rec.exp_orphan = true;
                    continue;
                }
            } else if sx >= rec.uid.slave.disk() {
                continue;
            }
            if minwuid > rec.uid.master.disk() {
                minwuid = rec.uid.master.disk();
            }
        }
        debug!(minwuid, "min non-orphaned master uid");

        let mut excludes = Vec::new();
        for ri in 0..self.recs.len() {
            if self.recs[ri].dead {
                continue;
            }
            let uid = self.recs[ri].uid;
            let uid_m = uid.master.disk();
            if self.recs[ri].exp_orphan {
                if minwuid > uid_m && self.maxuid.master as i64 >= uid_m {
                    debug!(
                        uid_m,
                        uid_s = uid.slave.disk(),
                        "  killing fully expired pair"
                    );
                    self.kill_rec(ri);
                } else if uid.slave.disk() != 0 {
                    debug!(uid_m, uid_s = uid.slave.disk(), "  orphaning slave side");
                    self.resolve_uid(ri, Side::Slave, UidSlot::Absent);
                }
            } else if minwuid > uid_m {
                if uid.slave.is_placeholder() {
                    if self.maxuid.master as i64 >= uid_m {
                        debug!(uid_m, uid_s = uid.slave.disk(), "  killing stale pair");
                        self.kill_rec(ri);
                    }
                } else if uid_m > 0
                    && uid.slave.disk() != 0
                    && self.opts.master.old
                    && (!self.opts.master.new || self.maxuid.master as i64 >= uid_m)
                {
                    excludes.push(uid_m as u32);
                }
            }
        }
        debug!(?excludes, "master exception list");

        let minwuid = if minwuid == i64::MAX {
            u32::MAX
        } else {
            minwuid.clamp(1, u32::MAX as i64) as u32
        };
        (minwuid, excludes)
    }
}
