//! Pairing loaded messages with sync records, by UID and by TUID.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::{SideMsg, SyncEngine};
use crate::driver::MsgMeta;
use crate::types::{Flags, Side, UidSlot};

impl SyncEngine {
    /// Cross-link freshly loaded messages with the records that already
    /// know their UID. Messages located by TUID beforehand are left alone.
    pub(crate) fn pair_by_uid(&mut self, t: Side) {
        debug!(side = t.label(), "matching messages against sync records");
        let mut by_uid: HashMap<u32, usize> = HashMap::with_capacity(self.recs.len());
        for (ri, rec) in self.recs.iter().enumerate() {
            if rec.dead {
                continue;
            }
            if let Some(uid) = rec.uid[t].uid() {
                by_uid.insert(uid, ri);
            }
        }
        for mi in 0..self.msgs[t].len() {
            if self.msgs[t][mi].srec.is_some() {
                continue;
            }
            let uid = self.msgs[t][mi].meta.uid;
            match by_uid.get(&uid) {
                Some(&ri) => {
                    self.msgs[t][mi].srec = Some(ri);
                    self.recs[ri].msg[t] = Some(mi);
                    debug!(uid, pairs = self.recs[ri].uid[t.other()].disk(), "  paired");
                }
                None => debug!(uid, flags = %self.msgs[t][mi].meta.flags, "  new"),
            }
        }
    }

    /// Locate just-copied messages through their `X-TUID:` tags. Copies in
    /// sequence land adjacently, so the scan resumes where the last match
    /// left off before wrapping around. A tag that cannot be found means
    /// the copy is lost and will be redone.
    pub(crate) fn match_tuids(&mut self, t: Side) {
        let mut cursor = 0usize;
        let mut lost = 0usize;
        for ri in 0..self.recs.len() {
            if self.recs[ri].dead {
                continue;
            }
            let Some(tuid) = self.recs[ri].uid[t].tuid() else {
                continue;
            };
            debug!(
                uid_m = self.recs[ri].uid.master.disk(),
                uid_s = self.recs[ri].uid.slave.disk(),
                side = t.label(),
                tuid = %tuid,
                "TUID lookup"
            );
            let n = self.msgs[t].len();
            let mut found = None;
            for mi in cursor..n {
                let m = &self.msgs[t][mi];
                if m.meta.dead {
                    continue;
                }
                if m.meta.tuid == Some(tuid) {
                    found = Some((mi, if mi == cursor { "adjacently" } else { "after gap" }));
                    break;
                }
            }
            if found.is_none() {
                for mi in 0..cursor.min(n) {
                    let m = &self.msgs[t][mi];
                    if m.meta.dead {
                        continue;
                    }
                    if m.meta.tuid == Some(tuid) {
                        found = Some((mi, "after reset"));
                        break;
                    }
                }
            }
            match found {
                Some((mi, diag)) => {
                    let new_uid = self.msgs[t][mi].meta.uid;
                    debug!(uid = new_uid, diag, "  found");
                    self.resolve_uid(ri, t, UidSlot::Uid(new_uid));
                    self.msgs[t][mi].srec = Some(ri);
                    self.recs[ri].msg[t] = Some(mi);
                    cursor = mi + 1;
                }
                None => {
                    debug!("  TUID lost");
                    let uid = self.recs[ri].uid;
                    if let Some(j) = self.journal.as_mut() {
                        j.tuid_lost(uid);
                    }
                    self.recs[ri].flags = Flags::NONE;
                    self.recs[ri].uid[t] = UidSlot::Pending(None);
                    lost += 1;
                }
            }
        }
        if lost > 0 {
            warn!(count = lost, dir = t.dir(), "lost track of copied messages");
            self.lost += lost;
        }
    }

    /// Fold messages discovered by `find_new` into the side's message list
    /// so the TUID scan can see them.
    pub(crate) fn absorb_found(&mut self, t: Side, found: Vec<MsgMeta>) {
        for meta in found {
            if self.msgs[t].iter().any(|m| m.meta.uid == meta.uid) {
                continue;
            }
            self.msgs[t].push(SideMsg { meta, srec: None });
        }
    }
}
