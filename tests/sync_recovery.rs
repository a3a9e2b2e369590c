mod common;

use std::fs;

use common::{msg, ops, Fixture};
use mbmirror::types::{Flags, Pair, Tuid, UidSlot};

#[tokio::test]
async fn withheld_uids_are_recovered_through_tuids() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    fx.slave.withhold_uids(true).await;
    fx.master.append(&msg("a"), Flags::NONE).await;
    fx.master.append(&msg("b"), Flags::NONE).await;

    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(report.lost_tuids, 0);
    assert_eq!(fx.slave.uids().await.len(), 2);

    let st = fx.loaded();
    assert_eq!(st.recs.len(), 2);
    for rec in &st.recs {
        assert!(
            rec.uid.slave.uid().is_some(),
            "TUID search must have resolved the slave UID"
        );
    }
}

/// A run died right after journaling the TUID: the copy reached the slave,
/// but the UID resolution was never recorded. The restarted run must find
/// the message by its tag instead of copying it again.
#[tokio::test]
async fn interrupted_copy_is_found_not_duplicated() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    fx.master.append(&msg("first"), Flags::NONE).await;
    assert!(fx.run().await.status.ok());

    let second = fx.master.append(&msg("second"), Flags::NONE).await;
    let tuid = Tuid::random();

    // What the dead run left behind: a journaled pair with a TUID, the
    // new-state marker, and the copy sitting on the slave.
    let paths = fx.state_paths();
    fs::write(
        &paths.journal,
        format!("2\n}} 2\n+ {second} -2\n# {second} -2 {tuid}\n"),
    )
    .unwrap();
    fs::write(&paths.new, "").unwrap();
    fx.slave
        .append(
            format!("From: someone@example.org\nX-TUID: {tuid}\nSubject: second\n\nhello there\n")
                .as_bytes(),
            Flags::NONE,
        )
        .await;

    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(report.lost_tuids, 0);
    assert_eq!(report.progress.slave.new_total, 0, "no duplicate copy");
    assert_eq!(fx.slave.uids().await.len(), 2);

    let st = fx.loaded();
    assert_eq!(st.recs.len(), 2);
    assert!(st
        .recs
        .iter()
        .all(|r| r.uid.master.uid().is_some() && r.uid.slave.uid().is_some()));
    assert!(!paths.journal.exists());
}

/// Same crash, but the copy never made it: the TUID search comes up empty,
/// the record is written off, and the message is copied afresh.
#[tokio::test]
async fn lost_copy_is_redone() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    fx.master.append(&msg("first"), Flags::NONE).await;
    assert!(fx.run().await.status.ok());

    let second = fx.master.append(&msg("second"), Flags::NONE).await;
    let tuid = Tuid::random();
    let paths = fx.state_paths();
    fs::write(
        &paths.journal,
        format!("2\n}} 2\n+ {second} -2\n# {second} -2 {tuid}\n"),
    )
    .unwrap();
    fs::write(&paths.new, "").unwrap();

    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(report.lost_tuids, 1);
    assert_eq!(report.progress.slave.new_done, 1, "the copy was redone");
    assert_eq!(fx.slave.uids().await.len(), 2);
    assert!(fx
        .loaded()
        .recs
        .iter()
        .all(|r| r.uid.master.uid().is_some() && r.uid.slave.uid().is_some()));
}

/// The destination rewrote the message and dropped our tag: the record
/// stays pending on disk and the loss is reported.
#[tokio::test]
async fn stripped_tuid_is_reported_lost() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    fx.slave.withhold_uids(true).await;
    fx.slave.strip_tuids(true).await;
    fx.master.append(&msg("fragile"), Flags::NONE).await;

    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(report.lost_tuids, 1);

    let st = fx.loaded();
    assert_eq!(st.recs.len(), 1);
    assert_eq!(st.recs[0].uid.slave, UidSlot::Pending(None));
    assert_eq!(st.recs[0].flags, Flags::NONE);
}

/// With the journal kept, the run leaves its journal and new-state file in
/// place; replaying them later converges on the same committed state the
/// rename would have produced.
#[tokio::test]
async fn kept_journal_replays_to_the_same_state() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    fx.settings.keep_journal = true;
    fx.master.append(&msg("solo"), Flags::NONE).await;

    assert!(fx.run().await.status.ok());
    let paths = fx.state_paths();
    assert!(paths.journal.exists());
    assert!(paths.new.exists());
    assert!(!paths.state.exists());

    // The journal alone reconstructs the run's outcome.
    let st = fx.loaded();
    assert!(st.replayed);
    assert_eq!(st.recs.len(), 1);
    assert!(st.recs[0].uid.master.uid().is_some());
    assert!(st.recs[0].uid.slave.uid().is_some());

    // A regular run recovers from those files without duplicating the copy.
    fx.settings.keep_journal = false;
    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(report.progress.slave.new_total, 0);
    assert_eq!(fx.slave.uids().await.len(), 1);
    assert!(paths.state.exists());
    assert!(!paths.journal.exists());
    assert!(!paths.new.exists());
}

/// Replaying the same files twice yields the same in-memory state.
#[tokio::test]
async fn journal_replay_is_repeatable() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    fx.settings.keep_journal = true;
    fx.master.append(&msg("a"), Flags::SEEN).await;
    fx.master.append(&msg("b"), Flags::NONE).await;
    assert!(fx.run().await.status.ok());

    let once = fx.loaded();
    let twice = fx.loaded();
    assert_eq!(once.recs.len(), twice.recs.len());
    assert_eq!(once.maxuid, twice.maxuid);
    assert_eq!(once.uidval, twice.uidval);
    assert_eq!(once.smaxxuid, twice.smaxxuid);
    for (a, b) in once.recs.iter().zip(twice.recs.iter()) {
        assert_eq!(a.uid, b.uid);
        assert_eq!(a.flags, b.flags);
        assert_eq!(a.dead, b.dead);
        assert_eq!(a.expired, b.expired);
    }
}

#[tokio::test]
async fn per_message_store_refusal_kills_only_that_record() {
    let mut fx = Fixture::new();
    // Flag sync keeps old messages loaded, so the next run can re-propose
    // the refused one.
    fx.chan.ops = Pair::new(ops(true, true, false, false), ops(true, true, false, false));
    fx.master.append(&msg("a"), Flags::NONE).await;
    fx.master.append(&msg("b"), Flags::NONE).await;
    fx.master.append(&msg("c"), Flags::NONE).await;
    fx.slave.refuse_stores(1).await;

    let report = fx.run().await;
    assert!(report.status.ok(), "per-message trouble must not fail the channel");
    assert_eq!(fx.slave.uids().await.len(), 2);
    let st = fx.loaded();
    assert_eq!(st.recs.iter().filter(|r| r.live()).count(), 2);

    // The next run re-proposes the refused message.
    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(fx.slave.uids().await.len(), 3);
    assert_eq!(report.progress.slave.new_done, 1);
}
