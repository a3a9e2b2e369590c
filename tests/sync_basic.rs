mod common;

use common::{msg, ops, Fixture};
use mbmirror::types::{Flags, Pair, UidSlot};

#[tokio::test]
async fn initial_sync_populates_empty_slave() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    for i in 1..=3u32 {
        fx.master.append(&msg(&format!("m{i}")), Flags::NONE).await;
    }

    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(report.progress.slave.new_done, 3);
    assert_eq!(fx.slave.uids().await.len(), 3);

    let st = fx.loaded();
    assert_eq!(st.recs.len(), 3);
    for rec in &st.recs {
        assert!(rec.uid.master.uid().is_some());
        assert!(rec.uid.slave.uid().is_some());
        assert!(!rec.expired);
    }
    assert_eq!(st.uidval, Pair::new(Some(1), Some(1)));
    assert_eq!(st.maxuid.master, 3);
    // Nothing was ever propagated out of the slave.
    assert_eq!(st.maxuid.slave, 0);
    assert_eq!(st.smaxxuid, 0);
    assert!(!fx.state_paths().journal.exists());
    assert!(!fx.state_paths().new.exists());

    // A second run has nothing to do.
    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(report.progress.slave.new_total, 0);
    assert_eq!(fx.slave.uids().await.len(), 3);
}

#[tokio::test]
async fn copied_messages_carry_a_tuid_header() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    fx.master.append(&msg("tagged"), Flags::NONE).await;

    assert!(fx.run().await.status.ok());

    let uid = fx.slave.uids().await[0];
    let body = fx.slave.body_of(uid).await.unwrap();
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("\nX-TUID: "), "stored copy lost its tag: {text}");
}

#[tokio::test]
async fn flag_changes_propagate_both_ways() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, true, false, false), ops(true, true, false, false));
    let m_uid = fx.master.append(&msg("one"), Flags::NONE).await;
    assert!(fx.run().await.status.ok());
    let s_uid = fx.slave.uids().await[0];

    fx.master.mark(m_uid, Flags::SEEN, Flags::NONE).await;
    assert!(fx.run().await.status.ok());
    assert!(fx.slave.flags_of(s_uid).await.unwrap().contains(Flags::SEEN));

    fx.slave.mark(s_uid, Flags::FLAGGED, Flags::NONE).await;
    assert!(fx.run().await.status.ok());
    let mflags = fx.master.flags_of(m_uid).await.unwrap();
    assert!(mflags.contains(Flags::SEEN));
    assert!(mflags.contains(Flags::FLAGGED));

    // The record converged on the same flag set as both messages.
    let st = fx.loaded();
    assert_eq!(st.recs.len(), 1);
    assert_eq!(st.recs[0].flags, Flags::SEEN | Flags::FLAGGED);
}

#[tokio::test]
async fn flag_removal_propagates() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, true, false, false), ops(true, true, false, false));
    let m_uid = fx.master.append(&msg("one"), Flags::SEEN).await;
    assert!(fx.run().await.status.ok());
    let s_uid = fx.slave.uids().await[0];
    assert!(fx.slave.flags_of(s_uid).await.unwrap().contains(Flags::SEEN));

    fx.master.mark(m_uid, Flags::NONE, Flags::SEEN).await;
    assert!(fx.run().await.status.ok());
    assert!(!fx.slave.flags_of(s_uid).await.unwrap().contains(Flags::SEEN));
}

#[tokio::test]
async fn deletion_propagates_and_expunges() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, true, true));
    fx.master.append(&msg("keep"), Flags::NONE).await;
    let gone = fx.master.append(&msg("gone"), Flags::NONE).await;
    assert!(fx.run().await.status.ok());
    assert_eq!(fx.slave.uids().await.len(), 2);

    // Master side expunged the message behind our back.
    fx.master.remove(gone).await;
    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(report.progress.slave.flags_done, 1);

    assert_eq!(fx.slave.uids().await.len(), 1);
    let st = fx.loaded();
    assert_eq!(st.recs.iter().filter(|r| r.live()).count(), 1);
}

#[tokio::test]
async fn deletion_without_ops_leaves_slave_alone() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    let m_uid = fx.master.append(&msg("round trip"), Flags::NONE).await;
    assert!(fx.run().await.status.ok());
    assert_eq!(fx.slave.uids().await.len(), 1);

    fx.master.remove(m_uid).await;
    assert!(fx.run().await.status.ok());
    assert_eq!(fx.slave.uids().await.len(), 1, "slave must keep its copy");
}

#[tokio::test]
async fn uidvalidity_change_aborts_channel() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    fx.master.append(&msg("one"), Flags::NONE).await;
    assert!(fx.run().await.status.ok());
    let before = std::fs::read_to_string(&fx.state_paths().state).unwrap();

    fx.slave.set_uidvalidity(7).await;
    fx.master.append(&msg("two"), Flags::NONE).await;
    let report = fx.run().await;
    assert!(report.status.failed);

    // State untouched, nothing moved.
    let after = std::fs::read_to_string(&fx.state_paths().state).unwrap();
    assert_eq!(before, after);
    assert_eq!(fx.slave.uids().await.len(), 1);
}

#[tokio::test]
async fn oversize_messages_are_skipped_until_renew() {
    let mut fx = Fixture::new();
    fx.chan.stores.slave.max_size = Some(64);
    fx.chan.ops = Pair::new(ops(false, false, false, false), ops(true, false, false, false));
    fx.master.append(&msg("small"), Flags::NONE).await;
    let big_body = vec![b'x'; 512];
    let big = fx
        .master
        .append(&[b"Subject: big\n\n".as_slice(), &big_body].concat(), Flags::NONE)
        .await;

    assert!(fx.run().await.status.ok());
    assert_eq!(fx.slave.uids().await.len(), 1);
    let st = fx.loaded();
    let skipped = st
        .recs
        .iter()
        .find(|r| r.uid.master.uid() == Some(big))
        .expect("record for the oversize message");
    assert_eq!(skipped.uid.slave, UidSlot::Skipped);

    // Plain new-sync does not retry it.
    assert!(fx.run().await.status.ok());
    assert_eq!(fx.slave.uids().await.len(), 1);

    // Renew with a lifted limit does.
    fx.chan.stores.slave.max_size = None;
    fx.chan.ops.slave.renew = true;
    assert!(fx.run().await.status.ok());
    assert_eq!(fx.slave.uids().await.len(), 2);
    let st = fx.loaded();
    assert!(st
        .recs
        .iter()
        .all(|r| r.uid.slave.uid().is_some() && r.uid.master.uid().is_some()));
}

#[tokio::test]
async fn flagged_messages_ignore_the_size_limit() {
    let mut fx = Fixture::new();
    fx.chan.stores.slave.max_size = Some(16);
    fx.chan.ops = Pair::new(ops(false, false, false, false), ops(true, false, false, false));
    fx.master
        .append(&msg("large but flagged"), Flags::FLAGGED)
        .await;

    assert!(fx.run().await.status.ok());
    assert_eq!(fx.slave.uids().await.len(), 1);
}

#[tokio::test]
async fn deleted_messages_move_to_local_trash() {
    let mut fx = Fixture::new();
    fx.chan.stores.slave.trash = Some("Trash".into());
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, true, false, true));
    fx.master.append(&msg("a"), Flags::NONE).await;
    fx.master.append(&msg("b"), Flags::NONE).await;
    assert!(fx.run().await.status.ok());

    let s_uid = fx.slave.uids().await[0];
    fx.slave.mark(s_uid, Flags::TRASHED, Flags::NONE).await;
    let report = fx.run().await;
    assert!(report.status.ok());
    assert_eq!(report.progress.slave.trash_done, 1);
    assert_eq!(fx.slave.trash_len().await, 1);
    assert_eq!(fx.slave.uids().await.len(), 1);

    // The surviving side keeps the record, orphaned.
    let st = fx.loaded();
    let orphan = st
        .recs
        .iter()
        .filter(|r| r.live())
        .find(|r| r.uid.slave == UidSlot::Absent)
        .expect("orphaned record");
    assert!(orphan.uid.master.uid().is_some());
}

#[tokio::test]
async fn failing_trash_is_channel_fatal() {
    let mut fx = Fixture::new();
    fx.chan.stores.slave.trash = Some("Trash".into());
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, true, false, true));
    fx.master.append(&msg("a"), Flags::NONE).await;
    assert!(fx.run().await.status.ok());

    let s_uid = fx.slave.uids().await[0];
    fx.slave.mark(s_uid, Flags::TRASHED, Flags::NONE).await;
    fx.slave.refuse_trash(true).await;
    let report = fx.run().await;
    assert!(report.status.failed);
}

#[tokio::test]
async fn broken_store_reports_bad_side() {
    let mut fx = Fixture::new();
    fx.chan.ops = Pair::new(ops(true, false, false, false), ops(true, false, false, false));
    fx.master.append(&msg("one"), Flags::NONE).await;
    fx.slave.break_store();

    let report = fx.run().await;
    assert!(!report.status.ok());
    assert!(report.status.bad.slave);
    assert!(!report.status.bad.master);
    assert_eq!(report.status.as_bits() & 8, 8);
}
