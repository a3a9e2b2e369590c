use mbmirror::config::{Config, FsyncLevel};
use mbmirror::types::Side;

fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("mbmirror.toml");
    std::fs::write(&path, content).unwrap();
    (tmp, path)
}

#[test]
fn full_config_resolves_stores_and_channels() {
    let (_tmp, path) = write_config(
        r#"
sync_state = "/var/lib/mbmirror/"
fsync = "thorough"

[stores.local]
trash = "Trash"
trash_only_new = true
max_size = 1048576

[stores.server]
map_inbox = "Inbox"
flatten = "."

[[channels]]
name = "mail"
master = { store = "server", mailbox = "INBOX" }
slave = { store = "local" }
max_messages = 500
master_ops = { flags = true }
slave_ops = { new = true, flags = true, expunge = true }
"#,
    );

    let config = Config::load(&path).unwrap();
    assert_eq!(config.settings.sync_state, "/var/lib/mbmirror/");
    assert_eq!(config.settings.fsync, FsyncLevel::Thorough);
    assert_eq!(config.channels.len(), 1);

    let rc = &config.channels[0];
    assert_eq!(rc.chan.name, "mail");
    assert_eq!(rc.chan.max_messages, 500);
    assert_eq!(rc.chan.stores[Side::Master].name, "server");
    assert_eq!(rc.chan.stores[Side::Master].map_inbox.as_deref(), Some("Inbox"));
    assert_eq!(rc.chan.stores[Side::Slave].name, "local");
    assert_eq!(rc.chan.stores[Side::Slave].trash.as_deref(), Some("Trash"));
    assert!(rc.chan.stores[Side::Slave].trash_only_new);
    assert_eq!(rc.chan.stores[Side::Slave].max_size, Some(1048576));
    assert_eq!(rc.chan.stores[Side::Master].size_limit(), u64::MAX);

    assert!(rc.chan.ops[Side::Master].flags);
    assert!(!rc.chan.ops[Side::Master].new);
    assert!(rc.chan.ops[Side::Slave].new);
    assert!(rc.chan.ops[Side::Slave].expunge);
    assert!(rc.chan.active(Side::Slave));

    assert_eq!(rc.boxes[Side::Master].as_deref(), Some("INBOX"));
    assert_eq!(rc.boxes[Side::Slave], None);
}

#[test]
fn channels_must_reference_known_stores() {
    let (_tmp, path) = write_config(
        r#"
[[channels]]
name = "broken"
master = { store = "nowhere" }
slave = { store = "nowhere" }
"#,
    );
    let err = Config::load(&path).unwrap_err();
    assert!(err.to_string().contains("unknown store"), "{err:#}");
}

#[test]
fn empty_config_uses_defaults() {
    let (_tmp, path) = write_config("");
    let config = Config::load(&path).unwrap();
    assert_eq!(config.settings.fsync, FsyncLevel::Normal);
    assert!(config.channels.is_empty());
    assert!(!config.settings.keep_journal);
}

#[test]
fn unknown_keys_are_rejected() {
    let (_tmp, path) = write_config("surprise = true\n");
    assert!(Config::load(&path).is_err());
}
