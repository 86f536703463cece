use assert_cmd::prelude::*;
use nostr::{nips::nip19::ToBech32, EventBuilder, JsonUtil, Keys, Timestamp};
use std::{fs, path::Path, process::Command};
use tempfile::TempDir;

fn haven(dir: &Path, owner: &Keys) -> Command {
    let mut cmd = Command::cargo_bin("haven").unwrap();
    cmd.current_dir(dir)
        .env_clear()
        .env("OWNER_NPUB", owner.public_key().to_bech32().unwrap())
        .env("RELAY_URL", "relay.test")
        .env("HAVEN_LOG_LEVEL", "error");
    cmd
}

/// A few signed events, two sharing a timestamp.
fn fixture_jsonl(owner: &Keys) -> String {
    let mut lines = Vec::new();
    for (content, created_at) in [("one", 100u64), ("two", 200), ("three", 200), ("four", 300)] {
        let ev = EventBuilder::text_note(content)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(owner)
            .unwrap();
        lines.push(ev.as_json());
    }
    lines.join("\n") + "\n"
}

#[test]
fn missing_owner_npub_fails() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("haven").unwrap();
    cmd.current_dir(dir.path())
        .env_clear()
        .env("RELAY_URL", "relay.test")
        .arg("backup");
    cmd.assert().failure();
}

#[test]
fn help_prints_subcommands() {
    Command::cargo_bin("haven")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn restore_then_backup_single_store_roundtrips() {
    let dir = TempDir::new().unwrap();
    let owner = Keys::generate();
    let jsonl = fixture_jsonl(&owner);
    fs::write(dir.path().join("seed.jsonl"), &jsonl).unwrap();

    haven(dir.path(), &owner)
        .args(["restore", "-r", "outbox", "-i", "seed.jsonl"])
        .assert()
        .success();

    haven(dir.path(), &owner)
        .args(["backup", "-r", "outbox", "-o", "export.jsonl"])
        .assert()
        .success();

    let exported = fs::read_to_string(dir.path().join("export.jsonl")).unwrap();
    let mut want: Vec<&str> = jsonl.lines().collect();
    let mut got: Vec<&str> = exported.lines().collect();
    want.sort_unstable();
    got.sort_unstable();
    assert_eq!(got, want);

    // Replaying the export adds nothing and does not fail.
    haven(dir.path(), &owner)
        .args(["restore", "-r", "outbox", "-i", "export.jsonl"])
        .assert()
        .success();
    haven(dir.path(), &owner)
        .args(["backup", "-r", "outbox", "-o", "export2.jsonl"])
        .assert()
        .success();
    let again = fs::read_to_string(dir.path().join("export2.jsonl")).unwrap();
    assert_eq!(exported, again);
}

#[test]
fn archive_roundtrip_is_byte_identical() {
    let owner = Keys::generate();

    let first = TempDir::new().unwrap();
    fs::write(first.path().join("seed.jsonl"), fixture_jsonl(&owner)).unwrap();
    haven(first.path(), &owner)
        .args(["restore", "-r", "outbox", "-i", "seed.jsonl"])
        .assert()
        .success();
    haven(first.path(), &owner)
        .args(["backup", "-o", "haven.zip"])
        .assert()
        .success();
    let archive = fs::read(first.path().join("haven.zip")).unwrap();

    // A different host restores the archive and produces the same bytes.
    let second = TempDir::new().unwrap();
    fs::write(second.path().join("haven.zip"), &archive).unwrap();
    haven(second.path(), &owner)
        .args(["restore", "-i", "haven.zip"])
        .assert()
        .success();
    haven(second.path(), &owner)
        .args(["backup", "-o", "again.zip"])
        .assert()
        .success();
    let again = fs::read(second.path().join("again.zip")).unwrap();
    assert_eq!(archive, again);
}

#[test]
fn backup_rejects_unknown_relay() {
    let dir = TempDir::new().unwrap();
    let owner = Keys::generate();
    haven(dir.path(), &owner)
        .args(["backup", "-r", "nonsense"])
        .assert()
        .failure();
}
