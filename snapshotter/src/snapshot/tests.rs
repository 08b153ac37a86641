use super::manager::{DiffId, NaiveSnapshotter, SnapshotError, TransactionState};
use super::CancelToken;
use crate::infrastructure::config::StorageSettings;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

struct Fixture {
    temp: TempDir,
    manager: NaiveSnapshotter,
}

impl Fixture {
    fn new() -> anyhow::Result<Self> {
        let temp = tempdir()?;
        let manager = NaiveSnapshotter::open(temp.path().join("store"))?;
        Ok(Self { temp, manager })
    }

    fn checkout(&self, name: &str) -> PathBuf {
        self.temp.path().join("checkouts").join(name)
    }

    fn reopen(self) -> anyhow::Result<Self> {
        let Self { temp, manager } = self;
        drop(manager);
        let manager = NaiveSnapshotter::open(temp.path().join("store"))?;
        Ok(Self { temp, manager })
    }

    fn transaction_dirs(&self) -> anyhow::Result<usize> {
        Ok(fs::read_dir(self.manager.root().join("active"))?.count())
    }
}

fn id(name: &str) -> DiffId {
    DiffId::new(name).unwrap()
}

fn commit_base(fixture: &Fixture, name: &str, files: &[(&str, &str)]) -> anyhow::Result<()> {
    let dst = fixture.checkout(&format!("{name}-build"));
    fixture.manager.prepare(&dst, None)?;
    for (path, content) in files {
        let file = dst.join(path);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(file, content)?;
    }
    fixture.manager.commit(&id(name), &dst)?;
    Ok(())
}

#[test]
fn test_prepare_base_creates_destination() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let dst = fixture.checkout("base");

    let mounts = fixture.manager.prepare(&dst, None)?;

    assert!(mounts.is_empty());
    assert!(dst.is_dir());
    assert_eq!(fixture.manager.active_count(), 1);
    assert_eq!(fixture.transaction_dirs()?, 1);
    Ok(())
}

#[test]
fn test_round_trip() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let dst1 = fixture.checkout("one");
    fixture.manager.prepare(&dst1, None)?;
    fs::write(dst1.join("f"), "x")?;
    fixture.manager.commit(&id("L1"), &dst1)?;

    let dst2 = fixture.checkout("two");
    fixture.manager.prepare(&dst2, Some(&id("L1")))?;

    assert_eq!(fs::read_to_string(dst2.join("f"))?, "x");
    assert_eq!(fixture.manager.parent(&id("L1"))?, None);
    Ok(())
}

#[test]
fn test_chain_records_parent() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(&fixture, "L1", &[("a.txt", "a")])?;

    let dst = fixture.checkout("derived");
    fixture.manager.prepare(&dst, Some(&id("L1")))?;
    fs::write(dst.join("b.txt"), "b")?;
    fixture.manager.commit(&id("L2"), &dst)?;

    assert_eq!(fixture.manager.parent(&id("L2"))?, Some(id("L1")));
    assert_eq!(fixture.manager.chain(&id("L2"))?, vec![id("L2"), id("L1")]);

    let content = fixture
        .manager
        .diff_path(&id("L2"))
        .ok_or_else(|| anyhow::anyhow!("diff path missing"))?;
    assert_eq!(fs::read_to_string(content.join("a.txt"))?, "a");
    assert_eq!(fs::read_to_string(content.join("b.txt"))?, "b");
    Ok(())
}

#[test]
fn test_prepare_copies_parent_byte_for_byte() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(
        &fixture,
        "L1",
        &[("etc/hosts", "127.0.0.1 localhost\n"), ("bin/tool", "\u{0}\u{1}binary")],
    )?;

    let dst = fixture.checkout("copy");
    fixture.manager.prepare(&dst, Some(&id("L1")))?;

    assert_eq!(
        super::hashing::compute_directory_hash(&dst)?,
        fixture.manager.digest(&id("L1"))?
    );
    Ok(())
}

#[test]
fn test_prepare_unknown_parent_has_no_side_effects() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let dst = fixture.checkout("orphan");

    let result = fixture.manager.prepare(&dst, Some(&id("missing")));

    assert!(matches!(result, Err(SnapshotError::UnknownParent(_))));
    assert!(!dst.exists());
    assert_eq!(fixture.transaction_dirs()?, 0);
    assert_eq!(fixture.manager.active_count(), 0);
    Ok(())
}

#[test]
fn test_prepare_duplicate_destination() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let dst = fixture.checkout("dup");
    fixture.manager.prepare(&dst, None)?;

    let result = fixture.manager.prepare(&dst, None);
    assert!(matches!(result, Err(SnapshotError::TransactionExists(_))));

    // A different spelling of the same directory is the same transaction.
    let alias = dst.join("..").join("dup");
    let result = fixture.manager.prepare(&alias, None);
    assert!(matches!(result, Err(SnapshotError::TransactionExists(_))));

    assert_eq!(fixture.transaction_dirs()?, 1);
    Ok(())
}

#[test]
fn test_commit_twice_is_unknown_transaction() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let dst = fixture.checkout("once");
    fixture.manager.prepare(&dst, None)?;
    fixture.manager.commit(&id("L1"), &dst)?;

    let result = fixture.manager.commit(&id("L2"), &dst);

    let err = result.unwrap_err();
    assert!(matches!(err, SnapshotError::UnknownTransaction(_)));
    assert!(err.to_string().contains("once"));
    assert!(matches!(
        fixture.manager.parent(&id("L2")),
        Err(SnapshotError::DiffNotFound(_))
    ));
    Ok(())
}

#[test]
fn test_commit_existing_diff_keeps_transaction() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(&fixture, "L1", &[])?;

    let dst = fixture.checkout("again");
    fixture.manager.prepare(&dst, None)?;
    fs::write(dst.join("file.txt"), "content")?;

    let result = fixture.manager.commit(&id("L1"), &dst);
    assert!(matches!(result, Err(SnapshotError::DiffAlreadyExists(_))));

    let active = fixture.manager.list_active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].state(), TransactionState::Ready);

    // The caller can retry under another id.
    fixture.manager.commit(&id("L1b"), &dst)?;
    assert_eq!(fixture.manager.parent(&id("L1b"))?, None);
    Ok(())
}

#[test]
fn test_commit_existing_directory_on_disk() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    fs::create_dir_all(fixture.manager.root().join("diffs/taken"))?;

    let dst = fixture.checkout("blocked");
    fixture.manager.prepare(&dst, None)?;

    let result = fixture.manager.commit(&id("taken"), &dst);
    assert!(matches!(result, Err(SnapshotError::DiffAlreadyExists(_))));
    assert_eq!(fixture.manager.active_count(), 1);
    Ok(())
}

#[test]
fn test_commit_capture_failure_keeps_transaction() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let dst = fixture.checkout("vanishing");
    fixture.manager.prepare(&dst, None)?;
    fs::remove_dir_all(&dst)?;

    let result = fixture.manager.commit(&id("L1"), &dst);
    assert!(matches!(result, Err(SnapshotError::Io { .. })));
    assert_eq!(fixture.manager.active_count(), 1);
    assert!(fixture.manager.parent(&id("L1")).is_err());

    // Retrying after the destination is back succeeds.
    fs::create_dir_all(&dst)?;
    fs::write(dst.join("f"), "restored")?;
    fixture.manager.commit(&id("L1"), &dst)?;
    assert_eq!(fixture.manager.active_count(), 0);
    Ok(())
}

#[test]
fn test_rollback_removes_metadata_but_keeps_destination() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(&fixture, "L1", &[("file1.txt", "original")])?;

    let dst = fixture.checkout("scratch");
    fixture.manager.prepare(&dst, Some(&id("L1")))?;
    fs::write(dst.join("file1.txt"), "modified")?;
    fs::write(dst.join("new.txt"), "created")?;

    fixture.manager.rollback(&dst)?;

    assert_eq!(fixture.transaction_dirs()?, 0);
    assert_eq!(fixture.manager.active_count(), 0);
    assert_eq!(fs::read_to_string(dst.join("file1.txt"))?, "modified");
    assert_eq!(fs::read_to_string(dst.join("new.txt"))?, "created");

    // The parent layer is unaffected.
    let parent = fixture
        .manager
        .diff_path(&id("L1"))
        .ok_or_else(|| anyhow::anyhow!("diff path missing"))?;
    assert_eq!(fs::read_to_string(parent.join("file1.txt"))?, "original");
    Ok(())
}

#[test]
fn test_rollback_nonexistent_transaction() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;

    let result = fixture.manager.rollback(Path::new("/nonexistent/checkout"));

    assert!(matches!(result, Err(SnapshotError::UnknownTransaction(_))));
    Ok(())
}

#[test]
fn test_destination_can_be_reused_after_rollback() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let dst = fixture.checkout("reuse");
    fixture.manager.prepare(&dst, None)?;
    fixture.manager.rollback(&dst)?;

    fixture.manager.prepare(&dst, None)?;
    assert_eq!(fixture.manager.active_count(), 1);
    Ok(())
}

#[test]
fn test_parent_of_unknown_diff() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(&fixture, "base", &[])?;

    assert_eq!(fixture.manager.parent(&id("base"))?, None);
    assert!(matches!(
        fixture.manager.parent(&id("ghost")),
        Err(SnapshotError::DiffNotFound(_))
    ));
    assert!(fixture.manager.diff_path(&id("ghost")).is_none());
    Ok(())
}

#[test]
fn test_prepare_cancelled_cleans_up() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(&fixture, "L1", &[("a.txt", "a")])?;

    let token = CancelToken::new();
    token.cancel();
    let dst = fixture.checkout("cancelled");
    let result = fixture
        .manager
        .prepare_with_cancel(&dst, Some(&id("L1")), &token);

    assert!(matches!(result, Err(SnapshotError::Cancelled(_))));
    assert_eq!(fixture.transaction_dirs()?, 0);
    assert_eq!(fixture.manager.active_count(), 0);
    Ok(())
}

#[test]
fn test_prepare_missing_parent_content_cleans_up() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(&fixture, "L1", &[("a.txt", "a")])?;
    let content = fixture
        .manager
        .diff_path(&id("L1"))
        .ok_or_else(|| anyhow::anyhow!("diff path missing"))?;
    fs::remove_dir_all(content)?;

    let dst = fixture.checkout("broken");
    let result = fixture.manager.prepare(&dst, Some(&id("L1")));

    assert!(matches!(result, Err(SnapshotError::Io { .. })));
    assert_eq!(fixture.transaction_dirs()?, 0);
    assert_eq!(fixture.manager.active_count(), 0);
    Ok(())
}

#[test]
fn test_prepare_inside_store_rejected() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let dst = fixture.manager.root().join("active").join("sneaky");

    let result = fixture.manager.prepare(&dst, None);

    assert!(matches!(result, Err(SnapshotError::PolicyViolation(_))));
    assert_eq!(fixture.transaction_dirs()?, 0);
    Ok(())
}

#[test]
fn test_prepare_respects_allowed_destinations() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let allowed = temp.path().join("allowed");
    fs::create_dir(&allowed)?;

    let settings = StorageSettings {
        allowed_destinations: vec![allowed.to_string_lossy().to_string()],
        ..StorageSettings::with_root(temp.path().join("store"))
    };
    let manager = NaiveSnapshotter::new(&settings)?;

    assert!(manager.prepare(&allowed.join("ok"), None).is_ok());
    assert!(matches!(
        manager.prepare(&temp.path().join("forbidden"), None),
        Err(SnapshotError::PolicyViolation(_))
    ));
    Ok(())
}

#[test]
fn test_reopen_recovers_state() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(&fixture, "L1", &[("f", "x")])?;
    let dst = fixture.checkout("pending");
    fixture.manager.prepare(&dst, Some(&id("L1")))?;
    fs::write(dst.join("g"), "y")?;

    let fixture = fixture.reopen()?;

    let report = fixture.manager.last_recovery();
    assert_eq!(report.diffs_indexed, 1);
    assert_eq!(report.transactions_restored, 1);
    assert_eq!(fixture.manager.parent(&id("L1"))?, None);

    let active = fixture.manager.list_active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].parent(), Some(&id("L1")));

    fixture.manager.commit(&id("L2"), &dst)?;
    assert_eq!(fixture.manager.parent(&id("L2"))?, Some(id("L1")));
    Ok(())
}

#[test]
fn test_open_rejects_file_root() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let root = temp.path().join("not-a-dir");
    fs::write(&root, "")?;

    let result = NaiveSnapshotter::open(&root);
    assert!(matches!(result, Err(SnapshotError::Storage { .. })));
    Ok(())
}

#[test]
fn test_list_diffs_is_sorted() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(&fixture, "b", &[])?;
    commit_base(&fixture, "a", &[])?;

    let diffs = fixture.manager.list_diffs();
    assert_eq!(diffs, vec![(id("a"), None), (id("b"), None)]);
    Ok(())
}

#[test]
fn test_prepare_does_not_follow_symlinks_in_destination() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    commit_base(&fixture, "L1", &[("sub/payload.txt", "layer")])?;

    let outside = fixture.temp.path().join("outside");
    fs::create_dir(&outside)?;
    let dst = fixture.checkout("trap");
    fs::create_dir_all(&dst)?;
    std::os::unix::fs::symlink(&outside, dst.join("sub"))?;

    fixture.manager.prepare(&dst, Some(&id("L1")))?;

    assert!(!fs::symlink_metadata(dst.join("sub"))?.file_type().is_symlink());
    assert_eq!(fs::read_to_string(dst.join("sub/payload.txt"))?, "layer");
    assert!(!outside.join("payload.txt").exists());
    Ok(())
}
