//! Integration tests for batch (directory) mode.
//!
//! These run the scanner, claim manager and worker pool together against a
//! real temp directory and an in-memory object store.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{file_names, queue_file, MemoryStore, OrderedClaims};
use santa_sleigh::clock::{ManualClock, SystemClock};
use santa_sleigh::config::{DaemonConfig, KeyLayout, UploadMode};
use santa_sleigh::shipper::claim::{recover_stale_claims, ClaimManager, Disposal, RenameClaimManager};
use santa_sleigh::shipper::key::ObjectKeyBuilder;
use santa_sleigh::shipper::scanner::scan_queue;
use santa_sleigh::shipper::worker::{BatchError, FailureStage, WorkerPool};
use santa_sleigh::shipper::{Context, Daemon};

fn hour_ago() -> SystemTime {
    SystemTime::now() - Duration::from_secs(3600)
}

fn rename_claims(disposal: Disposal) -> RenameClaimManager {
    RenameClaimManager::new(Some(".partial"), disposal, Arc::new(SystemClock))
}

/// Two files, concurrency 2, both upload: queue ends empty and keys follow
/// the partitioned layout, dispatched oldest first
#[tokio::test]
async fn test_two_file_cycle() {
    let dir = TempDir::new().unwrap();
    let t = hour_ago();
    queue_file(dir.path(), "b.parquet", b"bbbb", t + Duration::from_secs(5));
    queue_file(dir.path(), "a.parquet", b"aaaa", t);

    let store = Arc::new(MemoryStore::new());
    let claims = Arc::new(OrderedClaims::new(rename_claims(Disposal::Delete)));
    let keys = ObjectKeyBuilder::new(Some("edr"), "Host-01", KeyLayout::Partitioned);
    let pool = WorkerPool::new(store.clone(), claims.clone(), keys, 2);

    let entries = scan_queue(dir.path(), Some(".partial")).await.unwrap();
    let report = pool.run(entries, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.shipped.len(), 2);
    assert!(file_names(dir.path()).is_empty());

    let claimed: Vec<_> = claims
        .order()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(claimed, vec!["a.parquet", "b.parquet"]);

    let objects = store.objects();
    let a_key = objects.keys().find(|k| k.ends_with("/a.parquet")).unwrap();
    let b_key = objects.keys().find(|k| k.ends_with("/b.parquet")).unwrap();
    assert!(a_key.starts_with("edr/hostname=host-01/date="));
    assert_eq!(objects[a_key], b"aaaa");
    assert_eq!(objects[b_key], b"bbbb");
}

#[tokio::test]
async fn test_failed_file_is_released_for_next_cycle() {
    let dir = TempDir::new().unwrap();
    let t = hour_ago();
    for (i, name) in ["a.parquet", "b.parquet", "c.parquet"].iter().enumerate() {
        queue_file(dir.path(), name, name.as_bytes(), t + Duration::from_secs(i as u64));
    }

    let store = Arc::new(MemoryStore::new().failing_on("b.parquet"));
    let pool = WorkerPool::new(
        store.clone(),
        Arc::new(rename_claims(Disposal::Delete)),
        ObjectKeyBuilder::new(None, "host", KeyLayout::Flat),
        2,
    );

    let entries = scan_queue(dir.path(), Some(".partial")).await.unwrap();
    let err = pool.run(entries, &CancellationToken::new()).await.unwrap_err();

    let batch = err.downcast_ref::<BatchError>().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.shipped, 2);
    assert_eq!(batch.failures[0].stage, FailureStage::Upload);
    assert!(batch.failures[0].path.ends_with("b.parquet"));

    // Only the failed file is left, under its original name, and the next
    // scan sees it again
    assert_eq!(file_names(dir.path()), vec!["b.parquet"]);
    let rescanned = scan_queue(dir.path(), Some(".partial")).await.unwrap();
    assert_eq!(rescanned.len(), 1);
}

#[tokio::test]
async fn test_archive_mode_moves_files() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("spool");
    let archive = dir.path().join("archive");
    fs::create_dir_all(&queue).unwrap();
    fs::create_dir_all(&archive).unwrap();
    fs::write(archive.join("a.parquet"), b"shipped yesterday").unwrap();
    queue_file(&queue, "a.parquet", b"today", hour_ago());

    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 29, 10, 0, 0).unwrap());
    let claims = RenameClaimManager::new(
        Some(".partial"),
        Disposal::Archive(archive.clone()),
        Arc::new(clock),
    );
    let pool = WorkerPool::new(
        Arc::new(MemoryStore::new()),
        Arc::new(claims),
        ObjectKeyBuilder::new(None, "host", KeyLayout::Flat),
        4,
    );

    let entries = scan_queue(&queue, Some(".partial")).await.unwrap();
    pool.run(entries, &CancellationToken::new()).await.unwrap();

    assert!(file_names(&queue).is_empty());
    assert_eq!(
        file_names(&archive),
        vec!["a-20240229T100000Z.parquet", "a.parquet"]
    );
    assert_eq!(fs::read(archive.join("a.parquet")).unwrap(), b"shipped yesterday");
    assert_eq!(fs::read(archive.join("a-20240229T100000Z.parquet")).unwrap(), b"today");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_uploads_never_exceed_limit() {
    let dir = TempDir::new().unwrap();
    let t = hour_ago();
    for i in 0..12 {
        queue_file(
            dir.path(),
            &format!("f{:02}.parquet", i),
            b"rows",
            t + Duration::from_secs(i),
        );
    }

    let store = Arc::new(MemoryStore::new().with_delay(Duration::from_millis(20)));
    let pool = WorkerPool::new(
        store.clone(),
        Arc::new(rename_claims(Disposal::Delete)),
        ObjectKeyBuilder::new(None, "host", KeyLayout::Flat),
        3,
    );

    let entries = scan_queue(dir.path(), Some(".partial")).await.unwrap();
    let report = pool.run(entries, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.shipped.len(), 12);
    assert!(store.peak_in_flight() <= 3);
}

#[tokio::test]
async fn test_claimed_files_are_invisible_to_scans() {
    let dir = TempDir::new().unwrap();
    let path = queue_file(dir.path(), "a.parquet", b"a", hour_ago());
    queue_file(dir.path(), "b.parquet", b"b", hour_ago());

    let claims = rename_claims(Disposal::Delete);
    let mut token = claims.claim(&path).await.unwrap();

    let visible = scan_queue(dir.path(), Some(".partial")).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert!(visible[0].path.ends_with("b.parquet"));

    claims.release(&mut token).await.unwrap();
    assert_eq!(scan_queue(dir.path(), Some(".partial")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_restart_recovers_stale_claims() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("crashed.parquet.partial"), b"mid-upload").unwrap();

    assert_eq!(recover_stale_claims(dir.path(), ".partial").await.unwrap(), 1);
    assert_eq!(file_names(dir.path()), vec!["crashed.parquet"]);
}

#[tokio::test]
async fn test_daemon_batch_mode_end_to_end() {
    let dir = TempDir::new().unwrap();
    let spool = dir.path().join("spool");

    let mut config = DaemonConfig::default();
    config.storage.region = Some("us-east-1".to_string());
    config.storage.bucket = Some("telemetry".to_string());
    config.storage.key_prefix = Some("fleet".to_string());
    config.upload.mode = UploadMode::Parquet;
    config.upload.queue = Some(spool.clone());
    config.upload.poll_interval = Duration::from_millis(50);
    config.logging.file = dir.path().join("log").join("santa-sleigh.log");
    config.validate().unwrap();

    let store = Arc::new(MemoryStore::new());
    let ctx = Context {
        hostname: "edge-7".to_string(),
        clock: Arc::new(SystemClock),
    };
    let mut daemon = Daemon::new(config, store.clone(), ctx);
    let cancel = CancellationToken::new();

    let feeder = {
        let spool = spool.clone();
        let store = store.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            // The daemon creates the spool on startup
            while !spool.is_dir() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            // Write outside the spool and move in, so the scan never sees a
            // half-written file
            let staged = queue_file(spool.parent().unwrap(), "late.parquet", b"late", SystemTime::now());
            fs::rename(&staged, spool.join("late.parquet")).unwrap();
            while store.keys().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        })
    };

    tokio::time::timeout(Duration::from_secs(10), daemon.run(cancel))
        .await
        .unwrap()
        .unwrap();
    feeder.await.unwrap();

    let keys = store.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("fleet/hostname=edge-7/date="));
    assert!(keys[0].ends_with("/late.parquet"));
    assert!(file_names(&spool).is_empty());
}
