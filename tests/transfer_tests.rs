//! Checksum-verified transfers over the fake secure transport.


use std::sync::Arc;

use fleet_lite::error::FleetError;
use fleet_lite::telemetry::{MemorySink, SharedSink};
use fleet_lite::transfer::{sha256_file, TransferJob, TransferManager};
use test_harness::{mismatched, test_fleet, FakeConnector};
use tokio_util::sync::CancellationToken;

async fn local_file(dir: &std::path::Path, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, content).await.unwrap();
    path
}

#[tokio::test]
async fn test_transfer_file_verifies_and_delivers() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_file(dir.path(), "wordlist.txt", b"alpha\nbeta\n").await;
    let fake = FakeConnector::new();
    let sink = MemorySink::new();
    let manager = TransferManager::new(fake.transport(), sink.clone() as SharedSink);
    let node = test_fleet(1).nodes.remove(0);

    let job = TransferJob::new(&local, "/opt/data/wordlist.txt");
    let delivered = manager
        .transfer_file(&node, &job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(delivered.bytes, 11);
    assert_eq!(delivered.sha256, sha256_file(&local).await.unwrap());
    let remote = fake.remote_path(&node.address, "/opt/data/wordlist.txt");
    assert_eq!(tokio::fs::read(remote).await.unwrap(), b"alpha\nbeta\n");
    assert_eq!(sink.counter_value("transfers_successful"), 1);
    assert_eq!(sink.counter_value("transfer_bytes"), 11);
}

#[tokio::test]
async fn test_corrupted_transfer_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_file(dir.path(), "payload.bin", b"important bytes").await;
    let fake = FakeConnector::new();
    fake.corrupt_writes(true);
    let sink = MemorySink::new();
    let manager = TransferManager::new(fake.transport(), sink.clone() as SharedSink);
    let node = test_fleet(1).nodes.remove(0);

    let job = TransferJob::new(&local, "/opt/data/payload.bin");
    let err = manager
        .transfer_file(&node, &job, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err.root(), FleetError::ChecksumMismatch { .. }));
    assert!(!err.is_transient());
    let remote = fake.remote_path(&node.address, "/opt/data/payload.bin");
    assert!(!remote.exists(), "corrupted file must be removed");
    assert_eq!(sink.counter_value("transfers_failed"), 1);
    // One dial, no automatic retry of the integrity failure.
    assert_eq!(fake.connects(), 1);
}

#[tokio::test]
async fn test_transfer_files_reuses_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let a = local_file(dir.path(), "a.txt", b"a").await;
    let b = local_file(dir.path(), "b.txt", b"bb").await;
    let fake = FakeConnector::new();
    let manager = TransferManager::new(fake.transport(), fleet_lite::telemetry::noop());
    let node = test_fleet(1).nodes.remove(0);

    let jobs = [
        TransferJob::new(&a, "/srv/a.txt"),
        TransferJob::new(&b, "/srv/nested/b.txt"),
    ];
    let delivered = manager
        .transfer_files(&node, &jobs, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(delivered.len(), 2);
    assert_eq!(fake.connects(), 1);
    assert!(fake.remote_path(&node.address, "/srv/nested/b.txt").exists());
}

#[tokio::test]
async fn test_fleet_upload_isolates_node_failures() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_file(dir.path(), "tool.sh", b"#!/bin/sh\necho hi\n").await;
    let fake = FakeConnector::new();
    let fleet = test_fleet(4);
    let bad = fleet.nodes[2].address.clone();
    fake.refuse(&bad, mismatched);
    let manager = TransferManager::new(fake.transport(), fleet_lite::telemetry::noop());

    let report = manager
        .upload_to_fleet(
            &fleet,
            &[TransferJob::new(&local, "/usr/local/bin/tool.sh")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.nodes.len(), 4);
    assert_eq!(report.successful(), 3);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "node-2");
    assert!(matches!(failures[0].1.root(), FleetError::HostKeyMismatch { .. }));

    for (i, node) in fleet.nodes.iter().enumerate() {
        assert_eq!(report.nodes[i].node, node.name, "report keeps fleet order");
        let remote = fake.remote_path(&node.address, "/usr/local/bin/tool.sh");
        assert_eq!(remote.exists(), i != 2);
    }
}

#[tokio::test]
async fn test_unreadable_local_file_fails_before_dialing() {
    let fake = FakeConnector::new();
    let manager = TransferManager::new(fake.transport(), fleet_lite::telemetry::noop());

    let result = manager
        .upload_to_fleet(
            &test_fleet(3),
            &[TransferJob::new("/nonexistent/file", "/tmp/file")],
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(FleetError::Config(_))));
    assert_eq!(fake.connects(), 0);
}

#[tokio::test]
async fn test_cleanup_runs_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_file(dir.path(), "x.txt", b"x").await;
    let fake = FakeConnector::new();
    fake.corrupt_writes(true);
    let manager = TransferManager::new(fake.transport(), Arc::new(fleet_lite::telemetry::NoopSink));
    let node = test_fleet(1).nodes.remove(0);

    let _ = manager
        .transfer_file(&node, &TransferJob::new(&local, "/tmp/x.txt"), &CancellationToken::new())
        .await;

    let commands: Vec<String> = fake.commands().into_iter().map(|(_, c)| c).collect();
    assert_eq!(
        commands,
        vec![
            "mkdir -p /tmp".to_string(),
            "sha256sum /tmp/x.txt | cut -d' ' -f1".to_string(),
            "rm -f /tmp/x.txt".to_string(),
        ]
    );
}
