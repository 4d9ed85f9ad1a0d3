//! Transfer Manager: checksum-verified delivery of local files to nodes.
//!
//! A transfer either ends with the remote file present and its SHA-256 equal
//! to the local one, or with no remote file and an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, Result};
use crate::fleet::{Fleet, Node};
use crate::telemetry::SharedSink;
use crate::transport::{push_file, shell_quote, Connection, SecureTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub local: PathBuf,
    pub remote: String,
}

impl TransferJob {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub modified: Option<DateTime<Utc>>,
}

/// Hex SHA-256 of a local file, streamed.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub async fn file_info(path: &Path) -> Result<FileInfo> {
    let meta = tokio::fs::metadata(path).await?;
    let sha256 = sha256_file(path).await?;
    Ok(FileInfo {
        path: path.to_path_buf(),
        size: meta.len(),
        sha256,
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    })
}

/// A verified file on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub remote: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug)]
pub struct NodeTransfer {
    pub node: String,
    pub result: Result<Vec<Delivered>>,
}

/// Outcome of uploading the same files to every node of a fleet.
#[derive(Debug, Default)]
pub struct TransferReport {
    pub nodes: Vec<NodeTransfer>,
}

impl TransferReport {
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &FleetError)> {
        self.nodes
            .iter()
            .filter_map(|n| n.result.as_ref().err().map(|e| (n.node.as_str(), e)))
    }

    pub fn successful(&self) -> usize {
        self.nodes.iter().filter(|n| n.result.is_ok()).count()
    }
}

#[derive(Clone)]
pub struct TransferManager {
    transport: SecureTransport,
    telemetry: SharedSink,
}

impl TransferManager {
    pub fn new(transport: SecureTransport, telemetry: SharedSink) -> Self {
        Self {
            transport,
            telemetry,
        }
    }

    /// Upload one file to one node and verify it.
    pub async fn transfer_file(
        &self,
        node: &Node,
        job: &TransferJob,
        cancel: &CancellationToken,
    ) -> Result<Delivered> {
        let expected = sha256_file(&job.local).await?;
        let mut conn = self.dial(node, cancel).await?;
        let result = self.deliver(conn.as_mut(), node, job, &expected).await;
        close_quietly(conn.as_mut()).await;
        result.map_err(|e| e.on_node(node.name.clone(), "transfer"))
    }

    /// Upload several files to one node over one connection, stopping at the first failure.
    pub async fn transfer_files(
        &self,
        node: &Node,
        jobs: &[TransferJob],
        cancel: &CancellationToken,
    ) -> Result<Vec<Delivered>> {
        let hashes = hash_all(jobs).await?;
        self.transfer_hashed(node, jobs, &hashes, cancel).await
    }

    /// Upload `jobs` to every node concurrently.
    ///
    /// Local files are hashed once up front; an unreadable local file fails the
    /// whole call before any connection is made. After that, every node gets
    /// its own entry in the report and one node's failure never stops another.
    pub async fn upload_to_fleet(
        &self,
        fleet: &Fleet,
        jobs: &[TransferJob],
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let hashes = Arc::new(hash_all(jobs).await?);
        let jobs: Arc<Vec<TransferJob>> = Arc::new(jobs.to_vec());

        let mut tasks = JoinSet::new();
        for (idx, node) in fleet.nodes.iter().cloned().enumerate() {
            let manager = self.clone();
            let jobs = jobs.clone();
            let hashes = hashes.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = manager.transfer_hashed(&node, &jobs, &hashes, &cancel).await;
                (idx, node.name, result)
            });
        }

        let mut slots: Vec<Option<NodeTransfer>> = fleet.nodes.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, node, result)) => slots[idx] = Some(NodeTransfer { node, result }),
                Err(e) => tracing::error!(error = %e, "Transfer task panicked"),
            }
        }

        let nodes = slots
            .into_iter()
            .zip(&fleet.nodes)
            .map(|(slot, node)| {
                slot.unwrap_or_else(|| NodeTransfer {
                    node: node.name.clone(),
                    result: Err(FleetError::Internal("transfer task aborted".to_string())),
                })
            })
            .collect::<Vec<_>>();

        let report = TransferReport { nodes };
        for (node, err) in report.failures() {
            tracing::error!(node, error = %err, "Transfer failed");
        }
        tracing::info!(
            fleet = %fleet.name,
            files = jobs.len(),
            successful = report.successful(),
            failed = report.nodes.len() - report.successful(),
            "Fleet upload finished"
        );
        Ok(report)
    }

    async fn transfer_hashed(
        &self,
        node: &Node,
        jobs: &[TransferJob],
        hashes: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Delivered>> {
        let mut conn = self.dial(node, cancel).await?;
        let mut delivered = Vec::with_capacity(jobs.len());
        let mut outcome = Ok(());
        for (job, expected) in jobs.iter().zip(hashes) {
            if cancel.is_cancelled() {
                outcome = Err(FleetError::Cancelled);
                break;
            }
            match self.deliver(conn.as_mut(), node, job, expected).await {
                Ok(d) => delivered.push(d),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        close_quietly(conn.as_mut()).await;
        outcome
            .map(|_| delivered)
            .map_err(|e| e.on_node(node.name.clone(), "transfer"))
    }

    async fn dial(&self, node: &Node, cancel: &CancellationToken) -> Result<Box<dyn Connection>> {
        let target = self.transport.target_for(node);
        self.transport
            .dial(&target, cancel)
            .await
            .map_err(|e| e.on_node(node.name.clone(), "dial"))
    }

    /// Steps after the connection is up: copy, hash remotely, compare, clean up on failure.
    async fn deliver(
        &self,
        conn: &mut dyn Connection,
        node: &Node,
        job: &TransferJob,
        expected: &str,
    ) -> Result<Delivered> {
        let result: Result<u64> = async {
            let bytes = push_file(conn, &job.local, &job.remote).await?;
            let actual = remote_sha256(conn, &job.remote).await?;
            if actual != expected {
                return Err(FleetError::ChecksumMismatch {
                    path: job.remote.clone(),
                    expected: expected.to_string(),
                    actual,
                });
            }
            Ok(bytes)
        }
        .await;

        let labels = [("node", node.name.as_str())];
        match result {
            Ok(bytes) => {
                self.telemetry.counter("transfers_successful", 1, &labels);
                self.telemetry.counter("transfer_bytes", bytes, &labels);
                tracing::info!(
                    node = %node.name,
                    local = %job.local.display(),
                    remote = %job.remote,
                    bytes,
                    "Transferred and verified"
                );
                Ok(Delivered {
                    remote: job.remote.clone(),
                    bytes,
                    sha256: expected.to_string(),
                })
            }
            Err(e) => {
                self.telemetry.counter("transfers_failed", 1, &labels);
                tracing::warn!(
                    node = %node.name,
                    remote = %job.remote,
                    error = %e,
                    "Removing failed transfer"
                );
                let rm = format!("rm -f {}", shell_quote(&job.remote));
                match conn.exec(&rm, None).await {
                    Ok(out) if out.success() => {}
                    Ok(out) => tracing::error!(
                        node = %node.name,
                        remote = %job.remote,
                        stderr = %out.stderr.trim(),
                        "Cleanup of failed transfer failed"
                    ),
                    Err(cleanup) => tracing::error!(
                        node = %node.name,
                        remote = %job.remote,
                        error = %cleanup,
                        "Cleanup of failed transfer failed"
                    ),
                }
                Err(e)
            }
        }
    }
}

async fn hash_all(jobs: &[TransferJob]) -> Result<Vec<String>> {
    let mut hashes = Vec::with_capacity(jobs.len());
    for job in jobs {
        let hash = sha256_file(&job.local).await.map_err(|e| {
            FleetError::Config(format!("cannot read {}: {}", job.local.display(), e))
        })?;
        hashes.push(hash);
    }
    Ok(hashes)
}

async fn remote_sha256(conn: &mut dyn Connection, remote: &str) -> Result<String> {
    let cmd = format!("sha256sum {} | cut -d' ' -f1", shell_quote(remote));
    let out = conn.exec(&cmd, None).await?;
    let digest = out.stdout.trim().to_ascii_lowercase();
    if !out.success() || digest.len() != 64 {
        return Err(FleetError::Ssh(format!(
            "remote checksum of {} failed: {}",
            remote,
            out.stderr.trim()
        )));
    }
    Ok(digest)
}

async fn close_quietly(conn: &mut dyn Connection) {
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Error closing connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello\n").await.unwrap();

        let info = file_info(&path).await.unwrap();
        assert_eq!(info.size, 6);
        assert_eq!(
            info.sha256,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
        assert!(info.modified.is_some());
    }

    #[tokio::test]
    async fn missing_local_file_is_a_config_error() {
        let jobs = [TransferJob::new("/nonexistent/input.txt", "/tmp/input.txt")];
        assert!(matches!(hash_all(&jobs).await, Err(FleetError::Config(_))));
    }
}
