//! Append-only host trust store in known_hosts format.
//!
//! Each record maps a host pattern to one public key. Lookups are exact string
//! matches on the pattern; hashed and wildcard entries are ignored.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub host: String,
    pub key_type: String,
    /// Base64 wire encoding of the public key.
    pub key: String,
}

impl HostRecord {
    fn parse_line(line: &str) -> Vec<HostRecord> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
            return Vec::new();
        }
        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(key_type), Some(key)) = (fields.next(), fields.next(), fields.next())
        else {
            return Vec::new();
        };
        if hosts.starts_with('@') {
            return Vec::new();
        }
        hosts
            .split(',')
            .filter(|h| !h.is_empty())
            .map(|h| HostRecord {
                host: h.to_string(),
                key_type: key_type.to_string(),
                key: key.to_string(),
            })
            .collect()
    }

    fn to_line(&self) -> String {
        format!("{} {} {}\n", self.host, self.key_type, self.key)
    }
}

/// Host pattern as written by OpenSSH: bare host on port 22, `[host]:port` otherwise.
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyCheck {
    Trusted,
    /// No record for this host.
    Unknown,
    /// Records exist for this host but none carries the presented key.
    Mismatch,
}

#[derive(Debug)]
pub struct KnownHosts {
    path: PathBuf,
    records: RwLock<Vec<HostRecord>>,
}

impl KnownHosts {
    /// Load the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.lines().flat_map(HostRecord::parse_line).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(FleetError::KeyLoad {
                    path,
                    reason: e.to_string(),
                })
            }
        };
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn check(&self, host: &str, port: u16, key_type: &str, key: &str) -> HostKeyCheck {
        let pattern = host_pattern(host, port);
        let records = self.records.read();
        let mut known = false;
        for record in records.iter().filter(|r| r.host == pattern) {
            known = true;
            if record.key_type == key_type && record.key == key {
                return HostKeyCheck::Trusted;
            }
        }
        if known {
            HostKeyCheck::Mismatch
        } else {
            HostKeyCheck::Unknown
        }
    }

    /// Append a record for `host`. Returns false if the exact record already exists.
    ///
    /// Existing records are never rewritten, so a rotated key sits next to the old
    /// one until an operator edits the file.
    pub async fn trust(&self, host: &str, port: u16, key_type: &str, key: &str) -> Result<bool> {
        let record = HostRecord {
            host: host_pattern(host, port),
            key_type: key_type.to_string(),
            key: key.to_string(),
        };
        if self.records.read().contains(&record) {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.path)
            .await?;
        file.write_all(record.to_line().as_bytes()).await?;
        file.flush().await?;

        tracing::info!(host = %record.host, key_type, "Trusted host key");
        self.records.write().push(record);
        Ok(true)
    }

    pub fn records(&self) -> Vec<HostRecord> {
        self.records.read().clone()
    }
}
