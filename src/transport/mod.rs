//! Secure Transport: key-authenticated, host-verified remote shell and file copy.
//!
//! [`SecureTransport`] owns the retry and timeout policy. The wire work sits
//! behind the [`Connector`] and [`Connection`] traits so the policy can be
//! exercised without a live SSH server; [`SshConnector`] is the production
//! implementation on top of russh.

pub mod keys;
pub mod known_hosts;
mod ssh;

pub use known_hosts::{host_pattern, HostKeyCheck, HostRecord, KnownHosts};
pub use ssh::{fetch_host_key, HostVerifier, SshConnector};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::SshConfig;
use crate::error::{FleetError, Result};
use crate::fleet::Node;
use crate::retry::{linear_backoff, sleep_or_cancel};

/// Where to dial and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// Target for a node, filling blanks from the transport defaults.
    pub fn for_node(node: &Node, config: &SshConfig) -> Self {
        let user = if node.ssh_user.is_empty() {
            config.default_user.clone()
        } else {
            node.ssh_user.clone()
        };
        let port = if node.ssh_port == 0 {
            config.default_port
        } else {
            node.ssh_port
        };
        Self::new(node.address.clone(), port, user)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One authenticated session to one host.
#[async_trait]
pub trait Connection: Send {
    /// Run `command` through the remote shell. A non-zero exit is not an error.
    async fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput>;

    /// Stream `data` into the remote file, replacing it. Returns bytes written.
    async fn write_file(
        &mut self,
        remote: &str,
        data: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64>;

    /// Stream the remote file into `out`. Returns bytes read.
    async fn read_file(
        &mut self,
        remote: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open, verify and authenticate one connection. No retries.
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn Connection>>;
}

/// Dial policy plus the primitives layered on a [`Connection`].
#[derive(Clone)]
pub struct SecureTransport {
    connector: Arc<dyn Connector>,
    config: SshConfig,
}

impl SecureTransport {
    pub fn new(connector: Arc<dyn Connector>, config: SshConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn target_for(&self, node: &Node) -> SshTarget {
        SshTarget::for_node(node, &self.config)
    }

    /// Connect to `target`, retrying transient failures with linear backoff.
    ///
    /// Host verification and authentication failures return immediately.
    pub async fn dial(
        &self,
        target: &SshTarget,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Connection>> {
        self.with_fresh_connection(target, cancel, "dial", |conn| async move { Ok(conn) })
            .await
    }

    /// Run `command` on `target` over a fresh connection per attempt, feeding
    /// `stdin` to it when given.
    ///
    /// If the plain capture fails at the session level, the same command is
    /// retried once with stderr folded into stdout so the operator still gets
    /// diagnostic text.
    pub async fn run_command(
        &self,
        target: &SshTarget,
        command: &str,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        self.with_fresh_connection(target, cancel, "run_command", |mut conn| async move {
            let result = exec_with_fallback(conn.as_mut(), command, stdin).await;
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Error closing SSH connection");
            }
            result
        })
        .await
    }

    async fn connect_once(
        &self,
        target: &SshTarget,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Connection>> {
        let timeout = self.config.connect_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(FleetError::Cancelled),
            result = tokio::time::timeout(timeout, self.connector.connect(target)) => {
                result.map_err(|_| {
                    FleetError::Timeout(format!("connecting to {} after {:?}", target.addr(), timeout))
                })?
            }
        }
    }

    async fn with_fresh_connection<T, F, Fut>(
        &self,
        target: &SshTarget,
        cancel: &CancellationToken,
        op: &'static str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(Box<dyn Connection>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let retries = self.config.retries;
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(FleetError::Cancelled);
            }
            let result = match self.connect_once(target, cancel).await {
                Ok(conn) => f(conn).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < retries => {
                    let delay = linear_backoff(self.config.backoff, attempt);
                    tracing::warn!(
                        addr = %target.addr(),
                        op,
                        attempt = attempt + 1,
                        retries,
                        error = %e,
                        "SSH attempt failed, retrying"
                    );
                    sleep_or_cancel(delay, cancel).await?;
                    attempt += 1;
                }
                Err(e) => {
                    if !e.is_transient() {
                        tracing::error!(addr = %target.addr(), op, error = %e, "SSH failed");
                    }
                    return Err(e);
                }
            }
        }
    }
}

async fn exec_with_fallback(
    conn: &mut dyn Connection,
    command: &str,
    stdin: Option<&[u8]>,
) -> Result<CommandOutput> {
    match conn.exec(command, stdin).await {
        Ok(out) => Ok(out),
        Err(primary) => {
            tracing::debug!(error = %primary, "Output capture failed, retrying with combined output");
            let combined = format!("{{ {}\n}} 2>&1", command);
            conn.exec(&combined, stdin).await.map_err(|_| primary)
        }
    }
}

/// Create the remote parent directory, then stream `local` to `remote`.
pub async fn push_file(conn: &mut dyn Connection, local: &Path, remote: &str) -> Result<u64> {
    if let Some(parent) = remote_parent(remote) {
        let out = conn
            .exec(&format!("mkdir -p {}", shell_quote(parent)), None)
            .await?;
        if !out.success() {
            return Err(FleetError::Ssh(format!(
                "mkdir {} failed: {}",
                parent,
                out.stderr.trim()
            )));
        }
    }
    let mut file = tokio::fs::File::open(local).await?;
    conn.write_file(remote, &mut file).await
}

/// Create the local parent directory, then stream `remote` to `local`.
pub async fn pull_file(conn: &mut dyn Connection, remote: &str, local: &Path) -> Result<u64> {
    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(local).await?;
    let n = conn.read_file(remote, &mut file).await?;
    tokio::io::AsyncWriteExt::flush(&mut file).await?;
    Ok(n)
}

fn remote_parent(remote: &str) -> Option<&str> {
    let idx = remote.rfind('/')?;
    let parent = &remote[..idx];
    if parent.is_empty() {
        None
    } else {
        Some(parent)
    }
}

/// Quote `s` as a single POSIX shell word.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/tmp/a.txt"), "/tmp/a.txt");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn remote_parent_of_paths() {
        assert_eq!(remote_parent("/data/in/a.txt"), Some("/data/in"));
        assert_eq!(remote_parent("/a.txt"), None);
        assert_eq!(remote_parent("a.txt"), None);
    }

    #[test]
    fn target_defaults() {
        let node = Node::new("n1", "10.0.0.1").with_ssh("", 0);
        let target = SshTarget::for_node(&node, &SshConfig::default());
        assert_eq!(target.user, "gx");
        assert_eq!(target.port, 22);
        assert_eq!(target.addr(), "10.0.0.1:22");
    }
}
