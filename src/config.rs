use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FleetError, Result};

/// How the secure transport checks the identity presented by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostVerification {
    /// Host key must exactly match a record in the trust store.
    #[default]
    Strict,
    /// Accept any host key. Only usable together with `SshConfig::allow_insecure`.
    InsecureAcceptAny,
}

/// Secure transport settings shared by every SSH dial.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Private key used for public key authentication.
    pub key_path: PathBuf,
    /// Append-only trust store of (host, public key) records.
    pub known_hosts_path: PathBuf,
    /// User used when a node does not carry one.
    pub default_user: String,
    /// Port used when a node does not carry one.
    pub default_port: u16,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// Extra attempts after the first failed one.
    pub retries: u32,
    /// Base delay; attempt `n` waits `backoff * (n + 1)`.
    pub backoff: Duration,
    pub host_verification: HostVerification,
    /// Must be set explicitly for `HostVerification::InsecureAcceptAny` to pass validation.
    pub allow_insecure: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        let base = default_config_dir();
        Self {
            key_path: base.join("ssh").join("id_ed25519"),
            known_hosts_path: base.join("ssh").join("known_hosts"),
            default_user: "gx".to_string(),
            default_port: 22,
            connect_timeout: Duration::from_secs(30),
            retries: 3,
            backoff: Duration::from_millis(500),
            host_verification: HostVerification::Strict,
            allow_insecure: false,
        }
    }
}

impl SshConfig {
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = path.into();
        self
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = path.into();
        self
    }

    /// Reject configurations that would silently weaken host verification.
    pub fn validate(&self) -> Result<()> {
        if self.host_verification == HostVerification::InsecureAcceptAny && !self.allow_insecure {
            return Err(FleetError::Config(
                "host verification is disabled but allow_insecure is not set".to_string(),
            ));
        }
        if self.default_user.is_empty() {
            return Err(FleetError::Config("default SSH user is empty".to_string()));
        }
        Ok(())
    }
}

/// TLS configuration for the node agent.
///
/// When `require_client_cert` is set the agent runs mutual TLS:
/// - the agent presents its certificate to the orchestrator
/// - the orchestrator must present a certificate signed by the configured CA
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format) used to verify clients.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this agent's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this agent's private key (PEM format).
    pub key_path: Option<PathBuf>,

    /// Require and verify a client certificate on every connection.
    pub require_client_cert: bool,

    /// Allow falling back to plaintext when TLS files are missing.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is configured with all files the chosen mode needs.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.cert_path.is_some()
            && self.key_path.is_some()
            && (!self.require_client_cert || self.ca_cert_path.is_some())
    }
}

/// Settings for the long-lived agent process on each node.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Reported by the heartbeat endpoint.
    pub version: String,
    /// Shared bearer token; exec requests must present it when set.
    pub token: Option<String>,
    pub tls: TlsConfig,
    /// Cap on captured bytes per output stream.
    pub max_output_bytes: usize,
    /// Largest accepted exec request body, chunk input included.
    pub max_request_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_AGENT_PORT)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            token: None,
            tls: TlsConfig::default(),
            max_output_bytes: 4 * 1024 * 1024,
            max_request_bytes: 64 * 1024 * 1024,
        }
    }
}

impl AgentConfig {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

pub const DEFAULT_AGENT_PORT: u16 = 8088;

/// Whether a node whose agent is unreachable is retried over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Agent transport failure is the node's failure.
    #[default]
    Disabled,
    /// Agent transport failure triggers one SSH execution of the same command.
    Automatic,
}

/// What to do when a task produces more chunks than the fleet has nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkOverflow {
    /// Fail the run before dispatch.
    #[default]
    Reject,
    /// Chunk `j` goes to node `j mod N`; nodes run their chunks in order.
    Spread,
}

/// Settings for a fleet-wide task run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Max in-flight node executions. `None` means the whole fleet at once.
    pub concurrency: Option<usize>,
    pub agent_port: u16,
    /// `http` or `https`.
    pub agent_scheme: String,
    pub agent_token: Option<String>,
    /// Added to the request timeout to form the per-node deadline.
    pub deadline_slack: Duration,
    pub fallback: FallbackPolicy,
    pub overflow: ChunkOverflow,
    /// Where chunk files are staged on nodes.
    pub remote_work_dir: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            agent_port: DEFAULT_AGENT_PORT,
            agent_scheme: "http".to_string(),
            agent_token: None,
            deadline_slack: Duration::from_secs(10),
            fallback: FallbackPolicy::Disabled,
            overflow: ChunkOverflow::Reject,
            remote_work_dir: "/tmp/fleet-lite".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn with_fallback(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = policy;
        self
    }

    /// Effective worker slot count for a fleet of `fleet_size` nodes.
    pub fn effective_concurrency(&self, fleet_size: usize) -> usize {
        match self.concurrency {
            Some(0) | None => fleet_size.max(1),
            Some(limit) => limit,
        }
    }
}

/// Resolve `$XDG_CONFIG_HOME/fleet-lite` or `~/.config/fleet-lite`.
pub fn default_config_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("fleet-lite")
}
