//! Wire types for the node agent. Both the HTTP channel and the SSH fallback
//! produce the same request and response shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HEARTBEAT_PATH: &str = "/v0/heartbeat";
pub const EXEC_PATH: &str = "/v0/exec";

/// Header carrying the shared token when `Authorization: Bearer` is not used.
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub time: DateTime<Utc>,
    pub host: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` entries layered over the agent's environment.
    #[serde(default)]
    pub env: Vec<String>,
    /// 0 means no bound beyond the transport's own timeout.
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub work_dir: String,
    /// Written to the child's stdin.
    #[serde(default)]
    pub input: String,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Render as a single shell command line, for channels that only take a string.
    pub fn to_shell(&self) -> String {
        use crate::transport::shell_quote;

        let mut parts = Vec::new();
        if !self.work_dir.is_empty() {
            parts.push(format!("cd {} &&", shell_quote(&self.work_dir)));
        }
        if !self.env.is_empty() {
            parts.push("env".to_string());
            parts.extend(self.env.iter().map(|kv| shell_quote(kv)));
        }
        parts.push(shell_quote(&self.command));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        let line = parts.join(" ");
        if self.timeout_seconds > 0 {
            format!("timeout {} sh -c {}", self.timeout_seconds, shell_quote(&line))
        } else {
            line
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecResponse {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
