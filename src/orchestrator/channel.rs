use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentClient, ExecRequest, ExecResponse};
use crate::error::Result;
use crate::fleet::Node;
use crate::transport::SecureTransport;

/// Which path a command took to reach its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Agent,
    Ssh,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Agent => write!(f, "agent"),
            Channel::Ssh => write!(f, "ssh"),
        }
    }
}

/// A way of running an [`ExecRequest`] on a node.
///
/// `Ok` means the command ran and reported an exit code, zero or not. `Err`
/// is reserved for failures to reach or talk to the node.
#[async_trait]
pub trait NodeChannel: Send + Sync {
    fn kind(&self) -> Channel;

    async fn execute(
        &self,
        node: &Node,
        req: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecResponse>;
}

/// Runs requests through the node's agent.
pub struct AgentChannel {
    client: AgentClient,
}

impl AgentChannel {
    pub fn new(client: AgentClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeChannel for AgentChannel {
    fn kind(&self) -> Channel {
        Channel::Agent
    }

    async fn execute(
        &self,
        node: &Node,
        req: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecResponse> {
        self.client.exec(node, req, cancel).await
    }
}

/// Runs requests directly through the secure transport.
pub struct SshChannel {
    transport: SecureTransport,
}

impl SshChannel {
    pub fn new(transport: SecureTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl NodeChannel for SshChannel {
    fn kind(&self) -> Channel {
        Channel::Ssh
    }

    async fn execute(
        &self,
        node: &Node,
        req: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecResponse> {
        let target = self.transport.target_for(node);
        let command = req.to_shell();
        let stdin = (!req.input.is_empty()).then(|| req.input.as_bytes());

        let started = Instant::now();
        let out = self
            .transport
            .run_command(&target, &command, stdin, cancel)
            .await?;
        Ok(ExecResponse {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
