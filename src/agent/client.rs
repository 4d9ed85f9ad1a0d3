use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::protocol::{ExecRequest, ExecResponse, HeartbeatResponse, EXEC_PATH, HEARTBEAT_PATH};
use crate::config::OrchestratorConfig;
use crate::error::{FleetError, Result};
use crate::fleet::Node;
use crate::retry::sleep_or_cancel;
use crate::tls::ClientTls;

/// HTTP client for the node agent protocol.
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    scheme: String,
    port: u16,
    token: Option<String>,
    /// Added to the request's own timeout to bound the HTTP call.
    slack: Duration,
}

impl AgentClient {
    pub fn new(config: &OrchestratorConfig, tls: Option<&ClientTls>) -> Result<Self> {
        let scheme = config.agent_scheme.to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(FleetError::Config(format!(
                "unsupported agent scheme {:?}",
                config.agent_scheme
            )));
        }

        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if let Some(tls) = tls {
            builder = tls.apply(builder)?;
        }

        Ok(Self {
            http: builder.build()?,
            scheme,
            port: config.agent_port,
            token: config.agent_token.clone().filter(|t| !t.is_empty()),
            slack: config.deadline_slack,
        })
    }

    pub fn base_url(&self, node: &Node) -> String {
        let host = if node.address.contains(':') && !node.address.starts_with('[') {
            format!("[{}]", node.address)
        } else {
            node.address.clone()
        };
        format!("{}://{}:{}", self.scheme, host, self.port)
    }

    pub async fn heartbeat(
        &self,
        node: &Node,
        cancel: &CancellationToken,
    ) -> Result<HeartbeatResponse> {
        let url = format!("{}{}", self.base_url(node), HEARTBEAT_PATH);
        let request = self.http.get(&url).timeout(self.slack);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FleetError::Cancelled),
            response = request.send() => response?,
        };
        decode(response).await
    }

    /// Run `req` on the node's agent.
    ///
    /// A non-zero exit is a successful call; transport failures, non-200
    /// statuses and undecodable bodies are errors.
    pub async fn exec(
        &self,
        node: &Node,
        req: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecResponse> {
        let url = format!("{}{}", self.base_url(node), EXEC_PATH);
        let mut request = self.http.post(&url).json(req);
        if req.timeout_seconds > 0 {
            request = request.timeout(Duration::from_secs(req.timeout_seconds) + self.slack);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        tracing::debug!(node = %node.name, url = %url, command = %req.command, "Sending exec");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FleetError::Cancelled),
            response = request.send() => response?,
        };
        decode(response).await
    }

    /// Poll the heartbeat until the agent answers or `deadline` passes.
    pub async fn wait_ready(
        &self,
        node: &Node,
        deadline: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<HeartbeatResponse> {
        let started = tokio::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.heartbeat(node, cancel).await {
                Ok(hb) => {
                    tracing::info!(node = %node.name, attempts, version = %hb.version, "Agent ready");
                    return Ok(hb);
                }
                Err(FleetError::Cancelled) => return Err(FleetError::Cancelled),
                Err(e) => {
                    if started.elapsed() + interval > deadline {
                        return Err(FleetError::Timeout(format!(
                            "agent on {} not ready after {:?} ({} attempts): {}",
                            node.name, deadline, attempts, e
                        )));
                    }
                    tracing::debug!(node = %node.name, error = %e, "Agent not ready yet");
                    sleep_or_cancel(interval, cancel).await?;
                }
            }
        }
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        let body = response.text().await.unwrap_or_default();
        return Err(FleetError::Unauthorized(body.trim().to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FleetError::AgentStatus {
            status: status.as_u16(),
            body: body.trim().to_string(),
        });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| FleetError::Decode(e.to_string()))
}
