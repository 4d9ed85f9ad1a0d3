use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use super::executor::CommandExecutor;
use super::protocol::{
    ExecRequest, HeartbeatResponse, AUTH_TOKEN_HEADER, EXEC_PATH, HEARTBEAT_PATH,
};
use crate::config::AgentConfig;
use crate::error::{FleetError, Result};
use crate::telemetry::SharedSink;
use crate::tls::{certificate_subject, TlsIdentity};

/// Subject of the verified client certificate on an mTLS connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub subject: String,
}

#[derive(Clone)]
pub struct AgentState {
    executor: CommandExecutor,
    version: String,
    hostname: String,
    token: Option<Arc<str>>,
    require_client_cert: bool,
    max_request_bytes: usize,
    telemetry: SharedSink,
}

impl AgentState {
    pub fn new(config: &AgentConfig, telemetry: SharedSink) -> Self {
        Self {
            executor: CommandExecutor::new(config.max_output_bytes),
            version: config.version.clone(),
            hostname: local_hostname(),
            token: config
                .token
                .as_deref()
                .filter(|t| !t.is_empty())
                .map(Arc::from),
            require_client_cert: config.tls.enabled && config.tls.require_client_cert,
            max_request_bytes: config.max_request_bytes,
            telemetry,
        }
    }
}

/// Build the agent's HTTP surface.
///
/// Heartbeat is open to anyone. Exec requires the shared token when one is
/// configured and a verified client certificate when mTLS is required.
/// Exec bodies are limited to `AgentConfig::max_request_bytes`.
pub fn router(state: AgentState) -> Router {
    let exec = Router::new()
        .route(
            EXEC_PATH,
            post(exec_handler).layer(DefaultBodyLimit::max(state.max_request_bytes)),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route(HEARTBEAT_PATH, get(heartbeat_handler))
        .merge(exec)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn heartbeat_handler(State(state): State<AgentState>) -> impl IntoResponse {
    let start = Instant::now();
    let labels = [("component", "agent"), ("endpoint", "heartbeat")];
    state.telemetry.counter("agent_heartbeats", 1, &labels);

    let response = Json(HeartbeatResponse {
        time: chrono::Utc::now(),
        host: state.hostname.clone(),
        version: state.version.clone(),
    });

    state
        .telemetry
        .timer("agent_request_duration", start.elapsed(), &labels);
    response
}

async fn require_auth(State(state): State<AgentState>, req: Request, next: Next) -> Response {
    if state.require_client_cert && req.extensions().get::<ClientIdentity>().is_none() {
        tracing::warn!("Rejecting exec without a verified client certificate");
        return unauthorized(&state, "client certificate required");
    }

    if let Some(expected) = &state.token {
        let headers = req.headers();
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let direct = headers
            .get(AUTH_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());

        let presented = [bearer, direct]
            .into_iter()
            .flatten()
            .any(|t| tokens_match(t, expected));
        if !presented {
            tracing::warn!("Rejecting exec with missing or invalid token");
            return unauthorized(&state, "invalid or missing token");
        }
    }

    next.run(req).await
}

fn unauthorized(state: &AgentState, reason: &'static str) -> Response {
    state.telemetry.counter(
        "agent_exec_errors",
        1,
        &[("component", "agent"), ("endpoint", "exec"), ("error", "unauthorized")],
    );
    (StatusCode::UNAUTHORIZED, reason).into_response()
}

/// Compare without short-circuiting on the first differing byte.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn exec_handler(
    State(state): State<AgentState>,
    identity: Option<Extension<ClientIdentity>>,
    body: Bytes,
) -> Response {
    let request_start = Instant::now();

    let req: ExecRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            state.telemetry.counter(
                "agent_exec_errors",
                1,
                &[("component", "agent"), ("endpoint", "exec"), ("error", "decode_request")],
            );
            return (StatusCode::BAD_REQUEST, format!("invalid exec request: {}", e))
                .into_response();
        }
    };
    if req.command.trim().is_empty() {
        state.telemetry.counter(
            "agent_exec_errors",
            1,
            &[("component", "agent"), ("endpoint", "exec"), ("error", "empty_command")],
        );
        return (StatusCode::BAD_REQUEST, "command is required").into_response();
    }

    let subject = identity.map(|Extension(id)| id.subject);
    tracing::info!(
        command = %req.command,
        client = subject.as_deref().unwrap_or("-"),
        "Exec request"
    );
    state.telemetry.counter(
        "agent_exec_requests",
        1,
        &[("component", "agent"), ("endpoint", "exec"), ("command", req.command.as_str())],
    );

    let exec_start = Instant::now();
    let resp = state.executor.execute(&req).await;
    let exec_elapsed = exec_start.elapsed();

    let status = if resp.success() { "success" } else { "error" };
    let labels = [
        ("component", "agent"),
        ("endpoint", "exec"),
        ("command", req.command.as_str()),
        ("status", status),
    ];
    state
        .telemetry
        .timer("agent_exec_duration", exec_elapsed, &labels);
    state
        .telemetry
        .timer("agent_request_duration", request_start.elapsed(), &labels);
    state.telemetry.histogram(
        "agent_exec_output_size",
        (resp.stdout.len() + resp.stderr.len()) as f64,
        &labels,
    );
    if resp.success() {
        state.telemetry.counter("agent_exec_successful", 1, &labels);
    } else {
        state.telemetry.counter("agent_exec_failed", 1, &labels);
    }

    Json(resp).into_response()
}

/// The node agent process: binds, serves plain HTTP or TLS, and stops on cancel.
pub struct AgentServer {
    config: AgentConfig,
    state: AgentState,
}

impl AgentServer {
    pub fn new(config: AgentConfig, telemetry: SharedSink) -> Self {
        let state = AgentState::new(&config, telemetry);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, cancel).await
    }

    /// Serve on an already bound listener until `cancel` fires.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        let tls = &self.config.tls;

        if tls.enabled && !tls.is_complete() {
            if !tls.allow_insecure {
                return Err(FleetError::Config(
                    "TLS is enabled but certificate, key or client CA is missing".to_string(),
                ));
            }
            tracing::warn!("TLS configuration incomplete, serving plaintext (allow_insecure)");
        }

        let router = self.router();
        if tls.is_complete() {
            let identity = TlsIdentity::load(tls).await?;
            let acceptor = TlsAcceptor::from(identity.server_config()?);
            tracing::info!(
                addr = %addr,
                mtls = identity.requires_client_cert(),
                token = self.state.token.is_some(),
                "Agent listening (TLS)"
            );
            serve_tls(listener, acceptor, router, cancel).await;
        } else {
            tracing::info!(addr = %addr, token = self.state.token.is_some(), "Agent listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await?;
        }

        tracing::info!("Agent stopped");
        Ok(())
    }
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    cancel: CancellationToken,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let identity = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|chain| chain.first())
                .and_then(|cert| certificate_subject(cert.as_ref()))
                .map(|subject| ClientIdentity { subject });

            let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
                let router = router.clone();
                if let Some(id) = &identity {
                    req.extensions_mut().insert(id.clone());
                }
                async move { router.oneshot(req).await }
            });

            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(peer = %peer, error = %e, "Connection closed with error");
                    }
                }
                _ = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                }
            }
        });
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .or_else(|_| std::fs::read_to_string("/etc/hostname"))
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
