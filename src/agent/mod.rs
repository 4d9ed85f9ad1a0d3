//! Node Agent Protocol: a small always-on process per node that executes
//! commands for the orchestrator and reports liveness.

mod client;
mod executor;
pub mod protocol;
mod server;

pub use client::AgentClient;
pub use executor::{CommandExecutor, TIMEOUT_EXIT_CODE};
pub use protocol::{ExecRequest, ExecResponse, HeartbeatResponse};
pub use server::{router, AgentServer, AgentState, ClientIdentity};
