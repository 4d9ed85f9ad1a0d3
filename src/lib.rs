pub mod agent;
pub mod config;
pub mod error;
pub mod fleet;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod tls;
pub mod transfer;
pub mod transport;

pub use error::{FleetError, Result};
