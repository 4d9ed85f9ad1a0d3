use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::channel::Channel;

/// Outcome of one chunk on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeResult {
    /// Position of the node in the fleet.
    pub node_index: usize,
    pub node: String,
    pub chunk_index: usize,
    pub channel: Channel,
    /// `None` when the command never produced an exit status.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Transport failure, if any.
    pub error: Option<String>,
}

impl NodeResult {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    /// What an operator should read first when this result failed.
    pub fn diagnostic(&self) -> &str {
        match &self.error {
            Some(err) if self.stderr.trim().is_empty() => err,
            _ => self.stderr.trim(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Final report of a task run, in assignment order.
#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub task: String,
    pub run_id: String,
    pub results: Vec<NodeResult>,
    pub duration: Duration,
}

impl FleetReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.success()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.successful()
    }

    /// Percentage of successful executions; `None` for an empty run.
    pub fn success_rate(&self) -> Option<f64> {
        if self.results.is_empty() {
            return None;
        }
        Some(self.successful() as f64 / self.total() as f64 * 100.0)
    }

    pub fn status(&self) -> RunStatus {
        if self.failed() > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "Task {} {}: {} successful, {} failed",
            self.task,
            self.status(),
            self.successful(),
            self.failed()
        );
        if let Some(rate) = self.success_rate() {
            line.push_str(&format!(" ({:.1}% success rate)", rate));
        }
        line
    }

    /// `(node, diagnostic)` for every failed execution.
    pub fn failed_outputs(&self) -> Vec<(&str, &str)> {
        self.results
            .iter()
            .filter(|r| !r.success())
            .map(|r| (r.node.as_str(), r.diagnostic()))
            .collect()
    }
}
