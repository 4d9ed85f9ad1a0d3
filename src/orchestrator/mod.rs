//! Execution Orchestrator: fans a task out across a fleet with bounded
//! concurrency and gathers one result per dispatched chunk.
//!
//! A run moves through `Pending → Dispatching → Awaiting → Reporting → Done`.
//! Node failures are recorded, never retried across nodes, and never abort
//! sibling executions; the run always ends with a [`FleetReport`].

mod channel;
mod report;

pub use channel::{AgentChannel, Channel, NodeChannel, SshChannel};
pub use report::{FleetReport, NodeResult, RunStatus};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{ExecRequest, ExecResponse};
use crate::config::{FallbackPolicy, OrchestratorConfig};
use crate::error::{FleetError, Result};
use crate::fleet::{Fleet, Node};
use crate::scheduler::{chunk_inputs, load_input_files, plan_assignments, RenderContext, TaskSpec};
use crate::telemetry::SharedSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    Dispatching,
    Awaiting,
    Reporting,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Pending => "pending",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Awaiting => "awaiting",
            RunPhase::Reporting => "reporting",
            RunPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Per-run overrides supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replaces the task's own `inputs` when non-empty.
    pub inputs: Vec<PathBuf>,
    /// Merged over the task's environment; these win.
    pub env: BTreeMap<String, String>,
    /// Per-execution bound on the node. 0 means unbounded.
    pub timeout_seconds: u64,
}

/// One chunk scheduled on one node.
#[derive(Debug, Clone, Copy)]
struct Slot {
    index: usize,
    chunk: usize,
}

type Results = Arc<Mutex<Vec<Option<NodeResult>>>>;

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    agent: Arc<dyn NodeChannel>,
    ssh: Option<Arc<dyn NodeChannel>>,
    telemetry: SharedSink,
}

impl Orchestrator {
    /// `ssh` is only consulted when the fallback policy is automatic.
    pub fn new(
        config: OrchestratorConfig,
        agent: Arc<dyn NodeChannel>,
        ssh: Option<Arc<dyn NodeChannel>>,
        telemetry: SharedSink,
    ) -> Result<Self> {
        if config.fallback == FallbackPolicy::Automatic && ssh.is_none() {
            return Err(FleetError::Config(
                "automatic fallback needs an SSH channel".to_string(),
            ));
        }
        Ok(Self {
            config: Arc::new(config),
            agent,
            ssh,
            telemetry,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run `task` on every node of `fleet` and report per-chunk results.
    ///
    /// Errors are returned only for problems found before dispatch: an
    /// invalid task, unreadable inputs or an unschedulable chunk plan.
    pub async fn run(
        &self,
        fleet: &Fleet,
        task: &TaskSpec,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<FleetReport> {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut phase = RunPhase::Pending;
        tracing::info!(task = %task.name, run_id = %run_id, fleet = %fleet.name, %phase, "Task run created");

        task.validate()?;
        let paths: Vec<PathBuf> = if options.inputs.is_empty() {
            task.inputs.iter().map(PathBuf::from).collect()
        } else {
            options.inputs.clone()
        };
        let items = load_input_files(&paths).await?;
        let chunks = if items.is_empty() {
            vec![Vec::new()]
        } else {
            chunk_inputs(&items, task.chunk_size)
        };
        let plan = plan_assignments(fleet.len(), chunks.len(), self.config.overflow)?;

        let task_label = [("task", task.name.as_str())];
        self.telemetry.counter("tasks_started", 1, &task_label);
        self.telemetry
            .gauge("task_nodes_total", fleet.len() as f64, &task_label);

        phase = RunPhase::Dispatching;
        let limit = self.config.effective_concurrency(fleet.len());
        tracing::info!(
            task = %task.name,
            run_id = %run_id,
            %phase,
            nodes = fleet.len(),
            items = items.len(),
            chunks = chunks.len(),
            concurrency = limit,
            "Dispatching task"
        );

        let mut slots_per_node = Vec::with_capacity(plan.len());
        let mut total = 0;
        for assigned in &plan {
            let slots: Vec<Slot> = assigned
                .iter()
                .map(|&chunk| {
                    let slot = Slot { index: total, chunk };
                    total += 1;
                    slot
                })
                .collect();
            slots_per_node.push(slots);
        }

        let results: Results = Arc::new(Mutex::new(vec![None; total]));
        let semaphore = Arc::new(Semaphore::new(limit));
        let chunks = Arc::new(chunks);
        let task = Arc::new(task.clone());
        let options = Arc::new(options);
        let run_id: Arc<str> = Arc::from(run_id);

        let mut workers = JoinSet::new();
        for ((node_index, node), slots) in fleet.nodes.iter().enumerate().zip(slots_per_node) {
            let this = self.clone();
            let node = node.clone();
            let semaphore = semaphore.clone();
            let results = results.clone();
            let chunks = chunks.clone();
            let task = task.clone();
            let options = options.clone();
            let run_id = run_id.clone();
            let cancel = cancel.clone();

            workers.spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                for slot in slots {
                    let result = if permit.is_some() && !cancel.is_cancelled() {
                        let path = format!(
                            "{}/{}-{}-{}.txt",
                            this.config.remote_work_dir.trim_end_matches('/'),
                            task.name,
                            run_id,
                            slot.chunk
                        );
                        let ctx = RenderContext {
                            env: &options.env,
                            timeout_seconds: options.timeout_seconds,
                            chunk_path: &path,
                        };
                        let req = task.render(&chunks[slot.chunk], &ctx);
                        this.execute_on_node(node_index, &node, slot.chunk, &req, &cancel)
                            .await
                    } else {
                        cancelled_result(node_index, &node, slot.chunk)
                    };
                    results.lock().await[slot.index] = Some(result);
                }
                drop(permit);
            });
        }

        phase = RunPhase::Awaiting;
        tracing::debug!(run_id = %run_id, %phase, "Waiting for node executions");
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(run_id = %run_id, error = %e, "Node worker panicked");
            }
        }

        phase = RunPhase::Reporting;
        let collected = std::mem::take(&mut *results.lock().await);
        let mut ordered = Vec::with_capacity(total);
        for (node_index, (node, assigned)) in fleet.nodes.iter().zip(&plan).enumerate() {
            for &chunk in assigned {
                ordered.push((node_index, node, chunk));
            }
        }
        let results: Vec<NodeResult> = collected
            .into_iter()
            .zip(ordered)
            .map(|(slot, (node_index, node, chunk))| {
                slot.unwrap_or_else(|| NodeResult {
                    error: Some("node worker aborted".to_string()),
                    ..cancelled_result(node_index, node, chunk)
                })
            })
            .collect();

        let report = FleetReport {
            task: task.name.clone(),
            run_id: run_id.to_string(),
            results,
            duration: started.elapsed(),
        };
        self.record_run(&report);

        phase = RunPhase::Done;
        tracing::info!(
            task = %report.task,
            run_id = %report.run_id,
            %phase,
            status = %report.status(),
            successful = report.successful(),
            failed = report.failed(),
            duration_ms = report.duration.as_millis() as u64,
            "Task run finished"
        );
        Ok(report)
    }

    async fn execute_on_node(
        &self,
        node_index: usize,
        node: &Node,
        chunk_index: usize,
        req: &ExecRequest,
        cancel: &CancellationToken,
    ) -> NodeResult {
        let started = Instant::now();
        let mut channel = self.agent.kind();
        let mut outcome = self.bounded(self.agent.as_ref(), node, req, cancel).await;

        if let Err(e) = &outcome {
            self.telemetry
                .counter("agent_failures", 1, &[("node", node.name.as_str())]);
            tracing::warn!(node = %node.name, channel = %channel, error = %e, "Agent execution failed");

            let fallback = match (&self.ssh, self.config.fallback) {
                (Some(ssh), FallbackPolicy::Automatic)
                    if !matches!(e.root(), FleetError::Cancelled | FleetError::Unauthorized(_)) =>
                {
                    Some(ssh)
                }
                _ => None,
            };
            if let Some(ssh) = fallback {
                self.telemetry
                    .counter("ssh_fallbacks", 1, &[("node", node.name.as_str())]);
                tracing::info!(node = %node.name, "Falling back to SSH");
                channel = ssh.kind();
                outcome = self.bounded(ssh.as_ref(), node, req, cancel).await;
            }
        }

        let duration = started.elapsed();
        let result = match outcome {
            Ok(resp) => NodeResult {
                node_index,
                node: node.name.clone(),
                chunk_index,
                channel,
                exit_code: Some(resp.exit_code),
                stdout: resp.stdout,
                stderr: resp.stderr,
                duration,
                error: None,
            },
            Err(e) => NodeResult {
                node_index,
                node: node.name.clone(),
                chunk_index,
                channel,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration,
                error: Some(e.on_node(node.name.clone(), "exec").to_string()),
            },
        };

        let channel_name = channel.to_string();
        let labels = [
            ("node", node.name.as_str()),
            ("channel", channel_name.as_str()),
        ];
        self.telemetry
            .timer("node_execution_duration", duration, &labels);
        if result.success() {
            self.telemetry.counter("node_executions_successful", 1, &labels);
            tracing::info!(
                node = %node.name,
                chunk = chunk_index,
                %channel,
                duration_ms = duration.as_millis() as u64,
                "Node execution succeeded"
            );
        } else {
            self.telemetry.counter("node_executions_failed", 1, &labels);
            tracing::warn!(
                node = %node.name,
                chunk = chunk_index,
                %channel,
                exit_code = ?result.exit_code,
                error = ?result.error,
                "Node execution failed"
            );
        }
        result
    }

    /// Execute with the per-node deadline: request timeout plus slack.
    async fn bounded(
        &self,
        channel: &dyn NodeChannel,
        node: &Node,
        req: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecResponse> {
        if req.timeout_seconds == 0 {
            return channel.execute(node, req, cancel).await;
        }
        let deadline = Duration::from_secs(req.timeout_seconds) + self.config.deadline_slack;
        match tokio::time::timeout(deadline, channel.execute(node, req, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::Timeout(format!(
                "no result from {} within {:?}",
                node.name, deadline
            ))),
        }
    }

    fn record_run(&self, report: &FleetReport) {
        let labels = [("task", report.task.as_str())];
        self.telemetry.timer("task_duration", report.duration, &labels);
        self.telemetry
            .counter("task_executions_successful", report.successful() as u64, &labels);
        self.telemetry
            .counter("task_executions_failed", report.failed() as u64, &labels);
        if let Some(rate) = report.success_rate() {
            self.telemetry
                .gauge("task_success_rate_percent", rate, &labels);
        }
        match report.status() {
            RunStatus::Succeeded => self
                .telemetry
                .counter("tasks_completed_successfully", 1, &labels),
            RunStatus::Failed => self
                .telemetry
                .counter("tasks_completed_with_failures", 1, &labels),
        }
    }
}

fn cancelled_result(node_index: usize, node: &Node, chunk_index: usize) -> NodeResult {
    NodeResult {
        node_index,
        node: node.name.clone(),
        chunk_index,
        channel: Channel::Agent,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        duration: Duration::ZERO,
        error: Some(FleetError::Cancelled.to_string()),
    }
}
