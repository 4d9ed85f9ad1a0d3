use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::agent::ExecRequest;
use crate::error::{FleetError, Result};
use crate::transport::shell_quote;

/// Token in a task's `args` replaced by the path of the staged chunk file.
pub const ITEM_PLACEHOLDER: &str = "{{ item }}";

/// A task module: one command applied to every chunk of the inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Input files, read line by line.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Items per chunk; `<= 0` runs the whole input as one chunk.
    #[serde(default)]
    pub chunk_size: i64,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
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

    pub fn with_chunk_size(mut self, size: i64) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let spec: TaskSpec = serde_yaml::from_str(text)
            .map_err(|e| FleetError::Config(format!("invalid task module: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            FleetError::Config(format!("cannot read task {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FleetError::Config("task name is empty".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(FleetError::Config(format!(
                "task {} has no command",
                self.name
            )));
        }
        Ok(())
    }

    /// Build the request a node runs for one chunk.
    ///
    /// Caller environment wins over the task's on key collision. A non-empty
    /// chunk is sent as stdin to a wrapper that stages it at
    /// `ctx.chunk_path` before exec'ing the task command, with every
    /// `{{ item }}` in `args` replaced by that path.
    pub fn render(&self, chunk: &[String], ctx: &RenderContext<'_>) -> ExecRequest {
        let mut env = self.env.clone();
        for (k, v) in ctx.env {
            env.insert(k.clone(), v.clone());
        }
        let env = env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        if chunk.is_empty() {
            return ExecRequest {
                command: self.command.clone(),
                args: self.args.clone(),
                env,
                timeout_seconds: ctx.timeout_seconds,
                ..ExecRequest::default()
            };
        }

        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(ITEM_PLACEHOLDER, ctx.chunk_path))
            .collect();

        let mut script = format!(
            "mkdir -p {} && cat > {} && exec {}",
            shell_quote(parent_dir(ctx.chunk_path)),
            shell_quote(ctx.chunk_path),
            shell_quote(&self.command)
        );
        for arg in &args {
            script.push(' ');
            script.push_str(&shell_quote(arg));
        }

        let mut input = chunk.join("\n");
        input.push('\n');

        ExecRequest {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script],
            env,
            timeout_seconds: ctx.timeout_seconds,
            work_dir: String::new(),
            input,
        }
    }
}

/// Per-run values applied while rendering a chunk.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub env: &'a BTreeMap<String, String>,
    pub timeout_seconds: u64,
    /// Where the chunk is staged on the node.
    pub chunk_path: &'a str,
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}
