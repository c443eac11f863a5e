//! Built-in exec runner.
//!
//! Spawns a shell command and records `stdout`, `stderr` and `exit_code`.
//! A non-zero exit is recorded, not raised; use `test:` to assert on it.

use std::process::Stdio;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::runner::{RunContext, Runner, RunnerKind};
use super::step::ExecRequest;
use super::store::Record;
use crate::core::Error;

#[derive(Debug, Clone)]
pub struct ExecRunner {
    /// Whether the `run_exec` scope is granted
    allowed: bool,
}

impl Default for ExecRunner {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ExecRunner {
    pub fn new(allowed: bool) -> Self {
        Self { allowed }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Run `req`, killing the child if `cancel` fires first.
    pub async fn execute(&self, cancel: &CancellationToken, req: &ExecRequest) -> anyhow::Result<Record> {
        if !self.allowed {
            return Err(Error::ScopeDenied("run:exec").into());
        }

        let (shell, shell_arg) = get_shell(req.shell.as_deref());
        let mut cmd = Command::new(shell);
        cmd.arg(shell_arg)
            .arg(&req.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if req.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);

        if let Some(ref dir) = req.dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &req.env {
            cmd.env(key, value);
        }

        tracing::debug!(command = %req.command, "Executing");
        let mut child = cmd.spawn().with_context(|| format!("failed to spawn `{}`", req.command))?;

        if let Some(ref input) = req.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
            }
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            () = cancel.cancelled() => anyhow::bail!("`{}` cancelled", req.command),
        };

        let mut record = Record::new();
        record.insert("stdout".into(), Value::String(String::from_utf8_lossy(&output.stdout).into_owned()));
        record.insert("stderr".into(), Value::String(String::from_utf8_lossy(&output.stderr).into_owned()));
        record.insert("exit_code".into(), output.status.code().map_or(Value::Null, Value::from));
        Ok(record)
    }
}

#[async_trait]
impl Runner for ExecRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Exec
    }

    async fn run(&self, cx: &RunContext<'_>, request: &Value) -> anyhow::Result<Record> {
        let req = ExecRequest::from_value(request).map_err(anyhow::Error::msg)?;
        self.execute(cx.cancel, &req).await
    }
}

/// Get the shell and argument for the current platform.
fn get_shell(custom: Option<&str>) -> (&str, &'static str) {
    match custom {
        Some(shell) => (shell, "-c"),
        None if cfg!(target_os = "windows") => ("cmd", "/C"),
        None => ("sh", "-c"),
    }
}
