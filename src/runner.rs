//! External command execution in a host working directory.
//!
//! Every interaction with the virtualization tool goes through the [`Runner`]
//! trait so the probe and cleanup logic can be exercised against a recording
//! fake in tests. The production implementation spawns real processes with
//! `tokio::process::Command`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Everything an external command needs to know about the host it operates
/// on: the working directory holding the tool configuration and key material,
/// and the merged environment variables.
///
/// Threaded explicitly into every component; there is no global state.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub workdir: PathBuf,
    pub envs: Vec<(String, String)>,
}

impl HostContext {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            envs: Vec::new(),
        }
    }

    pub fn with_envs(mut self, envs: Vec<(String, String)>) -> Self {
        self.envs = envs;
        self
    }
}

/// Runs external commands for the probe and cleanup flows.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command, streaming its output to the operator's terminal.
    ///
    /// A non-zero exit status is an error.
    async fn run(&self, ctx: &HostContext, program: &str, args: &[&str]) -> Result<()>;

    /// Run a command and capture its combined stdout + stderr.
    ///
    /// A non-zero exit status is an error carrying the captured output.
    async fn run_capture(&self, ctx: &HostContext, program: &str, args: &[&str])
    -> Result<String>;
}

/// The production [`Runner`]: spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(&self, ctx: &HostContext, program: &str, args: &[&str]) -> Result<()> {
        let mut cmd = command(ctx, program, args);
        debug!(program, ?args, workdir = %ctx.workdir.display(), "running external command");
        let status = cmd
            .status()
            .await
            .map_err(|e| spawn_error(program, args, &e))?;
        if !status.success() {
            return Err(Error::CommandFailed {
                command: render_command(program, args),
                output: format!("process exited with {status}"),
            });
        }
        Ok(())
    }

    async fn run_capture(
        &self,
        ctx: &HostContext,
        program: &str,
        args: &[&str],
    ) -> Result<String> {
        let mut cmd = command(ctx, program, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(program, ?args, workdir = %ctx.workdir.display(), "capturing external command");
        let output = cmd
            .output()
            .await
            .map_err(|e| spawn_error(program, args, &e))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: render_command(program, args),
                output: combined,
            });
        }
        Ok(combined)
    }
}

fn command(ctx: &HostContext, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&ctx.workdir)
        .envs(ctx.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    cmd
}

fn render_command(program: &str, args: &[&str]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

fn spawn_error(program: &str, args: &[&str], source: &std::io::Error) -> Error {
    Error::CommandFailed {
        command: render_command(program, args),
        output: format!("failed to start process: {source}"),
    }
}
