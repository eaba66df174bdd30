//! External command execution.
//!
//! Every stage talks to the outside world (container engine, cluster runner,
//! cluster CLI) through a [`CommandRunner`], so tests can swap in
//! [`crate::fakes::ScriptedRunner`].

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{DeployError, Result};

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    /// Arguments, already split.
    pub args: Vec<String>,

    /// Working directory (inherits when `None`).
    pub cwd: Option<PathBuf>,

    /// Timeout in seconds (0 = unbounded).
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout_secs: 0,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, trimmed. Used in error details.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        text
    }
}

/// A long-running child such as a port forward.
#[async_trait]
pub trait BackgroundProcess: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// `Some(code)` once the process has exited, without blocking.
    fn try_exit_code(&mut self) -> Result<Option<i32>>;

    /// Kill the process and wait for it to be reaped.
    async fn terminate(&mut self) -> Result<()>;

    /// Send a kill without waiting. Used from `Drop`.
    fn start_kill(&mut self);
}

/// Seam between stages and the operating system.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit is not an error here; callers decide what it means.
    /// Spawn failures and timeouts are errors.
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Start a command in the background.
    async fn spawn(&self, cmd: &CommandSpec) -> Result<Box<dyn BackgroundProcess>>;
}

/// Runs commands with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(cmd: &CommandSpec) -> Command {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args).kill_on_drop(true);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        command
    }

    fn spawn_error(cmd: &CommandSpec, source: std::io::Error) -> DeployError {
        DeployError::Spawn {
            program: cmd.program.clone(),
            source,
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let start = Instant::now();
        debug!(command = %cmd, "Running command");

        let child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(cmd, e))?;

        let output = if cmd.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(cmd.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| DeployError::CommandTimeout {
                command: cmd.to_string(),
                secs: cmd.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            command = %cmd,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "Command finished"
        );
        Ok(result)
    }

    async fn spawn(&self, cmd: &CommandSpec) -> Result<Box<dyn BackgroundProcess>> {
        debug!(command = %cmd, "Spawning background command");
        let child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Self::spawn_error(cmd, e))?;
        Ok(Box::new(ChildProcess { child }))
    }
}

/// [`BackgroundProcess`] backed by a real child process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl BackgroundProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        Ok(())
    }

    fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display() {
        let cmd = CommandSpec::new("docker")
            .args(["build", "-t", "web:latest"])
            .arg(".");
        assert_eq!(cmd.to_string(), "docker build -t web:latest .");
    }

    #[test]
    fn test_output_combined() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: "step 1\n".to_string(),
            stderr: "boom\n".to_string(),
            duration_ms: 0,
        };
        assert_eq!(output.combined(), "step 1\nboom");
        assert_eq!(CommandOutput::failed(2, "only err").combined(), "only err");
        assert!(!output.success());
        assert!(CommandOutput::ok("").success());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let output = SystemRunner
            .run(&CommandSpec::new("echo").arg("hello"))
            .await
            .expect("execute failed");
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let output = SystemRunner
            .run(&CommandSpec::new("false"))
            .await
            .expect("execute failed");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let err = SystemRunner
            .run(&CommandSpec::new("dockside-definitely-not-installed"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let err = SystemRunner
            .run(&CommandSpec::new("sleep").arg("5").timeout_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "command_timeout");
    }

    #[tokio::test]
    async fn test_background_process_terminates() {
        let mut process = SystemRunner
            .spawn(&CommandSpec::new("sleep").arg("30"))
            .await
            .expect("spawn");
        assert!(process.try_exit_code().unwrap().is_none());
        process.terminate().await.unwrap();
        assert!(process.try_exit_code().unwrap().is_some());
    }
}
