//! In-memory fakes for the command seam (testing only)
//!
//! `ScriptedRunner` answers command lines from a script keyed by prefix and
//! records every invocation, so stage logic can be tested without docker,
//! minikube or kubectl on the machine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::command::{BackgroundProcess, CommandOutput, CommandRunner, CommandSpec};
use crate::error::{DeployError, Result};

// ---------------------------------------------------------------------------
// Scripted responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    NotFound,
    Timeout,
}

#[derive(Debug)]
struct Rule {
    prefix: String,
    // The last response repeats once the queue is down to one.
    responses: VecDeque<Scripted>,
}

/// How a spawned fake process behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeSpawn {
    /// Keeps running until terminated.
    Running,
    /// Has already exited with this code.
    Exits(i32),
    /// Runs for `polls` calls to `try_exit_code`, then exits with `code`.
    ExitsAfter { polls: u32, code: i32 },
}

/// Observable state of a process handed out by [`ScriptedRunner::spawn`].
#[derive(Debug)]
pub struct FakeProcessHandle {
    pub command: String,
    terminated: AtomicBool,
}

impl FakeProcessHandle {
    /// Whether the owner killed the process (via `terminate` or `start_kill`).
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

struct FakeProcess {
    handle: Arc<FakeProcessHandle>,
    behaviour: FakeSpawn,
    polls: u32,
}

#[async_trait]
impl BackgroundProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        if self.handle.terminated() {
            return Ok(Some(-1));
        }
        let exit = match self.behaviour {
            FakeSpawn::Running => None,
            FakeSpawn::Exits(code) => Some(code),
            FakeSpawn::ExitsAfter { polls, code } => (self.polls >= polls).then_some(code),
        };
        self.polls += 1;
        Ok(exit)
    }

    async fn terminate(&mut self) -> Result<()> {
        self.handle.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start_kill(&mut self) {
        self.handle.terminated.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// Command runner driven by a script.
///
/// The longest registered prefix matching the rendered command line wins.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    spawn_rules: Mutex<Vec<(String, FakeSpawn)>>,
    calls: Mutex<Vec<String>>,
    spawned: Mutex<Vec<Arc<FakeProcessHandle>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, prefix: &str, response: Scripted) {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.prefix == prefix) {
            Some(rule) => rule.responses.push_back(response),
            None => rules.push(Rule {
                prefix: prefix.to_string(),
                responses: VecDeque::from([response]),
            }),
        }
    }

    /// Queue an output for commands starting with `prefix`.
    pub fn on(&self, prefix: &str, output: CommandOutput) -> &Self {
        self.push(prefix, Scripted::Output(output));
        self
    }

    /// Shorthand for a successful output.
    pub fn ok(&self, prefix: &str, stdout: &str) -> &Self {
        self.on(prefix, CommandOutput::ok(stdout))
    }

    /// Shorthand for a failed output.
    pub fn fail(&self, prefix: &str, exit_code: i32, stderr: &str) -> &Self {
        self.on(prefix, CommandOutput::failed(exit_code, stderr))
    }

    /// Make matching commands fail to spawn as if the binary were absent.
    pub fn not_found(&self, prefix: &str) -> &Self {
        self.push(prefix, Scripted::NotFound);
        self
    }

    /// Make matching commands time out.
    pub fn timeout(&self, prefix: &str) -> &Self {
        self.push(prefix, Scripted::Timeout);
        self
    }

    /// Behaviour of background commands starting with `prefix`.
    pub fn on_spawn(&self, prefix: &str, behaviour: FakeSpawn) -> &Self {
        self.spawn_rules
            .lock()
            .unwrap()
            .push((prefix.to_string(), behaviour));
        self
    }

    /// Every command line seen so far, in order (runs and spawns).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether any recorded command starts with `prefix`.
    pub fn was_called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    /// Number of recorded commands starting with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Handles of every spawned process.
    pub fn spawned(&self) -> Vec<Arc<FakeProcessHandle>> {
        self.spawned.lock().unwrap().clone()
    }

    fn next_response(&self, line: &str) -> Option<Scripted> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .filter(|r| line.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len())?;
        if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let line = cmd.to_string();
        self.calls.lock().unwrap().push(line.clone());

        match self.next_response(&line) {
            None => Ok(CommandOutput::ok("")),
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::NotFound) => Err(DeployError::Spawn {
                program: cmd.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }),
            Some(Scripted::Timeout) => Err(DeployError::CommandTimeout {
                command: line,
                secs: cmd.timeout_secs,
            }),
        }
    }

    async fn spawn(&self, cmd: &CommandSpec) -> Result<Box<dyn BackgroundProcess>> {
        let line = cmd.to_string();
        self.calls.lock().unwrap().push(line.clone());

        let behaviour = self
            .spawn_rules
            .lock()
            .unwrap()
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, b)| *b)
            .unwrap_or(FakeSpawn::Running);

        let handle = Arc::new(FakeProcessHandle {
            command: line,
            terminated: AtomicBool::new(false),
        });
        self.spawned.lock().unwrap().push(handle.clone());

        Ok(Box::new(FakeProcess {
            handle,
            behaviour,
            polls: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let runner = ScriptedRunner::new();
        runner.ok("kubectl", "generic");
        runner.ok("kubectl config current-context", "minikube");

        let out = runner
            .run(&CommandSpec::new("kubectl").args(["config", "current-context"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "minikube");

        let out = runner
            .run(&CommandSpec::new("kubectl").arg("version"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "generic");
    }

    #[tokio::test]
    async fn test_queue_then_repeat_last() {
        let runner = ScriptedRunner::new();
        runner.fail("probe", 1, "first").ok("probe", "second");

        let cmd = CommandSpec::new("probe");
        assert!(!runner.run(&cmd).await.unwrap().success());
        assert_eq!(runner.run(&cmd).await.unwrap().stdout, "second");
        assert_eq!(runner.run(&cmd).await.unwrap().stdout, "second");
        assert_eq!(runner.call_count("probe"), 3);
    }

    #[tokio::test]
    async fn test_not_found_and_unmatched() {
        let runner = ScriptedRunner::new();
        runner.not_found("jq");
        let err = runner.run(&CommandSpec::new("jq")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(runner.run(&CommandSpec::new("true")).await.unwrap().success());
    }

    #[tokio::test]
    async fn test_spawn_records_termination() {
        let runner = ScriptedRunner::new();
        runner.on_spawn("kubectl port-forward", FakeSpawn::Exits(1));

        let mut process = runner
            .spawn(&CommandSpec::new("kubectl").arg("port-forward"))
            .await
            .unwrap();
        assert_eq!(process.try_exit_code().unwrap(), Some(1));
        process.terminate().await.unwrap();
        assert!(runner.spawned()[0].terminated());
    }

    #[tokio::test]
    async fn test_spawn_exits_after_polls() {
        let runner = ScriptedRunner::new();
        runner.on_spawn("kubectl port-forward", FakeSpawn::ExitsAfter { polls: 2, code: 1 });

        let mut process = runner
            .spawn(&CommandSpec::new("kubectl").arg("port-forward"))
            .await
            .unwrap();
        assert_eq!(process.try_exit_code().unwrap(), None);
        assert_eq!(process.try_exit_code().unwrap(), None);
        assert_eq!(process.try_exit_code().unwrap(), Some(1));
        assert!(!runner.spawned()[0].terminated());
    }
}
