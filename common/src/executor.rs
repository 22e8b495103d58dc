// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around host command execution.
//!
//! Everything that shells out does so through the [`Executor`] trait so
//! that tests can substitute a [`FakeExecutor`] instead of patching
//! process internals.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::process::Output;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use slog::debug;
use slog::info;
use slog::Logger;
use tokio::sync::mpsc;

pub fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

#[derive(Debug)]
pub struct CommandFailureInfo {
    command: String,
    status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandFailureInfo {
    pub fn status(&self) -> ExitStatus {
        self.status
    }
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("Failed to wait on [{command}]: {err}")]
    ExecutionWait { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

pub fn output_to_exec_error(
    command: &std::process::Command,
    output: &Output,
) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Convenience constructors for [`Output`] values, mostly useful when
/// writing [`FakeExecutor`] handlers.
pub trait OutputExt {
    fn success() -> Output;
    fn failure(code: i32) -> Output;
}

impl OutputExt for Output {
    fn success() -> Output {
        Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    fn failure(code: i32) -> Output {
        Output {
            // Format a raw wait status with the exit code in the high byte.
            status: ExitStatus::from_raw((code & 0xff) << 8),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

/// The commonly-used "safe-to-reference" type describing the executor as
/// a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;
pub type BoxedChild = Box<dyn Child>;

/// Describes an "executor", which can run commands and return a response.
///
/// - In production, this is usually simply a [`HostExecutor`].
/// - Under test, a [`FakeExecutor`] may be used.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a command, waiting for it to complete, and returning
    /// output. A non-zero exit status is reported as
    /// [`ExecutionError::CommandFailure`].
    async fn execute(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError>;

    /// Spawns a command, without waiting for it to complete.
    fn spawn(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<BoxedChild, ExecutionError>;
}

/// A spawned child process, owned by whoever called [`Executor::spawn`].
#[async_trait]
pub trait Child: Send {
    fn id(&self) -> u32;

    /// Waits for the child to exit.
    async fn wait(&mut self) -> Result<ExitStatus, ExecutionError>;
}

/// Executes commands on the host.
pub struct HostExecutor {
    log: Logger,
    counter: AtomicU32,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<HostExecutor> {
        Arc::new(HostExecutor { log, counter: AtomicU32::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn log_output(&self, id: u32, output: &Output) {
        info!(
            self.log,
            "finished running command";
            "id" => id,
            "result" => if output.status.success() { "OK" } else { "ERROR" }
        );
        if !output.stdout.is_empty() {
            debug!(
                self.log,
                "finished command stdout";
                "id" => id,
                "stdout" => String::from_utf8_lossy(&output.stdout).to_string()
            );
        }
        if !output.stderr.is_empty() {
            debug!(
                self.log,
                "finished command stderr";
                "id" => id,
                "stderr" => String::from_utf8_lossy(&output.stderr).to_string()
            );
        }
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        info!(
            self.log,
            "running command";
            "id" => id,
            "command" => command_to_string(command.as_std())
        );
        let output = command.output().await.map_err(|err| {
            ExecutionError::ExecutionStart {
                command: command_to_string(command.as_std()),
                err,
            }
        })?;
        self.log_output(id, &output);

        if !output.status.success() {
            return Err(output_to_exec_error(command.as_std(), &output));
        }
        Ok(output)
    }

    fn spawn(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<BoxedChild, ExecutionError> {
        let command_str = command_to_string(command.as_std());
        info!(self.log, "spawning command"; "command" => &command_str);
        let child = command.spawn().map_err(|err| {
            ExecutionError::ExecutionStart { command: command_str.clone(), err }
        })?;
        let id = child.id().unwrap_or(0);
        Ok(Box::new(HostChild { id, command: command_str, child }))
    }
}

struct HostChild {
    id: u32,
    command: String,
    child: tokio::process::Child,
}

#[async_trait]
impl Child for HostChild {
    fn id(&self) -> u32 {
        self.id
    }

    async fn wait(&mut self) -> Result<ExitStatus, ExecutionError> {
        self.child.wait().await.map_err(|err| {
            ExecutionError::ExecutionWait { command: self.command.clone(), err }
        })
    }
}

/// A recorded invocation observed by a [`FakeExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInput {
    pub program: String,
    pub args: Vec<String>,
}

impl From<&std::process::Command> for ExecInput {
    fn from(command: &std::process::Command) -> ExecInput {
        ExecInput {
            program: command.get_program().to_string_lossy().to_string(),
            args: command
                .get_args()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect(),
        }
    }
}

pub type BoxedExecFn =
    Box<dyn FnMut(&ExecInput) -> Result<Output, ExecutionError> + Send>;

struct FakeExecutorInner {
    counter: AtomicU32,
    handler: Mutex<BoxedExecFn>,
    history: Mutex<Vec<ExecInput>>,
    children: Mutex<BTreeMap<u32, mpsc::UnboundedSender<ExitStatus>>>,
}

/// An executor that responds to commands with canned outputs and records
/// everything it was asked to run.
pub struct FakeExecutor {
    inner: Arc<FakeExecutorInner>,
}

impl FakeExecutor {
    pub fn new() -> Arc<FakeExecutor> {
        Arc::new(FakeExecutor {
            inner: Arc::new(FakeExecutorInner {
                counter: AtomicU32::new(1),
                handler: Mutex::new(Box::new(|_input| Ok(Output::success()))),
                history: Mutex::new(Vec::new()),
                children: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    /// Set the handler consulted by [`Executor::execute`].
    pub fn set_exec_handler(&self, handler: BoxedExecFn) {
        *self.inner.handler.lock().unwrap() = handler;
    }

    /// Every command executed or spawned so far, in order.
    pub fn history(&self) -> Vec<ExecInput> {
        self.inner.history.lock().unwrap().clone()
    }

    /// Makes the spawned child with the given pid exit. Children whose
    /// exit has not been triggered stay running (their `wait` pends).
    pub fn exit_child(&self, pid: u32, status: ExitStatus) {
        let children = self.inner.children.lock().unwrap();
        let sender = children
            .get(&pid)
            .unwrap_or_else(|| panic!("no spawned child with pid {pid}"));
        let _ = sender.send(status);
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let input = ExecInput::from(command.as_std());
        self.inner.history.lock().unwrap().push(input.clone());
        let result = {
            let mut handler = self.inner.handler.lock().unwrap();
            (*handler)(&input)
        };
        match result {
            Ok(output) if !output.status.success() => {
                Err(output_to_exec_error(command.as_std(), &output))
            }
            other => other,
        }
    }

    fn spawn(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<BoxedChild, ExecutionError> {
        let input = ExecInput::from(command.as_std());
        self.inner.history.lock().unwrap().push(input);
        let pid = self.inner.counter.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        self.inner.children.lock().unwrap().insert(pid, exit_tx);
        Ok(Box::new(FakeChild { pid, exit_rx }))
    }
}

pub struct FakeChild {
    pid: u32,
    exit_rx: mpsc::UnboundedReceiver<ExitStatus>,
}

#[async_trait]
impl Child for FakeChild {
    fn id(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<ExitStatus, ExecutionError> {
        match self.exit_rx.recv().await {
            Some(status) => Ok(status),
            // The executor went away; report a clean exit.
            None => Ok(ExitStatus::from_raw(0)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;

    fn log() -> Logger {
        use slog::Drain;
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, o!())
    }

    #[tokio::test]
    async fn test_host_executor_captures_stdout() {
        let executor = HostExecutor::new(log());
        let mut command = tokio::process::Command::new("echo");
        command.arg("hello");
        let output = executor.execute(&mut command).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
    }

    #[tokio::test]
    async fn test_host_executor_reports_failures() {
        let executor = HostExecutor::new(log());
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", "exit 3"]);
        let err = executor.execute(&mut command).await.unwrap_err();
        match err {
            ExecutionError::CommandFailure(info) => {
                assert_eq!(info.status().code(), Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_host_executor_missing_binary() {
        let executor = HostExecutor::new(log());
        let mut command =
            tokio::process::Command::new("/nonexistent/greenplum-tool");
        let err = executor.execute(&mut command).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionStart { .. }));
    }

    #[tokio::test]
    async fn test_fake_executor_records_history() {
        let fake = FakeExecutor::new();
        fake.set_exec_handler(Box::new(|input| {
            if input.program == "dnsdomainname" {
                Ok(Output {
                    stdout: b"svc.cluster.local\n".to_vec(),
                    ..Output::success()
                })
            } else {
                Ok(Output::failure(1))
            }
        }));

        let executor = fake.clone().as_executor();
        let output = executor
            .execute(&mut tokio::process::Command::new("dnsdomainname"))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"svc.cluster.local\n");

        let err = executor
            .execute(&mut tokio::process::Command::new("gpstart"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CommandFailure(_)));

        let history = fake.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].program, "dnsdomainname");
        assert_eq!(history[1].program, "gpstart");
    }

    #[tokio::test]
    async fn test_fake_child_exits_when_triggered() {
        let fake = FakeExecutor::new();
        let executor = fake.clone().as_executor();
        let mut child = executor
            .spawn(&mut tokio::process::Command::new("sshd"))
            .unwrap();
        let pid = child.id();

        fake.exit_child(pid, ExitStatus::from_raw(0));
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
