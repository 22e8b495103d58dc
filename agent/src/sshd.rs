// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sshd daemon.
//!
//! sshd runs as a foreground child for the pod's whole lifetime. If it
//! dies on its own that is an error worth restarting the pod over; on
//! shutdown the daemon kills it and waits for the corpse before
//! reporting a clean stop.

use anyhow::Context;
use slog::error;
use slog::info;
use slog::Logger;
use tokio::sync::oneshot;

use greenplum_common::executor::BoxedExecutor;
use greenplum_common::executor::Child;
use greenplum_common::executor::Executor;

use crate::multidaemon::ShutdownSignal;

pub struct SshDaemon {
    executor: BoxedExecutor,
    log: Logger,
}

impl SshDaemon {
    pub fn new(executor: BoxedExecutor, log: Logger) -> SshDaemon {
        SshDaemon { executor, log }
    }

    pub async fn run(
        self,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), anyhow::Error> {
        info!(self.log, "starting SSH daemon");

        let mut command = tokio::process::Command::new("/usr/bin/sudo");
        command.args(["/usr/sbin/sshd", "-D"]);
        let mut child = self
            .executor
            .spawn(&mut command)
            .context("failed to start SSH in daemon mode")?;
        let pid = child.id();

        let (exit_tx, mut exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = exit_tx.send(child.wait().await);
        });

        tokio::select! {
            // Shutdown requested: kill the sshd process, then wait for
            // it to actually exit.
            _ = shutdown.wait() => {
                info!(self.log, "killing sshd"; "pid" => pid);
                let mut kill = tokio::process::Command::new("/usr/bin/sudo");
                kill.args(["/bin/kill", "-SIGKILL", &pid.to_string()]);
                if let Err(err) = self.executor.execute(&mut kill).await {
                    error!(self.log, "failed to kill sshd"; "error" => %err);
                    return Ok(());
                }
                let _ = exit_rx.await;
                Ok(())
            }
            // The sshd process died underneath us.
            exited = &mut exit_rx => {
                let status = exited.context("sshd wait channel closed")?;
                error!(self.log, "sshd process terminated");
                match status {
                    Ok(status) => {
                        anyhow::bail!("sshd is not running: exited with {status}")
                    }
                    Err(err) => Err(anyhow::Error::new(err)
                        .context("sshd is not running")),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::multidaemon::shutdown_channel;
    use crate::test_helpers::log;
    use greenplum_common::executor::FakeExecutor;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    #[tokio::test]
    async fn test_child_death_is_an_error() {
        let fake = FakeExecutor::new();
        let daemon = SshDaemon::new(fake.clone().as_executor(), log());
        let (_trigger, signal) = shutdown_channel();

        let task = tokio::spawn(daemon.run(signal));
        tokio::task::yield_now().await;

        // Simulate sshd dying with a failure status.
        fake.exit_child(1, ExitStatus::from_raw(1 << 8));
        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("sshd is not running"));
    }

    #[tokio::test]
    async fn test_shutdown_kills_child_and_returns_clean() {
        let fake = FakeExecutor::new();
        let daemon = SshDaemon::new(fake.clone().as_executor(), log());
        let (trigger, signal) = shutdown_channel();

        let task = tokio::spawn(daemon.run(signal));
        tokio::task::yield_now().await;

        trigger.trigger();
        tokio::task::yield_now().await;
        // The daemon issued the kill; let the "process" exit.
        fake.exit_child(1, ExitStatus::from_raw(9));

        let result = task.await.unwrap();
        assert!(result.is_ok(), "expected clean shutdown: {result:?}");

        let history = fake.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].program, "/usr/bin/sudo");
        assert_eq!(history[0].args, vec!["/usr/sbin/sshd", "-D"]);
        assert_eq!(history[1].args, vec!["/bin/kill", "-SIGKILL", "1"]);
    }
}
