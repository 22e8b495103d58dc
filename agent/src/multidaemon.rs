// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervision of the agent's long-running daemons.
//!
//! All daemons share one cancellation signal. The first daemon to fail
//! trips it for everyone else, as does the external stop signal; either
//! way the supervisor waits for every daemon to return before reporting,
//! so shutdown is always clean rather than abandoned.

use futures::future::BoxFuture;
use slog::error;
use slog::Logger;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// A long-running background task. It must watch the provided
/// [`ShutdownSignal`] and return promptly once it fires.
pub type DaemonFn = Box<
    dyn FnOnce(ShutdownSignal) -> BoxFuture<'static, Result<(), anyhow::Error>>
        + Send,
>;

/// Cooperative stop signal handed to every daemon.
#[derive(Clone)]
pub struct ShutdownSignal {
    stop: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been requested.
    pub async fn wait(&mut self) {
        // A dropped sender also means it is time to stop.
        let _ = self.stop.wait_for(|stopped| *stopped).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

pub struct ShutdownTrigger {
    stop: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.stop.send(true);
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { stop: tx }, ShutdownSignal { stop: rx })
}

/// Runs every daemon concurrently until all of them have returned.
///
/// Cancellation is derived from `external_stop` and additionally tripped
/// by the first daemon that returns an error. The returned errors are in
/// completion order, which is not start order.
pub async fn initialize_daemons(
    mut external_stop: ShutdownSignal,
    daemons: Vec<DaemonFn>,
    log: &Logger,
) -> Vec<anyhow::Error> {
    let (trigger, signal) = shutdown_channel();
    let trigger = Arc::new(trigger);

    let forwarder = tokio::spawn({
        let trigger = Arc::clone(&trigger);
        async move {
            external_stop.wait().await;
            trigger.trigger();
        }
    });

    let mut tasks = JoinSet::new();
    for daemon in daemons {
        tasks.spawn(daemon(signal.clone()));
    }

    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => (),
            Ok(Err(err)) => {
                error!(log, "daemon failed"; "error" => format!("{err:#}"));
                trigger.trigger();
                errors.push(err);
            }
            Err(join_err) => {
                error!(log, "daemon panicked"; "error" => %join_err);
                trigger.trigger();
                errors.push(anyhow::Error::new(join_err));
            }
        }
    }
    forwarder.abort();
    errors
}
