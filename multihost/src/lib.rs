// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fan-out of a single operation across a list of cluster hosts.
//!
//! Cluster sizes are small and bounded, so each host gets its own tokio
//! task with no parallelism cap. Failures never short-circuit the batch:
//! every host is visited exactly once and every failure is reported, so
//! callers can see the full failure surface of a rollout rather than just
//! the first unlucky host.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

/// An action performed against a single host by name.
///
/// Implementations cover DNS resolution, remote command execution, and
/// trust-entry waiting; anything host-addressable plugs into
/// [`parallel_foreach`].
#[async_trait]
pub trait HostOperation: Send + Sync + 'static {
    async fn execute(&self, host: &str) -> Result<(), anyhow::Error>;
}

/// Performs an operation for every host in a hostname list, in parallel.
///
/// On success, returns an empty vector. On failure, returns the
/// accumulated per-host errors in no particular order; one error per
/// failing host.
pub async fn parallel_foreach<O>(
    operation: Arc<O>,
    hostnames: &[String],
) -> Vec<anyhow::Error>
where
    O: HostOperation + ?Sized,
{
    let mut tasks = JoinSet::new();
    for hostname in hostnames {
        let operation = Arc::clone(&operation);
        let hostname = hostname.clone();
        tasks.spawn(async move { operation.execute(&hostname).await });
    }

    let mut errors = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result.expect("host operation task panicked") {
            errors.push(err);
        }
    }
    errors
}
