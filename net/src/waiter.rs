// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for trust entries to appear.
//!
//! Pods that are not responsible for scanning keys themselves (gpexpand
//! jobs, helper containers) block on the trust store instead: the
//! controller will append the entry once the host is ready.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;

use greenplum_common::poll::wait_for_condition;
use greenplum_common::poll::CondCheckError;
use multihost::HostOperation;

use crate::known_hosts::host_public_key;
use crate::known_hosts::KnownHostsError;
use crate::known_hosts::KnownHostsReader;
use crate::known_hosts::LookupKeyError;

pub const KNOWN_HOSTS_WAIT_INTERVAL: Duration = Duration::from_secs(1);
pub const KNOWN_HOSTS_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// A [`HostOperation`] that succeeds once the trust store holds an entry
/// for the host.
pub struct KnownHostsWaiter {
    reader: Arc<dyn KnownHostsReader>,
    log: Logger,
    interval: Duration,
    timeout: Duration,
}

impl KnownHostsWaiter {
    pub fn new(
        reader: Arc<dyn KnownHostsReader>,
        log: Logger,
    ) -> KnownHostsWaiter {
        KnownHostsWaiter {
            reader,
            log,
            interval: KNOWN_HOSTS_WAIT_INTERVAL,
            timeout: KNOWN_HOSTS_WAIT_TIMEOUT,
        }
    }

    /// Overrides the poll budget; used by tests.
    pub fn with_timeouts(
        mut self,
        interval: Duration,
        timeout: Duration,
    ) -> KnownHostsWaiter {
        self.interval = interval;
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HostOperation for KnownHostsWaiter {
    async fn execute(&self, host: &str) -> Result<(), anyhow::Error> {
        let log = self.log.new(o!("host" => host.to_string()));
        debug!(log, "waiting for known_hosts entry");
        let result = wait_for_condition(
            || async {
                match host_public_key(&*self.reader, host).await {
                    Ok(_) => Ok(()),
                    // Not scanned yet; the next reconcile may add it.
                    Err(LookupKeyError::NotFound(_)) => {
                        Err(CondCheckError::NotYet)
                    }
                    Err(LookupKeyError::KnownHosts(err)) => {
                        Err(CondCheckError::<KnownHostsError>::Failed(err))
                    }
                }
            },
            &self.interval,
            &self.timeout
        )
        .await;
        match result {
            Ok(()) => {
                debug!(log, "found known_hosts entry");
                Ok(())
            }
            Err(err) => {
                warn!(
                    log,
                    "failed waiting for known_hosts entry";
                    "error" => %err
                );
                Err(anyhow::Error::new(err)
                    .context(format!("waiting for known_hosts entry for {host}")))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::known_hosts::FsKnownHostsReader;
    use crate::test_helpers::{log, KEY_A};
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn test_existing_entry_succeeds_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, format!("master-0 ssh-ed25519 {KEY_A}\n"))
            .unwrap();
        let waiter = KnownHostsWaiter::new(
            Arc::new(FsKnownHostsReader::with_path(&path)),
            log()
        );
        waiter.execute("master-0").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_entry_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let waiter = KnownHostsWaiter::new(
            Arc::new(FsKnownHostsReader::with_path(&path)),
            log()
        );
        let err = waiter.execute("segment-a-0").await.unwrap_err();
        assert!(err.to_string().contains("segment-a-0"));
    }

    #[tokio::test]
    async fn test_unparseable_store_aborts_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, format!("@revoked master-0 ssh-ed25519 {KEY_A}\n"))
            .unwrap();
        let waiter = KnownHostsWaiter::new(
            Arc::new(FsKnownHostsReader::with_path(&path)),
            log()
        );
        // No paused clock: a permanent parse error must not poll.
        let err = waiter.execute("master-0").await.unwrap_err();
        assert!(err
            .chain()
            .any(|cause| cause.to_string().contains("markers")));
    }
}
