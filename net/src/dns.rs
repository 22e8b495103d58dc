// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DNS convergence checks.
//!
//! A pod's DNS record can flap while the pod becomes ready, so a single
//! successful lookup is not proof of anything. [`ConsistentDnsResolver`]
//! only reports a host resolvable once lookups have held steady for a
//! full confirmation run (see `greenplum_common::poll`).

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;

use greenplum_common::poll::poll_until_consistent;
use greenplum_common::poll::ConsistencyPolicy;
use multihost::HostOperation;

/// Hostname lookup, injected so the convergence logic is testable
/// without a resolver.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup_host(&self, host: &str) -> Result<(), anyhow::Error>;
}

/// Resolves through the system configuration (`/etc/resolv.conf`).
pub struct SystemLookup {
    resolver: TokioAsyncResolver,
}

impl SystemLookup {
    pub fn new() -> Result<SystemLookup, anyhow::Error> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(SystemLookup { resolver })
    }
}

#[async_trait]
impl Lookup for SystemLookup {
    async fn lookup_host(&self, host: &str) -> Result<(), anyhow::Error> {
        self.resolver.lookup_ip(host).await?;
        Ok(())
    }
}

/// A [`HostOperation`] that succeeds once a host's DNS entry resolves
/// consistently.
pub struct ConsistentDnsResolver<L> {
    lookup: L,
    policy: ConsistencyPolicy,
    log: Logger,
}

impl<L: Lookup> ConsistentDnsResolver<L> {
    pub fn new(
        lookup: L,
        policy: ConsistencyPolicy,
        log: Logger,
    ) -> ConsistentDnsResolver<L> {
        ConsistentDnsResolver { lookup, policy, log }
    }
}

#[async_trait]
impl<L: Lookup + 'static> HostOperation for ConsistentDnsResolver<L> {
    async fn execute(&self, host: &str) -> Result<(), anyhow::Error> {
        let log = self.log.new(o!("host" => host.to_string()));
        debug!(log, "attempting to resolve DNS entry");
        let result = poll_until_consistent(&self.policy, || async {
            self.lookup.lookup_host(host).await.is_ok()
        })
        .await;
        match result {
            Ok(()) => {
                debug!(log, "resolved DNS entry");
                Ok(())
            }
            Err(err) => {
                warn!(log, "failed to resolve DNS entry"; "error" => %err);
                Err(anyhow::anyhow!("DNS lookup timed out for {host}"))
            }
        }
    }
}
