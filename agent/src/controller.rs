// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keeps the trust store current as cluster membership changes.
//!
//! The controller watches the cluster's `agent` Endpoints and reconciles
//! on every add or update. Reconciliation is best-effort by design: a
//! failed batch is logged and dropped, because membership events are
//! delivered at-least-once and the next (re)delivery retries the same
//! hosts. Deletes are ignored; the trust map only grows.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::Api;
use kube::runtime::watcher;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;

use greenplum_common::file_writer;
use greenplum_common::instance_config::ConfigReader;
use greenplum_net::keyscanner::KeyScanner;
use greenplum_net::known_hosts::KnownHosts;
use greenplum_net::known_hosts::KnownHostsReader;
use greenplum_net::known_hosts::KNOWN_HOSTS_PATH;
use greenplum_net::scan::scan_host_keys;
use greenplum_net::scan::KEYSCAN_TIMEOUT;
use multihost::parallel_foreach;
use multihost::HostOperation;

/// The Endpoints resource carrying the cluster's pod addresses.
pub const AGENT_SERVICE_NAME: &str = "agent";

pub struct KnownHostsReconciler {
    log: Logger,
    dns_resolver: Arc<dyn HostOperation>,
    key_scanner: Arc<dyn KeyScanner>,
    known_hosts_reader: Arc<dyn KnownHostsReader>,
    known_hosts_path: Utf8PathBuf,
    scan_timeout: Duration,
}

impl KnownHostsReconciler {
    pub fn new(
        log: Logger,
        dns_resolver: Arc<dyn HostOperation>,
        key_scanner: Arc<dyn KeyScanner>,
        known_hosts_reader: Arc<dyn KnownHostsReader>,
    ) -> KnownHostsReconciler {
        KnownHostsReconciler {
            log,
            dns_resolver,
            key_scanner,
            known_hosts_reader,
            known_hosts_path: Utf8PathBuf::from(KNOWN_HOSTS_PATH),
            scan_timeout: KEYSCAN_TIMEOUT,
        }
    }

    /// Overrides the trust-file location and scan budget; used by tests.
    pub fn with_paths(
        mut self,
        known_hosts_path: impl AsRef<Utf8Path>,
        scan_timeout: Duration,
    ) -> KnownHostsReconciler {
        self.known_hosts_path = known_hosts_path.as_ref().to_owned();
        self.scan_timeout = scan_timeout;
        self
    }

    /// Brings the trust store up to date with one membership snapshot.
    /// Failures are logged, never returned: the next event retries.
    pub async fn reconcile(&self, endpoints: &Endpoints) {
        let known_hosts = match self.known_hosts_reader.known_hosts().await {
            Ok(known_hosts) => known_hosts,
            Err(err) => {
                error!(
                    self.log,
                    "unable to get known hosts";
                    "error" => %err
                );
                return;
            }
        };

        let new_ready_hosts = new_ready_hosts(&known_hosts, endpoints);
        if new_ready_hosts.is_empty() {
            return;
        }
        info!(
            self.log,
            "scanning ssh host key(s)";
            "hosts" => format!("{new_ready_hosts:?}")
        );

        let errors = parallel_foreach(
            Arc::clone(&self.dns_resolver),
            &new_ready_hosts
        )
        .await;
        if !errors.is_empty() {
            error!(
                self.log,
                "failed to resolve dns entries for all hosts";
                "hosts" => format!("{new_ready_hosts:?}")
            );
            return;
        }

        let new_entries = match scan_host_keys(
            Arc::clone(&self.key_scanner),
            &*self.known_hosts_reader,
            &new_ready_hosts,
            self.scan_timeout,
            &self.log
        )
        .await
        {
            Ok(new_entries) => new_entries,
            // The failure was already logged by the keyscanner.
            Err(_) => return,
        };

        if let Err(err) =
            file_writer::append(&self.known_hosts_path, &new_entries)
        {
            error!(
                self.log,
                "failed to write known_hosts file";
                "error" => %err
            );
        }
    }
}

/// The ready hostnames in `endpoints` that are not yet in the trust
/// store.
fn new_ready_hosts(
    known_hosts: &KnownHosts,
    endpoints: &Endpoints,
) -> Vec<String> {
    let mut ready: BTreeSet<String> = BTreeSet::new();
    for subset in endpoints.subsets.iter().flatten() {
        for address in subset.addresses.iter().flatten() {
            if let Some(hostname) = &address.hostname {
                ready.insert(hostname.clone());
            }
        }
    }
    ready
        .into_iter()
        .filter(|hostname| !known_hosts.contains_key(hostname))
        .collect()
}

/// Subscribes the reconciler to membership events for the cluster.
pub struct KnownHostsController {
    log: Logger,
    config: Arc<dyn ConfigReader>,
    reconciler: KnownHostsReconciler,
}

impl KnownHostsController {
    pub fn new(
        log: Logger,
        config: Arc<dyn ConfigReader>,
        reconciler: KnownHostsReconciler,
    ) -> KnownHostsController {
        KnownHostsController { log, config, reconciler }
    }

    /// Daemon entry point: watches the agent Endpoints until shutdown.
    pub async fn run(
        self,
        mut shutdown: crate::multidaemon::ShutdownSignal,
    ) -> Result<(), anyhow::Error> {
        let client = kube::Client::try_default()
            .await
            .context("failed to initialize client")?;
        let namespace =
            self.config.namespace().context("failed to read namespace")?;
        let cluster_name = self
            .config
            .greenplum_cluster_name()
            .context("failed to read greenplumcluster name")?;

        let api: Api<Endpoints> = Api::namespaced(client, &namespace);
        let watch_config = watcher::Config::default()
            .labels(&format!("greenplum-cluster={cluster_name}"))
            .fields(&format!("metadata.name={AGENT_SERVICE_NAME}"));
        let events = watcher(api, watch_config);
        tokio::pin!(events);

        info!(
            self.log,
            "watching cluster membership";
            "namespace" => &namespace,
            "cluster" => &cluster_name
        );
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                event = events.try_next() => match event {
                    Ok(Some(
                        watcher::Event::Apply(endpoints)
                        | watcher::Event::InitApply(endpoints),
                    )) => {
                        self.reconciler.reconcile(&endpoints).await;
                    }
                    // Deletes and init markers: the trust map only
                    // grows, so there is nothing to reconcile.
                    Ok(Some(_)) => (),
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        warn!(
                            self.log,
                            "membership watch error";
                            "error" => %err
                        );
                    }
                }
            }
        }
    }
}
