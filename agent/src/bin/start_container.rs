// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry point for the Greenplum container: prepares the gpadmin
//! environment, then supervises the pod's daemons until the platform
//! asks it to stop.

use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use slog::error;
use slog::info;

use greenplum_agent::controller::KnownHostsController;
use greenplum_agent::controller::KnownHostsReconciler;
use greenplum_agent::environment::GpadminEnvironment;
use greenplum_agent::init::pod_hostname;
use greenplum_agent::init::ClusterInitDaemon;
use greenplum_agent::multidaemon::initialize_daemons;
use greenplum_agent::multidaemon::shutdown_channel;
use greenplum_agent::multidaemon::DaemonFn;
use greenplum_agent::root_logger;
use greenplum_agent::cluster::GreenplumCluster;
use greenplum_agent::gpinitsystem::GpInitSystem;
use greenplum_agent::sshd::SshDaemon;
use greenplum_common::executor::HostExecutor;
use greenplum_common::instance_config::FsConfigReader;
use greenplum_common::poll::ConsistencyPolicy;
use greenplum_net::dns::ConsistentDnsResolver;
use greenplum_net::dns::SystemLookup;
use greenplum_net::keyscanner::SshKeyScanner;
use greenplum_net::known_hosts::FsKnownHostsReader;
use multihost::HostOperation;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let log = root_logger("start-container");
    let config = Arc::new(FsConfigReader::new());
    let executor = HostExecutor::new(log.clone()).as_executor();

    GpadminEnvironment::new(log.clone(), config.clone())
        .setup()
        .context("failed to prepare gpadmin environment")?;

    let hostname = pod_hostname()?;
    info!(log, "starting Greenplum container"; "hostname" => &hostname);

    let dns_resolver: Arc<dyn HostOperation> =
        Arc::new(ConsistentDnsResolver::new(
            SystemLookup::new().context("failed to build DNS resolver")?,
            ConsistencyPolicy::default(),
            log.clone(),
        ));
    let key_scanner = Arc::new(SshKeyScanner::new(log.clone()));
    let known_hosts_reader = Arc::new(FsKnownHostsReader::new());

    let gpinitsystem = GpInitSystem::new(
        executor.clone(),
        config.clone(),
        log.clone()
    );
    let cluster = Arc::new(GreenplumCluster::new(
        executor.clone(),
        config.clone(),
        gpinitsystem,
        log.clone(),
    ));

    let sshd = SshDaemon::new(executor.clone(), log.clone());
    let cluster_init = ClusterInitDaemon::new(
        log.clone(),
        hostname,
        executor.clone(),
        config.clone(),
        dns_resolver.clone(),
        key_scanner.clone(),
        known_hosts_reader.clone(),
        cluster
    );
    let controller = KnownHostsController::new(
        log.clone(),
        config.clone(),
        KnownHostsReconciler::new(
            log.clone(),
            dns_resolver,
            key_scanner,
            known_hosts_reader
        )
    );

    let daemons: Vec<DaemonFn> = vec![
        Box::new(move |shutdown| sshd.run(shutdown).boxed()),
        Box::new(move |shutdown| cluster_init.run(shutdown).boxed()),
        Box::new(move |shutdown| controller.run(shutdown).boxed()),
    ];

    // SIGTERM from the platform is the external stop signal.
    let (trigger, signal) = shutdown_channel();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate()
        )
        .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => (),
            _ = tokio::signal::ctrl_c() => (),
        }
        trigger.trigger();
    });

    let errors = initialize_daemons(signal, daemons, &log).await;
    if !errors.is_empty() {
        for err in &errors {
            error!(log, "daemon failed"; "error" => format!("{err:#}"));
        }
        anyhow::bail!("{} daemon(s) failed", errors.len());
    }
    Ok(())
}
