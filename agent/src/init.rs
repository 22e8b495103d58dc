// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Role-correct cluster bootstrap.
//!
//! Each pod decides once, from its own hostname, whether it is the
//! primary coordinator, the standby coordinator, or a segment, and then
//! either performs full cluster initialization, restarts an existing
//! database in place, or idles until the primary populates its storage.
//! Errors propagate out and terminate the attempt; the platform's
//! restart policy is the retry loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::error;
use slog::info;
use slog::Logger;

use greenplum_common::executor::BoxedExecutor;
use greenplum_common::executor::Executor;
use greenplum_common::file_writer;
use greenplum_common::host_list::generate_host_list;
use greenplum_common::instance_config::ConfigReader;
use greenplum_net::keyscanner::KeyScanner;
use greenplum_net::known_hosts::KnownHostsReader;
use greenplum_net::known_hosts::KNOWN_HOSTS_PATH;
use greenplum_net::scan::scan_host_keys;
use greenplum_net::scan::KEYSCAN_TIMEOUT;
use multihost::parallel_foreach;
use multihost::HostOperation;

use crate::cluster::dns_domain_name;
use crate::cluster::greenplum_command;
use crate::cluster::ClusterOps;
use crate::multidaemon::ShutdownSignal;

/// A pod's place in the cluster, derived from its hostname at startup
/// and fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    /// `master-0`: the coordinator that owns cluster initialization.
    Primary,
    /// `master-1`: the standby coordinator.
    Standby,
    /// Everything else: a segment host.
    Segment,
}

impl ClusterRole {
    pub fn from_hostname(hostname: &str) -> ClusterRole {
        match hostname {
            "master-0" => ClusterRole::Primary,
            "master-1" => ClusterRole::Standby,
            _ => ClusterRole::Segment,
        }
    }
}

/// Reads the pod's own hostname.
pub fn pod_hostname() -> Result<String, anyhow::Error> {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .context("failed to read hostname")?;
    Ok(hostname.trim().to_string())
}

pub struct ClusterInitDaemon {
    log: Logger,
    hostname: String,
    executor: BoxedExecutor,
    config: Arc<dyn ConfigReader>,
    dns_resolver: Arc<dyn HostOperation>,
    key_scanner: Arc<dyn KeyScanner>,
    known_hosts_reader: Arc<dyn KnownHostsReader>,
    cluster: Arc<dyn ClusterOps>,
    known_hosts_path: Utf8PathBuf,
    data_root: Utf8PathBuf,
    scan_timeout: Duration,
}

impl ClusterInitDaemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: Logger,
        hostname: String,
        executor: BoxedExecutor,
        config: Arc<dyn ConfigReader>,
        dns_resolver: Arc<dyn HostOperation>,
        key_scanner: Arc<dyn KeyScanner>,
        known_hosts_reader: Arc<dyn KnownHostsReader>,
        cluster: Arc<dyn ClusterOps>,
    ) -> ClusterInitDaemon {
        ClusterInitDaemon {
            log,
            hostname,
            executor,
            config,
            dns_resolver,
            key_scanner,
            known_hosts_reader,
            cluster,
            known_hosts_path: Utf8PathBuf::from(KNOWN_HOSTS_PATH),
            data_root: Utf8PathBuf::from("/greenplum"),
            scan_timeout: KEYSCAN_TIMEOUT,
        }
    }

    /// Overrides the filesystem locations and scan budget; used by
    /// tests.
    pub fn with_paths(
        mut self,
        data_root: impl AsRef<Utf8Path>,
        known_hosts_path: impl AsRef<Utf8Path>,
        scan_timeout: Duration,
    ) -> ClusterInitDaemon {
        self.data_root = data_root.as_ref().to_owned();
        self.known_hosts_path = known_hosts_path.as_ref().to_owned();
        self.scan_timeout = scan_timeout;
        self
    }

    /// Daemon entry point. Initialization happens on its own task so
    /// the other daemons start immediately; a failed bootstrap is
    /// logged, and the platform restarts the pod to retry.
    pub async fn run(
        self,
        _shutdown: ShutdownSignal,
    ) -> Result<(), anyhow::Error> {
        let log = self.log.clone();
        tokio::spawn(async move {
            if let Err(err) = self.initialize_cluster().await {
                error!(
                    log,
                    "failed to initialize cluster";
                    "error" => format!("{err:#}")
                );
            }
        });
        Ok(())
    }

    pub async fn initialize_cluster(&self) -> Result<(), anyhow::Error> {
        let role = ClusterRole::from_hostname(&self.hostname);
        let dns_suffix =
            format!(".{}", dns_domain_name(&self.executor).await?);
        let config =
            self.config.config_values().context("error reading configmap")?;
        let hostname_list = generate_host_list(
            config.segment_count,
            config.mirrors,
            config.standby,
            &dns_suffix
        );

        // Every role blocks until the whole expected membership resolves
        // consistently and is trusted, before touching the database.
        info!(self.log, "resolving DNS entries for all masters and segments");
        let errors =
            parallel_foreach(Arc::clone(&self.dns_resolver), &hostname_list)
                .await;
        if !errors.is_empty() {
            anyhow::bail!(
                "failed to resolve dns entries for all masters and segments"
            );
        }

        self.setup_passwordless_ssh(&hostname_list)
            .await
            .context("error setting up passwordless SSH")?;

        match role {
            ClusterRole::Primary => {
                self.initialize_primary(config.standby).await
            }
            ClusterRole::Standby | ClusterRole::Segment => {
                self.restart_if_initialized(role).await
            }
        }
    }

    async fn initialize_primary(
        &self,
        has_standby: bool,
    ) -> Result<(), anyhow::Error> {
        if self.preinitialized(ClusterRole::Primary) {
            info!(
                self.log,
                "cluster has been initialized before; starting Greenplum cluster"
            );
            if has_standby {
                // gpstart -am would promote the wrong coordinator when a
                // standby exists.
                info!(
                    self.log,
                    "automatic gpstart is not currently supported with \
                     standby masters; skipping"
                );
            } else {
                self.cluster.gpstart().await?;
            }
        } else {
            info!(self.log, "initializing Greenplum cluster");
            self.cluster.initialize().await?;
        }

        self.cluster.run_post_initialization().await
    }

    async fn restart_if_initialized(
        &self,
        role: ClusterRole,
    ) -> Result<(), anyhow::Error> {
        if !self.preinitialized(role) {
            // Storage is populated by the primary's initialization;
            // nothing to do until the pod is restarted with data.
            return Ok(());
        }
        info!(
            self.log,
            "cluster has been initialized before; starting Postgres"
        );
        self.pg_ctl_restart(role).await
    }

    async fn setup_passwordless_ssh(
        &self,
        hostname_list: &[String],
    ) -> Result<(), anyhow::Error> {
        info!(self.log, "started SSH keyscan");
        let new_entries = scan_host_keys(
            Arc::clone(&self.key_scanner),
            &*self.known_hosts_reader,
            hostname_list,
            self.scan_timeout,
            &self.log
        )
        .await
        .context("failed to scan segment host keys")?;
        file_writer::append(&self.known_hosts_path, &new_entries)
            .context("failed to write known_hosts file")?;
        Ok(())
    }

    fn data_dir(&self, role: ClusterRole) -> Utf8PathBuf {
        match role {
            ClusterRole::Primary | ClusterRole::Standby => {
                self.data_root.join("data-1")
            }
            ClusterRole::Segment => self.data_root.join("data"),
        }
    }

    fn preinitialized(&self, role: ClusterRole) -> bool {
        self.data_dir(role).exists()
    }

    async fn pg_ctl_restart(
        &self,
        role: ClusterRole,
    ) -> Result<(), anyhow::Error> {
        let data_dir = self.data_dir(role);
        let startup_log = data_dir.join("pg_log").join("startup.log");
        let mut command =
            greenplum_command("/usr/local/greenplum-db/bin/pg_ctl");
        command.args([
            "-D",
            data_dir.as_str(),
            "-l",
            startup_log.as_str(),
            "restart",
        ]);
        self.executor
            .execute(&mut command)
            .await
            .context("pg_ctl failed to restart")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::log;
    use async_trait::async_trait;
    use camino_tempfile::tempdir;
    use greenplum_common::executor::{FakeExecutor, OutputExt};
    use greenplum_common::instance_config::testing::StaticConfigReader;
    use greenplum_common::instance_config::ConfigValues;
    use greenplum_net::keyscanner::HostKey;
    use greenplum_net::known_hosts::FsKnownHostsReader;
    use std::process::Output;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    const KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIBSUXFbUgaE/LiByiy/Kmb7xIsbnZN5JwN7cNk0nZIoT";

    struct InstantDnsResolver;

    #[async_trait]
    impl HostOperation for InstantDnsResolver {
        async fn execute(&self, _host: &str) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    struct FailingDnsResolver;

    #[async_trait]
    impl HostOperation for FailingDnsResolver {
        async fn execute(&self, host: &str) -> Result<(), anyhow::Error> {
            anyhow::bail!("DNS lookup timed out for {host}")
        }
    }

    /// Returns the same key for every host.
    struct SameKeyScanner;

    #[async_trait]
    impl KeyScanner for SameKeyScanner {
        async fn scan(&self, host: &str, _timeout: Duration) -> HostKey {
            HostKey {
                hostname: host.to_string(),
                key: Ok(russh_keys::parse_public_key_base64(KEY).unwrap()),
            }
        }
    }

    #[derive(Default)]
    struct FakeClusterOps {
        initialize_calls: AtomicU32,
        gpstart_calls: AtomicU32,
        post_init_calls: AtomicU32,
    }

    #[async_trait]
    impl ClusterOps for FakeClusterOps {
        async fn initialize(&self) -> Result<(), anyhow::Error> {
            self.initialize_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn gpstart(&self) -> Result<(), anyhow::Error> {
            self.gpstart_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run_post_initialization(&self) -> Result<(), anyhow::Error> {
            self.post_init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        daemon: ClusterInitDaemon,
        fake_executor: Arc<FakeExecutor>,
        cluster: Arc<FakeClusterOps>,
        dir: camino_tempfile::Utf8TempDir,
    }

    fn harness(hostname: &str, standby: bool) -> Harness {
        harness_with_dns(
            hostname,
            standby,
            Arc::new(InstantDnsResolver) as Arc<dyn HostOperation>
        )
    }

    fn harness_with_dns(
        hostname: &str,
        standby: bool,
        dns_resolver: Arc<dyn HostOperation>,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let fake_executor = FakeExecutor::new();
        fake_executor.set_exec_handler(Box::new(|input| {
            if input.program == "dnsdomainname" {
                Ok(Output {
                    stdout: b"gpdb.svc.cluster.local\n".to_vec(),
                    ..Output::success()
                })
            } else {
                Ok(Output::success())
            }
        }));
        let cluster = Arc::new(FakeClusterOps::default());
        let config = Arc::new(StaticConfigReader::new(ConfigValues {
            namespace: "gpdb".to_string(),
            greenplum_cluster_name: "my-cluster".to_string(),
            segment_count: 1,
            mirrors: false,
            standby,
            pxf_service_name: None,
        }));
        let known_hosts_path = dir.path().join("known_hosts");
        let daemon = ClusterInitDaemon::new(
            log(),
            hostname.to_string(),
            fake_executor.clone().as_executor(),
            config,
            dns_resolver,
            Arc::new(SameKeyScanner),
            Arc::new(FsKnownHostsReader::with_path(&known_hosts_path)),
            cluster.clone()
        )
        .with_paths(dir.path(), &known_hosts_path, Duration::from_secs(5));
        Harness { daemon, fake_executor, cluster, dir }
    }

    fn pg_ctl_restarts(fake: &FakeExecutor) -> usize {
        fake.history()
            .iter()
            .filter(|input| input.program.ends_with("pg_ctl"))
            .count()
    }

    #[tokio::test]
    async fn test_standby_with_data_dir_restarts_in_place() {
        let h = harness("master-1", true);
        std::fs::create_dir_all(h.dir.path().join("data-1")).unwrap();

        h.daemon.initialize_cluster().await.unwrap();

        assert_eq!(pg_ctl_restarts(&h.fake_executor), 1);
        assert_eq!(h.cluster.initialize_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.cluster.gpstart_calls.load(Ordering::SeqCst), 0);
        // The restart points at the coordinator data directory.
        let history = h.fake_executor.history();
        let restart = history
            .iter()
            .find(|input| input.program.ends_with("pg_ctl"))
            .unwrap();
        assert!(restart.args[1].ends_with("data-1"));
    }

    #[tokio::test]
    async fn test_standby_without_data_dir_idles() {
        let h = harness("master-1", true);
        h.daemon.initialize_cluster().await.unwrap();
        assert_eq!(pg_ctl_restarts(&h.fake_executor), 0);
        assert_eq!(h.cluster.initialize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_segment_with_data_dir_restarts_in_place() {
        let h = harness("segment-a-0", false);
        std::fs::create_dir_all(h.dir.path().join("data")).unwrap();

        h.daemon.initialize_cluster().await.unwrap();

        assert_eq!(pg_ctl_restarts(&h.fake_executor), 1);
        let history = h.fake_executor.history();
        let restart = history
            .iter()
            .find(|input| input.program.ends_with("pg_ctl"))
            .unwrap();
        assert!(restart.args[1].ends_with("/data"));
    }

    #[tokio::test]
    async fn test_primary_first_boot_initializes() {
        let h = harness("master-0", false);

        h.daemon.initialize_cluster().await.unwrap();

        assert_eq!(h.cluster.initialize_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.cluster.gpstart_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.cluster.post_init_calls.load(Ordering::SeqCst), 1);

        // Trust was established for the whole expected membership,
        // short and fully-qualified names alike.
        let known_hosts =
            std::fs::read_to_string(h.dir.path().join("known_hosts")).unwrap();
        for host in [
            "master-0 ",
            "segment-a-0 ",
            "master-0.gpdb.svc.cluster.local ",
            "segment-a-0.gpdb.svc.cluster.local ",
        ] {
            assert!(known_hosts.contains(host), "missing {host}");
        }
    }

    #[tokio::test]
    async fn test_primary_reboot_gpstarts_without_standby() {
        let h = harness("master-0", false);
        std::fs::create_dir_all(h.dir.path().join("data-1")).unwrap();

        h.daemon.initialize_cluster().await.unwrap();

        assert_eq!(h.cluster.initialize_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.cluster.gpstart_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.cluster.post_init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_primary_reboot_skips_gpstart_with_standby() {
        let h = harness("master-0", true);
        std::fs::create_dir_all(h.dir.path().join("data-1")).unwrap();

        h.daemon.initialize_cluster().await.unwrap();

        assert_eq!(h.cluster.gpstart_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.cluster.post_init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_primary_aborts_when_dns_never_converges() {
        let h = harness_with_dns(
            "master-0",
            false,
            Arc::new(FailingDnsResolver) as Arc<dyn HostOperation>
        );

        let err = h.daemon.initialize_cluster().await.unwrap_err();
        assert!(err.to_string().contains("failed to resolve dns entries"));
        assert_eq!(h.cluster.initialize_calls.load(Ordering::SeqCst), 0);
        // Nothing was written to the trust store.
        assert!(!h.dir.path().join("known_hosts").exists());
    }

    #[test]
    fn test_role_from_hostname() {
        assert_eq!(
            ClusterRole::from_hostname("master-0"),
            ClusterRole::Primary
        );
        assert_eq!(
            ClusterRole::from_hostname("master-1"),
            ClusterRole::Standby
        );
        assert_eq!(
            ClusterRole::from_hostname("segment-a-3"),
            ClusterRole::Segment
        );
        assert_eq!(
            ClusterRole::from_hostname("segment-b-0"),
            ClusterRole::Segment
        );
    }
}
