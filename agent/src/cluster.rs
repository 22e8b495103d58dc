// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster-level Greenplum operations: full initialization, restart of a
//! previously initialized cluster, and post-initialization fixups.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::info;
use slog::Logger;

use greenplum_common::executor::BoxedExecutor;
use greenplum_common::executor::Executor;
use greenplum_common::instance_config::ConfigReader;

use crate::gpinitsystem::GpInitSystem;

pub const MASTER_DATA_DIR: &str = "/greenplum/data-1";
pub const SEGMENT_DATA_DIR: &str = "/greenplum/data";
pub const GPHOME: &str = "/usr/local/greenplum-db";
pub const HBA_SOURCE_PATH: &str = "/etc/config/hostBasedAuthentication";

/// Builds a command that runs a Greenplum utility with the gpadmin
/// environment. The environment is fixed rather than inherited: these
/// commands may run from a near-empty container environment.
pub fn greenplum_command(program: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new(program);
    command.env_clear().envs([
        ("HOME", "/home/gpadmin"),
        ("USER", "gpadmin"),
        ("LOGNAME", "gpadmin"),
        ("GPHOME", GPHOME),
        (
            "PATH",
            "/usr/local/greenplum-db/bin:/usr/local/sbin:/usr/local/bin:\
             /usr/sbin:/usr/bin:/sbin:/bin",
        ),
        (
            "LD_LIBRARY_PATH",
            "/usr/local/greenplum-db/lib:/usr/local/greenplum-db/ext/python/lib",
        ),
        ("MASTER_DATA_DIRECTORY", MASTER_DATA_DIR),
        ("PYTHONHOME", "/usr/local/greenplum-db/ext/python"),
        ("PYTHONPATH", "/usr/local/greenplum-db/lib/python"),
    ]);
    command
}

/// Runs `dnsdomainname` to determine the pod's DNS subdomain.
pub async fn dns_domain_name(
    executor: &BoxedExecutor,
) -> Result<String, anyhow::Error> {
    let output = executor
        .execute(&mut tokio::process::Command::new("dnsdomainname"))
        .await
        .context("dnsdomainname failed to determine this host's dns name")?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .trim_end_matches('\n')
        .to_string())
}

#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Initializes a brand-new cluster from this pod.
    async fn initialize(&self) -> Result<(), anyhow::Error>;

    /// Brings a previously initialized cluster back up: promote out of
    /// maintenance mode, then restart all data-serving processes.
    async fn gpstart(&self) -> Result<(), anyhow::Error>;

    /// Post-initialization fixups: reload configuration and create the
    /// PXF extension when one is configured.
    async fn run_post_initialization(&self) -> Result<(), anyhow::Error>;
}

pub struct GreenplumCluster {
    executor: BoxedExecutor,
    config: Arc<dyn ConfigReader>,
    gpinitsystem: GpInitSystem,
    log: Logger,
    master_data_dir: Utf8PathBuf,
    hba_source: Utf8PathBuf,
}

impl GreenplumCluster {
    pub fn new(
        executor: BoxedExecutor,
        config: Arc<dyn ConfigReader>,
        gpinitsystem: GpInitSystem,
        log: Logger,
    ) -> GreenplumCluster {
        GreenplumCluster {
            executor,
            config,
            gpinitsystem,
            log,
            master_data_dir: Utf8PathBuf::from(MASTER_DATA_DIR),
            hba_source: Utf8PathBuf::from(HBA_SOURCE_PATH),
        }
    }

    /// Overrides the filesystem locations; used by tests.
    pub fn with_paths(
        mut self,
        master_data_dir: impl AsRef<Utf8Path>,
        hba_source: impl AsRef<Utf8Path>,
    ) -> GreenplumCluster {
        self.master_data_dir = master_data_dir.as_ref().to_owned();
        self.hba_source = hba_source.as_ref().to_owned();
        self
    }

    async fn create_db(&self) -> Result<(), anyhow::Error> {
        info!(self.log, "running createdb");
        let mut command = greenplum_command(
            "/usr/local/greenplum-db/bin/createdb"
        );
        self.executor.execute(&mut command).await?;
        Ok(())
    }

    async fn add_master_and_standby_host_based_authentication(
        &self,
    ) -> Result<(), anyhow::Error> {
        self.add_host_based_authentication("master-0")
            .await
            .context("adding host-based authentication failed")?;
        let standby =
            self.config.standby().context("reading standby failed")?;
        if standby {
            self.add_host_based_authentication("master-1")
                .await
                .context("adding host-based authentication failed")?;
        }
        Ok(())
    }

    async fn add_host_based_authentication(
        &self,
        host: &str,
    ) -> Result<(), anyhow::Error> {
        let has_content = match std::fs::read_to_string(&self.hba_source) {
            Ok(contents) => !contents.trim().is_empty(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                return Err(anyhow::Error::new(err).context(format!(
                    "verifying if {} has any content failed",
                    self.hba_source
                )))
            }
        };
        if !has_content {
            return Ok(());
        }

        info!(
            self.log,
            "adding host based authentication to pg_hba.conf";
            "host" => host
        );
        let destination = self.master_data_dir.join("pg_hba.conf");
        // The redirection is evaluated by the remote shell.
        let mut command = tokio::process::Command::new("/usr/bin/ssh");
        command.args([
            host,
            "cat",
            self.hba_source.as_str(),
            ">>",
            destination.as_str(),
        ]);
        self.executor.execute(&mut command).await.with_context(|| {
            format!(
                "attempting to append from '{}' to end of {destination}",
                self.hba_source
            )
        })?;
        Ok(())
    }

    async fn reload_gp_config(&self) -> Result<(), anyhow::Error> {
        info!(self.log, "reloading greenplum configs");
        let mut command =
            greenplum_command("/usr/local/greenplum-db/bin/gpstop");
        command.arg("-u");
        self.executor.execute(&mut command).await?;
        Ok(())
    }

    async fn create_pxf_extension(&self) -> Result<(), anyhow::Error> {
        if self.config.pxf_service_name()?.is_none() {
            return Ok(());
        }
        info!(self.log, "creating pxf extension");
        let mut command =
            greenplum_command("/usr/local/greenplum-db/bin/psql");
        command.args([
            "-U",
            "gpadmin",
            "-d",
            "gpadmin",
            "-c",
            "CREATE EXTENSION IF NOT EXISTS pxf",
        ]);
        self.executor.execute(&mut command).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterOps for GreenplumCluster {
    async fn initialize(&self) -> Result<(), anyhow::Error> {
        info!(self.log, "initializing Greenplum for Kubernetes cluster");
        if self.master_data_dir.exists() {
            anyhow::bail!(
                "master data directory already exists at {}",
                self.master_data_dir
            );
        }

        self.gpinitsystem
            .generate_config()
            .await
            .context("gpinitsystem config failed")?;
        self.gpinitsystem.run().await.context("gpinitsystem failed")?;
        self.create_db().await.context("createdb failed")?;

        // The HBA config is reloaded later, in run_post_initialization.
        self.add_master_and_standby_host_based_authentication().await
    }

    async fn gpstart(&self) -> Result<(), anyhow::Error> {
        let mut command =
            greenplum_command("/usr/local/greenplum-db/bin/gpstart");
        command.arg("-am");
        self.executor
            .execute(&mut command)
            .await
            .context("gpstart in maintenance mode failed")?;

        let mut command =
            greenplum_command("/usr/local/greenplum-db/bin/gpstop");
        command.arg("-ar");
        self.executor
            .execute(&mut command)
            .await
            .context("restart segments failed")?;
        Ok(())
    }

    async fn run_post_initialization(&self) -> Result<(), anyhow::Error> {
        let mut probe = greenplum_command("/usr/local/greenplum-db/bin/psql");
        probe.args([
            "-U",
            "gpadmin",
            "-c",
            "select * from gp_segment_configuration",
        ]);
        if self.executor.execute(&mut probe).await.is_err() {
            info!(
                self.log,
                "the database is not running. skipping post-initialization."
            );
            return Ok(());
        }

        self.reload_gp_config().await.context("gpstop failed")?;
        self.create_pxf_extension()
            .await
            .context("createPXFExtension failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gpinitsystem::GpInitSystem;
    use crate::test_helpers::log;
    use camino_tempfile::tempdir;
    use greenplum_common::executor::{ExecInput, FakeExecutor, OutputExt};
    use greenplum_common::instance_config::testing::StaticConfigReader;
    use greenplum_common::instance_config::ConfigValues;
    use std::process::Output;

    fn config(standby: bool, pxf: Option<&str>) -> Arc<StaticConfigReader> {
        Arc::new(StaticConfigReader::new(ConfigValues {
            namespace: "gpdb".to_string(),
            greenplum_cluster_name: "my-cluster".to_string(),
            segment_count: 1,
            mirrors: false,
            standby,
            pxf_service_name: pxf.map(|s| s.to_string()),
        }))
    }

    fn programs(history: &[ExecInput]) -> Vec<&str> {
        history.iter().map(|input| input.program.as_str()).collect()
    }

    fn cluster_under_test(
        fake: &Arc<FakeExecutor>,
        standby: bool,
        pxf: Option<&str>,
        dir: &camino::Utf8Path,
    ) -> GreenplumCluster {
        let config = config(standby, pxf);
        let gpinitsystem = GpInitSystem::new(
            fake.clone().as_executor(),
            config.clone(),
            log()
        )
        .with_paths(dir.join("gpinitsystem_config"), dir.join("GUCs"));
        GreenplumCluster::new(
            fake.clone().as_executor(),
            config,
            gpinitsystem,
            log()
        )
        .with_paths(dir.join("data-1"), dir.join("hostBasedAuthentication"))
    }

    #[tokio::test]
    async fn test_initialize_runs_the_full_sequence() {
        let dir = tempdir().unwrap();
        let fake = FakeExecutor::new();
        fake.set_exec_handler(Box::new(|input| {
            if input.program == "dnsdomainname" {
                Ok(Output {
                    stdout: b"gpdb.svc.cluster.local\n".to_vec(),
                    ..Output::success()
                })
            } else {
                Ok(Output::success())
            }
        }));
        std::fs::write(
            dir.path().join("hostBasedAuthentication"),
            "host all all 0.0.0.0/0 trust\n"
        )
        .unwrap();

        let cluster = cluster_under_test(&fake, false, None, dir.path());
        cluster.initialize().await.unwrap();

        let history = fake.history();
        let programs = programs(&history);
        // Config generation and the gpinitsystem run each consult
        // dnsdomainname for the cluster subdomain.
        assert_eq!(
            programs,
            vec![
                "dnsdomainname",
                "dnsdomainname",
                "/usr/local/greenplum-db/bin/gpinitsystem",
                "/usr/local/greenplum-db/bin/createdb",
                "/usr/bin/ssh",
            ]
        );
        // Only master-0 gets an HBA append without a standby.
        assert_eq!(history[4].args[0], "master-0");
    }

    #[tokio::test]
    async fn test_initialize_appends_hba_on_standby_too() {
        let dir = tempdir().unwrap();
        let fake = FakeExecutor::new();
        std::fs::write(
            dir.path().join("hostBasedAuthentication"),
            "host all all 0.0.0.0/0 trust\n"
        )
        .unwrap();

        let cluster = cluster_under_test(&fake, true, None, dir.path());
        cluster.initialize().await.unwrap();

        let history = fake.history();
        let ssh_targets: Vec<&str> = history
            .iter()
            .filter(|input| input.program == "/usr/bin/ssh")
            .map(|input| input.args[0].as_str())
            .collect();
        assert_eq!(ssh_targets, vec!["master-0", "master-1"]);
    }

    #[tokio::test]
    async fn test_initialize_skips_hba_when_source_empty() {
        let dir = tempdir().unwrap();
        let fake = FakeExecutor::new();
        let cluster = cluster_under_test(&fake, true, None, dir.path());
        cluster.initialize().await.unwrap();
        assert!(!programs(&fake.history()).contains(&"/usr/bin/ssh"));
    }

    #[tokio::test]
    async fn test_initialize_refuses_existing_data_dir() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data-1")).unwrap();
        let fake = FakeExecutor::new();
        let cluster = cluster_under_test(&fake, false, None, dir.path());
        let err = cluster.initialize().await.unwrap_err();
        assert!(err
            .to_string()
            .contains("master data directory already exists"));
        assert!(fake.history().is_empty());
    }

    #[tokio::test]
    async fn test_gpstart_promotes_then_restarts() {
        let dir = tempdir().unwrap();
        let fake = FakeExecutor::new();
        let cluster = cluster_under_test(&fake, false, None, dir.path());
        cluster.gpstart().await.unwrap();

        let history = fake.history();
        assert_eq!(history[0].program, "/usr/local/greenplum-db/bin/gpstart");
        assert_eq!(history[0].args, vec!["-am"]);
        assert_eq!(history[1].program, "/usr/local/greenplum-db/bin/gpstop");
        assert_eq!(history[1].args, vec!["-ar"]);
    }

    #[tokio::test]
    async fn test_post_initialization_skips_when_database_down() {
        let dir = tempdir().unwrap();
        let fake = FakeExecutor::new();
        fake.set_exec_handler(Box::new(|input| {
            if input.program.ends_with("psql") {
                Ok(Output::failure(2))
            } else {
                Ok(Output::success())
            }
        }));
        let cluster = cluster_under_test(&fake, false, None, dir.path());
        cluster.run_post_initialization().await.unwrap();
        // Only the probe ran; no reload, no extension.
        assert_eq!(fake.history().len(), 1);
    }

    #[tokio::test]
    async fn test_post_initialization_reloads_and_creates_pxf() {
        let dir = tempdir().unwrap();
        let fake = FakeExecutor::new();
        let cluster = cluster_under_test(&fake, false, Some("pxf"), dir.path());
        cluster.run_post_initialization().await.unwrap();

        let history = fake.history();
        let programs = programs(&history);
        assert_eq!(
            programs,
            vec![
                "/usr/local/greenplum-db/bin/psql",
                "/usr/local/greenplum-db/bin/gpstop",
                "/usr/local/greenplum-db/bin/psql",
            ]
        );
        assert!(history[2]
            .args
            .contains(&"CREATE EXTENSION IF NOT EXISTS pxf".to_string()));
    }

    #[tokio::test]
    async fn test_post_initialization_without_pxf() {
        let dir = tempdir().unwrap();
        let fake = FakeExecutor::new();
        let cluster = cluster_under_test(&fake, false, None, dir.path());
        cluster.run_post_initialization().await.unwrap();
        assert_eq!(fake.history().len(), 2);
    }

    #[tokio::test]
    async fn test_greenplum_command_environment() {
        let command = greenplum_command("/usr/local/greenplum-db/bin/psql");
        let envs: Vec<(String, String)> = command
            .as_std()
            .get_envs()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().to_string(),
                    v.unwrap_or_default().to_string_lossy().to_string()
                )
            })
            .collect();
        assert!(envs.contains(&(
            "MASTER_DATA_DIRECTORY".to_string(),
            MASTER_DATA_DIR.to_string()
        )));
        assert!(envs.contains(&("USER".to_string(), "gpadmin".to_string())));
    }
}
