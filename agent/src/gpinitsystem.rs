// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topology config generation and invocation of gpinitsystem.

use std::fmt::Write;
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::info;
use slog::Logger;

use greenplum_common::executor::BoxedExecutor;
use greenplum_common::executor::ExecutionError;
use greenplum_common::executor::Executor;
use greenplum_common::instance_config::ConfigReader;

use crate::cluster::dns_domain_name;
use crate::cluster::greenplum_command;

pub const GPINITSYSTEM_CONFIG_PATH: &str = "/home/gpadmin/gpinitsystem_config";
pub const GUCS_PATH: &str = "/etc/config/GUCs";

pub struct GpInitSystem {
    executor: BoxedExecutor,
    config: Arc<dyn ConfigReader>,
    log: Logger,
    config_path: Utf8PathBuf,
    gucs_path: Utf8PathBuf,
}

impl GpInitSystem {
    pub fn new(
        executor: BoxedExecutor,
        config: Arc<dyn ConfigReader>,
        log: Logger,
    ) -> GpInitSystem {
        GpInitSystem {
            executor,
            config,
            log,
            config_path: Utf8PathBuf::from(GPINITSYSTEM_CONFIG_PATH),
            gucs_path: Utf8PathBuf::from(GUCS_PATH),
        }
    }

    /// Overrides the filesystem locations; used by tests.
    pub fn with_paths(
        mut self,
        config_path: impl AsRef<Utf8Path>,
        gucs_path: impl AsRef<Utf8Path>,
    ) -> GpInitSystem {
        self.config_path = config_path.as_ref().to_owned();
        self.gucs_path = gucs_path.as_ref().to_owned();
        self
    }

    /// Writes the gpinitsystem topology config for the cluster shape in
    /// the instance configuration.
    pub async fn generate_config(&self) -> Result<(), anyhow::Error> {
        info!(self.log, "generating gpinitsystem config");
        let segment_count = self.config.segment_count()?;
        let use_mirrors = self.config.mirrors()?;
        let subdomain = dns_domain_name(&self.executor).await?;
        info!(self.log, "cluster subdomain"; "subdomain" => &subdomain);

        let mut contents = String::new();
        let mut dbid = 1;
        writeln!(
            contents,
            "QD_PRIMARY_ARRAY=master-0.{subdomain}~5432~/greenplum/data-1~{dbid}~-1~0"
        )
        .expect("writing to a String cannot fail");
        dbid += 1;

        contents.push_str("declare -a PRIMARY_ARRAY=(\n");
        for segment in 0..segment_count {
            writeln!(
                contents,
                "segment-a-{segment}.{subdomain}~40000~/greenplum/data~{dbid}~{segment}"
            )
            .expect("writing to a String cannot fail");
            dbid += 1;
        }
        contents.push_str(")\n");

        if use_mirrors {
            // Mirrors get their own directory; gpinitsystem refuses
            // primaries and mirrors that share storage.
            contents.push_str("declare -a MIRROR_ARRAY=(\n");
            for segment in 0..segment_count {
                writeln!(
                    contents,
                    "segment-b-{segment}.{subdomain}~50000~/greenplum/mirror/data~{dbid}~{segment}"
                )
                .expect("writing to a String cannot fail");
                dbid += 1;
            }
            contents.push_str(")\n");
        }
        contents.push_str("HBA_HOSTNAMES=1\n");

        std::fs::write(&self.config_path, contents).with_context(|| {
            format!("failed to write {}", self.config_path)
        })?;
        Ok(())
    }

    /// Invokes gpinitsystem against the generated config.
    pub async fn run(&self) -> Result<(), anyhow::Error> {
        info!(self.log, "running gpinitsystem");
        let dns_suffix = dns_domain_name(&self.executor).await?;

        let mut args =
            vec!["-a".to_string(), "-I".to_string(), self.config_path.to_string()];
        if self.config.standby()? {
            args.push("-s".to_string());
            args.push(format!("master-1.{dns_suffix}"));
        }
        if self.gucs_path.exists() {
            args.push("-p".to_string());
            args.push(self.gucs_path.to_string());
        }

        let mut command =
            greenplum_command("/usr/local/greenplum-db/bin/gpinitsystem");
        command.args(&args);
        match self.executor.execute(&mut command).await {
            Ok(_) => Ok(()),
            // gpinitsystem reports warnings with an exit status of 1.
            Err(ExecutionError::CommandFailure(info))
                if info.status().code() == Some(1) =>
            {
                Ok(())
            }
            Err(err) => {
                Err(anyhow::Error::new(err).context("gpinitsystem failed"))
            }
        }
    }
}
