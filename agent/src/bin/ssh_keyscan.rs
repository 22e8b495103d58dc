// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot key scan of the whole expected cluster membership,
//! appending any new trust entries to the known_hosts file.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use slog::info;
use slog::Logger;

use greenplum_agent::cluster::dns_domain_name;
use greenplum_agent::root_logger;
use greenplum_common::executor::HostExecutor;
use greenplum_common::file_writer;
use greenplum_common::host_list::generate_host_list;
use greenplum_common::instance_config::ConfigReader;
use greenplum_common::instance_config::FsConfigReader;
use greenplum_net::keyscanner::SshKeyScanner;
use greenplum_net::known_hosts::FsKnownHostsReader;
use greenplum_net::known_hosts::KNOWN_HOSTS_PATH;
use greenplum_net::scan::scan_host_keys;
use greenplum_net::scan::KEYSCAN_TIMEOUT;

async fn scan_segment_host_keys(log: &Logger) -> Result<(), anyhow::Error> {
    let executor = HostExecutor::new(log.clone()).as_executor();
    let dns_suffix = format!(
        ".{}",
        dns_domain_name(&executor)
            .await
            .context("scanning for segment host keys")?
    );

    let config = FsConfigReader::new()
        .config_values()
        .context("error reading configmap")?;
    let host_list = generate_host_list(
        config.segment_count,
        config.mirrors,
        config.standby,
        &dns_suffix
    );

    let new_entries = scan_host_keys(
        Arc::new(SshKeyScanner::new(log.clone())),
        &FsKnownHostsReader::new(),
        &host_list,
        KEYSCAN_TIMEOUT,
        log
    )
    .await?;

    file_writer::append(Utf8Path::new(KNOWN_HOSTS_PATH), &new_entries)
        .with_context(|| {
            format!("failed to append known hosts to file: {KNOWN_HOSTS_PATH}")
        })?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let log = root_logger("ssh-keyscan");
    info!(log, "key scanning started");
    if let Err(err) = scan_segment_host_keys(&log).await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
