// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blocks until the trust store holds an entry for every expected
//! cluster member; exits nonzero if any entry fails to appear in time.
//! Run by expansion jobs before they attempt passwordless SSH.

use std::sync::Arc;

use clap::Parser;
use slog::error;

use greenplum_agent::root_logger;
use greenplum_common::host_list::generate_host_list;
use greenplum_common::instance_config::ConfigReader;
use greenplum_common::instance_config::FsConfigReader;
use greenplum_net::known_hosts::FsKnownHostsReader;
use greenplum_net::waiter::KnownHostsWaiter;
use multihost::parallel_foreach;

#[derive(Parser, Debug)]
struct Args {
    /// Expected primary segment count after expansion.
    #[clap(long, default_value_t = 0)]
    new_primary_segment_count: u32,
}

#[tokio::main]
async fn main() {
    let log = root_logger("wait-for-known-hosts");
    let args = Args::parse();

    let config = match FsConfigReader::new().config_values() {
        Ok(config) => config,
        Err(err) => {
            error!(log, "error reading configmap"; "error" => %err);
            std::process::exit(1);
        }
    };

    let host_list = generate_host_list(
        args.new_primary_segment_count,
        config.mirrors,
        config.standby,
        ""
    );
    let waiter = Arc::new(KnownHostsWaiter::new(
        Arc::new(FsKnownHostsReader::new()),
        log.clone(),
    ));
    if !parallel_foreach(waiter, &host_list).await.is_empty() {
        std::process::exit(1);
    }
}
