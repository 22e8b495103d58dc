// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-pod Greenplum agent: bootstraps the database according to
//! the pod's cluster role and keeps the SSH trust store current as
//! membership changes.

pub mod cluster;
pub mod controller;
pub mod environment;
pub mod gpinitsystem;
pub mod init;
pub mod multidaemon;
pub mod sshd;

use slog::o;
use slog::Drain;
use slog::Logger;

/// Builds the process-wide logger for the agent binaries.
pub fn root_logger(component: &'static str) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => component))
}
