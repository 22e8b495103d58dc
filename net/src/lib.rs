// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster networking for the Greenplum pod agent: DNS convergence
//! checks and SSH trust management (the known-hosts store, the host-key
//! scanner, and the trust-on-first-use reconciliation between them).

pub mod dns;
pub mod exec;
pub mod keyscanner;
pub mod known_hosts;
pub mod scan;
pub mod waiter;
