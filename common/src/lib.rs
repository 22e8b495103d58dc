// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared plumbing for the Greenplum pod agent: process execution,
//! polling primitives, file helpers, and the mounted instance
//! configuration.

pub mod executor;
pub mod file_writer;
pub mod host_list;
pub mod instance_config;
pub mod poll;
