// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trust-on-first-use reconciliation between scanned host keys and the
//! known-hosts store.
//!
//! All hosts in a batch are scanned concurrently while the current trust
//! map loads. The result is all-or-nothing: one unreachable host or one
//! key mismatch discards the whole batch, so callers retry the entire
//! set instead of committing partial trust.

use std::sync::Arc;
use std::time::Duration;

use russh_keys::PublicKeyBase64;
use slog::error;
use slog::info;
use slog::Logger;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::keyscanner::KeyScanner;
use crate::keyscanner::KeyscanError;
use crate::known_hosts::KnownHostsError;
use crate::known_hosts::KnownHostsReader;

/// How long each host in the bootstrap path may take to become
/// scannable.
pub const KEYSCAN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum ScanHostKeysError {
    #[error(transparent)]
    KnownHosts(#[from] KnownHostsError),

    #[error("keyscan failed for {host}")]
    Scan {
        host: String,
        #[source]
        err: KeyscanError,
    },

    #[error("scanned key does not match known key")]
    KeyMismatch { host: String },
}

/// Scans every host in `hostnames` and returns the `known_hosts` lines
/// for hosts not yet in the trust store, formatted
/// `hostname keytype base64key\n`.
///
/// Hosts already present with an identical key produce no output. A host
/// already present with a *different* key fails the whole call: under
/// trust-on-first-use a changed key means replacement or spoofing, never
/// an update.
pub async fn scan_host_keys(
    scanner: Arc<dyn KeyScanner>,
    reader: &dyn KnownHostsReader,
    hostnames: &[String],
    timeout: Duration,
    log: &Logger,
) -> Result<String, ScanHostKeysError> {
    let mut scans = JoinSet::new();
    for hostname in hostnames {
        let scanner = Arc::clone(&scanner);
        let hostname = hostname.clone();
        let log = log.clone();
        scans.spawn(async move {
            info!(log, "starting keyscan"; "host" => &hostname);
            scanner.scan(&hostname, timeout).await
        });
    }

    // The scans are already running on their own tasks; load the trust
    // map while they connect.
    let known_hosts = reader.known_hosts().await?;

    let mut new_entries = String::new();
    let mut failure = None;
    while let Some(result) = scans.join_next().await {
        let host_key = result.expect("keyscan task panicked");
        let hostname = host_key.hostname;
        match host_key.key {
            Err(err) => {
                error!(
                    log,
                    "keyscan failed";
                    "host" => &hostname,
                    "error" => %err
                );
                failure = Some(ScanHostKeysError::Scan { host: hostname, err });
            }
            Ok(key) => {
                info!(log, "keyscan successful"; "host" => &hostname);
                match known_hosts.get(&hostname) {
                    None => {
                        new_entries.push_str(&format!(
                            "{} {} {}\n",
                            hostname,
                            key.name(),
                            key.public_key_base64(),
                        ));
                    }
                    Some(known_key)
                        if known_key.public_key_base64()
                            == key.public_key_base64() => {}
                    Some(_) => {
                        error!(
                            log,
                            "keyscan failed";
                            "host" => &hostname,
                            "error" => "scanned key does not match known key"
                        );
                        failure = Some(ScanHostKeysError::KeyMismatch {
                            host: hostname,
                        });
                    }
                }
            }
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(new_entries),
    }
}
