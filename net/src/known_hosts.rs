// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The on-disk trust store: a standard `known_hosts` file mapping each
//! hostname to the public key it presented on first contact.
//!
//! Reading tolerates a missing file (an empty map); it does not tolerate
//! marker lines or malformed keys. Writing happens elsewhere, strictly
//! by appending (see `greenplum_common::file_writer`): an entry, once
//! recorded, is never rewritten or removed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use russh_keys::key::PublicKey;
use thiserror::Error;

pub const KNOWN_HOSTS_PATH: &str = "/home/gpadmin/.ssh/known_hosts";

pub type KnownHosts = BTreeMap<String, PublicKey>;

#[derive(Debug, Error)]
pub enum KnownHostsError {
    #[error("could not read {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("could not parse {path}: line {line} is malformed")]
    Malformed { path: Utf8PathBuf, line: usize },

    #[error("could not parse {path}: line {line} has a bad key")]
    BadKey {
        path: Utf8PathBuf,
        line: usize,
        #[source]
        err: russh_keys::Error,
    },

    #[error("known_hosts markers are not currently supported")]
    MarkersUnsupported,
}

#[derive(Debug, Error)]
#[error("host {host} was not found in the known_hosts file")]
pub struct HostNotFound {
    pub host: String,
}

#[derive(Debug, Error)]
pub enum LookupKeyError {
    #[error(transparent)]
    NotFound(#[from] HostNotFound),

    #[error(transparent)]
    KnownHosts(#[from] KnownHostsError),
}

#[async_trait]
pub trait KnownHostsReader: Send + Sync {
    async fn known_hosts(&self) -> Result<KnownHosts, KnownHostsError>;
}

/// Reads the trust store from the gpadmin known_hosts file.
pub struct FsKnownHostsReader {
    path: Utf8PathBuf,
}

impl FsKnownHostsReader {
    pub fn new() -> FsKnownHostsReader {
        FsKnownHostsReader { path: Utf8PathBuf::from(KNOWN_HOSTS_PATH) }
    }

    pub fn with_path(path: impl AsRef<Utf8Path>) -> FsKnownHostsReader {
        FsKnownHostsReader { path: path.as_ref().to_owned() }
    }
}

impl Default for FsKnownHostsReader {
    fn default() -> FsKnownHostsReader {
        FsKnownHostsReader::new()
    }
}

#[async_trait]
impl KnownHostsReader for FsKnownHostsReader {
    async fn known_hosts(&self) -> Result<KnownHosts, KnownHostsError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // A trust store that does not exist yet is empty.
                return Ok(KnownHosts::new());
            }
            Err(err) => {
                return Err(KnownHostsError::Read {
                    path: self.path.clone(),
                    err,
                })
            }
        };
        parse_known_hosts(&self.path, &contents)
    }
}

fn parse_known_hosts(
    path: &Utf8Path,
    contents: &str,
) -> Result<KnownHosts, KnownHostsError> {
    let mut known_hosts = KnownHosts::new();
    for (index, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('@') {
            return Err(KnownHostsError::MarkersUnsupported);
        }
        let mut fields = line.split_whitespace();
        let malformed = || KnownHostsError::Malformed {
            path: path.to_owned(),
            line: index + 1,
        };
        let hosts = fields.next().ok_or_else(malformed)?;
        let key_type = fields.next().ok_or_else(malformed)?;
        let key_base64 = fields.next().ok_or_else(malformed)?;
        let key = russh_keys::parse_public_key_base64(key_base64).map_err(
            |err| KnownHostsError::BadKey {
                path: path.to_owned(),
                line: index + 1,
                err,
            },
        )?;
        if key.name() != key_type {
            return Err(malformed());
        }
        for host in hosts.split(',') {
            known_hosts.insert(host.to_string(), key.clone());
        }
    }
    Ok(known_hosts)
}

/// Looks up a single host's public key in the trust store.
pub async fn host_public_key(
    reader: &dyn KnownHostsReader,
    hostname: &str,
) -> Result<PublicKey, LookupKeyError> {
    let known_hosts = reader.known_hosts().await?;
    known_hosts.get(hostname).cloned().ok_or_else(|| {
        LookupKeyError::NotFound(HostNotFound { host: hostname.to_string() })
    })
}
