// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Opportunistic SSH host-key harvesting.
//!
//! The scanner dials a host's SSH port once a second until it gets a
//! complete handshake or the deadline passes. The host-key callback
//! accepts whatever key the server offers: this is harvesting, not
//! validation. Validation against the trust store happens later, in
//! [`crate::scan::scan_host_keys`].

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use russh::client;
use russh::Disconnect;
use russh_keys::key::PublicKey;
use slog::debug;
use slog::o;
use slog::Logger;
use thiserror::Error;

use greenplum_common::poll::wait_for_condition;
use greenplum_common::poll::CondCheckError;

pub const SSH_PORT: u16 = 22;
pub const SCAN_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const GPADMIN_USER: &str = "gpadmin";
pub const GPADMIN_PRIVATE_KEY_PATH: &str = "/home/gpadmin/.ssh/id_rsa";

#[derive(Debug, Error)]
pub enum KeyscanError {
    #[error("timed out waiting for keyscan on {addr}")]
    TimedOut { addr: String },
}

/// The outcome of scanning one host: either the key it offered, or the
/// reason none could be harvested.
#[derive(Debug)]
pub struct HostKey {
    pub hostname: String,
    pub key: Result<PublicKey, KeyscanError>,
}

#[async_trait]
pub trait KeyScanner: Send + Sync {
    async fn scan(&self, host: &str, timeout: Duration) -> HostKey;
}

/// Scans hosts by performing a real SSH handshake as gpadmin.
pub struct SshKeyScanner {
    log: Logger,
    key_path: Utf8PathBuf,
    interval: Duration,
}

impl SshKeyScanner {
    pub fn new(log: Logger) -> SshKeyScanner {
        SshKeyScanner {
            log,
            key_path: Utf8PathBuf::from(GPADMIN_PRIVATE_KEY_PATH),
            interval: SCAN_POLL_INTERVAL,
        }
    }

    pub fn with_key_path(
        log: Logger,
        key_path: impl AsRef<Utf8Path>,
    ) -> SshKeyScanner {
        SshKeyScanner {
            log,
            key_path: key_path.as_ref().to_owned(),
            interval: SCAN_POLL_INTERVAL,
        }
    }

    /// One connection attempt. The handshake records the offered host
    /// key into `seen` before authentication completes, so the key
    /// survives even though the session is thrown away immediately.
    async fn attempt(&self, host: &str) -> Result<PublicKey, anyhow::Error> {
        let key_pair = russh_keys::load_secret_key(
            self.key_path.as_std_path(),
            None,
        )?;
        let seen = Arc::new(Mutex::new(None));
        let harvester = KeyHarvester { seen: Arc::clone(&seen) };
        let config = Arc::new(client::Config::default());
        let mut session =
            client::connect(config, (host, SSH_PORT), harvester).await?;
        let authenticated = session
            .authenticate_publickey(GPADMIN_USER, Arc::new(key_pair))
            .await?;
        if !authenticated {
            anyhow::bail!("ssh authentication failed for {GPADMIN_USER}");
        }
        session.disconnect(Disconnect::ByApplication, "", "English").await?;
        let key = seen.lock().unwrap().take();
        key.ok_or_else(|| anyhow::anyhow!("server offered no host key"))
    }
}

#[async_trait]
impl KeyScanner for SshKeyScanner {
    async fn scan(&self, host: &str, timeout: Duration) -> HostKey {
        let log = self.log.new(o!("host" => host.to_string()));
        let key = scan_loop(&log, host, self.interval, timeout, || {
            self.attempt(host)
        })
        .await;
        HostKey { hostname: host.to_string(), key }
    }
}

/// Retries `attempt` once per interval until it yields a key or the
/// timeout passes.
async fn scan_loop<F, Fut>(
    log: &Logger,
    host: &str,
    interval: Duration,
    timeout: Duration,
    mut attempt: F,
) -> Result<PublicKey, KeyscanError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PublicKey, anyhow::Error>>,
{
    let addr = format!("{host}:{SSH_PORT}");
    wait_for_condition(
        || {
            let attempt = attempt();
            async {
                match attempt.await {
                    Ok(key) => Ok(key),
                    Err(err) => {
                        debug!(log, "ssh dial"; "error" => format!("{err:#}"));
                        Err(CondCheckError::<KeyscanError>::NotYet)
                    }
                }
            }
        },
        &interval,
        &timeout
    )
    .await
    .map_err(|_| KeyscanError::TimedOut { addr })
}

/// Records the most recently offered server key, accepting all of them.
#[derive(Clone)]
struct KeyHarvester {
    seen: Arc<Mutex<Option<PublicKey>>>,
}

#[async_trait]
impl client::Handler for KeyHarvester {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        *self.seen.lock().unwrap() = Some(server_public_key.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{log, public_key, KEY_A, KEY_B};
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn test_scan_loop_returns_first_successful_key() {
        let calls = Cell::new(0u32);
        let key = scan_loop(
            &log(),
            "segment-a-0",
            Duration::from_secs(1),
            Duration::from_secs(300),
            || {
                calls.set(calls.get() + 1);
                let result = if calls.get() < 3 {
                    Err(anyhow::anyhow!("connection refused"))
                } else if calls.get() == 3 {
                    Ok(public_key(KEY_A))
                } else {
                    Ok(public_key(KEY_B))
                };
                async move { result }
            }
        )
        .await
        .unwrap();
        use russh_keys::PublicKeyBase64;
        assert_eq!(key.public_key_base64(), KEY_A);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_loop_times_out() {
        let err = scan_loop(
            &log(),
            "segment-a-0",
            Duration::from_secs(1),
            Duration::from_secs(30),
            || async { Err(anyhow::anyhow!("connection refused")) }
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "timed out waiting for keyscan on segment-a-0:22"
        );
    }
}
