// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote command execution over SSH.
//!
//! Unlike the scanner, this path *authenticates the server*: the offered
//! host key must match the trust-store entry recorded when the host was
//! first scanned.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use russh::client;
use russh::ChannelMsg;
use russh::Disconnect;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use slog::error;
use slog::o;
use slog::Logger;

use multihost::HostOperation;

use crate::keyscanner::GPADMIN_PRIVATE_KEY_PATH;
use crate::keyscanner::GPADMIN_USER;
use crate::keyscanner::SSH_PORT;
use crate::known_hosts::host_public_key;
use crate::known_hosts::KnownHostsReader;

/// A [`HostOperation`] that runs one fixed command on each host as
/// gpadmin.
pub struct RemoteCommand {
    command: String,
    reader: Arc<dyn KnownHostsReader>,
    key_path: Utf8PathBuf,
    log: Logger,
}

impl RemoteCommand {
    pub fn new(
        command: impl Into<String>,
        reader: Arc<dyn KnownHostsReader>,
        log: Logger,
    ) -> RemoteCommand {
        RemoteCommand {
            command: command.into(),
            reader,
            key_path: Utf8PathBuf::from(GPADMIN_PRIVATE_KEY_PATH),
            log,
        }
    }

    pub fn with_key_path(
        mut self,
        key_path: impl AsRef<Utf8Path>,
    ) -> RemoteCommand {
        self.key_path = key_path.as_ref().to_owned();
        self
    }

    async fn run(&self, host: &str) -> Result<(), anyhow::Error> {
        let known_key = host_public_key(&*self.reader, host)
            .await
            .with_context(|| format!("failed to get host key for {host}"))?;
        let key_pair =
            russh_keys::load_secret_key(self.key_path.as_std_path(), None)
                .with_context(|| {
                    format!("failed to load client key from {}", self.key_path)
                })?;

        let config = Arc::new(client::Config::default());
        let checker = StrictHostKeyCheck {
            expected: known_key.public_key_base64(),
        };
        let mut session =
            client::connect(config, (host, SSH_PORT), checker).await?;
        let authenticated = session
            .authenticate_publickey(GPADMIN_USER, Arc::new(key_pair))
            .await?;
        anyhow::ensure!(
            authenticated,
            "ssh authentication failed for {GPADMIN_USER}@{host}"
        );

        let mut channel = session
            .channel_open_session()
            .await
            .context("could not create ssh session")?;
        channel.exec(true, self.command.as_str()).await?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    output.extend_from_slice(data);
                }
                ChannelMsg::ExtendedData { ref data, .. } => {
                    output.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status: status } => {
                    exit_status = Some(status);
                }
                _ => (),
            }
        }
        let _ = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;

        match exit_status {
            Some(0) => Ok(()),
            status => {
                anyhow::bail!(
                    "command [{}] on {host} exited with {status:?}: {}",
                    self.command,
                    String::from_utf8_lossy(&output)
                )
            }
        }
    }
}

#[async_trait]
impl HostOperation for RemoteCommand {
    async fn execute(&self, host: &str) -> Result<(), anyhow::Error> {
        let log = self.log.new(o!("host" => host.to_string()));
        if let Err(err) = self.run(host).await {
            error!(
                log,
                "SSH command failed";
                "command" => &self.command,
                "error" => format!("{err:#}")
            );
            return Err(err);
        }
        Ok(())
    }
}

/// Rejects any server key other than the one recorded in the trust
/// store.
struct StrictHostKeyCheck {
    expected: String,
}

#[async_trait]
impl client::Handler for StrictHostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(server_public_key.public_key_base64() == self.expected)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::known_hosts::FsKnownHostsReader;
    use crate::test_helpers::log;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn test_unknown_host_is_refused_before_dialing() {
        let dir = tempdir().unwrap();
        let reader = Arc::new(FsKnownHostsReader::with_path(
            dir.path().join("known_hosts"),
        ));
        let op = RemoteCommand::new("cat /etc/hostname", reader, log());
        let err = op.execute("segment-a-0").await.unwrap_err();
        assert!(err
            .to_string()
            .contains("failed to get host key for segment-a-0"));
    }
}
