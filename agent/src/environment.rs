// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-time gpadmin environment preparation at container start:
//! shell profile, SSH identity, and the working directories Greenplum
//! expects.

use std::os::unix::fs::symlink;
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::info;
use slog::Logger;

use greenplum_common::file_writer;
use greenplum_common::instance_config::ConfigReader;

pub const GPADMIN_HOME: &str = "/home/gpadmin";
pub const GREENPLUM_DIR: &str = "/greenplum";
pub const SSH_KEY_MOUNT: &str = "/etc/ssh-key";

pub struct GpadminEnvironment {
    log: Logger,
    config: Arc<dyn ConfigReader>,
    home: Utf8PathBuf,
    greenplum_dir: Utf8PathBuf,
    ssh_key_mount: Utf8PathBuf,
}

impl GpadminEnvironment {
    pub fn new(
        log: Logger,
        config: Arc<dyn ConfigReader>,
    ) -> GpadminEnvironment {
        GpadminEnvironment {
            log,
            config,
            home: Utf8PathBuf::from(GPADMIN_HOME),
            greenplum_dir: Utf8PathBuf::from(GREENPLUM_DIR),
            ssh_key_mount: Utf8PathBuf::from(SSH_KEY_MOUNT),
        }
    }

    /// Overrides the filesystem locations; used by tests.
    pub fn with_paths(
        mut self,
        home: impl AsRef<Utf8Path>,
        greenplum_dir: impl AsRef<Utf8Path>,
        ssh_key_mount: impl AsRef<Utf8Path>,
    ) -> GpadminEnvironment {
        self.home = home.as_ref().to_owned();
        self.greenplum_dir = greenplum_dir.as_ref().to_owned();
        self.ssh_key_mount = ssh_key_mount.as_ref().to_owned();
        self
    }

    pub fn setup(&self) -> Result<(), anyhow::Error> {
        self.write_bashrc()?;
        self.setup_ssh()?;
        self.create_admin_logs_symlink()?;
        self.create_psql_history()?;
        self.create_mirror_dir()?;
        Ok(())
    }

    fn write_bashrc(&self) -> Result<(), anyhow::Error> {
        info!(self.log, "preparing gpadmin shell profile");
        let mut to_insert =
            "source /usr/local/greenplum-db/greenplum_path.sh\n".to_string();
        if let Some(pxf_service_name) = self.config.pxf_service_name()? {
            to_insert.push_str(&format!("export PXF_HOST={pxf_service_name}\n"));
        }
        file_writer::insert(&self.home.join(".bashrc"), &to_insert)
            .context("failed to update .bashrc")?;
        Ok(())
    }

    fn setup_ssh(&self) -> Result<(), anyhow::Error> {
        info!(self.log, "setting up ssh for gpadmin");
        let ssh_dir = self.home.join(".ssh");
        std::fs::create_dir_all(&ssh_dir)
            .with_context(|| format!("failed to create {ssh_dir}"))?;

        let read_mounted = |name: &str| {
            let path = self.ssh_key_mount.join(name);
            std::fs::read(&path)
                .with_context(|| format!("failed to read {path}"))
        };
        let private_key = read_mounted("id_rsa")?;
        let public_key = read_mounted("id_rsa.pub")?;

        let files: [(&str, &[u8]); 5] = [
            ("id_rsa", &private_key),
            ("id_rsa.pub", &public_key),
            ("authorized_keys", &public_key),
            // The trust store starts empty on every container start.
            ("known_hosts", b""),
            ("config", b"Host *\n    ConnectionAttempts 5"),
        ];
        for (name, contents) in files {
            let path = ssh_dir.join(name);
            std::fs::write(&path, contents)
                .with_context(|| format!("failed to write {path}"))?;
        }
        Ok(())
    }

    fn create_admin_logs_symlink(&self) -> Result<(), anyhow::Error> {
        info!(self.log, "creating symlink for gpAdminLogs");
        let logs_dir = self.greenplum_dir.join("gpAdminLogs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("failed to create {logs_dir}"))?;
        symlink(&logs_dir, self.home.join("gpAdminLogs"))
            .context("failed to create gpAdminLogs symlink")?;
        Ok(())
    }

    fn create_psql_history(&self) -> Result<(), anyhow::Error> {
        let path = self.home.join(".psql_history");
        info!(self.log, "creating psql history"; "path" => path.as_str());
        std::fs::write(&path, b"")
            .with_context(|| format!("failed to write {path}"))?;
        Ok(())
    }

    fn create_mirror_dir(&self) -> Result<(), anyhow::Error> {
        let mirror_dir = self.greenplum_dir.join("mirror");
        info!(self.log, "creating mirror dir"; "path" => mirror_dir.as_str());
        std::fs::create_dir_all(&mirror_dir)
            .with_context(|| format!("failed to create {mirror_dir}"))?;
        Ok(())
    }
}
