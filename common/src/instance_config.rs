// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the instance configuration mounted into the pod.
//!
//! Cluster shape comes from the configmap at `/etc/config`; the pod's
//! own identity (namespace, cluster name) comes from the downward API
//! volume at `/etc/podinfo`. Each value is one small file named after
//! its key.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use thiserror::Error;

pub const CONFIG_MAP_DIR: &str = "/etc/config";
pub const POD_INFO_DIR: &str = "/etc/podinfo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValues {
    pub namespace: String,
    pub greenplum_cluster_name: String,
    pub segment_count: u32,
    pub mirrors: bool,
    pub standby: bool,
    /// Empty when no PXF service is deployed alongside the cluster.
    pub pxf_service_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading {key} from {path}")]
    Read {
        key: &'static str,
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("error parsing {key}, must be {expected}, got: {value}")]
    Parse { key: &'static str, expected: &'static str, value: String },

    #[error("{key} must be > 0")]
    NonPositive { key: &'static str },
}

/// Read-only view of the mounted instance configuration.
pub trait ConfigReader: Send + Sync {
    fn namespace(&self) -> Result<String, ConfigError>;
    fn greenplum_cluster_name(&self) -> Result<String, ConfigError>;
    fn segment_count(&self) -> Result<u32, ConfigError>;
    fn mirrors(&self) -> Result<bool, ConfigError>;
    fn standby(&self) -> Result<bool, ConfigError>;
    fn pxf_service_name(&self) -> Result<Option<String>, ConfigError>;

    fn config_values(&self) -> Result<ConfigValues, ConfigError> {
        Ok(ConfigValues {
            namespace: self.namespace()?,
            greenplum_cluster_name: self.greenplum_cluster_name()?,
            segment_count: self.segment_count()?,
            mirrors: self.mirrors()?,
            standby: self.standby()?,
            pxf_service_name: self.pxf_service_name()?,
        })
    }
}

/// Reads configuration values from the mounted volumes.
pub struct FsConfigReader {
    configmap_dir: Utf8PathBuf,
    podinfo_dir: Utf8PathBuf,
}

impl FsConfigReader {
    pub fn new() -> FsConfigReader {
        FsConfigReader {
            configmap_dir: Utf8PathBuf::from(CONFIG_MAP_DIR),
            podinfo_dir: Utf8PathBuf::from(POD_INFO_DIR),
        }
    }

    /// Overrides the mount locations; used by tests.
    pub fn with_dirs(
        configmap_dir: impl AsRef<Utf8Path>,
        podinfo_dir: impl AsRef<Utf8Path>,
    ) -> FsConfigReader {
        FsConfigReader {
            configmap_dir: configmap_dir.as_ref().to_owned(),
            podinfo_dir: podinfo_dir.as_ref().to_owned(),
        }
    }

    fn read_value(
        &self,
        dir: &Utf8Path,
        key: &'static str,
    ) -> Result<String, ConfigError> {
        let path = dir.join(key);
        let contents = std::fs::read_to_string(&path)
            .map_err(|err| ConfigError::Read { key, path, err })?;
        Ok(contents.trim().to_string())
    }

    fn read_u32(
        &self,
        dir: &Utf8Path,
        key: &'static str,
    ) -> Result<u32, ConfigError> {
        let value = self.read_value(dir, key)?;
        let parsed = value.parse::<u32>().map_err(|_| ConfigError::Parse {
            key,
            expected: "an integer",
            value: value.clone(),
        })?;
        if parsed == 0 {
            return Err(ConfigError::NonPositive { key });
        }
        Ok(parsed)
    }

    fn read_bool(
        &self,
        dir: &Utf8Path,
        key: &'static str,
    ) -> Result<bool, ConfigError> {
        let value = self.read_value(dir, key)?;
        value.parse::<bool>().map_err(|_| ConfigError::Parse {
            key,
            expected: "a boolean",
            value,
        })
    }

    fn read_optional(
        &self,
        dir: &Utf8Path,
        key: &'static str,
    ) -> Result<Option<String>, ConfigError> {
        let path = dir.join(key);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim().to_string();
                Ok(if trimmed.is_empty() { None } else { Some(trimmed) })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ConfigError::Read { key, path, err }),
        }
    }
}

impl Default for FsConfigReader {
    fn default() -> FsConfigReader {
        FsConfigReader::new()
    }
}

impl ConfigReader for FsConfigReader {
    fn namespace(&self) -> Result<String, ConfigError> {
        self.read_value(&self.podinfo_dir, "namespace")
    }

    fn greenplum_cluster_name(&self) -> Result<String, ConfigError> {
        self.read_value(&self.podinfo_dir, "greenplumClusterName")
    }

    fn segment_count(&self) -> Result<u32, ConfigError> {
        self.read_u32(&self.configmap_dir, "segmentCount")
    }

    fn mirrors(&self) -> Result<bool, ConfigError> {
        self.read_bool(&self.configmap_dir, "mirrors")
    }

    fn standby(&self) -> Result<bool, ConfigError> {
        self.read_bool(&self.configmap_dir, "standby")
    }

    fn pxf_service_name(&self) -> Result<Option<String>, ConfigError> {
        self.read_optional(&self.configmap_dir, "pxfServiceName")
    }
}

pub mod testing {
    use super::*;

    /// A [`ConfigReader`] returning fixed values.
    #[derive(Debug, Clone)]
    pub struct StaticConfigReader {
        pub values: ConfigValues,
    }

    impl StaticConfigReader {
        pub fn new(values: ConfigValues) -> StaticConfigReader {
            StaticConfigReader { values }
        }
    }

    impl ConfigReader for StaticConfigReader {
        fn namespace(&self) -> Result<String, ConfigError> {
            Ok(self.values.namespace.clone())
        }

        fn greenplum_cluster_name(&self) -> Result<String, ConfigError> {
            Ok(self.values.greenplum_cluster_name.clone())
        }

        fn segment_count(&self) -> Result<u32, ConfigError> {
            Ok(self.values.segment_count)
        }

        fn mirrors(&self) -> Result<bool, ConfigError> {
            Ok(self.values.mirrors)
        }

        fn standby(&self) -> Result<bool, ConfigError> {
            Ok(self.values.standby)
        }

        fn pxf_service_name(&self) -> Result<Option<String>, ConfigError> {
            Ok(self.values.pxf_service_name.clone())
        }
    }
}
