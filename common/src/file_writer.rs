// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Append and prepend helpers for small configuration files.
//!
//! [`append`] is the only entry point used for the trust file; the
//! known-hosts store is strictly append-only and must never be routed
//! through [`insert`], which rewrites the whole file.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use camino::Utf8Path;
use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileWriterError {
    #[error("failed to create parent directory for {path}")]
    CreateDir {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to open {path}")]
    Open {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to write {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

fn ensure_parent(path: &Utf8Path) -> Result<(), FileWriterError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            FileWriterError::CreateDir { path: path.to_owned(), err }
        })?;
    }
    Ok(())
}

/// Appends raw content to the end of `path`, creating the file and any
/// parent directories as needed.
pub fn append(path: &Utf8Path, contents: &str) -> Result<(), FileWriterError> {
    ensure_parent(path)?;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| FileWriterError::Open { path: path.to_owned(), err })?;
    file.write_all(contents.as_bytes())
        .map_err(|err| FileWriterError::Write { path: path.to_owned(), err })
}

/// Prepends raw content to `path`, keeping any existing content after
/// it. A missing file is treated as empty.
pub fn insert(path: &Utf8Path, contents: &str) -> Result<(), FileWriterError> {
    ensure_parent(path)?;
    let existing = match std::fs::read_to_string(path) {
        Ok(existing) => existing,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            String::new()
        }
        Err(err) => {
            return Err(FileWriterError::Open { path: path.to_owned(), err })
        }
    };
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| FileWriterError::Open { path: path.to_owned(), err })?;
    for buf in [contents, &existing] {
        file.write_all(buf.as_bytes()).map_err(|err| {
            FileWriterError::Write { path: path.to_owned(), err }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn test_append_creates_file_and_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".ssh").join("known_hosts");

        append(&path, "master-0 ssh-ed25519 AAAA\n").unwrap();
        append(&path, "segment-a-0 ssh-ed25519 BBBB\n").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "master-0 ssh-ed25519 AAAA\nsegment-a-0 ssh-ed25519 BBBB\n"
        );
    }

    #[test]
    fn test_append_empty_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        append(&path, "").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_insert_prepends_before_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".bashrc");
        std::fs::write(&path, "export EDITOR=vim\n").unwrap();

        insert(&path, "source /usr/local/greenplum-db/greenplum_path.sh\n")
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "source /usr/local/greenplum-db/greenplum_path.sh\n\
             export EDITOR=vim\n"
        );
    }

    #[test]
    fn test_insert_into_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".bashrc");
        insert(&path, "source greenplum_path.sh\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "source greenplum_path.sh\n"
        );
    }
}
