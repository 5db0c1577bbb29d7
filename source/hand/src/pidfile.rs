use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use crate::error::DaemonError;

/// A pid file, removed again when dropped
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create `path` holding our pid, refusing to replace an existing one
    pub fn create(path: &Path) -> Result<Self, DaemonError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                ErrorKind::AlreadyExists => DaemonError::PidFileExists(path.to_owned()),
                _ => DaemonError::PidFile {
                    path: path.to_owned(),
                    source,
                },
            })?;
        writeln!(file, "{}", std::process::id()).map_err(|source| DaemonError::PidFile {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self {
            path: path.to_owned(),
        })
    }

    /// Where the pid was written
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Cannot remove pid file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hand.pid");

        let pid = PidFile::create(&path).unwrap();
        assert_eq!(pid.path(), path);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim(), std::process::id().to_string());

        assert!(matches!(
            PidFile::create(&path),
            Err(DaemonError::PidFileExists(_))
        ));

        drop(pid);
        assert!(!path.exists());
    }
}
