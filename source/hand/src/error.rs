use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures that stop the daemon from starting, or from reloading
///
/// Bus and client errors never end up here, they are reported to the
/// client that caused them.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("cannot read configuration {path}: {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("cannot parse configuration {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("cannot open bus transport {tty}: {source}")]
    Transport {
        tty: String,
        source: tokio_serial::Error,
    },

    #[error("cannot bind {what}: {source}")]
    Bind { what: String, source: io::Error },

    #[error("pid file {0} already exists, is another hand running?")]
    PidFileExists(PathBuf),

    #[error("cannot write pid file {path}: {source}")]
    PidFile { path: PathBuf, source: io::Error },
}
