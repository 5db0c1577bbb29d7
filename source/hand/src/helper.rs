//! The legacy power control helper
//!
//! Some requests are not bus traffic at all, and are passed as a single
//! argument to an external program. The program's exit status decides the
//! outcome.

use std::{path::PathBuf, process::Stdio, time::Duration};

use han_comms::Status;
use tokio::process::Command;

/// How to run the helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Helper {
    /// Program to run, if any is configured
    pub path: Option<PathBuf>,
    /// Longest the program may run before it is killed
    pub timeout: Duration,
}

impl Helper {
    /// Run the helper with `command` as its only argument
    pub async fn run(&self, command: &str) -> Status {
        let Some(path) = &self.path else {
            log::warn!("Helper request, but no ppower_path is configured");
            return Status::HelperConfigError;
        };

        let mut child = match Command::new(path)
            .arg0("ppower")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                log::error!("Cannot start helper {}: {}", path.display(), e);
                return Status::HelperSpawnError;
            }
        };

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(exit)) if exit.success() => {
                log::debug!("Helper {:?} done", command);
                Status::Ok
            }
            Ok(Ok(exit)) => {
                log::warn!("Helper {:?} failed: {}", command, exit);
                Status::HelperError
            }
            Ok(Err(e)) => {
                log::error!("Waiting for helper failed: {}", e);
                Status::HelperError
            }
            Err(_) => {
                log::warn!("Helper {:?} ran longer than {:?}, killing it", command, self.timeout);
                if let Err(e) = child.kill().await {
                    log::error!("Cannot kill helper: {}", e);
                }
                Status::HelperError
            }
        }
    }
}
