//! Opening the client facing sockets

use std::{
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tokio::net::{TcpListener, UnixListener};

use crate::{config::Config, error::DaemonError, server::Conn, watch::Kind};

/// The sockets described by a [Config]
pub struct Listeners {
    /// Every listening socket, with its kind
    pub conns: Vec<(Kind, Conn)>,
    /// Removes the Unix socket file once the daemon is done with it
    pub socket_file: Option<SocketFile>,
}

/// A bound Unix socket path, unlinked on drop
#[derive(Debug)]
pub struct SocketFile {
    path: PathBuf,
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Cannot remove socket {}: {}", self.path.display(), e);
        }
    }
}

impl Listeners {
    /// Bind every socket the configuration asks for
    pub async fn bind(cfg: &Config) -> Result<Self, DaemonError> {
        let mut conns = Vec::new();
        let mut socket_file = None;

        if let Some(path) = &cfg.socket {
            let listener = bind_unix(cfg, path)?;
            conns.push((Kind::LocalCommand, Conn::Local(listener)));
            socket_file = Some(SocketFile { path: path.clone() });
        }

        if let Some(port) = cfg.service {
            for (addr, listener) in bind_tcp(cfg, port, "command service").await? {
                let kind = if addr.is_ipv4() {
                    Kind::Inet4Command
                } else {
                    Kind::Inet6Command
                };
                conns.push((kind, Conn::Command(listener)));
            }
        }

        if let Some(port) = cfg.textservice {
            for (addr, listener) in bind_tcp(cfg, port, "text service").await? {
                let kind = if addr.is_ipv4() {
                    Kind::Inet4Text
                } else {
                    Kind::Inet6Text
                };
                conns.push((kind, Conn::TextListener(listener)));
            }
        }

        Ok(Self { conns, socket_file })
    }

    /// The local address of every TCP listener
    pub fn tcp_addrs(&self) -> Vec<(Kind, SocketAddr)> {
        self.conns
            .iter()
            .filter_map(|(kind, conn)| match conn {
                Conn::Command(l) | Conn::TextListener(l) => l.local_addr().ok().map(|a| (*kind, a)),
                _ => None,
            })
            .collect()
    }
}

fn bind_unix(cfg: &Config, path: &Path) -> Result<UnixListener, DaemonError> {
    let bind_err = |source| DaemonError::Bind {
        what: path.display().to_string(),
        source,
    };

    // Left behind by an unclean exit
    if path.exists() {
        log::debug!("Removing stale socket {}", path.display());
        std::fs::remove_file(path).map_err(bind_err)?;
    }

    let listener = UnixListener::bind(path).map_err(bind_err)?;
    let mode = cfg.socket_mode().map_err(DaemonError::ConfigInvalid)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
    if cfg.socket_uid.is_some() || cfg.socket_gid.is_some() {
        std::os::unix::fs::chown(path, cfg.socket_uid, cfg.socket_gid).map_err(bind_err)?;
    }
    log::info!("Listening for commands on {} (mode {:o})", path.display(), mode);
    Ok(listener)
}

/// Bind `port` on every configured address
///
/// Binding both wildcard families can fail for one of them on dual stack
/// hosts, which is fine as long as something was bound.
async fn bind_tcp(
    cfg: &Config,
    port: u16,
    what: &str,
) -> Result<Vec<(SocketAddr, TcpListener)>, DaemonError> {
    let mut bound = Vec::new();
    let mut last_err = None;
    for addr in cfg.bind_addrs(port) {
        match TcpListener::bind(addr).await {
            Ok(l) => {
                // Port 0 asks the OS to pick, report what it chose
                let local = l.local_addr().unwrap_or(addr);
                log::info!("Listening for {} on {}", what, local);
                bound.push((local, l));
            }
            Err(e) => {
                log::debug!("Cannot bind {} on {}: {}", what, addr, e);
                last_err = Some((addr, e));
            }
        }
    }
    match (bound.is_empty(), last_err) {
        (true, Some((addr, source))) => Err(DaemonError::Bind {
            what: format!("{} on {}", what, addr),
            source,
        }),
        _ => Ok(bound),
    }
}
