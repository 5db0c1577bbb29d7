//! Daemon configuration file
//!
//! The configuration is a flat TOML table, for example:
//!
//! ```toml
//! tty = "/dev/ttyUSB0"
//! pid_file = "/run/hand.pid"
//! socket = "/run/hand.sock"
//! socket_mode = "660"
//! service = 1128
//! textservice = 1129
//! retries = 3
//! ppower_path = "/usr/local/bin/ppower"
//! ```

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use han_comms::{
    controller::{BusSettings, BusTiming},
    MAX_UNICAST_ADDR,
};
use serde::Deserialize;

use crate::error::DaemonError;

/// Where the configuration is read from when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hand.toml";

/// The daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Serial device the bus is attached to
    pub tty: String,
    /// Serial line speed
    pub baud: u32,
    /// Pid file written while running
    pub pid_file: Option<PathBuf>,
    /// Log file, used when not running in the foreground
    pub log_path: Option<PathBuf>,
    /// Unix domain command socket
    pub socket: Option<PathBuf>,
    /// Octal permissions applied to `socket`
    pub socket_mode: String,
    /// Owner applied to `socket`
    pub socket_uid: Option<u32>,
    /// Group applied to `socket`
    pub socket_gid: Option<u32>,
    /// TCP port of the command socket
    pub service: Option<u16>,
    /// TCP port of the text monitor socket
    pub textservice: Option<u16>,
    /// Address the TCP sockets bind to, all interfaces if unset
    pub bindaddr: Option<String>,
    /// Extra attempts after a retryable bus failure
    pub retries: u8,
    /// Highest address visited by a scan
    pub max_node_addr: u8,
    /// The legacy power control helper
    pub ppower_path: Option<PathBuf>,
    /// How long the helper may run before it is killed
    pub helper_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tty: "/dev/ttyS0".into(),
            baud: 9600,
            pid_file: None,
            log_path: None,
            socket: None,
            socket_mode: "660".into(),
            socket_uid: None,
            socket_gid: None,
            service: None,
            textservice: None,
            bindaddr: None,
            retries: 3,
            max_node_addr: MAX_UNICAST_ADDR,
            ppower_path: None,
            helper_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let text = std::fs::read_to_string(path).map_err(|source| DaemonError::ConfigRead {
            path: path.to_owned(),
            source,
        })?;
        let cfg = Self::parse(&text).map_err(|e| match e {
            ParseError::Toml(source) => DaemonError::ConfigParse {
                path: path.to_owned(),
                source,
            },
            ParseError::Invalid(why) => DaemonError::ConfigInvalid(why),
        })?;
        Ok(cfg)
    }

    /// Parse and validate configuration text
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let cfg: Self = toml::from_str(text).map_err(ParseError::Toml)?;
        cfg.validate().map_err(ParseError::Invalid)?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_node_addr > MAX_UNICAST_ADDR {
            return Err(format!(
                "max_node_addr must be at most {}, not {}",
                MAX_UNICAST_ADDR, self.max_node_addr
            ));
        }
        self.socket_mode()?;
        if self.socket.is_none() && self.service.is_none() {
            return Err("one of socket or service must be set".into());
        }
        if let Some(addr) = &self.bindaddr {
            addr.parse::<IpAddr>()
                .map_err(|e| format!("bindaddr {:?}: {}", addr, e))?;
        }
        Ok(())
    }

    /// The Unix socket permissions
    pub fn socket_mode(&self) -> Result<u32, String> {
        u32::from_str_radix(&self.socket_mode, 8)
            .ok()
            .filter(|m| *m <= 0o777)
            .ok_or_else(|| format!("socket_mode {:?} is not an octal mode", self.socket_mode))
    }

    /// The addresses a TCP `port` is bound on
    ///
    /// Both wildcard families unless `bindaddr` picks one address.
    pub fn bind_addrs(&self, port: u16) -> Vec<SocketAddr> {
        match self.bindaddr.as_deref().and_then(|a| a.parse::<IpAddr>().ok()) {
            Some(ip) => vec![SocketAddr::new(ip, port)],
            None => vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            ],
        }
    }

    /// How the bus engine should behave
    pub fn bus_settings(&self) -> BusSettings {
        BusSettings {
            retries: self.retries,
            max_node_addr: self.max_node_addr,
            timing: BusTiming::default(),
        }
    }

    /// The helper time budget
    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_timeout_secs)
    }
}

/// A configuration text that could not be used
#[derive(Debug)]
pub enum ParseError {
    /// Not valid TOML, or unknown keys
    Toml(toml::de::Error),
    /// Valid TOML with unusable values
    Invalid(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::parse("socket = \"/tmp/hand.sock\"").unwrap();
        assert_eq!(cfg.tty, "/dev/ttyS0");
        assert_eq!(cfg.retries, 3);
        assert_eq!(cfg.max_node_addr, 254);
        assert_eq!(cfg.socket_mode(), Ok(0o660));
        assert_eq!(cfg.bus_settings().retries, 3);
        assert_eq!(cfg.helper_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.bind_addrs(1129).len(), 2);
    }

    #[test]
    fn full() {
        let cfg = Config::parse(
            r#"
            tty = "/dev/ttyUSB1"
            baud = 19200
            pid_file = "/run/hand.pid"
            socket = "/run/hand.sock"
            socket_mode = "600"
            socket_uid = 0
            socket_gid = 20
            service = 1128
            textservice = 1129
            bindaddr = "127.0.0.1"
            retries = 5
            max_node_addr = 31
            ppower_path = "/usr/bin/ppower"
            helper_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.baud, 19200);
        assert_eq!(cfg.socket_mode(), Ok(0o600));
        assert_eq!(cfg.bind_addrs(1129), vec!["127.0.0.1:1129".parse().unwrap()]);
        assert_eq!(cfg.bus_settings().max_node_addr, 31);
    }

    #[test]
    fn rejects() {
        assert!(matches!(Config::parse("socket = \"/a\"\nbogus = 1"), Err(ParseError::Toml(_))));
        assert!(matches!(
            Config::parse("socket = \"/a\"\nmax_node_addr = 255"),
            Err(ParseError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("socket = \"/a\"\nsocket_mode = \"999\""),
            Err(ParseError::Invalid(_))
        ));
        assert!(matches!(Config::parse("textservice = 1129"), Err(ParseError::Invalid(_))));
        assert!(matches!(
            Config::parse("service = 1128\nbindaddr = \"not an ip\""),
            Err(ParseError::Invalid(_))
        ));
    }
}
