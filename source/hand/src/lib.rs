//! # han-daemon
//!
//! The host side of a HAN bus: `hand` owns the RS-485 transport, and
//! arbitrates it between any number of clients.
//!
//! Clients talk to the daemon over one of:
//!
//! * a Unix domain command socket, or a TCP command port, carrying one fixed
//!   size request envelope and one response envelope per connection
//! * a TCP text port, carrying line based commands, which may also subscribe
//!   to node interrupt notices
//!
//! All bus traffic goes through a single [han_comms::Controller], driven
//! from the one event loop in [server].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod helper;
pub mod listen;
pub mod pidfile;
pub mod serial;
pub mod server;
pub mod watch;
