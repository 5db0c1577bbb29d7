//! Command socket envelopes
//!
//! A command connection carries exactly one [Request] and one [Response].
//! Both travel as a fixed size block of [ENVELOPE_SIZE] bytes: the
//! [postcard] encoding of the message, padded with zeros.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    controller::{NetScan, RawReply, RawRequest, RAW_MAX},
    stats::ErrStats,
    Packet, Status, MAX_NODE_PARAMS,
};

/// The size of every envelope, in both directions
pub const ENVELOPE_SIZE: usize = 2048;

/// The longest command accepted for the legacy helper
pub const HELPER_MAX: usize = 63;

/// Bumped whenever the envelope contents change incompatibly
pub const PROTOCOL_REVISION: u16 = 1;

/// One encoded envelope
pub type Envelope = [u8; ENVELOPE_SIZE];

/// What a client asks of the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Describe the daemon, so the client can check compatibility
    DaemonInfo,
    /// Send one packet through the retry layer
    SendPacket(Packet),
    /// Scan the bus for nodes
    NetScan,
    /// Read the error statistics
    NetStats,
    /// Read the error statistics, then zero them
    NetStatsClear,
    /// Pass a command string to the legacy helper program
    Helper {
        /// The single argument given to the helper
        command: heapless::String<HELPER_MAX>,
    },
    /// Perform a raw bus exchange
    Raw(RawRequest),
}

/// Fingerprint of the daemon and its limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    /// Daemon version
    pub version: heapless::String<16>,
    /// See [PROTOCOL_REVISION]
    pub protocol: u16,
    /// See [ENVELOPE_SIZE]
    pub envelope_size: u16,
    /// See [MAX_NODE_PARAMS]
    pub max_node_params: u8,
    /// See [RAW_MAX]
    pub raw_max: u8,
}

impl DaemonInfo {
    /// Describe this build, under the given version string
    ///
    /// Versions longer than 16 bytes are cut short.
    pub fn new(version: &str) -> Self {
        let mut v = heapless::String::new();
        for c in version.chars() {
            if v.push(c).is_err() {
                break;
            }
        }
        Self {
            version: v,
            protocol: PROTOCOL_REVISION,
            envelope_size: ENVELOPE_SIZE as u16,
            max_node_params: MAX_NODE_PARAMS as u8,
            raw_max: RAW_MAX as u8,
        }
    }
}

/// The data returned alongside the [Status]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    /// Nothing to report beyond the status
    Empty,
    /// Answer to [Request::DaemonInfo]
    DaemonInfo(DaemonInfo),
    /// The packet, with its status bytes filled in on success
    Packet(Packet),
    /// Every node found, even if the scan stopped early
    NetScan(NetScan),
    /// A statistics snapshot
    NetStats(ErrStats),
    /// Bytes read back by a raw exchange
    Raw(RawReply),
}

/// The daemon's answer to one [Request]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// The outcome of the request
    pub status: Status,
    /// Any data that goes with it
    pub body: ResponseBody,
}

impl Response {
    /// A response carrying only a status
    pub fn status(status: Status) -> Self {
        Self {
            status,
            body: ResponseBody::Empty,
        }
    }
}

/// Encode a message into a zero padded envelope
///
/// Returns [None] if the message does not fit.
pub fn encode<T: Serialize>(msg: &T) -> Option<Envelope> {
    let mut buf = [0u8; ENVELOPE_SIZE];
    postcard::to_slice(msg, &mut buf).ok()?;
    Some(buf)
}

/// Decode a message from an envelope, ignoring the padding
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Option<T> {
    postcard::from_bytes(buf).ok()
}
