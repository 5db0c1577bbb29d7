//! # HAN Comms
//!
//! This is the packet protocol engine of the HAN daemon. It drives a half-duplex
//! RS-485 multi-drop bus populated by small microcontroller "nodes", each
//! answering to a one byte address.
//!
//! All communication is initiated by the host (the "controller"), with one
//! exception: a node may spontaneously announce that it needs attention by
//! sending a short interrupt frame while the bus is idle.
//!
//! ## Message Framing
//!
//! Every frame on the wire looks like this:
//!
//! ```text
//! STX | HDC | ADDR | CMD | PARAM* | CRC (1 or 2 bytes) | ETX
//! ```
//!
//! * `STX` (`0x02`) and `ETX` (`0x03`) mark the start and end of a frame, and
//!   are never escaped.
//! * Every other byte whose value is at or below `SUBST` (`0x04`) is preceded
//!   by a `SUBST` byte, so the framing characters stay unambiguous. See
//!   [`codec`].
//! * `HDC` is the header control byte, see [`Hdc`]. It encodes the direction
//!   of the frame, the CRC variant in use, and for responses, ACK or NAK.
//! * The CRC is either an 8 bit CRC (`x^8+x^5+x^4+1`) or a 16 bit CRC
//!   (`x^16+x^12+x^5+1`, sent low byte first), computed over everything from
//!   `HDC` up to the last parameter byte.
//!
//! Responses use the same layout, with `CMD` echoed and the parameter bytes
//! replaced by status bytes.
//!
//! ## Mixed CRC networks
//!
//! Older nodes only understand CRC8. Newer nodes announce CRC16 support by
//! sending their interrupt frames with the CRC16 header. The controller keeps
//! a sticky per-node flag (see [`node::NodeTable`]), and picks the framing for
//! every transmission based on what it last heard from that node.
//!
//! ## Transactions
//!
//! A unicast transaction is one request frame followed by one response frame,
//! each response byte waited for with its own timeout. Broadcasts (address
//! `0xFF`) never get a response. See [`controller::Controller`] for the retry
//! policy and the statistics kept along the way.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod codec;
pub mod controller;
#[cfg(feature = "envelope")]
pub mod envelope;
pub mod interrupt;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod node;
pub mod stats;
pub mod text;

pub use crate::controller::Controller;

#[cfg(feature = "envelope")]
use serde::{Deserialize, Serialize};

/// The maximum number of parameter bytes in a request, and status
/// bytes in a response
pub const MAX_NODE_PARAMS: usize = 16;

/// The broadcast address. Frames sent here never get a response.
pub const BROADCAST_ADDR: u8 = 0xFF;

/// The highest address a unicast node may use
pub const MAX_UNICAST_ADDR: u8 = 0xFE;

/// Node command: identity query, answered with type and firmware level
pub const CMD_NODEID: u8 = 0x00;

/// Node command: get the reason for a pending interrupt
pub const CMD_GIST: u8 = 0x03;

/// Broadcast command: capability enumeration
pub const BCP_ENUM: u8 = 0x01;

/// An error type for the [`BusSerial`] trait
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying serial port
    Serial(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Serial(value)
    }
}

/// A trait representing the host side of the RS-485 bus
///
/// None of these methods impose a timeout of their own. The protocol engine
/// wraps every call in a deadline, so implementations may wait as long as
/// they like, but MUST be cancellation safe: a byte is either returned, or
/// left in the port to be returned by the next call.
pub trait BusSerial {
    /// The error type of the underlying serial port
    type SerError: core::fmt::Debug;

    /// Send all of `data`.
    ///
    /// The future MUST not return until the data has been handed completely
    /// to the port.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error<Self::SerError>>;

    /// Receive a single byte.
    async fn read_byte(&mut self) -> Result<u8, Error<Self::SerError>>;

    /// Wait until at least one byte can be read without waiting.
    ///
    /// Used by the event loop to notice frames the bus sends on its own.
    async fn readable(&mut self) -> Result<(), Error<Self::SerError>>;
}

/// Header control byte
///
/// [Hdc] is the first byte after `STX` in every frame. The low bits carry
/// the frame kind and CRC variant, the high bits carry the ACK/NAK state of
/// a response:
///
/// | Value  | Meaning                       |
/// | :----- | :---------------------------- |
/// | `0x01` | command, CRC8                 |
/// | `0x05` | command, CRC16                |
/// | `0x02` | interrupt request, CRC8       |
/// | `0x03` | interrupt request, CRC16      |
/// | `0xC1` | ACK response, CRC8            |
/// | `0xC5` | ACK response, CRC16           |
/// | `0x81` | NAK response, CRC8            |
/// | `0x85` | NAK response, CRC16           |
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hdc {
    /// A command from the controller to a node
    Command {
        /// Is this frame protected by a CRC16?
        crc16: bool,
    },
    /// An unsolicited interrupt request from a node
    Interrupt {
        /// Is this frame protected by a CRC16?
        crc16: bool,
    },
    /// A node accepted the command
    Ack {
        /// Is this frame protected by a CRC16?
        crc16: bool,
    },
    /// A node rejected the command
    Nak {
        /// Is this frame protected by a CRC16?
        crc16: bool,
    },
}

/// Header control error
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum HdcError {
    /// The byte is not a known header control value
    Unknown(u8),
}

impl Hdc {
    const COMMAND: u8 = 0x01;
    const COMMAND16: u8 = 0x05;
    const INTRQ: u8 = 0x02;
    const INTRQ16: u8 = 0x03;
    const ACK: u8 = 0xC1;
    const ACK16: u8 = 0xC5;
    const NAK: u8 = 0x81;
    const NAK16: u8 = 0x85;

    /// Number of CRC bytes trailing a frame with this header
    pub fn crc_len(&self) -> usize {
        match self {
            Hdc::Command { crc16 }
            | Hdc::Interrupt { crc16 }
            | Hdc::Ack { crc16 }
            | Hdc::Nak { crc16 } => {
                if *crc16 {
                    2
                } else {
                    1
                }
            }
        }
    }
}

impl TryFrom<u8> for Hdc {
    type Error = HdcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::COMMAND => Ok(Hdc::Command { crc16: false }),
            Self::COMMAND16 => Ok(Hdc::Command { crc16: true }),
            Self::INTRQ => Ok(Hdc::Interrupt { crc16: false }),
            Self::INTRQ16 => Ok(Hdc::Interrupt { crc16: true }),
            Self::ACK => Ok(Hdc::Ack { crc16: false }),
            Self::ACK16 => Ok(Hdc::Ack { crc16: true }),
            Self::NAK => Ok(Hdc::Nak { crc16: false }),
            Self::NAK16 => Ok(Hdc::Nak { crc16: true }),
            other => Err(HdcError::Unknown(other)),
        }
    }
}

impl From<Hdc> for u8 {
    fn from(val: Hdc) -> Self {
        match val {
            Hdc::Command { crc16: false } => Hdc::COMMAND,
            Hdc::Command { crc16: true } => Hdc::COMMAND16,
            Hdc::Interrupt { crc16: false } => Hdc::INTRQ,
            Hdc::Interrupt { crc16: true } => Hdc::INTRQ16,
            Hdc::Ack { crc16: false } => Hdc::ACK,
            Hdc::Ack { crc16: true } => Hdc::ACK16,
            Hdc::Nak { crc16: false } => Hdc::NAK,
            Hdc::Nak { crc16: true } => Hdc::NAK16,
        }
    }
}

/// A logical packet: one request to a node, and the status bytes it
/// answered with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "envelope", derive(Serialize, Deserialize))]
pub struct Packet {
    /// Destination node, or [`BROADCAST_ADDR`]
    pub addr: u8,
    /// Node command code
    pub cmd: u8,
    /// Parameter bytes sent with the command
    pub params: heapless::Vec<u8, MAX_NODE_PARAMS>,
    /// Status bytes returned by the node, filled in on success
    pub status: heapless::Vec<u8, MAX_NODE_PARAMS>,
}

impl Packet {
    /// Create a packet with no parameters
    pub fn new(addr: u8, cmd: u8) -> Self {
        Self {
            addr,
            cmd,
            params: heapless::Vec::new(),
            status: heapless::Vec::new(),
        }
    }

    /// Create a packet with the given parameters
    ///
    /// Returns [None] if there are more than [`MAX_NODE_PARAMS`] of them.
    pub fn with_params(addr: u8, cmd: u8, params: &[u8]) -> Option<Self> {
        let mut pkt = Self::new(addr, cmd);
        pkt.params.extend_from_slice(params).ok()?;
        Some(pkt)
    }

    /// Is this packet addressed to every node?
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.addr == BROADCAST_ADDR
    }
}

/// Why a bus transaction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// The request could not be written to the port in time. The bus
    /// is presumed down, so this is never retried.
    TxTimeout,
    /// Nothing at all was heard back from the node
    RxTimeout,
    /// The node started answering, but the frame was cut short, had no
    /// start marker, or was too long
    Framing,
    /// The response arrived intact but its CRC did not match
    Crc,
    /// The response header was neither ACK nor NAK
    Format,
    /// The node rejected the command
    Nak,
    /// The request itself was malformed
    InvalidParam,
}

impl BusError {
    /// Is another attempt worth making after this error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::RxTimeout | BusError::Crc | BusError::Framing)
    }
}

/// The outcome code reported to clients
///
/// Every client transaction ends with exactly one of these, on the command
/// sockets inside the response envelope, and on the text sockets as the
/// `CE` error code.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "envelope", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Status {
    /// The transaction succeeded
    Ok = 0,
    /// See [`BusError::RxTimeout`]
    RxTimeout = 1,
    /// See [`BusError::TxTimeout`]
    TxTimeout = 2,
    /// See [`BusError::Crc`]
    CrcError = 3,
    /// See [`BusError::Framing`]
    FramingError = 4,
    /// See [`BusError::Format`]
    FormatError = 5,
    /// See [`BusError::Nak`]
    NakError = 6,
    /// See [`BusError::InvalidParam`]
    InvalidParam = 7,
    /// The client asked for something the daemon does not know
    CmdUnknown = 8,
    /// The legacy helper path is not configured
    HelperConfigError = 9,
    /// The legacy helper could not be started
    HelperSpawnError = 10,
    /// The legacy helper failed or ran too long
    HelperError = 11,
}

impl Status {
    /// The numeric code of this status
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<BusError> for Status {
    fn from(value: BusError) -> Self {
        match value {
            BusError::TxTimeout => Status::TxTimeout,
            BusError::RxTimeout => Status::RxTimeout,
            BusError::Framing => Status::FramingError,
            BusError::Crc => Status::CrcError,
            BusError::Format => Status::FormatError,
            BusError::Nak => Status::NakError,
            BusError::InvalidParam => Status::InvalidParam,
        }
    }
}

impl From<Result<(), BusError>> for Status {
    fn from(value: Result<(), BusError>) -> Self {
        match value {
            Ok(()) => Status::Ok,
            Err(e) => e.into(),
        }
    }
}
