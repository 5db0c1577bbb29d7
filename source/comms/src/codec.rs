//! Frame encoding and decoding
//!
//! The "body" of a frame is everything between `STX` and `ETX` before
//! escaping: header control, address, command, parameters and CRC. All
//! buffers here are bounded [heapless::Vec]s, anything that would not fit is
//! reported rather than truncated.

use crc::{Crc, CRC_16_XMODEM, CRC_8_MAXIM_DOW};
use heapless::Vec;

use crate::{Hdc, Packet, MAX_NODE_PARAMS};

/// Start of frame
pub const STX: u8 = 0x02;
/// End of frame
pub const ETX: u8 = 0x03;
/// Escape marker, the following byte is taken literally
pub const SUBST: u8 = 0x04;

/// Largest frame body: header control, address, command, parameters, CRC16
pub const MAX_FRAME_BODY: usize = 3 + MAX_NODE_PARAMS + 2;

/// Largest frame on the wire: every body byte escaped, plus `STX` and `ETX`
pub const MAX_ENCODED_FRAME: usize = (2 * MAX_FRAME_BODY) + 2;

/// An unescaped frame body
pub type FrameBody = Vec<u8, MAX_FRAME_BODY>;

/// An escaped frame, ready to be written to the bus
pub type EncodedFrame = Vec<u8, MAX_ENCODED_FRAME>;

/// Codec error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The output buffer is full
    Overflow,
    /// The input is not a well formed frame
    Framing,
}

/// Does this byte need a `SUBST` prefix on the wire?
#[inline]
pub fn needs_escape(byte: u8) -> bool {
    byte <= SUBST
}

/// Escape `body` into `out`
pub fn stuff<const N: usize>(body: &[u8], out: &mut Vec<u8, N>) -> Result<(), CodecError> {
    for &b in body {
        if needs_escape(b) {
            out.push(SUBST).map_err(|_| CodecError::Overflow)?;
        }
        out.push(b).map_err(|_| CodecError::Overflow)?;
    }
    Ok(())
}

/// Reverse [stuff]
///
/// A dangling `SUBST` at the end of the input is a framing error.
pub fn unstuff<const N: usize>(data: &[u8], out: &mut Vec<u8, N>) -> Result<(), CodecError> {
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        let b = if b == SUBST {
            *iter.next().ok_or(CodecError::Framing)?
        } else {
            b
        };
        out.push(b).map_err(|_| CodecError::Overflow)?;
    }
    Ok(())
}

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC8 with polynomial `x^8+x^5+x^4+1`, reflected, initial value zero
///
/// Computing this over a body that already ends with its CRC8 gives zero.
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// CRC16 with polynomial `x^16+x^12+x^5+1`, MSB first, initial value zero
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Check a body ending in a CRC8
pub fn crc8_ok(body: &[u8]) -> bool {
    !body.is_empty() && crc8(body) == 0
}

/// Check a body ending in a CRC16, low byte first
pub fn crc16_ok(body: &[u8]) -> bool {
    match body.len().checked_sub(2) {
        Some(split) => {
            let (data, crc) = body.split_at(split);
            crc16(data) == u16::from_le_bytes([crc[0], crc[1]])
        }
        None => false,
    }
}

/// Append the CRC selected by `crc16` to the body built so far
pub fn push_crc(body: &mut FrameBody, crc16: bool) -> Result<(), CodecError> {
    if crc16 {
        let crc = self::crc16(body).to_le_bytes();
        body.extend_from_slice(&crc).map_err(|_| CodecError::Overflow)
    } else {
        let crc = crc8(body);
        body.push(crc).map_err(|_| CodecError::Overflow)
    }
}

/// Build the unescaped body of a command frame for `pkt`
pub fn command_body(pkt: &Packet, crc16: bool) -> Result<FrameBody, CodecError> {
    let mut body = FrameBody::new();
    let hdc = Hdc::Command { crc16 };
    body.extend_from_slice(&[hdc.into(), pkt.addr, pkt.cmd])
        .map_err(|_| CodecError::Overflow)?;
    body.extend_from_slice(&pkt.params)
        .map_err(|_| CodecError::Overflow)?;
    push_crc(&mut body, crc16)?;
    Ok(body)
}

/// Wrap a body in `STX`/`ETX`, escaping it
pub fn frame(body: &[u8]) -> Result<EncodedFrame, CodecError> {
    let mut out = EncodedFrame::new();
    out.push(STX).map_err(|_| CodecError::Overflow)?;
    stuff(body, &mut out)?;
    out.push(ETX).map_err(|_| CodecError::Overflow)?;
    Ok(out)
}

/// Build the complete wire frame for a command
pub fn encode_command(pkt: &Packet, crc16: bool) -> Result<EncodedFrame, CodecError> {
    frame(&command_body(pkt, crc16)?)
}

/// Incremental response deframer
///
/// Bytes are fed one at a time as they arrive from the bus. The first byte
/// must be `STX`. An `STX` seen inside the frame restarts it, unescaped
/// `0x00` and `0x01` are line noise and dropped, and `ETX` completes the
/// frame.
#[derive(Debug, Default)]
pub struct Deframer {
    body: FrameBody,
    state: DeframeState,
    seen: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
enum DeframeState {
    #[default]
    WaitStx,
    Frame,
    Escaped,
}

impl Deframer {
    /// Create an empty deframer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns `Ok(true)` once `ETX` has been seen.
    pub fn feed(&mut self, byte: u8) -> Result<bool, CodecError> {
        self.seen += 1;
        match self.state {
            DeframeState::WaitStx => {
                if byte != STX {
                    return Err(CodecError::Framing);
                }
                self.body.clear();
                self.state = DeframeState::Frame;
            }
            DeframeState::Frame => match byte {
                SUBST => self.state = DeframeState::Escaped,
                STX => self.body.clear(),
                ETX => return Ok(true),
                b if b > SUBST => self.push(b)?,
                _ => {}
            },
            DeframeState::Escaped => {
                self.push(byte)?;
                self.state = DeframeState::Frame;
            }
        }
        Ok(false)
    }

    fn push(&mut self, byte: u8) -> Result<(), CodecError> {
        // Longer than any legal response
        self.body.push(byte).map_err(|_| CodecError::Framing)
    }

    /// Has any byte at all been fed?
    pub fn started(&self) -> bool {
        self.seen != 0
    }

    /// The unescaped body received so far
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}
