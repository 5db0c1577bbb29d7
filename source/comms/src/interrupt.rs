//! Unsolicited interrupt frames
//!
//! While the bus is idle, a node may send a short frame asking for
//! attention:
//!
//! ```text
//! STX | 0x02 | ADDR | CRC8 | ETX
//! STX | 0x03 | ADDR | CRC16 lo | CRC16 hi | ETX
//! ```
//!
//! Anything else showing up on an idle bus is counted as spurious input.

use heapless::Vec;

use crate::{
    codec::{crc16_ok, crc8_ok, ETX, STX, SUBST},
    Hdc,
};

/// The most bytes collected from one burst of idle bus input
pub const MAX_BURST: usize = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
enum State {
    #[default]
    Init,
    Receive {
        escaped: bool,
    },
    Ignore,
}

/// Collects one burst of idle bus input
///
/// A burst that does not begin with `STX` is gathered in full anyway, so
/// that it can be logged, but it never completes.
#[derive(Debug, Default)]
pub struct Assembler {
    buf: Vec<u8, MAX_BURST>,
    state: State,
}

/// A well formed interrupt request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// The node asking for attention
    pub addr: u8,
    /// Was the frame protected by a CRC16?
    pub crc16: bool,
}

/// A serviced interrupt, ready to be announced to monitors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupt {
    /// The node that interrupted
    pub addr: u8,
    /// The first three status bytes of its "get interrupt status" reply,
    /// or zeros if that exchange failed
    pub reason: [u8; 3],
}

impl Assembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns `true` when the frame is complete.
    pub fn feed(&mut self, byte: u8) -> bool {
        match self.state {
            State::Init => {
                if byte == STX {
                    self.state = State::Receive { escaped: false };
                } else {
                    self.store(byte);
                    self.state = State::Ignore;
                }
            }
            State::Receive { escaped: true } => {
                self.store(byte);
                self.state = State::Receive { escaped: false };
            }
            State::Receive { escaped: false } => match byte {
                ETX => return true,
                SUBST => self.state = State::Receive { escaped: true },
                b => self.store(b),
            },
            State::Ignore => self.store(byte),
        }
        false
    }

    fn store(&mut self, byte: u8) {
        // Once full, the caller stops feeding, see `is_full`
        let _ = self.buf.push(byte);
    }

    /// Has the burst reached [MAX_BURST] bytes?
    pub fn is_full(&self) -> bool {
        self.buf.is_full()
    }

    /// The bytes collected so far, without framing or escapes
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Validate the collected frame
    ///
    /// `complete` is whether [Assembler::feed] reported the end of a frame,
    /// rather than the burst timing out or filling up.
    pub fn finish(&self, complete: bool) -> Option<Request> {
        if !complete {
            return None;
        }
        let body = self.bytes();
        let crc16 = match (body.len(), Hdc::try_from(*body.first()?)) {
            (3, Ok(Hdc::Interrupt { crc16: false })) => false,
            (4, Ok(Hdc::Interrupt { crc16: true })) => true,
            _ => return None,
        };
        let crc_good = if crc16 {
            crc16_ok(body)
        } else {
            crc8_ok(body)
        };
        crc_good.then_some(Request {
            addr: body[1],
            crc16,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{crc16, crc8, frame};

    fn assemble(bytes: &[u8]) -> (Assembler, bool) {
        let mut asm = Assembler::new();
        let mut done = false;
        for &b in bytes {
            if asm.is_full() {
                break;
            }
            if asm.feed(b) {
                done = true;
                break;
            }
        }
        (asm, done)
    }

    pub(crate) fn intrq8(addr: u8) -> std::vec::Vec<u8> {
        let mut body = std::vec![0x02, addr];
        body.push(crc8(&body));
        frame(&body).unwrap().to_vec()
    }

    pub(crate) fn intrq16(addr: u8) -> std::vec::Vec<u8> {
        let mut body = std::vec![0x03, addr];
        body.extend_from_slice(&crc16(&body).to_le_bytes());
        frame(&body).unwrap().to_vec()
    }

    #[test]
    fn good_frames() {
        let (asm, done) = assemble(&intrq8(0x05));
        assert_eq!(asm.finish(done), Some(Request { addr: 0x05, crc16: false }));

        let (asm, done) = assemble(&intrq16(0x02));
        assert_eq!(asm.finish(done), Some(Request { addr: 0x02, crc16: true }));
    }

    #[test]
    fn spurious() {
        // No STX
        let (asm, done) = assemble(&[0x55, 0x02, 0x05, 0x00, 0x03]);
        assert!(!done);
        assert_eq!(asm.bytes().len(), 5);
        assert_eq!(asm.finish(done), None);

        // No ETX
        let wire = intrq8(0x05);
        let (asm, done) = assemble(&wire[..wire.len() - 1]);
        assert_eq!(asm.finish(done), None);

        // Bad CRC
        let mut wire = intrq8(0x06);
        let crc_at = wire.len() - 2;
        wire[crc_at] ^= 0x80;
        let (asm, done) = assemble(&wire);
        assert!(done);
        assert_eq!(asm.finish(done), None);

        // Right length, wrong header
        let mut body = std::vec![0x01, 0x05];
        body.push(crc8(&body));
        let (asm, done) = assemble(&frame(&body).unwrap());
        assert_eq!(asm.finish(done), None);

        // CRC8 header on a CRC16 length frame
        let mut body = std::vec![0x02, 0x05];
        body.extend_from_slice(&crc16(&body).to_le_bytes());
        let (asm, done) = assemble(&frame(&body).unwrap());
        assert_eq!(asm.finish(done), None);
    }

    #[test]
    fn bounded() {
        let noise = [0x55u8; MAX_BURST + 10];
        let (asm, done) = assemble(&noise);
        assert!(!done);
        assert!(asm.is_full());
        assert_eq!(asm.bytes().len(), MAX_BURST);
    }
}
