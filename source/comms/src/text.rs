//! The line oriented monitor protocol
//!
//! Monitor connections exchange newline terminated ASCII lines:
//!
//! | Request          | Meaning                                     |
//! | :--------------- | :------------------------------------------ |
//! | `CA<aa><cc><pp>*`| send command `cc` to node `aa`, with params |
//! | `IE`             | enable interrupt notifications              |
//! | `ID`             | disable interrupt notifications             |
//!
//! `CA` is answered with `RS<aa><cc><ss>*` carrying the status bytes, or
//! `CE<code>` with the failing [Status] code. `IE` and `ID` are answered
//! with `OK`, anything else with `ER`. Interrupts are announced with
//! `EI<aa><r0><r1><r2>`. All numbers are upper case hex byte pairs.

use core::fmt::Write;

use heapless::String;

use crate::{interrupt::Interrupt, Packet, Status, MAX_NODE_PARAMS};

/// The longest accepted request line
pub const MAX_LINE: usize = 80;

/// The longest reply line, including the newline
pub const MAX_REPLY: usize = 2 + 4 + (2 * MAX_NODE_PARAMS) + 1;

/// A reply line
pub type Reply = String<MAX_REPLY>;

/// Reply to a command that succeeded without data
pub const OK: &str = "OK\n";

/// Reply to a line that could not be understood
pub const ER: &str = "ER\n";

/// A parsed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextCommand {
    /// Send a packet through the retry layer
    Call(Packet),
    /// Start announcing interrupts on this connection
    InterruptsOn,
    /// Stop announcing interrupts on this connection
    InterruptsOff,
}

/// Why a request line was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextError {
    /// Not one of the known opcodes
    UnknownOpcode,
    /// Odd number of digits, too few or too many
    BadLength,
    /// Not a hex digit
    BadDigit,
}

/// Parse one request line, with or without its line ending
pub fn parse(line: &str) -> Result<TextCommand, TextError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (op, args) = match (line.get(..2), line.get(2..)) {
        (Some(op), Some(args)) => (op, args),
        _ => return Err(TextError::UnknownOpcode),
    };
    match op {
        "CA" => parse_call(args).map(TextCommand::Call),
        "IE" => Ok(TextCommand::InterruptsOn),
        "ID" => Ok(TextCommand::InterruptsOff),
        _ => Err(TextError::UnknownOpcode),
    }
}

fn parse_call(digits: &str) -> Result<Packet, TextError> {
    let len = digits.len();
    if len % 2 != 0 || len < 4 || len > 4 + (2 * MAX_NODE_PARAMS) {
        return Err(TextError::BadLength);
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TextError::BadDigit);
    }

    let mut bytes = digits
        .as_bytes()
        .chunks(2)
        .map(|pair| (hex_val(pair[0]) << 4) | hex_val(pair[1]));
    let (Some(addr), Some(cmd)) = (bytes.next(), bytes.next()) else {
        return Err(TextError::BadLength);
    };
    let mut pkt = Packet::new(addr, cmd);
    for b in bytes {
        pkt.params.push(b).map_err(|_| TextError::BadLength)?;
    }
    Ok(pkt)
}

fn hex_val(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => 0,
    }
}

/// `RS<aa><cc><ss>*`, the reply to a successful `CA`
pub fn status_reply(pkt: &Packet) -> Reply {
    let mut out = Reply::new();
    // MAX_REPLY fits every packet
    let _ = write!(out, "RS{:02X}{:02X}", pkt.addr, pkt.cmd);
    for b in pkt.status.iter() {
        let _ = write!(out, "{:02X}", b);
    }
    let _ = out.push('\n');
    out
}

/// `CE<code>`, the reply to a failed `CA`
pub fn error_reply(status: Status) -> Reply {
    let mut out = Reply::new();
    let _ = writeln!(out, "CE{:02X}", status.code());
    out
}

/// `EI<aa><r0><r1><r2>`, sent to every connection with interrupts enabled
pub fn interrupt_notice(irq: &Interrupt) -> Reply {
    let mut out = Reply::new();
    let [r0, r1, r2] = irq.reason;
    let _ = writeln!(out, "EI{:02X}{:02X}{:02X}{:02X}", irq.addr, r0, r1, r2);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn call_lines() {
        assert_eq!(
            parse("CA10030000\n"),
            Ok(TextCommand::Call(Packet::with_params(0x10, 0x03, &[0x00, 0x00]).unwrap()))
        );
        assert_eq!(parse("CA1003"), Ok(TextCommand::Call(Packet::new(0x10, 0x03))));
        assert_eq!(
            parse("CAfe01a5\r\n"),
            Ok(TextCommand::Call(Packet::with_params(0xFE, 0x01, &[0xA5]).unwrap()))
        );
    }

    #[test]
    fn rejected_lines() {
        assert_eq!(parse("CA100"), Err(TextError::BadLength));
        assert_eq!(parse("CA10"), Err(TextError::BadLength));
        assert_eq!(parse("CA"), Err(TextError::BadLength));
        assert_eq!(parse("CA10G3"), Err(TextError::BadDigit));
        assert_eq!(parse("CA+1+3"), Err(TextError::BadDigit));
        let long = "CA1003".to_owned() + &"00".repeat(MAX_NODE_PARAMS + 1);
        assert_eq!(parse(&long), Err(TextError::BadLength));
        assert_eq!(parse("XX"), Err(TextError::UnknownOpcode));
        assert_eq!(parse("I"), Err(TextError::UnknownOpcode));
        assert_eq!(parse(""), Err(TextError::UnknownOpcode));
        assert_eq!(parse("ca1003"), Err(TextError::UnknownOpcode));
    }

    #[test]
    fn toggles() {
        assert_eq!(parse("IE\n"), Ok(TextCommand::InterruptsOn));
        assert_eq!(parse("ID"), Ok(TextCommand::InterruptsOff));
    }

    #[test]
    fn replies() {
        let mut pkt = Packet::new(0x10, 0x03);
        pkt.status.extend_from_slice(&[0xAA, 0xBB]).unwrap();
        assert_eq!(status_reply(&pkt).as_str(), "RS1003AABB\n");

        pkt.status.clear();
        pkt.status.extend_from_slice(&[0xFF; MAX_NODE_PARAMS]).unwrap();
        assert_eq!(status_reply(&pkt).len(), MAX_REPLY);

        assert_eq!(error_reply(Status::RxTimeout).as_str(), "CE01\n");
        assert_eq!(error_reply(Status::NakError).as_str(), "CE06\n");

        let irq = Interrupt {
            addr: 0x05,
            reason: [0x01, 0x0A, 0xFF],
        };
        assert_eq!(interrupt_notice(&irq).as_str(), "EI05010AFF\n");
    }
}
