//! Controller Interface
//!
//! The Controller is responsible for running the bus.

use embassy_sync::{blocking_mutex::raw::RawMutex, mutex::Mutex};
use embassy_time::{with_timeout, Duration, TimeoutError, Timer};

use crate::{
    codec::{self, crc16_ok, crc8_ok, Deframer},
    interrupt::{Assembler, Interrupt},
    node::{Node, NodeTable},
    stats::ErrStats,
    BusError, BusSerial, Hdc, Packet, BCP_ENUM, BROADCAST_ADDR, CMD_GIST, CMD_NODEID,
    MAX_UNICAST_ADDR,
};

#[cfg(feature = "envelope")]
use serde::{Deserialize, Serialize};

/// The largest raw transaction, in either direction
pub const RAW_MAX: usize = 64;

/// Time budgets for bus operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTiming {
    /// Budget for handing a whole frame to the port
    pub write: Duration,
    /// Per byte budget while waiting for a command response
    pub response: Duration,
    /// Per byte budget while waiting for an identity reply during a scan
    pub scan_response: Duration,
    /// Gap that ends the collection of an interrupt frame
    pub interrupt_gap: Duration,
    /// Pause after a broadcast, in place of a response
    pub broadcast_settle: Duration,
    /// Pause after an accepted response, while the node releases the bus
    pub ack_settle: Duration,
}

impl BusTiming {
    /// The timings the HAN nodes are built for
    pub const DEFAULT: Self = Self {
        write: Duration::from_secs(1),
        response: Duration::from_millis(250),
        scan_response: Duration::from_millis(50),
        interrupt_gap: Duration::from_millis(10),
        broadcast_settle: Duration::from_millis(1),
        ack_settle: Duration::from_millis(1),
    };
}

impl Default for BusTiming {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Tunables of the [Controller]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSettings {
    /// Extra attempts made after a retryable failure
    pub retries: u8,
    /// The highest address visited by a scan, at most [MAX_UNICAST_ADDR]
    pub max_node_addr: u8,
    /// Time budgets
    pub timing: BusTiming,
}

impl BusSettings {
    /// Three retries, scanning the whole address space
    pub const DEFAULT: Self = Self {
        retries: 3,
        max_node_addr: MAX_UNICAST_ADDR,
        timing: BusTiming::DEFAULT,
    };
}

impl Default for BusSettings {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One node that answered a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "envelope", derive(Serialize, Deserialize))]
pub struct NodeInfo {
    /// Node address
    pub addr: u8,
    /// Declared device type
    pub node_type: u16,
    /// Declared firmware level
    pub fw_level: u16,
}

/// The nodes found by a scan, in ascending address order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "envelope", derive(Serialize, Deserialize))]
pub struct NetScan {
    /// Every node that answered
    pub nodes: heapless::Vec<NodeInfo, 255>,
}

/// A raw bus transaction, bypassing framing entirely
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "envelope", derive(Serialize, Deserialize))]
pub struct RawRequest {
    /// Bytes written verbatim
    pub tx: heapless::Vec<u8, RAW_MAX>,
    /// Budget for writing `tx`, in milliseconds
    pub tx_timeout_ms: u32,
    /// How many bytes to wait for, at most [RAW_MAX]
    pub rx_expect: u8,
    /// Per byte budget while reading, in milliseconds
    pub rx_timeout_ms: u32,
}

/// The bytes read back by a [RawRequest]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "envelope", derive(Serialize, Deserialize))]
pub struct RawReply {
    /// Bytes received, possibly fewer than expected
    pub rx: heapless::Vec<u8, RAW_MAX>,
}

struct Inner {
    nodes: NodeTable,
    stats: ErrStats,
    settings: BusSettings,
}

/// Controller interface and data storage
///
/// The Controller owns everything learned about the bus: the per-node
/// capability flags, and the error statistics. It does not own the serial
/// port, which is passed in on every call instead, so the same Controller
/// (and everything it learned) survives the port being closed and reopened.
///
/// Every bus operation holds the inner async Mutex for its whole duration,
/// which serializes access to the bus. With the default timings this may be
/// on the order of a second for a unicast with retries, and much longer
/// for a full scan.
pub struct Controller<R: RawMutex + 'static> {
    inner: Mutex<R, Inner>,
}

/// Instantiation and configuration methods
impl<R: RawMutex + 'static> Controller<R> {
    /// Create a new controller, with no knowledge of any node
    ///
    /// ```rust
    /// use han_comms::controller::{BusSettings, Controller};
    /// use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    ///
    /// let ctrl: Controller<NoopRawMutex> = Controller::new(BusSettings::default());
    /// ```
    pub const fn new(settings: BusSettings) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: NodeTable::new(),
                stats: ErrStats {
                    round_trips: 0,
                    spurious_packets: 0,
                    rx_timeouts: 0,
                    tx_timeouts: 0,
                    crc_errs: 0,
                    framing_errs: 0,
                    format_errs: 0,
                    naks: 0,
                },
                settings,
            }),
        }
    }

    /// Replace the settings, keeping node flags and statistics
    pub async fn configure(&self, mut settings: BusSettings) {
        settings.max_node_addr = settings.max_node_addr.min(MAX_UNICAST_ADDR);
        self.inner.lock().await.settings = settings;
    }

    /// The current settings
    pub async fn settings(&self) -> BusSettings {
        self.inner.lock().await.settings
    }

    /// A snapshot of the statistics
    pub async fn stats(&self) -> ErrStats {
        self.inner.lock().await.stats
    }

    /// A snapshot of the statistics, zeroing them
    pub async fn take_stats(&self) -> ErrStats {
        self.inner.lock().await.stats.take()
    }

    /// The flags learned about `addr`
    pub async fn node(&self, addr: u8) -> Node {
        *self.inner.lock().await.nodes.get(addr)
    }
}

/// Bus operation methods
///
/// The `serial` port is passed in on every call, see [Controller].
impl<R: RawMutex + 'static> Controller<R> {
    /// Perform a single request/response exchange
    ///
    /// No retries are made and no statistics are kept.
    pub async fn transceive<T: BusSerial>(
        &self,
        serial: &mut T,
        pkt: &mut Packet,
        rx_timeout: Duration,
    ) -> Result<(), BusError> {
        let inner = self.inner.lock().await;
        transceive(&inner.nodes, &inner.settings.timing, serial, pkt, rx_timeout).await
    }

    /// Send a packet, retrying transport and integrity failures
    ///
    /// At most `retries + 1` attempts are made. Every attempt is counted in
    /// the statistics. The outcome of the last attempt is returned.
    pub async fn send<T: BusSerial>(&self, serial: &mut T, pkt: &mut Packet) -> Result<(), BusError> {
        let mut inner = self.inner.lock().await;
        send_with_retries(&mut inner, serial, pkt).await
    }

    /// Ask every address up to `max_node_addr` who is there
    ///
    /// `out` is cleared first, and holds every node found so far even if
    /// the scan is cut short. Only a transmit failure stops the scan, which
    /// is then reported.
    pub async fn scan<T: BusSerial>(&self, serial: &mut T, out: &mut NetScan) -> Result<(), BusError> {
        let inner = self.inner.lock().await;
        out.nodes.clear();
        let timing = inner.settings.timing;
        let max = inner.settings.max_node_addr.min(MAX_UNICAST_ADDR);

        for addr in 0..=max {
            let mut pkt = Packet::with_params(addr, CMD_NODEID, &[0u8; 4]).ok_or(BusError::InvalidParam)?;
            match transceive(&inner.nodes, &timing, serial, &mut pkt, timing.scan_response).await {
                Ok(()) => {
                    let info = NodeInfo {
                        addr,
                        node_type: le_u16(&pkt.status, 0),
                        fw_level: le_u16(&pkt.status, 2),
                    };
                    han_info!("Found node {:02X}: type {:04X}, fw {:04X}", addr, info.node_type, info.fw_level);
                    if out.nodes.push(info).is_err() {
                        break;
                    }
                }
                Err(BusError::TxTimeout) => {
                    han_error!("Transmit failure while scanning at {:02X}", addr);
                    return Err(BusError::TxTimeout);
                }
                Err(_) => {
                    // Nobody home
                }
            }
        }
        Ok(())
    }

    /// Broadcast the capability enumeration command
    pub async fn enumerate<T: BusSerial>(&self, serial: &mut T) -> Result<(), BusError> {
        let inner = self.inner.lock().await;
        let mut pkt = Packet::new(BROADCAST_ADDR, BCP_ENUM);
        let timing = inner.settings.timing;
        transceive(&inner.nodes, &timing, serial, &mut pkt, timing.response).await
    }

    /// Write raw bytes to the bus, then read whatever comes back
    ///
    /// Reading stops after `rx_expect` bytes, or once a single byte takes
    /// longer than `rx_timeout_ms` to arrive. Short reads are not an error.
    pub async fn raw<T: BusSerial>(&self, serial: &mut T, req: &RawRequest) -> Result<RawReply, BusError> {
        let expect = usize::from(req.rx_expect);
        if req.tx.is_empty() || expect > RAW_MAX {
            return Err(BusError::InvalidParam);
        }
        let _inner = self.inner.lock().await;

        let tx_budget = Duration::from_millis(req.tx_timeout_ms.into());
        match with_timeout(tx_budget, serial.write_all(&req.tx)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                han_warn!("Raw write failed: {:?}", e);
                return Err(BusError::TxTimeout);
            }
            Err(TimeoutError) => return Err(BusError::TxTimeout),
        }

        let rx_budget = Duration::from_millis(req.rx_timeout_ms.into());
        let mut reply = RawReply::default();
        while reply.rx.len() < expect {
            match with_timeout(rx_budget, serial.read_byte()).await {
                Ok(Ok(b)) => {
                    if reply.rx.push(b).is_err() {
                        break;
                    }
                }
                Ok(Err(_)) | Err(TimeoutError) => break,
            }
        }
        han_debug!("Raw exchange: {} out, {} back", req.tx.len(), reply.rx.len());
        Ok(reply)
    }

    /// Collect and handle input that arrived while the bus was idle
    ///
    /// Call this when the port has bytes to read outside of any exchange.
    /// If they form a valid interrupt frame, the node's flags are updated
    /// and it is asked for its interrupt status, and the result is returned.
    /// Anything else is counted as spurious and `None` is returned.
    pub async fn service_interrupt<T: BusSerial>(&self, serial: &mut T) -> Option<Interrupt> {
        let mut inner = self.inner.lock().await;
        let gap = inner.settings.timing.interrupt_gap;

        let mut asm = Assembler::new();
        let complete = loop {
            if asm.is_full() {
                break false;
            }
            match with_timeout(gap, serial.read_byte()).await {
                Ok(Ok(b)) => {
                    if asm.feed(b) {
                        break true;
                    }
                }
                Ok(Err(_)) | Err(TimeoutError) => break false,
            }
        };

        let Some(req) = asm.finish(complete) else {
            han_warn!("Spurious data received on bus: {:02X?}", asm.bytes());
            inner.stats.spurious();
            return None;
        };

        han_info!("Interrupt from node {:02X}, crc16: {}", req.addr, req.crc16);
        inner.nodes.get_mut(req.addr).heard_interrupt(req.crc16);

        let mut pkt = Packet::with_params(req.addr, CMD_GIST, &[0u8; 3])?;
        let mut reason = [0u8; 3];
        match send_with_retries(&mut inner, serial, &mut pkt).await {
            Ok(()) => {
                reason
                    .iter_mut()
                    .zip(pkt.status.iter())
                    .for_each(|(d, s)| *d = *s);
                han_debug!("Interrupt reason from {:02X}: {:02X?}", req.addr, reason);
            }
            Err(e) => {
                han_warn!("Interrupt status from {:02X} failed: {:?}", req.addr, e);
            }
        }

        Some(Interrupt {
            addr: req.addr,
            reason,
        })
    }
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    let lo = data.get(at).copied().unwrap_or(0);
    let hi = data.get(at + 1).copied().unwrap_or(0);
    u16::from_le_bytes([lo, hi])
}

/// The retry layer
async fn send_with_retries<T: BusSerial>(
    inner: &mut Inner,
    serial: &mut T,
    pkt: &mut Packet,
) -> Result<(), BusError> {
    let timing = inner.settings.timing;
    let attempts = u16::from(inner.settings.retries) + 1;
    let mut res = Err(BusError::RxTimeout);

    for attempt in 1..=attempts {
        res = transceive(&inner.nodes, &timing, serial, pkt, timing.response).await;
        inner.stats.record(res);
        match res {
            Ok(()) => break,
            Err(e) if e.is_retryable() && attempt < attempts => {
                han_debug!("Attempt {} to {:02X} failed: {:?}, retrying", attempt, pkt.addr, e);
            }
            Err(e) => {
                han_warn!("Send to {:02X} failed after {} attempt(s): {:?}", pkt.addr, attempt, e);
                break;
            }
        }
    }
    res
}

/// The transceiver: one frame out, and for unicasts, one frame back
async fn transceive<T: BusSerial>(
    nodes: &NodeTable,
    timing: &BusTiming,
    serial: &mut T,
    pkt: &mut Packet,
    rx_timeout: Duration,
) -> Result<(), BusError> {
    let crc16 = nodes.crc16_for(pkt.addr);
    han_trace!(
        "Addressing node {:02X}, cmd {:02X}, params {:02X?}, crc16: {}",
        pkt.addr,
        pkt.cmd,
        pkt.params,
        crc16
    );

    let frame = codec::encode_command(pkt, crc16).map_err(|_| BusError::InvalidParam)?;
    match with_timeout(timing.write, serial.write_all(&frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            han_warn!("Packet write failed: {:?}", e);
            return Err(BusError::TxTimeout);
        }
        Err(TimeoutError) => {
            han_warn!("Packet transmit timeout");
            return Err(BusError::TxTimeout);
        }
    }

    // Nobody answers a broadcast
    if pkt.is_broadcast() {
        Timer::after(timing.broadcast_settle).await;
        return Ok(());
    }

    let mut deframer = Deframer::new();
    loop {
        let byte = match with_timeout(rx_timeout, serial.read_byte()).await {
            Ok(Ok(b)) => b,
            Ok(Err(_)) | Err(TimeoutError) => {
                return Err(if deframer.started() {
                    han_debug!("Timeout after partial response from {:02X}", pkt.addr);
                    BusError::Framing
                } else {
                    han_debug!("No response from {:02X}", pkt.addr);
                    BusError::RxTimeout
                });
            }
        };
        match deframer.feed(byte) {
            Ok(true) => break,
            Ok(false) => {}
            Err(_) => {
                han_debug!("Framing error in response from {:02X}", pkt.addr);
                return Err(BusError::Framing);
            }
        }
    }

    let body = deframer.body();
    let crc_len = if crc16 { 2 } else { 1 };
    let Some(status_end) = body.len().checked_sub(crc_len).filter(|e| *e >= 3) else {
        han_debug!("Short response from {:02X}: {:02X?}", pkt.addr, body);
        return Err(BusError::Framing);
    };

    let crc_good = if crc16 { crc16_ok(body) } else { crc8_ok(body) };
    if !crc_good {
        han_debug!("CRC error in response from {:02X}", pkt.addr);
        return Err(BusError::Crc);
    }

    match Hdc::try_from(body[0]) {
        Ok(Hdc::Ack { crc16: c }) if c == crc16 => {}
        Ok(Hdc::Nak { crc16: c }) if c == crc16 => {
            han_debug!("Node {:02X} returned NAK", pkt.addr);
            return Err(BusError::Nak);
        }
        _ => {
            han_debug!("Unrecognized response header {:02X} from {:02X}", body[0], pkt.addr);
            return Err(BusError::Format);
        }
    }

    pkt.status.clear();
    pkt.status
        .extend_from_slice(&body[3..status_end])
        .map_err(|_| BusError::Framing)?;

    Timer::after(timing.ack_settle).await;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        codec::{frame, push_crc, FrameBody},
        mock::{MockBus, Reply},
        MAX_NODE_PARAMS,
    };
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use futures::executor::block_on;

    type TestController = Controller<CriticalSectionRawMutex>;

    fn fast() -> BusSettings {
        BusSettings {
            retries: 3,
            max_node_addr: 8,
            timing: BusTiming {
                write: Duration::from_millis(50),
                response: Duration::from_millis(5),
                scan_response: Duration::from_millis(2),
                interrupt_gap: Duration::from_millis(5),
                broadcast_settle: Duration::from_micros(100),
                ack_settle: Duration::from_micros(100),
            },
        }
    }

    pub(crate) fn response(hdc: Hdc, addr: u8, cmd: u8, status: &[u8]) -> std::vec::Vec<u8> {
        let crc16 = hdc.crc_len() == 2;
        let mut body = FrameBody::new();
        body.extend_from_slice(&[hdc.into(), addr, cmd]).unwrap();
        body.extend_from_slice(status).unwrap();
        push_crc(&mut body, crc16).unwrap();
        frame(&body).unwrap().to_vec()
    }

    fn ack(addr: u8, cmd: u8, status: &[u8]) -> Reply {
        Reply::Bytes(response(Hdc::Ack { crc16: false }, addr, cmd, status))
    }

    #[test]
    fn unicast_success() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();
        bus.script([ack(0x10, 0x03, &[0xAA, 0xBB])]);

        let mut pkt = Packet::new(0x10, 0x03);
        let res = block_on(ctrl.send(&mut bus, &mut pkt));
        assert_eq!(res, Ok(()));
        assert_eq!(pkt.status.as_slice(), &[0xAA, 0xBB]);

        let written = bus.written();
        assert_eq!(written.len(), 1);
        let expected = codec::encode_command(&Packet::new(0x10, 0x03), false).unwrap();
        assert_eq!(written[0].as_slice(), expected.as_slice());

        let stats = block_on(ctrl.stats());
        assert_eq!(stats.round_trips, 1);
        assert_eq!(stats.rx_timeouts, 0);
    }

    #[test]
    fn retry_bound() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();
        bus.script(core::iter::repeat(Reply::Silent).take(8));

        let mut pkt = Packet::new(0x22, 0x01);
        let res = block_on(ctrl.send(&mut bus, &mut pkt));
        assert_eq!(res, Err(BusError::RxTimeout));
        assert_eq!(bus.written().len(), 4);
        assert_eq!(block_on(ctrl.stats()).rx_timeouts, 4);
    }

    #[test]
    fn retry_then_success() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();
        let mut bad = response(Hdc::Ack { crc16: false }, 0x22, 0x01, &[0x01]);
        let crc_at = bad.len() - 2;
        bad[crc_at] ^= 0xA0;
        bus.script([Reply::Silent, Reply::Bytes(bad), ack(0x22, 0x01, &[0x01])]);

        let mut pkt = Packet::new(0x22, 0x01);
        assert_eq!(block_on(ctrl.send(&mut bus, &mut pkt)), Ok(()));
        assert_eq!(bus.written().len(), 3);
        let stats = block_on(ctrl.stats());
        assert_eq!(stats.rx_timeouts, 1);
        assert_eq!(stats.crc_errs, 1);
        assert_eq!(stats.round_trips, 1);

        let snap = block_on(ctrl.take_stats());
        assert_eq!(snap.round_trips, 1);
        assert_eq!(block_on(ctrl.stats()), ErrStats::default());
    }

    #[test]
    fn no_retry_on_tx_failure() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();
        bus.script([Reply::FailWrite, ack(0x22, 0x01, &[])]);

        let mut pkt = Packet::new(0x22, 0x01);
        assert_eq!(block_on(ctrl.send(&mut bus, &mut pkt)), Err(BusError::TxTimeout));
        assert_eq!(bus.written().len(), 0);
        let stats = block_on(ctrl.stats());
        assert_eq!(stats.tx_timeouts, 1);
        assert_eq!(stats.round_trips, 0);
    }

    #[test]
    fn nak_is_terminal() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();
        bus.script([
            Reply::Bytes(response(Hdc::Nak { crc16: false }, 0x30, 0x07, &[])),
            ack(0x30, 0x07, &[]),
        ]);

        let mut pkt = Packet::new(0x30, 0x07);
        assert_eq!(block_on(ctrl.send(&mut bus, &mut pkt)), Err(BusError::Nak));
        assert_eq!(bus.written().len(), 1);
        assert_eq!(block_on(ctrl.stats()).naks, 1);
    }

    #[test]
    fn format_and_framing() {
        let ctrl = TestController::new(fast());
        let timeout = fast().timing.response;
        let mut bus = MockBus::new();

        // Interrupt header in place of ACK/NAK
        bus.script([Reply::Bytes(response(Hdc::Interrupt { crc16: false }, 0x30, 0x07, &[]))]);
        let mut pkt = Packet::new(0x30, 0x07);
        assert_eq!(block_on(ctrl.transceive(&mut bus, &mut pkt, timeout)), Err(BusError::Format));

        // Stalls before ETX
        let mut cut = response(Hdc::Ack { crc16: false }, 0x30, 0x07, &[0x10]);
        cut.pop();
        bus.script([Reply::Bytes(cut)]);
        assert_eq!(block_on(ctrl.transceive(&mut bus, &mut pkt, timeout)), Err(BusError::Framing));

        // No STX
        bus.script([Reply::Bytes(std::vec![0x55, 0x02])]);
        assert_eq!(block_on(ctrl.transceive(&mut bus, &mut pkt, timeout)), Err(BusError::Framing));

        // Too long for any legal response
        let mut long = std::vec![codec::STX];
        long.extend(core::iter::repeat(0x55).take(MAX_NODE_PARAMS + 6));
        long.push(codec::ETX);
        bus.script([Reply::Bytes(long)]);
        assert_eq!(block_on(ctrl.transceive(&mut bus, &mut pkt, timeout)), Err(BusError::Framing));
    }

    #[test]
    fn crc16_reply_to_crc8_request() {
        let ctrl = TestController::new(fast());
        let timeout = fast().timing.response;
        let mut bus = MockBus::new();

        // Well formed, but not in the variant the node was addressed with
        bus.script([Reply::Bytes(response(Hdc::Ack { crc16: true }, 0x30, 0x07, &[]))]);
        let mut pkt = Packet::new(0x30, 0x07);
        assert_eq!(block_on(ctrl.transceive(&mut bus, &mut pkt, timeout)), Err(BusError::Crc));
        assert!(pkt.status.is_empty());
        assert!(!block_on(ctrl.node(0x30)).crc16());
    }

    #[test]
    fn broadcast_never_reads() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();
        // Whatever is sitting on the bus must be left alone
        bus.push_rx(&[0x55, 0x66]);

        let mut pkt = Packet::new(BROADCAST_ADDR, 0x09);
        assert_eq!(block_on(ctrl.send(&mut bus, &mut pkt)), Ok(()));
        assert_eq!(bus.written().len(), 1);
        assert_eq!(bus.pending_rx(), 2);

        assert_eq!(block_on(ctrl.enumerate(&mut bus)), Ok(()));
        let written = bus.written();
        assert_eq!(written.len(), 2);
        let expected = codec::encode_command(&Packet::new(0xFF, BCP_ENUM), false).unwrap();
        assert_eq!(written[1].as_slice(), expected.as_slice());
    }

    #[test]
    fn scan_bounds() {
        let ctrl = TestController::new(BusSettings {
            max_node_addr: 5,
            ..fast()
        });
        let mut bus = MockBus::new();
        bus.script([
            Reply::Silent,
            ack(0x01, CMD_NODEID, &[0x34, 0x12, 0x02, 0x01]),
            Reply::Silent,
            Reply::Silent,
            ack(0x04, CMD_NODEID, &[0x01, 0x00, 0x07, 0x00]),
            Reply::Silent,
        ]);

        let mut found = NetScan::default();
        assert_eq!(block_on(ctrl.scan(&mut bus, &mut found)), Ok(()));
        // The address is the second byte of the unescaped body
        let addrs: std::vec::Vec<u8> = bus
            .written()
            .iter()
            .map(|w| {
                let mut body = FrameBody::new();
                codec::unstuff(&w[1..w.len() - 1], &mut body).unwrap();
                body[1]
            })
            .collect();
        assert_eq!(addrs, [0, 1, 2, 3, 4, 5]);
        assert_eq!(
            found.nodes.as_slice(),
            &[
                NodeInfo {
                    addr: 1,
                    node_type: 0x1234,
                    fw_level: 0x0102
                },
                NodeInfo {
                    addr: 4,
                    node_type: 0x0001,
                    fw_level: 0x0007
                },
            ]
        );
        // Absent nodes are not errors
        assert_eq!(block_on(ctrl.stats()), ErrStats::default());
    }

    #[test]
    fn scan_aborts_on_tx_failure() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();
        bus.script([ack(0x00, CMD_NODEID, &[1, 0, 1, 0]), Reply::Silent, Reply::FailWrite]);

        let mut found = NetScan::default();
        assert_eq!(block_on(ctrl.scan(&mut bus, &mut found)), Err(BusError::TxTimeout));
        assert_eq!(bus.written().len(), 2);
        assert_eq!(found.nodes.len(), 1);
    }

    #[test]
    fn interrupt_sets_crc16() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();

        let mut body = FrameBody::new();
        body.extend_from_slice(&[0x03, 0x05]).unwrap();
        push_crc(&mut body, true).unwrap();
        bus.push_rx(&frame(&body).unwrap());
        bus.script([Reply::Bytes(response(
            Hdc::Ack { crc16: true },
            0x05,
            CMD_GIST,
            &[0x11, 0x22, 0x33],
        ))]);

        let irq = block_on(ctrl.service_interrupt(&mut bus));
        assert_eq!(
            irq,
            Some(Interrupt {
                addr: 0x05,
                reason: [0x11, 0x22, 0x33]
            })
        );
        let node = block_on(ctrl.node(0x05));
        assert!(node.crc16());
        assert!(node.is_interrupter());

        // The status request went out with CRC16 framing
        let gist = Packet::with_params(0x05, CMD_GIST, &[0, 0, 0]).unwrap();
        let expected = codec::encode_command(&gist, true).unwrap();
        assert_eq!(bus.written()[0].as_slice(), expected.as_slice());
    }

    #[test]
    fn interrupt_without_status() {
        let ctrl = TestController::new(BusSettings {
            retries: 0,
            ..fast()
        });
        let mut bus = MockBus::new();
        let mut body = FrameBody::new();
        body.extend_from_slice(&[0x02, 0x07]).unwrap();
        push_crc(&mut body, false).unwrap();
        bus.push_rx(&frame(&body).unwrap());
        bus.script([Reply::Silent]);

        let irq = block_on(ctrl.service_interrupt(&mut bus));
        assert_eq!(irq, Some(Interrupt { addr: 0x07, reason: [0; 3] }));
        assert!(!block_on(ctrl.node(0x07)).crc16());
    }

    #[test]
    fn spurious_input() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();
        bus.push_rx(&[0x55, 0x66, 0x77]);

        assert_eq!(block_on(ctrl.service_interrupt(&mut bus)), None);
        assert_eq!(bus.pending_rx(), 0);
        assert!(bus.written().is_empty());
        assert_eq!(block_on(ctrl.stats()).spurious_packets, 1);
    }

    #[test]
    fn raw_exchange() {
        let ctrl = TestController::new(fast());
        let mut bus = MockBus::new();
        bus.script([Reply::Bytes(std::vec![0x10, 0x20, 0x30])]);

        let mut req = RawRequest {
            tx: heapless::Vec::from_slice(&[0xAB, 0xCD]).unwrap(),
            tx_timeout_ms: 50,
            rx_expect: 5,
            rx_timeout_ms: 5,
        };
        let reply = block_on(ctrl.raw(&mut bus, &req)).unwrap();
        assert_eq!(reply.rx.as_slice(), &[0x10, 0x20, 0x30]);
        assert_eq!(bus.written()[0].as_slice(), &[0xAB, 0xCD]);

        req.rx_expect = (RAW_MAX + 1) as u8;
        assert_eq!(block_on(ctrl.raw(&mut bus, &req)), Err(BusError::InvalidParam));
        req.rx_expect = 1;
        req.tx.clear();
        assert_eq!(block_on(ctrl.raw(&mut bus, &req)), Err(BusError::InvalidParam));
    }
}
