//! The event loop
//!
//! One task serves everything: the bus, the command listeners and the text
//! monitors. Each turn of the loop waits once for whichever watched
//! connection becomes ready first (the bus wins ties), handles exactly that
//! one, and goes around again. Every wait inside a handler is bounded, so a
//! stuck peer or node slows the daemon down but can not hang it.
//!
//! Reload and shutdown requests arrive over a [ControlChannel], and are only
//! acted on at the top of the loop.

use std::{future::Future, io, net::SocketAddr, pin::Pin, time::Duration};

use embassy_futures::select::{select, Either};
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::{Channel, Receiver},
};
use futures::future::{pending, select_all};
use han_comms::{
    text::{self, MAX_LINE},
    BusSerial, Controller,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
    time::timeout,
};

use crate::{
    dispatch,
    helper::Helper,
    watch::{Kind, WatchSet, WATCH_CAPACITY},
};

/// The mutex guarding the bus controller
pub type BusMutex = CriticalSectionRawMutex;

/// Depth of the control channel
pub const CONTROL_DEPTH: usize = 4;

/// Carries [Control] requests to the event loop
pub type ControlChannel = Channel<BusMutex, Control, CONTROL_DEPTH>;

/// Longest single wait for readiness
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Budget for reading a line from, or writing a line to, a text monitor
pub const TEXT_TIMEOUT: Duration = Duration::from_secs(1);

/// A request for the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Re-read the configuration and rebuild everything
    Reload,
    /// Clean up and stop
    Shutdown,
}

/// Why [Server::run] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// A reload was requested, or the bus transport failed
    Reload,
    /// A shutdown was requested
    Shutdown,
}

/// A watched connection
pub enum Conn {
    /// The bus transport, owned by the [Server] itself
    Bus,
    /// Unix domain command listener
    Local(UnixListener),
    /// TCP command listener
    Command(TcpListener),
    /// TCP text monitor listener
    TextListener(TcpListener),
    /// A connected text monitor
    Text(TextPeer),
}

/// A connected text monitor
pub struct TextPeer {
    stream: BufReader<TcpStream>,
    addr: SocketAddr,
}

impl TextPeer {
    fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            stream: BufReader::new(stream),
            addr,
        }
    }

    /// Read one line, `None` once the peer has gone
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = Vec::with_capacity(MAX_LINE);
        let mut limited = (&mut self.stream).take(MAX_LINE as u64);
        let res = timeout(TEXT_TIMEOUT, limited.read_until(b'\n', &mut line)).await;
        match res {
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(String::from_utf8_lossy(&line).into_owned())),
            Ok(Err(e)) => Err(e),
            // Whatever arrived in time still counts as the line
            Err(_) if !line.is_empty() => Ok(Some(String::from_utf8_lossy(&line).into_owned())),
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }

    async fn send(&mut self, line: &str) -> io::Result<()> {
        match timeout(TEXT_TIMEOUT, self.stream.get_mut().write_all(line.as_bytes())).await {
            Ok(res) => res,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }
}

enum Event<E> {
    Control(Control),
    Idle,
    Bus(Result<(), han_comms::Error<E>>),
    Local(io::Result<UnixStream>),
    Command(io::Result<(TcpStream, SocketAddr)>),
    TextAccept(io::Result<(TcpStream, SocketAddr)>),
    /// Readiness of the text monitor at this index, `false` at end of stream
    Text(usize, io::Result<bool>),
}

type Wait<'a, E> = Pin<Box<dyn Future<Output = Event<E>> + 'a>>;

/// The daemon's event loop and everything it owns
pub struct Server<'a, B: BusSerial> {
    ctrl: &'a Controller<BusMutex>,
    bus: B,
    watch: WatchSet<Conn>,
    control: Receiver<'a, BusMutex, Control, CONTROL_DEPTH>,
    helper: Helper,
    pending: Option<Control>,
}

impl<'a, B: BusSerial> Server<'a, B> {
    /// Build the watch set: the bus first, then the listeners
    pub fn new(
        ctrl: &'a Controller<BusMutex>,
        bus: B,
        listeners: Vec<(Kind, Conn)>,
        control: Receiver<'a, BusMutex, Control, CONTROL_DEPTH>,
        helper: Helper,
    ) -> Self {
        let mut watch = WatchSet::new();
        let all = core::iter::once((Kind::Serial, Conn::Bus)).chain(listeners);
        for (kind, conn) in all {
            if watch.push(kind, conn).is_err() {
                log::error!("Watch set full, not watching a {:?}", kind);
            }
        }
        Self {
            ctrl,
            bus,
            watch,
            control,
            helper,
            pending: None,
        }
    }

    /// Serve until asked to reload or shut down
    pub async fn run(&mut self) -> Exit {
        loop {
            match self.pending.take() {
                Some(Control::Shutdown) => return Exit::Shutdown,
                Some(Control::Reload) => return Exit::Reload,
                None => {}
            }

            match self.wait().await {
                Event::Control(c) => {
                    log::info!("Control request: {:?}", c);
                    self.request(c);
                }
                Event::Idle => {}
                Event::Bus(Ok(())) => self.service_bus().await,
                Event::Bus(Err(e)) => {
                    log::error!("Bus transport failed: {:?}, reopening", e);
                    self.request(Control::Reload);
                }
                Event::Local(Ok(stream)) => {
                    log::debug!("Command connection on the local socket");
                    dispatch::serve_command(self.ctrl, &mut self.bus, &self.helper, stream).await;
                }
                Event::Command(Ok((stream, addr))) => {
                    log::debug!("Command connection from {}", addr);
                    dispatch::serve_command(self.ctrl, &mut self.bus, &self.helper, stream).await;
                }
                Event::Local(Err(e)) | Event::Command(Err(e)) | Event::TextAccept(Err(e)) => {
                    log::warn!("Accept failed: {}", e);
                }
                Event::TextAccept(Ok((stream, addr))) => self.add_text(stream, addr),
                Event::Text(idx, Ok(true)) => self.text_line(idx).await,
                Event::Text(idx, Ok(false)) => self.drop_text(idx, "closed"),
                Event::Text(idx, Err(e)) => {
                    log::debug!("Text monitor error: {}", e);
                    self.drop_text(idx, "failed");
                }
            }
        }
    }

    fn request(&mut self, c: Control) {
        // Shutdown beats reload
        if self.pending != Some(Control::Shutdown) {
            self.pending = Some(c);
        }
    }

    /// Wait until one watched connection is ready, a control request
    /// arrives, or [IDLE_TIMEOUT] passes
    async fn wait(&mut self) -> Event<B::SerError> {
        let Self {
            bus,
            watch,
            control,
            ..
        } = self;

        let mut bus = Some(bus);
        let mut waits: Vec<Wait<'_, B::SerError>> = Vec::with_capacity(watch.len());
        for (idx, entry) in watch.iter_mut().enumerate() {
            let wait: Wait<'_, B::SerError> = match &mut entry.conn {
                Conn::Bus => match bus.take() {
                    Some(bus) => Box::pin(async move { Event::Bus(bus.readable().await) }),
                    None => continue,
                },
                Conn::Local(l) => Box::pin(async move { Event::Local(l.accept().await.map(|(s, _)| s)) }),
                Conn::Command(l) => Box::pin(async move { Event::Command(l.accept().await) }),
                Conn::TextListener(l) => Box::pin(async move { Event::TextAccept(l.accept().await) }),
                Conn::Text(peer) => Box::pin(async move {
                    let ready = peer.stream.fill_buf().await.map(|buf| !buf.is_empty());
                    Event::Text(idx, ready)
                }),
            };
            waits.push(wait);
        }

        let ready = async move {
            if waits.is_empty() {
                pending().await
            } else {
                select_all(waits).await.0
            }
        };

        match timeout(IDLE_TIMEOUT, select(control.receive(), ready)).await {
            Ok(Either::First(c)) => Event::Control(c),
            Ok(Either::Second(ev)) => ev,
            Err(_) => Event::Idle,
        }
    }

    async fn service_bus(&mut self) {
        let Some(irq) = self.ctrl.service_interrupt(&mut self.bus).await else {
            return;
        };
        let notice = text::interrupt_notice(&irq);

        let mut dead: heapless::Vec<usize, WATCH_CAPACITY> = heapless::Vec::new();
        for (idx, entry) in self.watch.iter_mut().enumerate() {
            if !entry.report_interrupts {
                continue;
            }
            if let Conn::Text(peer) = &mut entry.conn {
                if let Err(e) = peer.send(&notice).await {
                    log::debug!("Interrupt notice to {} failed: {}", peer.addr, e);
                    let _ = dead.push(idx);
                }
            }
        }
        // Back to front, so the indices stay valid
        while let Some(idx) = dead.pop() {
            self.drop_text(idx, "failed");
        }
    }

    fn add_text(&mut self, stream: TcpStream, addr: SocketAddr) {
        match self.watch.push(Kind::ConnectedText, Conn::Text(TextPeer::new(stream, addr))) {
            Ok(()) => log::info!("Text monitor connected from {}", addr),
            Err(_conn) => log::warn!("Watch set full, refusing text monitor {}", addr),
        }
    }

    async fn text_line(&mut self, idx: usize) {
        let Some(entry) = self.watch.get_mut(idx) else {
            return;
        };
        let Conn::Text(peer) = &mut entry.conn else {
            return;
        };

        let line = match peer.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return self.drop_text(idx, "closed"),
            Err(e) => {
                log::debug!("Text monitor read failed: {}", e);
                return self.drop_text(idx, "failed");
            }
        };

        let reply =
            dispatch::text_command(self.ctrl, &mut self.bus, &line, &mut entry.report_interrupts)
                .await;
        if let Err(e) = peer.send(&reply).await {
            log::debug!("Text monitor write failed: {}", e);
            self.drop_text(idx, "failed");
        }
    }

    fn drop_text(&mut self, idx: usize, why: &str) {
        if let Some(entry) = self.watch.remove(idx) {
            if let Conn::Text(peer) = entry.conn {
                log::info!("Text monitor {} {}", peer.addr, why);
            }
        }
    }

    /// Number of connected text monitors
    pub fn text_peers(&self) -> usize {
        self.watch.count(Kind::ConnectedText)
    }
}
