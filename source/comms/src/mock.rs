//! A scripted stand-in for the bus, for tests
//!
//! Every write to a [MockBus] consumes the next scripted [Reply], which
//! decides what the "nodes" answer. Bytes can also be queued directly with
//! [MockBus::push_rx], to simulate unsolicited traffic.
//!
//! Clones share the same state, so a test can keep a handle to a bus that
//! has been moved into a daemon.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    task::{Poll, Waker},
    vec::Vec,
};

use core::future::poll_fn;

use crate::{BusSerial, Error};

/// What happens in response to one write
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The write succeeds, and these bytes arrive afterwards
    Bytes(Vec<u8>),
    /// The write succeeds, and nobody answers
    Silent,
    /// The write fails
    FailWrite,
}

/// The error reported by a [Reply::FailWrite]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockError;

#[derive(Default)]
struct State {
    script: VecDeque<Reply>,
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    waker: Option<Waker>,
}

impl State {
    fn wake(&mut self) {
        if let Some(w) = self.waker.take() {
            w.wake();
        }
    }
}

/// A scripted bus
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<State>>,
}

impl MockBus {
    /// Create a bus with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test poisons the lock, keep going so the real
        // failure gets reported
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append replies to the script. An empty script acts as [Reply::Silent].
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.lock().script.extend(replies);
    }

    /// Queue bytes for reading, as if a node sent them unprompted
    pub fn push_rx(&self, bytes: &[u8]) {
        let mut state = self.lock();
        state.rx.extend(bytes.iter().copied());
        state.wake();
    }

    /// Every successful write so far, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Number of bytes waiting to be read
    pub fn pending_rx(&self) -> usize {
        self.lock().rx.len()
    }
}

impl BusSerial for MockBus {
    type SerError = MockError;

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error<Self::SerError>> {
        let mut state = self.lock();
        match state.script.pop_front().unwrap_or(Reply::Silent) {
            Reply::FailWrite => return Err(Error::Serial(MockError)),
            Reply::Silent => state.written.push(data.to_vec()),
            Reply::Bytes(answer) => {
                state.written.push(data.to_vec());
                state.rx.extend(answer);
                state.wake();
            }
        }
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8, Error<Self::SerError>> {
        poll_fn(|cx| {
            let mut state = self.lock();
            match state.rx.pop_front() {
                Some(b) => Poll::Ready(Ok(b)),
                None => {
                    state.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }

    async fn readable(&mut self) -> Result<(), Error<Self::SerError>> {
        poll_fn(|cx| {
            let mut state = self.lock();
            if state.rx.is_empty() {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            } else {
                Poll::Ready(Ok(()))
            }
        })
        .await
    }
}
