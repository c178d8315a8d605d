//! In-memory transport
//!
//! Stands in for a serial link in tests and tools. The handle is cheap to clone; one clone is
//! handed to the engine while another stays with the test to inject modem output and inspect
//! what the engine wrote.
//!
//! ```
//! use at_handler::mock::MockTransport;
//! use at_handler::transport::Transport;
//!
//! let mut link = MockTransport::new();
//! let probe = link.clone();
//!
//! probe.inject(b"OK\r\n");
//! let mut buf = [0u8; 8];
//! assert_eq!(link.read(&mut buf).unwrap(), 4);
//!
//! link.write(b"AT\r").unwrap();
//! assert_eq!(probe.sent(), b"AT\r");
//! ```
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::transport::{DataReadyCallback, Transport, TransportError};

#[derive(Default)]
struct State {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    callback: Option<DataReadyCallback>,
    blocked: bool,
    echo: bool,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    readable: Condvar,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues bytes as if the modem had sent them and fires the data-ready notification
    pub fn inject(&self, data: &[u8]) {
        let callback = {
            let mut state = self.state();
            state.rx.extend(data.iter().copied());
            state.callback.clone()
        };
        self.shared.readable.notify_all();
        // outside of the state lock, the callback may poll the link
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Everything written so far
    pub fn sent(&self) -> Vec<u8> {
        self.state().tx.clone()
    }

    /// Everything written so far, clearing the capture
    pub fn take_sent(&self) -> Vec<u8> {
        core::mem::take(&mut self.state().tx)
    }

    /// Bytes injected but not read yet
    pub fn pending(&self) -> usize {
        self.state().rx.len()
    }

    /// While blocked the link refuses all output
    pub fn set_blocked(&self, blocked: bool) {
        self.state().blocked = blocked;
    }

    /// Loops written bytes back into the receive side
    pub fn set_echo(&self, echo: bool) {
        self.state().echo = echo;
    }

    pub fn close(&self) {
        self.state().closed = true;
        self.shared.readable.notify_all();
    }

    pub fn has_callback(&self) -> bool {
        self.state().callback.is_some()
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
        let mut state = self.state();
        if state.rx.is_empty() {
            if state.closed {
                return Err(nb::Error::Other(TransportError::Closed));
            }
            return Err(nb::Error::WouldBlock);
        }
        let count = core::cmp::min(buf.len(), state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> nb::Result<usize, TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(nb::Error::Other(TransportError::Closed));
        }
        if state.blocked {
            return Err(nb::Error::WouldBlock);
        }
        state.tx.extend_from_slice(buf);
        if state.echo {
            state.rx.extend(buf.iter().copied());
            drop(state);
            self.shared.readable.notify_all();
        }
        Ok(buf.len())
    }

    fn poll_readable(&mut self, timeout: Duration) -> bool {
        let state = self.state();
        let (state, _) = self
            .shared
            .readable
            .wait_timeout_while(state, timeout, |s| s.rx.is_empty() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !state.rx.is_empty()
    }

    fn poll_writable(&mut self, _timeout: Duration) -> bool {
        let state = self.state();
        !state.blocked && !state.closed
    }

    fn set_data_ready_callback(&mut self, callback: Option<DataReadyCallback>) {
        self.state().callback = callback;
    }
}
