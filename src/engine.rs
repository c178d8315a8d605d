//! State of one AT channel
//!
//! [`Engine`] owns the transport, the receive buffer, the timeouts, the error record and the
//! URC table. Its command and response operations are split over the `writer` and `reader`
//! modules, URC handling lives in [`urc`](crate::urc). An engine is only ever reached through an
//! [`AtHandler`](crate::AtHandler), whose lock serializes transactions.
use core::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use heapless::String;

use crate::buffer::{FillError, RecvBuffer};
use crate::config::Config;
use crate::error::{DeviceError, Error, ErrorState};
use crate::queue::EventQueue;
use crate::timeout::{Deadline, TimeoutController};
use crate::transport::{DataReadyCallback, Transport};
use crate::urc::UrcTable;

/// Longest response prefix, URC prefix or stop tag accepted
pub const MAX_PREFIX_LEN: usize = 24;

/// Which part of a response the tokenizer is in, each has its own stop tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    NotSet,
    /// whole response, ends with the final result code
    Resp,
    /// one information line, ends with the line
    Info,
    /// parenthesised element inside an information line, ends with `)`
    Elem,
}

/// Final result code a response ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTag {
    Custom,
    Ok,
    Error,
    CmeError,
    CmsError,
}

/// Stop tag set by the caller for one response
pub(crate) struct CustomTag {
    pub(crate) body: String<MAX_PREFIX_LEN>,
    /// body has to be followed by `\r` or `\n`
    pub(crate) line_end: bool,
}

/// Per transaction bookkeeping, renewed by every lock, the response part also by `resp_stop`
pub(crate) struct TxnState {
    pub(crate) cmd_open: bool,
    pub(crate) params_written: bool,
    pub(crate) scope: Scope,
    pub(crate) stop_found: bool,
    pub(crate) prefix_matched: bool,
    pub(crate) info_prefix: String<MAX_PREFIX_LEN>,
    pub(crate) forwarding: bool,
    pub(crate) custom_tag: Option<CustomTag>,
    pub(crate) matched: Option<StopTag>,
}

impl TxnState {
    pub(crate) fn new() -> Self {
        Self {
            cmd_open: false,
            params_written: false,
            scope: Scope::NotSet,
            stop_found: false,
            prefix_matched: false,
            info_prefix: String::new(),
            forwarding: false,
            custom_tag: None,
            matched: None,
        }
    }

    pub(crate) fn reset_response(&mut self) {
        self.scope = Scope::NotSet;
        self.stop_found = false;
        self.prefix_matched = false;
        self.info_prefix.clear();
        self.forwarding = false;
        self.custom_tag = None;
    }
}

pub struct Engine {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) queue: Arc<dyn EventQueue>,
    pub(crate) buf: RecvBuffer,
    pub(crate) timeouts: TimeoutController,
    pub(crate) deadline: Deadline,
    pub(crate) urc_timeout: Duration,
    pub(crate) error: ErrorState,
    pub(crate) delimiter: u8,
    pub(crate) default_delimiter: u8,
    pub(crate) output_delimiter: &'static str,
    pub(crate) send_delay: Duration,
    pub(crate) last_response_stop: Option<Instant>,
    pub(crate) debug: bool,
    pub(crate) transport_usable: bool,
    pub(crate) urcs: UrcTable,
    pub(crate) txn: TxnState,
}

impl Engine {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        queue: Arc<dyn EventQueue>,
        config: &Config,
    ) -> Self {
        let timeouts = TimeoutController::new(config.timeout);
        Self {
            transport,
            queue,
            buf: RecvBuffer::new(),
            deadline: timeouts.start(),
            timeouts,
            urc_timeout: config.urc_timeout,
            error: ErrorState::new(),
            delimiter: config.delimiter,
            default_delimiter: config.delimiter,
            output_delimiter: config.output_delimiter,
            send_delay: config.send_delay,
            last_response_stop: None,
            debug: config.debug,
            transport_usable: true,
            urcs: UrcTable::new(),
            txn: TxnState::new(),
        }
    }

    pub(crate) fn set_data_ready_callback(&mut self, callback: Option<DataReadyCallback>) {
        self.transport.set_data_ready_callback(callback);
    }

    /// Starts the deadline of a blocking primitive
    pub(crate) fn begin(&mut self) {
        self.deadline = self.timeouts.start();
    }

    pub(crate) fn record(&mut self, error: Error) -> Error {
        self.error.set(error);
        error
    }

    pub(crate) fn ok_to_proceed(&self) -> Result<(), Error> {
        self.error.last_error()
    }

    /// Reads from the transport into the buffer without recording anything
    ///
    /// Without `wait` only what the transport already holds is taken.
    pub(crate) fn fill_buffer(&mut self, wait: bool) -> Result<usize, FillError> {
        if !self.transport_usable {
            return Err(FillError::Timeout);
        }
        let deadline = if wait {
            self.deadline
        } else {
            Deadline::immediate()
        };
        let before = self.buf.available();
        let added = self.buf.fill(&mut *self.transport, &deadline)?;
        if self.debug {
            let pending = self.buf.pending();
            log::debug!("AT rx [{}]", Escaped(&pending[before..]));
        }
        Ok(added)
    }

    /// Waits for more input until the deadline, recording the failure
    pub(crate) fn fill_blocking(&mut self) -> Result<(), Error> {
        match self.fill_buffer(true) {
            Ok(_) => Ok(()),
            Err(FillError::Timeout) => Err(self.record(Error::Timeout)),
            Err(FillError::Full) => Err(self.record(Error::NoMemory)),
            Err(FillError::Transport(e)) => {
                log::warn!("AT transport failure: {:?}", e);
                Err(self.record(Error::DeviceError))
            }
        }
    }

    pub(crate) fn get_char(&mut self) -> Result<u8, Error> {
        loop {
            if let Some(c) = self.buf.pop_front() {
                return Ok(c);
            }
            self.fill_blocking()?;
        }
    }

    pub(crate) fn peek_char(&mut self) -> Result<u8, Error> {
        loop {
            if let Some(c) = self.buf.peek() {
                return Ok(c);
            }
            self.fill_blocking()?;
        }
    }

    /// Drops buffered `\r` and `\n` at the head
    pub(crate) fn skip_line_ends(&mut self) {
        while matches!(self.buf.peek(), Some(b'\r') | Some(b'\n')) {
            self.buf.consume(1);
        }
    }

    /// Drops one buffered line end, `\r`, `\n` or `\r\n`
    pub(crate) fn consume_line_end(&mut self) {
        if self.buf.peek() == Some(b'\r') {
            self.buf.consume(1);
        }
        if self.buf.peek() == Some(b'\n') {
            self.buf.consume(1);
        }
    }

    /// Discards everything up to and including the next line end
    ///
    /// Gives up quietly at `deadline`, nothing is recorded.
    pub(crate) fn consume_line(&mut self, deadline: Deadline) {
        loop {
            if let Some(at) = self.buf.find_line_end() {
                self.buf.consume(at);
                self.consume_line_end();
                return;
            }
            self.buf.clear();
            let saved = self.deadline;
            self.deadline = deadline;
            let filled = self.fill_buffer(true);
            self.deadline = saved;
            if filled.is_err() {
                return;
            }
        }
    }

    pub(crate) fn trace_tx(&self, data: &[u8]) {
        if self.debug {
            log::debug!("AT tx [{}]", Escaped(data));
        }
    }

    /// Overrides the response timeout, with `persist` the default changes as well
    pub fn set_at_timeout(&mut self, timeout: Duration, persist: bool) {
        self.timeouts.set(timeout, persist);
    }

    /// Goes back to the default timeout after a one-shot override
    pub fn restore_at_timeout(&mut self) {
        self.timeouts.restore();
    }

    pub fn at_timeout(&self) -> Duration {
        self.timeouts.current()
    }

    pub fn clear_error(&mut self) {
        self.error.clear();
    }

    pub fn get_last_error(&self) -> Result<(), Error> {
        self.error.last_error()
    }

    pub fn get_last_device_error(&self) -> DeviceError {
        self.error.device_error()
    }

    /// 3GPP TS 24.008 cause of the last `+CME ERROR`/`+CMS ERROR`, `None` when there is none
    pub fn get_3gpp_error(&self) -> Option<u8> {
        self.error.gpp_cause()
    }

    /// Traces all traffic at debug level while on
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn get_debug(&self) -> bool {
        self.debug
    }

    /// Minimum time between the end of a response and the start of the next command
    pub fn set_send_delay(&mut self, delay: Duration) {
        self.send_delay = delay;
    }

    /// While unusable the transport is left alone, e.g. when a data call took it over
    pub fn set_transport_usable(&mut self, usable: bool) {
        self.transport_usable = usable;
    }

    pub fn is_transport_usable(&self) -> bool {
        self.transport_usable
    }

    /// Discards everything buffered and everything the transport holds right now
    pub fn flush(&mut self) {
        self.buf.clear();
        if !self.transport_usable {
            return;
        }
        loop {
            match self.fill_buffer(false) {
                Ok(_) => self.buf.clear(),
                Err(_) => break,
            }
        }
        self.buf.clear();
    }

    /// Stop tag the last response ended with
    pub fn matched_stop_tag(&self) -> Option<StopTag> {
        self.txn.matched
    }

    pub fn scope(&self) -> Scope {
        self.txn.scope
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.transport.set_data_ready_callback(None);
    }
}

/// Displays raw modem traffic with control characters escaped
pub struct Escaped<'a>(pub &'a [u8]);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &c in self.0 {
            match c {
                b'\r' => write!(f, "\\r")?,
                b'\n' => write!(f, "\\n")?,
                b'\\' => write!(f, "\\\\")?,
                0x20..=0x7e => write!(f, "{}", c as char)?,
                _ => write!(f, "\\x{:02x}", c)?,
            }
        }
        Ok(())
    }
}
