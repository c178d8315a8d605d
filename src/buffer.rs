//! Receive buffer sitting between the transport and the tokenizer
use heapless::Vec;

use crate::timeout::Deadline;
use crate::transport::{Transport, TransportError};

pub const RECV_BUFF_SIZE: usize = 256;

/// Result of comparing a pattern with buffered bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    Full,
    /// everything buffered matches but the pattern is longer
    Partial,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillError {
    /// nothing arrived before the deadline
    Timeout,
    /// no free space left, consume first
    Full,
    Transport(TransportError),
}

/// Fixed size buffer with a read position
///
/// Bytes before `pos` are consumed, bytes in `pos..buf.len()` are pending.
pub struct RecvBuffer {
    buf: Vec<u8, RECV_BUFF_SIZE>,
    pos: usize,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Number of buffered, unconsumed bytes
    pub fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// True when `n` bytes can be taken without touching the transport
    pub fn has_available(&self, n: usize) -> bool {
        self.available() >= n
    }

    pub fn is_full(&self) -> bool {
        self.pos == 0 && self.buf.is_full()
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn peek(&self) -> Option<u8> {
        self.pending().first().copied()
    }

    pub fn pop_front(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    pub fn consume(&mut self, n: usize) {
        self.pos = core::cmp::min(self.pos + n, self.buf.len());
        if self.pos == self.buf.len() {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    /// Compares `pattern` with the head of the pending bytes
    pub fn match_head(&self, pattern: &[u8]) -> Match {
        match_at(self.pending(), pattern)
    }

    /// Position of the first `\r` or `\n` in the pending bytes
    pub fn find_line_end(&self) -> Option<usize> {
        self.pending().iter().position(|&c| c == b'\r' || c == b'\n')
    }

    /// Moves pending bytes to the front to make room
    pub fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        let pending = self.available();
        self.buf.copy_within(self.pos.., 0);
        self.buf.truncate(pending);
        self.pos = 0;
    }

    /// Pulls more bytes from `transport`, waiting until `deadline` for the first of them
    ///
    /// Returns the number of bytes added.
    pub fn fill(
        &mut self,
        transport: &mut dyn Transport,
        deadline: &Deadline,
    ) -> Result<usize, FillError> {
        self.compact();
        if self.buf.is_full() {
            return Err(FillError::Full);
        }
        let start = self.buf.len();
        let free = self.buf.capacity() - start;
        // the zero fill is overwritten right away, heapless has no uninitialized resize
        self.buf
            .resize_default(start + free)
            .map_err(|_| FillError::Full)?;
        let result = loop {
            match transport.read(&mut self.buf[start..]) {
                Ok(n) if n > 0 => break Ok(n),
                Ok(_) | Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(e)) => break Err(FillError::Transport(e)),
            }
            if deadline.expired() {
                break Err(FillError::Timeout);
            }
            transport.poll_readable(deadline.remaining());
        };
        let added = *result.as_ref().unwrap_or(&0);
        self.buf.truncate(start + added);
        result
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn match_at(data: &[u8], pattern: &[u8]) -> Match {
    if data.len() >= pattern.len() {
        if &data[..pattern.len()] == pattern {
            Match::Full
        } else {
            Match::No
        }
    } else if pattern.starts_with(data) {
        Match::Partial
    } else {
        Match::No
    }
}
