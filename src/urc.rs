//! Unsolicited result codes
//!
//! A URC is a line the modem sends on its own, e.g. `+CREG: 1` or `RING`. Handlers are
//! registered per line prefix. A matching line is consumed whole and its callback is handed to
//! the event queue, so it runs outside of the parsing call stack and may lock the handler itself.
use std::sync::Arc;
use std::time::Duration;

use heapless::{String, Vec};

use crate::engine::{Engine, MAX_PREFIX_LEN};
use crate::error::Error;
use crate::timeout::Deadline;

pub const MAX_URC_HANDLERS: usize = 16;

pub type UrcCallback = Arc<dyn Fn() + Send + Sync>;

struct UrcEntry {
    prefix: String<MAX_PREFIX_LEN>,
    callback: UrcCallback,
}

/// Prefix to callback table, kept in registration order
#[derive(Default)]
pub struct UrcTable {
    entries: Vec<UrcEntry, MAX_URC_HANDLERS>,
}

/// Outcome of looking for a URC at the head of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UrcMatch {
    Dispatched,
    /// a prefix matches but the line is not complete yet
    Partial,
    No,
}

impl UrcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds, replaces or with `None` removes the handler of `prefix`
    pub fn set(&mut self, prefix: &str, callback: Option<UrcCallback>) -> Result<(), Error> {
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
            return Err(Error::Parameter);
        }
        let position = self.entries.iter().position(|e| e.prefix.as_str() == prefix);
        match (position, callback) {
            (Some(i), Some(callback)) => self.entries[i].callback = callback,
            (Some(i), None) => {
                self.entries.remove(i);
            }
            (None, Some(callback)) => {
                let mut key = String::new();
                key.push_str(prefix).map_err(|_| Error::Parameter)?;
                self.entries
                    .push(UrcEntry {
                        prefix: key,
                        callback,
                    })
                    .map_err(|_| Error::NoMemory)?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.entries.iter().any(|e| e.prefix.as_str() == prefix)
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|e| e.prefix.as_str())
    }

    /// First entry whose prefix starts `data`, and whether some prefix could still match once
    /// more bytes arrive
    fn match_head(&self, data: &[u8]) -> (Option<usize>, bool) {
        let mut partial = false;
        for (i, entry) in self.entries.iter().enumerate() {
            let prefix = entry.prefix.as_bytes();
            if data.starts_with(prefix) {
                return (Some(i), false);
            }
            if prefix.starts_with(data) {
                partial = true;
            }
        }
        (None, partial)
    }
}

impl Engine {
    /// Consumes and dispatches the URC line at the head of the buffer, if there is one
    pub(crate) fn dispatch_urc_at_head(&mut self) -> UrcMatch {
        let (index, partial) = self.urcs.match_head(self.buf.pending());
        let Some(index) = index else {
            return if partial { UrcMatch::Partial } else { UrcMatch::No };
        };
        // a URC longer than the buffer is taken as framed once the buffer is full
        if self.buf.find_line_end().is_none() && !self.buf.is_full() {
            return UrcMatch::Partial;
        }
        let entry = &self.urcs.entries[index];
        let callback = entry.callback.clone();
        log::debug!("URC {} matched", entry.prefix);
        self.consume_line(Deadline::after(self.urc_timeout));
        if let Err(e) = self.queue.call(Box::new(move || callback())) {
            log::warn!("URC dropped, event queue refused it: {}", e);
        }
        UrcMatch::Dispatched
    }

    /// Dispatches URCs at the head of the input while no transaction is running
    ///
    /// With `wait_partial` a URC that started arriving is given the URC timeout to complete;
    /// otherwise only fully framed lines are taken. Data not starting with a registered prefix
    /// is left for the next transaction.
    pub(crate) fn process_oob(&mut self, wait_partial: bool) {
        if !self.transport_usable {
            return;
        }
        let readable = self.transport.poll_readable(Duration::ZERO);
        if self.urcs.is_empty() || (!readable && self.buf.is_empty()) {
            return;
        }
        // an earlier failed transaction must not stop URCs, nor may this pass leave errors behind
        let saved_error = self.error;
        let saved_deadline = self.deadline;
        self.error.clear();
        loop {
            if !self.buf.is_full() {
                let _ = self.fill_buffer(false);
            }
            self.skip_line_ends();
            if self.buf.is_empty() {
                break;
            }
            match self.dispatch_urc_at_head() {
                UrcMatch::Dispatched => continue,
                UrcMatch::Partial if wait_partial => {
                    self.deadline = Deadline::after(self.urc_timeout);
                    if self.fill_buffer(true).is_err() {
                        break;
                    }
                }
                UrcMatch::Partial | UrcMatch::No => break,
            }
        }
        self.error = saved_error;
        self.deadline = saved_deadline;
    }

    /// Takes fully framed URCs only, used when a transaction ends
    pub(crate) fn drain_urcs(&mut self) {
        self.process_oob(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::engine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, UrcCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        (
            hits,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_table_insert_replace_remove() {
        let mut table = UrcTable::new();
        let (_, a) = counter();
        let (_, b) = counter();
        table.set("+CREG:", Some(a)).unwrap();
        table.set("RING", Some(b.clone())).unwrap();
        table.set("+CREG:", Some(b)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.prefixes().collect::<std::vec::Vec<_>>(), ["+CREG:", "RING"]);
        table.set("+CREG:", None).unwrap();
        assert!(!table.contains("+CREG:"));
        assert_eq!(table.len(), 1);
        // removing an unknown prefix is fine
        table.set("+CGREG:", None).unwrap();
    }

    #[test]
    fn test_table_limits() {
        let mut table = UrcTable::new();
        let (_, cb) = counter();
        assert_eq!(table.set("", Some(cb.clone())), Err(Error::Parameter));
        let long = "+".repeat(MAX_PREFIX_LEN + 1);
        assert_eq!(table.set(&long, Some(cb.clone())), Err(Error::Parameter));
        for i in 0..MAX_URC_HANDLERS {
            table.set(&format!("+U{}:", i), Some(cb.clone())).unwrap();
        }
        assert_eq!(table.set("+FULL:", Some(cb)), Err(Error::NoMemory));
    }

    #[test]
    fn test_oob_dispatches_once_and_consumes_line() {
        let (mut engine, link, queue) = engine();
        let (hits, cb) = counter();
        engine.urcs.set("s", Some(cb)).unwrap();
        link.inject(b"ssssssssssssssssssssssssssssssssssssssssOK\r\n");
        engine.process_oob(true);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "callback must be deferred");
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(engine.buf.is_empty());
        assert_eq!(link.pending(), 0);
    }

    #[test]
    fn test_oob_leaves_unknown_data() {
        let (mut engine, link, queue) = engine();
        let (hits, cb) = counter();
        engine.urcs.set("+CREG:", Some(cb)).unwrap();
        link.inject(b"+CSQ: 10,99\r\n");
        engine.process_oob(true);
        assert_eq!(queue.dispatch(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(engine.buf.pending(), b"+CSQ: 10,99\r\n");
    }

    #[test]
    fn test_oob_without_handlers_touches_nothing() {
        let (mut engine, link, _) = engine();
        link.inject(b"\r\nRING\r\n");
        engine.process_oob(true);
        assert!(engine.buf.is_empty());
        assert_eq!(link.pending(), 8);
    }

    #[test]
    fn test_oob_several_urcs() {
        let (mut engine, link, queue) = engine();
        let (creg, creg_cb) = counter();
        let (ring, ring_cb) = counter();
        engine.urcs.set("+CREG:", Some(creg_cb)).unwrap();
        engine.urcs.set("RING", Some(ring_cb)).unwrap();
        link.inject(b"\r\n+CREG: 5\r\n\r\nRING\r\n\r\nRING\r\n");
        engine.process_oob(true);
        assert_eq!(queue.dispatch(), 3);
        assert_eq!(creg.load(Ordering::SeqCst), 1);
        assert_eq!(ring.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_partial_urc_is_kept_when_draining() {
        let (mut engine, link, queue) = engine();
        let (hits, cb) = counter();
        engine.urcs.set("+CREG:", Some(cb)).unwrap();
        link.inject(b"+CREG: 1");
        engine.drain_urcs();
        assert_eq!(queue.dispatch(), 0);
        assert_eq!(engine.buf.pending(), b"+CREG: 1");
        link.inject(b",2\r\n");
        engine.drain_urcs();
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oob_keeps_error_state() {
        let (mut engine, link, queue) = engine();
        let (_, cb) = counter();
        engine.urcs.set("RING", Some(cb)).unwrap();
        engine.error.set(Error::Timeout);
        link.inject(b"RING\r\n");
        engine.process_oob(true);
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(engine.get_last_error(), Err(Error::Timeout));
    }
}
