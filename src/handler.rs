//! Shared handle to an engine
//!
//! Every user of one physical link holds a clone of the same [`AtHandler`]. A transaction starts
//! with [`AtHandler::lock`] and ends when the returned [`Transaction`] is unlocked or dropped,
//! which also hands out the URCs that arrived meanwhile.
//!
//! ```
//! use std::sync::Arc;
//! use at_handler::mock::MockTransport;
//! use at_handler::queue::PendingQueue;
//! use at_handler::{AtHandler, Config};
//!
//! let link = MockTransport::new();
//! let queue = Arc::new(PendingQueue::new());
//! let handler = AtHandler::new(Box::new(link.clone()), queue, Config::new());
//!
//! link.inject(b"\r\n+CSQ: 21,99\r\n\r\nOK\r\n");
//! let mut at = handler.lock();
//! at.cmd_start("AT+CSQ");
//! at.cmd_stop();
//! at.resp_start(Some("+CSQ:"), false);
//! let rssi = at.read_int();
//! at.resp_stop();
//! assert_eq!(at.unlock(), Ok(()));
//! assert_eq!(rssi, Ok(21));
//! assert_eq!(link.sent(), b"AT+CSQ\r");
//! ```
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::config::Config;
use crate::engine::{Engine, TxnState};
use crate::error::Error;
use crate::queue::EventQueue;
use crate::transport::{DataReadyCallback, Transport};
use crate::urc::UrcCallback;

struct Shared {
    engine: Mutex<Engine>,
    ref_count: AtomicUsize,
    /// set by every request, cleared by the one that got the lock
    oob_pending: AtomicBool,
}

impl Shared {
    fn engine(&self) -> MutexGuard<'_, Engine> {
        // a panicking user leaves the engine in a consistent state, every primitive finishes
        // its buffer bookkeeping before it returns
        self.engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn process_oob(&self) {
        self.oob_pending.store(true, Ordering::SeqCst);
        loop {
            let mut engine = match self.engine.try_lock() {
                Ok(engine) => engine,
                Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // whoever holds the lock looks at the flag once it lets go
                Err(std::sync::TryLockError::WouldBlock) => return,
            };
            self.oob_pending.store(false, Ordering::SeqCst);
            engine.process_oob(true);
            drop(engine);
            if !self.oob_pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Runs the processing requested while the lock was held
    fn recheck_oob(&self) {
        if self.oob_pending.load(Ordering::SeqCst) {
            self.process_oob();
        }
    }
}

#[derive(Clone)]
pub struct AtHandler {
    shared: Arc<Shared>,
}

impl AtHandler {
    /// Binds a new engine to `transport`, with a reference count of 1
    ///
    /// URC callbacks and out-of-band processing triggered by the transport run on `queue`.
    pub fn new(transport: Box<dyn Transport>, queue: Arc<dyn EventQueue>, config: Config) -> Self {
        let engine = Engine::new(transport, queue.clone(), &config);
        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            ref_count: AtomicUsize::new(1),
            oob_pending: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&shared);
        let callback: DataReadyCallback = Arc::new(move || schedule_oob(&weak, &queue));
        shared.engine().set_data_ready_callback(Some(callback));
        Self { shared }
    }

    /// Waits until no other transaction runs and starts one
    ///
    /// Nothing a previous transaction left open carries over, only the error record does.
    pub fn lock(&self) -> Transaction<'_> {
        let mut engine = self.shared.engine();
        engine.txn = TxnState::new();
        Transaction {
            engine,
            _released: Released(&self.shared),
        }
    }

    /// Dispatches complete URCs waiting in the input, unless a transaction is running
    pub fn process_oob(&self) {
        self.shared.process_oob();
    }

    /// Registers, replaces or with `None` removes the callback of a URC prefix
    pub fn set_urc_handler(&self, prefix: &str, callback: Option<UrcCallback>) -> Result<(), Error> {
        let mut engine = self.shared.engine();
        engine.urcs.set(prefix, callback)
    }

    pub fn inc_ref_count(&self) -> usize {
        self.shared.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the count left, it never goes below zero
    pub fn dec_ref_count(&self) -> usize {
        let previous = self
            .shared
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn get_ref_count(&self) -> usize {
        self.shared.ref_count.load(Ordering::Acquire)
    }

    /// True when both handles drive the same engine
    pub fn same_engine(&self, other: &AtHandler) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Runs in the transport's notification context, so it only queues work
fn schedule_oob(shared: &Weak<Shared>, queue: &Arc<dyn EventQueue>) {
    let shared = shared.clone();
    let scheduled = queue.call(Box::new(move || {
        if let Some(shared) = shared.upgrade() {
            shared.process_oob();
        }
    }));
    if let Err(e) = scheduled {
        log::warn!("out-of-band processing not scheduled: {}", e);
    }
}

/// Exclusive access to the engine for one command/response exchange
pub struct Transaction<'a> {
    engine: MutexGuard<'a, Engine>,
    // dropped after the guard
    _released: Released<'a>,
}

/// Picks up out-of-band processing that was turned away while the lock was held
struct Released<'a>(&'a Shared);

impl Drop for Released<'_> {
    fn drop(&mut self) {
        self.0.recheck_oob();
    }
}

impl Transaction<'_> {
    /// Ends the transaction, returns its outcome
    ///
    /// Fully received URCs are dispatched before the lock is released, see [`Drop`].
    pub fn unlock(self) -> Result<(), Error> {
        self.engine.get_last_error()
    }
}

impl Deref for Transaction<'_> {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.engine.drain_urcs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Scope;
    use crate::mock::MockTransport;
    use crate::queue::PendingQueue;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn handler() -> (AtHandler, MockTransport, Arc<PendingQueue>) {
        let link = MockTransport::new();
        let queue = Arc::new(PendingQueue::new());
        let handler = AtHandler::new(
            Box::new(link.clone()),
            queue.clone(),
            Config::new().with_timeout(Duration::from_millis(50)),
        );
        (handler, link, queue)
    }

    #[test]
    fn test_ref_count() {
        let (handler, _, _) = handler();
        assert_eq!(handler.get_ref_count(), 1);
        assert_eq!(handler.inc_ref_count(), 2);
        let other = handler.clone();
        assert_eq!(other.dec_ref_count(), 1);
        assert_eq!(other.dec_ref_count(), 0);
        assert_eq!(handler.dec_ref_count(), 0);
        assert_eq!(handler.get_ref_count(), 0);
        assert!(handler.same_engine(&other));
    }

    #[test]
    fn test_unlock_reports_outcome() {
        let (handler, link, _) = handler();
        link.inject(b"ERROR\r\n");
        let mut at = handler.lock();
        at.cmd_start("AT+FOO");
        at.cmd_stop_read_resp();
        assert_eq!(at.unlock(), Err(Error::DeviceError));
        // the error stays until cleared
        let mut at = handler.lock();
        assert_eq!(at.get_last_error(), Err(Error::DeviceError));
        at.clear_error();
        at.clear_error();
        assert_eq!(at.unlock(), Ok(()));
    }

    #[test]
    fn test_data_ready_schedules_oob() {
        let (handler, link, queue) = handler();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        handler
            .set_urc_handler(
                "+CREG:",
                Some(Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        link.inject(b"\r\n+CREG: 1\r\n");
        // first the processing task, then the callback it queued
        assert_eq!(queue.dispatch(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oob_skipped_during_transaction() {
        let (handler, link, queue) = handler();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        handler
            .set_urc_handler(
                "RING",
                Some(Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        let at = handler.lock();
        link.inject(b"RING\r\n");
        handler.process_oob();
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // unlocking drains it
        assert_eq!(at.unlock(), Ok(()));
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_command_does_not_outlive_transaction() {
        let (handler, link, _) = handler();
        {
            let mut at = handler.lock();
            at.cmd_start("AT+A");
        }
        let mut at = handler.lock();
        at.cmd_start("AT+B");
        at.cmd_stop();
        assert_eq!(at.unlock(), Ok(()));
        assert_eq!(link.sent(), b"AT+AAT+B\r");
    }

    #[test]
    fn test_stop_tag_does_not_outlive_transaction() {
        let (handler, link, _) = handler();
        {
            let mut at = handler.lock();
            at.set_stop_tag("READY");
        }
        link.inject(b"READY\r\n+X: 1\r\nOK\r\n");
        let mut at = handler.lock();
        at.resp_start(Some("+X:"), false);
        assert_eq!(at.read_int(), Ok(1));
        at.resp_stop();
        assert_eq!(at.unlock(), Ok(()));
    }

    #[test]
    fn test_lock_starts_without_scope() {
        let (handler, link, _) = handler();
        link.inject(b"+COPS: 0,0,\"operator\"\r\nOK\r\n");
        {
            let mut at = handler.lock();
            at.resp_start(Some("+COPS:"), false);
            assert_eq!(at.scope(), Scope::Info);
        }
        let at = handler.lock();
        assert_eq!(at.scope(), Scope::NotSet);
        assert_eq!(at.unlock(), Ok(()));
    }

    #[test]
    fn test_oob_turned_away_runs_after_unlock() {
        let link = MockTransport::new();
        let queue = Arc::new(PendingQueue::new());
        let handler = AtHandler::new(
            Box::new(link.clone()),
            queue.clone(),
            Config::new()
                .with_timeout(Duration::from_millis(50))
                .with_urc_timeout(Duration::from_millis(500)),
        );
        handler
            .set_urc_handler("+CREG:", Some(Arc::new(|| {})))
            .unwrap();
        let at = handler.lock();
        link.inject(b"\r\n+CREG: 1");
        // the task finds the lock taken
        assert_eq!(queue.dispatch(), 1);

        let rest = link.clone();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            rest.inject(b",2\r\n");
        });
        // draining on unlock leaves the partial line, the turned away request waits for the rest
        drop(at);
        sender.join().unwrap();
        // the task of the second notification and the callback
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_urc_callback_can_lock() {
        let (handler, link, queue) = handler();
        let locked = Arc::new(AtomicBool::new(false));
        let flag = locked.clone();
        let inner = handler.clone();
        handler
            .set_urc_handler(
                "+UUSORD:",
                Some(Arc::new(move || {
                    let at = inner.lock();
                    flag.store(at.get_last_error().is_ok(), Ordering::SeqCst);
                })),
            )
            .unwrap();
        link.inject(b"+UUSORD: 0,12\r\n");
        queue.dispatch();
        assert!(locked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dropped_handler_releases_transport() {
        let (handler, link, _) = handler();
        assert!(link.has_callback());
        drop(handler);
        assert!(!link.has_callback());
    }

    #[test]
    fn test_set_urc_handler_limits() {
        let (handler, _, _) = handler();
        assert_eq!(
            handler.set_urc_handler("", Some(Arc::new(|| {}))),
            Err(Error::Parameter)
        );
        assert_eq!(handler.set_urc_handler("RING", None), Ok(()));
    }
}
