//! Deferred execution of callbacks
//!
//! URC callbacks and out-of-band processing never run on the stack frame that triggered them,
//! they are handed to an [`EventQueue`]. Any runtime can provide one; two are included:
//! [`WorkerQueue`] runs tasks on a dedicated thread, [`PendingQueue`] keeps them until
//! [`PendingQueue::dispatch`] is called, which suits single threaded loops and tests.
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread;

use heapless::Deque;

use crate::error::Error;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub const PENDING_QUEUE_LENGTH: usize = 16;

pub trait EventQueue: Send + Sync {
    /// Schedules `task`, `Error::NoMemory` when the queue can't take it
    fn call(&self, task: Task) -> Result<(), Error>;
}

pub struct WorkerQueue {
    sender: Mutex<mpsc::Sender<Task>>,
}

impl WorkerQueue {
    /// Spawns the worker thread, it exits once the queue is dropped
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                for task in receiver {
                    task();
                }
                log::debug!("event queue worker finished");
            })?;
        Ok(Self {
            sender: Mutex::new(sender),
        })
    }
}

impl EventQueue for WorkerQueue {
    fn call(&self, task: Task) -> Result<(), Error> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .send(task)
            .map_err(|_| Error::NoMemory)
    }
}

#[derive(Default)]
pub struct PendingQueue {
    tasks: Mutex<Deque<Task, PENDING_QUEUE_LENGTH>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, Deque<Task, PENDING_QUEUE_LENGTH>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// Runs queued tasks, including the ones they queue, returns how many ran
    pub fn dispatch(&self) -> usize {
        let mut count = 0;
        // the lock is released before each task runs so tasks can queue more work
        loop {
            let task = self.tasks().pop_front();
            match task {
                Some(task) => {
                    task();
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

impl EventQueue for PendingQueue {
    fn call(&self, task: Task) -> Result<(), Error> {
        self.tasks().push_back(task).map_err(|_| Error::NoMemory)
    }
}
