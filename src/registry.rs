//! One handler per physical link
//!
//! Several drivers may talk to the same modem port. The registry hands all of them the same
//! [`AtHandler`] and counts them, the handler goes away with its last user.
use std::sync::{Arc, Mutex, MutexGuard};

use heapless::{FnvIndexMap, String};

use crate::config::Config;
use crate::error::Error;
use crate::handler::AtHandler;
use crate::queue::EventQueue;
use crate::transport::Transport;

pub const MAX_HANDLERS: usize = 8;
pub const MAX_LINK_NAME_LEN: usize = 32;

type LinkName = String<MAX_LINK_NAME_LEN>;

pub struct HandlerRegistry {
    handlers: Mutex<FnvIndexMap<LinkName, AtHandler, MAX_HANDLERS>>,
    queue: Arc<dyn EventQueue>,
    config: Config,
}

fn link_name(name: &str) -> Result<LinkName, Error> {
    if name.is_empty() {
        return Err(Error::Parameter);
    }
    let mut key = String::new();
    key.push_str(name).map_err(|_| Error::Parameter)?;
    Ok(key)
}

impl HandlerRegistry {
    /// New handlers get `config` and run their callbacks on `queue`
    pub fn new(queue: Arc<dyn EventQueue>, config: Config) -> Self {
        Self {
            handlers: Mutex::new(FnvIndexMap::new()),
            queue,
            config,
        }
    }

    fn handlers(&self) -> MutexGuard<'_, FnvIndexMap<LinkName, AtHandler, MAX_HANDLERS>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the handler of link `name`, creating it over `make_transport()` on first use
    ///
    /// Every successful call takes one reference, give it back with [`release`](Self::release).
    pub fn get_or_create<F>(&self, name: &str, make_transport: F) -> Result<AtHandler, Error>
    where
        F: FnOnce() -> Box<dyn Transport>,
    {
        let key = link_name(name)?;
        let mut handlers = self.handlers();
        if let Some(handler) = handlers.get(&key) {
            let count = handler.inc_ref_count();
            log::debug!("AT handler {} shared, {} users", name, count);
            return Ok(handler.clone());
        }
        if handlers.len() == handlers.capacity() {
            return Err(Error::NoMemory);
        }
        let handler = AtHandler::new(make_transport(), self.queue.clone(), self.config.clone());
        handlers
            .insert(key, handler.clone())
            .map_err(|_| Error::NoMemory)?;
        log::debug!("AT handler {} created", name);
        Ok(handler)
    }

    /// Gives back one reference, returns how many are left
    ///
    /// The registry forgets the handler once nobody uses it.
    pub fn release(&self, name: &str) -> Result<usize, Error> {
        let key = link_name(name)?;
        let mut handlers = self.handlers();
        let left = handlers
            .get(&key)
            .ok_or(Error::Parameter)?
            .dec_ref_count();
        if left == 0 {
            handlers.remove(&key);
            log::debug!("AT handler {} released", name);
        }
        Ok(left)
    }

    pub fn len(&self) -> usize {
        self.handlers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        match link_name(name) {
            Ok(key) => self.handlers().contains_key(&key),
            Err(_) => false,
        }
    }
}
