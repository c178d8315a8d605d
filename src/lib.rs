//! AT command protocol engine for cellular modems and similar devices.
//!
//! One [`AtHandler`] drives one character stream. Users lock it for a transaction, frame a
//! command with the writer functions, then parse the response with the reader functions.
//! Unsolicited result codes arriving between transactions are dispatched to registered
//! callbacks through an [`queue::EventQueue`].

mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod mock;
pub mod queue;
mod reader;
pub mod registry;
pub mod timeout;
pub mod transport;
pub mod urc;
mod writer;

#[cfg(feature = "serial")]
pub mod serial;

// include defmt::Format implementations
// we don't want them derive()d in the modules unless defmt-impl feature is set
#[cfg(feature = "defmt-impl")]
pub mod defmt;

pub use buffer::RECV_BUFF_SIZE;
pub use config::Config;
pub use engine::{Engine, Escaped, Scope, StopTag, MAX_PREFIX_LEN};
pub use error::{DeviceError, DeviceErrorType, Error};
pub use handler::{AtHandler, Transaction};
pub use registry::HandlerRegistry;
pub use urc::{UrcCallback, MAX_URC_HANDLERS};
pub use writer::Param;

// reexport heapless
pub use heapless;
