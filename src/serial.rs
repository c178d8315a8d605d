//! Transport over a host serial port
//!
//! `serialport` has no readiness notification, so a watcher thread polls a cloned handle of
//! the port and raises the data-ready callback whenever the number of pending input bytes grows.
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serialport::SerialPort;

use crate::transport::{DataReadyCallback, Transport, TransportError};

const POLL_INTERVAL: Duration = Duration::from_millis(2);
const WATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Options for opening a port, mirrors `serialport::new(...)` with AT friendly defaults
#[derive(Debug, Clone)]
pub struct OpenSerialOptions {
    baud_rate: u32,
    flow_control: serialport::FlowControl,
}

impl OpenSerialOptions {
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;

    pub fn new() -> Self {
        Self {
            baud_rate: Self::DEFAULT_BAUD_RATE,
            flow_control: serialport::FlowControl::None,
        }
    }

    pub fn baud_rate(&mut self, baud_rate: u32) -> &mut Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn flow_control(&mut self, flow_control: serialport::FlowControl) -> &mut Self {
        self.flow_control = flow_control;
        self
    }

    pub fn open(&self, path: &str) -> Result<SerialTransport, serialport::Error> {
        // reads must never block for long, the engine does its own deadline handling
        let port = serialport::new(path, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(self.flow_control)
            .timeout(Duration::from_millis(1))
            .open()?;
        Ok(SerialTransport::new(port))
    }
}

impl Default for OpenSerialOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    callback: Arc<Mutex<Option<DataReadyCallback>>>,
    watcher_running: Arc<AtomicBool>,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            callback: Arc::new(Mutex::new(None)),
            watcher_running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn bytes_to_read(&self) -> u32 {
        self.port.bytes_to_read().unwrap_or(0)
    }

    fn start_watcher(&mut self) {
        if self.watcher_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let port = match self.port.try_clone() {
            Ok(port) => port,
            Err(e) => {
                log::warn!("cannot watch serial port for input: {}", e);
                self.watcher_running.store(false, Ordering::SeqCst);
                return;
            }
        };
        let callback = self.callback.clone();
        let running = self.watcher_running.clone();
        thread::spawn(move || {
            let mut last_pending = 0;
            while running.load(Ordering::SeqCst) {
                let pending = port.bytes_to_read().unwrap_or(0);
                if pending > last_pending {
                    let cb = callback
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .clone();
                    if let Some(cb) = cb {
                        cb();
                    }
                }
                last_pending = pending;
                thread::sleep(WATCH_INTERVAL);
            }
        });
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.watcher_running.store(false, Ordering::SeqCst);
    }
}

fn map_io(e: io::Error) -> nb::Error<TransportError> {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            nb::Error::WouldBlock
        }
        _ => nb::Error::Other(e.into()),
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
        if self.bytes_to_read() == 0 {
            return Err(nb::Error::WouldBlock);
        }
        match self.port.read(buf) {
            Ok(0) => Err(nb::Error::WouldBlock),
            Ok(n) => Ok(n),
            Err(e) => Err(map_io(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> nb::Result<usize, TransportError> {
        match self.port.write(buf) {
            Ok(0) => Err(nb::Error::WouldBlock),
            Ok(n) => Ok(n),
            Err(e) => Err(map_io(e)),
        }
    }

    fn poll_readable(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.bytes_to_read() > 0 {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn poll_writable(&mut self, _timeout: Duration) -> bool {
        // the OS buffers output, a write only fails when the port is gone
        true
    }

    fn set_data_ready_callback(&mut self, callback: Option<DataReadyCallback>) {
        let enable = callback.is_some();
        *self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback;
        if enable {
            self.start_watcher();
        } else {
            self.watcher_running.store(false, Ordering::SeqCst);
        }
    }
}
