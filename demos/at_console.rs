use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use at_handler::queue::WorkerQueue;
use at_handler::serial::OpenSerialOptions;
use at_handler::{AtHandler, Config};

const PORT_NAME: &'static str = "/dev/ttyUSB0";

/// Sends one command, prints its response lines and the URCs seen for a few seconds after
///
/// usage: at_console [command] [port]
fn main() {
    env_logger::init();

    let command = env::args().nth(1).unwrap_or_else(|| "+CGMI".into());
    let port_name = env::args().nth(2).unwrap_or_else(|| PORT_NAME.into());

    let port = match OpenSerialOptions::new().baud_rate(115_200).open(&port_name) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open \"{}\". Error: {}", port_name, e);
            ::std::process::exit(1);
        }
    };
    let queue = match WorkerQueue::spawn("at-events") {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            eprintln!("Failed to start the event queue. Error: {}", e);
            ::std::process::exit(1);
        }
    };
    let handler = AtHandler::new(
        Box::new(port),
        queue,
        Config::new()
            .with_timeout(Duration::from_secs(3))
            .with_debug(true),
    );
    for prefix in ["+CREG:", "+CEREG:", "RING"] {
        let _ = handler.set_urc_handler(
            prefix,
            Some(Arc::new(move || println!("URC {}", prefix))),
        );
    }

    let mut at = handler.lock();
    if !at.sync() {
        eprintln!("modem did not answer AT");
    }
    at.cmd_start(&format!("AT{}", command));
    at.cmd_stop();
    at.resp_start(None, true);
    let mut line = [0u8; 128];
    while let Ok(len) = at.read_string(&mut line, true) {
        println!("{}", String::from_utf8_lossy(&line[..len]));
    }
    at.resp_stop();
    match at.unlock() {
        Ok(()) => println!("OK"),
        Err(e) => {
            let at = handler.lock();
            eprintln!(
                "{} ({:?}, 3GPP cause {:?})",
                e,
                at.get_last_device_error(),
                at.get_3gpp_error()
            );
        }
    }

    thread::sleep(Duration::from_secs(5));
}
