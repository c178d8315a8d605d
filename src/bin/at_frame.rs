use std::env;
use std::sync::Arc;

use at_handler::mock::MockTransport;
use at_handler::queue::PendingQueue;
use at_handler::{AtHandler, Config, Escaped};

/// Prints the bytes `AT<command>` with the given parameters is framed to
///
/// Parameters: `123` integer, `"text"` quoted string, `0xCAFE` hex bytes, anything else raw.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let command = args.next().ok_or("Provide a command, e.g. +CGDCONT=")?;

    let link = MockTransport::new();
    let handler = AtHandler::new(
        Box::new(link.clone()),
        Arc::new(PendingQueue::new()),
        Config::new(),
    );

    let mut at = handler.lock();
    at.cmd_start(&format!("AT{}", command));
    for arg in args {
        write_param(&mut at, &arg)?;
    }
    at.cmd_stop();
    at.unlock()?;

    let bytes = link.take_sent();
    println!("framed: {}\nbytes: {:02x?}", Escaped(&bytes), bytes);
    Ok(())
}

fn write_param(at: &mut at_handler::Transaction<'_>, arg: &str) -> Result<(), String> {
    if let Ok(value) = arg.parse::<i32>() {
        at.write_int(value);
    } else if let Some(hex) = arg.strip_prefix("0x") {
        let mut data = vec![0u8; hex.len() / 2];
        base16::decode_slice(hex, &mut data).map_err(|e| format!("bad hex {}: {:?}", arg, e))?;
        at.write_hex_bytes(&data);
    } else if let Some(text) = arg
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        at.write_string(text, true);
    } else {
        at.write_string(arg, false);
    }
    Ok(())
}
