//! Command side of a transaction
//!
//! A command is framed as `prefix param1<delim>param2...<terminator>`: `cmd_start` writes the
//! prefix, each `write_*` call adds one parameter with the delimiter in front of all but the
//! first, `cmd_stop` writes the terminator.
use core::fmt::Write as _;
use std::thread;
use std::time::Duration;

use heapless::String;

use crate::engine::{Engine, MAX_PREFIX_LEN};
use crate::error::Error;

/// Hex is written in slices of this many input bytes
const HEX_CHUNK: usize = 32;

/// A command parameter for [`Engine::cmd_start_stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param<'a> {
    Int(i32),
    Str(&'a str),
    /// written in quotes
    QuotedStr(&'a str),
    Bytes(&'a [u8]),
    /// written hex encoded
    Hex(&'a [u8]),
}

impl Engine {
    /// Pushes `data` to the transport, waiting for room until the deadline
    fn write_all(&mut self, data: &[u8]) {
        if self.error.is_err() || data.is_empty() {
            return;
        }
        if !self.transport_usable {
            self.record(Error::DeviceError);
            return;
        }
        self.trace_tx(data);
        let mut offset = 0;
        while offset < data.len() {
            match self.transport.write(&data[offset..]) {
                Ok(n) => offset += n,
                Err(nb::Error::WouldBlock) => {
                    if self.deadline.expired() {
                        log::warn!("AT write stalled, {} bytes left", data.len() - offset);
                        self.record(Error::DeviceError);
                        return;
                    }
                    if !self.transport.poll_writable(self.deadline.remaining()) {
                        thread::sleep(self.deadline.remaining().min(Duration::from_millis(1)));
                    }
                }
                Err(nb::Error::Other(e)) => {
                    log::warn!("AT transport failure: {:?}", e);
                    self.record(Error::DeviceError);
                    return;
                }
            }
        }
    }

    /// Checks that a parameter may be written and writes the delimiter it needs
    fn begin_param(&mut self) -> bool {
        if self.error.is_err() {
            return false;
        }
        if !self.txn.cmd_open {
            log::warn!("AT parameter written outside of a command");
            self.record(Error::DeviceError);
            return false;
        }
        self.begin();
        if self.txn.params_written {
            let delimiter = [self.delimiter];
            self.write_all(&delimiter);
        }
        self.txn.params_written = true;
        !self.error.is_err()
    }

    fn wait_send_delay(&self) {
        if let Some(stopped) = self.last_response_stop {
            let elapsed = stopped.elapsed();
            if elapsed < self.send_delay {
                thread::sleep(self.send_delay - elapsed);
            }
        }
    }

    fn open_command(&mut self, parts: &[&str]) {
        if self.error.is_err() {
            return;
        }
        if self.txn.cmd_open {
            log::warn!("AT command started while another one is open");
            self.record(Error::DeviceError);
            return;
        }
        self.wait_send_delay();
        self.begin();
        for part in parts {
            self.write_all(part.as_bytes());
        }
        self.txn.cmd_open = true;
        self.txn.params_written = false;
    }

    /// Opens a command and writes `prefix`, e.g. `AT+CGDCONT=`
    pub fn cmd_start(&mut self, prefix: &str) {
        self.open_command(&[prefix]);
    }

    pub fn write_int(&mut self, value: i32) {
        if !self.begin_param() {
            return;
        }
        // "-2147483648" is the longest
        let mut digits: String<11> = String::new();
        write!(digits, "{}", value).unwrap();
        self.write_all(digits.as_bytes());
    }

    /// Writes `value`, with `quoted` in double quotes with `"` and `\` escaped
    pub fn write_string(&mut self, value: &str, quoted: bool) {
        if !self.begin_param() {
            return;
        }
        if !quoted {
            self.write_all(value.as_bytes());
            return;
        }
        self.write_all(b"\"");
        let mut rest = value.as_bytes();
        while let Some(at) = rest.iter().position(|&c| c == b'"' || c == b'\\') {
            self.write_all(&rest[..at]);
            self.write_all(&[b'\\', rest[at]]);
            rest = &rest[at + 1..];
        }
        self.write_all(rest);
        self.write_all(b"\"");
    }

    /// Writes raw bytes as one parameter
    pub fn write_bytes(&mut self, data: &[u8]) {
        if !self.begin_param() {
            return;
        }
        self.write_all(data);
    }

    /// Writes `data` as upper case hex, two characters per byte
    pub fn write_hex_bytes(&mut self, data: &[u8]) {
        if !self.begin_param() {
            return;
        }
        let mut hex = [0u8; HEX_CHUNK * 2];
        for chunk in data.chunks(HEX_CHUNK) {
            let len = base16::encode_config_slice(chunk, base16::EncodeUpper, &mut hex);
            self.write_all(&hex[..len]);
        }
    }

    /// Writes the terminator and closes the command, nothing happens when none is open
    pub fn cmd_stop(&mut self) {
        if !self.txn.cmd_open {
            return;
        }
        self.begin();
        let terminator = self.output_delimiter;
        self.write_all(terminator.as_bytes());
        self.txn.cmd_open = false;
        self.txn.params_written = false;
    }

    /// Closes the command and reads a response without information lines
    pub fn cmd_stop_read_resp(&mut self) {
        self.cmd_stop();
        self.resp_start(None, false);
        self.resp_stop();
    }

    /// Writes the whole command `AT<cmd><cmd_chr><params>` with its terminator
    ///
    /// `cmd_chr` is usually `=`, `?`, `=?` or empty.
    pub fn cmd_start_stop(&mut self, cmd: &str, cmd_chr: &str, params: &[Param<'_>]) {
        self.open_command(&["AT", cmd, cmd_chr]);
        for param in params {
            match *param {
                Param::Int(value) => self.write_int(value),
                Param::Str(value) => self.write_string(value, false),
                Param::QuotedStr(value) => self.write_string(value, true),
                Param::Bytes(data) => self.write_bytes(data),
                Param::Hex(data) => self.write_hex_bytes(data),
            }
        }
        self.cmd_stop();
    }

    /// Sends a command and checks its final result code, information lines are dropped
    pub fn at_cmd_discard(
        &mut self,
        cmd: &str,
        cmd_chr: &str,
        params: &[Param<'_>],
    ) -> Result<(), Error> {
        self.cmd_start_stop(cmd, cmd_chr, params);
        self.resp_start(None, false);
        self.resp_stop();
        self.get_last_error()
    }

    /// Sends a command and reads the first integer of its `<cmd>:` line
    pub fn at_cmd_int(
        &mut self,
        cmd: &str,
        cmd_chr: &str,
        params: &[Param<'_>],
    ) -> Result<i32, Error> {
        let prefix = response_prefix(cmd)?;
        self.cmd_start_stop(cmd, cmd_chr, params);
        self.resp_start(Some(prefix.as_str()), false);
        let value = self.read_int();
        self.resp_stop();
        self.get_last_error()?;
        value
    }

    /// Sends a command and reads the first field of its `<cmd>:` line into `buf`
    pub fn at_cmd_str(
        &mut self,
        cmd: &str,
        cmd_chr: &str,
        buf: &mut [u8],
        params: &[Param<'_>],
    ) -> Result<usize, Error> {
        let prefix = response_prefix(cmd)?;
        self.cmd_start_stop(cmd, cmd_chr, params);
        self.resp_start(Some(prefix.as_str()), false);
        let len = self.read_string(buf, false);
        self.resp_stop();
        self.get_last_error()?;
        len
    }

    /// Single `AT` round trip, true when the modem answered `OK` in time
    ///
    /// Leftover input and any recorded error are dropped first.
    pub fn sync(&mut self) -> bool {
        self.flush();
        self.clear_error();
        self.txn.cmd_open = false;
        self.cmd_start("AT");
        self.cmd_stop_read_resp();
        let synced = self.get_last_error().is_ok();
        if !synced {
            log::debug!("AT sync failed");
        }
        synced
    }
}

/// `+CSQ` answers with `+CSQ:`
fn response_prefix(cmd: &str) -> Result<String<MAX_PREFIX_LEN>, Error> {
    let mut prefix = String::new();
    prefix.push_str(cmd).map_err(|_| Error::Parameter)?;
    prefix.push(':').map_err(|_| Error::Parameter)?;
    Ok(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::tests::{engine, engine_with};
    use crate::error::{DeviceError, DeviceErrorType};
    use rand::{thread_rng, Rng};
    use std::time::Instant;

    #[test]
    fn test_command_framing() {
        let (mut engine, link, _) = engine();
        engine.cmd_start("AT+CMD=");
        engine.write_int(-5);
        engine.write_string("a,b", false);
        engine.write_string("q\"x\\", true);
        engine.write_bytes(b"\x00\r");
        engine.write_hex_bytes(&[0xde, 0xad]);
        engine.cmd_stop();
        assert_eq!(link.sent(), b"AT+CMD=-5,a,b,\"q\\\"x\\\\\",\x00\r,DEAD\r");
        assert_eq!(engine.get_last_error(), Ok(()));
    }

    #[test]
    fn test_int_extremes() {
        let (mut engine, link, _) = engine();
        engine.cmd_start("AT+X=");
        engine.write_int(i32::MIN);
        engine.write_int(i32::MAX);
        engine.cmd_stop();
        assert_eq!(link.sent(), b"AT+X=-2147483648,2147483647\r");
        assert_eq!(engine.get_last_error(), Ok(()));
    }

    #[test]
    fn test_random_framing() {
        let mut rng = thread_rng();
        for _ in 0..50 {
            let (mut engine, link, _) = engine();
            let mut expected = b"AT+X=".to_vec();
            engine.cmd_start("AT+X=");
            let count = rng.gen_range(0, 8);
            for i in 0..count {
                if i > 0 {
                    expected.push(b',');
                }
                match rng.gen_range(0, 3) {
                    0 => {
                        let value: i32 = rng.gen();
                        engine.write_int(value);
                        expected.extend_from_slice(value.to_string().as_bytes());
                    }
                    1 => {
                        let len = rng.gen_range(0, 20);
                        let text: std::string::String = (0..len)
                            .map(|_| rng.gen_range(b'a', b'z' + 1) as char)
                            .collect();
                        engine.write_string(&text, false);
                        expected.extend_from_slice(text.as_bytes());
                    }
                    _ => {
                        let len = rng.gen_range(0, 40);
                        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                        engine.write_bytes(&data);
                        expected.extend_from_slice(&data);
                    }
                }
            }
            engine.cmd_stop();
            expected.push(b'\r');
            assert_eq!(link.sent(), expected);
        }
    }

    #[test]
    fn test_long_hex() {
        let (mut engine, link, _) = engine();
        let data: Vec<u8> = (0..=99).collect();
        engine.cmd_start("AT+USOWR=0,100,");
        engine.write_hex_bytes(&data);
        engine.cmd_stop();
        let sent = link.sent();
        let hex = &sent[15..sent.len() - 1];
        assert_eq!(hex.len(), 200);
        let mut decoded = [0u8; 100];
        base16::decode_slice(hex, &mut decoded).unwrap();
        assert_eq!(&decoded[..], &data[..]);
    }

    #[test]
    fn test_write_outside_command() {
        let (mut engine, link, _) = engine();
        engine.write_int(1);
        assert_eq!(engine.get_last_error(), Err(Error::DeviceError));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_nested_cmd_start() {
        let (mut engine, link, _) = engine();
        engine.cmd_start("AT+A");
        engine.cmd_start("AT+B");
        assert_eq!(engine.get_last_error(), Err(Error::DeviceError));
        assert_eq!(link.sent(), b"AT+A");
    }

    #[test]
    fn test_cmd_stop_without_command() {
        let (mut engine, link, _) = engine();
        engine.cmd_stop();
        engine.cmd_stop();
        assert_eq!(engine.get_last_error(), Ok(()));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_blocked_sink() {
        let (mut engine, link, _) = engine();
        link.set_blocked(true);
        let start = Instant::now();
        engine.cmd_start("AT");
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(engine.get_last_error(), Err(Error::DeviceError));
        // later writes return right away
        link.set_blocked(false);
        engine.write_int(3);
        engine.cmd_stop();
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_send_delay() {
        let (mut engine, link, _) = engine_with(
            Config::new()
                .with_timeout(Duration::from_millis(50))
                .with_send_delay(Duration::from_millis(30)),
        );
        link.inject(b"OK\r\n");
        engine.resp_start(None, false);
        engine.resp_stop();
        let start = Instant::now();
        engine.cmd_start("AT");
        assert!(start.elapsed() >= Duration::from_millis(25));
        engine.set_send_delay(Duration::ZERO);
        engine.cmd_stop();
        let start = Instant::now();
        engine.cmd_start("AT");
        assert!(start.elapsed() < Duration::from_millis(25));
    }

    #[test]
    fn test_output_delimiter() {
        let (mut engine, link, _) =
            engine_with(Config::new().with_output_delimiter("\r\n"));
        engine.cmd_start_stop("+CFUN", "=", &[Param::Int(1)]);
        assert_eq!(link.sent(), b"AT+CFUN=1\r\n");
    }

    #[test]
    fn test_quoted_echo_round_trip() {
        let (mut engine, link, _) = engine();
        link.set_echo(true);
        let text = "say \"hi\", C:\\modem";
        engine.cmd_start("AT+X=");
        engine.write_string(text, true);
        engine.cmd_stop();
        link.inject(b"\r\nOK\r\n");
        engine.resp_start(Some("AT+X="), false);
        let mut buf = [0u8; 32];
        let len = engine.read_string(&mut buf, true).unwrap();
        assert_eq!(&buf[..len], text.as_bytes());
        engine.resp_stop();
        assert_eq!(engine.get_last_error(), Ok(()));
    }

    #[test]
    fn test_at_cmd_int() {
        let (mut engine, link, _) = engine();
        link.inject(b"\r\n+CFUN: 1\r\n\r\nOK\r\n");
        assert_eq!(engine.at_cmd_int("+CFUN", "?", &[]), Ok(1));
        assert_eq!(link.sent(), b"AT+CFUN?\r");
    }

    #[test]
    fn test_at_cmd_str() {
        let (mut engine, link, _) = engine();
        link.inject(b"\r\n+CGMI: \"u-blox\"\r\n\r\nOK\r\n");
        let mut buf = [0u8; 16];
        let len = engine.at_cmd_str("+CGMI", "", &mut buf, &[]).unwrap();
        assert_eq!(&buf[..len], b"u-blox");
    }

    #[test]
    fn test_at_cmd_discard_error() {
        let (mut engine, link, _) = engine();
        link.inject(b"\r\n+CME ERROR: 3\r\n");
        assert_eq!(
            engine.at_cmd_discard(
                "+CGDCONT",
                "=",
                &[Param::Int(1), Param::QuotedStr("IP"), Param::QuotedStr("apn")]
            ),
            Err(Error::DeviceError)
        );
        assert_eq!(link.sent(), b"AT+CGDCONT=1,\"IP\",\"apn\"\r");
        assert_eq!(
            engine.get_last_device_error(),
            DeviceError {
                err_type: DeviceErrorType::Cme,
                code: Some(3)
            }
        );
    }

    #[test]
    fn test_sync() {
        let (mut engine, link, _) =
            engine_with(Config::new().with_timeout(Duration::from_millis(500)));
        engine.error.set(Error::Timeout);
        link.inject(b"stale data");
        let modem = link.clone();
        let responder = std::thread::spawn(move || {
            let start = Instant::now();
            while modem.sent() != b"AT\r" && start.elapsed() < Duration::from_secs(5) {
                std::thread::sleep(Duration::from_millis(1));
            }
            modem.inject(b"\r\nOK\r\n");
        });
        assert!(engine.sync());
        responder.join().unwrap();
        assert_eq!(engine.get_last_error(), Ok(()));
    }

    #[test]
    fn test_sync_timeout() {
        let (mut engine, link, _) = engine();
        assert!(!engine.sync());
        assert_eq!(link.sent(), b"AT\r");
        assert_eq!(engine.get_last_error(), Err(Error::Timeout));
    }
}
