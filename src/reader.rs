//! Response side of a transaction
//!
//! A response is parsed in nested scopes, each closed by its own stop tag:
//!
//! ```text
//! +CGDCONT: 1,"IP","internet"\r\n     <- info line, prefix "+CGDCONT:", ends at the line end
//! +COPS: (2,"Operator",,"23001"),(1,...)\r\n
//!        ^^^^^^^^^^^^^^^^^^^^^^^ element, ends at ')'
//! OK\r\n                               <- response, ends at the final result code
//! ```
//!
//! `resp_start` finds the first information line (or the final result code), `info_resp` and
//! `info_elem` step through lines and elements, the `read_*` functions pull one field each and
//! `resp_stop` consumes whatever is left up to the final result code.
use heapless::String;

use crate::buffer::{Match, RECV_BUFF_SIZE};
use crate::engine::{CustomTag, Engine, Scope, StopTag, MAX_PREFIX_LEN};
use crate::error::{DeviceErrorType, Error};
use crate::urc::UrcMatch;

const OK: &[u8] = b"OK";
const ERROR: &[u8] = b"ERROR";
const CME_ERROR: &[u8] = b"+CME ERROR:";
const CMS_ERROR: &[u8] = b"+CMS ERROR:";

const MAX_INT_FIELD: usize = 32;

/// A tag found in the buffer
enum TagMatch {
    Full { len: usize, tag: StopTag },
    Partial,
    No,
}

enum TagScan {
    Found { at: usize, len: usize, tag: StopTag },
    /// a tag may start at `at`, more input is needed to tell
    Partial { at: usize },
    None,
}

fn is_line_end(c: u8) -> bool {
    c == b'\r' || c == b'\n'
}

/// Matches `body` at the start of `data`, followed by a line end if `line_end` is set
fn tag_at(data: &[u8], body: &[u8], line_end: bool) -> Match {
    if data.len() < body.len() {
        return if body.starts_with(data) {
            Match::Partial
        } else {
            Match::No
        };
    }
    if &data[..body.len()] != body {
        return Match::No;
    }
    if !line_end {
        return Match::Full;
    }
    match data.get(body.len()) {
        Some(&c) if is_line_end(c) => Match::Full,
        Some(_) => Match::No,
        None => Match::Partial,
    }
}

impl CustomTag {
    /// Trailing line end characters of `tag` are matched loosely, like the built in tags
    fn new(tag: &str) -> Result<Self, Error> {
        let trimmed = tag.trim_end_matches(['\r', '\n']);
        let (body, line_end) = if trimmed.is_empty() {
            (tag, false)
        } else {
            (trimmed, trimmed.len() != tag.len())
        };
        let mut stored = String::new();
        stored.push_str(body).map_err(|_| Error::Parameter)?;
        Ok(Self {
            body: stored,
            line_end,
        })
    }
}

impl Engine {
    /// Final result codes a response can end with, custom tag first
    fn resp_tag_at(&self, data: &[u8], with_errors: bool) -> TagMatch {
        let mut partial = false;
        let mut check = |m: Match, len: usize, tag: StopTag| match m {
            Match::Full => Some(TagMatch::Full { len, tag }),
            Match::Partial => {
                partial = true;
                None
            }
            Match::No => None,
        };
        if let Some(custom) = &self.txn.custom_tag {
            let body = custom.body.as_bytes();
            let len = body.len() + usize::from(custom.line_end);
            if let Some(found) = check(tag_at(data, body, custom.line_end), len, StopTag::Custom) {
                return found;
            }
        }
        if let Some(found) = check(tag_at(data, OK, true), OK.len() + 1, StopTag::Ok) {
            return found;
        }
        if with_errors {
            let candidates = [
                (ERROR, true, StopTag::Error),
                (CME_ERROR, false, StopTag::CmeError),
                (CMS_ERROR, false, StopTag::CmsError),
            ];
            for (body, line_end, tag) in candidates {
                let len = body.len() + usize::from(line_end);
                if let Some(found) = check(tag_at(data, body, line_end), len, tag) {
                    return found;
                }
            }
        }
        if partial {
            TagMatch::Partial
        } else {
            TagMatch::No
        }
    }

    /// Earliest final result code anywhere in the buffered input
    fn scan_resp_tags(&self) -> TagScan {
        let pending = self.buf.pending();
        for at in 0..pending.len() {
            match self.resp_tag_at(&pending[at..], true) {
                TagMatch::Full { len, tag } => return TagScan::Found { at, len, tag },
                TagMatch::Partial => return TagScan::Partial { at },
                TagMatch::No => {}
            }
        }
        TagScan::None
    }

    /// Reads the number after `+CME ERROR:`/`+CMS ERROR:`
    ///
    /// The code is taken even when no line end follows before the deadline. Verbose error
    /// text yields `None`.
    fn read_error_code(&mut self) -> Option<i32> {
        let mut code: Option<i32> = None;
        loop {
            let c = match self.buf.peek() {
                Some(c) => c,
                None => match self.fill_buffer(true) {
                    Ok(_) => continue,
                    Err(_) => break,
                },
            };
            match c {
                b' ' if code.is_none() => self.buf.consume(1),
                b'0'..=b'9' => {
                    let digit = i32::from(c - b'0');
                    code = Some(code.unwrap_or(0).saturating_mul(10).saturating_add(digit));
                    self.buf.consume(1);
                }
                _ => break,
            }
        }
        if code.is_none() {
            if let Some(at) = self.buf.find_line_end() {
                self.buf.consume(at);
            }
        }
        self.consume_line_end();
        code
    }

    /// Acts on a final result code that has just been consumed
    fn apply_stop_tag(&mut self, tag: StopTag, record: bool) {
        self.consume_line_end();
        let code = match tag {
            StopTag::CmeError | StopTag::CmsError => self.read_error_code(),
            _ => None,
        };
        self.txn.matched = Some(tag);
        if !record {
            return;
        }
        match tag {
            StopTag::Ok | StopTag::Custom => {}
            StopTag::Error => self.error.set_device_error(DeviceErrorType::None, None),
            StopTag::CmeError => self.error.set_device_error(DeviceErrorType::Cme, code),
            StopTag::CmsError => self.error.set_device_error(DeviceErrorType::Cms, code),
        }
    }

    /// Discards input up to and including the next final result code
    fn consume_to_resp_tag(&mut self, record: bool) -> Result<StopTag, Error> {
        loop {
            match self.scan_resp_tags() {
                TagScan::Found { at, len, tag } => {
                    self.buf.consume(at + len);
                    self.apply_stop_tag(tag, record);
                    return Ok(tag);
                }
                TagScan::Partial { at } => self.buf.consume(at),
                TagScan::None => self.buf.clear(),
            }
            self.fill_blocking()?;
        }
    }

    fn set_scope(&mut self, scope: Scope) {
        self.txn.scope = scope;
        self.txn.stop_found = false;
    }

    /// Looks for `prefix` at the start of a line, or for the data of a response without prefix
    ///
    /// Returns true when the prefix was consumed, or without a prefix, when there is data to
    /// read. Returns false once the final result code was met or an error was recorded.
    fn resp(&mut self, prefix: Option<&[u8]>, check_urc: bool) -> bool {
        let prefix = prefix.filter(|p| !p.is_empty());
        loop {
            if self.error.is_err() {
                return false;
            }
            self.skip_line_ends();
            if self.buf.is_empty() {
                if self.fill_blocking().is_err() {
                    return false;
                }
                continue;
            }
            let mut partial = false;
            match self.resp_tag_at(self.buf.pending(), true) {
                TagMatch::Full { len, tag } => {
                    self.buf.consume(len);
                    self.apply_stop_tag(tag, true);
                    self.txn.stop_found = true;
                    return false;
                }
                TagMatch::Partial => partial = true,
                TagMatch::No => {}
            }
            if let Some(prefix) = prefix {
                match self.buf.match_head(prefix) {
                    Match::Full => {
                        self.buf.consume(prefix.len());
                        self.txn.prefix_matched = true;
                        return true;
                    }
                    Match::Partial => partial = true,
                    Match::No => {}
                }
            }
            if check_urc {
                match self.dispatch_urc_at_head() {
                    UrcMatch::Dispatched => continue,
                    UrcMatch::Partial => partial = true,
                    UrcMatch::No => {}
                }
            }
            if partial && !self.buf.is_full() {
                if self.fill_blocking().is_err() {
                    return false;
                }
                continue;
            }
            if self.buf.find_line_end().is_some() {
                if prefix.is_none() {
                    return true;
                }
                let deadline = self.deadline;
                self.consume_line(deadline);
            } else if self.buf.is_full() {
                if prefix.is_none() {
                    return true;
                }
                // a line longer than the buffer can't be the one we look for
                self.buf.clear();
            } else if self.fill_blocking().is_err() {
                return false;
            }
        }
    }

    /// Starts reading a response
    ///
    /// With a `prefix` lines are skipped until one starts with it, the response is then in its
    /// first information line. Without a prefix the call returns as soon as a line of data is
    /// buffered. Either way the final result code ends the search; error result codes are
    /// recorded. With `allow_forwarding` URC lines met on the way are dispatched rather than
    /// skipped.
    pub fn resp_start(&mut self, prefix: Option<&str>, allow_forwarding: bool) {
        if self.error.is_err() {
            return;
        }
        let mut info_prefix = String::new();
        if let Some(prefix) = prefix {
            if info_prefix.push_str(prefix).is_err() {
                self.record(Error::Parameter);
                return;
            }
        }
        self.begin();
        self.txn.info_prefix = info_prefix;
        self.txn.forwarding = allow_forwarding;
        self.txn.prefix_matched = false;
        self.txn.matched = None;
        self.set_scope(Scope::Resp);
        // take whatever is there already
        let _ = self.fill_buffer(false);

        let info_prefix = self.txn.info_prefix.clone();
        let matched = self.resp(Some(info_prefix.as_bytes()), allow_forwarding);
        if matched && self.txn.prefix_matched {
            self.set_scope(Scope::Info);
        }
    }

    /// Moves to the next information line, true when it starts with the response prefix
    ///
    /// Without a prefix any line before the final result code counts.
    pub fn info_resp(&mut self) -> bool {
        if self.error.is_err() {
            return false;
        }
        if self.txn.prefix_matched {
            // the line found by resp_start
            self.txn.prefix_matched = false;
            if self.txn.scope != Scope::Info {
                self.set_scope(Scope::Info);
            }
            return true;
        }
        if self.txn.scope == Scope::Resp && self.txn.stop_found {
            return false;
        }
        self.begin();
        if self.txn.scope == Scope::Elem {
            self.element_stop();
        }
        if self.txn.scope == Scope::Info {
            self.info_stop();
        }
        self.set_scope(Scope::Resp);
        let info_prefix = self.txn.info_prefix.clone();
        let forwarding = self.txn.forwarding;
        if self.resp(Some(info_prefix.as_bytes()), forwarding) {
            self.txn.prefix_matched = false;
            self.set_scope(Scope::Info);
            return true;
        }
        false
    }

    /// Enters the next element of the information line if it starts with `start`
    pub fn info_elem(&mut self, start: u8) -> bool {
        if self.error.is_err() {
            return false;
        }
        self.begin();
        if self.txn.scope == Scope::Elem {
            self.element_stop();
        }
        if self.peek_char() == Ok(self.delimiter) {
            self.buf.consume(1);
        }
        if self.peek_char() == Ok(start) {
            self.buf.consume(1);
            self.set_scope(Scope::Elem);
            return true;
        }
        false
    }

    fn element_stop(&mut self) {
        if !self.txn.stop_found && self.error.last_error().is_ok() {
            while let Ok(c) = self.get_char() {
                if c == b')' {
                    break;
                }
            }
        }
        self.set_scope(Scope::Info);
    }

    fn info_stop(&mut self) {
        if !self.txn.stop_found && self.error.last_error().is_ok() {
            loop {
                if let Some(at) = self.buf.find_line_end() {
                    self.buf.consume(at);
                    self.consume_line_end();
                    break;
                }
                self.buf.clear();
                if self.fill_blocking().is_err() {
                    break;
                }
            }
        }
        self.set_scope(Scope::Resp);
    }

    /// Checks for the stop tag of the current scope at the head of the input and consumes it
    fn stop_tag_here(&mut self) -> Result<bool, Error> {
        loop {
            if self.buf.is_empty() {
                self.fill_blocking()?;
            }
            let head = self.buf.pending();
            let found = match self.txn.scope {
                Scope::Info => match head.first() {
                    Some(&c) if is_line_end(c) => Some((1, None)),
                    _ => None,
                },
                Scope::Elem => match head.first() {
                    Some(b')') => Some((1, None)),
                    _ => None,
                },
                Scope::Resp | Scope::NotSet => match self.resp_tag_at(head, false) {
                    TagMatch::Full { len, tag } => Some((len, Some(tag))),
                    TagMatch::Partial => {
                        if self.buf.is_full() || self.fill_buffer(true).is_err() {
                            // not a tag after all, the byte is field data
                            return Ok(false);
                        }
                        continue;
                    }
                    TagMatch::No => None,
                },
            };
            return match found {
                Some((len, tag)) => {
                    self.buf.consume(len);
                    match tag {
                        Some(tag) => self.apply_stop_tag(tag, true),
                        None => {
                            if self.txn.scope == Scope::Info {
                                self.consume_line_end();
                            }
                        }
                    }
                    self.txn.stop_found = true;
                    Ok(true)
                }
                None => Ok(false),
            };
        }
    }

    /// Reads one field, quoted or not, into `out` (dropped with `discard`)
    fn read_field(
        &mut self,
        out: &mut [u8],
        ignore_delimiter: bool,
        discard: bool,
    ) -> Result<usize, Error> {
        self.ok_to_proceed()?;
        if self.txn.stop_found {
            // end of data in this scope, nothing to record
            return Err(Error::DeviceError);
        }
        let mut len = 0;
        let mut started = false;
        let mut overflow = false;
        let mut quoted = false;
        let mut was_quoted = false;
        let mut escaped = false;
        loop {
            if !quoted && self.stop_tag_here()? {
                break;
            }
            let c = self.get_char()?;
            let keep = if quoted {
                if escaped {
                    escaped = false;
                    true
                } else if c == b'\\' {
                    escaped = true;
                    false
                } else if c == b'"' {
                    quoted = false;
                    false
                } else {
                    true
                }
            } else if c == b' ' && !started {
                false
            } else if c == b'"' && !started {
                quoted = true;
                was_quoted = true;
                started = true;
                false
            } else if c == self.delimiter && (was_quoted || !ignore_delimiter) {
                break;
            } else {
                started = true;
                true
            };
            if keep && !discard {
                match out.get_mut(len) {
                    Some(slot) => {
                        *slot = c;
                        len += 1;
                    }
                    None => overflow = true,
                }
            }
        }
        if overflow {
            return Err(self.record(Error::Parameter));
        }
        if self.txn.stop_found && matches!(self.txn.scope, Scope::Resp | Scope::NotSet) {
            while len > 0 && is_line_end(out[len - 1]) {
                len -= 1;
            }
        }
        Ok(len)
    }

    /// Reads a decimal field
    ///
    /// A field that is not a number, or a read past the end of the scope, yields
    /// `Err(Error::DeviceError)` without recording it.
    pub fn read_int(&mut self) -> Result<i32, Error> {
        self.begin();
        let mut field = [0u8; MAX_INT_FIELD];
        let len = self.read_field(&mut field, false, false)?;
        core::str::from_utf8(&field[..len])
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .ok_or(Error::DeviceError)
    }

    /// Reads a field into `buf`, returns its length
    ///
    /// Leading spaces and surrounding quotes are removed. With `ignore_delimiter` an unquoted field runs to the
    /// end of the scope, delimiters included, for free text.
    pub fn read_string(&mut self, buf: &mut [u8], ignore_delimiter: bool) -> Result<usize, Error> {
        self.begin();
        self.read_field(buf, ignore_delimiter, false)
    }

    /// Reads a hex encoded field and decodes it into `buf`
    pub fn read_hex_string(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.begin();
        let mut hex = vec![0u8; buf.len() * 2];
        let len = self.read_field(&mut hex, false, false)?;
        base16::decode_slice(&hex[..len], buf).map_err(|e| {
            log::warn!("AT malformed hex field: {:?}", e);
            Error::DeviceError
        })
    }

    /// Reads exactly `len` raw bytes
    ///
    /// `len` larger than `buf` or than [`RECV_BUFF_SIZE`] is rejected without consuming
    /// anything, longer payloads are read in several calls. Nothing is consumed until all of
    /// the bytes arrived.
    pub fn read_bytes(&mut self, buf: &mut [u8], len: usize) -> Result<usize, Error> {
        self.ok_to_proceed()?;
        if len > buf.len() {
            return Err(self.record(Error::Parameter));
        }
        if len > RECV_BUFF_SIZE {
            return Err(self.record(Error::Parameter));
        }
        self.begin();
        while !self.buf.has_available(len) {
            self.fill_blocking()?;
        }
        buf[..len].copy_from_slice(&self.buf.pending()[..len]);
        self.buf.consume(len);
        Ok(len)
    }

    /// Skips `count` fields
    pub fn skip_param(&mut self, count: usize) {
        self.begin();
        for _ in 0..count {
            if self.read_field(&mut [], false, true).is_err() {
                return;
            }
        }
    }

    /// Skips `count` fields of `len` raw bytes each
    pub fn skip_param_len(&mut self, len: usize, count: usize) {
        if self.ok_to_proceed().is_err() {
            return;
        }
        self.begin();
        for _ in 0..len * count {
            if self.get_char().is_err() {
                return;
            }
        }
    }

    /// Finishes the response, consuming everything up to its final result code
    pub fn resp_stop(&mut self) {
        self.begin();
        if self.txn.scope == Scope::Elem {
            self.element_stop();
        }
        if self.txn.scope == Scope::Info {
            self.info_stop();
        }
        if !self.txn.stop_found && self.error.last_error().is_ok() {
            let _ = self.consume_to_resp_tag(true);
        }
        self.txn.reset_response();
        self.last_response_stop = Some(std::time::Instant::now());
    }

    /// Drops input until any final result code, to resynchronize after an abandoned response
    ///
    /// Works while an error is recorded and leaves the error record as it was.
    pub fn consume_to_stop_tag(&mut self) -> bool {
        self.begin();
        let saved = self.error;
        self.error.clear();
        let found = self.consume_to_resp_tag(false).is_ok();
        self.error = saved;
        if found {
            self.txn.scope = Scope::Resp;
            self.txn.stop_found = true;
        }
        found
    }

    /// Field delimiter for all following reads and writes
    pub fn set_delimiter(&mut self, delimiter: u8) {
        self.delimiter = delimiter;
    }

    pub fn set_default_delimiter(&mut self) {
        self.delimiter = self.default_delimiter;
    }

    /// Ends the current response at `tag` instead of `OK`, until the next `resp_stop`
    ///
    /// The built in result codes stay recognized after the custom tag.
    pub fn set_stop_tag(&mut self, tag: &str) {
        if tag.is_empty() || tag.len() > MAX_PREFIX_LEN {
            self.record(Error::Parameter);
            return;
        }
        match CustomTag::new(tag) {
            Ok(custom) => self.txn.custom_tag = Some(custom),
            Err(e) => {
                self.record(e);
            }
        }
    }
}
