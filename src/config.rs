//! Handler configuration
use core::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Time given to a partially received URC to complete
pub const DEFAULT_URC_TIMEOUT: Duration = Duration::from_millis(20);
pub const DEFAULT_DELIMITER: u8 = b',';
pub const DEFAULT_OUTPUT_DELIMITER: &str = "\r";

/// Settings a handler starts with, all of them can be changed later on the handler itself
///
/// ```
/// use at_handler::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .with_timeout(Duration::from_secs(3))
///     .with_output_delimiter("\r\n")
///     .with_debug(true);
/// assert_eq!(config.delimiter, b',');
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub timeout: Duration,
    pub urc_timeout: Duration,
    /// minimum time between the end of a response and the next command
    pub send_delay: Duration,
    pub delimiter: u8,
    /// command terminator
    pub output_delimiter: &'static str,
    pub debug: bool,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            urc_timeout: DEFAULT_URC_TIMEOUT,
            send_delay: Duration::ZERO,
            delimiter: DEFAULT_DELIMITER,
            output_delimiter: DEFAULT_OUTPUT_DELIMITER,
            debug: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_urc_timeout(mut self, urc_timeout: Duration) -> Self {
        self.urc_timeout = urc_timeout;
        self
    }

    pub fn with_send_delay(mut self, send_delay: Duration) -> Self {
        self.send_delay = send_delay;
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_output_delimiter(mut self, output_delimiter: &'static str) -> Self {
        self.output_delimiter = output_delimiter;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
