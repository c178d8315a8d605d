//! Error taxonomy of the engine
//!
//! Three kinds of failures are told apart:
//!
//! - link errors ([`Error::WouldBlock`], [`Error::Timeout`], [`Error::Parameter`],
//!   [`Error::NoMemory`]) are detected locally,
//! - device errors ([`Error::DeviceError`] with [`DeviceErrorType::None`]) come from a plain
//!   `ERROR` result code,
//! - carrier errors (`+CME ERROR: <n>` / `+CMS ERROR: <n>`) carry a 3GPP defined code which can
//!   be mapped to a network cause with [`ErrorState::gpp_cause`].
use thiserror::Error;

/// Generic error classification recorded by the engine
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("operation would block")]
    WouldBlock,
    #[error("timed out waiting for the modem")]
    Timeout,
    #[error("modem reported an error")]
    DeviceError,
    #[error("no room left")]
    NoMemory,
    #[error("invalid parameter")]
    Parameter,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceErrorType {
    #[default]
    None,
    /// `+CME ERROR`, mobile equipment error
    Cme,
    /// `+CMS ERROR`, message service error
    Cms,
}

/// Last error reported by the modem itself
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceError {
    pub err_type: DeviceErrorType,
    /// numeric code following `+CME ERROR:`/`+CMS ERROR:`, `None` for a plain `ERROR`
    pub code: Option<i32>,
}

/// CME error code to 3GPP TS 24.008 annex G cause
const CME_TO_3GPP: [(i32, u8); 38] = [
    (103, 3),
    (106, 6),
    (107, 7),
    (108, 8),
    (111, 11),
    (112, 12),
    (113, 13),
    (114, 14),
    (115, 15),
    (122, 22),
    (125, 25),
    (172, 95),
    (173, 96),
    (174, 97),
    (175, 99),
    (176, 111),
    (177, 8),
    (126, 26),
    (127, 27),
    (128, 28),
    (129, 29),
    (130, 30),
    (131, 31),
    (132, 32),
    (133, 33),
    (134, 34),
    (140, 40),
    (141, 41),
    (142, 42),
    (143, 43),
    (144, 44),
    (145, 45),
    (146, 46),
    (178, 65),
    (179, 66),
    (180, 48),
    (181, 83),
    (171, 49),
];

/// Maps a CME/CMS code to a carrier neutral 3GPP cause, `None` when there is no mapping
pub fn map_3gpp_error(code: i32, err_type: DeviceErrorType) -> Option<u8> {
    match err_type {
        DeviceErrorType::None => None,
        // CMS codes 0-127 are 3GPP causes already
        DeviceErrorType::Cms if (0..128).contains(&code) => Some(code as u8),
        _ => CME_TO_3GPP
            .iter()
            .find(|(cme, _)| *cme == code)
            .map(|(_, cause)| *cause),
    }
}

/// Error record of one handler
///
/// A device error exists only while the generic error is [`Error::DeviceError`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErrorState {
    last: Option<Error>,
    device: DeviceError,
    gpp_cause: Option<u8>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_error(&self) -> Result<(), Error> {
        match self.last {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.last.is_some()
    }

    pub fn device_error(&self) -> DeviceError {
        self.device
    }

    pub fn gpp_cause(&self) -> Option<u8> {
        self.gpp_cause
    }

    /// Records a generic error, keeping the first one of a transaction
    pub fn set(&mut self, error: Error) {
        if self.last.is_none() {
            log::warn!("AT error recorded: {}", error);
            self.last = Some(error);
        }
    }

    /// Records an error result code sent by the modem
    pub fn set_device_error(&mut self, err_type: DeviceErrorType, code: Option<i32>) {
        if self.last.is_some() {
            return;
        }
        self.set(Error::DeviceError);
        self.device = DeviceError { err_type, code };
        if let Some(code) = code {
            log::warn!("AT device error {:?} {}", err_type, code);
            // keep the root cause if one was mapped already
            if self.gpp_cause.is_none() {
                self.gpp_cause = map_3gpp_error(code, err_type);
            }
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cme_mapping() {
        assert_eq!(map_3gpp_error(108, DeviceErrorType::Cme), Some(8));
        assert_eq!(map_3gpp_error(181, DeviceErrorType::Cme), Some(83));
        assert_eq!(map_3gpp_error(3, DeviceErrorType::Cme), None);
    }

    #[test]
    fn test_cms_mapping() {
        assert_eq!(map_3gpp_error(42, DeviceErrorType::Cms), Some(42));
        assert_eq!(map_3gpp_error(127, DeviceErrorType::Cms), Some(127));
        // above 127 CMS codes share the CME table
        assert_eq!(map_3gpp_error(128, DeviceErrorType::Cms), Some(28));
        assert_eq!(map_3gpp_error(500, DeviceErrorType::Cms), None);
    }

    #[test]
    fn test_plain_error_has_no_mapping() {
        assert_eq!(map_3gpp_error(108, DeviceErrorType::None), None);
    }

    #[test]
    fn test_first_error_is_kept() {
        let mut state = ErrorState::new();
        state.set(Error::Timeout);
        state.set(Error::Parameter);
        assert_eq!(state.last_error(), Err(Error::Timeout));
    }

    #[test]
    fn test_device_error_only_with_device_error() {
        let mut state = ErrorState::new();
        state.set(Error::Timeout);
        state.set_device_error(DeviceErrorType::Cme, Some(108));
        assert_eq!(state.device_error(), DeviceError::default());
        assert_eq!(state.gpp_cause(), None);
    }

    #[test]
    fn test_clear_twice_is_clear_once() {
        let mut state = ErrorState::new();
        state.set_device_error(DeviceErrorType::Cms, Some(10));
        state.clear();
        let once = state;
        state.clear();
        assert_eq!(state, once);
        assert_eq!(state.last_error(), Ok(()));
        assert_eq!(state.device_error().err_type, DeviceErrorType::None);
    }
}
