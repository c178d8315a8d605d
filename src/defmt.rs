use defmt::Formatter;

use crate::engine::{Scope, StopTag};
use crate::error::{DeviceError, DeviceErrorType, Error};
use crate::transport::TransportError;

impl defmt::Format for Error {
    fn format(&self, fmt: Formatter<'_>) {
        match self {
            Error::WouldBlock => defmt::write!(fmt, "Error::WouldBlock"),
            Error::Timeout => defmt::write!(fmt, "Error::Timeout"),
            Error::DeviceError => defmt::write!(fmt, "Error::DeviceError"),
            Error::NoMemory => defmt::write!(fmt, "Error::NoMemory"),
            Error::Parameter => defmt::write!(fmt, "Error::Parameter"),
        }
    }
}

impl defmt::Format for DeviceErrorType {
    fn format(&self, fmt: Formatter<'_>) {
        match self {
            DeviceErrorType::None => defmt::write!(fmt, "None"),
            DeviceErrorType::Cme => defmt::write!(fmt, "CME"),
            DeviceErrorType::Cms => defmt::write!(fmt, "CMS"),
        }
    }
}

impl defmt::Format for DeviceError {
    fn format(&self, fmt: Formatter<'_>) {
        match self.code {
            Some(code) => defmt::write!(fmt, "DeviceError({}, {=i32})", self.err_type, code),
            None => defmt::write!(fmt, "DeviceError({})", self.err_type),
        }
    }
}

impl defmt::Format for Scope {
    fn format(&self, fmt: Formatter<'_>) {
        match self {
            Scope::NotSet => defmt::write!(fmt, "Scope::NotSet"),
            Scope::Resp => defmt::write!(fmt, "Scope::Resp"),
            Scope::Info => defmt::write!(fmt, "Scope::Info"),
            Scope::Elem => defmt::write!(fmt, "Scope::Elem"),
        }
    }
}

impl defmt::Format for StopTag {
    fn format(&self, fmt: Formatter<'_>) {
        match self {
            StopTag::Custom => defmt::write!(fmt, "custom"),
            StopTag::Ok => defmt::write!(fmt, "OK"),
            StopTag::Error => defmt::write!(fmt, "ERROR"),
            StopTag::CmeError => defmt::write!(fmt, "+CME ERROR"),
            StopTag::CmsError => defmt::write!(fmt, "+CMS ERROR"),
        }
    }
}

impl defmt::Format for TransportError {
    fn format(&self, fmt: Formatter<'_>) {
        match self {
            TransportError::Closed => defmt::write!(fmt, "TransportError::Closed"),
            TransportError::Io(kind) => {
                defmt::write!(fmt, "TransportError::Io({})", defmt::Debug2Format(kind))
            }
        }
    }
}
