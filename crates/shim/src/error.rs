//! libusb status codes
//!
//! Synchronous entry points report failure as a [`LibusbError`]; its
//! [`code`](LibusbError::code) is the negative number a libusb consumer
//! expects.

use thiserror::Error;

/// Error returned by the synchronous libusb entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum LibusbError {
    #[error("Input/output error")]
    Io,

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("Access denied (insufficient permissions)")]
    Access,

    #[error("No such device (it may have been disconnected)")]
    NoDevice,

    #[error("Entity not found")]
    NotFound,

    #[error("Resource busy")]
    Busy,

    #[error("Operation timed out")]
    Timeout,

    #[error("Overflow")]
    Overflow,

    #[error("Pipe error")]
    Pipe,

    #[error("System call interrupted")]
    Interrupted,

    #[error("Insufficient memory")]
    NoMem,

    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,

    #[error("Other error")]
    Other,
}

impl LibusbError {
    /// Negative libusb status code
    pub fn code(self) -> i32 {
        match self {
            LibusbError::Io => -1,
            LibusbError::InvalidParam => -2,
            LibusbError::Access => -3,
            LibusbError::NoDevice => -4,
            LibusbError::NotFound => -5,
            LibusbError::Busy => -6,
            LibusbError::Timeout => -7,
            LibusbError::Overflow => -8,
            LibusbError::Pipe => -9,
            LibusbError::Interrupted => -10,
            LibusbError::NoMem => -11,
            LibusbError::NotSupported => -12,
            LibusbError::Other => -99,
        }
    }

    /// Inverse of [`code`](Self::code)
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            -1 => LibusbError::Io,
            -2 => LibusbError::InvalidParam,
            -3 => LibusbError::Access,
            -4 => LibusbError::NoDevice,
            -5 => LibusbError::NotFound,
            -6 => LibusbError::Busy,
            -7 => LibusbError::Timeout,
            -8 => LibusbError::Overflow,
            -9 => LibusbError::Pipe,
            -10 => LibusbError::Interrupted,
            -11 => LibusbError::NoMem,
            -12 => LibusbError::NotSupported,
            -99 => LibusbError::Other,
            _ => return None,
        };
        Some(err)
    }
}

/// Type alias for libusb entry point results
pub type Result<T> = std::result::Result<T, LibusbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LibusbError::Io.code(), -1);
        assert_eq!(LibusbError::InvalidParam.code(), -2);
        assert_eq!(LibusbError::NotSupported.code(), -12);
        assert_eq!(LibusbError::Other.code(), -99);
    }

    #[test]
    fn test_code_roundtrip() {
        for code in (-12..=-1).chain(std::iter::once(-99)) {
            let err = LibusbError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
        assert_eq!(LibusbError::from_code(0), None);
        assert_eq!(LibusbError::from_code(-13), None);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(LibusbError::InvalidParam.to_string(), "Invalid parameter");
    }
}
