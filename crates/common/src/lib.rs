//! Common utilities for libusb-shim
//!
//! Shared error handling and logging setup, plus a scriptable in-memory
//! [`usb_binding::UsbBinding`] used by the tests of every crate.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
