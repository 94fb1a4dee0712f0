//! libusb-shim
//!
//! A libusb-style host API over a browser-style USB binding. The binding
//! hands out JSON-like device and configuration records and reports
//! transfers through callbacks; the shim translates those records into
//! libusb descriptor trees, turns libusb transfers into binding requests,
//! and brings asynchronous completions back to the thread that calls
//! [`LibusbShim::handle_events`].
//!
//! # Example
//!
//! ```no_run
//! use libusb_shim::{LibusbShim, RusbBinding};
//! use std::sync::Arc;
//!
//! let binding = Arc::new(RusbBinding::spawn(Vec::new(), 256)?);
//! let shim = LibusbShim::new(binding);
//!
//! let devices = shim.get_device_list(None).expect("enumeration failed");
//! for device in &devices {
//!     let descriptor = shim.get_device_descriptor(device).expect("descriptor");
//!     println!("{:04x}:{:04x}", descriptor.id_vendor, descriptor.id_product);
//! }
//! shim.free_device_list(devices, true);
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod request;
pub mod rusb_binding;
pub mod shim;
pub mod tracker;
pub mod transfer;

pub use config::ShimConfig;
pub use context::Context;
pub use descriptor::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, Interface, InterfaceDescriptor,
};
pub use device::{Device, DeviceHandle};
pub use error::{LibusbError, Result};
pub use request::ControlSetup;
pub use rusb_binding::RusbBinding;
pub use shim::{DEFAULT_HANDLE_EVENTS_TIMEOUT, FAKE_BUS_NUMBER, LibusbShim};
pub use tracker::{SubmissionId, TransferTracker};
pub use transfer::{Transfer, TransferFlags, TransferId, TransferStatus, TransferType};
