//! Platform USB binding contract for libusb-shim
//!
//! This crate describes the platform side of the shim: the JSON-like device
//! and configuration records the platform hands out, the transfer request
//! and result records, the uniform [`RequestResult`] envelope, and the
//! [`UsbBinding`] trait through which the shim drives the platform.
//!
//! # Example
//!
//! ```
//! use usb_binding::{RequestResult, TransferResultInfo, decode_json};
//!
//! let result: RequestResult<TransferResultInfo> = decode_json(
//!     r#"{"status": "succeeded", "payload": {"resultCode": 0, "data": [18, 1]}}"#,
//! )
//! .unwrap();
//!
//! match result {
//!     RequestResult::Succeeded { payload } => assert!(payload.is_success()),
//!     _ => unreachable!(),
//! }
//! ```

pub mod bridge;
pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use bridge::{TransferCallback, UsbBinding};
pub use codec::{MAX_DOCUMENT_SIZE, decode_json, encode_json, encode_json_pretty};
pub use error::{BindingError, Result};
pub use messages::{
    ControlTransferInfo, GenericTransferInfo, Recipient, RequestResult, RequestType,
    TRANSFER_RESULT_SUCCESS, TransferResultInfo,
};
pub use types::{
    ConfigRecord, ConnectionHandle, DeviceId, DeviceRecord, Direction, EndpointRecord,
    EndpointSynchronization, EndpointType, EndpointUsage, InterfaceRecord,
};
