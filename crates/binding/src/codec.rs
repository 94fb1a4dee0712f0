//! JSON encoding of binding records and messages
//!
//! The browser binding speaks JSON-like values. These helpers convert any
//! record or message defined in this crate to and from that form.
//!
//! Documents larger than [`MAX_DOCUMENT_SIZE`] are rejected before parsing
//! to keep a misbehaving platform from exhausting memory.

use crate::error::{BindingError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum accepted JSON document size (16 MiB)
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Encode a value as compact JSON
///
/// # Example
/// ```
/// use usb_binding::{DeviceId, DeviceRecord, encode_json};
///
/// let record = DeviceRecord {
///     device: DeviceId(3),
///     vendor_id: 0x1234,
///     product_id: 0x5678,
///     version: None,
///     product_name: None,
///     manufacturer_name: None,
///     serial_number: None,
/// };
/// let json = encode_json(&record).unwrap();
/// assert!(json.contains("\"vendorId\":4660"));
/// ```
pub fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(BindingError::from)
}

/// Encode a value as indented JSON (for humans)
pub fn encode_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(BindingError::from)
}

/// Decode a value from JSON
///
/// # Example
/// ```
/// use usb_binding::{DeviceRecord, decode_json};
///
/// let record: DeviceRecord =
///     decode_json(r#"{"device": 1, "vendorId": 2, "productId": 3}"#).unwrap();
/// assert_eq!(record.product_id, 3);
/// ```
pub fn decode_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    if json.len() > MAX_DOCUMENT_SIZE {
        return Err(BindingError::DocumentTooLarge {
            size: json.len(),
            max: MAX_DOCUMENT_SIZE,
        });
    }
    serde_json::from_str(json).map_err(BindingError::from)
}
