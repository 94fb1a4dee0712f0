//! Platform USB record definitions
//!
//! These are the JSON-like records the platform binding hands out for
//! devices and their configurations. Field names follow the browser binding
//! (camelCase) so records can be decoded straight from its JSON form.

use serde::{Deserialize, Serialize};

/// Opaque device identifier assigned by the platform binding
///
/// Stable for as long as the device stays connected. The shim derives the
/// libusb device address from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Opaque connection identifier returned when a device is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u32);

/// Transfer direction as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Device record returned by device enumeration
///
/// An immutable snapshot taken at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Opaque device id
    pub device: DeviceId,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Device release number in BCD (not reported by every platform)
    #[serde(default)]
    pub version: Option<u16>,
    /// Resolved product string
    #[serde(default)]
    pub product_name: Option<String>,
    /// Resolved manufacturer string
    #[serde(default)]
    pub manufacturer_name: Option<String>,
    /// Resolved serial number string
    #[serde(default)]
    pub serial_number: Option<String>,
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointType {
    Control,
    Interrupt,
    Isochronous,
    Bulk,
}

/// Isochronous endpoint synchronization type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointSynchronization {
    Asynchronous,
    Adaptive,
    Synchronous,
}

/// Isochronous endpoint usage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointUsage {
    Data,
    Feedback,
    ExplicitFeedback,
}

/// Endpoint record nested in an interface record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    /// Endpoint address including the direction bit
    pub address: u8,
    /// Transfer type
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    /// Direction
    pub direction: Direction,
    /// Maximum packet size
    pub maximum_packet_size: u16,
    /// Synchronization type (isochronous endpoints only)
    #[serde(default)]
    pub synchronization: Option<EndpointSynchronization>,
    /// Usage type (isochronous endpoints only)
    #[serde(default)]
    pub usage: Option<EndpointUsage>,
    /// Polling interval (interrupt and isochronous endpoints)
    #[serde(default)]
    pub polling_interval: Option<u8>,
    /// Raw class or vendor specific descriptor bytes
    #[serde(default, rename = "extra_data", with = "serde_bytes")]
    pub extra_data: Vec<u8>,
}

/// Interface record nested in a configuration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceRecord {
    pub interface_number: u8,
    #[serde(default)]
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub endpoints: Vec<EndpointRecord>,
    #[serde(default, rename = "extra_data", with = "serde_bytes")]
    pub extra_data: Vec<u8>,
}

/// Configuration record returned by configuration retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRecord {
    /// Whether this is the currently active configuration
    pub active: bool,
    /// bConfigurationValue
    pub configuration_value: u8,
    /// Remote wakeup supported
    pub remote_wakeup: bool,
    /// Self powered
    pub self_powered: bool,
    /// Maximum power draw
    pub max_power: u8,
    /// Interfaces of this configuration
    pub interfaces: Vec<InterfaceRecord>,
    #[serde(default, rename = "extra_data", with = "serde_bytes")]
    pub extra_data: Vec<u8>,
}

impl ConfigRecord {
    /// Number of endpoints across every interface
    pub fn endpoint_count(&self) -> usize {
        self.interfaces.iter().map(|i| i.endpoints.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_equality() {
        let id1 = DeviceId(42);
        let id2 = DeviceId(42);
        let id3 = DeviceId(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_device_record_decodes_browser_json() {
        let json = r#"{
            "device": 7,
            "vendorId": 1193,
            "productId": 21520,
            "version": 256,
            "productName": "Reader",
            "manufacturerName": "ACME",
            "serialNumber": "0001"
        }"#;
        let record: DeviceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.device, DeviceId(7));
        assert_eq!(record.vendor_id, 0x04a9);
        assert_eq!(record.version, Some(0x0100));
        assert_eq!(record.product_name.as_deref(), Some("Reader"));
    }

    #[test]
    fn test_device_record_optional_fields_default() {
        let json = r#"{"device": 1, "vendorId": 1, "productId": 2}"#;
        let record: DeviceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.version, None);
        assert_eq!(record.serial_number, None);
    }

    #[test]
    fn test_endpoint_record_type_field() {
        let json = r#"{
            "address": 129,
            "type": "isochronous",
            "direction": "in",
            "maximumPacketSize": 512,
            "synchronization": "adaptive",
            "usage": "explicitFeedback",
            "pollingInterval": 1,
            "extra_data": [1, 2, 3]
        }"#;
        let record: EndpointRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.endpoint_type, EndpointType::Isochronous);
        assert_eq!(
            record.synchronization,
            Some(EndpointSynchronization::Adaptive)
        );
        assert_eq!(record.usage, Some(EndpointUsage::ExplicitFeedback));
        assert_eq!(record.extra_data, vec![1, 2, 3]);
    }

    #[test]
    fn test_endpoint_count() {
        let endpoint = EndpointRecord {
            address: 0x81,
            endpoint_type: EndpointType::Bulk,
            direction: Direction::In,
            maximum_packet_size: 64,
            synchronization: None,
            usage: None,
            polling_interval: None,
            extra_data: Vec::new(),
        };
        let interface = InterfaceRecord {
            interface_number: 0,
            alternate_setting: 0,
            interface_class: 0x0b,
            interface_subclass: 0,
            interface_protocol: 0,
            endpoints: vec![endpoint.clone(), endpoint],
            extra_data: Vec::new(),
        };
        let config = ConfigRecord {
            active: true,
            configuration_value: 1,
            remote_wakeup: false,
            self_powered: false,
            max_power: 50,
            interfaces: vec![interface.clone(), interface],
            extra_data: Vec::new(),
        };
        assert_eq!(config.endpoint_count(), 4);
    }
}
