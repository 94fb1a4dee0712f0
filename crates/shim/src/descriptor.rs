//! Descriptor translation
//!
//! Converts the platform's device and configuration records into the
//! fixed-layout libusb descriptor structures. A configuration descriptor is
//! one owning tree (config → interfaces → alternate settings → endpoints,
//! each level with its `extra` bytes), so dropping the root releases all of
//! it.
//!
//! Length fields always hold the structure size, never a wire length, and
//! the device string indexes stay zero because the platform reports
//! resolved strings rather than string descriptor indexes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::Cursor;
use thiserror::Error;
use usb_binding::{
    ConfigRecord, DeviceRecord, EndpointRecord, EndpointSynchronization, EndpointType,
    EndpointUsage, InterfaceRecord,
};

pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;

pub const DEVICE_DESCRIPTOR_SIZE: u8 = 18;
pub const CONFIG_DESCRIPTOR_SIZE: u8 = 9;
pub const INTERFACE_DESCRIPTOR_SIZE: u8 = 9;
pub const ENDPOINT_DESCRIPTOR_SIZE: u8 = 7;

/// `bmAttributes` bit of a configuration supporting remote wakeup
pub const CONFIG_ATTR_REMOTE_WAKEUP: u8 = 1 << 5;
/// `bmAttributes` bit of a self powered configuration
pub const CONFIG_ATTR_SELF_POWERED: u8 = 1 << 6;

const TRANSFER_TYPE_SHIFT: u8 = 0;
const TRANSFER_TYPE_MASK: u8 = 0x03;
const ISO_SYNC_TYPE_SHIFT: u8 = 2;
const ISO_SYNC_TYPE_MASK: u8 = 0x0c;
const ISO_USAGE_TYPE_SHIFT: u8 = 4;
const ISO_USAGE_TYPE_MASK: u8 = 0x30;

/// Why no active configuration descriptor could be produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActiveConfigError {
    #[error("no active configuration reported")]
    NoActiveConfig,

    #[error("{0} configurations reported as active")]
    MultipleActiveConfigs(usize),
}

/// Standard device descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    /// Wire form of the descriptor (18 bytes, little endian)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DEVICE_DESCRIPTOR_SIZE as usize);
        out.push(self.b_length);
        out.push(self.b_descriptor_type);
        // Writes into a Vec cannot fail
        let _ = out.write_u16::<LittleEndian>(self.bcd_usb);
        out.push(self.b_device_class);
        out.push(self.b_device_sub_class);
        out.push(self.b_device_protocol);
        out.push(self.b_max_packet_size0);
        let _ = out.write_u16::<LittleEndian>(self.id_vendor);
        let _ = out.write_u16::<LittleEndian>(self.id_product);
        let _ = out.write_u16::<LittleEndian>(self.bcd_device);
        out.push(self.i_manufacturer);
        out.push(self.i_product);
        out.push(self.i_serial_number);
        out.push(self.b_num_configurations);
        out
    }

    /// Parse a device descriptor as returned by GET_DESCRIPTOR
    ///
    /// Returns `None` when fewer than 18 bytes are available or the
    /// descriptor type is not DEVICE.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DEVICE_DESCRIPTOR_SIZE as usize || bytes[1] != DT_DEVICE {
            return None;
        }
        let mut cursor = Cursor::new(bytes);
        Some(Self {
            b_length: cursor.read_u8().ok()?,
            b_descriptor_type: cursor.read_u8().ok()?,
            bcd_usb: cursor.read_u16::<LittleEndian>().ok()?,
            b_device_class: cursor.read_u8().ok()?,
            b_device_sub_class: cursor.read_u8().ok()?,
            b_device_protocol: cursor.read_u8().ok()?,
            b_max_packet_size0: cursor.read_u8().ok()?,
            id_vendor: cursor.read_u16::<LittleEndian>().ok()?,
            id_product: cursor.read_u16::<LittleEndian>().ok()?,
            bcd_device: cursor.read_u16::<LittleEndian>().ok()?,
            i_manufacturer: cursor.read_u8().ok()?,
            i_product: cursor.read_u8().ok()?,
            i_serial_number: cursor.read_u8().ok()?,
            b_num_configurations: cursor.read_u8().ok()?,
        })
    }
}

/// Standard endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
    pub b_refresh: u8,
    pub b_synch_address: u8,
    pub extra: Vec<u8>,
}

/// Standard interface descriptor (one alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
    pub endpoints: Vec<EndpointDescriptor>,
    pub extra: Vec<u8>,
}

/// Interface with its alternate settings
///
/// The platform exposes no alternate settings, so there is always exactly
/// one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interface {
    pub altsettings: Vec<InterfaceDescriptor>,
}

impl Interface {
    pub fn num_altsetting(&self) -> usize {
        self.altsettings.len()
    }
}

/// Standard configuration descriptor and everything nested in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub max_power: u8,
    pub interfaces: Vec<Interface>,
    pub extra: Vec<u8>,
}

/// Transfer type, synchronization and usage held by an endpoint's `bmAttributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAttributes {
    pub transfer_type: EndpointType,
    /// Isochronous endpoints only
    pub synchronization: Option<EndpointSynchronization>,
    /// Isochronous endpoints only
    pub usage: Option<EndpointUsage>,
}

fn transfer_type_bits(value: EndpointType) -> u8 {
    match value {
        EndpointType::Control => 0,
        EndpointType::Isochronous => 1,
        EndpointType::Bulk => 2,
        EndpointType::Interrupt => 3,
    }
}

fn sync_type_bits(value: EndpointSynchronization) -> u8 {
    match value {
        EndpointSynchronization::Asynchronous => 1,
        EndpointSynchronization::Adaptive => 2,
        EndpointSynchronization::Synchronous => 3,
    }
}

fn usage_type_bits(value: EndpointUsage) -> u8 {
    match value {
        EndpointUsage::Data => 0,
        EndpointUsage::Feedback => 1,
        // libusb calls this one "implicit feedback"
        EndpointUsage::ExplicitFeedback => 2,
    }
}

/// Pack endpoint attributes into a `bmAttributes` byte
///
/// Synchronization and usage only count for isochronous endpoints.
///
/// # Panics
/// When an isochronous endpoint lacks its synchronization or usage type.
pub fn pack_endpoint_attributes(attributes: EndpointAttributes) -> u8 {
    let mut bits = transfer_type_bits(attributes.transfer_type) << TRANSFER_TYPE_SHIFT;
    if attributes.transfer_type == EndpointType::Isochronous {
        let sync = attributes
            .synchronization
            .expect("isochronous endpoint without synchronization type");
        let usage = attributes
            .usage
            .expect("isochronous endpoint without usage type");
        bits |= sync_type_bits(sync) << ISO_SYNC_TYPE_SHIFT;
        bits |= usage_type_bits(usage) << ISO_USAGE_TYPE_SHIFT;
    }
    bits
}

/// Inverse of [`pack_endpoint_attributes`]
///
/// Sync and usage codes without a platform counterpart (sync "none", usage
/// "reserved") come back as `None`.
pub fn unpack_endpoint_attributes(bm_attributes: u8) -> EndpointAttributes {
    let transfer_type = match (bm_attributes & TRANSFER_TYPE_MASK) >> TRANSFER_TYPE_SHIFT {
        0 => EndpointType::Control,
        1 => EndpointType::Isochronous,
        2 => EndpointType::Bulk,
        _ => EndpointType::Interrupt,
    };
    if transfer_type != EndpointType::Isochronous {
        return EndpointAttributes {
            transfer_type,
            synchronization: None,
            usage: None,
        };
    }

    let synchronization = match (bm_attributes & ISO_SYNC_TYPE_MASK) >> ISO_SYNC_TYPE_SHIFT {
        1 => Some(EndpointSynchronization::Asynchronous),
        2 => Some(EndpointSynchronization::Adaptive),
        3 => Some(EndpointSynchronization::Synchronous),
        _ => None,
    };
    let usage = match (bm_attributes & ISO_USAGE_TYPE_MASK) >> ISO_USAGE_TYPE_SHIFT {
        0 => Some(EndpointUsage::Data),
        1 => Some(EndpointUsage::Feedback),
        2 => Some(EndpointUsage::ExplicitFeedback),
        _ => None,
    };
    EndpointAttributes {
        transfer_type,
        synchronization,
        usage,
    }
}

/// Descriptor counts are single bytes; a larger record is malformed
fn count_u8(len: usize, what: &str) -> u8 {
    u8::try_from(len).unwrap_or_else(|_| panic!("{} {} do not fit a descriptor count", len, what))
}

pub fn endpoint_descriptor(record: &EndpointRecord) -> EndpointDescriptor {
    EndpointDescriptor {
        b_length: ENDPOINT_DESCRIPTOR_SIZE,
        b_descriptor_type: DT_ENDPOINT,
        b_endpoint_address: record.address,
        bm_attributes: pack_endpoint_attributes(EndpointAttributes {
            transfer_type: record.endpoint_type,
            synchronization: record.synchronization,
            usage: record.usage,
        }),
        w_max_packet_size: record.maximum_packet_size,
        b_interval: record.polling_interval.unwrap_or(0),
        b_refresh: 0,
        b_synch_address: 0,
        extra: record.extra_data.clone(),
    }
}

pub fn interface_descriptor(record: &InterfaceRecord) -> InterfaceDescriptor {
    InterfaceDescriptor {
        b_length: INTERFACE_DESCRIPTOR_SIZE,
        b_descriptor_type: DT_INTERFACE,
        b_interface_number: record.interface_number,
        b_alternate_setting: record.alternate_setting,
        b_num_endpoints: count_u8(record.endpoints.len(), "endpoints"),
        b_interface_class: record.interface_class,
        b_interface_sub_class: record.interface_subclass,
        b_interface_protocol: record.interface_protocol,
        i_interface: 0,
        endpoints: record.endpoints.iter().map(endpoint_descriptor).collect(),
        extra: record.extra_data.clone(),
    }
}

pub fn interface(record: &InterfaceRecord) -> Interface {
    Interface {
        altsettings: vec![interface_descriptor(record)],
    }
}

pub fn config_descriptor(record: &ConfigRecord) -> ConfigDescriptor {
    let mut bm_attributes = 0;
    if record.remote_wakeup {
        bm_attributes |= CONFIG_ATTR_REMOTE_WAKEUP;
    }
    if record.self_powered {
        bm_attributes |= CONFIG_ATTR_SELF_POWERED;
    }

    ConfigDescriptor {
        b_length: CONFIG_DESCRIPTOR_SIZE,
        b_descriptor_type: DT_CONFIG,
        w_total_length: CONFIG_DESCRIPTOR_SIZE as u16,
        b_num_interfaces: count_u8(record.interfaces.len(), "interfaces"),
        b_configuration_value: record.configuration_value,
        i_configuration: 0,
        bm_attributes,
        max_power: record.max_power,
        interfaces: record.interfaces.iter().map(interface).collect(),
        extra: record.extra_data.clone(),
    }
}

/// Device descriptor of a device record
///
/// Only the ids and `bcd_device` (when the platform reports a version) are
/// known; everything else is zero.
pub fn device_descriptor(record: &DeviceRecord) -> DeviceDescriptor {
    DeviceDescriptor {
        b_length: DEVICE_DESCRIPTOR_SIZE,
        b_descriptor_type: DT_DEVICE,
        bcd_usb: 0,
        b_device_class: 0,
        b_device_sub_class: 0,
        b_device_protocol: 0,
        b_max_packet_size0: 0,
        id_vendor: record.vendor_id,
        id_product: record.product_id,
        bcd_device: record.version.unwrap_or(0),
        i_manufacturer: 0,
        i_product: 0,
        i_serial_number: 0,
        b_num_configurations: 0,
    }
}

/// Translate the single active configuration among `records`
pub fn select_active_config(
    records: &[ConfigRecord],
) -> Result<ConfigDescriptor, ActiveConfigError> {
    let mut active = records.iter().filter(|record| record.active);
    match (active.next(), active.next()) {
        (Some(record), None) => Ok(config_descriptor(record)),
        (None, _) => Err(ActiveConfigError::NoActiveConfig),
        (Some(_), Some(_)) => Err(ActiveConfigError::MultipleActiveConfigs(
            records.iter().filter(|record| record.active).count(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        create_mock_bulk_config, create_mock_bulk_endpoint, create_mock_config,
        create_mock_device_descriptor, create_mock_device_record, create_mock_interface,
        create_mock_interrupt_endpoint, create_mock_isochronous_endpoint,
    };
    use proptest::prelude::*;

    #[test]
    fn test_endpoint_descriptor_bulk() {
        let mut record = create_mock_bulk_endpoint(0x81, 512);
        record.extra_data = vec![0xAB];
        let desc = endpoint_descriptor(&record);

        assert_eq!(desc.b_length, 7);
        assert_eq!(desc.b_descriptor_type, DT_ENDPOINT);
        assert_eq!(desc.b_endpoint_address, 0x81);
        assert_eq!(desc.bm_attributes, 0x02);
        assert_eq!(desc.w_max_packet_size, 512);
        assert_eq!(desc.b_interval, 0);
        assert_eq!(desc.extra, vec![0xAB]);
    }

    #[test]
    fn test_endpoint_descriptor_interrupt_interval() {
        let desc = endpoint_descriptor(&create_mock_interrupt_endpoint(0x83, 10));
        assert_eq!(desc.bm_attributes, 0x03);
        assert_eq!(desc.b_interval, 10);
    }

    #[test]
    fn test_endpoint_descriptor_isochronous_bits() {
        let record = create_mock_isochronous_endpoint(
            0x84,
            EndpointSynchronization::Adaptive,
            EndpointUsage::ExplicitFeedback,
        );
        let desc = endpoint_descriptor(&record);
        // type 1, sync 2 << 2, usage 2 << 4
        assert_eq!(desc.bm_attributes, 0x01 | 0x08 | 0x20);
    }

    #[test]
    fn test_non_isochronous_ignores_sync_and_usage() {
        let mut record = create_mock_bulk_endpoint(0x02, 64);
        record.synchronization = Some(EndpointSynchronization::Synchronous);
        record.usage = Some(EndpointUsage::Feedback);
        assert_eq!(endpoint_descriptor(&record).bm_attributes, 0x02);
    }

    #[test]
    #[should_panic(expected = "without synchronization")]
    fn test_isochronous_without_sync_panics() {
        let mut record = create_mock_isochronous_endpoint(
            0x84,
            EndpointSynchronization::Asynchronous,
            EndpointUsage::Data,
        );
        record.synchronization = None;
        endpoint_descriptor(&record);
    }

    #[test]
    #[should_panic(expected = "without usage")]
    fn test_isochronous_without_usage_panics() {
        let mut record = create_mock_isochronous_endpoint(
            0x84,
            EndpointSynchronization::Asynchronous,
            EndpointUsage::Data,
        );
        record.usage = None;
        endpoint_descriptor(&record);
    }

    #[test]
    fn test_unpack_unknown_iso_codes() {
        // isochronous, sync "none", usage "reserved"
        let attributes = unpack_endpoint_attributes(0x01 | 0x30);
        assert_eq!(attributes.transfer_type, EndpointType::Isochronous);
        assert_eq!(attributes.synchronization, None);
        assert_eq!(attributes.usage, None);
    }

    fn any_endpoint_type() -> impl Strategy<Value = EndpointType> {
        prop_oneof![
            Just(EndpointType::Control),
            Just(EndpointType::Interrupt),
            Just(EndpointType::Isochronous),
            Just(EndpointType::Bulk),
        ]
    }

    fn any_sync() -> impl Strategy<Value = EndpointSynchronization> {
        prop_oneof![
            Just(EndpointSynchronization::Asynchronous),
            Just(EndpointSynchronization::Adaptive),
            Just(EndpointSynchronization::Synchronous),
        ]
    }

    fn any_usage() -> impl Strategy<Value = EndpointUsage> {
        prop_oneof![
            Just(EndpointUsage::Data),
            Just(EndpointUsage::Feedback),
            Just(EndpointUsage::ExplicitFeedback),
        ]
    }

    proptest! {
        #[test]
        fn prop_endpoint_attributes_roundtrip(
            transfer_type in any_endpoint_type(),
            sync in any_sync(),
            usage in any_usage(),
        ) {
            let iso = transfer_type == EndpointType::Isochronous;
            let attributes = EndpointAttributes {
                transfer_type,
                synchronization: iso.then_some(sync),
                usage: iso.then_some(usage),
            };
            let packed = pack_endpoint_attributes(attributes);
            prop_assert_eq!(packed & 0xC0, 0);
            prop_assert_eq!(unpack_endpoint_attributes(packed), attributes);
        }
    }

    #[test]
    fn test_interface_has_single_altsetting() {
        let mut record = create_mock_interface(
            2,
            vec![
                create_mock_bulk_endpoint(0x81, 64),
                create_mock_bulk_endpoint(0x01, 64),
            ],
        );
        record.extra_data = vec![9, 33, 1];
        let iface = interface(&record);

        assert_eq!(iface.num_altsetting(), 1);
        let alt = &iface.altsettings[0];
        assert_eq!(alt.b_length, 9);
        assert_eq!(alt.b_descriptor_type, DT_INTERFACE);
        assert_eq!(alt.b_interface_number, 2);
        assert_eq!(alt.b_num_endpoints, 2);
        assert_eq!(alt.b_interface_class, 0xFF);
        assert_eq!(alt.endpoints.len(), 2);
        assert_eq!(alt.extra, vec![9, 33, 1]);
    }

    #[test]
    fn test_interface_with_255_endpoints() {
        let record = create_mock_interface(0, vec![create_mock_bulk_endpoint(0x81, 64); 255]);
        assert_eq!(interface(&record).altsettings[0].b_num_endpoints, 255);
    }

    #[test]
    #[should_panic(expected = "256 endpoints do not fit a descriptor count")]
    fn test_too_many_endpoints_panics() {
        let record = create_mock_interface(0, vec![create_mock_bulk_endpoint(0x81, 64); 256]);
        interface(&record);
    }

    #[test]
    fn test_config_descriptor_fields() {
        let mut record = create_mock_bulk_config();
        record.remote_wakeup = true;
        record.self_powered = true;
        record.max_power = 250;
        record.extra_data = vec![1, 2];

        let desc = config_descriptor(&record);
        assert_eq!(desc.b_length, 9);
        assert_eq!(desc.b_descriptor_type, DT_CONFIG);
        assert_eq!(desc.w_total_length, 9);
        assert_eq!(desc.b_num_interfaces, 1);
        assert_eq!(desc.b_configuration_value, 1);
        assert_eq!(desc.bm_attributes, 0x60);
        assert_eq!(desc.max_power, 250);
        assert_eq!(desc.extra, vec![1, 2]);
    }

    #[test]
    fn test_config_attributes_individual_bits() {
        let mut record = create_mock_config(1, true, Vec::new());
        record.remote_wakeup = true;
        assert_eq!(config_descriptor(&record).bm_attributes, CONFIG_ATTR_REMOTE_WAKEUP);

        record.remote_wakeup = false;
        record.self_powered = true;
        assert_eq!(config_descriptor(&record).bm_attributes, CONFIG_ATTR_SELF_POWERED);
    }

    #[test]
    fn test_select_active_config_picks_the_active_one() {
        let records = vec![
            create_mock_config(1, false, Vec::new()),
            create_mock_config(2, true, Vec::new()),
            create_mock_config(3, false, Vec::new()),
        ];
        let desc = select_active_config(&records).unwrap();
        assert_eq!(desc.b_configuration_value, 2);
    }

    #[test]
    fn test_select_active_config_none_active() {
        let records = vec![create_mock_config(1, false, Vec::new())];
        assert_eq!(
            select_active_config(&records),
            Err(ActiveConfigError::NoActiveConfig)
        );
        assert_eq!(
            select_active_config(&[]),
            Err(ActiveConfigError::NoActiveConfig)
        );
    }

    #[test]
    fn test_select_active_config_two_active() {
        let records = vec![
            create_mock_config(1, true, Vec::new()),
            create_mock_config(2, true, Vec::new()),
        ];
        assert_eq!(
            select_active_config(&records),
            Err(ActiveConfigError::MultipleActiveConfigs(2))
        );
    }

    #[test]
    fn test_device_descriptor_string_indexes_zero() {
        let desc = device_descriptor(&create_mock_device_record(5, 0x1234, 0x5678));
        assert_eq!(desc.b_length, 18);
        assert_eq!(desc.b_descriptor_type, DT_DEVICE);
        assert_eq!(desc.id_vendor, 0x1234);
        assert_eq!(desc.id_product, 0x5678);
        assert_eq!(desc.bcd_device, 0x0100);
        assert_eq!(desc.i_manufacturer, 0);
        assert_eq!(desc.i_product, 0);
        assert_eq!(desc.i_serial_number, 0);
    }

    #[test]
    fn test_device_descriptor_without_version() {
        let mut record = create_mock_device_record(5, 1, 2);
        record.version = None;
        assert_eq!(device_descriptor(&record).bcd_device, 0);
    }

    #[test]
    fn test_device_descriptor_wire_form() {
        let raw = create_mock_device_descriptor();
        let desc = DeviceDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.bcd_usb, 0x0200);
        assert_eq!(desc.id_vendor, 0x1234);
        assert_eq!(desc.id_product, 0x5678);
        assert_eq!(desc.i_serial_number, 3);
        assert_eq!(desc.to_bytes(), raw);

        assert!(DeviceDescriptor::parse(&raw[..17]).is_none());
    }
}
