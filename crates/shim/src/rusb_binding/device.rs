//! rusb device wrapper
//!
//! Wraps a `rusb::Device` with its cached descriptor and converts it into
//! the platform records the shim consumes.

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use tracing::{debug, warn};
use usb_binding::{
    ConfigRecord, DeviceId, DeviceRecord, Direction, EndpointRecord, EndpointSynchronization,
    EndpointType, EndpointUsage, InterfaceRecord,
};

/// USB device known to the binding worker
pub struct RusbDevice {
    device: Device<Context>,
    id: DeviceId,
    descriptor: DeviceDescriptor,
}

impl RusbDevice {
    /// Reads and caches the device descriptor
    pub fn new(device: Device<Context>, id: DeviceId) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        Ok(Self {
            device,
            id,
            descriptor,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    /// Bus and address, the key of a physical device while it stays connected
    pub fn location(&self) -> (u8, u8) {
        (self.device.bus_number(), self.device.address())
    }

    /// Snapshot of the device as a platform record
    ///
    /// String descriptors are read through a temporary handle when the
    /// device can be opened; otherwise they stay unset.
    pub fn record(&self) -> DeviceRecord {
        let (manufacturer_name, product_name, serial_number) = match self.device.open() {
            Ok(handle) => self.read_string_descriptors(&handle),
            Err(e) => {
                debug!("Cannot open device {:?} to read strings: {}", self.id, e);
                (None, None, None)
            }
        };

        DeviceRecord {
            device: self.id,
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            version: Some(bcd_version(self.descriptor.device_version())),
            product_name,
            manufacturer_name,
            serial_number,
        }
    }

    /// Every configuration of the device, flagging the active one
    pub fn configurations(&self) -> Result<Vec<ConfigRecord>, rusb::Error> {
        let active_value = match self.device.active_config_descriptor() {
            Ok(config) => Some(config.number()),
            Err(e) => {
                warn!("No active configuration for device {:?}: {}", self.id, e);
                None
            }
        };

        (0..self.descriptor.num_configurations())
            .map(|index| {
                let config = self.device.config_descriptor(index)?;
                Ok(config_record(&config, active_value == Some(config.number())))
            })
            .collect()
    }

    pub fn open(&self) -> Result<DeviceHandle<Context>, rusb::Error> {
        self.device.open()
    }

    fn read_string_descriptors(
        &self,
        handle: &DeviceHandle<Context>,
    ) -> (Option<String>, Option<String>, Option<String>) {
        let read = |index: Option<u8>| {
            index.and_then(|idx| {
                handle
                    .read_string_descriptor_ascii(idx)
                    .map_err(|e| debug!("String descriptor {} unreadable: {}", idx, e))
                    .ok()
            })
        };

        (
            read(self.descriptor.manufacturer_string_index()),
            read(self.descriptor.product_string_index()),
            read(self.descriptor.serial_number_string_index()),
        )
    }
}

/// Whether a device passes the `0xVID:0xPID` filters; no filters allow all
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    let matches = |pattern: &str, value: u16| {
        pattern == "*"
            || u16::from_str_radix(pattern.trim_start_matches("0x").trim_start_matches("0X"), 16)
                .map(|v| v == value)
                .unwrap_or(false)
    };

    filters.iter().any(|filter| match filter.split_once(':') {
        Some((filter_vid, filter_pid)) => matches(filter_vid, vid) && matches(filter_pid, pid),
        None => false,
    })
}

/// Pack a rusb version back into its bcdDevice form
pub fn bcd_version(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor() & 0x0F) << 4)
        | u16::from(version.sub_minor() & 0x0F)
}

fn config_record(config: &rusb::ConfigDescriptor, active: bool) -> ConfigRecord {
    let interfaces = config
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .map(|descriptor| interface_record(&descriptor))
        .collect();

    ConfigRecord {
        active,
        configuration_value: config.number(),
        remote_wakeup: config.remote_wakeup(),
        self_powered: config.self_powered(),
        // rusb reports milliamps, the record carries bMaxPower units of 2 mA
        max_power: u8::try_from(config.max_power() / 2).unwrap_or(u8::MAX),
        interfaces,
        extra_data: Vec::new(),
    }
}

fn interface_record(descriptor: &rusb::InterfaceDescriptor) -> InterfaceRecord {
    InterfaceRecord {
        interface_number: descriptor.interface_number(),
        alternate_setting: descriptor.setting_number(),
        interface_class: descriptor.class_code(),
        interface_subclass: descriptor.sub_class_code(),
        interface_protocol: descriptor.protocol_code(),
        endpoints: descriptor
            .endpoint_descriptors()
            .map(|endpoint| endpoint_record(&endpoint))
            .collect(),
        extra_data: Vec::new(),
    }
}

fn endpoint_record(endpoint: &rusb::EndpointDescriptor) -> EndpointRecord {
    let endpoint_type = map_transfer_type(endpoint.transfer_type());
    let isochronous = endpoint_type == EndpointType::Isochronous;

    EndpointRecord {
        address: endpoint.address(),
        endpoint_type,
        direction: match endpoint.direction() {
            rusb::Direction::In => Direction::In,
            rusb::Direction::Out => Direction::Out,
        },
        maximum_packet_size: endpoint.max_packet_size(),
        synchronization: if isochronous {
            Some(map_sync_type(endpoint.sync_type()))
        } else {
            None
        },
        usage: if isochronous {
            Some(map_usage_type(endpoint.usage_type()))
        } else {
            None
        },
        polling_interval: match endpoint_type {
            EndpointType::Interrupt | EndpointType::Isochronous => Some(endpoint.interval()),
            _ => None,
        },
        extra_data: Vec::new(),
    }
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> EndpointType {
    match transfer_type {
        rusb::TransferType::Control => EndpointType::Control,
        rusb::TransferType::Isochronous => EndpointType::Isochronous,
        rusb::TransferType::Bulk => EndpointType::Bulk,
        rusb::TransferType::Interrupt => EndpointType::Interrupt,
    }
}

fn map_sync_type(sync_type: rusb::SyncType) -> EndpointSynchronization {
    match sync_type {
        rusb::SyncType::Asynchronous => EndpointSynchronization::Asynchronous,
        rusb::SyncType::Adaptive => EndpointSynchronization::Adaptive,
        rusb::SyncType::Synchronous => EndpointSynchronization::Synchronous,
        // The browser binding has no "none" synchronization
        rusb::SyncType::NoSync => EndpointSynchronization::Asynchronous,
    }
}

fn map_usage_type(usage_type: rusb::UsageType) -> EndpointUsage {
    match usage_type {
        rusb::UsageType::Data | rusb::UsageType::Reserved => EndpointUsage::Data,
        rusb::UsageType::Feedback => EndpointUsage::Feedback,
        rusb::UsageType::FeedbackData => EndpointUsage::ExplicitFeedback,
    }
}
