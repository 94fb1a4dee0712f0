//! Test utilities for libusb-shim
//!
//! Provides record builders and [`FakeBinding`], an in-memory platform
//! binding with scripted answers. Asynchronous transfers are parked until a
//! test completes them, so completion can be driven from any thread.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{FakeBinding, create_mock_device_record};
//! use usb_binding::UsbBinding;
//!
//! let binding = FakeBinding::new().with_devices(vec![create_mock_device_record(1, 0x1234, 0x5678)]);
//! let devices = binding.get_devices().into_result().unwrap();
//! assert_eq!(devices[0].vendor_id, 0x1234);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use usb_binding::{
    ConfigRecord, ConnectionHandle, ControlTransferInfo, DeviceId, DeviceRecord, Direction,
    EndpointRecord, EndpointSynchronization, EndpointType, EndpointUsage, GenericTransferInfo,
    InterfaceRecord, RequestResult, TransferCallback, TransferResultInfo, UsbBinding,
};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Offset added to a device id to form the connection handle of [`FakeBinding::open_device`]
pub const FAKE_CONNECTION_OFFSET: u32 = 100;

/// Create a mock DeviceRecord for testing
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_record;
///
/// let device = create_mock_device_record(1, 0x1234, 0x5678);
/// assert_eq!(device.device.0, 1);
/// assert_eq!(device.version, Some(0x0100));
/// ```
pub fn create_mock_device_record(id: u32, vendor_id: u16, product_id: u16) -> DeviceRecord {
    DeviceRecord {
        device: DeviceId(id),
        vendor_id,
        product_id,
        version: Some(0x0100),
        product_name: Some(format!("Test Product {}", id)),
        manufacturer_name: Some(format!("Test Manufacturer {}", id)),
        serial_number: Some(format!("SN{:06}", id)),
    }
}

/// Create a list of mock device records with unique ids starting at 1
pub fn create_mock_device_list(count: u32) -> Vec<DeviceRecord> {
    (1..=count)
        .map(|i| create_mock_device_record(i, 0x1000 + (i as u16), 0x2000 + (i as u16)))
        .collect()
}

fn direction_of(address: u8) -> Direction {
    if address & 0x80 != 0 {
        Direction::In
    } else {
        Direction::Out
    }
}

/// Bulk endpoint; direction follows bit 7 of `address`
pub fn create_mock_bulk_endpoint(address: u8, max_packet_size: u16) -> EndpointRecord {
    EndpointRecord {
        address,
        endpoint_type: EndpointType::Bulk,
        direction: direction_of(address),
        maximum_packet_size: max_packet_size,
        synchronization: None,
        usage: None,
        polling_interval: None,
        extra_data: Vec::new(),
    }
}

/// Interrupt endpoint with a polling interval
pub fn create_mock_interrupt_endpoint(address: u8, polling_interval: u8) -> EndpointRecord {
    EndpointRecord {
        endpoint_type: EndpointType::Interrupt,
        polling_interval: Some(polling_interval),
        ..create_mock_bulk_endpoint(address, 8)
    }
}

/// Isochronous endpoint with both synchronization and usage set
pub fn create_mock_isochronous_endpoint(
    address: u8,
    synchronization: EndpointSynchronization,
    usage: EndpointUsage,
) -> EndpointRecord {
    EndpointRecord {
        endpoint_type: EndpointType::Isochronous,
        synchronization: Some(synchronization),
        usage: Some(usage),
        polling_interval: Some(1),
        ..create_mock_bulk_endpoint(address, 1023)
    }
}

/// Vendor-specific interface with the given endpoints
pub fn create_mock_interface(interface_number: u8, endpoints: Vec<EndpointRecord>) -> InterfaceRecord {
    InterfaceRecord {
        interface_number,
        alternate_setting: 0,
        interface_class: 0xFF,
        interface_subclass: 0x00,
        interface_protocol: 0x00,
        endpoints,
        extra_data: Vec::new(),
    }
}

/// Bus-powered configuration drawing 100mA
pub fn create_mock_config(
    configuration_value: u8,
    active: bool,
    interfaces: Vec<InterfaceRecord>,
) -> ConfigRecord {
    ConfigRecord {
        active,
        configuration_value,
        remote_wakeup: false,
        self_powered: false,
        max_power: 50,
        interfaces,
        extra_data: Vec::new(),
    }
}

/// Active configuration with one interface holding a bulk IN/OUT pair
pub fn create_mock_bulk_config() -> ConfigRecord {
    create_mock_config(
        1,
        true,
        vec![create_mock_interface(
            0,
            vec![
                create_mock_bulk_endpoint(0x81, 512),
                create_mock_bulk_endpoint(0x02, 512),
            ],
        )],
    )
}

/// Create a mock USB device descriptor (GET_DESCRIPTOR Device response)
///
/// Returns a standard 18-byte device descriptor
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Create a mock control transfer setup packet
///
/// # Arguments
/// * `request_type` - bmRequestType
/// * `request` - bRequest
/// * `value` - wValue
/// * `index` - wIndex
/// * `length` - wLength
pub fn create_mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; 8] {
    [
        request_type,
        request,
        (value & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (index & 0xFF) as u8,
        ((index >> 8) & 0xFF) as u8,
        (length & 0xFF) as u8,
        ((length >> 8) & 0xFF) as u8,
    ]
}

/// A request observed by [`FakeBinding`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedRequest {
    Open(DeviceId),
    Close(ConnectionHandle),
    Claim(ConnectionHandle, u8),
    Release(ConnectionHandle, u8),
    Reset(ConnectionHandle),
    Control {
        connection: ConnectionHandle,
        info: ControlTransferInfo,
        asynchronous: bool,
    },
    Bulk {
        connection: ConnectionHandle,
        info: GenericTransferInfo,
        asynchronous: bool,
    },
    Interrupt {
        connection: ConnectionHandle,
        info: GenericTransferInfo,
        asynchronous: bool,
    },
}

struct FakeState {
    devices: RequestResult<Vec<DeviceRecord>>,
    configurations: HashMap<DeviceId, RequestResult<Vec<ConfigRecord>>>,
    open_result: Option<RequestResult<ConnectionHandle>>,
    close_result: RequestResult<()>,
    interface_result: RequestResult<()>,
    reset_result: RequestResult<()>,
    sync_results: VecDeque<RequestResult<TransferResultInfo>>,
    auto_complete: Option<RequestResult<TransferResultInfo>>,
    requests: Vec<RecordedRequest>,
    pending: VecDeque<TransferCallback>,
}

/// Scriptable in-memory platform binding
///
/// Every call is recorded. Synchronous transfers pop the next result queued
/// with [`push_transfer_result`](Self::push_transfer_result) and fail when
/// the queue is empty. Asynchronous transfers park their callback until
/// [`complete_next`](Self::complete_next) runs, unless auto completion is on.
pub struct FakeBinding {
    state: Mutex<FakeState>,
}

impl Default for FakeBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBinding {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                devices: RequestResult::succeeded(Vec::new()),
                configurations: HashMap::new(),
                open_result: None,
                close_result: RequestResult::succeeded(()),
                interface_result: RequestResult::succeeded(()),
                reset_result: RequestResult::succeeded(()),
                sync_results: VecDeque::new(),
                auto_complete: None,
                requests: Vec::new(),
                pending: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake binding state poisoned")
    }

    /// Builder form of [`set_devices`](Self::set_devices)
    pub fn with_devices(self, devices: Vec<DeviceRecord>) -> Self {
        self.set_devices(devices);
        self
    }

    /// Builder form of [`set_configurations`](Self::set_configurations)
    pub fn with_configurations(self, device: DeviceId, configs: Vec<ConfigRecord>) -> Self {
        self.set_configurations(device, configs);
        self
    }

    pub fn set_devices(&self, devices: Vec<DeviceRecord>) {
        self.lock().devices = RequestResult::succeeded(devices);
    }

    pub fn set_devices_result(&self, result: RequestResult<Vec<DeviceRecord>>) {
        self.lock().devices = result;
    }

    pub fn set_configurations(&self, device: DeviceId, configs: Vec<ConfigRecord>) {
        self.lock()
            .configurations
            .insert(device, RequestResult::succeeded(configs));
    }

    pub fn set_configurations_result(
        &self,
        device: DeviceId,
        result: RequestResult<Vec<ConfigRecord>>,
    ) {
        self.lock().configurations.insert(device, result);
    }

    /// Override the connection handed out by `open_device`
    pub fn set_open_result(&self, result: RequestResult<ConnectionHandle>) {
        self.lock().open_result = Some(result);
    }

    pub fn set_close_result(&self, result: RequestResult<()>) {
        self.lock().close_result = result;
    }

    /// Result of both claim and release
    pub fn set_interface_result(&self, result: RequestResult<()>) {
        self.lock().interface_result = result;
    }

    pub fn set_reset_result(&self, result: RequestResult<()>) {
        self.lock().reset_result = result;
    }

    /// Queue the answer of the next synchronous transfer
    pub fn push_transfer_result(&self, result: RequestResult<TransferResultInfo>) {
        self.lock().sync_results.push_back(result);
    }

    /// Complete asynchronous transfers inline with `result` instead of parking them
    pub fn set_auto_complete(&self, result: Option<RequestResult<TransferResultInfo>>) {
        self.lock().auto_complete = result;
    }

    /// Snapshot of every request seen so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.lock().requests.last().cloned()
    }

    /// Number of asynchronous transfers waiting for completion
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Complete the oldest parked transfer with `result`
    ///
    /// The callback runs on the calling thread, outside the internal lock.
    /// Returns false when nothing was pending.
    pub fn complete_next(&self, result: RequestResult<TransferResultInfo>) -> bool {
        let callback = self.lock().pending.pop_front();
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    fn record(&self, request: RecordedRequest) {
        self.lock().requests.push(request);
    }

    fn next_sync_result(&self) -> RequestResult<TransferResultInfo> {
        self.lock()
            .sync_results
            .pop_front()
            .unwrap_or_else(|| RequestResult::failed("no scripted transfer result"))
    }

    fn park_or_complete(&self, callback: TransferCallback) {
        let inline = {
            let mut state = self.lock();
            match state.auto_complete.clone() {
                Some(result) => Some((callback, result)),
                None => {
                    state.pending.push_back(callback);
                    None
                }
            }
        };
        if let Some((callback, result)) = inline {
            callback(result);
        }
    }
}

impl UsbBinding for FakeBinding {
    fn get_devices(&self) -> RequestResult<Vec<DeviceRecord>> {
        self.lock().devices.clone()
    }

    fn get_configurations(&self, device: &DeviceRecord) -> RequestResult<Vec<ConfigRecord>> {
        self.lock()
            .configurations
            .get(&device.device)
            .cloned()
            .unwrap_or_else(|| RequestResult::failed("unknown device"))
    }

    fn open_device(&self, device: &DeviceRecord) -> RequestResult<ConnectionHandle> {
        let mut state = self.lock();
        state.requests.push(RecordedRequest::Open(device.device));
        state.open_result.clone().unwrap_or_else(|| {
            RequestResult::succeeded(ConnectionHandle(device.device.0 + FAKE_CONNECTION_OFFSET))
        })
    }

    fn close_device(&self, connection: ConnectionHandle) -> RequestResult<()> {
        let mut state = self.lock();
        state.requests.push(RecordedRequest::Close(connection));
        state.close_result.clone()
    }

    fn claim_interface(&self, connection: ConnectionHandle, interface_number: u8) -> RequestResult<()> {
        let mut state = self.lock();
        state
            .requests
            .push(RecordedRequest::Claim(connection, interface_number));
        state.interface_result.clone()
    }

    fn release_interface(
        &self,
        connection: ConnectionHandle,
        interface_number: u8,
    ) -> RequestResult<()> {
        let mut state = self.lock();
        state
            .requests
            .push(RecordedRequest::Release(connection, interface_number));
        state.interface_result.clone()
    }

    fn reset_device(&self, connection: ConnectionHandle) -> RequestResult<()> {
        let mut state = self.lock();
        state.requests.push(RecordedRequest::Reset(connection));
        state.reset_result.clone()
    }

    fn control_transfer(
        &self,
        connection: ConnectionHandle,
        info: ControlTransferInfo,
    ) -> RequestResult<TransferResultInfo> {
        self.record(RecordedRequest::Control {
            connection,
            info,
            asynchronous: false,
        });
        self.next_sync_result()
    }

    fn bulk_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
    ) -> RequestResult<TransferResultInfo> {
        self.record(RecordedRequest::Bulk {
            connection,
            info,
            asynchronous: false,
        });
        self.next_sync_result()
    }

    fn interrupt_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
    ) -> RequestResult<TransferResultInfo> {
        self.record(RecordedRequest::Interrupt {
            connection,
            info,
            asynchronous: false,
        });
        self.next_sync_result()
    }

    fn async_control_transfer(
        &self,
        connection: ConnectionHandle,
        info: ControlTransferInfo,
        callback: TransferCallback,
    ) {
        self.record(RecordedRequest::Control {
            connection,
            info,
            asynchronous: true,
        });
        self.park_or_complete(callback);
    }

    fn async_bulk_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
        callback: TransferCallback,
    ) {
        self.record(RecordedRequest::Bulk {
            connection,
            info,
            asynchronous: true,
        });
        self.park_or_complete(callback);
    }

    fn async_interrupt_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
        callback: TransferCallback,
    ) {
        self.record(RecordedRequest::Interrupt {
            connection,
            info,
            asynchronous: true,
        });
        self.park_or_complete(callback);
    }
}
