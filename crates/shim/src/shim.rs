//! libusb facade
//!
//! [`LibusbShim`] exposes the libusb host API on top of a [`UsbBinding`].
//! Synchronous calls go straight to the binding. Asynchronous transfers are
//! registered with the tracker of their context, dispatched with a
//! completion callback that delivers into that tracker, and finalized on the
//! thread that calls [`LibusbShim::handle_events`].
//!
//! Every entry point taking a context accepts `None` for the default
//! context, which lives as long as the shim.

use crate::context::Context;
use crate::descriptor::{self, ConfigDescriptor, DeviceDescriptor};
use crate::device::{Device, DeviceHandle};
use crate::error::{LibusbError, Result};
use crate::request::{self, ControlSetup};
use crate::transfer::{Transfer, TransferFlags, TransferStatus, TransferType};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, warn};
use usb_binding::{
    ControlTransferInfo, GenericTransferInfo, RequestResult, TransferResultInfo, UsbBinding,
};

/// Bus number reported for every device
pub const FAKE_BUS_NUMBER: u8 = 42;

/// Wait of [`LibusbShim::handle_events`] unless configured otherwise
pub const DEFAULT_HANDLE_EVENTS_TIMEOUT: Duration = Duration::from_secs(60);

enum PlatformRequest {
    Control(ControlTransferInfo),
    Bulk(GenericTransferInfo),
    Interrupt(GenericTransferInfo),
}

/// Outcome of applying a platform transfer result to a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedResult {
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// Apply a platform transfer result to the destination buffer
///
/// A missing or non-success result code is an error and leaves `dest`
/// untouched. Otherwise `min(response, requested)` bytes are copied; a
/// success without response bytes (OUT transfers) counts as `requested`.
/// With `short_not_ok`, fewer bytes than requested is an error even though
/// the bytes were copied.
pub fn apply_transfer_result(
    info: &TransferResultInfo,
    short_not_ok: bool,
    requested: usize,
    dest: &mut [u8],
) -> AppliedResult {
    if !info.is_success() {
        return AppliedResult {
            status: TransferStatus::Error,
            actual_length: 0,
        };
    }

    let actual_length = match &info.data {
        Some(data) => {
            let count = data.len().min(requested);
            let copied = count.min(dest.len());
            dest[..copied].copy_from_slice(&data[..copied]);
            count
        }
        None => requested,
    };

    let status = if short_not_ok && actual_length < requested {
        TransferStatus::Error
    } else {
        TransferStatus::Completed
    };
    AppliedResult {
        status,
        actual_length,
    }
}

fn status_to_result(applied: AppliedResult) -> Result<usize> {
    match applied.status {
        TransferStatus::Completed => Ok(applied.actual_length),
        TransferStatus::TimedOut => Err(LibusbError::Timeout),
        _ => Err(LibusbError::Other),
    }
}

/// libusb host API over a platform USB binding
pub struct LibusbShim {
    binding: Arc<dyn UsbBinding>,
    default_context: OnceLock<Arc<Context>>,
    handle_events_timeout: Duration,
}

impl LibusbShim {
    pub fn new(binding: Arc<dyn UsbBinding>) -> Self {
        Self {
            binding,
            default_context: OnceLock::new(),
            handle_events_timeout: DEFAULT_HANDLE_EVENTS_TIMEOUT,
        }
    }

    /// Override the wait of [`handle_events`](Self::handle_events)
    pub fn with_handle_events_timeout(mut self, timeout: Duration) -> Self {
        self.handle_events_timeout = timeout;
        self
    }

    pub fn binding(&self) -> &Arc<dyn UsbBinding> {
        &self.binding
    }

    /// The default context, created on first use
    pub fn default_context(&self) -> &Arc<Context> {
        self.default_context.get_or_init(|| {
            debug!("Creating default libusb context");
            Context::new()
        })
    }

    fn resolve_context<'a>(&'a self, context: Option<&'a Arc<Context>>) -> &'a Arc<Context> {
        match context {
            Some(context) => context,
            None => self.default_context(),
        }
    }

    fn handle_context(&self, dev_handle: &DeviceHandle) -> Arc<Context> {
        Arc::clone(self.resolve_context(dev_handle.device().context()))
    }

    fn transfer_context(&self, transfer: &Transfer) -> Option<Arc<Context>> {
        let dev_handle = transfer.lock().dev_handle.clone()?;
        Some(self.handle_context(&dev_handle))
    }

    fn check_upstream<T>(&self, operation: &str, result: RequestResult<T>) -> Result<T> {
        match result {
            RequestResult::Succeeded { payload } => Ok(payload),
            other => {
                warn!("{} request failed: {}", operation, other.error_message());
                Err(LibusbError::Other)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Devices
    // ---------------------------------------------------------------------

    /// Enumerate devices; each entry starts with one reference
    pub fn get_device_list(&self, context: Option<&Arc<Context>>) -> Result<Vec<Arc<Device>>> {
        let records = self.check_upstream("get_device_list", self.binding.get_devices())?;
        debug!("Enumerated {} devices", records.len());
        Ok(records
            .into_iter()
            .map(|record| Device::new(context.cloned(), record))
            .collect())
    }

    pub fn free_device_list(&self, devices: Vec<Arc<Device>>, unref_devices: bool) {
        if unref_devices {
            for device in &devices {
                self.unref_device(device);
            }
        }
    }

    pub fn ref_device(&self, device: &Arc<Device>) -> Arc<Device> {
        device.add_ref();
        Arc::clone(device)
    }

    /// # Panics
    /// When the device has no references left.
    pub fn unref_device(&self, device: &Device) {
        device.release();
    }

    /// Descriptor tree of the device's active configuration
    pub fn get_active_config_descriptor(&self, device: &Device) -> Result<Box<ConfigDescriptor>> {
        let records = self.check_upstream(
            "get_active_config_descriptor",
            self.binding.get_configurations(device.record()),
        )?;
        match descriptor::select_active_config(&records) {
            Ok(config) => Ok(Box::new(config)),
            Err(e) => {
                warn!(
                    "get_active_config_descriptor request failed for device {:?}: {}",
                    device.record().device,
                    e
                );
                Err(LibusbError::Other)
            }
        }
    }

    /// Releases a descriptor tree and everything nested in it
    pub fn free_config_descriptor(&self, config: Option<Box<ConfigDescriptor>>) {
        drop(config);
    }

    pub fn get_device_descriptor(&self, device: &Device) -> Result<DeviceDescriptor> {
        Ok(descriptor::device_descriptor(device.record()))
    }

    pub fn get_bus_number(&self, _device: &Device) -> u8 {
        FAKE_BUS_NUMBER
    }

    /// Address derived from the platform device id
    ///
    /// # Panics
    /// When the device id is 255 or more; 255 is not a valid address.
    pub fn get_device_address(&self, device: &Device) -> u8 {
        let id = device.record().device.0;
        match u8::try_from(id) {
            Ok(address) if address < u8::MAX => address,
            _ => panic!("device id {} does not fit a device address", id),
        }
    }

    // ---------------------------------------------------------------------
    // Device handles
    // ---------------------------------------------------------------------

    pub fn open(&self, device: &Arc<Device>) -> Result<Arc<DeviceHandle>> {
        let connection = self.check_upstream("open", self.binding.open_device(device.record()))?;
        debug!(
            "Opened device {:?} as connection {:?}",
            device.record().device,
            connection
        );
        Ok(DeviceHandle::new(Arc::clone(device), connection))
    }

    /// Close a handle
    ///
    /// A platform failure is only logged: this runs during teardown.
    ///
    /// # Panics
    /// When the handle was already closed.
    pub fn close(&self, dev_handle: &DeviceHandle) {
        dev_handle.mark_closed();
        let result = self.binding.close_device(dev_handle.connection());
        if !result.is_successful() {
            error!(
                "Failed to close USB device connection {:?}: {}",
                dev_handle.connection(),
                result.error_message()
            );
        }
    }

    pub fn claim_interface(&self, dev_handle: &DeviceHandle, interface_number: u8) -> Result<()> {
        self.check_upstream(
            "claim_interface",
            self.binding
                .claim_interface(dev_handle.connection(), interface_number),
        )
    }

    pub fn release_interface(&self, dev_handle: &DeviceHandle, interface_number: u8) -> Result<()> {
        self.check_upstream(
            "release_interface",
            self.binding
                .release_interface(dev_handle.connection(), interface_number),
        )
    }

    pub fn reset_device(&self, dev_handle: &DeviceHandle) -> Result<()> {
        self.check_upstream(
            "reset_device",
            self.binding.reset_device(dev_handle.connection()),
        )
    }

    // ---------------------------------------------------------------------
    // Asynchronous transfers
    // ---------------------------------------------------------------------

    /// Allocate an idle transfer; isochronous packets are not supported
    pub fn alloc_transfer(&self, iso_packets: usize) -> Result<Arc<Transfer>> {
        if iso_packets != 0 {
            debug!("Refusing transfer with {} isochronous packets", iso_packets);
            return Err(LibusbError::InvalidParam);
        }
        Ok(Transfer::new())
    }

    /// Submit a filled transfer
    ///
    /// # Panics
    /// When the transfer has no device handle.
    pub fn submit_transfer(&self, transfer: &Arc<Transfer>) -> Result<()> {
        let (dev_handle, request) = {
            let mut fields = transfer.lock();
            let dev_handle = fields
                .dev_handle
                .clone()
                .expect("submit_transfer on a transfer without device handle");

            if fields.flags.contains(TransferFlags::ADD_ZERO_PACKET) {
                return Err(LibusbError::NotSupported);
            }
            let request = match fields.transfer_type {
                TransferType::Control => {
                    PlatformRequest::Control(request::control_info_from_transfer(&fields)?)
                }
                TransferType::Bulk => {
                    PlatformRequest::Bulk(request::generic_info_from_transfer(&fields)?)
                }
                TransferType::Interrupt => {
                    PlatformRequest::Interrupt(request::generic_info_from_transfer(&fields)?)
                }
                TransferType::Isochronous => return Err(LibusbError::NotSupported),
            };
            fields.actual_length = 0;
            (dev_handle, request)
        };

        let context = self.handle_context(&dev_handle);
        let submission = context.tracker().register(transfer);

        let callback: usb_binding::TransferCallback =
            Box::new(move |result| context.tracker().deliver(submission, result));
        let connection = dev_handle.connection();
        debug!("Submitting {} on connection {:?}", submission, connection);

        match request {
            PlatformRequest::Control(info) => {
                self.binding
                    .async_control_transfer(connection, info, callback)
            }
            PlatformRequest::Bulk(info) => self.binding.async_bulk_transfer(connection, info, callback),
            PlatformRequest::Interrupt(info) => {
                self.binding
                    .async_interrupt_transfer(connection, info, callback)
            }
        }
        Ok(())
    }

    /// Cancel a submitted transfer
    ///
    /// The transfer still completes through `handle_events`, with status
    /// [`TransferStatus::Cancelled`].
    ///
    /// # Panics
    /// When the transfer has no device handle.
    pub fn cancel_transfer(&self, transfer: &Transfer) -> Result<()> {
        let context = self
            .transfer_context(transfer)
            .expect("cancel_transfer on a transfer without device handle");
        if context.tracker().cancel(transfer.id()) {
            debug!("Cancelled {}", transfer.id());
            Ok(())
        } else {
            Err(LibusbError::NotFound)
        }
    }

    /// Free a transfer
    ///
    /// Returns the buffer to the caller unless `FREE_BUFFER` is set, in which
    /// case it is released here.
    pub fn free_transfer(&self, transfer: Arc<Transfer>) -> Option<Vec<u8>> {
        if let Some(context) = self.transfer_context(&transfer) {
            context.tracker().remove(transfer.id());
        }

        let mut fields = transfer.lock();
        fields.callback = None;
        fields.dev_handle = None;
        let buffer = fields.buffer.take();
        if fields.flags.contains(TransferFlags::FREE_BUFFER) {
            None
        } else {
            buffer
        }
    }

    // ---------------------------------------------------------------------
    // Synchronous transfers
    // ---------------------------------------------------------------------

    /// Synchronous control transfer; `data` is the data stage
    ///
    /// Returns the number of bytes transferred. On failure `data` is left
    /// untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer(
        &self,
        dev_handle: &DeviceHandle,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: u32,
    ) -> Result<usize> {
        let w_length = u16::try_from(data.len()).map_err(|_| LibusbError::InvalidParam)?;
        let setup = ControlSetup {
            bm_request_type: request_type,
            b_request: request,
            w_value: value,
            w_index: index,
            w_length,
        };
        let info = request::build_control_info(&setup, data, timeout);
        debug!(
            "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
            request_type, request, value, index, w_length
        );

        let result = self
            .binding
            .control_transfer(dev_handle.connection(), info);
        let payload = self.check_upstream("control_transfer", result)?;
        let requested = data.len();
        status_to_result(apply_transfer_result(&payload, false, requested, data))
    }

    /// Synchronous bulk transfer over the whole of `data`
    pub fn bulk_transfer(
        &self,
        dev_handle: &DeviceHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout: u32,
    ) -> Result<usize> {
        let info = request::build_generic_info(endpoint, data, timeout);
        debug!("Bulk transfer: endpoint={:#x}, length={}", endpoint, data.len());

        let result = self.binding.bulk_transfer(dev_handle.connection(), info);
        let payload = self.check_upstream("bulk_transfer", result)?;
        let requested = data.len();
        status_to_result(apply_transfer_result(&payload, false, requested, data))
    }

    /// Synchronous interrupt transfer over the whole of `data`
    pub fn interrupt_transfer(
        &self,
        dev_handle: &DeviceHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout: u32,
    ) -> Result<usize> {
        let info = request::build_generic_info(endpoint, data, timeout);
        debug!(
            "Interrupt transfer: endpoint={:#x}, length={}",
            endpoint,
            data.len()
        );

        let result = self
            .binding
            .interrupt_transfer(dev_handle.connection(), info);
        let payload = self.check_upstream("interrupt_transfer", result)?;
        let requested = data.len();
        status_to_result(apply_transfer_result(&payload, false, requested, data))
    }

    // ---------------------------------------------------------------------
    // Contexts and event handling
    // ---------------------------------------------------------------------

    /// Create an explicit context with its own tracker
    pub fn init(&self) -> Result<Arc<Context>> {
        Ok(Context::new())
    }

    /// Release an explicit context; `None` (the default context) is a no-op
    pub fn exit(&self, context: Option<Arc<Context>>) {
        drop(context);
    }

    /// [`handle_events_timeout`](Self::handle_events_timeout) with the configured wait
    pub fn handle_events(&self, context: Option<&Arc<Context>>) -> Result<()> {
        self.handle_events_timeout(context, self.handle_events_timeout)
    }

    /// Wait up to `timeout` for one completed transfer and run its callback
    ///
    /// At most one transfer is finalized per call. Returns `Ok` whether or
    /// not anything completed.
    pub fn handle_events_timeout(
        &self,
        context: Option<&Arc<Context>>,
        timeout: Duration,
    ) -> Result<()> {
        let context = self.resolve_context(context);
        if let Some((transfer, result)) = context.tracker().wait_and_extract_one(timeout) {
            self.process_completed_transfer(&transfer, result);
        }
        Ok(())
    }

    fn process_completed_transfer(
        &self,
        transfer: &Arc<Transfer>,
        result: RequestResult<TransferResultInfo>,
    ) {
        let mut callback = {
            let mut fields = transfer.lock();
            match result {
                RequestResult::Succeeded { payload } => {
                    let short_not_ok = fields.flags.contains(TransferFlags::SHORT_NOT_OK);
                    let length = fields.length;
                    // Control responses land after the setup block
                    let (offset, requested) = match fields.transfer_type {
                        TransferType::Control => {
                            (ControlSetup::SIZE, length.saturating_sub(ControlSetup::SIZE))
                        }
                        _ => (0, length),
                    };
                    let buffer = fields.buffer.get_or_insert_with(Vec::new);
                    let end = length.min(buffer.len());
                    let start = offset.min(end);
                    let applied = apply_transfer_result(
                        &payload,
                        short_not_ok,
                        requested,
                        &mut buffer[start..end],
                    );
                    fields.status = applied.status;
                    fields.actual_length = applied.actual_length;
                }
                RequestResult::Canceled => {
                    fields.status = TransferStatus::Cancelled;
                }
                RequestResult::Failed { message } => {
                    warn!("{} failed: {}", transfer.id(), message);
                    fields.status = TransferStatus::Error;
                }
            }
            debug!(
                "{} finished with status {:?}, {} bytes",
                transfer.id(),
                fields.status,
                fields.actual_length
            );
            fields.callback.take()
        };

        match callback.as_mut() {
            Some(callback) => callback(transfer),
            None => debug!("{} has no callback", transfer.id()),
        }

        let free = {
            let mut fields = transfer.lock();
            // Keep a callback installed by a resubmission from inside the callback
            if fields.callback.is_none() {
                fields.callback = callback;
            }
            fields.flags.contains(TransferFlags::FREE_TRANSFER)
        };
        if free {
            self.free_transfer(Arc::clone(transfer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_copies_min_of_response_and_requested() {
        let info = TransferResultInfo::success_with_data(vec![1, 2, 3, 4, 5, 6]);
        let mut dest = [0u8; 4];
        let applied = apply_transfer_result(&info, false, 4, &mut dest);

        assert_eq!(applied.status, TransferStatus::Completed);
        assert_eq!(applied.actual_length, 4);
        assert_eq!(dest, [1, 2, 3, 4]);
    }

    #[test]
    fn test_apply_short_packet_with_flag_is_error() {
        let info = TransferResultInfo::success_with_data(vec![0x5A; 10]);
        let mut dest = [0u8; 64];
        let applied = apply_transfer_result(&info, true, 64, &mut dest);

        assert_eq!(applied.status, TransferStatus::Error);
        assert_eq!(applied.actual_length, 10);
        assert_eq!(&dest[..10], &[0x5A; 10]);
        assert_eq!(dest[10], 0);
    }

    #[test]
    fn test_apply_short_packet_without_flag_completes() {
        let info = TransferResultInfo::success_with_data(vec![0x5A; 10]);
        let mut dest = [0u8; 64];
        let applied = apply_transfer_result(&info, false, 64, &mut dest);

        assert_eq!(applied.status, TransferStatus::Completed);
        assert_eq!(applied.actual_length, 10);
    }

    #[test]
    fn test_apply_without_data_counts_requested() {
        let mut dest = [0u8; 16];
        let applied = apply_transfer_result(&TransferResultInfo::success(), true, 16, &mut dest);
        assert_eq!(applied.status, TransferStatus::Completed);
        assert_eq!(applied.actual_length, 16);
    }

    #[test]
    fn test_apply_failure_codes_leave_buffer_untouched() {
        let mut dest = [7u8; 4];
        for info in [TransferResultInfo::failure(4), TransferResultInfo::default()] {
            let applied = apply_transfer_result(&info, false, 4, &mut dest);
            assert_eq!(applied.status, TransferStatus::Error);
            assert_eq!(dest, [7u8; 4]);
        }
    }

    #[test]
    fn test_status_to_result() {
        let done = AppliedResult {
            status: TransferStatus::Completed,
            actual_length: 3,
        };
        assert_eq!(status_to_result(done), Ok(3));

        let timed_out = AppliedResult {
            status: TransferStatus::TimedOut,
            actual_length: 0,
        };
        assert_eq!(status_to_result(timed_out), Err(LibusbError::Timeout));

        let failed = AppliedResult {
            status: TransferStatus::Error,
            actual_length: 0,
        };
        assert_eq!(status_to_result(failed), Err(LibusbError::Other));
    }
}
