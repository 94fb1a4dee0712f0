//! Platform binding contract
//!
//! The shim consumes the platform USB stack exclusively through
//! [`UsbBinding`]. Synchronous calls answer with a [`RequestResult`];
//! asynchronous transfer calls return immediately and report their outcome
//! later through a [`TransferCallback`], possibly on another thread.

use crate::messages::{ControlTransferInfo, GenericTransferInfo, RequestResult, TransferResultInfo};
use crate::types::{ConfigRecord, ConnectionHandle, DeviceRecord};

/// Completion callback of an asynchronous transfer
///
/// Invoked exactly once, from whatever thread the binding completes the
/// request on.
pub type TransferCallback = Box<dyn FnOnce(RequestResult<TransferResultInfo>) + Send + 'static>;

/// Request/response surface of the platform USB binding
pub trait UsbBinding: Send + Sync {
    /// Enumerate the devices visible to the platform
    fn get_devices(&self) -> RequestResult<Vec<DeviceRecord>>;

    /// Fetch every configuration of a device
    fn get_configurations(&self, device: &DeviceRecord) -> RequestResult<Vec<ConfigRecord>>;

    /// Open a connection to a device
    fn open_device(&self, device: &DeviceRecord) -> RequestResult<ConnectionHandle>;

    fn close_device(&self, connection: ConnectionHandle) -> RequestResult<()>;

    fn claim_interface(&self, connection: ConnectionHandle, interface_number: u8)
    -> RequestResult<()>;

    fn release_interface(
        &self,
        connection: ConnectionHandle,
        interface_number: u8,
    ) -> RequestResult<()>;

    fn reset_device(&self, connection: ConnectionHandle) -> RequestResult<()>;

    fn control_transfer(
        &self,
        connection: ConnectionHandle,
        info: ControlTransferInfo,
    ) -> RequestResult<TransferResultInfo>;

    fn bulk_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
    ) -> RequestResult<TransferResultInfo>;

    fn interrupt_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
    ) -> RequestResult<TransferResultInfo>;

    /// Start a control transfer; `callback` fires once it finishes
    fn async_control_transfer(
        &self,
        connection: ConnectionHandle,
        info: ControlTransferInfo,
        callback: TransferCallback,
    );

    fn async_bulk_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
        callback: TransferCallback,
    );

    fn async_interrupt_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
        callback: TransferCallback,
    );
}
