//! rusb-backed platform binding
//!
//! Implements [`UsbBinding`] on top of host libusb through `rusb`, so the
//! shim can drive real hardware. A dedicated `usb-binding` thread owns
//! every rusb object; [`RusbBinding`] only talks to it over channels.
//! Asynchronous transfers run on that thread and report through their
//! callback from there.

pub mod channel;
pub mod device;
pub mod transfers;
pub mod worker;

use channel::{BindingClient, BindingCommand, Completion, TransferRequest, create_binding_bridge};
use std::thread::JoinHandle;
use tracing::{debug, warn};
use usb_binding::{
    ConfigRecord, ConnectionHandle, ControlTransferInfo, DeviceRecord, GenericTransferInfo,
    RequestResult, TransferCallback, TransferResultInfo, UsbBinding,
};

pub use device::check_filter;

/// [`UsbBinding`] over the host's libusb
pub struct RusbBinding {
    client: BindingClient,
    thread: Option<JoinHandle<Result<(), rusb::Error>>>,
}

impl RusbBinding {
    /// Start the worker thread
    ///
    /// `filters` restrict enumeration to matching `0xVID:0xPID` patterns.
    pub fn spawn(filters: Vec<String>, queue_capacity: usize) -> std::io::Result<Self> {
        let (client, worker) = create_binding_bridge(queue_capacity.max(1));
        let thread = worker::spawn_usb_worker(worker, filters)?;
        Ok(Self {
            client,
            thread: Some(thread),
        })
    }

    fn transfer(
        &self,
        connection: ConnectionHandle,
        request: TransferRequest,
    ) -> RequestResult<TransferResultInfo> {
        self.client.request(|response| BindingCommand::Transfer {
            connection,
            request,
            completion: Completion::Reply(response),
        })
    }

    fn submit(
        &self,
        connection: ConnectionHandle,
        request: TransferRequest,
        callback: TransferCallback,
    ) {
        // An unsent command already completed the callback with a failure
        if let Err(e) = self.client.send_command(BindingCommand::Transfer {
            connection,
            request,
            completion: Completion::Callback(callback),
        }) {
            warn!("Async transfer not submitted: {}", e);
        }
    }
}

impl Drop for RusbBinding {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.client.shutdown();
        match thread.join() {
            Ok(Ok(())) => debug!("USB binding worker joined"),
            Ok(Err(e)) => warn!("USB binding worker failed to start: {}", e),
            Err(_) => warn!("USB binding worker panicked"),
        }
    }
}

impl UsbBinding for RusbBinding {
    fn get_devices(&self) -> RequestResult<Vec<DeviceRecord>> {
        self.client
            .request(|response| BindingCommand::GetDevices { response })
    }

    fn get_configurations(&self, device: &DeviceRecord) -> RequestResult<Vec<ConfigRecord>> {
        let device = device.device;
        self.client
            .request(|response| BindingCommand::GetConfigurations { device, response })
    }

    fn open_device(&self, device: &DeviceRecord) -> RequestResult<ConnectionHandle> {
        let device = device.device;
        self.client
            .request(|response| BindingCommand::OpenDevice { device, response })
    }

    fn close_device(&self, connection: ConnectionHandle) -> RequestResult<()> {
        self.client.request(|response| BindingCommand::CloseDevice {
            connection,
            response,
        })
    }

    fn claim_interface(
        &self,
        connection: ConnectionHandle,
        interface_number: u8,
    ) -> RequestResult<()> {
        self.client.request(|response| BindingCommand::ClaimInterface {
            connection,
            interface_number,
            response,
        })
    }

    fn release_interface(
        &self,
        connection: ConnectionHandle,
        interface_number: u8,
    ) -> RequestResult<()> {
        self.client.request(|response| BindingCommand::ReleaseInterface {
            connection,
            interface_number,
            response,
        })
    }

    fn reset_device(&self, connection: ConnectionHandle) -> RequestResult<()> {
        self.client.request(|response| BindingCommand::ResetDevice {
            connection,
            response,
        })
    }

    fn control_transfer(
        &self,
        connection: ConnectionHandle,
        info: ControlTransferInfo,
    ) -> RequestResult<TransferResultInfo> {
        self.transfer(connection, TransferRequest::Control(info))
    }

    fn bulk_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
    ) -> RequestResult<TransferResultInfo> {
        self.transfer(connection, TransferRequest::Bulk(info))
    }

    fn interrupt_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
    ) -> RequestResult<TransferResultInfo> {
        self.transfer(connection, TransferRequest::Interrupt(info))
    }

    fn async_control_transfer(
        &self,
        connection: ConnectionHandle,
        info: ControlTransferInfo,
        callback: TransferCallback,
    ) {
        self.submit(connection, TransferRequest::Control(info), callback)
    }

    fn async_bulk_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
        callback: TransferCallback,
    ) {
        self.submit(connection, TransferRequest::Bulk(info), callback)
    }

    fn async_interrupt_transfer(
        &self,
        connection: ConnectionHandle,
        info: GenericTransferInfo,
        callback: TransferCallback,
    ) {
        self.submit(connection, TransferRequest::Interrupt(info), callback)
    }
}
