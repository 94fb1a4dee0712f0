//! USB worker thread
//!
//! Owns the rusb context, the device registry and every open handle.
//! Callers reach it through the
//! [`BindingClient`](super::channel::BindingClient) bridge. Transfers run on
//! separate threads sharing the connection's handle; everything else runs
//! here. A closed connection's handle stays open until its last
//! outstanding transfer returns.

use super::channel::{BindingCommand, BindingWorker, Completion, TransferRequest};
use super::device::{RusbDevice, check_filter};
use super::transfers::spawn_transfer;
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use usb_binding::{ConnectionHandle, DeviceId, DeviceRecord, RequestResult};

struct OpenConnection {
    device: DeviceId,
    /// Shared with the transfer threads of this connection
    handle: Arc<DeviceHandle<Context>>,
    claimed: Vec<u8>,
}

/// USB worker thread state
pub struct UsbWorkerThread {
    context: Context,
    worker: BindingWorker,
    filters: Vec<String>,
    /// Registry of known devices by id
    devices: HashMap<DeviceId, RusbDevice>,
    /// (bus, address) -> id, so ids stay stable across enumerations
    locations: HashMap<(u8, u8), DeviceId>,
    connections: HashMap<ConnectionHandle, OpenConnection>,
    next_device_id: u32,
    next_connection_id: u32,
}

impl UsbWorkerThread {
    pub fn new(context: Context, worker: BindingWorker, filters: Vec<String>) -> Self {
        Self {
            context,
            worker,
            filters,
            devices: HashMap::new(),
            locations: HashMap::new(),
            connections: HashMap::new(),
            next_device_id: 1,
            next_connection_id: 1,
        }
    }

    /// Process commands until shutdown or until every client is gone
    pub fn run(mut self) {
        info!("USB binding worker started");

        loop {
            match self.worker.recv_command() {
                Ok(BindingCommand::Shutdown) => {
                    info!("USB binding worker shutting down");
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(e) => {
                    debug!("Command channel closed: {}", e);
                    break;
                }
            }
        }

        for (connection, open) in self.connections.drain() {
            debug!("Closing leftover connection {:?}", connection);
            release_claimed(&open);
        }
        self.worker.close("USB worker stopped");
        info!("USB binding worker stopped");
    }

    fn handle_command(&mut self, cmd: BindingCommand) {
        // A panicking handler must not take the worker thread down
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: BindingCommand) {
        match cmd {
            BindingCommand::GetDevices { response } => {
                let result = self.refresh_devices();
                let _ = response.send_blocking(result);
            }

            BindingCommand::GetConfigurations { device, response } => {
                let result = match self.devices.get(&device) {
                    Some(usb_device) => rusb_result(usb_device.configurations()),
                    None => RequestResult::failed(format!("unknown device {:?}", device)),
                };
                let _ = response.send_blocking(result);
            }

            BindingCommand::OpenDevice { device, response } => {
                let result = self.open_device(device);
                let _ = response.send_blocking(result);
            }

            BindingCommand::CloseDevice {
                connection,
                response,
            } => {
                let result = match self.connections.remove(&connection) {
                    Some(open) => {
                        release_claimed(&open);
                        debug!("Closed connection {:?} to {:?}", connection, open.device);
                        RequestResult::succeeded(())
                    }
                    None => unknown_connection(connection),
                };
                let _ = response.send_blocking(result);
            }

            BindingCommand::ClaimInterface {
                connection,
                interface_number,
                response,
            } => {
                let result = match self.connections.get_mut(&connection) {
                    Some(open) => claim(open, interface_number),
                    None => unknown_connection(connection),
                };
                let _ = response.send_blocking(result);
            }

            BindingCommand::ReleaseInterface {
                connection,
                interface_number,
                response,
            } => {
                let result = match self.connections.get_mut(&connection) {
                    Some(open) => {
                        let result = rusb_result(open.handle.release_interface(interface_number));
                        if result.is_successful() {
                            open.claimed.retain(|claimed| *claimed != interface_number);
                        }
                        result
                    }
                    None => unknown_connection(connection),
                };
                let _ = response.send_blocking(result);
            }

            BindingCommand::ResetDevice {
                connection,
                response,
            } => {
                let result = match self.connections.get_mut(&connection) {
                    Some(open) => rusb_result(open.handle.reset()),
                    None => unknown_connection(connection),
                };
                let _ = response.send_blocking(result);
            }

            BindingCommand::Transfer {
                connection,
                request,
                completion,
            } => self.execute_transfer(connection, request, completion),

            BindingCommand::Shutdown => {
                // Handled in run()
                unreachable!()
            }
        }
    }

    /// Re-enumerate, keeping ids of devices that are still present
    fn refresh_devices(&mut self) -> RequestResult<Vec<DeviceRecord>> {
        let list = match self.context.devices() {
            Ok(list) => list,
            Err(e) => return RequestResult::failed(format!("enumeration failed: {}", e)),
        };

        let mut present = Vec::new();
        for device in list.iter() {
            let location = (device.bus_number(), device.address());
            if let Some(id) = self.locations.get(&location) {
                present.push(*id);
                continue;
            }

            let id = DeviceId(self.next_device_id);
            let usb_device = match RusbDevice::new(device, id) {
                Ok(usb_device) => usb_device,
                Err(e) => {
                    warn!("Failed to add device during enumeration: {}", e);
                    continue;
                }
            };
            if !check_filter(usb_device.vendor_id(), usb_device.product_id(), &self.filters) {
                debug!(
                    "Device ignored by filter: vid={:#06x}, pid={:#06x}",
                    usb_device.vendor_id(),
                    usb_device.product_id()
                );
                continue;
            }

            self.next_device_id += 1;
            self.locations.insert(usb_device.location(), id);
            self.devices.insert(id, usb_device);
            present.push(id);
        }

        self.devices.retain(|id, _| present.contains(id));
        self.locations.retain(|_, id| present.contains(id));

        let records: Vec<DeviceRecord> = present
            .iter()
            .filter_map(|id| self.devices.get(id))
            .map(RusbDevice::record)
            .collect();
        debug!("Enumerated {} devices", records.len());
        RequestResult::succeeded(records)
    }

    fn open_device(&mut self, device: DeviceId) -> RequestResult<ConnectionHandle> {
        let Some(usb_device) = self.devices.get(&device) else {
            return RequestResult::failed(format!("unknown device {:?}", device));
        };

        match usb_device.open() {
            Ok(handle) => {
                let connection = ConnectionHandle(self.next_connection_id);
                self.next_connection_id += 1;
                self.connections.insert(
                    connection,
                    OpenConnection {
                        device,
                        handle: Arc::new(handle),
                        claimed: Vec::new(),
                    },
                );
                debug!("Opened {:?} as connection {:?}", device, connection);
                RequestResult::succeeded(connection)
            }
            Err(e) => {
                warn!("Failed to open device {:?}: {}", device, e);
                RequestResult::failed(e.to_string())
            }
        }
    }

    /// Hand the transfer to its own thread so the command loop keeps draining
    fn execute_transfer(
        &self,
        connection: ConnectionHandle,
        request: TransferRequest,
        completion: Completion,
    ) {
        match self.connections.get(&connection) {
            Some(open) => spawn_transfer(Arc::clone(&open.handle), request, completion),
            None => completion.complete(unknown_connection(connection)),
        }
    }
}

fn claim(open: &mut OpenConnection, interface_number: u8) -> RequestResult<()> {
    match open.handle.kernel_driver_active(interface_number) {
        Ok(true) => {
            debug!(
                "Detaching kernel driver from interface {} on {:?}",
                interface_number, open.device
            );
            if let Err(e) = open.handle.detach_kernel_driver(interface_number) {
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface_number, e
                );
            }
        }
        Ok(false) => {}
        Err(e) => debug!(
            "Could not check kernel driver status for interface {}: {}",
            interface_number, e
        ),
    }

    let result = rusb_result(open.handle.claim_interface(interface_number));
    if result.is_successful() && !open.claimed.contains(&interface_number) {
        open.claimed.push(interface_number);
    }
    result
}

/// Release claimed interfaces and hand them back to the kernel
fn release_claimed(open: &OpenConnection) {
    for interface in &open.claimed {
        if let Err(e) = open.handle.release_interface(*interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
        if let Err(e) = open.handle.attach_kernel_driver(*interface) {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            );
        }
    }
}

fn rusb_result<T>(result: Result<T, rusb::Error>) -> RequestResult<T> {
    match result {
        Ok(value) => RequestResult::succeeded(value),
        Err(e) => RequestResult::failed(e.to_string()),
    }
}

fn unknown_connection<T>(connection: ConnectionHandle) -> RequestResult<T> {
    RequestResult::failed(format!("unknown connection {:?}", connection))
}

/// Spawn the worker thread
///
/// Context creation happens on the new thread. When it fails, queued and
/// later commands fail instead of waiting, and the error is returned from
/// the join handle.
pub fn spawn_usb_worker(
    worker: BindingWorker,
    filters: Vec<String>,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-binding".to_string())
        .spawn(move || {
            let context = match Context::new() {
                Ok(context) => context,
                Err(e) => {
                    error!("Failed to create USB context: {}", e);
                    worker.close(&format!("USB context unavailable: {}", e));
                    return Err(e);
                }
            };
            UsbWorkerThread::new(context, worker, filters).run();
            Ok(())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rusb_binding::channel::create_binding_bridge;

    #[test]
    fn test_usb_worker_creation() {
        let (_client, worker) = create_binding_bridge(8);

        // Context creation may fail without USB access
        match Context::new() {
            Ok(context) => {
                let worker_thread = UsbWorkerThread::new(context, worker, vec![]);
                assert!(worker_thread.devices.is_empty());
                assert_eq!(worker_thread.next_device_id, 1);
            }
            Err(e) => eprintln!("USB context creation failed (expected without USB): {}", e),
        }
    }

    #[test]
    fn test_unknown_connection_message() {
        let result: RequestResult<()> = unknown_connection(ConnectionHandle(7));
        assert!(result.error_message().contains("unknown connection"));
    }
}
