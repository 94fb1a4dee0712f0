//! Transfer execution over rusb
//!
//! Executes control, bulk and interrupt requests on an open handle. Failures
//! at the USB level are not request failures: they come back as a
//! [`TransferResultInfo`] carrying a non-zero result code, the way the
//! browser binding reports them.
//!
//! A transfer without a timeout may never finish, so transfers run on their
//! own `usb-transfer` threads and never on the worker's command loop.

use super::channel::{Completion, TransferRequest};
use rusb::{Context, DeviceHandle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use usb_binding::{
    ControlTransferInfo, Direction, GenericTransferInfo, Recipient, RequestResult, RequestType,
    TransferResultInfo,
};

/// Generic transfer error
pub const RESULT_ERROR: i32 = 1;
pub const RESULT_TIMED_OUT: i32 = 2;
/// Endpoint stalled
pub const RESULT_STALL: i32 = 4;
pub const RESULT_NO_DEVICE: i32 = 5;
pub const RESULT_OVERFLOW: i32 = 6;

/// Map a rusb error to a platform result code
pub fn map_rusb_error(error: rusb::Error) -> i32 {
    match error {
        rusb::Error::Timeout => RESULT_TIMED_OUT,
        rusb::Error::Pipe => RESULT_STALL,
        rusb::Error::NoDevice => RESULT_NO_DEVICE,
        rusb::Error::Overflow => RESULT_OVERFLOW,
        _ => RESULT_ERROR,
    }
}

/// Request timeout; rusb treats zero as unlimited, like the binding
fn timeout_of(timeout_ms: u32) -> Duration {
    Duration::from_millis(u64::from(timeout_ms))
}

fn finish(kind: &str, result: Result<Option<Vec<u8>>, rusb::Error>) -> TransferResultInfo {
    match result {
        Ok(Some(data)) => {
            debug!("{} transfer succeeded: {} bytes in", kind, data.len());
            TransferResultInfo::success_with_data(data)
        }
        Ok(None) => {
            debug!("{} transfer succeeded", kind);
            TransferResultInfo::success()
        }
        Err(e) => {
            warn!("{} transfer failed: {}", kind, e);
            TransferResultInfo::failure(map_rusb_error(e))
        }
    }
}

/// bmRequestType of a control request
pub fn request_type_byte(info: &ControlTransferInfo) -> u8 {
    let direction = match info.direction {
        Direction::In => rusb::Direction::In,
        Direction::Out => rusb::Direction::Out,
    };
    let request_type = match info.request_type {
        RequestType::Standard => rusb::RequestType::Standard,
        RequestType::Class => rusb::RequestType::Class,
        RequestType::Vendor => rusb::RequestType::Vendor,
        RequestType::Reserved => rusb::RequestType::Reserved,
    };
    let recipient = match info.recipient {
        Recipient::Device => rusb::Recipient::Device,
        Recipient::Interface => rusb::Recipient::Interface,
        Recipient::Endpoint => rusb::Recipient::Endpoint,
        Recipient::Other => rusb::Recipient::Other,
    };
    rusb::request_type(direction, request_type, recipient)
}

/// Execute a control transfer
///
/// IN requests read up to `length` bytes; OUT requests write `data`.
pub fn execute_control_transfer(
    handle: &DeviceHandle<Context>,
    info: &ControlTransferInfo,
) -> TransferResultInfo {
    let request_type = request_type_byte(info);
    let timeout = timeout_of(info.timeout);
    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}",
        request_type, info.request, info.value, info.index
    );

    let result = match info.direction {
        Direction::In => {
            let mut buffer = vec![0u8; usize::from(info.length.unwrap_or(0))];
            handle
                .read_control(
                    request_type,
                    info.request,
                    info.value,
                    info.index,
                    &mut buffer,
                    timeout,
                )
                .map(|len| {
                    buffer.truncate(len);
                    Some(buffer)
                })
        }
        Direction::Out => handle
            .write_control(
                request_type,
                info.request,
                info.value,
                info.index,
                info.data.as_deref().unwrap_or_default(),
                timeout,
            )
            .map(|_| None),
    };

    finish("Control", result)
}

/// Execute a bulk transfer
pub fn execute_bulk_transfer(
    handle: &DeviceHandle<Context>,
    info: &GenericTransferInfo,
) -> TransferResultInfo {
    let timeout = timeout_of(info.timeout);
    debug!("Bulk transfer: endpoint={:#x}", info.endpoint);

    let result = match info.direction {
        Direction::In => {
            let mut buffer = vec![0u8; in_length(info)];
            handle
                .read_bulk(info.endpoint, &mut buffer, timeout)
                .map(|len| {
                    buffer.truncate(len);
                    Some(buffer)
                })
        }
        Direction::Out => handle
            .write_bulk(info.endpoint, info.data.as_deref().unwrap_or_default(), timeout)
            .map(|_| None),
    };

    finish("Bulk", result)
}

/// Execute an interrupt transfer
pub fn execute_interrupt_transfer(
    handle: &DeviceHandle<Context>,
    info: &GenericTransferInfo,
) -> TransferResultInfo {
    let timeout = timeout_of(info.timeout);
    debug!("Interrupt transfer: endpoint={:#x}", info.endpoint);

    let result = match info.direction {
        Direction::In => {
            let mut buffer = vec![0u8; in_length(info)];
            handle
                .read_interrupt(info.endpoint, &mut buffer, timeout)
                .map(|len| {
                    buffer.truncate(len);
                    Some(buffer)
                })
        }
        Direction::Out => handle
            .write_interrupt(info.endpoint, info.data.as_deref().unwrap_or_default(), timeout)
            .map(|_| None),
    };

    finish("Interrupt", result)
}

/// Execute any transfer request on `handle`
pub fn execute_transfer(
    handle: &DeviceHandle<Context>,
    request: &TransferRequest,
) -> TransferResultInfo {
    match request {
        TransferRequest::Control(info) => execute_control_transfer(handle, info),
        TransferRequest::Bulk(info) => execute_bulk_transfer(handle, info),
        TransferRequest::Interrupt(info) => execute_interrupt_transfer(handle, info),
    }
}

/// Run a transfer on the shared handle from a `usb-transfer` thread
pub fn spawn_transfer(
    handle: Arc<DeviceHandle<Context>>,
    request: TransferRequest,
    completion: Completion,
) {
    spawn_transfer_job(move || execute_transfer(&handle, &request), completion);
}

/// Run `job` on a new `usb-transfer` thread and complete with its result
///
/// The job is handed over through a one-slot channel so that it can still
/// be failed when the thread cannot be started.
pub(crate) fn spawn_transfer_job<F>(job: F, completion: Completion)
where
    F: FnOnce() -> TransferResultInfo + Send + 'static,
{
    let (job_tx, job_rx) = async_channel::bounded::<(F, Completion)>(1);
    // Fresh channel with one free slot
    let _ = job_tx.try_send((job, completion));

    let thread_rx = job_rx.clone();
    let spawned = std::thread::Builder::new()
        .name("usb-transfer".to_string())
        .spawn(move || {
            if let Ok((job, completion)) = thread_rx.try_recv() {
                completion.complete(RequestResult::succeeded(job()));
            }
        });

    if let Err(e) = spawned {
        error!("Failed to spawn USB transfer thread: {}", e);
        if let Ok((_, completion)) = job_rx.try_recv() {
            completion.complete(RequestResult::failed(format!(
                "transfer thread unavailable: {}",
                e
            )));
        }
    }
}

fn in_length(info: &GenericTransferInfo) -> usize {
    info.length
        .and_then(|length| usize::try_from(length).ok())
        .unwrap_or(0)
}
