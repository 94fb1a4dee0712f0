//! Device and device handle objects
//!
//! A [`Device`] is an immutable snapshot of a platform device record plus
//! the context it was enumerated in. A [`DeviceHandle`] is one open
//! connection to it.

use crate::context::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use usb_binding::{ConnectionHandle, DeviceRecord};

/// Enumerated device
#[derive(Debug)]
pub struct Device {
    /// Owning context (`None` = default context)
    context: Option<Arc<Context>>,
    record: DeviceRecord,
    /// libusb-visible reference count
    ref_count: AtomicUsize,
}

impl Device {
    pub(crate) fn new(context: Option<Arc<Context>>, record: DeviceRecord) -> Arc<Self> {
        Arc::new(Self {
            context,
            record,
            ref_count: AtomicUsize::new(1),
        })
    }

    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    pub fn context(&self) -> Option<&Arc<Context>> {
        self.context.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one reference and returns the remaining count
    ///
    /// # Panics
    /// When the count is already zero.
    pub(crate) fn release(&self) -> usize {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .unwrap_or_else(|_| {
                panic!(
                    "unref of device {:?} with zero references",
                    self.record.device
                )
            });
        previous - 1
    }
}

/// Open connection to a device
#[derive(Debug)]
pub struct DeviceHandle {
    device: Arc<Device>,
    connection: ConnectionHandle,
    closed: AtomicBool,
}

impl DeviceHandle {
    pub(crate) fn new(device: Arc<Device>, connection: ConnectionHandle) -> Arc<Self> {
        Arc::new(Self {
            device,
            connection,
            closed: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the handle closed
    ///
    /// # Panics
    /// When the handle was already closed.
    pub(crate) fn mark_closed(&self) {
        let was_closed = self.closed.swap(true, Ordering::AcqRel);
        assert!(!was_closed, "device handle {:?} closed twice", self.connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_device_record;

    #[test]
    fn test_ref_counting() {
        let device = Device::new(None, create_mock_device_record(1, 0x1234, 0x5678));
        assert_eq!(device.ref_count(), 1);
        assert_eq!(device.add_ref(), 2);
        assert_eq!(device.release(), 1);
        assert_eq!(device.release(), 0);
    }

    #[test]
    #[should_panic(expected = "zero references")]
    fn test_unref_below_zero_panics() {
        let device = Device::new(None, create_mock_device_record(1, 0x1234, 0x5678));
        device.release();
        device.release();
    }

    #[test]
    #[should_panic(expected = "closed twice")]
    fn test_double_close_panics() {
        let device = Device::new(None, create_mock_device_record(1, 0x1234, 0x5678));
        let handle = DeviceHandle::new(device, ConnectionHandle(7));
        handle.mark_closed();
        handle.mark_closed();
    }
}
