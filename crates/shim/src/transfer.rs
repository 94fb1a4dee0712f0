//! Transfer objects
//!
//! A [`Transfer`] is shared between the caller, the context's tracker and
//! the completion path, so it lives behind an `Arc` with its mutable fields
//! under a mutex. The completion callback is never invoked with that mutex
//! held.

use crate::device::DeviceHandle;
use crate::request::ControlSetup;
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique transfer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    fn next() -> Self {
        TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer#{}", self.0)
    }
}

/// libusb transfer flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TransferFlags(u8);

impl TransferFlags {
    /// Report a short transfer as an error
    pub const SHORT_NOT_OK: TransferFlags = TransferFlags(1 << 0);
    /// Release the buffer together with the transfer
    pub const FREE_BUFFER: TransferFlags = TransferFlags(1 << 1);
    /// Free the transfer right after its callback returns
    pub const FREE_TRANSFER: TransferFlags = TransferFlags(1 << 2);
    /// Terminate OUT transfers with a zero length packet (unsupported)
    pub const ADD_ZERO_PACKET: TransferFlags = TransferFlags(1 << 3);

    pub const fn empty() -> Self {
        TransferFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        TransferFlags(bits)
    }

    pub const fn contains(self, other: TransferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TransferFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for TransferFlags {
    type Output = TransferFlags;

    fn bitor(self, rhs: TransferFlags) -> TransferFlags {
        TransferFlags(self.0 | rhs.0)
    }
}

/// Transfer kind with libusb numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Completion status with libusb numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransferStatus {
    Completed = 0,
    Error = 1,
    TimedOut = 2,
    Cancelled = 3,
    Stall = 4,
    NoDevice = 5,
    Overflow = 6,
}

/// Caller completion callback
pub type TransferCallback = Box<dyn FnMut(&Arc<Transfer>) + Send + 'static>;

/// Mutable state of a transfer
pub struct TransferFields {
    pub dev_handle: Option<Arc<DeviceHandle>>,
    pub flags: TransferFlags,
    pub endpoint: u8,
    pub transfer_type: TransferType,
    /// Timeout in milliseconds (0 = none)
    pub timeout: u32,
    /// Bytes of `buffer` taking part in the transfer, setup block included
    pub length: usize,
    pub buffer: Option<Vec<u8>>,
    pub status: TransferStatus,
    pub actual_length: usize,
    pub callback: Option<TransferCallback>,
}

impl fmt::Debug for TransferFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferFields")
            .field("flags", &self.flags)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("transfer_type", &self.transfer_type)
            .field("timeout", &self.timeout)
            .field("length", &self.length)
            .field("status", &self.status)
            .field("actual_length", &self.actual_length)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// One control, bulk or interrupt operation
#[derive(Debug)]
pub struct Transfer {
    id: TransferId,
    fields: Mutex<TransferFields>,
}

impl Transfer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: TransferId::next(),
            fields: Mutex::new(TransferFields {
                dev_handle: None,
                flags: TransferFlags::empty(),
                endpoint: 0,
                transfer_type: TransferType::Control,
                timeout: 0,
                length: 0,
                buffer: None,
                status: TransferStatus::Completed,
                actual_length: 0,
                callback: None,
            }),
        })
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Lock the mutable fields
    pub fn lock(&self) -> MutexGuard<'_, TransferFields> {
        self.fields.lock().expect("transfer fields poisoned")
    }

    pub fn status(&self) -> TransferStatus {
        self.lock().status
    }

    pub fn actual_length(&self) -> usize {
        self.lock().actual_length
    }

    /// Copy of the current buffer contents
    pub fn buffer_snapshot(&self) -> Option<Vec<u8>> {
        self.lock().buffer.clone()
    }

    /// Prepare a control transfer
    ///
    /// `buffer` starts with the 8 byte setup block; the length becomes the
    /// setup size plus its `wLength`.
    pub fn fill_control(
        &self,
        dev_handle: Arc<DeviceHandle>,
        buffer: Vec<u8>,
        callback: TransferCallback,
        timeout: u32,
    ) {
        let length = match ControlSetup::parse(&buffer) {
            Some(setup) => ControlSetup::SIZE + setup.w_length as usize,
            None => buffer.len(),
        };
        self.fill(
            dev_handle,
            TransferType::Control,
            0,
            buffer,
            length,
            callback,
            timeout,
        );
    }

    /// Prepare a bulk transfer over the whole of `buffer`
    pub fn fill_bulk(
        &self,
        dev_handle: Arc<DeviceHandle>,
        endpoint: u8,
        buffer: Vec<u8>,
        callback: TransferCallback,
        timeout: u32,
    ) {
        let length = buffer.len();
        self.fill(
            dev_handle,
            TransferType::Bulk,
            endpoint,
            buffer,
            length,
            callback,
            timeout,
        );
    }

    /// Prepare an interrupt transfer over the whole of `buffer`
    pub fn fill_interrupt(
        &self,
        dev_handle: Arc<DeviceHandle>,
        endpoint: u8,
        buffer: Vec<u8>,
        callback: TransferCallback,
        timeout: u32,
    ) {
        let length = buffer.len();
        self.fill(
            dev_handle,
            TransferType::Interrupt,
            endpoint,
            buffer,
            length,
            callback,
            timeout,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn fill(
        &self,
        dev_handle: Arc<DeviceHandle>,
        transfer_type: TransferType,
        endpoint: u8,
        buffer: Vec<u8>,
        length: usize,
        callback: TransferCallback,
        timeout: u32,
    ) {
        let mut fields = self.lock();
        fields.dev_handle = Some(dev_handle);
        fields.transfer_type = transfer_type;
        fields.endpoint = endpoint;
        fields.buffer = Some(buffer);
        fields.length = length;
        fields.callback = Some(callback);
        fields.timeout = timeout;
    }
}
