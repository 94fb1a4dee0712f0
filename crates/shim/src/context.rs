//! libusb context
//!
//! A context scopes transfer tracking: every transfer submitted through a
//! device of this context completes through this context's tracker.

use crate::tracker::TransferTracker;
use std::sync::Arc;

/// Root of the transfer tracking machinery
#[derive(Debug, Default)]
pub struct Context {
    tracker: TransferTracker,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tracker(&self) -> &TransferTracker {
        &self.tracker
    }
}
