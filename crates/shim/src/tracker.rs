//! Asynchronous transfer tracker
//!
//! Bridges completions reported by the platform binding, on whatever thread
//! it chooses, into the blocking wait of the event-handling call.
//!
//! ```text
//!  submit ──register──> Pending ──deliver──> Completed ──wait_and_extract_one──> caller
//!                          │                     ^
//!                          └──────cancel─────────┘ (result = Canceled)
//! ```
//!
//! Every tracked transfer leaves the tracker exactly once, either through
//! [`TransferTracker::wait_and_extract_one`] or [`TransferTracker::remove`].
//! Results are matched against the submission they answer, so a result
//! belonging to an earlier submission of a resubmitted transfer is dropped.

use crate::transfer::{Transfer, TransferId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};
use usb_binding::{RequestResult, TransferResultInfo};

/// Result of a tracked transfer as handed to the event loop
pub type TransferOutcome = RequestResult<TransferResultInfo>;

/// One submission of a transfer
///
/// A transfer keeps its [`TransferId`] when it is resubmitted; the
/// submission number tells the current submission apart from earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionId {
    transfer: TransferId,
    submission: u64,
}

impl SubmissionId {
    pub fn transfer(&self) -> TransferId {
        self.transfer
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (submission {})", self.transfer, self.submission)
    }
}

#[derive(Debug)]
enum Entry {
    Pending {
        transfer: Arc<Transfer>,
        submission: u64,
    },
    Completed(Arc<Transfer>, TransferOutcome),
}

#[derive(Debug, Default)]
struct TrackerState {
    entries: HashMap<TransferId, Entry>,
    /// Completed ids, oldest first
    completed: VecDeque<TransferId>,
    next_submission: u64,
}

/// Table of in-flight transfers of one context
#[derive(Debug, Default)]
pub struct TransferTracker {
    state: Mutex<TrackerState>,
    completed_cv: Condvar,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().expect("transfer tracker poisoned")
    }

    /// Start tracking a submitted transfer
    ///
    /// The returned id is what the completion must be delivered with.
    ///
    /// # Panics
    /// When the transfer is already tracked.
    pub fn register(&self, transfer: &Arc<Transfer>) -> SubmissionId {
        let id = transfer.id();
        let mut state = self.lock();
        assert!(
            !state.entries.contains_key(&id),
            "{} registered twice in the transfer tracker",
            id
        );
        state.next_submission += 1;
        let submission = SubmissionId {
            transfer: id,
            submission: state.next_submission,
        };
        state.entries.insert(
            id,
            Entry::Pending {
                transfer: Arc::clone(transfer),
                submission: submission.submission,
            },
        );
        trace!("{} pending", submission);
        submission
    }

    /// Record the platform result of a submission
    ///
    /// Safe to call from any thread. Results for submissions that are no
    /// longer pending (cancelled, removed, already delivered, or superseded
    /// by a resubmission) are dropped.
    pub fn deliver(&self, submission: SubmissionId, result: TransferOutcome) {
        let id = submission.transfer;
        let mut state = self.lock();
        match state.entries.remove(&id) {
            Some(Entry::Pending {
                transfer,
                submission: current,
            }) if current == submission.submission => {
                state.entries.insert(id, Entry::Completed(transfer, result));
                state.completed.push_back(id);
                drop(state);
                trace!("{} completed", submission);
                self.completed_cv.notify_one();
            }
            Some(entry) => {
                state.entries.insert(id, entry);
                debug!("Dropping late result for {}", submission);
            }
            None => {
                debug!("Dropping result for untracked {}", submission);
            }
        }
    }

    /// Cancel a pending transfer
    ///
    /// The transfer completes with [`RequestResult::Canceled`]; any result
    /// the platform delivers afterwards is dropped. Returns false when the
    /// transfer is not pending here.
    pub fn cancel(&self, id: TransferId) -> bool {
        let mut state = self.lock();
        match state.entries.remove(&id) {
            Some(Entry::Pending { transfer, .. }) => {
                state
                    .entries
                    .insert(id, Entry::Completed(transfer, RequestResult::Canceled));
                state.completed.push_back(id);
                drop(state);
                trace!("{} cancelled", id);
                self.completed_cv.notify_one();
                true
            }
            Some(other) => {
                state.entries.insert(id, other);
                false
            }
            None => false,
        }
    }

    /// Wait up to `timeout` for a completed transfer and take the oldest one
    ///
    /// Returns `None` when nothing completed in time.
    pub fn wait_and_extract_one(
        &self,
        timeout: Duration,
    ) -> Option<(Arc<Transfer>, TransferOutcome)> {
        let state = self.lock();
        let (mut state, _timeout_result) = self
            .completed_cv
            .wait_timeout_while(state, timeout, |s| s.completed.is_empty())
            .expect("transfer tracker poisoned");

        while let Some(id) = state.completed.pop_front() {
            if let Some(Entry::Completed(transfer, result)) = state.entries.remove(&id) {
                trace!("{} extracted", id);
                return Some((transfer, result));
            }
        }
        None
    }

    /// Stop tracking a transfer, whatever its state
    pub fn remove(&self, id: TransferId) {
        let mut state = self.lock();
        if state.entries.remove(&id).is_some() {
            state.completed.retain(|completed| *completed != id);
            trace!("{} removed", id);
        }
    }

    pub fn is_tracked(&self, id: TransferId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn is_pending(&self, id: TransferId) -> bool {
        matches!(self.lock().entries.get(&id), Some(Entry::Pending { .. }))
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| matches!(entry, Entry::Pending { .. }))
            .count()
    }

    pub fn completed_count(&self) -> usize {
        self.lock().completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn ok_result(data: Vec<u8>) -> TransferOutcome {
        RequestResult::succeeded(TransferResultInfo::success_with_data(data))
    }

    #[test]
    fn test_register_then_deliver_then_extract() {
        let tracker = TransferTracker::new();
        let transfer = Transfer::new();

        let submission = tracker.register(&transfer);
        assert!(tracker.is_pending(transfer.id()));

        tracker.deliver(submission, ok_result(vec![1, 2, 3]));
        assert!(!tracker.is_pending(transfer.id()));
        assert_eq!(tracker.completed_count(), 1);

        let (extracted, result) = tracker
            .wait_and_extract_one(Duration::from_millis(10))
            .unwrap();
        assert_eq!(extracted.id(), transfer.id());
        assert_eq!(result, ok_result(vec![1, 2, 3]));
        assert!(!tracker.is_tracked(transfer.id()));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_double_register_panics() {
        let tracker = TransferTracker::new();
        let transfer = Transfer::new();
        tracker.register(&transfer);
        tracker.register(&transfer);
    }

    #[test]
    fn test_extract_times_out_within_bound() {
        let tracker = TransferTracker::new();
        let timeout = Duration::from_millis(50);

        let start = Instant::now();
        assert!(tracker.wait_and_extract_one(timeout).is_none());
        let elapsed = start.elapsed();

        assert!(elapsed >= timeout, "returned early after {:?}", elapsed);
        assert!(
            elapsed < timeout + Duration::from_secs(1),
            "waited too long: {:?}",
            elapsed
        );
    }

    #[test]
    fn test_extract_is_oldest_first() {
        let tracker = TransferTracker::new();
        let first = Transfer::new();
        let second = Transfer::new();
        let first_submission = tracker.register(&first);
        let second_submission = tracker.register(&second);

        tracker.deliver(second_submission, ok_result(vec![2]));
        tracker.deliver(first_submission, ok_result(vec![1]));

        let (a, _) = tracker.wait_and_extract_one(Duration::ZERO).unwrap();
        let (b, _) = tracker.wait_and_extract_one(Duration::ZERO).unwrap();
        assert_eq!(a.id(), second.id());
        assert_eq!(b.id(), first.id());
        assert!(tracker.wait_and_extract_one(Duration::ZERO).is_none());
    }

    #[test]
    fn test_cancel_then_late_deliver_stays_cancelled() {
        let tracker = TransferTracker::new();
        let transfer = Transfer::new();
        let submission = tracker.register(&transfer);

        assert!(tracker.cancel(transfer.id()));
        tracker.deliver(submission, ok_result(vec![0xAA; 4]));

        let (_, result) = tracker.wait_and_extract_one(Duration::ZERO).unwrap();
        assert_eq!(result, RequestResult::Canceled);
        assert!(tracker.wait_and_extract_one(Duration::ZERO).is_none());
    }

    #[test]
    fn test_cancel_requires_pending() {
        let tracker = TransferTracker::new();
        let transfer = Transfer::new();
        assert!(!tracker.cancel(transfer.id()));

        let submission = tracker.register(&transfer);
        tracker.deliver(submission, ok_result(vec![]));
        assert!(!tracker.cancel(transfer.id()));
    }

    #[test]
    fn test_second_deliver_is_dropped() {
        let tracker = TransferTracker::new();
        let transfer = Transfer::new();
        let submission = tracker.register(&transfer);

        tracker.deliver(submission, ok_result(vec![1]));
        tracker.deliver(submission, ok_result(vec![2]));

        assert_eq!(tracker.completed_count(), 1);
        let (_, result) = tracker.wait_and_extract_one(Duration::ZERO).unwrap();
        assert_eq!(result, ok_result(vec![1]));
    }

    #[test]
    fn test_result_of_earlier_submission_is_dropped() {
        let tracker = TransferTracker::new();
        let transfer = Transfer::new();

        let cancelled = tracker.register(&transfer);
        assert!(tracker.cancel(transfer.id()));
        let (_, result) = tracker.wait_and_extract_one(Duration::ZERO).unwrap();
        assert_eq!(result, RequestResult::Canceled);

        let current = tracker.register(&transfer);
        assert_ne!(cancelled, current);
        assert_eq!(cancelled.transfer(), current.transfer());

        // The platform answers the cancelled submission after the resubmit
        tracker.deliver(cancelled, ok_result(vec![0xFF; 8]));
        assert!(tracker.is_pending(transfer.id()));
        assert!(tracker.wait_and_extract_one(Duration::ZERO).is_none());

        tracker.deliver(current, ok_result(vec![1; 8]));
        let (_, result) = tracker.wait_and_extract_one(Duration::ZERO).unwrap();
        assert_eq!(result, ok_result(vec![1; 8]));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tracker = TransferTracker::new();
        let transfer = Transfer::new();
        let submission = tracker.register(&transfer);
        tracker.deliver(submission, ok_result(vec![]));

        tracker.remove(transfer.id());
        tracker.remove(transfer.id());

        assert!(!tracker.is_tracked(transfer.id()));
        assert_eq!(tracker.completed_count(), 0);
        assert!(tracker.wait_and_extract_one(Duration::ZERO).is_none());

        // Registering again after removal is allowed
        tracker.register(&transfer);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_deliver_from_other_thread_wakes_waiter() {
        let tracker = Arc::new(TransferTracker::new());
        let transfer = Transfer::new();
        let submission = tracker.register(&transfer);

        let producer = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                tracker.deliver(submission, ok_result(vec![9]));
            })
        };

        let start = Instant::now();
        let extracted = tracker.wait_and_extract_one(Duration::from_secs(5));
        assert!(extracted.is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
        producer.join().unwrap();
    }

    #[test]
    fn test_concurrent_deliver_and_extract_loses_nothing() {
        const TRANSFERS: usize = 200;
        const CONSUMERS: usize = 4;

        let tracker = Arc::new(TransferTracker::new());
        let transfers: Vec<_> = (0..TRANSFERS).map(|_| Transfer::new()).collect();
        let submissions: Vec<_> = transfers
            .iter()
            .map(|transfer| tracker.register(transfer))
            .collect();

        let ids: Vec<_> = transfers.iter().map(|t| t.id()).collect();
        let producers: Vec<_> = submissions
            .chunks(TRANSFERS / 4)
            .map(|chunk| {
                let tracker = Arc::clone(&tracker);
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    for submission in chunk {
                        tracker.deliver(submission, ok_result(vec![]));
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some((transfer, _)) =
                        tracker.wait_and_extract_one(Duration::from_millis(200))
                    {
                        seen.push(transfer.id());
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let mut seen: Vec<_> = consumers
            .into_iter()
            .flat_map(|consumer| consumer.join().unwrap())
            .collect();

        seen.sort();
        let mut expected = ids;
        expected.sort();
        assert_eq!(seen, expected, "every transfer extracted exactly once");
        assert_eq!(tracker.pending_count(), 0);
    }
}
