//! Cooperative progress reporting and cancellation.
//!
//! A [`ProgressToken`] is shared by every long-running operation of one
//! logical job. It holds a fixed set of progress slots plus a single stop
//! flag. Operations acquire a slot when they start and release it when they
//! finish; when all slots are taken the operation simply runs without
//! reporting. Nothing here ever blocks: the slot status text sits behind a
//! `parking_lot::Mutex` that is only held for the duration of a copy.
//!
//! Cancellation is advisory. Scanners poll [`ProgressToken::is_stopped`] at
//! their documented poll points and return what they have so far.
//!
//! ```rust
//! use binprobe::ProgressToken;
//!
//! let token = ProgressToken::new();
//! {
//!     let slot = token.acquire(100);
//!     slot.set_status("scanning");
//!     slot.set_current(50);
//!     assert_eq!(token.slot_snapshot(0).unwrap().percent(), 50);
//! }
//! assert_eq!(token.percent_finished(), 100);
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of progress slots in a token.
pub const SLOT_COUNT: usize = 5;

#[derive(Debug, Default)]
struct SlotState {
    active: AtomicBool,
    current: AtomicU64,
    total: AtomicU64,
    status: Mutex<String>,
    started: Mutex<Option<Instant>>,
}

/// Shared progress and cancellation state.
#[derive(Debug, Default)]
pub struct ProgressToken {
    slots: [SlotState; SLOT_COUNT],
    stop: AtomicBool,
    finished: AtomicU64,
    used: AtomicU64,
}

/// Point-in-time copy of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// Units of work done.
    pub current: u64,
    /// Units of work expected.
    pub total: u64,
    /// Free-form status line.
    pub status: String,
    /// Whether an operation currently holds the slot.
    pub active: bool,
    /// Time since the slot was acquired.
    pub elapsed: Option<Duration>,
}

impl SlotSnapshot {
    /// Slot progress as a percentage, clamped to `[0, 100]`.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = u128::from(self.current) * 100 / u128::from(self.total);
        pct.min(100) as u8
    }
}

impl ProgressToken {
    /// Create a token with all slots free and the stop flag clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the first free slot for an operation of `total` units.
    ///
    /// Returns an inert handle when every slot is busy; the caller proceeds
    /// without progress reporting.
    pub fn acquire(&self, total: u64) -> ProgressSlot<'_> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.current.store(0, Ordering::Relaxed);
                slot.total.store(total, Ordering::Relaxed);
                slot.status.lock().clear();
                *slot.started.lock() = Some(Instant::now());
                self.used.fetch_add(1, Ordering::AcqRel);
                return ProgressSlot {
                    token: self,
                    index: Some(index),
                };
            }
        }

        tracing::trace!("no free progress slot, continuing without reporting");
        ProgressSlot {
            token: self,
            index: None,
        }
    }

    /// Request cancellation. Idempotent.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::debug!("stop requested");
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Share of acquired slots that have finished, `finished / used`, in
    /// `[0, 100]`.
    pub fn percent_finished(&self) -> u8 {
        let used = self.used.load(Ordering::Acquire);
        if used == 0 {
            return 0;
        }
        let finished = self.finished.load(Ordering::Acquire);
        (u128::from(finished) * 100 / u128::from(used)).min(100) as u8
    }

    /// Whether at least one slot was used and none is still active.
    pub fn is_finished(&self) -> bool {
        self.used.load(Ordering::Acquire) > 0
            && self
                .slots
                .iter()
                .all(|s| !s.active.load(Ordering::Acquire))
    }

    /// Finished without cancellation.
    pub fn is_success(&self) -> bool {
        self.is_finished() && !self.is_stopped()
    }

    /// Copy out the state of slot `index`.
    pub fn slot_snapshot(&self, index: usize) -> Option<SlotSnapshot> {
        let slot = self.slots.get(index)?;
        Some(SlotSnapshot {
            current: slot.current.load(Ordering::Relaxed),
            total: slot.total.load(Ordering::Relaxed),
            status: slot.status.lock().clone(),
            active: slot.active.load(Ordering::Acquire),
            elapsed: slot.started.lock().map(|t| t.elapsed()),
        })
    }

    fn release(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            if slot.active.swap(false, Ordering::AcqRel) {
                self.finished.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

/// Handle to an acquired progress slot. Dropping it marks the slot finished.
#[derive(Debug)]
pub struct ProgressSlot<'a> {
    token: &'a ProgressToken,
    index: Option<usize>,
}

impl<'a> ProgressSlot<'a> {
    /// A handle that reports nothing and is never stopped.
    ///
    /// Used by operations that were called without a token.
    pub fn detached(token: &'a ProgressToken) -> Self {
        Self { token, index: None }
    }

    /// Slot index, or `None` if the operation runs unreported.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// The owning token.
    pub fn token(&self) -> &'a ProgressToken {
        self.token
    }

    fn state(&self) -> Option<&SlotState> {
        self.index.and_then(|i| self.token.slots.get(i))
    }

    /// Set the expected amount of work.
    pub fn set_total(&self, total: u64) {
        if let Some(s) = self.state() {
            s.total.store(total, Ordering::Relaxed);
        }
    }

    /// Set the amount of work done.
    pub fn set_current(&self, current: u64) {
        if let Some(s) = self.state() {
            s.current.store(current, Ordering::Relaxed);
        }
    }

    /// Add to the amount of work done.
    pub fn increment(&self, by: u64) {
        if let Some(s) = self.state() {
            s.current.fetch_add(by, Ordering::Relaxed);
        }
    }

    /// Replace the status line.
    pub fn set_status(&self, status: impl Into<String>) {
        if let Some(s) = self.state() {
            *s.status.lock() = status.into();
        }
    }

    /// Time since the slot was acquired.
    pub fn elapsed(&self) -> Option<Duration> {
        self.state().and_then(|s| s.started.lock().map(|t| t.elapsed()))
    }

    /// Shorthand for `token().is_stopped()`.
    pub fn is_stopped(&self) -> bool {
        self.token.is_stopped()
    }

    /// Release the slot now instead of at drop.
    pub fn finish(self) {}
}

impl Drop for ProgressSlot<'_> {
    fn drop(&mut self) {
        if let Some(index) = self.index.take() {
            self.token.release(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_first_free() {
        let token = ProgressToken::new();
        let a = token.acquire(10);
        let b = token.acquire(10);
        assert_eq!(a.index(), Some(0));
        assert_eq!(b.index(), Some(1));
        drop(a);
        let c = token.acquire(10);
        assert_eq!(c.index(), Some(0));
    }

    #[test]
    fn test_exhausted_slots_degrade() {
        let token = ProgressToken::new();
        let held: Vec<_> = (0..SLOT_COUNT).map(|_| token.acquire(1)).collect();
        assert!(held.iter().all(|s| s.index().is_some()));

        let extra = token.acquire(1);
        assert_eq!(extra.index(), None);
        // Inert handle accepts updates silently.
        extra.set_current(5);
        extra.set_status("ignored");
        assert!(extra.elapsed().is_none());
        drop(extra);

        drop(held);
        assert_eq!(token.percent_finished(), 100);
    }

    #[test]
    fn test_percent_finished() {
        let token = ProgressToken::new();
        assert_eq!(token.percent_finished(), 0);
        let a = token.acquire(1);
        let b = token.acquire(1);
        a.finish();
        assert_eq!(token.percent_finished(), 50);
        assert!(!token.is_finished());
        b.finish();
        assert_eq!(token.percent_finished(), 100);
        assert!(token.is_finished());
        assert!(token.is_success());
    }

    #[test]
    fn test_stop_is_idempotent_and_shared() {
        let token = Arc::new(ProgressToken::new());
        let other = Arc::clone(&token);
        let handle = std::thread::spawn(move || {
            other.stop();
            other.stop();
        });
        handle.join().unwrap();
        assert!(token.is_stopped());
        let slot = token.acquire(1);
        assert!(slot.is_stopped());
        slot.finish();
        assert!(!token.is_success());
    }

    #[test]
    fn test_snapshot() {
        let token = ProgressToken::new();
        let slot = token.acquire(200);
        slot.set_current(50);
        slot.increment(50);
        slot.set_status("strings");
        let snap = token.slot_snapshot(0).unwrap();
        assert_eq!(snap.current, 100);
        assert_eq!(snap.total, 200);
        assert_eq!(snap.percent(), 50);
        assert_eq!(snap.status, "strings");
        assert!(snap.active);
        assert!(snap.elapsed.is_some());
        assert!(token.slot_snapshot(SLOT_COUNT).is_none());
    }
}
