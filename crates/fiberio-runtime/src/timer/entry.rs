//! Timer entries and handles

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use super::manager::ManagerInner;

/// Timer body. Recurring timers call it once per period.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

pub(crate) struct TimerSlot {
    pub(crate) deadline: Instant,
    pub(crate) period: Duration,
    pub(crate) recurring: bool,
    /// `None` once fired (one-shot) or cancelled
    pub(crate) callback: Option<TimerCallback>,
}

pub(crate) struct Timer {
    pub(crate) id: u64,
    slot: Mutex<TimerSlot>,
    pub(crate) manager: Weak<ManagerInner>,
}

impl Timer {
    pub(crate) fn new(
        id: u64,
        deadline: Instant,
        period: Duration,
        recurring: bool,
        callback: TimerCallback,
        manager: Weak<ManagerInner>,
    ) -> Timer {
        Timer {
            id,
            slot: Mutex::new(TimerSlot {
                deadline,
                period,
                recurring,
                callback: Some(callback),
            }),
            manager,
        }
    }

    pub(crate) fn slot(&self) -> MutexGuard<'_, TimerSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to a timer added to a `TimerManager`
///
/// Dropping the handle does not cancel the timer.
#[derive(Clone)]
pub struct TimerHandle {
    pub(crate) timer: Arc<Timer>,
}

impl TimerHandle {
    #[inline]
    pub fn id(&self) -> u64 {
        self.timer.id
    }

    /// Still waiting to fire (a recurring timer stays pending until cancelled)
    pub fn is_pending(&self) -> bool {
        self.timer.slot().callback.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        let slot = self.timer.slot();
        slot.callback.as_ref().map(|_| slot.deadline)
    }

    /// Remove the timer. False if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        match self.timer.manager.upgrade() {
            Some(mgr) => mgr.cancel(&self.timer),
            None => false,
        }
    }

    /// Restart the countdown from now with the same period
    pub fn refresh(&self) -> bool {
        match self.timer.manager.upgrade() {
            Some(mgr) => mgr.refresh(&self.timer),
            None => false,
        }
    }

    /// Re-arm a pending timer with a new delay, optionally a new body
    pub fn reset(&self, delay_ms: u64, callback: Option<TimerCallback>, recurring: bool) -> bool {
        match self.timer.manager.upgrade() {
            Some(mgr) => mgr.reset(&self.timer, delay_ms, callback, recurring),
            None => false,
        }
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.timer, &other.timer)
    }
}

impl Eq for TimerHandle {}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.timer.slot();
        f.debug_struct("TimerHandle")
            .field("id", &self.timer.id)
            .field("period", &slot.period)
            .field("recurring", &slot.recurring)
            .field("pending", &slot.callback.is_some())
            .finish()
    }
}
