//! TimerManager - ordered timer set

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use fiberio_core::ktrace;

use super::entry::{Timer, TimerCallback, TimerHandle};

type FrontHook = Box<dyn Fn() + Send + Sync + 'static>;

pub(crate) struct ManagerInner {
    timers: RwLock<BTreeMap<(Instant, u64), Arc<Timer>>>,
    next_id: AtomicU64,
    /// Front hook already fired since the last `next_timeout_ms`
    tickled: AtomicBool,
    front_hook: Option<FrontHook>,
}

/// Ordered set of one-shot and recurring timers
///
/// Cloning yields another handle to the same set.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<ManagerInner>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

fn ceil_ms(d: Duration) -> u64 {
    d.as_nanos().div_ceil(1_000_000) as u64
}

impl TimerManager {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// `hook` runs (outside the lock) when an insertion becomes the
    /// earliest deadline. It fires at most once between two calls of
    /// `next_timeout_ms`.
    pub fn with_front_hook<F>(hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(hook)))
    }

    fn build(front_hook: Option<FrontHook>) -> Self {
        TimerManager {
            inner: Arc::new(ManagerInner {
                timers: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                tickled: AtomicBool::new(false),
                front_hook,
            }),
        }
    }

    /// Fire `f` after `delay_ms`, and every `delay_ms` after that if
    /// `recurring`.
    pub fn add_timer<F>(&self, delay_ms: u64, f: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_callback(delay_ms, Arc::new(f), recurring)
    }

    pub fn add_callback(&self, delay_ms: u64, cb: TimerCallback, recurring: bool) -> TimerHandle {
        let period = Duration::from_millis(delay_ms);
        self.inner.add(Instant::now() + period, period, recurring, cb)
    }

    /// Like `add_timer`, but `f` only runs while `cond` can be upgraded.
    pub fn add_condition_timer<F, W>(
        &self,
        delay_ms: u64,
        f: F,
        cond: Weak<W>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        W: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            delay_ms,
            move || {
                if cond.upgrade().is_some() {
                    f();
                }
            },
            recurring,
        )
    }

    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        self.inner.cancel(&handle.timer)
    }

    pub fn refresh(&self, handle: &TimerHandle) -> bool {
        self.inner.refresh(&handle.timer)
    }

    pub fn reset(
        &self,
        handle: &TimerHandle,
        delay_ms: u64,
        callback: Option<TimerCallback>,
        recurring: bool,
    ) -> bool {
        self.inner.reset(&handle.timer, delay_ms, callback, recurring)
    }

    /// Milliseconds until the earliest deadline, rounded up.
    /// `None` when no timer is pending, `Some(0)` when one is due.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        self.inner.tickled.store(false, Ordering::Release);
        let timers = self.inner.read();
        let (&(deadline, _), _) = timers.first_key_value()?;
        let now = Instant::now();
        if deadline <= now {
            Some(0)
        } else {
            Some(ceil_ms(deadline - now))
        }
    }

    /// Move the callbacks of every due timer into `out`.
    ///
    /// One-shot timers are removed; recurring ones are reinserted one
    /// period after now.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = Instant::now();
        let mut timers = self.inner.write();
        match timers.first_key_value() {
            Some((&(deadline, _), _)) if deadline <= now => {}
            _ => return,
        }

        let pending = timers.split_off(&(now, u64::MAX));
        let expired = std::mem::replace(&mut *timers, pending);

        for (_, timer) in expired {
            let mut slot = timer.slot();
            let Some(cb) = slot.callback.clone() else {
                continue;
            };
            out.push(cb);
            if slot.recurring {
                slot.deadline = now + slot.period;
                timers.insert((slot.deadline, timer.id), Arc::clone(&timer));
            } else {
                slot.callback = None;
            }
        }
        ktrace!("collected {} expired timers, {} left", out.len(), timers.len());
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }

    #[cfg(test)]
    pub(crate) fn add_at(&self, deadline: Instant, cb: TimerCallback) -> TimerHandle {
        self.inner.add(deadline, Duration::ZERO, false, cb)
    }
}

impl ManagerInner {
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<(Instant, u64), Arc<Timer>>> {
        self.timers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<(Instant, u64), Arc<Timer>>> {
        self.timers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn add(
        self: &Arc<Self>,
        deadline: Instant,
        period: Duration,
        recurring: bool,
        cb: TimerCallback,
    ) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timer = Arc::new(Timer::new(id, deadline, period, recurring, cb, Arc::downgrade(self)));
        self.insert(Arc::clone(&timer), deadline);
        TimerHandle { timer }
    }

    fn insert(&self, timer: Arc<Timer>, deadline: Instant) {
        let key = (deadline, timer.id);
        let at_front = {
            let mut timers = self.write();
            timers.insert(key, timer);
            let front = timers.first_key_value().map(|(k, _)| *k == key).unwrap_or(false);
            front && !self.tickled.swap(true, Ordering::AcqRel)
        };
        if at_front {
            if let Some(hook) = &self.front_hook {
                hook();
            }
        }
    }

    pub(crate) fn cancel(&self, timer: &Arc<Timer>) -> bool {
        let mut timers = self.write();
        let mut slot = timer.slot();
        if slot.callback.take().is_none() {
            return false;
        }
        timers.remove(&(slot.deadline, timer.id));
        true
    }

    pub(crate) fn refresh(&self, timer: &Arc<Timer>) -> bool {
        let mut timers = self.write();
        let mut slot = timer.slot();
        if slot.callback.is_none() {
            return false;
        }
        if timers.remove(&(slot.deadline, timer.id)).is_none() {
            return false;
        }
        slot.deadline = Instant::now() + slot.period;
        timers.insert((slot.deadline, timer.id), Arc::clone(timer));
        true
    }

    pub(crate) fn reset(
        &self,
        timer: &Arc<Timer>,
        delay_ms: u64,
        callback: Option<TimerCallback>,
        recurring: bool,
    ) -> bool {
        let deadline = {
            let mut timers = self.write();
            let mut slot = timer.slot();
            if slot.callback.is_none() {
                return false;
            }
            if timers.remove(&(slot.deadline, timer.id)).is_none() {
                return false;
            }
            slot.period = Duration::from_millis(delay_ms);
            slot.deadline = Instant::now() + slot.period;
            slot.recurring = recurring;
            if let Some(cb) = callback {
                slot.callback = Some(cb);
            }
            slot.deadline
        };
        self.insert(Arc::clone(timer), deadline);
        true
    }
}
