//! Edge-triggered epoll reactor
//!
//! ```text
//!   add_event(fd, READ) ──► FdEventContext[fd] ── epoll_ctl(ADD|MOD, ET)
//!                                   ▲
//!   idle(): epoll_wait ─────────────┘ ready bits ──► fire waiter ──► Scheduler
//!           timers.collect_expired ───────────────► submit callbacks
//! ```
//!
//! Each descriptor has one `FdEventContext` (indexed by fd) holding the
//! registered mask and at most one waiter per direction. A waiter fires
//! once: the direction is removed from the kernel registration before it
//! is scheduled, so a fiber that wants more must register again.

use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use libc::c_int;
use nix::errno::Errno;

use fiberio_core::{kdebug, kerror, ktrace, kwarn};
use fiberio_core::{Event, RuntimeError, RuntimeResult};

use super::tickle::{TicklePipe, TICKLE_TOKEN};
use crate::config::RuntimeConfig;
use crate::fiber::Fiber;
use crate::hook::sys::{errno, LibcSyscalls, RealSyscalls};
use crate::scheduler::{Callback, Job, Reactor, Scheduler, Task, WeakScheduler};
use crate::timer::TimerManager;

const INITIAL_CONTEXTS: usize = 64;

enum Waiter {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

#[derive(Default)]
struct EventSlot {
    sched: Option<WeakScheduler>,
    waiter: Option<Waiter>,
}

impl EventSlot {
    fn fire(self, fd: RawFd, event: Event) {
        let Some(waiter) = self.waiter else {
            return;
        };
        let Some(sched) = self.sched.and_then(|s| s.upgrade()) else {
            kwarn!("fd {} {} waiter dropped: scheduler gone", fd, event);
            return;
        };
        ktrace!("fd {} {} fired", fd, event);
        match waiter {
            Waiter::Fiber(fiber) => sched.submit_fiber(fiber, None),
            Waiter::Call(cb) => sched.schedule(Job { task: Task::Call(cb), worker: None }),
        }
    }
}

#[derive(Default)]
struct EventState {
    events: Event,
    read: EventSlot,
    write: EventSlot,
}

impl EventState {
    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Detach the waiters of `ready`
    fn take(&mut self, ready: Event) -> Vec<(Event, EventSlot)> {
        let mut out = Vec::with_capacity(2);
        for ev in [Event::READ, Event::WRITE] {
            if ready.contains(ev) {
                out.push((ev, std::mem::take(self.slot_mut(ev))));
            }
        }
        out
    }
}

/// Registered interest and waiters of one descriptor
pub struct FdEventContext {
    fd: RawFd,
    state: Mutex<EventState>,
}

impl FdEventContext {
    fn new(fd: RawFd) -> Self {
        FdEventContext { fd, state: Mutex::new(EventState::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> Event {
        self.lock().events
    }
}

impl fmt::Debug for FdEventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdEventContext")
            .field("fd", &self.fd)
            .field("events", &self.events())
            .finish()
    }
}

fn op_name(op: c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        _ => "DEL",
    }
}

pub struct EpollReactor {
    epfd: RawFd,
    tickle: TicklePipe,
    contexts: RwLock<Vec<Arc<FdEventContext>>>,
    /// Registered (fd, direction) pairs
    pending: AtomicUsize,
    timers: TimerManager,
    max_timeout: Duration,
    batch: usize,
    sys: LibcSyscalls,
}

impl EpollReactor {
    pub fn new(config: &RuntimeConfig) -> RuntimeResult<Arc<EpollReactor>> {
        let sys = LibcSyscalls::new();
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            let e = errno();
            kerror!("epoll_create1 failed: {}", Errno::from_raw(e).desc());
            return Err(RuntimeError::Epoll(e));
        }

        let tickle = match TicklePipe::new() {
            Ok(t) => t,
            Err(e) => {
                sys.close(epfd);
                return Err(e);
            }
        };

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: TICKLE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle.read_fd(), &mut ev) } != 0 {
            let e = errno();
            sys.close(epfd);
            return Err(RuntimeError::EpollCtl { fd: tickle.read_fd(), op: "ADD", errno: e });
        }

        let contexts = (0..INITIAL_CONTEXTS as RawFd)
            .map(|fd| Arc::new(FdEventContext::new(fd)))
            .collect();

        Ok(Arc::new_cyclic(|weak: &Weak<EpollReactor>| {
            let weak = weak.clone();
            EpollReactor {
                epfd,
                tickle,
                contexts: RwLock::new(contexts),
                pending: AtomicUsize::new(0),
                // A new earliest deadline must shorten a running epoll_wait
                timers: TimerManager::with_front_hook(move || {
                    if let Some(reactor) = weak.upgrade() {
                        reactor.tickle.notify();
                    }
                }),
                max_timeout: config.epoll_max_timeout,
                batch: config.epoll_batch,
                sys,
            }
        }))
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdEventContext>> {
        if fd < 0 {
            return None;
        }
        let contexts = self.contexts.read().unwrap_or_else(|e| e.into_inner());
        contexts.get(fd as usize).cloned()
    }

    fn context(&self, fd: RawFd) -> Arc<FdEventContext> {
        if let Some(ctx) = self.lookup(fd) {
            return ctx;
        }
        let idx = fd as usize;
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        if idx >= contexts.len() {
            let grown = (idx + 1).max(idx * 3 / 2);
            let start = contexts.len();
            contexts.extend((start..grown).map(|fd| Arc::new(FdEventContext::new(fd as RawFd))));
        }
        Arc::clone(&contexts[idx])
    }

    fn ctl(&self, op: c_int, fd: RawFd, events: Event) -> RuntimeResult<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | events.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let e = errno();
            kerror!(
                "epoll_ctl({}, fd {}, {}) failed: {}",
                op_name(op),
                fd,
                events,
                Errno::from_raw(e).desc()
            );
            return Err(RuntimeError::EpollCtl { fd, op: op_name(op), errno: e });
        }
        Ok(())
    }

    /// Register a waiter for one direction of `fd`.
    ///
    /// `cb` runs as a job on `sched`; without one the current fiber is
    /// resumed, so the caller is expected to `yield_to_hold` next.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Callback>,
        sched: &Scheduler,
    ) -> RuntimeResult<()> {
        if fd < 0 {
            return Err(RuntimeError::Os(libc::EBADF));
        }
        if event != Event::READ && event != Event::WRITE {
            return Err(RuntimeError::Os(libc::EINVAL));
        }
        let waiter = match cb {
            Some(cb) => Waiter::Call(cb),
            None => {
                let fiber = Fiber::current();
                if fiber.is_root() {
                    return Err(RuntimeError::NotInScheduler);
                }
                Waiter::Fiber(fiber)
            }
        };

        let ctx = self.context(fd);
        let mut st = ctx.lock();
        if st.events.intersects(event) {
            kerror!("add_event: fd {} already has a {} waiter (registered {})", fd, event, st.events);
            return Err(RuntimeError::EventExists { fd, event });
        }

        let op = if st.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.ctl(op, fd, st.events | event)?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        st.events |= event;
        let slot = st.slot_mut(event);
        slot.sched = Some(sched.downgrade());
        slot.waiter = Some(waiter);
        ktrace!("fd {} waiting for {}", fd, event);
        Ok(())
    }

    /// Drop the waiter of `event` without running it
    pub fn delete_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let dropped = {
            let mut st = ctx.lock();
            if !st.events.intersects(event) {
                return false;
            }
            let ev = st.events & event;
            if self.update_interest(&mut st, fd, ev).is_err() {
                return false;
            }
            st.take(ev)
        };
        drop(dropped);
        true
    }

    /// Run the waiter of `event` now, as if the descriptor became ready
    pub fn trigger_event(&self, fd: RawFd, event: Event) -> bool {
        self.fire(fd, event)
    }

    /// Run every waiter of `fd` and remove it from epoll
    pub fn trigger_all(&self, fd: RawFd) -> bool {
        self.fire(fd, Event::ALL)
    }

    /// Registered directions of `fd`
    pub fn registered(&self, fd: RawFd) -> Event {
        self.lookup(fd).map(|ctx| ctx.events()).unwrap_or(Event::NONE)
    }

    fn fire(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let fired = {
            let mut st = ctx.lock();
            let ready = st.events & event;
            if ready.is_empty() {
                return false;
            }
            if self.update_interest(&mut st, fd, ready).is_err() {
                return false;
            }
            st.take(ready)
        };
        for (ev, slot) in fired {
            slot.fire(fd, ev);
        }
        true
    }

    /// Remove `gone` from the kernel registration and the pending count
    fn update_interest(&self, st: &mut EventState, fd: RawFd, gone: Event) -> RuntimeResult<()> {
        let left = st.events.without(gone);
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.ctl(op, fd, left)?;
        let n = [Event::READ, Event::WRITE].iter().filter(|&&e| gone.contains(e)).count();
        self.pending.fetch_sub(n, Ordering::SeqCst);
        st.events = left;
        Ok(())
    }

    fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: c_int) -> usize {
        loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as c_int, timeout_ms)
            };
            if n >= 0 {
                return n as usize;
            }
            let e = errno();
            if e != libc::EINTR {
                kerror!("epoll_wait failed: {}", Errno::from_raw(e).desc());
                return 0;
            }
        }
    }

    fn dispatch(&self, bits: u32, fd: RawFd) {
        let Some(ctx) = self.lookup(fd) else {
            return;
        };
        let fired = {
            let mut st = ctx.lock();
            let mut ready = Event::from_bits(bits);
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                ready |= Event::ALL;
            }
            let ready = ready & st.events;
            if ready.is_empty() {
                return;
            }
            if self.update_interest(&mut st, fd, ready).is_err() {
                return;
            }
            st.take(ready)
        };
        for (ev, slot) in fired {
            slot.fire(fd, ev);
        }
    }
}

impl Reactor for EpollReactor {
    fn idle(&self, sched: &Scheduler, may_block: bool) {
        let timeout_ms = if may_block {
            let cap = self.max_timeout.as_millis() as u64;
            self.timers
                .next_timeout_ms()
                .map_or(cap, |t| t.min(cap))
                .min(c_int::MAX as u64)
        } else {
            0
        };

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.batch];
        let n = self.wait(&mut events, timeout_ms as c_int);

        let mut expired = Vec::new();
        self.timers.collect_expired(&mut expired);
        for cb in expired {
            sched.submit(move || cb());
        }

        for ev in &events[..n] {
            let (bits, data) = (ev.events, ev.u64);
            if data == TICKLE_TOKEN {
                self.tickle.drain();
                continue;
            }
            self.dispatch(bits, data as RawFd);
        }
        if n > 0 {
            kdebug!("epoll pass: {} events, {} waiters left", n, self.pending_events());
        }
    }

    fn tickle(&self) {
        self.tickle.notify();
    }

    fn is_quiescent(&self) -> bool {
        self.pending_events() == 0 && !self.timers.has_timer()
    }

    fn hooks_enabled(&self) -> bool {
        true
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        let left = self.pending_events();
        if left > 0 {
            kwarn!("epoll reactor dropped with {} waiters", left);
        }
        self.sys.close(self.epfd);
    }
}
