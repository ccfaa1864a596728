//! The event loop itself: registry bookkeeping, the `ppoll` block and the
//! prepare → fire → check → dispatch lifecycle.
//!
//! [`EventHandler`] owns the loop. [`LoopHandle`] is a cheap clone of the
//! shared state used for every registration operation; being `Rc`-based it
//! cannot leave the owning thread, which pins all mutation to that thread
//! at compile time. The one cross-thread channel is [`LoopWaker`], which
//! flags the loop done and pokes the wake-up pipe.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::signal::{sigprocmask, SigmaskHow, Signal};
use nix::sys::signalfd::{siginfo, SfdFlags, SignalFd};
use nix::unistd;

use crate::error::InternalCodes;
use crate::handle::{HandleAllocator, PollHandle, SignalHandle, TimerHandle, MAX_POLL_HANDLE};
use crate::poll::{FdCallbacks, FdEvent, FdPollData, PollSource};
use crate::signals::{SignalFn, SignalWatch};
use crate::time;
use crate::timer::{FdTimers, TimerBackend, TimerFn, Timers};
use crate::wake;
use crate::{Error, Result};

/// Loop shutdown flag plus the write end of the wake-up pipe, the one
/// piece of state shared across threads.
pub(crate) struct Stop {
    done: AtomicBool,
    pipe: Option<OwnedFd>,
}

impl Stop {
    fn request(&self) {
        self.done.store(true, Ordering::Release);
    }

    fn wake(&self) {
        if let Some(fd) = &self.pipe {
            wake::notify(fd.as_raw_fd());
        }
    }
}

pub(crate) struct Inner {
    poll_keys: RefCell<HandleAllocator>,
    /// Registration order; the pollfd array is a projection of this.
    sources: RefCell<Vec<Rc<PollSource>>>,
    dirty: Cell<bool>,
    timers: RefCell<Timers>,
    signals: RefCell<SignalWatch>,
    signal_fd_handle: Cell<Option<PollHandle>>,
    stop: Arc<Stop>,
    codes: Cell<InternalCodes>,
    /// Read end of the wake-up pipe; registered like any other fd.
    wake_read: Option<OwnedFd>,
}

/// A fresh probe, immune to whatever `errno` an earlier call left behind.
fn fd_is_valid(fd: RawFd) -> bool {
    fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

fn drain_timer_fd(event: &FdEvent) -> io::Result<()> {
    let mut buf = [0u8; 8];
    match unistd::read(event.fd, &mut buf) {
        Ok(8) => Ok(()),
        Ok(n) => panic!("short read from timer fd: {} bytes", n),
        Err(Errno::EAGAIN) => Ok(()),
        Err(err) => panic!("failed to read from timer fd: {}", err),
    }
}

impl Inner {
    pub(crate) fn add_fd_poll(
        self: &Rc<Self>,
        fd: RawFd,
        events: PollFlags,
        callbacks: FdCallbacks,
    ) -> Result<PollHandle> {
        if !fd_is_valid(fd) {
            return Err(Error::NonExistent);
        }
        if self.sources.borrow().iter().any(|s| s.fd == fd) {
            // one registration per descriptor
            return Err(Error::NotPossible);
        }
        let handle = PollHandle::from_id(self.poll_keys.borrow_mut().next()?);
        self.sources.borrow_mut().push(Rc::new(PollSource {
            handle,
            fd,
            events: Cell::new(events),
            valid: Cell::new(true),
            callbacks: RefCell::new(callbacks),
        }));
        self.dirty.set(true);
        Ok(handle)
    }

    pub(crate) fn remove_fd_poll(&self, handle: PollHandle) -> Result<()> {
        let removed = {
            let mut sources = self.sources.borrow_mut();
            sources
                .iter()
                .position(|s| s.handle == handle)
                .map(|at| sources.remove(at))
        };
        match removed {
            Some(source) => {
                // the active snapshot may still hold this entry; clearing
                // the flag makes the remaining lifecycle stages skip it
                source.valid.set(false);
                self.poll_keys.borrow_mut().release(handle.get());
                self.dirty.set(true);
                Ok(())
            }
            None => Err(Error::Unknown),
        }
    }

    pub(crate) fn update_event_flags(&self, handle: PollHandle, events: PollFlags) -> Result<()> {
        let sources = self.sources.borrow();
        match sources.iter().find(|s| s.handle == handle) {
            Some(source) => {
                source.events.set(events);
                self.dirty.set(true);
                Ok(())
            }
            None => Err(Error::Unknown),
        }
    }

    pub(crate) fn get_fd_poll_data(&self, handle: PollHandle) -> Result<FdPollData> {
        let sources = self.sources.borrow();
        match sources.iter().find(|s| s.handle == handle) {
            Some(source) => Ok(FdPollData {
                fd: source.fd,
                events: source.events.get(),
            }),
            None => Err(Error::Unknown),
        }
    }

    fn running(&self) -> bool {
        !self.stop.done.load(Ordering::Acquire)
    }

    pub(crate) fn add_timer(
        self: &Rc<Self>,
        duration: Duration,
        callback: impl FnMut(TimerHandle) + 'static,
        repeats: bool,
    ) -> Result<TimerHandle> {
        if duration.is_zero() {
            return Err(Error::NotPossible);
        }
        let callback: TimerFn = Rc::new(RefCell::new(callback));
        if self.timers.borrow().is_kernel() {
            let tfd = FdTimers::create(duration, repeats)?;
            let raw = tfd.as_raw_fd();
            let user = callback;
            let callbacks = FdCallbacks::new()
                .on_fired(drain_timer_fd)
                .on_check(move |handle| {
                    (user.borrow_mut())(TimerHandle::from_id(handle.get()));
                    false
                });
            let poll_handle = self.add_fd_poll(raw, PollFlags::POLLIN, callbacks)?;
            let handle = TimerHandle::from_id(poll_handle.get());
            if let Timers::Fd(timers) = &mut *self.timers.borrow_mut() {
                timers.insert(handle, tfd, duration, repeats);
            }
            Ok(handle)
        } else {
            if repeats {
                log::warn!("list timer backend is one-shot, ignoring `repeats`");
            }
            let running = self.running();
            let now = Instant::now();
            match &mut *self.timers.borrow_mut() {
                Timers::List(timers) => timers.add(duration, callback, running, now),
                Timers::Fd(_) => unreachable!("backend fixed at construction"),
            }
        }
    }

    pub(crate) fn remove_timer(&self, handle: TimerHandle) -> Result<()> {
        match &mut *self.timers.borrow_mut() {
            Timers::Fd(timers) => timers.remove(handle)?,
            Timers::List(timers) => return timers.remove(handle),
        }
        // the fd waits on the deferred-close list; its poll registration
        // goes away right now
        self.remove_fd_poll(PollHandle::from_id(handle.get()))
            .map_err(|_| Error::NonExistent)
    }

    pub(crate) fn update_timer(&self, handle: TimerHandle, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Err(Error::NotPossible);
        }
        let running = self.running();
        let now = Instant::now();
        match &mut *self.timers.borrow_mut() {
            Timers::Fd(timers) => timers.update(handle, duration),
            Timers::List(timers) => timers.update(handle, duration, running, now),
        }
    }

    pub(crate) fn restart_timer(&self, handle: TimerHandle) -> Result<()> {
        let running = self.running();
        let now = Instant::now();
        match &mut *self.timers.borrow_mut() {
            Timers::Fd(timers) => timers.restart(handle),
            Timers::List(timers) => timers.restart(handle, running, now),
        }
    }

    pub(crate) fn stop_timer(&self, handle: TimerHandle) -> Result<()> {
        match &mut *self.timers.borrow_mut() {
            Timers::Fd(timers) => timers.stop(handle),
            Timers::List(timers) => timers.stop(handle),
        }
    }

    pub(crate) fn listen_to_signals(self: &Rc<Self>, signals: &[Signal]) -> Result<()> {
        if signals.is_empty() {
            log::warn!("empty signal list");
            return Err(Error::NotPossible);
        }
        let mask = SignalWatch::mask_of(signals);
        // the kernel only routes blocked signals through a signalfd
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).map_err(|err| {
            log::error!("could not block signals: {}", err);
            Error::NotPossible
        })?;

        // a previous registration may have been removed behind our back
        if let Some(handle) = self.signal_fd_handle.get() {
            if self.get_fd_poll_data(handle).is_err() {
                self.signal_fd_handle.set(None);
                self.signals.borrow_mut().fd = None;
            }
        }

        if self.signal_fd_handle.get().is_some() {
            let mut watch = self.signals.borrow_mut();
            let sfd = watch.fd.as_mut().expect("registered signal fd is present");
            return sfd.set_mask(&mask).map_err(|err| {
                log::error!("could not update signal fd: {}", err);
                Error::NotPossible
            });
        }

        let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK).map_err(|err| {
            log::error!("could not open signal fd: {}", err);
            Error::NotPossible
        })?;
        let raw = sfd.as_raw_fd();
        self.signals.borrow_mut().fd = Some(sfd);

        let weak = Rc::downgrade(self);
        let callbacks = FdCallbacks::new()
            .on_fired(move |_event| {
                if let Some(inner) = weak.upgrade() {
                    inner.fan_out_signal();
                }
                Ok(())
            })
            .on_check(|_| false);
        match self.add_fd_poll(
            raw,
            PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP,
            callbacks,
        ) {
            Ok(handle) => {
                self.signal_fd_handle.set(Some(handle));
                Ok(())
            }
            Err(err) => {
                self.signals.borrow_mut().fd = None;
                log::error!("could not register signal fd: {}", err);
                Err(Error::NotPossible)
            }
        }
    }

    fn fan_out_signal(&self) {
        let info = match self.signals.borrow_mut().read_one() {
            Some(info) => info,
            None => return,
        };
        let listeners = self.signals.borrow().snapshot();
        for (handle, callback) in listeners {
            (callback.borrow_mut())(handle, info);
        }
    }

    pub(crate) fn add_signal_handler(
        &self,
        callback: impl FnMut(SignalHandle, siginfo) + 'static,
    ) -> Result<SignalHandle> {
        let callback: SignalFn = Rc::new(RefCell::new(callback));
        self.signals.borrow_mut().add_listener(callback)
    }

    pub(crate) fn remove_signal_handler(&self, handle: SignalHandle) -> Result<()> {
        self.signals.borrow_mut().remove_listener(handle)
    }
}

/// A single-threaded, callback-based event loop multiplexing file
/// descriptors, timers and UNIX signals over one blocking `ppoll`.
pub struct EventHandler {
    inner: Rc<Inner>,
}

impl EventHandler {
    /// A handler with the default timer backend.
    pub fn new() -> EventHandler {
        Self::with_timer_backend(TimerBackend::default())
    }

    /// A handler with an explicitly chosen timer backend.
    ///
    /// Construction failures (the wake-up pipe, its registration) are
    /// recorded rather than returned; query them with
    /// [`fatal_error_occurred`](Self::fatal_error_occurred).
    pub fn with_timer_backend(backend: TimerBackend) -> EventHandler {
        let mut codes = InternalCodes::empty();
        let (wake_read, wake_write) = match wake::make_wake_pipe() {
            Ok((read, write)) => (Some(read), Some(write)),
            Err(err) => {
                log::error!("could not create wake-up pipe: {}", err);
                codes |= InternalCodes::PIPE_ERROR;
                (None, None)
            }
        };
        let inner = Rc::new(Inner {
            poll_keys: RefCell::new(HandleAllocator::new(MAX_POLL_HANDLE)),
            sources: RefCell::new(Vec::new()),
            dirty: Cell::new(true),
            timers: RefCell::new(Timers::new(backend)),
            signals: RefCell::new(SignalWatch::new()),
            signal_fd_handle: Cell::new(None),
            stop: Arc::new(Stop {
                done: AtomicBool::new(true),
                pipe: wake_write,
            }),
            codes: Cell::new(codes),
            wake_read,
        });
        if let Some(fd) = inner.wake_read.as_ref().map(|f| f.as_raw_fd()) {
            // nothing to process here, the pipe only breaks ppoll out of
            // its block
            let callbacks = FdCallbacks::new()
                .on_fired(|event| wake::drain(event.fd))
                .on_check(|_| false);
            if inner.add_fd_poll(fd, PollFlags::POLLIN, callbacks).is_err() {
                inner.codes.set(inner.codes.get() | InternalCodes::FD_ERROR);
            }
        }
        EventHandler { inner }
    }

    /// Handle for registrations; cloneable and usable from inside
    /// callbacks.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: self.inner.clone(),
        }
    }

    /// A `Send + Sync` handle that ends a running loop from any thread.
    pub fn waker(&self) -> LoopWaker {
        LoopWaker {
            stop: self.inner.stop.clone(),
        }
    }

    /// Whether construction recorded a fatal fault.
    pub fn fatal_error_occurred(&self) -> bool {
        self.inner
            .codes
            .get()
            .intersects(InternalCodes::PIPE_ERROR | InternalCodes::FD_ERROR)
    }

    /// The raw construction fault codes.
    pub fn internal_codes(&self) -> InternalCodes {
        self.inner.codes.get()
    }

    /// Flags the loop done; it returns after finishing the current
    /// iteration.
    pub fn stop_listening(&self) {
        self.inner.stop.request();
    }

    /// Flags the loop done and pokes the wake-up pipe so a blocked wait
    /// returns immediately.
    pub fn exit_mainloop(&self) {
        self.inner.stop.request();
        self.inner.stop.wake();
    }

    /// Runs the loop until it is flagged done.
    ///
    /// Every iteration rebuilds the pollfd array if the registry changed,
    /// runs `prepare` over the active snapshot, blocks in `ppoll`, then
    /// drives fire, check and dispatch over the ready entries. `EINTR`
    /// counts as "nothing ready"; any other `ppoll` failure is returned.
    pub fn start_listening(&mut self) -> Result<()> {
        if self.fatal_error_occurred() {
            return Err(Error::NotPossible);
        }
        let inner = self.inner.clone();
        inner.stop.done.store(false, Ordering::Release);
        if let Timers::List(timers) = &mut *inner.timers.borrow_mut() {
            timers.begin(Instant::now());
        }

        // per-run state: the active snapshot and its pollfd projection,
        // index-aligned until the next rebuild
        let mut active: Vec<Rc<PollSource>> = Vec::new();
        let mut pollfds: Vec<PollFd> = Vec::new();
        let mut fired: Vec<Rc<PollSource>> = Vec::new();

        while !inner.stop.done.load(Ordering::Acquire) {
            if inner.dirty.get() {
                if let Timers::Fd(timers) = &mut *inner.timers.borrow_mut() {
                    timers.close_removed();
                }
                active = inner.sources.borrow().clone();
                inner.dirty.set(false);
                pollfds.clear();
                for source in &active {
                    source.prepare();
                    pollfds.push(PollFd::new(source.fd, source.events.get()));
                }
            } else {
                for source in &active {
                    source.prepare();
                }
            }

            Self::fire_due_timers(&inner, |timers, now| timers.correction(now));

            let timeout = match &*inner.timers.borrow() {
                Timers::List(timers) => timers.next_timeout().map(time::to_timespec),
                Timers::Fd(_) => None,
            };

            let ready = match ppoll(&mut pollfds, timeout, None) {
                Ok(n) => n,
                // a signal came in, treat it as "nothing ready"
                Err(Errno::EINTR) => 0,
                Err(err) => {
                    log::error!("ppoll returned with error: {}", err);
                    return Err(err.into());
                }
            };

            if ready != 0 {
                fired.clear();
                for (at, pollfd) in pollfds.iter().enumerate() {
                    let source = &active[at];
                    // mask against the interest frozen into the pollfd at
                    // rebuild time; the live Cell may already carry a
                    // same-iteration update_event_flags change
                    let revents = pollfd.revents().unwrap_or_else(PollFlags::empty)
                        & (pollfd.events()
                            | PollFlags::POLLERR
                            | PollFlags::POLLHUP);
                    if revents.is_empty() {
                        continue;
                    }
                    fired.push(source.clone());
                    source.fire(&FdEvent {
                        fd: source.fd,
                        revents,
                        handle: source.handle,
                    });
                }

                fired.retain(|source| source.wants_dispatch());

                while !fired.is_empty() {
                    fired.retain(|source| source.keep_dispatching());
                }
            } else {
                Self::fire_due_timers(&inner, |timers, now| timers.timer_up(now));
            }
        }

        // countdowns stay meaningful across a stop/start cycle
        if let Timers::List(timers) = &mut *inner.timers.borrow_mut() {
            timers.halt(Instant::now());
        }
        Ok(())
    }

    /// Collects due list timers under the borrow, fires them outside it so
    /// callbacks may re-enter the timer API.
    fn fire_due_timers(
        inner: &Rc<Inner>,
        collect: impl FnOnce(&mut crate::timer::ListTimers, Instant) -> Vec<(TimerHandle, TimerFn)>,
    ) {
        let due = match &mut *inner.timers.borrow_mut() {
            Timers::List(timers) => collect(timers, Instant::now()),
            Timers::Fd(_) => Vec::new(),
        };
        for (handle, callback) in due {
            (callback.borrow_mut())(handle);
        }
    }
}

impl Default for EventHandler {
    fn default() -> EventHandler {
        EventHandler::new()
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventHandler { .. }")
    }
}

/// A handle to the loop's registries.
///
/// It can be cloned and used from inside any callback; changes made while
/// an iteration runs take effect at the next one, except that removals
/// invalidate the affected entry for the rest of the current iteration.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Rc<Inner>,
}

impl LoopHandle {
    /// Registers a file descriptor. Fails with [`Error::NonExistent`] if
    /// `fd` is not an open descriptor, [`Error::NotPossible`] if it is
    /// already registered and [`Error::TooMany`] on handle exhaustion.
    pub fn add_fd_poll(
        &self,
        fd: RawFd,
        events: PollFlags,
        callbacks: FdCallbacks,
    ) -> Result<PollHandle> {
        self.inner.add_fd_poll(fd, events, callbacks)
    }

    /// Removes a registration. The descriptor itself stays open, it is
    /// the caller's.
    pub fn remove_fd_poll(&self, handle: PollHandle) -> Result<()> {
        self.inner.remove_fd_poll(handle)
    }

    /// Replaces the interest mask of a registration.
    pub fn update_event_flags(&self, handle: PollHandle, events: PollFlags) -> Result<()> {
        self.inner.update_event_flags(handle, events)
    }

    /// Read-only view of a registration.
    pub fn get_fd_poll_data(&self, handle: PollHandle) -> Result<FdPollData> {
        self.inner.get_fd_poll_data(handle)
    }

    /// Arms a timer. `duration` must be non-zero; `repeats` is honored by
    /// the kernel timer backend only.
    pub fn add_timer(
        &self,
        duration: Duration,
        callback: impl FnMut(TimerHandle) + 'static,
        repeats: bool,
    ) -> Result<TimerHandle> {
        self.inner.add_timer(duration, callback, repeats)
    }

    /// Removes a timer. With the kernel backend the fd is closed at the
    /// top of the next iteration, once the current snapshot is gone.
    pub fn remove_timer(&self, handle: TimerHandle) -> Result<()> {
        self.inner.remove_timer(handle)
    }

    /// Re-arms a timer with a new duration.
    pub fn update_timer(&self, handle: TimerHandle, duration: Duration) -> Result<()> {
        self.inner.update_timer(handle, duration)
    }

    /// Re-arms a timer with its stored duration.
    pub fn restart_timer(&self, handle: TimerHandle) -> Result<()> {
        self.inner.restart_timer(handle)
    }

    /// Disarms a timer without removing it.
    pub fn stop_timer(&self, handle: TimerHandle) -> Result<()> {
        self.inner.stop_timer(handle)
    }

    /// Blocks `signals` process-wide and routes them through a single
    /// `signalfd` registered with the loop. A later call replaces the
    /// fd's mask with the new set (earlier signals stay blocked).
    pub fn listen_to_signals(&self, signals: &[Signal]) -> Result<()> {
        self.inner.listen_to_signals(signals)
    }

    /// Subscribes a callback to every signal the loop listens to.
    pub fn add_signal_handler(
        &self,
        callback: impl FnMut(SignalHandle, siginfo) + 'static,
    ) -> Result<SignalHandle> {
        self.inner.add_signal_handler(callback)
    }

    pub fn remove_signal_handler(&self, handle: SignalHandle) -> Result<()> {
        self.inner.remove_signal_handler(handle)
    }

    /// See [`EventHandler::stop_listening`].
    pub fn stop_listening(&self) {
        self.inner.stop.request();
    }

    /// See [`EventHandler::exit_mainloop`].
    pub fn exit_mainloop(&self) {
        self.inner.stop.request();
        self.inner.stop.wake();
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoopHandle { .. }")
    }
}

/// Ends a running loop from any thread: flags it done and pokes the
/// wake-up pipe so a blocked `ppoll` returns at once.
#[derive(Clone)]
pub struct LoopWaker {
    stop: Arc<Stop>,
}

impl LoopWaker {
    pub fn exit_mainloop(&self) {
        self.stop.request();
        self.stop.wake();
    }
}

impl fmt::Debug for LoopWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoopWaker { .. }")
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;

    #[test]
    fn construction_is_clean() {
        let handler = EventHandler::new();
        assert!(!handler.fatal_error_occurred());
        assert_eq!(handler.internal_codes(), InternalCodes::empty());
    }

    #[test]
    fn bad_fd_is_rejected() {
        let handler = EventHandler::new();
        let ret = handler
            .handle()
            .add_fd_poll(420, PollFlags::POLLIN, FdCallbacks::new());
        assert!(matches!(ret, Err(Error::NonExistent)));
    }

    #[test]
    fn duplicate_fd_is_rejected() {
        let handler = EventHandler::new();
        let handle = handler.handle();
        let (read, _write) = wake::make_wake_pipe().unwrap();
        let fd = read.as_raw_fd();
        handle
            .add_fd_poll(fd, PollFlags::POLLIN, FdCallbacks::new())
            .unwrap();
        let ret = handle.add_fd_poll(fd, PollFlags::POLLIN, FdCallbacks::new());
        assert!(matches!(ret, Err(Error::NotPossible)));
    }

    #[test]
    fn removed_handles_stop_resolving() {
        let handler = EventHandler::new();
        let handle = handler.handle();
        let (read, _write) = wake::make_wake_pipe().unwrap();
        let poll = handle
            .add_fd_poll(read.as_raw_fd(), PollFlags::POLLIN, FdCallbacks::new())
            .unwrap();
        assert!(handle.get_fd_poll_data(poll).is_ok());
        handle.remove_fd_poll(poll).unwrap();
        assert!(matches!(handle.get_fd_poll_data(poll), Err(Error::Unknown)));
        assert!(matches!(handle.remove_fd_poll(poll), Err(Error::Unknown)));
    }

    #[test]
    fn update_event_flags_round_trips() {
        let handler = EventHandler::new();
        let handle = handler.handle();
        let (read, _write) = wake::make_wake_pipe().unwrap();
        let poll = handle
            .add_fd_poll(read.as_raw_fd(), PollFlags::POLLIN, FdCallbacks::new())
            .unwrap();
        handle
            .update_event_flags(poll, PollFlags::POLLOUT)
            .unwrap();
        let data = handle.get_fd_poll_data(poll).unwrap();
        assert_eq!(data.events, PollFlags::POLLOUT);
        assert_eq!(data.fd, read.as_raw_fd());
    }

    #[test]
    fn zero_duration_timers_are_rejected() {
        let handler = EventHandler::new();
        let ret = handler
            .handle()
            .add_timer(Duration::ZERO, |_| {}, false);
        assert!(matches!(ret, Err(Error::NotPossible)));
    }

    #[test]
    fn wakeup_from_another_thread() {
        let mut handler = EventHandler::new();
        let waker = handler.waker();

        let begun = Instant::now();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            waker.exit_mainloop();
        });

        // no ready sources, no timers: only the waker can end this
        handler.start_listening().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_flag_set_before_start_is_honored() {
        // exit_mainloop before start_listening: the loop must still run
        // (the flag is re-armed at entry)
        let mut handler = EventHandler::new();
        let handle = handler.handle();
        handler.exit_mainloop();

        let ran = Rc::new(Cell::new(false));
        let observed = ran.clone();
        let stopper = handle.clone();
        handle
            .add_timer(
                Duration::from_millis(20),
                move |_| {
                    observed.set(true);
                    stopper.stop_listening();
                },
                false,
            )
            .unwrap();
        handler.start_listening().unwrap();
        assert!(ran.get());
    }
}
