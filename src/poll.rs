//! Fd registrations: the capability set of lifecycle callbacks and the
//! registry entry wrapping them.
//!
//! A registration carries up to four callbacks, one per lifecycle stage.
//! All of them are optional; each captures whatever state it needs
//! (typically behind an `Rc`), there is no separate user-data slot.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use nix::poll::PollFlags;

use crate::handle::PollHandle;

/// A ready file descriptor, as seen by a `fired` callback.
#[derive(Debug, Clone, Copy)]
pub struct FdEvent {
    /// The registered file descriptor.
    pub fd: RawFd,
    /// Ready events, already masked with the registered interest plus
    /// `POLLERR | POLLHUP`.
    pub revents: PollFlags,
    /// Handle of the registration.
    pub handle: PollHandle,
}

pub(crate) type PrepareFn = Box<dyn FnMut(PollHandle)>;
pub(crate) type FiredFn = Box<dyn FnMut(&FdEvent) -> io::Result<()>>;
pub(crate) type CheckFn = Box<dyn FnMut(PollHandle) -> bool>;
pub(crate) type DispatchFn = Box<dyn FnMut(PollHandle) -> bool>;

/// The lifecycle capabilities of an fd registration.
///
/// - `prepare` runs before every blocking wait;
/// - `fired` runs when the descriptor became ready, with the masked
///   `revents`; an `Err` is logged and the iteration continues;
/// - `check` decides whether the entry joins the dispatch round;
/// - `dispatch` delivers data, returning `true` to be called again in the
///   same iteration (the backpressure hook).
#[derive(Default)]
pub struct FdCallbacks {
    pub(crate) prepare: Option<PrepareFn>,
    pub(crate) fired: Option<FiredFn>,
    pub(crate) check: Option<CheckFn>,
    pub(crate) dispatch: Option<DispatchFn>,
}

impl FdCallbacks {
    pub fn new() -> FdCallbacks {
        FdCallbacks::default()
    }

    pub fn on_prepare(mut self, f: impl FnMut(PollHandle) + 'static) -> Self {
        self.prepare = Some(Box::new(f));
        self
    }

    pub fn on_fired(mut self, f: impl FnMut(&FdEvent) -> io::Result<()> + 'static) -> Self {
        self.fired = Some(Box::new(f));
        self
    }

    pub fn on_check(mut self, f: impl FnMut(PollHandle) -> bool + 'static) -> Self {
        self.check = Some(Box::new(f));
        self
    }

    pub fn on_dispatch(mut self, f: impl FnMut(PollHandle) -> bool + 'static) -> Self {
        self.dispatch = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for FdCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdCallbacks")
            .field("prepare", &self.prepare.is_some())
            .field("fired", &self.fired.is_some())
            .field("check", &self.check.is_some())
            .field("dispatch", &self.dispatch.is_some())
            .finish()
    }
}

/// Read-only view of a registration, as returned by
/// [`get_fd_poll_data`](crate::LoopHandle::get_fd_poll_data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdPollData {
    pub fd: RawFd,
    pub events: PollFlags,
}

/// One registry entry. Shared (`Rc`) between the registry and the loop's
/// active snapshot, so clearing `valid` on removal is visible to both.
pub(crate) struct PollSource {
    pub(crate) handle: PollHandle,
    pub(crate) fd: RawFd,
    pub(crate) events: Cell<PollFlags>,
    pub(crate) valid: Cell<bool>,
    pub(crate) callbacks: RefCell<FdCallbacks>,
}

impl PollSource {
    pub(crate) fn prepare(&self) {
        if !self.valid.get() {
            return;
        }
        if let Some(prepare) = self.callbacks.borrow_mut().prepare.as_mut() {
            prepare(self.handle);
        }
    }

    pub(crate) fn fire(&self, event: &FdEvent) {
        if let Some(fired) = self.callbacks.borrow_mut().fired.as_mut() {
            if let Err(err) = fired(event) {
                log::error!(
                    "fired callback for poll handle {} failed: {}",
                    self.handle.get(),
                    err
                );
            }
        }
    }

    /// Check stage: does this entry stay on the dispatch list?
    pub(crate) fn wants_dispatch(&self) -> bool {
        if !self.valid.get() {
            return false;
        }
        match self.callbacks.borrow_mut().check.as_mut() {
            Some(check) => check(self.handle),
            None => false,
        }
    }

    /// Dispatch micro-round: `true` to be called again in this iteration.
    pub(crate) fn keep_dispatching(&self) -> bool {
        if !self.valid.get() {
            return false;
        }
        match self.callbacks.borrow_mut().dispatch.as_mut() {
            Some(dispatch) => dispatch(self.handle),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_default_to_absent() {
        let callbacks = FdCallbacks::new();
        assert!(callbacks.prepare.is_none());
        assert!(callbacks.fired.is_none());
        assert!(callbacks.check.is_none());
        assert!(callbacks.dispatch.is_none());
    }

    #[test]
    fn invalid_entries_skip_every_stage() {
        let source = PollSource {
            handle: PollHandle::from_id(1),
            fd: 0,
            events: Cell::new(PollFlags::POLLIN),
            valid: Cell::new(false),
            callbacks: RefCell::new(
                FdCallbacks::new()
                    .on_check(|_| true)
                    .on_dispatch(|_| true),
            ),
        };
        assert!(!source.wants_dispatch());
        assert!(!source.keep_dispatching());
    }
}
