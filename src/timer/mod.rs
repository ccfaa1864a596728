//! Coarse timers, offered by two interchangeable backends.
//!
//! Both backends sit behind the same operations on
//! [`LoopHandle`](crate::LoopHandle); which one a loop uses is fixed at
//! construction with [`TimerBackend`].
//!
//! The kernel backend gives every timer its own `timerfd`, folded back
//! into the poll registry; expirations are kernel-accurate and repeating
//! timers are native. The list backend keeps a sorted countdown list that
//! only advances when the loop wakes, which is as coarse as it sounds;
//! it is meant for IO timeouts, not scheduling. List timers are one-shot,
//! and registering a new timer from the callback is the repeat pattern.

mod list;
mod timerfd;

pub(crate) use list::{ListTimers, TimerFn};
pub(crate) use timerfd::FdTimers;

/// Which timer implementation a loop uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerBackend {
    /// One kernel `timerfd` per timer, polled like any other descriptor.
    TimerFd,
    /// A countdown list advanced at loop wakes.
    List,
}

impl Default for TimerBackend {
    fn default() -> TimerBackend {
        TimerBackend::TimerFd
    }
}

pub(crate) enum Timers {
    Fd(FdTimers),
    List(ListTimers),
}

impl Timers {
    pub(crate) fn new(backend: TimerBackend) -> Timers {
        match backend {
            TimerBackend::TimerFd => Timers::Fd(FdTimers::new()),
            TimerBackend::List => Timers::List(ListTimers::new()),
        }
    }

    pub(crate) fn is_kernel(&self) -> bool {
        matches!(self, Timers::Fd(_))
    }
}
