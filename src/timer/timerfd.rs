//! Kernel timer backend: one `timerfd` per timer.
//!
//! The fd itself lives here; its poll registration (the `fired` that
//! drains the expiration counter and the `check` that runs the user
//! callback) is wired up by the loop when the timer is added. Removal is
//! two-phased: the poll registration goes away at once, the fd moves to a
//! deferred-close list and is only dropped at the top of the next rebuild,
//! after the iteration that could still reference it has let go of its
//! snapshot.

use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::handle::TimerHandle;
use crate::{Error, Result};

struct FdTimer {
    handle: TimerHandle,
    tfd: TimerFd,
    duration: Duration,
    repeats: bool,
}

pub(crate) struct FdTimers {
    timers: Vec<FdTimer>,
    /// Poll registrations already removed; fds close at the next rebuild.
    removed: Vec<TimerFd>,
}

impl FdTimers {
    pub(crate) fn new() -> FdTimers {
        FdTimers {
            timers: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// A fresh, armed kernel timer on the monotonic clock.
    pub(crate) fn create(duration: Duration, repeats: bool) -> Result<TimerFd> {
        let tfd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        arm(&tfd, expiration(duration, repeats))?;
        Ok(tfd)
    }

    pub(crate) fn insert(
        &mut self,
        handle: TimerHandle,
        tfd: TimerFd,
        duration: Duration,
        repeats: bool,
    ) {
        self.timers.push(FdTimer {
            handle,
            tfd,
            duration,
            repeats,
        });
    }

    fn find(&self, handle: TimerHandle) -> Result<usize> {
        self.timers
            .iter()
            .position(|t| t.handle == handle)
            .ok_or(Error::NonExistent)
    }

    /// Hands the fd over to the deferred-close list. The caller removes
    /// the poll registration.
    pub(crate) fn remove(&mut self, handle: TimerHandle) -> Result<()> {
        let at = self.find(handle)?;
        let timer = self.timers.remove(at);
        self.removed.push(timer.tfd);
        Ok(())
    }

    pub(crate) fn update(&mut self, handle: TimerHandle, duration: Duration) -> Result<()> {
        let at = self.find(handle)?;
        let timer = &mut self.timers[at];
        timer.duration = duration;
        arm(&timer.tfd, expiration(duration, timer.repeats))
    }

    pub(crate) fn restart(&mut self, handle: TimerHandle) -> Result<()> {
        let at = self.find(handle)?;
        let timer = &self.timers[at];
        arm(&timer.tfd, expiration(timer.duration, timer.repeats))
    }

    /// Disarm without giving up the fd. Repeated stops stay disarmed.
    pub(crate) fn stop(&mut self, handle: TimerHandle) -> Result<()> {
        let at = self.find(handle)?;
        match self.timers[at].tfd.unset() {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("failed to disarm timer fd: {}", err);
                Err(Error::NotPossible)
            }
        }
    }

    /// Run at the top of a rebuild, once the previous iteration's snapshot
    /// is gone. Dropping a `TimerFd` closes it.
    pub(crate) fn close_removed(&mut self) {
        self.removed.clear();
    }
}

fn expiration(duration: Duration, repeats: bool) -> Expiration {
    let t = TimeSpec::from_duration(duration);
    if repeats {
        Expiration::Interval(t)
    } else {
        Expiration::OneShot(t)
    }
}

fn arm(tfd: &TimerFd, expiration: Expiration) -> Result<()> {
    match tfd.set(expiration, TimerSetTimeFlags::empty()) {
        Ok(()) => Ok(()),
        Err(err) => {
            log::error!("failed to arm timer fd: {}", err);
            Err(Error::NotPossible)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;

    use super::*;

    #[test]
    fn removal_defers_the_close() {
        let mut timers = FdTimers::new();
        let tfd = FdTimers::create(Duration::from_secs(5), false).unwrap();
        let raw = tfd.as_raw_fd();
        let handle = TimerHandle::from_id(1);
        timers.insert(handle, tfd, Duration::from_secs(5), false);

        timers.remove(handle).unwrap();
        // still open while parked on the deferred list
        assert!(nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_GETFD).is_ok());
        timers.close_removed();
        assert!(nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_GETFD).is_err());
    }

    #[test]
    fn unknown_handles_are_rejected() {
        let mut timers = FdTimers::new();
        let handle = TimerHandle::from_id(7);
        assert!(matches!(timers.remove(handle), Err(Error::NonExistent)));
        assert!(matches!(timers.stop(handle), Err(Error::NonExistent)));
        assert!(matches!(timers.restart(handle), Err(Error::NonExistent)));
    }
}
