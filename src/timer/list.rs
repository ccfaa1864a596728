//! List timer backend: a countdown list advanced by the loop.
//!
//! Active timers are kept sorted by ascending remaining time; the head is
//! the next `ppoll` timeout. The loop keeps a reference instant (`start`)
//! and, before every block, subtracts the elapsed delta from every
//! countdown (`correction`). Subtracting a common value preserves the
//! order. When `ppoll` comes back with nothing ready the wake was for a
//! timer, and `timer_up` fires everything that is due.
//!
//! Timers added while the loop runs carry the delta since the last
//! correction, so the next correction restores the requested duration.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::handle::{HandleAllocator, TimerHandle, MAX_TIMER_HANDLE};
use crate::time;
use crate::{Error, Result};

pub(crate) type TimerFn = Rc<RefCell<dyn FnMut(TimerHandle)>>;

struct Registration {
    handle: u16,
    duration: Duration,
    callback: TimerFn,
}

struct Active {
    handle: u16,
    countdown: Duration,
    callback: TimerFn,
}

pub(crate) struct ListTimers {
    keys: HandleAllocator,
    registered: Vec<Registration>,
    /// Sorted by ascending countdown at all times.
    active: Vec<Active>,
    start: Instant,
}

impl ListTimers {
    pub(crate) fn new() -> ListTimers {
        ListTimers {
            keys: HandleAllocator::new(MAX_TIMER_HANDLE),
            registered: Vec::new(),
            active: Vec::new(),
            start: Instant::now(),
        }
    }

    /// Resets the reference instant when the loop starts.
    pub(crate) fn begin(&mut self, now: Instant) {
        self.start = now;
    }

    pub(crate) fn add(
        &mut self,
        duration: Duration,
        callback: TimerFn,
        running: bool,
        now: Instant,
    ) -> Result<TimerHandle> {
        let id = self.keys.next()?;
        self.registered.push(Registration {
            handle: id,
            duration,
            callback: callback.clone(),
        });
        self.insert_active(id, in_flight(duration, running, self.start, now), callback);
        Ok(TimerHandle::from_id(id))
    }

    pub(crate) fn remove(&mut self, handle: TimerHandle) -> Result<()> {
        let id = handle.get();
        self.active.retain(|t| t.handle != id);
        match self.registered.iter().position(|r| r.handle == id) {
            Some(at) => {
                self.registered.remove(at);
                self.keys.release(id);
                Ok(())
            }
            None => Err(Error::NonExistent),
        }
    }

    /// Deactivates without forgetting the registration; `restart` brings
    /// it back.
    pub(crate) fn stop(&mut self, handle: TimerHandle) -> Result<()> {
        let id = handle.get();
        match self.active.iter().position(|t| t.handle == id) {
            Some(at) => {
                self.active.remove(at);
                Ok(())
            }
            None => Err(Error::NonExistent),
        }
    }

    pub(crate) fn update(
        &mut self,
        handle: TimerHandle,
        duration: Duration,
        running: bool,
        now: Instant,
    ) -> Result<()> {
        let id = handle.get();
        let reg = self
            .registered
            .iter_mut()
            .find(|r| r.handle == id)
            .ok_or(Error::NonExistent)?;
        reg.duration = duration;
        let callback = reg.callback.clone();
        self.activate(id, duration, callback, running, now);
        Ok(())
    }

    pub(crate) fn restart(
        &mut self,
        handle: TimerHandle,
        running: bool,
        now: Instant,
    ) -> Result<()> {
        let id = handle.get();
        let reg = self
            .registered
            .iter()
            .find(|r| r.handle == id)
            .ok_or(Error::NonExistent)?;
        let duration = reg.duration;
        let callback = reg.callback.clone();
        self.activate(id, duration, callback, running, now);
        Ok(())
    }

    /// Subtracts the elapsed delta from every countdown, resets the
    /// reference instant, and hands back the timers that reached zero.
    pub(crate) fn correction(&mut self, now: Instant) -> Vec<(TimerHandle, TimerFn)> {
        let elapsed = now.saturating_duration_since(self.start);
        self.start = now;
        if self.active.is_empty() {
            return Vec::new();
        }
        for timer in &mut self.active {
            timer.countdown = time::advance(timer.countdown, elapsed);
        }
        let up = self.active.partition_point(|t| t.countdown.is_zero());
        self.drain_fired(up)
    }

    /// `ppoll` returned with no ready fd: the wake was for a timer. Fires
    /// everything within the elapsed delta; the reference instant is left
    /// for the next correction to account for.
    pub(crate) fn timer_up(&mut self, now: Instant) -> Vec<(TimerHandle, TimerFn)> {
        let elapsed = now.saturating_duration_since(self.start);
        let up = self.active.partition_point(|t| t.countdown <= elapsed);
        self.drain_fired(up)
    }

    /// Head of the list, i.e. the next `ppoll` timeout.
    pub(crate) fn next_timeout(&self) -> Option<Duration> {
        self.active.first().map(|t| t.countdown)
    }

    /// The loop is halting: strip the in-flight delta so countdowns are
    /// plain durations again while no correction runs.
    pub(crate) fn halt(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.start);
        for timer in &mut self.active {
            timer.countdown = time::advance(timer.countdown, elapsed);
        }
    }

    /// Re-arm a live registration: replace its active countdown, or insert
    /// it again if it had been stopped.
    fn activate(
        &mut self,
        id: u16,
        duration: Duration,
        callback: TimerFn,
        running: bool,
        now: Instant,
    ) {
        self.active.retain(|t| t.handle != id);
        self.insert_active(id, in_flight(duration, running, self.start, now), callback);
    }

    fn insert_active(&mut self, id: u16, countdown: Duration, callback: TimerFn) {
        let at = self.active.partition_point(|t| t.countdown <= countdown);
        self.active.insert(
            at,
            Active {
                handle: id,
                countdown,
                callback,
            },
        );
    }

    /// One-shot semantics: a fired timer's whole registration is released,
    /// its handle no longer resolves.
    fn drain_fired(&mut self, up_to: usize) -> Vec<(TimerHandle, TimerFn)> {
        let keys = &mut self.keys;
        let registered = &mut self.registered;
        self.active
            .drain(..up_to)
            .map(|timer| {
                keys.release(timer.handle);
                registered.retain(|r| r.handle != timer.handle);
                (TimerHandle::from_id(timer.handle), timer.callback)
            })
            .collect()
    }
}

/// Countdown for a timer entering the active list: while the loop runs,
/// the delta since the last correction is added so that the very next
/// correction subtracts it away again.
fn in_flight(duration: Duration, running: bool, start: Instant, now: Instant) -> Duration {
    if running {
        duration + now.saturating_duration_since(start)
    } else {
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerFn {
        Rc::new(RefCell::new(|_| {}))
    }

    fn handles(timers: &ListTimers) -> Vec<u16> {
        timers.active.iter().map(|t| t.handle).collect()
    }

    #[test]
    fn active_list_stays_sorted() {
        let now = Instant::now();
        let mut timers = ListTimers::new();
        timers.begin(now);
        let a = timers.add(Duration::from_millis(100), noop(), false, now).unwrap();
        let b = timers.add(Duration::from_millis(50), noop(), false, now).unwrap();
        let c = timers.add(Duration::from_millis(200), noop(), false, now).unwrap();
        assert_eq!(handles(&timers), vec![b.get(), a.get(), c.get()]);
        assert_eq!(timers.next_timeout(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn correction_fires_due_timers_and_keeps_order() {
        let now = Instant::now();
        let mut timers = ListTimers::new();
        timers.begin(now);
        let a = timers.add(Duration::from_millis(30), noop(), false, now).unwrap();
        let b = timers.add(Duration::from_millis(500), noop(), false, now).unwrap();

        let fired = timers.correction(now + Duration::from_millis(40));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, a);
        assert_eq!(handles(&timers), vec![b.get()]);
        assert_eq!(timers.next_timeout(), Some(Duration::from_millis(460)));
    }

    #[test]
    fn fired_timers_release_their_handles() {
        let now = Instant::now();
        let mut timers = ListTimers::new();
        timers.begin(now);
        let a = timers.add(Duration::from_millis(10), noop(), false, now).unwrap();
        let fired = timers.timer_up(now + Duration::from_millis(20));
        assert_eq!(fired.len(), 1);
        assert!(matches!(timers.restart(a, false, now), Err(Error::NonExistent)));
        assert!(matches!(timers.remove(a), Err(Error::NonExistent)));
    }

    #[test]
    fn stopped_timers_can_be_restarted() {
        let now = Instant::now();
        let mut timers = ListTimers::new();
        timers.begin(now);
        let a = timers.add(Duration::from_millis(80), noop(), false, now).unwrap();
        timers.stop(a).unwrap();
        assert!(timers.next_timeout().is_none());
        assert!(matches!(timers.stop(a), Err(Error::NonExistent)));

        timers.restart(a, false, now).unwrap();
        assert_eq!(timers.next_timeout(), Some(Duration::from_millis(80)));
    }

    #[test]
    fn running_insert_compensates_for_the_in_flight_delta() {
        let now = Instant::now();
        let mut timers = ListTimers::new();
        timers.begin(now);
        let later = now + Duration::from_millis(25);
        timers.add(Duration::from_millis(100), noop(), true, later).unwrap();
        assert_eq!(timers.next_timeout(), Some(Duration::from_millis(125)));
        // the next correction strips the offset again
        let fired = timers.correction(later);
        assert!(fired.is_empty());
        assert_eq!(timers.next_timeout(), Some(Duration::from_millis(100)));
    }
}
