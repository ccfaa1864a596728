//! Adapter folding an external main-loop runtime's dispatch sources,
//! watches and timeouts into the event loop.
//!
//! The bridge is an explicit collaborator built against a [`LoopHandle`];
//! it owns nothing of the loop and the loop owns nothing of it. Runtime
//! objects are registered and deregistered explicitly, and the bridge
//! keeps only the bookkeeping it needs to route loop callbacks back to
//! them: a priority-ordered multimap of dispatch sources, a map from
//! watch fds to their poll registrations, and the timer handle of every
//! timeout.
//!
//! Dispatch sources are serviced through a dedicated self-pipe
//! registration. Its `prepare` polls every source; when one is ready the
//! bridge pokes its own pipe, so the following `ppoll` returns at once
//! and the check/dispatch stages of the same iteration drain the ready
//! set. [`RuntimeBridge::wakeup`] writes to the same pipe, which is how
//! the runtime interrupts a blocked loop from another thread.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use nix::poll::PollFlags;

use crate::handle::{PollHandle, TimerHandle};
use crate::poll::FdCallbacks;
use crate::wake;
use crate::{Error, LoopHandle, Result};

/// Runtime work item polled from the loop's prepare stage and drained
/// from its dispatch stage.
pub trait DispatchSource {
    /// Is there work to dispatch?
    fn prepare(&mut self) -> bool;
    fn check(&mut self) -> bool;
    /// Delivers one round of work; `true` while more is pending.
    fn dispatch(&mut self) -> bool;
}

/// A runtime-owned file descriptor serviced through the loop.
pub trait Watch {
    fn fd(&self) -> RawFd;
    fn events(&self) -> PollFlags;
    fn dispatch(&mut self, revents: PollFlags);
}

/// A runtime-owned recurring deadline.
pub trait TimeoutSource {
    fn interval(&self) -> Duration;
    /// `false` once the timeout should stop firing.
    fn dispatch(&mut self) -> bool;
}

/// Invocation order of dispatch sources within one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DispatchPriority {
    High,
    Default,
    Low,
}

/// Identifies a registered dispatch source or timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceToken(u64);

struct SourceSet {
    by_priority: BTreeMap<(DispatchPriority, u64), Rc<RefCell<dyn DispatchSource>>>,
    ready: VecDeque<Rc<RefCell<dyn DispatchSource>>>,
    next_token: u64,
}

impl SourceSet {
    fn ordered(&self) -> Vec<Rc<RefCell<dyn DispatchSource>>> {
        self.by_priority.values().cloned().collect()
    }
}

pub struct RuntimeBridge {
    handle: LoopHandle,
    sources: Rc<RefCell<SourceSet>>,
    watches: RefCell<HashMap<RawFd, PollHandle>>,
    timeouts: RefCell<Vec<(SourceToken, Rc<Cell<Option<TimerHandle>>>)>>,
    wake_handle: PollHandle,
    /// Write end of the bridge pipe; `Arc` so `waker()` can hand it to
    /// other threads.
    wake_write: Arc<OwnedFd>,
    _wake_read: OwnedFd,
}

impl RuntimeBridge {
    /// Builds the bridge and installs its wake-up registration.
    pub fn new(handle: &LoopHandle) -> Result<RuntimeBridge> {
        let (wake_read, wake_write) = wake::make_wake_pipe()?;
        let wake_write = Arc::new(wake_write);
        let sources = Rc::new(RefCell::new(SourceSet {
            by_priority: BTreeMap::new(),
            ready: VecDeque::new(),
            next_token: 0,
        }));

        let prepare_sources = sources.clone();
        let prepare_wake = wake_write.clone();
        let check_sources = sources.clone();
        let dispatch_sources = sources.clone();

        let callbacks = FdCallbacks::new()
            .on_prepare(move |_| {
                // poll every source outside the borrow, re-registration
                // from inside prepare() must not deadlock
                let candidates = prepare_sources.borrow().ordered();
                let ready: VecDeque<_> = candidates
                    .into_iter()
                    .filter(|source| source.borrow_mut().prepare())
                    .collect();
                let any = !ready.is_empty();
                prepare_sources.borrow_mut().ready = ready;
                if any {
                    // make the upcoming ppoll return immediately so this
                    // iteration's dispatch stage drains the set
                    wake::notify(prepare_wake.as_raw_fd());
                }
            })
            .on_fired(|event| wake::drain(event.fd))
            .on_check(move |_| {
                let ready: Vec<_> = check_sources.borrow().ready.iter().cloned().collect();
                ready.iter().any(|source| source.borrow_mut().check())
            })
            .on_dispatch(move |_| {
                let next = dispatch_sources.borrow_mut().ready.pop_front();
                match next {
                    Some(source) => {
                        let more = source.borrow_mut().dispatch();
                        let mut set = dispatch_sources.borrow_mut();
                        if more {
                            set.ready.push_back(source);
                        }
                        !set.ready.is_empty()
                    }
                    None => false,
                }
            });

        let wake_handle = handle.add_fd_poll(wake_read.as_raw_fd(), PollFlags::POLLIN, callbacks)?;

        Ok(RuntimeBridge {
            handle: handle.clone(),
            sources,
            watches: RefCell::new(HashMap::new()),
            timeouts: RefCell::new(Vec::new()),
            wake_handle,
            wake_write,
            _wake_read: wake_read,
        })
    }

    /// Interrupts a blocked loop so pending dispatch sources get polled.
    pub fn wakeup(&self) {
        wake::notify(self.wake_write.as_raw_fd());
    }

    /// A `Send + Sync` clone of the wake-up channel.
    pub fn waker(&self) -> BridgeWaker {
        BridgeWaker {
            pipe: self.wake_write.clone(),
        }
    }

    pub fn register_dispatch_source(
        &self,
        source: Rc<RefCell<dyn DispatchSource>>,
        priority: DispatchPriority,
    ) -> SourceToken {
        let mut set = self.sources.borrow_mut();
        let token = SourceToken(set.next_token);
        set.next_token += 1;
        set.by_priority.insert((priority, token.0), source);
        token
    }

    pub fn deregister_dispatch_source(&self, token: SourceToken) -> Result<()> {
        let mut set = self.sources.borrow_mut();
        let key = set
            .by_priority
            .keys()
            .find(|(_, t)| *t == token.0)
            .copied()
            .ok_or(Error::Unknown)?;
        set.by_priority.remove(&key);
        Ok(())
    }

    /// Installs a watch; the runtime keeps ownership of the descriptor.
    pub fn register_watch(&self, watch: Rc<RefCell<dyn Watch>>) -> Result<PollHandle> {
        let (fd, events) = {
            let watch = watch.borrow();
            (watch.fd(), watch.events())
        };
        let pending = Rc::new(Cell::new(PollFlags::empty()));

        let fired_pending = pending.clone();
        let check_pending = pending.clone();
        let callbacks = FdCallbacks::new()
            .on_fired(move |event| {
                fired_pending.set(event.revents);
                Ok(())
            })
            .on_check(move |_| !check_pending.get().is_empty())
            .on_dispatch(move |_| {
                let revents = pending.replace(PollFlags::empty());
                watch.borrow_mut().dispatch(revents);
                false
            });

        let handle = self.handle.add_fd_poll(fd, events, callbacks)?;
        self.watches.borrow_mut().insert(fd, handle);
        Ok(handle)
    }

    pub fn deregister_watch(&self, fd: RawFd) -> Result<()> {
        let handle = self.watches.borrow_mut().remove(&fd).ok_or(Error::Unknown)?;
        self.handle.remove_fd_poll(handle)
    }

    /// Installs a timeout as a loop timer; it keeps firing until its
    /// `dispatch` returns `false` or it is deregistered.
    pub fn register_timeout(&self, timeout: Rc<RefCell<dyn TimeoutSource>>) -> Result<SourceToken> {
        let interval = timeout.borrow().interval();
        let token = {
            let mut set = self.sources.borrow_mut();
            let token = SourceToken(set.next_token);
            set.next_token += 1;
            token
        };

        let slot = Rc::new(Cell::new(None));
        let timer = arm_timeout(&self.handle, timeout, interval, slot.clone())?;
        slot.set(Some(timer));
        self.timeouts.borrow_mut().push((token, slot));
        Ok(token)
    }

    pub fn deregister_timeout(&self, token: SourceToken) -> Result<()> {
        let slot = {
            let mut timeouts = self.timeouts.borrow_mut();
            let at = timeouts
                .iter()
                .position(|(t, _)| *t == token)
                .ok_or(Error::Unknown)?;
            timeouts.remove(at).1
        };
        match slot.get() {
            Some(timer) => self.handle.remove_timer(timer),
            None => Err(Error::Unknown),
        }
    }
}

/// Keeps a runtime timeout live across fires. The kernel backend repeats
/// on its own and a `restart` merely re-anchors the phase; the list
/// backend releases a fired registration, so the callback arms a fresh
/// timer and records its handle in `slot` for deregistration.
fn arm_timeout(
    handle: &LoopHandle,
    timeout: Rc<RefCell<dyn TimeoutSource>>,
    interval: Duration,
    slot: Rc<Cell<Option<TimerHandle>>>,
) -> Result<TimerHandle> {
    let rearm = handle.clone();
    handle.add_timer(
        interval,
        move |fired| {
            if timeout.borrow_mut().dispatch() {
                if rearm.restart_timer(fired).is_err() {
                    let interval = timeout.borrow().interval();
                    if let Ok(fresh) =
                        arm_timeout(&rearm, timeout.clone(), interval, slot.clone())
                    {
                        slot.set(Some(fresh));
                    }
                }
            } else {
                let _ = rearm.stop_timer(fired);
            }
        },
        true,
    )
}

impl Drop for RuntimeBridge {
    fn drop(&mut self) {
        // our pipe closes with us, its registration must not outlive it
        let _ = self.handle.remove_fd_poll(self.wake_handle);
    }
}

impl fmt::Debug for RuntimeBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RuntimeBridge { .. }")
    }
}

/// Cross-thread wake-up channel of a [`RuntimeBridge`].
#[derive(Clone)]
pub struct BridgeWaker {
    pipe: Arc<OwnedFd>,
}

impl BridgeWaker {
    pub fn wakeup(&self) {
        wake::notify(self.pipe.as_raw_fd());
    }
}

impl fmt::Debug for BridgeWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BridgeWaker { .. }")
    }
}
