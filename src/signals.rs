//! UNIX signal delivery through a single `signalfd`.
//!
//! All subscribed signals are blocked via `sigprocmask` so the kernel
//! routes them through the fd instead of the process handlers. The fd is
//! an ordinary poll registration; when it fires, one `signalfd_siginfo`
//! is read and fanned out to every registered listener.

use std::cell::RefCell;
use std::rc::Rc;

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{siginfo, SignalFd};

use crate::handle::{HandleAllocator, SignalHandle, MAX_POLL_HANDLE};
use crate::{Error, Result};

pub(crate) type SignalFn = Rc<RefCell<dyn FnMut(SignalHandle, siginfo)>>;

struct Listener {
    handle: SignalHandle,
    callback: SignalFn,
}

pub(crate) struct SignalWatch {
    keys: HandleAllocator,
    listeners: Vec<Listener>,
    /// Present once `listen_to_signals` created the fd.
    pub(crate) fd: Option<SignalFd>,
}

impl SignalWatch {
    pub(crate) fn new() -> SignalWatch {
        SignalWatch {
            keys: HandleAllocator::new(MAX_POLL_HANDLE),
            listeners: Vec::new(),
            fd: None,
        }
    }

    pub(crate) fn add_listener(&mut self, callback: SignalFn) -> Result<SignalHandle> {
        let handle = SignalHandle::from_id(self.keys.next()?);
        self.listeners.push(Listener { handle, callback });
        Ok(handle)
    }

    pub(crate) fn remove_listener(&mut self, handle: SignalHandle) -> Result<()> {
        match self.listeners.iter().position(|l| l.handle == handle) {
            Some(at) => {
                self.listeners.remove(at);
                self.keys.release(handle.get());
                Ok(())
            }
            None => Err(Error::Unknown),
        }
    }

    /// Snapshot for fan-out, so listeners can subscribe or unsubscribe
    /// from inside a callback.
    pub(crate) fn snapshot(&self) -> Vec<(SignalHandle, SignalFn)> {
        self.listeners
            .iter()
            .map(|l| (l.handle, l.callback.clone()))
            .collect()
    }

    /// One queued signal, if any. A real read failure aborts the loop.
    pub(crate) fn read_one(&mut self) -> Option<siginfo> {
        let fd = self.fd.as_mut()?;
        match fd.read_signal() {
            Ok(found) => found,
            Err(err) => panic!("failed to read from signal fd: {}", err),
        }
    }

    pub(crate) fn mask_of(signals: &[Signal]) -> SigSet {
        let mut set = SigSet::empty();
        for signal in signals {
            set.add(*signal);
        }
        set
    }
}
