//! Polloop, a callback-based event loop over `ppoll`
//!
//! This crate provides an [`EventHandler`], a single-threaded event loop
//! multiplexing three families of sources over one blocking `ppoll` call:
//! file descriptors, coarse timers and UNIX signals. Unlike readiness- or
//! future-based loops, everything is driven through callbacks: each fd
//! registration carries up to four closures that the loop walks through a
//! fixed lifecycle on every iteration: *prepare* before the block,
//! *fired* for descriptors that became ready, *check* to decide whether a
//! dispatch round is needed, and *dispatch*, re-run within the same
//! iteration for as long as it reports more work.
//!
//! Registrations are made through a [`LoopHandle`], which can be cloned
//! freely and used from inside callbacks; changes land at the next
//! iteration. Handles are `Rc`-based and cannot leave the owning thread.
//! The only cross-thread channel is [`LoopWaker`], which ends a blocked
//! loop through the internal wake-up pipe.
//!
//! Timers come in two flavors behind the same interface, chosen with
//! [`TimerBackend`] at construction: kernel `timerfd`s (accurate,
//! repeating) or a countdown list that only advances when the loop wakes
//! (coarse, one-shot, meant for IO timeouts).
//!
//! ## Example
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! use polloop::{EventHandler, FdCallbacks, PollFlags};
//!
//! let mut handler = EventHandler::new();
//! let handle = handler.handle();
//!
//! // watch a file descriptor
//! # let fd = 0;
//! let buf = Rc::new(RefCell::new(Vec::new()));
//! let got = buf.clone();
//! let callbacks = FdCallbacks::new()
//!     .on_fired(move |event| {
//!         let mut chunk = [0u8; 64];
//!         let n = nix::unistd::read(event.fd, &mut chunk)?;
//!         got.borrow_mut().extend_from_slice(&chunk[..n]);
//!         Ok(())
//!     })
//!     .on_check(|_| false);
//! handle
//!     .add_fd_poll(fd, PollFlags::POLLIN, callbacks)
//!     .expect("failed to register fd");
//!
//! // give up after five seconds
//! let stop = handle.clone();
//! handle
//!     .add_timer(Duration::from_secs(5), move |_| stop.exit_mainloop(), false)
//!     .expect("failed to arm timer");
//!
//! handler.start_listening().expect("event loop failed");
//! ```

#![warn(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bridge;
mod error;
mod handle;
mod loop_logic;
mod poll;
mod signals;
mod time;
mod timer;
mod wake;

pub use nix::poll::PollFlags;
pub use nix::sys::signal::Signal;
pub use nix::sys::signalfd::siginfo;

pub use crate::bridge::{
    BridgeWaker, DispatchPriority, DispatchSource, RuntimeBridge, SourceToken, TimeoutSource,
    Watch,
};
pub use crate::error::{Error, InternalCodes, Result};
pub use crate::handle::{
    PollHandle, SignalHandle, TimerHandle, MAX_POLL_HANDLE, MAX_TIMER_HANDLE,
};
pub use crate::loop_logic::{EventHandler, LoopHandle, LoopWaker};
pub use crate::poll::{FdCallbacks, FdEvent, FdPollData};
pub use crate::timer::TimerBackend;
