//! End-to-end lifecycle scenarios over real pipes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::unistd;
use polloop::{EventHandler, FdCallbacks, PollFlags, TimerBackend};

fn pipe() -> (i32, i32) {
    unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap()
}

#[test]
fn echo_pipe_single_iteration() {
    let mut handler = EventHandler::new();
    let handle = handler.handle();
    let (read_end, write_end) = pipe();

    let buf = Rc::new(RefCell::new(Vec::new()));
    let bytes = Rc::new(Cell::new(0usize));

    let got = buf.clone();
    let fired_bytes = bytes.clone();
    let check_bytes = bytes.clone();
    let stop = handle.clone();
    let callbacks = FdCallbacks::new()
        .on_fired(move |event| {
            assert!(event.revents.contains(PollFlags::POLLIN));
            let mut chunk = [0u8; 1];
            let n = unistd::read(event.fd, &mut chunk)?;
            fired_bytes.set(n);
            got.borrow_mut().extend_from_slice(&chunk[..n]);
            Ok(())
        })
        .on_check(move |_| check_bytes.get() > 0)
        .on_dispatch(move |_| {
            stop.stop_listening();
            false
        });
    handle
        .add_fd_poll(read_end, PollFlags::POLLIN, callbacks)
        .unwrap();

    unistd::write(write_end, b"x").unwrap();
    handler.start_listening().unwrap();

    assert_eq!(&*buf.borrow(), b"x");
}

#[test]
fn dispatch_backpressure_rounds() {
    let mut handler = EventHandler::new();
    let handle = handler.handle();
    let (read_end, write_end) = pipe();

    let fired_count = Rc::new(Cell::new(0));
    let dispatch_count = Rc::new(Cell::new(0));

    let fires = fired_count.clone();
    let rounds = dispatch_count.clone();
    let stop = handle.clone();
    let callbacks = FdCallbacks::new()
        .on_fired(move |event| {
            fires.set(fires.get() + 1);
            let mut chunk = [0u8; 8];
            let _ = unistd::read(event.fd, &mut chunk)?;
            Ok(())
        })
        .on_check(|_| true)
        .on_dispatch(move |_| {
            rounds.set(rounds.get() + 1);
            if rounds.get() < 3 {
                true
            } else {
                stop.stop_listening();
                false
            }
        });
    handle
        .add_fd_poll(read_end, PollFlags::POLLIN, callbacks)
        .unwrap();

    unistd::write(write_end, b"!").unwrap();
    handler.start_listening().unwrap();

    // one readiness, three dispatch micro-rounds, all in one iteration
    assert_eq!(fired_count.get(), 1);
    assert_eq!(dispatch_count.get(), 3);
}

#[test]
fn self_removal_skips_later_stages() {
    let mut handler = EventHandler::with_timer_backend(TimerBackend::List);
    let handle = handler.handle();
    let (read_end, write_end) = pipe();

    let fired = Rc::new(Cell::new(0));
    let checked = Rc::new(Cell::new(false));
    let dispatched = Rc::new(Cell::new(false));
    let own = Rc::new(Cell::new(None));

    let fires = fired.clone();
    let own_handle = own.clone();
    let remover = handle.clone();
    let checks = checked.clone();
    let dispatches = dispatched.clone();
    let callbacks = FdCallbacks::new()
        .on_fired(move |event| {
            fires.set(fires.get() + 1);
            let mut chunk = [0u8; 8];
            let _ = unistd::read(event.fd, &mut chunk)?;
            remover.remove_fd_poll(own_handle.get().unwrap()).unwrap();
            Ok(())
        })
        .on_check(move |_| {
            checks.set(true);
            true
        })
        .on_dispatch(move |_| {
            dispatches.set(true);
            false
        });
    let poll = handle
        .add_fd_poll(read_end, PollFlags::POLLIN, callbacks)
        .unwrap();
    own.set(Some(poll));

    unistd::write(write_end, b"a").unwrap();

    // bounds the run to a second iteration, proving the fd is gone from
    // the rebuilt poll array
    let stop = handle.clone();
    handle
        .add_timer(
            Duration::from_millis(100),
            move |_| stop.stop_listening(),
            false,
        )
        .unwrap();

    handler.start_listening().unwrap();

    assert_eq!(fired.get(), 1);
    assert!(!checked.get());
    assert!(!dispatched.get());
    assert!(handle.get_fd_poll_data(poll).is_err());
}

#[test]
fn prepare_runs_before_every_block() {
    let mut handler = EventHandler::with_timer_backend(TimerBackend::List);
    let handle = handler.handle();
    let (read_end, _write_end) = pipe();

    let prepares = Rc::new(Cell::new(0));
    let seen = prepares.clone();
    let callbacks = FdCallbacks::new().on_prepare(move |_| seen.set(seen.get() + 1));
    handle
        .add_fd_poll(read_end, PollFlags::POLLIN, callbacks)
        .unwrap();

    // two short timers give the loop three iterations
    handle
        .add_timer(Duration::from_millis(20), |_| {}, false)
        .unwrap();
    let stop = handle.clone();
    handle
        .add_timer(
            Duration::from_millis(50),
            move |_| stop.stop_listening(),
            false,
        )
        .unwrap();

    handler.start_listening().unwrap();
    assert!(prepares.get() >= 2);
}
