//! The self-pipe that breaks `ppoll` out of its block.
//!
//! The read end sits in the poll registry; writing one byte to the write
//! end from any thread makes a blocked wait return immediately.

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd;

/// Both ends of the wake-up pipe, read end first.
pub(crate) fn make_wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    // SAFETY: pipe2 just handed us two freshly opened descriptors.
    unsafe { Ok((OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write))) }
}

/// Drain whatever accumulated in the read end so a level-triggered poll
/// stops reporting it.
pub(crate) fn drain(fd: RawFd) -> io::Result<()> {
    let mut buf = [0u8; 32];
    loop {
        match unistd::read(fd, &mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(nix::errno::Errno::EAGAIN) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

pub(crate) fn notify(fd: RawFd) {
    if let Err(err) = unistd::write(fd, &[0u8]) {
        log::warn!("failed to write to wake-up pipe: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;

    use super::*;

    #[test]
    fn notify_then_drain_round_trip() {
        let (read, write) = make_wake_pipe().unwrap();
        notify(write.as_raw_fd());
        notify(write.as_raw_fd());
        drain(read.as_raw_fd()).unwrap();
        // nothing left to read
        let mut buf = [0u8; 4];
        assert_eq!(
            unistd::read(read.as_raw_fd(), &mut buf),
            Err(nix::errno::Errno::EAGAIN)
        );
    }
}
