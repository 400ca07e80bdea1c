//! `eventfd`-backed cross-thread wakeup, directly grounded on mio's
//! own `eventfd` waker: an 8-byte counter fd registered into the
//! selector alongside the real I/O fds so a blocking `epoll_wait` can be
//! interrupted by any other thread.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

#[derive(Debug)]
pub struct Waker {
    fd: File,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { File::from_raw_fd(fd) };
        Ok(Waker { fd })
    }

    /// Wakes a thread blocked in `epoll_wait` on this fd. Safe to call
    /// from any thread, any number of times before the wakeup is drained.
    #[allow(clippy::unused_io_amount)]
    pub fn wake(&self) -> io::Result<()> {
        let payload: [u8; 8] = 1u64.to_ne_bytes();
        if let Err(err) = (&self.fd).write(&payload) {
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            // The counter is saturated near u64::MAX; draining it makes
            // room for our own increment, which a freshly-reset fd
            // always accepts.
            self.reset()?;
            (&self.fd).write(&payload)?;
        }
        Ok(())
    }

    /// Drains the counter after a readiness notification; must be called
    /// once per wakeup or the fd stays readable forever.
    #[allow(clippy::unused_io_amount)]
    pub fn reset(&self) -> io::Result<()> {
        let mut drained = [0u8; 8];
        ignore_would_block((&self.fd).read(&mut drained))
    }
}

fn ignore_would_block(result: io::Result<usize>) -> io::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(err) => Err(err),
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_reset_drains_counter() {
        let w = Waker::new().unwrap();
        w.wake().unwrap();
        w.reset().unwrap();
    }
}
