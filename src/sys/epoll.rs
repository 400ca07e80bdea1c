//! Thin, direct wrapper over `epoll_create1`/`epoll_ctl`/`epoll_wait`.
//!
//! Level-triggered only (no `EPOLLET`): the rest of this crate relies on
//! fully draining a readable/writable fd on every notification, the same
//! assumption muduo's `EPollPoller` makes, rather than edge-triggered
//! semantics which would require every caller to loop until `EWOULDBLOCK`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::interest::Interest;

fn epoll_flags(interest: Interest) -> u32 {
    let mut flags = 0i32;
    if interest.is_readable() {
        flags |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interest.is_writable() {
        flags |= libc::EPOLLOUT;
    }
    if interest.is_priority() {
        flags |= libc::EPOLLPRI;
    }
    flags as u32
}

fn epoll_to_interest(events: u32) -> Interest {
    let events = events as i32;
    let mut out = Interest::NONE;
    if events & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        out |= Interest::READABLE;
    }
    if events & libc::EPOLLOUT != 0 {
        out |= Interest::WRITABLE;
    }
    if events & libc::EPOLLERR != 0 {
        out |= Interest::ERROR;
    }
    if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
        out |= Interest::HANGUP;
    }
    out
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub struct Epoll {
    fd: OwnedFd,
}

/// One readiness notification: the fd it's for, and which bits fired.
#[derive(Copy, Clone, Debug)]
pub struct EpollEvent {
    pub fd: RawFd,
    pub revents: Interest,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let fd = unsafe { check(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Epoll { fd })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: epoll_flags(interest),
            u64: fd as u64,
        };
        unsafe {
            check(libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd,
                &mut ev,
            ))?;
        }
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: epoll_flags(interest),
            u64: fd as u64,
        };
        unsafe {
            check(libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_MOD,
                fd,
                &mut ev,
            ))?;
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            check(libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            ))?;
        }
        Ok(())
    }

    /// Blocks for up to `timeout` (rounded up to the millisecond, `None`
    /// meaning "forever"), appending any ready events to `out`.
    pub fn wait(
        &self,
        timeout: Option<Duration>,
        raw: &mut Vec<libc::epoll_event>,
        out: &mut Vec<EpollEvent>,
    ) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|d| {
                d.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.fd.as_raw_fd(),
                    raw.as_mut_ptr(),
                    raw.capacity() as libc::c_int,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            unsafe { raw.set_len(n as usize) };
            break;
        }

        out.clear();
        out.extend(raw.iter().map(|ev| EpollEvent {
            fd: ev.u64 as RawFd,
            revents: epoll_to_interest(ev.events),
        }));
        Ok(())
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_observe_pipe_readiness() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let ep = Epoll::new().unwrap();
        ep.add(read_fd, Interest::READABLE).unwrap();

        let mut raw = vec![unsafe { std::mem::zeroed() }; 16];
        let mut events = Vec::new();
        ep.wait(Some(Duration::from_millis(50)), &mut raw, &mut events)
            .unwrap();
        assert!(events.is_empty());

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
        ep.wait(Some(Duration::from_millis(1000)), &mut raw, &mut events)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, read_fd);
        assert!(events[0].revents.is_readable());

        ep.delete(read_fd).unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
