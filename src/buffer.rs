//! A growable byte buffer with reader/writer cursors and cheap prepend.
//!
//! Shape is the classic muduo `Buffer`: one contiguous `Vec<u8>` split into
//! three regions by two indices, `reader` and `writer`. A fixed headroom of
//! `PREPEND` bytes precedes the readable region so that callers can stamp a
//! length-prefix header onto an already-filled buffer without a copy.
//!
//! ```text
//! | prependable (reader bytes) | readable (writer - reader) | writable (cap - writer) |
//! 0                          reader                        writer                   cap
//! ```

use std::io;
use std::os::unix::io::RawFd;

/// Bytes reserved ahead of the readable region for cheap header prepends.
pub const PREPEND: usize = 8;

const INITIAL_SIZE: usize = 1024;

/// Size of the stack-allocated overflow extent used by [`Buffer::read_fd`]
/// to absorb reads larger than the buffer's current writable tail without
/// having to grow the buffer eagerly for every connection.
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Buffer {
            buf: vec![0u8; PREPEND + initial_size],
            reader: PREPEND,
            writer: PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region as a slice, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Drops the first `n` readable bytes without returning them.
    pub fn retrieve(&mut self, n: usize) {
        let n = n.min(self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Drops every readable byte, resetting both cursors to the start of
    /// the prepend headroom.
    pub fn retrieve_all(&mut self) {
        self.reader = PREPEND;
        self.writer = PREPEND;
    }

    /// Copies out and consumes the first `n` readable bytes.
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable_bytes());
        let out = self.buf[self.reader..self.reader + n].to_vec();
        self.retrieve(n);
        out
    }

    /// Copies out and consumes all readable bytes.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_bytes(n)
    }

    /// Copies out and consumes the first `n` readable bytes as a `String`.
    ///
    /// Callers that cannot guarantee the payload is valid UTF-8 should use
    /// [`Buffer::retrieve_as_bytes`] instead; this deliberately does not
    /// perform lossy conversion, since silently mangling bytes the wire
    /// protocol didn't intend as text is worse than making the caller
    /// handle the `Result`.
    pub fn retrieve_as_string(&mut self, n: usize) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.retrieve_as_bytes(n))
    }

    /// Appends `data` to the writable tail, growing or compacting first if
    /// needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Prepends `data` into the headroom ahead of the readable region.
    ///
    /// Panics if `data` is larger than [`Buffer::prependable_bytes`]; this
    /// mirrors the muduo precondition that prepend is only ever used for
    /// small fixed headers the caller knows fit in `PREPEND`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        let start = self.reader;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + (self.reader - PREPEND) >= n {
            // Slide the readable region left to the start of the headroom
            // instead of growing — the common case once a connection has
            // been alive long enough to have retrieved some data.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, PREPEND);
            self.reader = PREPEND;
            self.writer = PREPEND + readable;
        } else {
            self.buf.resize(self.writer + n, 0);
        }
    }

    /// Reads from `fd` into the buffer, using a stack-allocated overflow
    /// extent via `readv` so a single large read doesn't force the buffer
    /// to pre-grow for every connection. Returns the number of bytes read,
    /// or `Ok(0)` on EOF.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;

        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            let spill = n - writable;
            self.append(&extra[..spill]);
        }

        Ok(n)
    }

    /// Writes as much of the readable region as the fd accepts in one
    /// non-blocking `write(2)` call, consuming exactly what was written.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let data = self.peek();
        if data.is_empty() {
            return Ok(0);
        }
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        self.retrieve(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_with_prepend_headroom() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND);
    }

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.retrieve_as_bytes(5), b"hello");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_as_string_round_trips_utf8() {
        let mut buf = Buffer::new();
        buf.append("héllo".as_bytes());
        let s = buf.retrieve_as_string(buf.readable_bytes()).unwrap();
        assert_eq!(s, "héllo");
    }

    #[test]
    fn prepend_writes_into_headroom() {
        let mut buf = Buffer::new();
        buf.append(b"body");
        buf.prepend(&4u32.to_be_bytes());
        assert_eq!(buf.readable_bytes(), 8);
        assert_eq!(&buf.peek()[..4], &4u32.to_be_bytes());
    }

    #[test]
    fn make_space_compacts_before_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[1u8; 16]);
        buf.retrieve(16);
        let cap_before = buf.buf.len();
        buf.append(&[2u8; 16]);
        assert_eq!(buf.buf.len(), cap_before, "should have compacted, not grown");
    }

    #[test]
    fn make_space_grows_when_compaction_is_insufficient() {
        let mut buf = Buffer::with_capacity(4);
        buf.append(&[1u8; 4]);
        buf.append(&[2u8; 100]);
        assert_eq!(buf.readable_bytes(), 104);
    }

    #[test]
    fn retrieve_all_resets_to_prepend_offset() {
        let mut buf = Buffer::new();
        buf.append(b"xyz");
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND);
    }

    #[test]
    fn large_retrieve_then_append_compacts_without_growing() {
        let mut buf = Buffer::new();
        buf.append(&[1u8; 4000]);
        buf.retrieve(3000);
        let cap_before = buf.buf.len();
        buf.append(&[2u8; 500]);
        assert_eq!(buf.readable_bytes(), 1500);
        assert_eq!(buf.buf.len(), cap_before, "residual 1000 bytes should slide left instead of growing");
    }

    #[test]
    fn read_fd_spills_into_overflow_extent_for_large_reads() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let payload = vec![7u8; 70_000];
        let written =
            unsafe { libc::write(write_fd, payload.as_ptr() as *const libc::c_void, payload.len()) };
        assert!(written > 0);

        let mut buf = Buffer::with_capacity(16);
        let mut total = 0usize;
        while total < payload.len() {
            let n = buf.read_fd(read_fd).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, payload.len());
        assert_eq!(buf.readable_bytes(), payload.len());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
