//! `TcpConnection`: the per-accepted-socket state machine.
//!
//! `mio` is deliberately one layer below a connection abstraction, so
//! there's no counterpart to adapt here — this is built from the
//! read/write-readiness split already established by `Channel`/
//! `EventLoop`, generalized to the full state machine this core needs.
//!
//! # Safety
//!
//! `TcpConnection` is shared via `Arc` across the thread that owns its
//! `EventLoop` and whichever thread last touched the server's connection
//! map (for `send`, `shutdown`, etc. called from arbitrary threads). All
//! of its interior-mutable state is `Cell`/`RefCell`, which aren't
//! `Sync`. The actual mutation is confined to the owning loop's thread by
//! construction: `send`/`shutdown`/`send_file` all route through
//! `run_in_loop`/`queue_in_loop`, which either run inline (already on
//! that thread) or hand the closure to the owning loop's task queue. No
//! caller ever touches the `RefCell`s directly from a foreign thread.
//! This mirrors mio's own `unsafe impl Sync for EventLoop`, which makes
//! the identical argument about its `Notify`/`Poll` internals.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::address::InetAddress;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoopHandle;
use crate::socket::Socket;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub(crate) type ConnCallback = Box<dyn FnMut(&Arc<TcpConnection>)>;
pub(crate) type MessageCallback = Box<dyn FnMut(&Arc<TcpConnection>, &mut Buffer, Instant)>;
pub(crate) type HighWaterMarkCallback = Box<dyn FnMut(&Arc<TcpConnection>, usize)>;

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<ConnCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<ConnCallback>,
}

pub struct TcpConnection {
    name: String,
    socket: Socket,
    channel: Rc<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    loop_handle: EventLoopHandle,
    state: Cell<ConnectionState>,
    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,
    high_water_mark: usize,
    callbacks: RefCell<Callbacks>,
}

// SAFETY: see the module-level safety note. All mutation of the interior
// `Cell`/`RefCell` fields is reached only via `run_in_loop`/
// `queue_in_loop`, which confine it to the owning `EventLoop`'s thread.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl TcpConnection {
    pub fn new(
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
        loop_handle: EventLoopHandle,
        high_water_mark: usize,
    ) -> Arc<TcpConnection> {
        let fd = socket.as_raw_fd();
        let _ = socket.set_tcp_nodelay(true);
        let _ = socket.set_keep_alive(true);

        Arc::new(TcpConnection {
            name,
            socket,
            channel: Rc::new(Channel::new(fd)),
            local_addr,
            peer_addr,
            loop_handle,
            state: Cell::new(ConnectionState::Connecting),
            input_buffer: RefCell::new(Buffer::new()),
            output_buffer: RefCell::new(Buffer::new()),
            high_water_mark,
            callbacks: RefCell::new(Callbacks::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + 'static) {
        self.callbacks.borrow_mut().connection = Some(Box::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, &mut Buffer, Instant) + 'static,
    ) {
        self.callbacks.borrow_mut().message = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + 'static) {
        self.callbacks.borrow_mut().write_complete = Some(Box::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, usize) + 'static,
    ) {
        self.callbacks.borrow_mut().high_water_mark = Some(Box::new(cb));
    }

    /// Set by `TcpServer` to its own `remove_connection`; not part of the
    /// public embedder-facing surface.
    pub(crate) fn set_close_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + 'static) {
        self.callbacks.borrow_mut().close = Some(Box::new(cb));
    }

    pub(crate) fn loop_handle(&self) -> EventLoopHandle {
        self.loop_handle.clone()
    }

    /// Must be called exactly once, on the owning loop's thread, right
    /// after the connection is handed to its worker loop.
    pub fn connect_established(self: &Arc<Self>) {
        assert_eq!(self.state.get(), ConnectionState::Connecting);
        self.state.set(ConnectionState::Connected);

        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(self) as Weak<dyn Any + Send + Sync>;
        self.channel.tie(weak);

        let w = Arc::downgrade(self);
        self.channel.set_read_callback(move |ts| {
            if let Some(conn) = w.upgrade() {
                conn.handle_read(ts);
            }
        });
        let w = Arc::downgrade(self);
        self.channel.set_write_callback(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_write();
            }
        });
        let w = Arc::downgrade(self);
        self.channel.set_close_callback(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_close();
            }
        });
        let w = Arc::downgrade(self);
        self.channel.set_error_callback(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_error();
            }
        });

        self.channel.enable_reading();

        if let Some(cb) = self.callbacks.borrow_mut().connection.as_mut() {
            cb(self);
        }
    }

    /// Idempotent: safe to call more than once (e.g. from both a
    /// `handle_close`-driven removal and a server shutdown sweep).
    pub fn connect_destroyed(self: &Arc<Self>) {
        if self.state.get() != ConnectionState::Disconnected {
            self.state.set(ConnectionState::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.callbacks.borrow_mut().connection.as_mut() {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, ts: Instant) {
        let result = self.input_buffer.borrow_mut().read_fd(self.socket.as_raw_fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                if let Some(cb) = self.callbacks.borrow_mut().message.as_mut() {
                    let mut buf = self.input_buffer.borrow_mut();
                    cb(self, &mut buf, ts);
                }
            }
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
                _ => self.handle_error(),
            },
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            log::debug!("connection {} not writing, ignoring write event", self.name);
            return;
        }
        let result = self.output_buffer.borrow_mut().write_fd(self.socket.as_raw_fd());
        match result {
            Ok(_) => {
                if self.output_buffer.borrow().is_empty() {
                    self.channel.disable_writing();
                    let this = Arc::clone(self);
                    self.loop_handle.queue_in_loop(move || {
                        if let Some(cb) = this.callbacks.borrow_mut().write_complete.as_mut() {
                            cb(&this);
                        }
                    });
                    if self.state.get() == ConnectionState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::error!("connection {} write failed: {err}", self.name),
        }
    }

    fn handle_close(self: &Arc<Self>) {
        debug_assert!(matches!(
            self.state.get(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ));
        self.state.set(ConnectionState::Disconnected);
        self.channel.disable_all();

        let guard = Arc::clone(self);
        if let Some(cb) = self.callbacks.borrow_mut().connection.as_mut() {
            cb(&guard);
        }
        if let Some(cb) = self.callbacks.borrow_mut().close.as_mut() {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            log::error!(
                "connection {}: getsockopt(SO_ERROR) failed: {}",
                self.name,
                io::Error::last_os_error()
            );
        } else {
            log::error!(
                "connection {}: socket error: {}",
                self.name,
                io::Error::from_raw_os_error(err)
            );
        }
    }

    /// Sends `data`. Safe to call from any thread: runs inline if already
    /// on the owning loop's thread, otherwise hands a copy to the loop's
    /// task queue.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state.get() != ConnectionState::Connected {
            log::debug!("connection {} send() while not connected, dropping", self.name);
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let this = Arc::clone(self);
            self.loop_handle.queue_in_loop(move || this.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state.get() == ConnectionState::Disconnected {
            log::debug!("connection {} send_in_loop after disconnect, dropping", self.name);
            return;
        }

        let mut n_wrote = 0usize;
        let mut fault = false;

        if !self.channel.is_writing() && self.output_buffer.borrow().is_empty() {
            let ret = unsafe {
                libc::write(
                    self.socket.as_raw_fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if ret >= 0 {
                n_wrote = ret as usize;
                if n_wrote == data.len() {
                    let this = Arc::clone(self);
                    self.loop_handle.queue_in_loop(move || {
                        if let Some(cb) = this.callbacks.borrow_mut().write_complete.as_mut() {
                            cb(&this);
                        }
                    });
                }
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    log::error!("connection {} write failed: {err}", self.name);
                    if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && n_wrote < data.len() {
            let remaining = data.len() - n_wrote;
            let old_readable = self.output_buffer.borrow().readable_bytes();

            if old_readable + remaining >= self.high_water_mark && old_readable < self.high_water_mark
            {
                let this = Arc::clone(self);
                let total = old_readable + remaining;
                self.loop_handle.queue_in_loop(move || {
                    if let Some(cb) = this.callbacks.borrow_mut().high_water_mark.as_mut() {
                        cb(&this, total);
                    }
                });
            }

            self.output_buffer.borrow_mut().append(&data[n_wrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Zero-copy send of `count` bytes of `file_fd` starting at `offset`,
    /// via `sendfile(2)`. Any bytes `sendfile` doesn't accept in one call
    /// are read into memory and pushed through the ordinary buffered
    /// write path, since this core's Selector has no "resume this file
    /// transfer later" primitive.
    ///
    /// Safe to call from any thread: runs inline if already on the
    /// owning loop's thread, otherwise hands the transfer to the loop's
    /// task queue and returns immediately, reporting failures from that
    /// deferred attempt via the log rather than this call's return value.
    pub fn send_file(self: &Arc<Self>, file_fd: i32, offset: i64, count: usize) -> io::Result<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection not established"));
        }

        if self.loop_handle.is_in_loop_thread() {
            self.send_file_in_loop(file_fd, offset, count)
        } else {
            let this = Arc::clone(self);
            self.loop_handle.queue_in_loop(move || {
                if let Err(err) = this.send_file_in_loop(file_fd, offset, count) {
                    log::error!("connection {} send_file failed: {err}", this.name);
                }
            });
            Ok(())
        }
    }

    fn send_file_in_loop(self: &Arc<Self>, file_fd: i32, offset: i64, count: usize) -> io::Result<()> {
        if self.state.get() == ConnectionState::Disconnected {
            log::debug!("connection {} send_file_in_loop after disconnect, dropping", self.name);
            return Ok(());
        }

        let mut off = offset;
        let ret = unsafe {
            libc::sendfile(
                self.socket.as_raw_fd(),
                file_fd,
                &mut off,
                count,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            return self.spill_file_to_buffer(file_fd, offset, count);
        }

        let sent = ret as usize;
        if sent < count {
            return self.spill_file_to_buffer(file_fd, off, count - sent);
        }
        Ok(())
    }

    fn spill_file_to_buffer(self: &Arc<Self>, file_fd: i32, offset: i64, count: usize) -> io::Result<()> {
        let mut remaining = count;
        let mut pos = offset;
        let mut chunk = vec![0u8; remaining.min(65536)];
        let mut collected = Vec::with_capacity(remaining);
        while remaining > 0 {
            let want = remaining.min(chunk.len());
            let n = unsafe {
                libc::pread(
                    file_fd,
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    want,
                    pos,
                )
            };
            if n <= 0 {
                break;
            }
            let n = n as usize;
            collected.extend_from_slice(&chunk[..n]);
            pos += n as i64;
            remaining -= n;
        }
        self.send_in_loop(&collected);
        Ok(())
    }

    /// Half-closes the connection: valid only from `Connected`.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state.get() != ConnectionState::Connected {
            return;
        }
        self.state.set(ConnectionState::Disconnecting);
        let this = Arc::clone(self);
        self.loop_handle.run_in_loop(move || this.shutdown_in_loop());
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                log::error!("connection {} shutdown_write failed: {err}", self.name);
            }
        }
    }
}
