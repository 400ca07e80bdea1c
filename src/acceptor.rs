//! Listening socket + Channel: accepts connections on the main loop and
//! hands each one off via a user-supplied callback.
//!
//! Grounded on mio's listener construction sequence (reuse-addr, bind,
//! listen) and its `accept()` retry-on-`WouldBlock` pattern in
//! `net/tcp/listener.rs`, generalized here to also own the EMFILE
//! "idle fd" trick this core needs.

use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::address::InetAddress;
use crate::channel::Channel;
use crate::config::EventLoopConfig;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddress)>;

pub struct Acceptor {
    socket: Socket,
    channel: Rc<Channel>,
    new_connection_cb: std::cell::RefCell<Option<NewConnectionCallback>>,
    listening: std::cell::Cell<bool>,
    /// A spare, pre-opened fd held in reserve for the EMFILE trick: when
    /// `accept4` fails with `EMFILE`, this is closed to free one fd,
    /// which lets a stuck connection be accepted and immediately
    /// dropped, then the spare is reopened.
    idle_fd: std::cell::Cell<RawFd>,
}

impl Acceptor {
    pub fn new(listen_addr: InetAddress, reuse_port: bool) -> std::io::Result<Rc<Acceptor>> {
        let socket = Socket::new_tcp()?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;

        let fd = socket.as_raw_fd();
        let channel = Rc::new(Channel::new(fd));
        let idle_fd = open_idle_fd();

        let acceptor = Rc::new(Acceptor {
            socket,
            channel,
            new_connection_cb: std::cell::RefCell::new(None),
            listening: std::cell::Cell::new(false),
            idle_fd: std::cell::Cell::new(idle_fd),
        });

        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_ts| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(Socket, InetAddress) + 'static) {
        *self.new_connection_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn local_addr(&self) -> std::io::Result<InetAddress> {
        self.socket.local_addr()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }

    /// Marks this acceptor listening and starts watching for readability.
    /// Takes `event_loop` explicitly rather than going through the
    /// ambient-current-loop lookup `Channel::enable_reading` uses, since
    /// this runs once at `TcpServer::start` time, possibly before that
    /// loop's `run()` has started (and so before the thread-local slot
    /// `enable_reading` relies on is populated).
    pub fn listen(&self, event_loop: &EventLoop, config: &EventLoopConfig) {
        self.listening.set(true);
        if let Err(err) = self.socket.listen(config.listen_backlog) {
            log::error!("Acceptor::listen failed: {err}");
            return;
        }
        self.channel.request_readable();
        event_loop.update_channel(Rc::clone(&self.channel));
    }

    fn handle_read(&self) {
        loop {
            match self.socket.accept() {
                Ok(Some((client, peer))) => {
                    log::debug!("accepted connection from {peer}");
                    match self.new_connection_cb.borrow_mut().as_mut() {
                        Some(cb) => cb(client, peer),
                        None => log::debug!("no new-connection callback set, dropping {peer}"),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    if err.raw_os_error() == Some(libc::EMFILE) {
                        self.handle_emfile();
                    } else {
                        log::error!("Acceptor::accept failed: {err}");
                    }
                    break;
                }
            }
        }
    }

    fn handle_emfile(&self) {
        log::error!("fd limit reached (EMFILE); draining one stuck connection");
        let fd = self.idle_fd.get();
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
        // With one fd freed, accept and immediately drop the connection
        // that was stuck behind the limit.
        if let Ok(Some((_dropped, peer))) = self.socket.accept() {
            log::debug!("dropped stuck connection from {peer} to recover from EMFILE");
        }
        self.idle_fd.set(open_idle_fd());
    }
}

fn open_idle_fd() -> RawFd {
    let path = std::ffi::CString::new("/dev/null").unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        log::error!(
            "failed to open EMFILE spare fd: {}",
            std::io::Error::last_os_error()
        );
    }
    fd
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let fd = self.idle_fd.get();
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
