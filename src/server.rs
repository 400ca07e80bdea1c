//! `TcpServer`: wires an `Acceptor` to an `EventLoopThreadPool` and tracks
//! the live `TcpConnection`s handed out to worker loops.
//!
//! Grounded on the accept/dispatch/track triangle mio's own
//! `TcpListener` + registry pattern establishes, generalized here to span multiple
//! loops: the accepting loop stays fixed (it owns the `Acceptor`), while
//! each accepted connection is hop-scotched onto a worker loop picked
//! round-robin from the pool.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::acceptor::Acceptor;
use crate::address::InetAddress;
use crate::buffer::Buffer;
use crate::connection::{ConnCallback, HighWaterMarkCallback, MessageCallback, TcpConnection};
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::event_loop_thread::EventLoopThreadPool;
use crate::socket::Socket;

/// The state a `TcpServer` shares with the trampoline closures installed
/// on every `TcpConnection` it creates. Reached from the accepting loop's
/// thread (construction, `new_connection`) and, via `remove_connection`,
/// from whichever worker thread ran `handle_close` — always hopped back
/// onto the accepting loop's thread through `run_in_loop` before any
/// field here is touched, the same confinement argument `TcpConnection`
/// itself makes for its own interior mutability.
struct ServerInner {
    name: String,
    high_water_mark: Cell<usize>,
    next_conn_id: Cell<u64>,
    connections: RefCell<HashMap<String, Arc<TcpConnection>>>,
    connection_cb: RefCell<Option<ConnCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<ConnCallback>>,
    high_water_mark_cb: RefCell<Option<HighWaterMarkCallback>>,
    thread_pool: RefCell<EventLoopThreadPool>,
}

unsafe impl Send for ServerInner {}
unsafe impl Sync for ServerInner {}

/// Accepts connections on `event_loop` and farms each one out to a pool
/// of worker loops. Must be constructed and `start`ed on the thread that
/// owns `event_loop`, before that loop's `run()` begins.
pub struct TcpServer<'a> {
    event_loop: &'a EventLoop,
    acceptor: Rc<Acceptor>,
    inner: Arc<ServerInner>,
    num_threads: Cell<usize>,
    thread_init_cb: RefCell<Option<Arc<dyn Fn(&EventLoop) + Send + Sync>>>,
    started: AtomicUsize,
}

impl<'a> TcpServer<'a> {
    pub fn new(
        event_loop: &'a EventLoop,
        listen_addr: InetAddress,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<TcpServer<'a>> {
        let name = name.into();
        let acceptor = Acceptor::new(listen_addr, reuse_port)?;

        let inner = Arc::new(ServerInner {
            name: name.clone(),
            high_water_mark: Cell::new(event_loop.config().high_water_mark),
            next_conn_id: Cell::new(1),
            connections: RefCell::new(HashMap::new()),
            connection_cb: RefCell::new(None),
            message_cb: RefCell::new(None),
            write_complete_cb: RefCell::new(None),
            high_water_mark_cb: RefCell::new(None),
            thread_pool: RefCell::new(EventLoopThreadPool::new(name, *event_loop.config())),
        });

        let main_handle = event_loop.handle();
        let inner_for_cb = Arc::clone(&inner);
        acceptor.set_new_connection_callback(move |socket, peer| {
            new_connection(&inner_for_cb, &main_handle, socket, peer);
        });

        Ok(TcpServer {
            event_loop,
            acceptor,
            inner,
            num_threads: Cell::new(0),
            thread_init_cb: RefCell::new(None),
            started: AtomicUsize::new(0),
        })
    }

    /// Sets the size of the worker pool; must be called before `start`.
    /// `0` (the default) means every connection is handled on the
    /// accepting loop itself.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.set(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: impl Fn(&EventLoop) + Send + Sync + 'static) {
        *self.thread_init_cb.borrow_mut() = Some(Arc::new(cb));
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + 'static) {
        *self.inner.connection_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, &mut Buffer, Instant) + 'static,
    ) {
        *self.inner.message_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + 'static) {
        *self.inner.write_complete_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Sets the high-water-mark callback and the threshold, in bytes, at
    /// which it fires. The threshold applies to every connection accepted
    /// from this point on; connections already established keep whatever
    /// threshold was in effect when they were constructed.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, usize) + 'static,
        mark: usize,
    ) {
        *self.inner.high_water_mark_cb.borrow_mut() = Some(Box::new(cb));
        self.inner.high_water_mark.set(mark);
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn local_addr(&self) -> io::Result<InetAddress> {
        self.acceptor.local_addr()
    }

    /// Starts the worker pool and begins listening. Idempotent: only the
    /// first call takes effect, matching an embedder calling `start()`
    /// more than once by accident.
    pub fn start(&self) {
        if self.started.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        self.inner
            .thread_pool
            .borrow_mut()
            .start(self.num_threads.get(), self.thread_init_cb.borrow_mut().take());

        self.acceptor.listen(self.event_loop, self.event_loop.config());
    }
}

impl Drop for TcpServer<'_> {
    fn drop(&mut self) {
        let conns: Vec<Arc<TcpConnection>> = self.inner.connections.borrow_mut().drain().map(|(_, c)| c).collect();
        for conn in conns {
            let handle = conn.loop_handle();
            handle.queue_in_loop(move || conn.connect_destroyed());
        }
        // Stop and join worker threads directly here, rather than waiting
        // for ServerInner's refcount to hit zero: every connection holds
        // its own Arc<ServerInner> clone via the trampoline callbacks
        // above, so that refcount may never reach zero while this
        // TcpServer itself is torn down.
        self.inner.thread_pool.borrow_mut().shutdown();
    }
}

fn new_connection(
    inner: &Arc<ServerInner>,
    main_handle: &EventLoopHandle,
    socket: Socket,
    peer_addr: InetAddress,
) {
    let id = inner.next_conn_id.get();
    inner.next_conn_id.set(id + 1);
    let conn_name = format!("{}-{}#{}", inner.name, peer_addr, id);

    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            log::error!("new_connection: local_addr failed: {err}");
            return;
        }
    };

    let worker_handle = inner
        .thread_pool
        .borrow_mut()
        .next_loop()
        .unwrap_or_else(|| main_handle.clone());

    let conn = TcpConnection::new(
        conn_name.clone(),
        socket,
        local_addr,
        peer_addr,
        worker_handle.clone(),
        inner.high_water_mark.get(),
    );

    let i = Arc::clone(inner);
    conn.set_connection_callback(move |c| {
        if let Some(cb) = i.connection_cb.borrow_mut().as_mut() {
            cb(c);
        }
    });
    let i = Arc::clone(inner);
    conn.set_message_callback(move |c, buf, ts| {
        if let Some(cb) = i.message_cb.borrow_mut().as_mut() {
            cb(c, buf, ts);
        }
    });
    let i = Arc::clone(inner);
    conn.set_write_complete_callback(move |c| {
        if let Some(cb) = i.write_complete_cb.borrow_mut().as_mut() {
            cb(c);
        }
    });
    let i = Arc::clone(inner);
    conn.set_high_water_mark_callback(move |c, sz| {
        if let Some(cb) = i.high_water_mark_cb.borrow_mut().as_mut() {
            cb(c, sz);
        }
    });

    let i = Arc::clone(inner);
    let main_handle2 = main_handle.clone();
    conn.set_close_callback(move |c| {
        let i2 = Arc::clone(&i);
        let c2 = Arc::clone(c);
        main_handle2.run_in_loop(move || remove_connection(&i2, c2));
    });

    inner
        .connections
        .borrow_mut()
        .insert(conn_name, Arc::clone(&conn));

    let established = Arc::clone(&conn);
    worker_handle.queue_in_loop(move || established.connect_established());
}

/// Runs on the accepting loop's thread (via `run_in_loop` from
/// `new_connection`'s close-callback trampoline, regardless of which
/// worker thread `handle_close` actually ran on).
fn remove_connection(inner: &Arc<ServerInner>, conn: Arc<TcpConnection>) {
    inner.connections.borrow_mut().remove(conn.name());
    let handle = conn.loop_handle();
    handle.queue_in_loop(move || conn.connect_destroyed());
}
