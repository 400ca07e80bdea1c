// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Once;
use std::thread::{self, JoinHandle};

use reactorcore::{EventLoop, EventLoopConfig, EventLoopHandle, InetAddress, TcpServer};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Spawns a dedicated thread that owns one `EventLoop`, builds a
/// `TcpServer` bound to `127.0.0.1:0`, lets `configure` install callbacks
/// and tune thread count, starts it, and then runs the loop until
/// `quit()` is called on the returned handle. Blocks until the server is
/// actually listening so the caller's client connect can't race it.
pub fn spawn_server<F>(configure: F) -> (SocketAddr, EventLoopHandle, JoinHandle<()>)
where
    F: FnOnce(&TcpServer<'_>) + Send + 'static,
{
    spawn_server_with_config(EventLoopConfig::default(), configure)
}

pub fn spawn_server_with_config<F>(
    config: EventLoopConfig,
    configure: F,
) -> (SocketAddr, EventLoopHandle, JoinHandle<()>)
where
    F: FnOnce(&TcpServer<'_>) + Send + 'static,
{
    init();
    let (tx, rx) = mpsc::channel();

    let join = thread::spawn(move || {
        let event_loop = EventLoop::new(config).expect("EventLoop::new");
        let server = TcpServer::new(&event_loop, InetAddress::loopback(0), "test", false)
            .expect("TcpServer::new");
        configure(&server);
        server.start();
        let addr = SocketAddr::from(server.local_addr().expect("local_addr"));
        tx.send((addr, event_loop.handle())).expect("send addr back to test thread");
        event_loop.run();
    });

    let (addr, handle) = rx.recv().expect("server thread failed to start");
    (addr, handle, join)
}

pub fn stop(handle: EventLoopHandle, join: JoinHandle<()>) {
    handle.quit();
    join.join().expect("server thread panicked");
}
