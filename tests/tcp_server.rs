mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reactorcore::TcpConnection;

#[test]
fn echo_round_trip() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let calls_cb = Arc::clone(&calls);

    let (addr, handle, join) = common::spawn_server(move |server| {
        let calls_conn = Arc::clone(&calls_cb);
        server.set_connection_callback(move |conn| {
            calls_conn.lock().unwrap().push(conn.is_connected());
        });
        server.set_message_callback(|conn, buf, _ts| {
            let data = buf.retrieve_all_as_bytes();
            conn.send(&data);
        });
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"hello").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut resp = [0u8; 5];
    stream.read_exact(&mut resp).unwrap();
    assert_eq!(&resp, b"hello");
    drop(stream);

    thread::sleep(Duration::from_millis(200));
    common::stop(handle, join);

    assert_eq!(*calls.lock().unwrap(), vec![true, false]);
}

#[test]
fn backpressure_high_water_mark_fires_once() {
    const PAYLOAD: usize = 4_000_000;

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hwm_cb = Arc::clone(&hwm_hits);

    let (addr, handle, join) = common::spawn_server(move |server| {
        server.set_connection_callback(|conn| {
            if conn.is_connected() {
                conn.send(&vec![b'x'; PAYLOAD]);
            }
        });
        server.set_high_water_mark_callback(
            move |_conn, _size| {
                hwm_cb.fetch_add(1, Ordering::SeqCst);
            },
            1024,
        );
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    // Let the send happen, and enough buffering back up, before draining.
    thread::sleep(Duration::from_millis(300));

    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 65536];
    let mut total = 0usize;
    while total < PAYLOAD {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) => panic!("client read failed after {total} bytes: {err}"),
        }
    }
    assert_eq!(total, PAYLOAD);

    common::stop(handle, join);
    assert_eq!(hwm_hits.load(Ordering::SeqCst), 1);
}

#[test]
fn half_close_drains_input_then_removes_connection() {
    let states = Arc::new(Mutex::new(Vec::new()));
    let states_cb = Arc::clone(&states);
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_cb = Arc::clone(&received);

    let (addr, handle, join) = common::spawn_server(move |server| {
        let s = Arc::clone(&states_cb);
        server.set_connection_callback(move |conn| {
            s.lock().unwrap().push(conn.is_connected());
        });
        let r = Arc::clone(&received_cb);
        server.set_message_callback(move |_conn, buf, _ts| {
            r.lock().unwrap().extend(buf.retrieve_all_as_bytes());
        });
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"ping").unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    thread::sleep(Duration::from_millis(300));
    common::stop(handle, join);

    assert_eq!(*received.lock().unwrap(), b"ping");
    assert_eq!(*states.lock().unwrap(), vec![true, false]);
}

#[test]
fn cross_thread_send_delivers_to_peer() {
    let conn_slot: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    let slot_cb = Arc::clone(&conn_slot);

    let (addr, handle, join) = common::spawn_server(move |server| {
        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                *slot_cb.lock().unwrap() = Some(Arc::clone(conn));
            }
        });
    });

    let mut stream = TcpStream::connect(addr).unwrap();

    let conn = loop {
        if let Some(c) = conn_slot.lock().unwrap().clone() {
            break c;
        }
        thread::sleep(Duration::from_millis(10));
    };

    // Sent from the test thread, never the connection's own worker loop.
    conn.send(b"pong");

    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");

    common::stop(handle, join);
}

#[test]
fn cross_thread_send_file_delivers_to_peer() {
    use std::os::fd::AsRawFd;

    const PAYLOAD: &[u8] = b"zero-copy payload";

    let conn_slot: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    let slot_cb = Arc::clone(&conn_slot);

    let (addr, handle, join) = common::spawn_server(move |server| {
        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                *slot_cb.lock().unwrap() = Some(Arc::clone(conn));
            }
        });
    });

    let mut stream = TcpStream::connect(addr).unwrap();

    let conn = loop {
        if let Some(c) = conn_slot.lock().unwrap().clone() {
            break c;
        }
        thread::sleep(Duration::from_millis(10));
    };

    let path = std::env::temp_dir().join(format!("reactorcore-send-file-{}.bin", std::process::id()));
    std::fs::write(&path, PAYLOAD).unwrap();
    let file = std::fs::File::open(&path).unwrap();

    // Called from the test thread, never the connection's own worker loop,
    // exercising the same cross-thread dispatch path as `send`.
    conn.send_file(file.as_raw_fd(), 0, PAYLOAD.len()).unwrap();

    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = vec![0u8; PAYLOAD.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, PAYLOAD);

    drop(file);
    let _ = std::fs::remove_file(&path);
    common::stop(handle, join);
}

#[test]
fn dropping_server_joins_worker_threads() {
    use std::cell::RefCell;

    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    thread_local! {
        static GUARD: RefCell<Option<DropCounter>> = RefCell::new(None);
    }

    let alive = Arc::new(AtomicUsize::new(0));
    let alive_for_cb = Arc::clone(&alive);

    let (_addr, handle, join) = common::spawn_server(move |server| {
        server.set_thread_num(2);
        server.set_thread_init_callback(move |_el| {
            alive_for_cb.fetch_add(1, Ordering::SeqCst);
            GUARD.with(|g| *g.borrow_mut() = Some(DropCounter(Arc::clone(&alive_for_cb))));
        });
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while alive.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(alive.load(Ordering::SeqCst), 2, "both worker threads should have started");

    // Dropping the server (which happens as `spawn_server`'s thread closure
    // unwinds after `quit()`) must join its worker threads rather than
    // leaking them, dropping each one's thread-local guard in turn.
    common::stop(handle, join);

    assert_eq!(
        alive.load(Ordering::SeqCst),
        0,
        "TcpServer teardown should join its worker threads"
    );
}

#[test]
fn quit_from_foreign_thread_returns_promptly() {
    let (_addr, handle, join) = common::spawn_server(|_server| {});

    let start = Instant::now();
    handle.quit();
    join.join().unwrap();

    assert!(
        start.elapsed() < Duration::from_secs(2),
        "quit() should wake the loop via eventfd, not wait out its 10s poll timeout"
    );
}
