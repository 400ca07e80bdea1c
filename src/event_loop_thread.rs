//! `EventLoopThread`: a dedicated OS thread that owns exactly one
//! `EventLoop` for its whole lifetime. `EventLoopThreadPool`: a fixed-size
//! pool of such threads, handed out round-robin to new connections.
//!
//! The publish-under-mutex, notify-condvar handoff mirrors how mio's
//! pre-1.0 `channel()` hands a `Sender` back to a caller before
//! the receiving side has necessarily been constructed: the loop is built
//! on the spawned thread (it must be, to satisfy "constructed and run on
//! the same thread"), so the caller of `EventLoopThread::start_loop`
//! blocks on a condvar until that thread publishes the loop's handle.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::EventLoopConfig;
use crate::event_loop::{EventLoop, EventLoopHandle};

type ThreadInitCallback = Box<dyn Fn(&EventLoop) + Send + Sync>;

pub struct EventLoopThread {
    name: String,
    config: EventLoopConfig,
    init_callback: Option<ThreadInitCallback>,
    published: Arc<(Mutex<Option<EventLoopHandle>>, Condvar)>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, config: EventLoopConfig) -> Self {
        EventLoopThread {
            name: name.into(),
            config,
            init_callback: None,
            published: Arc::new((Mutex::new(None), Condvar::new())),
            join: Mutex::new(None),
        }
    }

    pub fn set_thread_init_callback(&mut self, cb: impl Fn(&EventLoop) + Send + Sync + 'static) {
        self.init_callback = Some(Box::new(cb));
    }

    /// Spawns the worker thread, blocks until it has constructed its
    /// `EventLoop` and published a handle to it, and returns that handle.
    pub fn start_loop(&mut self) -> EventLoopHandle {
        let published = Arc::clone(&self.published);
        let config = self.config;
        let init_callback = self.init_callback.take();
        let thread_name = self.name.clone();

        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new(config) {
                    Ok(el) => el,
                    Err(err) => {
                        log::error!("EventLoopThread '{thread_name}' failed to build EventLoop: {err}");
                        return;
                    }
                };

                if let Some(cb) = init_callback.as_ref() {
                    cb(&event_loop);
                }

                {
                    let (lock, cvar) = &*published;
                    let mut slot = lock.lock().unwrap();
                    *slot = Some(event_loop.handle());
                    cvar.notify_one();
                }

                event_loop.run();
            })
            .expect("failed to spawn EventLoopThread worker");

        *self.join.lock().unwrap() = Some(join);

        let (lock, cvar) = &*self.published;
        let mut slot = lock.lock().unwrap();
        while slot.is_none() {
            slot = cvar.wait(slot).unwrap();
        }
        slot.clone().expect("published handle is set once not-None")
    }

    pub fn join(&self) {
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let published = self.published.0.lock().unwrap().clone();
        if let Some(handle) = published {
            handle.quit();
        }
        self.join();
    }
}

/// A fixed-size round-robin pool of `EventLoopThread`s.
///
/// Deliberately round-robin, not consistent hashing: a per-connection
/// hash-based placement scheme only pays for itself when connections
/// need to be *re-found* by some external key, which this design never
/// requires (a `TcpConnection` already knows which loop it lives on).
pub struct EventLoopThreadPool {
    base_name: String,
    config: EventLoopConfig,
    threads: Vec<EventLoopThread>,
    handles: Vec<EventLoopHandle>,
    next: usize,
}

impl EventLoopThreadPool {
    pub fn new(base_name: impl Into<String>, config: EventLoopConfig) -> Self {
        EventLoopThreadPool {
            base_name: base_name.into(),
            config,
            threads: Vec::new(),
            handles: Vec::new(),
            next: 0,
        }
    }

    /// Spawns `num_threads` worker loops. `num_threads == 0` means "run
    /// everything on the accepting loop", in which case `next_loop` later
    /// returns `None` and callers fall back to the main loop's own handle.
    ///
    /// `init_callback`, if given, runs once per worker loop right after
    /// its `EventLoop` is constructed and before it is published or
    /// starts polling.
    pub fn start(
        &mut self,
        num_threads: usize,
        init_callback: Option<Arc<dyn Fn(&EventLoop) + Send + Sync>>,
    ) {
        for i in 0..num_threads {
            let name = format!("{}-{}", self.base_name, i);
            let mut thread = EventLoopThread::new(name, self.config);
            if let Some(cb) = init_callback.clone() {
                thread.set_thread_init_callback(move |el| cb(el));
            }
            let handle = thread.start_loop();
            self.handles.push(handle);
            self.threads.push(thread);
        }
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }

    /// Returns the next worker loop's handle in round-robin order, or
    /// `None` if the pool has no worker threads.
    pub fn next_loop(&mut self) -> Option<EventLoopHandle> {
        if self.handles.is_empty() {
            return None;
        }
        let handle = self.handles[self.next].clone();
        self.next = (self.next + 1) % self.handles.len();
        Some(handle)
    }

    pub fn all_loops(&self) -> Vec<EventLoopHandle> {
        self.handles.clone()
    }

    /// Stops and joins every worker thread in the pool. Idempotent: a
    /// pool that was never `start`ed, or has already been shut down,
    /// just clears two empty `Vec`s.
    pub fn shutdown(&mut self) {
        self.threads.clear();
        self.handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    thread_local! {
        static GUARD: RefCell<Option<DropCounter>> = RefCell::new(None);
    }

    #[test]
    fn shutdown_joins_worker_threads() {
        let alive = Arc::new(AtomicUsize::new(0));
        let alive_for_cb = Arc::clone(&alive);

        let mut pool = EventLoopThreadPool::new("teardown-test", EventLoopConfig::default());
        pool.start(
            2,
            Some(Arc::new(move |_el: &EventLoop| {
                alive_for_cb.fetch_add(1, Ordering::SeqCst);
                GUARD.with(|g| *g.borrow_mut() = Some(DropCounter(Arc::clone(&alive_for_cb))));
            })),
        );
        assert_eq!(alive.load(Ordering::SeqCst), 2);

        pool.shutdown();

        assert_eq!(
            alive.load(Ordering::SeqCst),
            0,
            "shutdown should join every worker thread, dropping its guard"
        );
    }
}
