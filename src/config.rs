//! Runtime configuration knobs threaded through `EventLoop`/`TcpServer`.
//!
//! Deliberately a plain `Copy` struct with no env/CLI/file parsing — an
//! embedder sets the fields it cares about and leaves the rest at their
//! `Default`.

/// Tunables shared by every `EventLoop` and `TcpServer` in a process.
#[derive(Copy, Clone, Debug)]
pub struct EventLoopConfig {
    /// Upper bound, in milliseconds, that a single `epoll_wait` call may
    /// block for before `EventLoop::run` re-checks its pending task queue.
    pub poll_timeout_ms: i32,
    /// `listen(2)` backlog used by `Acceptor`.
    pub listen_backlog: i32,
    /// Default high-water mark, in bytes, above which a `TcpConnection`
    /// invokes its high-water-mark callback.
    pub high_water_mark: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        EventLoopConfig {
            poll_timeout_ms: 10_000,
            listen_backlog: 1024,
            high_water_mark: 64 * 1024 * 1024,
        }
    }
}
