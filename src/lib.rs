//! A multi-reactor, one-loop-per-thread TCP server engine built directly
//! on Linux `epoll`.
//!
//! The shape is: one accepting [`EventLoop`](event_loop::EventLoop) runs
//! an [`Acceptor`](acceptor::Acceptor), which hands each accepted socket
//! off to a [`TcpConnection`](connection::TcpConnection) living on a
//! worker loop drawn round-robin from an
//! [`EventLoopThreadPool`](event_loop_thread::EventLoopThreadPool).
//! [`TcpServer`](server::TcpServer) wires the three together.
//!
//! Linux-only (raw `epoll`/`eventfd`/`sendfile` syscalls throughout), and
//! IPv4-only. No timers, no TLS, no HTTP — those are layered concerns
//! this crate leaves to its embedder.

#[macro_use]
mod macros;

pub mod acceptor;
pub mod address;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod event_loop;
pub mod event_loop_thread;
pub mod interest;
pub mod server;
pub mod socket;

mod sys;

pub use acceptor::Acceptor;
pub use address::InetAddress;
pub use buffer::Buffer;
pub use channel::Channel;
pub use config::EventLoopConfig;
pub use connection::{ConnectionState, TcpConnection};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use interest::Interest;
pub use server::TcpServer;
pub use socket::Socket;
