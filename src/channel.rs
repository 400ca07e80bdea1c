//! Per-fd event registration and typed dispatch.
//!
//! A `Channel` is a pure-data object: it doesn't own the fd it watches
//! (the `Socket`/`Acceptor`/`TcpConnection` does) and doesn't talk to the
//! kernel directly — it asks its owning `EventLoop` to do that via
//! `update_channel`/`remove_channel`. This mirrors the interest/readiness
//! split in mio's `interests.rs`/`event::Source` delegation pattern
//! (register calls forward to the owning registry rather than touching
//! epoll themselves).

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Weak;
use std::time::Instant;

use crate::event_loop::EventLoop;
use crate::interest::Interest;

/// Where a Channel sits in the Selector's fd→Channel map; lets
/// `update_channel`/`remove_channel` decide ADD vs MOD vs DEL in O(1)
/// without probing the kernel.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PollIndex {
    New,
    Added,
    Deleted,
}

type Callback = Box<dyn FnMut()>;
type ReadCallback = Box<dyn FnMut(Instant)>;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<Callback>,
    close: Option<Callback>,
    error: Option<Callback>,
}

pub struct Channel {
    fd: RawFd,
    interest: Cell<Interest>,
    revents: Cell<Interest>,
    index: Cell<PollIndex>,
    tied: Cell<bool>,
    tie: RefCell<Option<Weak<dyn Any + Send + Sync>>>,
    callbacks: RefCell<Callbacks>,
}

impl Channel {
    pub fn new(fd: RawFd) -> Self {
        Channel {
            fd,
            interest: Cell::new(Interest::NONE),
            revents: Cell::new(Interest::NONE),
            index: Cell::new(PollIndex::New),
            tied: Cell::new(false),
            tie: RefCell::new(None),
            callbacks: RefCell::new(Callbacks::default()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    pub fn index(&self) -> PollIndex {
        self.index.get()
    }

    pub fn set_index(&self, index: PollIndex) {
        self.index.set(index);
    }

    pub fn set_revents(&self, revents: Interest) {
        self.revents.set(revents);
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest.get().is_none()
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Instant) + 'static) {
        self.callbacks.borrow_mut().read = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        self.callbacks.borrow_mut().write = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        self.callbacks.borrow_mut().close = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        self.callbacks.borrow_mut().error = Some(Box::new(cb));
    }

    /// Ties this Channel's lifetime to `owner`: once `owner` is dropped, a
    /// stale readiness event dequeued after the fact is silently ignored
    /// instead of dispatched into dangling callback state.
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.borrow_mut() = Some(owner);
        self.tied.set(true);
    }

    /// Sets the readable bit without touching the owning loop's selector.
    /// For callers that already hold `&EventLoop` directly (`Acceptor`)
    /// and so can call `EventLoop::update_channel` themselves instead of
    /// going through the ambient-current-loop lookup `enable_reading`
    /// uses — see `Acceptor::listen`.
    pub fn request_readable(&self) {
        self.interest.set(self.interest.get() | Interest::READABLE);
    }

    pub fn enable_reading(self: &Rc<Self>) {
        self.interest.set(self.interest.get() | Interest::READABLE);
        self.update();
    }

    pub fn enable_writing(self: &Rc<Self>) {
        self.interest.set(self.interest.get() | Interest::WRITABLE);
        self.update();
    }

    pub fn disable_writing(self: &Rc<Self>) {
        let mut i = self.interest.get();
        i.remove(Interest::WRITABLE);
        self.interest.set(i);
        self.update();
    }

    pub fn disable_reading(self: &Rc<Self>) {
        let mut i = self.interest.get();
        i.remove(Interest::READABLE);
        self.interest.set(i);
        self.update();
    }

    pub fn disable_all(self: &Rc<Self>) {
        self.interest.set(Interest::NONE);
        self.update();
    }

    pub fn is_writing(&self) -> bool {
        self.interest.get().is_writable()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.get().is_readable()
    }

    /// Removes this Channel from its owning EventLoop's selector. Must be
    /// called before the last strong reference to the Channel is dropped.
    pub fn remove(self: &Rc<Self>) {
        EventLoop::with_current(|event_loop| event_loop.remove_channel(self));
    }

    fn update(self: &Rc<Self>) {
        EventLoop::with_current(|event_loop| event_loop.update_channel(Rc::clone(self)));
    }

    /// Called by the Selector when `self.fd` becomes ready. `self_rc` is
    /// the same Channel wrapped the way the EventLoop's fd map stores it,
    /// passed back in so the weak-tie upgrade can keep the owner alive for
    /// the duration of dispatch.
    pub fn handle_event(&self, ts: Instant) {
        if self.tied.get() {
            let upgraded = self.tie.borrow().as_ref().and_then(Weak::upgrade);
            match upgraded {
                Some(_owner) => self.handle_event_with_guard(ts),
                None => log::debug!("channel fd={}: tie owner gone, dropping event", self.fd),
            }
        } else {
            self.handle_event_with_guard(ts);
        }
    }

    fn handle_event_with_guard(&self, ts: Instant) {
        let revents = self.revents.get();
        let mut cb = self.callbacks.borrow_mut();

        if revents.is_hangup() && !revents.is_readable() {
            if let Some(f) = cb.close.as_mut() {
                f();
            }
        }
        if revents.is_error() {
            if let Some(f) = cb.error.as_mut() {
                f();
            }
        }
        if revents.is_readable() {
            if let Some(f) = cb.read.as_mut() {
                f(ts);
            }
        }
        if revents.is_writable() {
            if let Some(f) = cb.write.as_mut() {
                f();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn dispatch_order_close_before_read_before_write() {
        let chan = Channel::new(-1);
        let order = Rc::new(StdRefCell::new(Vec::new()));

        let o = order.clone();
        chan.set_close_callback(move || o.borrow_mut().push("close"));
        let o = order.clone();
        chan.set_error_callback(move || o.borrow_mut().push("error"));
        let o = order.clone();
        chan.set_read_callback(move |_| o.borrow_mut().push("read"));
        let o = order.clone();
        chan.set_write_callback(move || o.borrow_mut().push("write"));

        chan.set_revents(Interest::READABLE | Interest::WRITABLE | Interest::HANGUP);
        chan.handle_event_with_guard(Instant::now());

        assert_eq!(*order.borrow(), vec!["close", "read", "write"]);
    }

    #[test]
    fn hangup_with_readable_skips_close_callback() {
        let chan = Channel::new(-1);
        let fired = Rc::new(StdRefCell::new(false));
        let f = fired.clone();
        chan.set_close_callback(move || *f.borrow_mut() = true);

        chan.set_revents(Interest::READABLE | Interest::HANGUP);
        chan.handle_event_with_guard(Instant::now());

        assert!(!*fired.borrow());
    }

    #[test]
    fn untied_channel_always_dispatches() {
        let chan = Channel::new(-1);
        let fired = Rc::new(StdRefCell::new(false));
        let f = fired.clone();
        chan.set_read_callback(move |_| *f.borrow_mut() = true);
        chan.set_revents(Interest::READABLE);
        chan.handle_event(Instant::now());
        assert!(*fired.borrow());
    }
}
