//! Single-threaded publish/subscribe cell.
//!
//! An [`Observable`] owns one value and an ordered list of subscriber
//! callbacks. Cloning an `Observable` yields another handle to the same cell,
//! so a parameter container held by the id-index and by its parent group is
//! one container, not two.
//!
//! Two write paths exist:
//!
//! - [`Observable::set`] is the local-edit path. It runs the optional persist
//!   callback (registered at construction, e.g. "send this to the server")
//!   and then every subscriber.
//! - [`Observable::apply_remote`] is the server-patch path. It runs the
//!   subscribers only, so a value that came from the server is never echoed
//!   back.
//!
//! # Invariants
//!
//! 1. The state always holds the argument of the last `set`/`apply_remote`.
//! 2. Subscribers present when a notification starts are each invoked exactly
//!    once, in subscription order. Subscribers added during the notification
//!    are not invoked for it.
//! 3. Re-entrant writes are allowed. A cell re-entered more than
//!    [`MAX_NOTIFY_DEPTH`] times still updates its state but skips
//!    notification.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::warn;

pub const MAX_NOTIFY_DEPTH: usize = 32;

type Callback<T> = Rc<dyn Fn(&T)>;

/// Handle returned by [`Observable::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Inner<T> {
    state: RefCell<T>,
    persist: Option<Box<dyn Fn(&T)>>,
    subscribers: RefCell<Vec<(SubscriptionId, Callback<T>)>>,
    next_id: Cell<u64>,
    depth: Cell<usize>,
}

pub struct Observable<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Observable<T> {
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> PartialEq for Observable<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("state", &self.inner.state.borrow())
            .field("subscribers", &self.inner.subscribers.borrow().len())
            .field("persist", &self.inner.persist.is_some())
            .finish()
    }
}

impl<T: Clone> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self::build(initial, None)
    }

    /// Create a cell whose local edits are also handed to `persist`.
    pub fn with_persist(initial: T, persist: impl Fn(&T) + 'static) -> Self {
        Self::build(initial, Some(Box::new(persist)))
    }

    fn build(initial: T, persist: Option<Box<dyn Fn(&T)>>) -> Self {
        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(initial),
                persist,
                subscribers: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                depth: Cell::new(0),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.state.borrow().clone()
    }

    /// Borrow the current state without cloning it.
    ///
    /// The closure must not write to this same cell.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.state.borrow())
    }

    /// Local edit: persist callback first, then every subscriber.
    pub fn set(&self, value: T) {
        self.write(value, true);
    }

    /// Server-driven update: subscribers only, the persist callback is skipped.
    pub fn apply_remote(&self, value: T) {
        self.write(value, false);
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        self.inner
            .subscribers
            .borrow_mut()
            .push((id, Rc::new(callback)));
        id
    }

    /// Returns `false` when `id` was not subscribed. Never fails.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.borrow_mut();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    pub fn has_persist(&self) -> bool {
        self.inner.persist.is_some()
    }

    fn write(&self, value: T, persist: bool) {
        let notified = value.clone();
        *self.inner.state.borrow_mut() = value;

        let depth = self.inner.depth.get();
        if depth >= MAX_NOTIFY_DEPTH {
            warn!(depth, "observable notification cycle; skipping subscribers");
            return;
        }
        let _guard = DepthGuard::enter(&self.inner.depth);

        if persist {
            if let Some(persist) = &self.inner.persist {
                persist(&notified);
            }
        }

        // Snapshot so callbacks may subscribe, unsubscribe or write re-entrantly.
        let subscribers: Vec<Callback<T>> = self
            .inner
            .subscribers
            .borrow()
            .iter()
            .map(|(_, callback)| Rc::clone(callback))
            .collect();

        for callback in subscribers {
            callback(&notified);
        }
    }
}

struct DepthGuard<'a>(&'a Cell<usize>);

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Self(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}
