//! The notify-on-change half of a publishing node.
//!
//! # Design
//!
//! A [`Propagation<T>`] holds the current [`PropagationHandle<T>`] of its
//! publisher and tracks the handle's deferred. When that deferred settles,
//! the node turns [`Status::Dirty`] and asks the host for a rebuild; the next
//! build then hands every dependent back to the host and returns to
//! [`Status::Clean`].
//!
//! # Invariants
//!
//! 1. The node is `Dirty` strictly between "notification owed" (tracked
//!    deferred settled, or a handle with a different deferred installed) and
//!    the end of the next build.
//! 2. Two handles are equivalent iff their deferreds share a token. Values
//!    are never compared.
//! 3. After unmount, or after the tracked deferred was replaced, a late
//!    settlement is ignored.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use crate::deferred::{Continuation, Deferred, DeferredToken};
use crate::engine::{Host, NodeId};
use crate::error::CreateError;
use crate::publisher::{CreateFn, PublisherState};
use crate::tree::BuildContext;

/// Whether a propagation node owes its dependents a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Clean,
    Dirty,
}

/// Snapshot of a published value as exposed to descendants.
///
/// The handle gives access to the current value, creating it on first use,
/// and carries the deferred used as the change-tracking token.
pub struct PropagationHandle<T> {
    pub(crate) state: Rc<PublisherState<T>>,
    pub(crate) create: Option<CreateFn<T>>,
    pub(crate) deferred: Deferred<T>,
}

impl<T> Clone for PropagationHandle<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            create: self.create.clone(),
            deferred: self.deferred.clone(),
        }
    }
}

impl<T: 'static> PartialEq for PropagationHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.token() == other.token()
    }
}

impl<T: 'static> PropagationHandle<T> {
    pub(crate) fn new(state: &Rc<PublisherState<T>>, create: Option<CreateFn<T>>) -> Self {
        Self {
            state: Rc::clone(state),
            create,
            deferred: state.completion().clone(),
        }
    }

    /// Returns the current value, running the creation function if this is
    /// the first access. `cx` is the context of the publishing node.
    pub(crate) fn current(&self, cx: &BuildContext<'_>) -> Result<Rc<T>, CreateError> {
        self.state.current(cx, |cx| match &self.create {
            Some(create) => create(cx),
            None => Err(anyhow::anyhow!("publisher has no creation function")),
        })
    }

    pub fn deferred(&self) -> &Deferred<T> {
        &self.deferred
    }

    pub fn token(&self) -> DeferredToken {
        self.deferred.token()
    }
}

struct Signal {
    status: Cell<Status>,
    live: Cell<bool>,
    active: Cell<Option<DeferredToken>>,
}

struct Mounted {
    node: NodeId,
    host: Weak<dyn Host>,
}

pub(crate) struct Propagation<T> {
    handle: RefCell<PropagationHandle<T>>,
    signal: Rc<Signal>,
    continuation: RefCell<Option<Continuation<T>>>,
    dependents: RefCell<BTreeSet<NodeId>>,
    mounted: OnceCell<Mounted>,
}

impl<T: 'static> Propagation<T> {
    pub(crate) fn new(handle: PropagationHandle<T>) -> Self {
        Self {
            handle: RefCell::new(handle),
            signal: Rc::new(Signal {
                status: Cell::new(Status::Clean),
                live: Cell::new(false),
                active: Cell::new(None),
            }),
            continuation: RefCell::new(None),
            dependents: RefCell::new(BTreeSet::new()),
            mounted: OnceCell::new(),
        }
    }

    /// Two handles need a notification iff they carry different deferreds.
    pub(crate) fn should_notify(old: &PropagationHandle<T>, new: &PropagationHandle<T>) -> bool {
        old != new
    }

    pub(crate) fn mount(&self, node: NodeId, host: Weak<dyn Host>) {
        if self.mounted.set(Mounted { node, host }).is_err() {
            tracing::warn!("Propagation node {:?} mounted twice", node);
            return;
        }

        self.signal.live.set(true);
        let deferred = self.handle.borrow().deferred.clone();
        self.track(&deferred);
    }

    fn track(&self, deferred: &Deferred<T>) {
        let token = deferred.token();
        self.signal.active.set(Some(token));

        if deferred.is_settled() {
            self.continuation.replace(None);
            return;
        }

        let Some(mounted) = self.mounted.get() else {
            return;
        };

        let node = mounted.node;
        let host = mounted.host.clone();
        let signal = Rc::downgrade(&self.signal);

        let continuation = deferred.on_settle(move |_| {
            let Some(signal) = signal.upgrade() else {
                return;
            };

            if !signal.live.get() {
                tracing::trace!("Ignoring settlement for unmounted node {:?}", node);
                return;
            }

            if signal.active.get() != Some(token) {
                tracing::debug!("Ignoring stale settlement {:?} for node {:?}", token, node);
                return;
            }

            if signal.status.replace(Status::Dirty) == Status::Dirty {
                return;
            }

            tracing::debug!("Deferred value of node {:?} settled, scheduling rebuild", node);
            if let Some(host) = host.upgrade() {
                host.mark_needs_build(node);
            }
        });

        self.continuation.replace(Some(continuation));
    }

    /// Installs a new handle. Returns whether dependents must be notified.
    pub(crate) fn update(&self, next: PropagationHandle<T>) -> bool {
        let notify = Self::should_notify(&self.handle.borrow(), &next);
        let deferred = next.deferred.clone();
        self.handle.replace(next);

        if notify {
            self.track(&deferred);
            self.signal.status.set(Status::Dirty);
        }

        notify
    }

    /// Returns the dependents to notify in this pass, leaving the node clean.
    pub(crate) fn build(&self) -> Vec<NodeId> {
        if self.signal.status.get() == Status::Clean {
            return Vec::new();
        }

        let dependents = self.dependents.borrow().iter().copied().collect();
        self.signal.status.set(Status::Clean);
        dependents
    }

    pub(crate) fn unmount(&self) {
        self.signal.live.set(false);
        self.signal.active.set(None);
        self.signal.status.set(Status::Clean);
        self.continuation.replace(None);
        self.dependents.borrow_mut().clear();
    }

    pub(crate) fn handle(&self) -> PropagationHandle<T> {
        self.handle.borrow().clone()
    }

    pub(crate) fn status(&self) -> Status {
        self.signal.status.get()
    }

    pub(crate) fn subscribe(&self, dependent: NodeId) {
        self.dependents.borrow_mut().insert(dependent);
    }

    pub(crate) fn unsubscribe(&self, dependent: NodeId) {
        self.dependents.borrow_mut().remove(&dependent);
    }

    pub(crate) fn dependents(&self) -> Vec<NodeId> {
        self.dependents.borrow().iter().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn is_tracking(&self) -> bool {
        self.continuation
            .borrow()
            .as_ref()
            .is_some_and(Continuation::is_attached)
    }
}
