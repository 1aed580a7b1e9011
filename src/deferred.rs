//! Single-resolution futures.
//!
//! A [`Deferred<T>`] starts out pending and settles at most once, either
//! with a shared value or with a [`CreateError`]. The settled state can be
//! queried synchronously at any time, independently of registering a
//! continuation, so callers never have to attach a callback just to learn
//! whether a value is there yet.
//!
//! Settling is done through the paired [`Resolver<T>`], which is consumed
//! in the process. Each deferred carries a [`DeferredToken`]; the
//! propagation layer compares these tokens, never the values, to decide
//! whether dependents must be notified.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use crate::error::CreateError;

/// The outcome of a settled [`Deferred<T>`].
pub type Settlement<T> = Result<Rc<T>, CreateError>;

type Callback<T> = Box<dyn FnOnce(&Settlement<T>)>;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a [`Deferred<T>`].
///
/// Clones of a deferred share its token, distinct deferreds never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferredToken(u64);

impl DeferredToken {
    fn next() -> Self {
        DeferredToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

enum State<T> {
    Pending {
        callbacks: Vec<(u64, Callback<T>)>,
        wakers: Vec<Waker>,
        next_id: u64,
    },
    Settled(Settlement<T>),
}

struct Inner<T> {
    token: DeferredToken,
    state: RefCell<State<T>>,
}

impl<T> Inner<T> {
    fn settle(&self, settlement: Settlement<T>) {
        let previous = {
            let mut state = self.state.borrow_mut();
            if let State::Settled(_) = &*state {
                return;
            }
            std::mem::replace(&mut *state, State::Settled(settlement.clone()))
        };

        // The borrow is released here, continuations may touch this deferred.
        if let State::Pending {
            callbacks, wakers, ..
        } = previous
        {
            for (_, callback) in callbacks {
                callback(&settlement);
            }
            for waker in wakers {
                waker.wake();
            }
        }
    }
}

/// A value that becomes available at most once, at some later point.
pub struct Deferred<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match &*self.inner.state.borrow() {
            State::Pending { .. } => "pending",
            State::Settled(Ok(_)) => "resolved",
            State::Settled(Err(_)) => "failed",
        };
        f.debug_struct("Deferred")
            .field("token", &self.inner.token)
            .field("status", &status)
            .finish()
    }
}

impl<T: 'static> Deferred<T> {
    /// Creates a pending deferred together with the resolver that settles it.
    pub fn pending() -> (Self, Resolver<T>) {
        let inner = Rc::new(Inner {
            token: DeferredToken::next(),
            state: RefCell::new(State::Pending {
                callbacks: Vec::new(),
                wakers: Vec::new(),
                next_id: 0,
            }),
        });

        (
            Self {
                inner: Rc::clone(&inner),
            },
            Resolver { inner },
        )
    }

    /// Creates a deferred that is already resolved with `value`.
    pub fn ready(value: Rc<T>) -> Self {
        Self::settled(Ok(value))
    }

    /// Creates a deferred that has already failed.
    pub fn failed(error: CreateError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(settlement: Settlement<T>) -> Self {
        Self {
            inner: Rc::new(Inner {
                token: DeferredToken::next(),
                state: RefCell::new(State::Settled(settlement)),
            }),
        }
    }

    /// Drives `future` on the current [`tokio::task::LocalSet`] and settles
    /// the returned deferred with its output.
    ///
    /// # Panics
    /// Panics when called outside of a `LocalSet`, like
    /// [`tokio::task::spawn_local`].
    #[cfg(feature = "tokio")]
    pub fn spawn_local<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + 'static,
    {
        let (deferred, resolver) = Self::pending();

        tokio::task::spawn_local(async move {
            match future.await {
                Ok(value) => resolver.resolve(value),
                Err(err) => resolver.reject(err),
            }
        });

        deferred
    }

    pub fn token(&self) -> DeferredToken {
        self.inner.token
    }

    /// Whether `self` and `other` are the same deferred.
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.state.borrow(), State::Settled(_))
    }

    /// Returns the outcome if this deferred has settled.
    pub fn settlement(&self) -> Option<Settlement<T>> {
        match &*self.inner.state.borrow() {
            State::Settled(settlement) => Some(settlement.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Returns the resolved value, if any.
    pub fn value(&self) -> Option<Rc<T>> {
        self.settlement().and_then(Result::ok)
    }

    /// Registers `callback` to run once this deferred settles.
    ///
    /// When the deferred has already settled the callback runs immediately
    /// and the returned [`Continuation`] is inert. Dropping the continuation
    /// before settlement detaches the callback, it will then never run.
    pub fn on_settle<F>(&self, callback: F) -> Continuation<T>
    where
        F: FnOnce(&Settlement<T>) + 'static,
    {
        let settled = {
            let mut state = self.inner.state.borrow_mut();
            match &mut *state {
                State::Settled(settlement) => Some(settlement.clone()),
                State::Pending {
                    callbacks, next_id, ..
                } => {
                    let id = *next_id;
                    *next_id += 1;
                    callbacks.push((id, Box::new(callback)));
                    return Continuation {
                        id,
                        target: Rc::downgrade(&self.inner),
                    };
                }
            }
        };

        if let Some(settlement) = settled {
            callback(&settlement);
        }

        Continuation::inert()
    }

    /// Number of continuations still waiting for this deferred to settle.
    pub fn continuations(&self) -> usize {
        match &*self.inner.state.borrow() {
            State::Pending { callbacks, .. } => callbacks.len(),
            State::Settled(_) => 0,
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = Settlement<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.borrow_mut();
        match &mut *state {
            State::Settled(settlement) => Poll::Ready(settlement.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// The settling side of a [`Deferred<T>`].
///
/// Dropping a resolver without settling leaves its deferred pending forever.
pub struct Resolver<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, value: T) {
        self.inner.settle(Ok(Rc::new(value)));
    }

    /// Resolves with a value that is already shared.
    pub fn resolve_shared(self, value: Rc<T>) {
        self.inner.settle(Ok(value));
    }

    pub fn reject(self, err: impl Into<anyhow::Error>) {
        self.inner.settle(Err(CreateError::new(err)));
    }

    pub fn settle(self, settlement: Settlement<T>) {
        self.inner.settle(settlement);
    }

    pub fn token(&self) -> DeferredToken {
        self.inner.token
    }
}

/// A registered settlement callback, detached when dropped.
#[must_use = "dropping a continuation detaches it"]
pub struct Continuation<T> {
    id: u64,
    target: Weak<Inner<T>>,
}

impl<T> Continuation<T> {
    fn inert() -> Self {
        Self {
            id: 0,
            target: Weak::new(),
        }
    }

    /// Whether the callback is still waiting to run.
    pub fn is_attached(&self) -> bool {
        let Some(inner) = self.target.upgrade() else {
            return false;
        };

        let attached = match &*inner.state.borrow() {
            State::Pending { callbacks, .. } => callbacks.iter().any(|(id, _)| *id == self.id),
            State::Settled(_) => false,
        };
        attached
    }
}

impl<T> Drop for Continuation<T> {
    fn drop(&mut self) {
        let Some(inner) = self.target.upgrade() else {
            return;
        };

        let removed = match &mut *inner.state.borrow_mut() {
            State::Pending { callbacks, .. } => callbacks
                .iter()
                .position(|(id, _)| *id == self.id)
                .map(|index| callbacks.remove(index)),
            State::Settled(_) => None,
        };

        // Dropped outside of the borrow, the callback may own other continuations.
        drop(removed);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_resolve_runs_continuations() {
        let (deferred, resolver) = Deferred::<i32>::pending();
        let seen = Rc::new(Cell::new(0));

        let seen_clone = seen.clone();
        let _continuation = deferred.on_settle(move |settlement| {
            seen_clone.set(**settlement.as_ref().unwrap());
        });

        assert!(!deferred.is_settled());
        assert_eq!(deferred.continuations(), 1);

        resolver.resolve(7);

        assert_eq!(seen.get(), 7);
        assert_eq!(deferred.value().as_deref(), Some(&7));
        assert_eq!(deferred.continuations(), 0);
    }

    #[test]
    fn test_dropped_continuation_never_runs() {
        let (deferred, resolver) = Deferred::<i32>::pending();
        let ran = Rc::new(Cell::new(false));

        let ran_clone = ran.clone();
        let continuation = deferred.on_settle(move |_| ran_clone.set(true));
        assert!(continuation.is_attached());

        drop(continuation);
        assert_eq!(deferred.continuations(), 0);

        resolver.resolve(1);
        assert!(!ran.get());
    }

    #[test]
    fn test_on_settle_after_settlement_runs_immediately() {
        let deferred = Deferred::ready(Rc::new("ready"));
        let ran = Rc::new(Cell::new(false));

        let ran_clone = ran.clone();
        let continuation = deferred.on_settle(move |settlement| {
            assert!(settlement.is_ok());
            ran_clone.set(true);
        });

        assert!(ran.get());
        assert!(!continuation.is_attached());
    }

    #[test]
    fn test_reject() {
        let (deferred, resolver) = Deferred::<i32>::pending();
        resolver.reject(anyhow::anyhow!("offline"));

        let err = deferred.settlement().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "offline");
        assert!(deferred.value().is_none());
    }

    #[test]
    fn test_failed_is_settled_from_the_start() {
        let deferred = Deferred::<i32>::failed(CreateError::new(anyhow::anyhow!("no disk")));
        assert!(deferred.is_settled());

        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();
        let continuation = deferred.on_settle(move |settlement| {
            *seen_clone.borrow_mut() = settlement.as_ref().err().map(ToString::to_string);
        });

        assert!(!continuation.is_attached());
        assert_eq!(seen.borrow().as_deref(), Some("no disk"));
    }

    #[test]
    fn test_resolve_shared_keeps_identity() {
        let (deferred, resolver) = Deferred::<String>::pending();
        assert_eq!(resolver.token(), deferred.token());

        let value = Rc::new(String::from("shared"));
        resolver.resolve_shared(value.clone());

        assert!(Rc::ptr_eq(&deferred.value().unwrap(), &value));
    }

    #[test]
    fn test_tokens_are_identity() {
        let (a, _ra) = Deferred::<i32>::pending();
        let (b, _rb) = Deferred::<i32>::pending();

        assert_eq!(a.token(), a.clone().token());
        assert_ne!(a.token(), b.token());
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));

        // Equal content does not make equal identity.
        let one = Rc::new(1);
        assert_ne!(
            Deferred::ready(one.clone()).token(),
            Deferred::ready(one).token()
        );
    }

    #[test]
    fn test_continuation_may_drop_sibling_continuation() {
        let (deferred, resolver) = Deferred::<i32>::pending();
        let sibling = Rc::new(RefCell::new(Some(deferred.on_settle(|_| {}))));

        let sibling_clone = sibling.clone();
        let _first = deferred.on_settle(move |_| {
            sibling_clone.borrow_mut().take();
        });

        resolver.resolve(3);
        assert!(sibling.borrow().is_none());
    }

    #[tokio::test]
    async fn test_await_resolved_value() {
        let (deferred, resolver) = Deferred::<&str>::pending();
        resolver.resolve("done");

        let value = deferred.clone().await.unwrap();
        assert_eq!(*value, "done");
    }
}
