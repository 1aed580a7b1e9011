use std::any::Any;
use std::borrow::Cow;
use std::cell::{Cell, OnceCell, RefCell};
use std::rc::{Rc, Weak};

use crate::config::TreeOptions;
use crate::deferred::{Continuation, Deferred, Resolver, Settlement};
use crate::engine::propagation::{Propagation, PropagationHandle, Status};
use crate::engine::{Element, Host, NodeId};
use crate::error::CreateError;
use crate::tree::BuildContext;

pub(crate) type CreateFn<T> = Rc<dyn Fn(&BuildContext<'_>) -> anyhow::Result<Created<T>>>;

pub(crate) type DisposeFn<T> = Rc<dyn Fn(&T)>;

/// What a creation function hands back.
pub enum Created<T> {
    /// The value is complete.
    Ready(T),
    /// `placeholder` is published right away and replaced by the value
    /// `completion` resolves with.
    Pending {
        placeholder: T,
        completion: Deferred<T>,
    },
}

enum Source<T> {
    Create(CreateFn<T>),
    Value(Rc<T>),
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        match self {
            Source::Create(create) => Source::Create(create.clone()),
            Source::Value(value) => Source::Value(value.clone()),
        }
    }
}

/// Declaration of a node that publishes a `T` to its subtree.
///
/// # Example
///
/// ```rust
/// # use hakobu::{Component, Publisher, Tree};
/// struct Counter(u32);
///
/// let mut tree = Tree::default();
/// let counter = tree
///     .mount_publisher(tree.root(), Publisher::new(|_| Ok(Counter(0))))
///     .unwrap();
///
/// tree.mount_component(
///     counter,
///     Component::new("label", |cx| {
///         let counter = cx.watch::<Counter>()?;
///         assert_eq!(counter.0, 0);
///         Ok(())
///     }),
/// )
/// .unwrap();
/// ```
pub struct Publisher<T> {
    source: Source<T>,
    lazy: bool,
    key: Option<Cow<'static, str>>,
    name: Option<Cow<'static, str>>,
    dispose: Option<DisposeFn<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            lazy: self.lazy,
            key: self.key.clone(),
            name: self.name.clone(),
            dispose: self.dispose.clone(),
        }
    }
}

impl<T: 'static> Publisher<T> {
    /// Publishes the value returned by `create`.
    ///
    /// The publisher is lazy: `create` runs on the first lookup from a
    /// descendant, or never if nobody looks. It runs at most once for each
    /// mounted node.
    pub fn new<F>(create: F) -> Self
    where
        F: Fn(&BuildContext<'_>) -> anyhow::Result<T> + 'static,
    {
        Self::from_source(Source::Create(Rc::new(move |cx: &BuildContext<'_>| {
            create(cx).map(Created::Ready)
        })))
    }

    /// Publishes a value whose creation may complete later.
    ///
    /// When `create` returns [`Created::Pending`], lookups see the
    /// placeholder until the completion resolves. The resolution is what
    /// notifies dependents, never the first creation.
    pub fn deferred<F>(create: F) -> Self
    where
        F: Fn(&BuildContext<'_>) -> anyhow::Result<Created<T>> + 'static,
    {
        Self::from_source(Source::Create(Rc::new(create)))
    }

    /// Publishes an instance owned by someone else.
    ///
    /// The publisher never constructs anything in this form. Passing a fresh
    /// instance on every rebuild breaks that contract: each new instance
    /// counts as a new value and notifies every dependent. Callers must hand
    /// in the same `Rc` for as long as the value is meant to be the same.
    pub fn value(value: Rc<T>) -> Self {
        let mut publisher = Self::from_source(Source::Value(value));
        publisher.lazy = false;
        publisher
    }

    fn from_source(source: Source<T>) -> Self {
        Self {
            source,
            lazy: true,
            key: None,
            name: None,
            dispose: None,
        }
    }

    /// Sets whether creation waits for the first lookup. Has no effect on
    /// value publishers.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Declarations at the same position with different keys are distinct:
    /// updating to a new key discards the old value and creates a new one.
    pub fn key(mut self, key: impl Into<Cow<'static, str>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Runs `dispose` on the created value when the node unmounts or its
    /// value is replaced. Never runs for value publishers.
    ///
    /// A deferred creation whose completion resolved owns two values, the
    /// placeholder and the resolved one. Both are disposed, placeholder first.
    pub fn dispose<F>(mut self, dispose: F) -> Self
    where
        F: Fn(&T) + 'static,
    {
        self.dispose = Some(Rc::new(dispose));
        self
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy && matches!(self.source, Source::Create(_))
    }

    pub(crate) fn display_name(&self) -> Cow<'static, str> {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("Publisher<{}>", std::any::type_name::<T>()).into(),
        }
    }

    /// Whether `next` describes a different value than `self`.
    fn replaced_by(&self, next: &Self) -> bool {
        match (&self.source, &next.source) {
            (Source::Value(old), Source::Value(new)) => !Rc::ptr_eq(old, new),
            (Source::Create(_), Source::Create(_)) => self.key != next.key,
            _ => true,
        }
    }

    fn initial_state(&self) -> Rc<PublisherState<T>> {
        match &self.source {
            Source::Create(_) => PublisherState::fresh(),
            Source::Value(value) => PublisherState::wrapping(value.clone()),
        }
    }

    fn create_fn(&self) -> Option<CreateFn<T>> {
        match &self.source {
            Source::Create(create) => Some(create.clone()),
            Source::Value(_) => None,
        }
    }
}

/// The value owned by one mounted publisher.
///
/// `resolved` is written at most once and never changes afterwards; the
/// node's `completion` settles at the same moment.
pub(crate) struct PublisherState<T> {
    created: OnceCell<Result<Rc<T>, CreateError>>,
    resolved: OnceCell<Rc<T>>,
    completion: Deferred<T>,
    resolver: RefCell<Option<Resolver<T>>>,
    awaiting: RefCell<Option<Continuation<T>>>,
    owned: bool,
}

impl<T: 'static> PublisherState<T> {
    pub(crate) fn fresh() -> Rc<Self> {
        let (completion, resolver) = Deferred::pending();

        Rc::new(Self {
            created: OnceCell::new(),
            resolved: OnceCell::new(),
            completion,
            resolver: RefCell::new(Some(resolver)),
            awaiting: RefCell::new(None),
            owned: true,
        })
    }

    pub(crate) fn wrapping(value: Rc<T>) -> Rc<Self> {
        Rc::new(Self {
            created: OnceCell::from(Ok(value.clone())),
            resolved: OnceCell::from(value.clone()),
            completion: Deferred::ready(value),
            resolver: RefCell::new(None),
            awaiting: RefCell::new(None),
            owned: false,
        })
    }

    pub(crate) fn completion(&self) -> &Deferred<T> {
        &self.completion
    }

    pub(crate) fn is_created(&self) -> bool {
        self.created.get().is_some()
    }

    pub(crate) fn current<F>(
        self: &Rc<Self>,
        cx: &BuildContext<'_>,
        create: F,
    ) -> Result<Rc<T>, CreateError>
    where
        F: FnOnce(&BuildContext<'_>) -> anyhow::Result<Created<T>>,
    {
        if let Some(value) = self.resolved.get() {
            return Ok(value.clone());
        }

        let created = self.created.get_or_init(|| self.run(cx, create));

        // A pending creation may have settled while it ran.
        match self.resolved.get() {
            Some(value) => Ok(value.clone()),
            None => created.clone(),
        }
    }

    fn run<F>(self: &Rc<Self>, cx: &BuildContext<'_>, create: F) -> Result<Rc<T>, CreateError>
    where
        F: FnOnce(&BuildContext<'_>) -> anyhow::Result<Created<T>>,
    {
        match create(cx) {
            Err(err) => {
                let err = CreateError::new(err);
                self.settle(Err(err.clone()));
                Err(err)
            }
            Ok(Created::Ready(value)) => {
                let value = Rc::new(value);
                let _ = self.resolved.set(value.clone());
                self.settle(Ok(value.clone()));
                Ok(value)
            }
            Ok(Created::Pending {
                placeholder,
                completion,
            }) => {
                let state = Rc::downgrade(self);
                let continuation = completion.on_settle(move |settlement| {
                    PublisherState::complete(&state, settlement);
                });
                self.awaiting.replace(Some(continuation));
                Ok(Rc::new(placeholder))
            }
        }
    }

    fn complete(state: &Weak<Self>, settlement: &Settlement<T>) {
        let Some(state) = state.upgrade() else {
            return;
        };

        if let Ok(value) = settlement {
            let _ = state.resolved.set(value.clone());
        }
        state.settle(settlement.clone());
    }

    pub(crate) fn settle(&self, settlement: Settlement<T>) {
        let resolver = self.resolver.borrow_mut().take();
        if let Some(resolver) = resolver {
            resolver.settle(settlement);
        }
    }

    /// Releases the value. Pending completions are abandoned, not awaited.
    pub(crate) fn dispose(&self, hook: Option<&DisposeFn<T>>) {
        self.awaiting.replace(None);
        self.resolver.replace(None);

        if !self.owned {
            return;
        }

        let Some(hook) = hook else {
            return;
        };

        let placeholder = match self.created.get() {
            Some(Ok(created)) => Some(created),
            _ => None,
        };

        // A resolved completion replaced the placeholder, both were ours.
        match (placeholder, self.resolved.get()) {
            (Some(placeholder), Some(resolved)) if !Rc::ptr_eq(placeholder, resolved) => {
                hook(placeholder);
                hook(resolved);
            }
            (_, Some(value)) | (Some(value), None) => hook(value),
            (None, None) => {}
        }
    }
}

/// Outcome of installing a new declaration on a mounted publisher.
pub(crate) struct Update {
    pub(crate) notify: bool,
    pub(crate) created: Result<(), CreateError>,
}

/// A mounted publisher: its declaration, the value it owns, and the
/// propagation node that notifies its dependents.
pub(crate) struct PublisherElement<T> {
    declaration: RefCell<Publisher<T>>,
    state: RefCell<Rc<PublisherState<T>>>,
    propagation: Propagation<T>,
    churn: Cell<u32>,
}

impl<T: 'static> PublisherElement<T> {
    pub(crate) fn new(declaration: Publisher<T>) -> Self {
        let state = declaration.initial_state();
        let handle = PropagationHandle::new(&state, declaration.create_fn());

        Self {
            declaration: RefCell::new(declaration),
            state: RefCell::new(state),
            propagation: Propagation::new(handle),
            churn: Cell::new(0),
        }
    }

    /// Eager creation runs before the propagation node starts tracking, so
    /// an already settled value schedules no notification.
    pub(crate) fn mount(
        &self,
        cx: &BuildContext<'_>,
        host: Weak<dyn Host>,
    ) -> Result<(), CreateError> {
        if !self.declaration.borrow().is_lazy() {
            self.propagation.handle().current(cx)?;
        }

        self.propagation.mount(cx.node(), host);
        Ok(())
    }

    /// Installs a new declaration.
    ///
    /// The returned [`Update`] says whether dependents must be notified,
    /// which holds even when an eager re-creation failed.
    pub(crate) fn update(
        &self,
        cx: &BuildContext<'_>,
        next: Publisher<T>,
        options: &TreeOptions,
    ) -> Update {
        let replaced = self.declaration.borrow().replaced_by(&next);

        if replaced {
            self.track_churn(&next, options);
            let previous = self.state.replace(next.initial_state());
            previous.dispose(self.declaration.borrow().dispose.as_ref());
        } else {
            self.churn.set(0);
        }

        let eager = replaced && !next.is_lazy();
        let handle = PropagationHandle::new(&self.state.borrow(), next.create_fn());
        self.declaration.replace(next);

        // Create before installing, a settled deferred needs no continuation.
        let created = if eager {
            handle.current(cx).map(|_| ())
        } else {
            Ok(())
        };

        Update {
            notify: self.propagation.update(handle),
            created,
        }
    }

    fn track_churn(&self, next: &Publisher<T>, options: &TreeOptions) {
        let both_values = matches!(
            (&self.declaration.borrow().source, &next.source),
            (Source::Value(_), Source::Value(_))
        );

        if !both_values {
            self.churn.set(0);
            return;
        }

        let churn = self.churn.get() + 1;
        self.churn.set(churn);

        if churn == options.value_churn_warning {
            tracing::warn!(
                "Publisher '{}' received a different value instance on {} consecutive updates. \
                 Value publishers must wrap an existing instance, not construct a new one.",
                next.display_name(),
                churn,
            );
        }
    }

    pub(crate) fn current(&self, cx: &BuildContext<'_>) -> Result<Rc<T>, CreateError> {
        self.propagation.handle().current(cx)
    }

    pub(crate) fn handle(&self) -> PropagationHandle<T> {
        self.propagation.handle()
    }

    pub(crate) fn is_created(&self) -> bool {
        self.state.borrow().is_created()
    }
}

impl<T: 'static> Element for PublisherElement<T> {
    fn published_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn status(&self) -> Status {
        self.propagation.status()
    }

    fn build(&self) -> Vec<NodeId> {
        self.propagation.build()
    }

    fn unmount(&self) {
        self.propagation.unmount();
        let declaration = self.declaration.borrow();
        self.state.borrow().dispose(declaration.dispose.as_ref());
    }

    fn subscribe(&self, dependent: NodeId) {
        self.propagation.subscribe(dependent);
    }

    fn unsubscribe(&self, dependent: NodeId) {
        self.propagation.unsubscribe(dependent);
    }

    fn dependents(&self) -> Vec<NodeId> {
        self.propagation.dependents()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{Context, SubscriberExt};

    use super::*;
    use crate::tree::{Component, Tree};

    struct Theme(&'static str);

    /// Counts `WARN` events emitted while installed.
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn with_warnings(f: impl FnOnce()) -> usize {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(warnings.clone()));
        tracing::subscriber::with_default(subscriber, f);
        warnings.load(Ordering::Relaxed)
    }

    fn churn(tree: &Tree, node: NodeId) -> u32 {
        tree.publisher::<Theme>(node).unwrap().churn.get()
    }

    fn fresh_value() -> Publisher<Theme> {
        Publisher::value(Rc::new(Theme("dark")))
    }

    #[test]
    fn test_churn_warns_once_at_threshold() {
        let mut tree = Tree::new(TreeOptions::new().value_churn_warning(3));
        let node = tree.mount_publisher(tree.root(), fresh_value()).unwrap();

        let warnings = with_warnings(|| {
            for _ in 0..5 {
                tree.update_publisher(node, fresh_value()).unwrap();
            }
        });

        assert_eq!(churn(&tree, node), 5);
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_same_instance_resets_churn() {
        let mut tree = Tree::new(TreeOptions::new().value_churn_warning(3));
        let node = tree.mount_publisher(tree.root(), fresh_value()).unwrap();
        let stable = Rc::new(Theme("light"));

        let warnings = with_warnings(|| {
            tree.update_publisher(node, fresh_value()).unwrap();
            tree.update_publisher(node, Publisher::value(stable.clone())).unwrap();
            assert_eq!(churn(&tree, node), 2);

            tree.update_publisher(node, Publisher::value(stable.clone())).unwrap();
            assert_eq!(churn(&tree, node), 0);

            tree.update_publisher(node, fresh_value()).unwrap();
            tree.update_publisher(node, fresh_value()).unwrap();
        });

        assert_eq!(churn(&tree, node), 2);
        assert_eq!(warnings, 0);
    }

    #[test]
    fn test_switching_variant_resets_churn() {
        let mut tree = Tree::new(TreeOptions::new().value_churn_warning(3));
        let node = tree.mount_publisher(tree.root(), fresh_value()).unwrap();

        let warnings = with_warnings(|| {
            tree.update_publisher(node, fresh_value()).unwrap();
            tree.update_publisher(node, fresh_value()).unwrap();
            assert_eq!(churn(&tree, node), 2);

            tree.update_publisher(node, Publisher::new(|_| Ok(Theme("created"))))
                .unwrap();
            assert_eq!(churn(&tree, node), 0);

            tree.update_publisher(node, fresh_value()).unwrap();
            assert_eq!(churn(&tree, node), 0);

            tree.update_publisher(node, fresh_value()).unwrap();
        });

        assert_eq!(churn(&tree, node), 1);
        assert_eq!(warnings, 0);
    }

    #[test]
    fn test_value_declaration_has_no_creation_function() {
        let value = fresh_value();
        assert!(value.create_fn().is_none());
        assert!(!value.is_lazy());

        let created = Publisher::new(|_| Ok(Theme("created")));
        assert!(created.create_fn().is_some());
        assert!(created.is_lazy());
    }

    #[test]
    fn test_dispose_covers_placeholder_and_resolved_value() {
        let (completion, resolver) = Deferred::<Theme>::pending();
        let disposed: Rc<RefCell<Vec<&'static str>>> = Rc::default();

        let publisher = {
            let disposed = disposed.clone();
            Publisher::deferred(move |_| {
                Ok(Created::Pending {
                    placeholder: Theme("loading"),
                    completion: completion.clone(),
                })
            })
            .dispose(move |theme| disposed.borrow_mut().push(theme.0))
        };

        let mut tree = Tree::default();
        let node = tree.mount_publisher(tree.root(), publisher).unwrap();
        tree.mount_component(
            node,
            Component::new("leaf", |cx| {
                cx.watch::<Theme>()?;
                Ok(())
            }),
        )
        .unwrap();

        resolver.resolve(Theme("dark"));
        tree.flush().unwrap();
        assert!(disposed.borrow().is_empty());

        tree.unmount(node).unwrap();
        assert_eq!(*disposed.borrow(), vec!["loading", "dark"]);
    }

    #[test]
    fn test_ready_value_disposed_once() {
        let disposed = Rc::new(Cell::new(0));
        let publisher = {
            let disposed = disposed.clone();
            Publisher::new(|_| Ok(Theme("dark")))
                .lazy(false)
                .dispose(move |_| disposed.set(disposed.get() + 1))
        };

        let mut tree = Tree::default();
        let node = tree.mount_publisher(tree.root(), publisher).unwrap();
        tree.unmount(node).unwrap();

        assert_eq!(disposed.get(), 1);
    }
}
