//! A minimal cooperative host for publishing nodes.
//!
//! The [`Tree`] owns the node hierarchy, runs lifecycle hooks, and executes
//! rebuild passes. It implements just enough of a rendering engine to drive
//! the propagation protocol: nodes are mounted under a parent, publishers
//! may be updated in place, and everything marked through
//! [`Host::mark_needs_build`] is rebuilt on the next pass, ancestors first.

use std::any::{TypeId, type_name};
use std::borrow::Cow;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Instant;

use petgraph::Direction;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::Dfs;

use crate::config::TreeOptions;
use crate::diagnostics::{Notification, RebuildReport};
use crate::engine::scope::Scope;
use crate::engine::{Element, Host, NodeId, PropagationHandle, Status};
use crate::error::{HakobuError, TreeError};
use crate::publisher::{Publisher, PublisherElement};

type BuildFn = Rc<dyn Fn(&BuildContext<'_>) -> anyhow::Result<()>>;

/// A node that builds from the values published above it.
///
/// The build callback runs once when the component mounts and again on
/// every pass in which the component is marked, for example because a
/// publisher it watches notified its dependents.
#[derive(Clone)]
pub struct Component {
    name: Cow<'static, str>,
    build: BuildFn,
}

impl Component {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, build: F) -> Self
    where
        F: Fn(&BuildContext<'_>) -> anyhow::Result<()> + 'static,
    {
        Self {
            name: name.into(),
            build: Rc::new(build),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

enum Kind {
    Root,
    Component(Component),
    Publisher(Box<dyn Element>),
}

struct Slot {
    name: Cow<'static, str>,
    depth: usize,
    /// Publishers visible to lookups made at this node.
    visible: Scope,
    /// Publishers visible to this node's children.
    exported: Scope,
    kind: Kind,
}

#[derive(Default)]
struct Scheduler {
    marked: RefCell<HashSet<NodeId>>,
}

impl Scheduler {
    fn drain(&self) -> Vec<NodeId> {
        self.marked.borrow_mut().drain().collect()
    }

    fn forget(&self, node: NodeId) {
        self.marked.borrow_mut().remove(&node);
    }

    fn is_marked(&self, node: NodeId) -> bool {
        self.marked.borrow().contains(&node)
    }

    fn is_empty(&self) -> bool {
        self.marked.borrow().is_empty()
    }
}

impl Host for Scheduler {
    fn mark_needs_build(&self, node: NodeId) {
        self.marked.borrow_mut().insert(node);
    }
}

/// The position of a build in the tree.
///
/// Handed to component build callbacks and to creation functions. Lookups
/// made through a context start at its node and only ever walk upwards.
pub struct BuildContext<'a> {
    tree: &'a Tree,
    node: NodeId,
    tracking: bool,
}

impl<'a> BuildContext<'a> {
    fn tracking(tree: &'a Tree, node: NodeId) -> Self {
        Self {
            tree,
            node,
            tracking: true,
        }
    }

    fn untracked(tree: &'a Tree, node: NodeId) -> Self {
        Self {
            tree,
            node,
            tracking: false,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Path from the root to this node.
    pub fn describe(&self) -> String {
        self.tree.describe(self.node)
    }

    /// Returns the nearest published `T` and subscribes this node to it.
    pub fn watch<T: 'static>(&self) -> Result<Rc<T>, HakobuError> {
        crate::lookup::watch(self)
    }

    /// Returns the nearest published `T` without subscribing.
    pub fn read<T: 'static>(&self) -> Result<Rc<T>, HakobuError> {
        crate::lookup::read(self)
    }

    pub(crate) fn tree(&self) -> &'a Tree {
        self.tree
    }

    /// Whether lookups from this context register dependencies. Creation
    /// functions run untracked since they never run twice.
    pub(crate) fn is_tracking(&self) -> bool {
        self.tracking
    }

    pub(crate) fn for_publisher(&self, publisher: NodeId) -> BuildContext<'a> {
        BuildContext::untracked(self.tree, publisher)
    }
}

/// A tree of components and publishers.
pub struct Tree {
    graph: StableGraph<Slot, ()>,
    root: NodeId,
    scheduler: Rc<Scheduler>,
    subscriptions: RefCell<HashMap<NodeId, BTreeSet<NodeId>>>,
    options: TreeOptions,
    passes: u64,
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new(TreeOptions::default())
    }
}

impl Tree {
    pub fn new(options: TreeOptions) -> Self {
        let mut graph = StableGraph::new();
        let root = graph.add_node(Slot {
            name: options.root_name.clone(),
            depth: 0,
            visible: Scope::default(),
            exported: Scope::default(),
            kind: Kind::Root,
        });

        Self {
            graph,
            root,
            scheduler: Rc::default(),
            subscriptions: RefCell::default(),
            options,
            passes: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Number of mounted nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.graph.contains_node(node)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.graph
            .neighbors_directed(node, Direction::Incoming)
            .next()
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        let mut children: Vec<_> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        children.sort();
        children
    }

    /// Mounts `component` under `parent` and runs its first build.
    ///
    /// A component whose first build fails is removed again.
    pub fn mount_component(
        &mut self,
        parent: NodeId,
        component: Component,
    ) -> Result<NodeId, HakobuError> {
        let (depth, scope) = self.child_position(parent)?;

        let node = self.graph.add_node(Slot {
            name: component.name.clone(),
            depth,
            visible: scope.clone(),
            exported: scope,
            kind: Kind::Component(component),
        });
        self.graph.add_edge(parent, node, ());

        if let Err(err) = self.build_node(node) {
            self.detach(node);
            return Err(err);
        }

        tracing::debug!("Mounted component {}", self.describe(node));
        Ok(node)
    }

    /// Mounts `publisher` under `parent`. Non-lazy publishers create their
    /// value here, before any descendant exists.
    pub fn mount_publisher<T: 'static>(
        &mut self,
        parent: NodeId,
        publisher: Publisher<T>,
    ) -> Result<NodeId, HakobuError> {
        let (depth, scope) = self.child_position(parent)?;
        let name = publisher.display_name();

        let node = self.graph.add_node(Slot {
            name: name.clone(),
            depth,
            visible: scope.clone(),
            exported: scope,
            kind: Kind::Publisher(Box::new(PublisherElement::new(publisher))),
        });
        self.graph.add_edge(parent, node, ());

        let slot = &mut self.graph[node];
        slot.exported = slot.visible.with(TypeId::of::<T>(), node);

        let host = self.host();
        let result = match self.publisher::<T>(node) {
            Some(element) => element.mount(&BuildContext::untracked(self, node), host),
            None => unreachable!("freshly mounted publisher has the wrong type"),
        };

        if let Err(err) = result {
            self.detach(node);
            return Err(HakobuError::Create(name.into_owned(), err));
        }

        tracing::debug!(
            "Mounted publisher {} ({} types in scope below)",
            self.describe(node),
            self.graph[node].exported.len()
        );
        Ok(node)
    }

    /// Replaces the declaration of the publisher at `node`.
    ///
    /// Dependents are notified on the next pass only when the new
    /// declaration carries a different value identity.
    pub fn update_publisher<T: 'static>(
        &mut self,
        node: NodeId,
        publisher: Publisher<T>,
    ) -> Result<(), HakobuError> {
        if !self.contains(node) {
            return Err(TreeError::Unmounted(node).into());
        }

        let element = self
            .publisher::<T>(node)
            .ok_or(TreeError::NotAPublisher(node, type_name::<T>()))?;

        let update = element.update(&BuildContext::untracked(self, node), publisher, &self.options);

        // Scheduled before the creation error surfaces, dependents must see the failure.
        if update.notify {
            tracing::debug!("Publisher {} changed identity", self.describe(node));
            self.scheduler.mark_needs_build(node);
        }

        update
            .created
            .map_err(|err| HakobuError::Create(self.name_of(node), err))
    }

    /// Removes `node` and its whole subtree, deepest nodes first.
    pub fn unmount(&mut self, node: NodeId) -> Result<(), HakobuError> {
        if node == self.root {
            return Err(TreeError::Root.into());
        }
        if !self.contains(node) {
            return Err(TreeError::Unmounted(node).into());
        }

        tracing::debug!("Unmounting {}", self.describe(node));

        let mut doomed = Vec::new();
        let mut dfs = Dfs::new(&self.graph, node);
        while let Some(next) = dfs.next(&self.graph) {
            doomed.push((self.graph[next].depth, next));
        }
        doomed.sort_by_key(|&(depth, next)| Reverse((depth, next)));

        for (_, next) in doomed {
            self.detach(next);
        }

        Ok(())
    }

    fn detach(&mut self, node: NodeId) {
        let publishers = self
            .subscriptions
            .get_mut()
            .remove(&node)
            .unwrap_or_default();

        for publisher in publishers {
            if let Some(element) = self.element(publisher) {
                element.unsubscribe(node);
            }
        }

        if let Some(element) = self.element(node) {
            element.unmount();
        }

        self.scheduler.forget(node);
        self.graph.remove_node(node);
    }

    /// Requests that `node` is built on the next pass.
    pub fn mark_needs_build(&self, node: NodeId) {
        if self.contains(node) {
            self.scheduler.mark_needs_build(node);
        }
    }

    pub fn is_marked(&self, node: NodeId) -> bool {
        self.scheduler.is_marked(node)
    }

    /// Whether any node is waiting for a rebuild pass.
    pub fn has_pending(&self) -> bool {
        !self.scheduler.is_empty()
    }

    /// Runs one rebuild pass.
    ///
    /// Marked nodes are built ancestors first. Dependents notified during
    /// the pass are built in the same pass; nodes at or above the current
    /// position that get marked while it runs wait for the next one.
    pub fn rebuild(&mut self) -> Result<RebuildReport, HakobuError> {
        self.passes += 1;
        let pass = self.passes;

        let span = tracing::debug_span!("rebuild", pass);
        let _enter = span.enter();
        let start = Instant::now();

        let mut pending: BTreeSet<(usize, NodeId)> = self
            .scheduler
            .drain()
            .into_iter()
            .filter_map(|node| self.order_key(node))
            .collect();

        let mut report = RebuildReport::new(pass);
        let mut deferred = Vec::new();
        let result = self.run_pass(&mut pending, &mut deferred, &mut report);

        for node in deferred
            .into_iter()
            .chain(pending.into_iter().map(|(_, node)| node))
        {
            self.scheduler.mark_needs_build(node);
        }

        report.duration = start.elapsed();
        result?;

        tracing::debug!(
            "Rebuild pass {} built {} nodes in {:.2?}",
            pass,
            report.built.len(),
            report.duration
        );

        Ok(report)
    }

    fn run_pass(
        &self,
        pending: &mut BTreeSet<(usize, NodeId)>,
        deferred: &mut Vec<NodeId>,
        report: &mut RebuildReport,
    ) -> Result<(), HakobuError> {
        while let Some(key) = pending.pop_first() {
            let (_, node) = key;
            if !self.contains(node) {
                continue;
            }

            let notified = self.build_node(node)?;
            report.built.push(node);

            if !notified.is_empty() {
                pending.extend(notified.iter().filter_map(|&dep| self.order_key(dep)));
                report.notified.push(Notification {
                    publisher: node,
                    dependents: notified,
                });
            }

            for marked in self.scheduler.drain() {
                match self.order_key(marked) {
                    Some(next) if next > key => {
                        pending.insert(next);
                    }
                    Some(_) => deferred.push(marked),
                    None => {}
                }
            }
        }

        Ok(())
    }

    /// Runs rebuild passes until no node is marked.
    pub fn flush(&mut self) -> Result<Vec<RebuildReport>, HakobuError> {
        let mut reports = Vec::new();

        while self.has_pending() {
            if reports.len() >= self.options.max_passes {
                return Err(HakobuError::Unsettled(reports.len()));
            }
            reports.push(self.rebuild()?);
        }

        Ok(reports)
    }

    fn build_node(&self, node: NodeId) -> Result<Vec<NodeId>, HakobuError> {
        let slot = &self.graph[node];

        match &slot.kind {
            Kind::Root => Ok(Vec::new()),
            Kind::Component(component) => {
                tracing::trace!("Building {}", slot.name);
                let cx = BuildContext::tracking(self, node);
                (component.build)(&cx)
                    .map_err(|err| HakobuError::Build(self.describe(node), err))?;
                Ok(Vec::new())
            }
            Kind::Publisher(element) => {
                let dependents = element.build();
                if !dependents.is_empty() {
                    tracing::debug!(
                        "Publisher {} notifies {} dependents",
                        slot.name,
                        dependents.len()
                    );
                }
                Ok(dependents)
            }
        }
    }

    /// Renders the path from the root to `node`, e.g. `root > settings > label`.
    pub fn describe(&self, node: NodeId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(node);

        while let Some(current) = cursor {
            let Some(slot) = self.graph.node_weight(current) else {
                break;
            };
            names.push(slot.name.as_ref());
            cursor = self.parent(current);
        }

        names.reverse();
        names.join(" > ")
    }

    /// Notification state of the publisher at `node`.
    pub fn status(&self, node: NodeId) -> Option<Status> {
        self.element(node).map(|element| element.status())
    }

    /// Nodes subscribed to the publisher at `node`.
    pub fn dependents(&self, node: NodeId) -> Vec<NodeId> {
        self.element(node)
            .map(|element| element.dependents())
            .unwrap_or_default()
    }

    /// Current handle of the publisher of `T` at `node`.
    pub fn handle<T: 'static>(&self, node: NodeId) -> Option<PropagationHandle<T>> {
        self.publisher::<T>(node).map(PublisherElement::handle)
    }

    /// Whether the publisher of `T` at `node` has run its creation function.
    pub fn is_created<T: 'static>(&self, node: NodeId) -> Option<bool> {
        self.publisher::<T>(node).map(PublisherElement::is_created)
    }

    /// Type published by the node, if it is a publisher.
    pub fn published_type_name(&self, node: NodeId) -> Option<&'static str> {
        self.element(node).map(|element| element.published_type_name())
    }

    pub(crate) fn name_of(&self, node: NodeId) -> String {
        self.graph
            .node_weight(node)
            .map(|slot| slot.name.to_string())
            .unwrap_or_default()
    }

    pub(crate) fn scope_of(&self, node: NodeId) -> Option<&Scope> {
        self.graph.node_weight(node).map(|slot| &slot.visible)
    }

    fn element(&self, node: NodeId) -> Option<&dyn Element> {
        match &self.graph.node_weight(node)?.kind {
            Kind::Publisher(element) => Some(element.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn publisher<T: 'static>(&self, node: NodeId) -> Option<&PublisherElement<T>> {
        self.element(node)?.as_any().downcast_ref()
    }

    pub(crate) fn record_subscription(&self, dependent: NodeId, publisher: NodeId) {
        if let Some(element) = self.element(publisher) {
            element.subscribe(dependent);
            self.subscriptions
                .borrow_mut()
                .entry(dependent)
                .or_default()
                .insert(publisher);
        }
    }

    /// All mounted nodes with their names, in index order.
    pub(crate) fn nodes(&self) -> impl Iterator<Item = (NodeId, &str)> {
        self.graph
            .node_indices()
            .map(|node| (node, self.graph[node].name.as_ref()))
    }

    /// Parent to child edges.
    pub(crate) fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
    }

    fn child_position(&self, parent: NodeId) -> Result<(usize, Scope), TreeError> {
        let slot = self
            .graph
            .node_weight(parent)
            .ok_or(TreeError::Unmounted(parent))?;

        Ok((slot.depth + 1, slot.exported.clone()))
    }

    fn order_key(&self, node: NodeId) -> Option<(usize, NodeId)> {
        self.graph.node_weight(node).map(|slot| (slot.depth, node))
    }

    fn host(&self) -> Weak<dyn Host> {
        let host: Rc<dyn Host> = self.scheduler.clone();
        Rc::downgrade(&host)
    }
}
