//! Nearest-ancestor lookups.
//!
//! Every lookup resolves the publisher of `T` closest to the calling node,
//! walking upwards only. When no ancestor publishes `T` the lookup fails
//! with a [`LookupError`] naming both the type and the calling position.

use std::any::{TypeId, type_name};
use std::rc::Rc;

use crate::deferred::Deferred;
use crate::engine::NodeId;
use crate::error::{HakobuError, LookupError};
use crate::publisher::PublisherElement;
use crate::tree::BuildContext;

/// Returns the nearest published `T` and, when called from a component
/// build, subscribes the caller to it.
///
/// A lazy publisher creates its value on the first call.
pub fn watch<T: 'static>(cx: &BuildContext<'_>) -> Result<Rc<T>, HakobuError> {
    let (node, element) = nearest::<T>(cx, cx.is_tracking())?;

    element
        .current(&cx.for_publisher(node))
        .map_err(|err| HakobuError::Create(cx.tree().name_of(node), err))
}

/// Like [`watch`], but never subscribes.
pub fn read<T: 'static>(cx: &BuildContext<'_>) -> Result<Rc<T>, HakobuError> {
    let (node, element) = nearest::<T>(cx, false)?;

    element
        .current(&cx.for_publisher(node))
        .map_err(|err| HakobuError::Create(cx.tree().name_of(node), err))
}

/// Returns the deferred of the nearest publisher of `T`.
///
/// The deferred settles once the published value is final: immediately
/// for values created synchronously, on completion for values that start
/// out as a placeholder. Creation is not triggered by this call.
pub fn watch_completion<T: 'static>(cx: &BuildContext<'_>) -> Result<Deferred<T>, HakobuError> {
    let (_, element) = nearest::<T>(cx, cx.is_tracking())?;
    Ok(element.handle().deferred().clone())
}

fn nearest<'a, T: 'static>(
    cx: &BuildContext<'a>,
    subscribe: bool,
) -> Result<(NodeId, &'a PublisherElement<T>), HakobuError> {
    let tree = cx.tree();

    let node = tree
        .scope_of(cx.node())
        .and_then(|scope| scope.nearest(TypeId::of::<T>()))
        .ok_or_else(|| LookupError {
            type_name: type_name::<T>(),
            position: cx.describe(),
        })?;

    let element = tree
        .publisher::<T>(node)
        .expect("scope entry points at a publisher of the same type");

    if subscribe {
        tracing::trace!("{} watches {}", cx.describe(), tree.describe(node));
        tree.record_subscription(cx.node(), node);
    }

    Ok((node, element))
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use crate::publisher::Publisher;
    use crate::tree::{Component, Tree};

    use super::*;

    struct Locale(&'static str);

    struct Greeting(String);

    #[test]
    fn test_read_does_not_subscribe() {
        let mut tree = Tree::default();
        let publisher = tree
            .mount_publisher(tree.root(), Publisher::value(Rc::new(Locale("en"))))
            .unwrap();

        let builds = Rc::new(Cell::new(0));
        {
            let builds = builds.clone();
            tree.mount_component(
                publisher,
                Component::new("reader", move |cx| {
                    builds.set(builds.get() + 1);
                    read::<Locale>(cx)?;
                    Ok(())
                }),
            )
            .unwrap();
        }

        assert!(tree.dependents(publisher).is_empty());

        tree.update_publisher(publisher, Publisher::value(Rc::new(Locale("ja"))))
            .unwrap();
        let report = tree.rebuild().unwrap();

        assert_eq!(report.built, vec![publisher]);
        assert!(report.notified.is_empty());
        assert_eq!(builds.get(), 1);
    }

    #[test]
    fn test_watch_subscribes_once() {
        let mut tree = Tree::default();
        let publisher = tree
            .mount_publisher(tree.root(), Publisher::value(Rc::new(Locale("en"))))
            .unwrap();

        let leaf = tree
            .mount_component(
                publisher,
                Component::new("twice", |cx| {
                    watch::<Locale>(cx)?;
                    watch::<Locale>(cx)?;
                    Ok(())
                }),
            )
            .unwrap();

        assert_eq!(tree.dependents(publisher), vec![leaf]);
    }

    #[test]
    fn test_create_reads_from_above() {
        let mut tree = Tree::default();
        let locale = tree
            .mount_publisher(tree.root(), Publisher::value(Rc::new(Locale("en"))))
            .unwrap();
        let greeting = tree
            .mount_publisher(
                locale,
                Publisher::new(|cx| {
                    let locale = cx.watch::<Locale>()?;
                    Ok(Greeting(format!("hello ({})", locale.0)))
                }),
            )
            .unwrap();

        let seen = Rc::new(RefCell::new(String::new()));
        {
            let seen = seen.clone();
            tree.mount_component(
                greeting,
                Component::new("banner", move |cx| {
                    *seen.borrow_mut() = cx.watch::<Greeting>()?.0.clone();
                    Ok(())
                }),
            )
            .unwrap();
        }

        assert_eq!(*seen.borrow(), "hello (en)");
        // Creation runs once, the publisher does not subscribe to its parent.
        assert!(tree.dependents(locale).is_empty());
    }

    #[test]
    fn test_publisher_does_not_see_itself() {
        let mut tree = Tree::default();
        let err = tree
            .mount_publisher(
                tree.root(),
                Publisher::new(|cx| {
                    let outer = cx.watch::<Locale>()?;
                    Ok(Locale(outer.0))
                })
                .lazy(false),
            )
            .unwrap_err();

        let HakobuError::Create(_, err) = err else {
            panic!("expected a creation error");
        };
        assert!(err.to_string().contains("No ancestor publishes"));
    }

    #[test]
    fn test_completion_of_ready_value() {
        let mut tree = Tree::default();
        let publisher = tree
            .mount_publisher(tree.root(), Publisher::value(Rc::new(Locale("en"))))
            .unwrap();

        let settled = Rc::new(Cell::new(false));
        {
            let settled = settled.clone();
            tree.mount_component(
                publisher,
                Component::new("leaf", move |cx| {
                    let completion = watch_completion::<Locale>(cx)?;
                    settled.set(completion.value().is_some_and(|locale| locale.0 == "en"));
                    Ok(())
                }),
            )
            .unwrap();
        }

        assert!(settled.get());
    }
}
