use std::fmt::Write;
use std::time::Duration;

use crate::Tree;
use crate::engine::NodeId;

/// A publisher that handed its dependents to the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub publisher: NodeId,
    pub dependents: Vec<NodeId>,
}

/// What a single rebuild pass did.
///
/// Returned by [`Tree::rebuild`](crate::Tree::rebuild).
#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    /// Sequence number of the pass, starting at 1.
    pub pass: u64,
    /// Nodes built during the pass, in build order.
    pub built: Vec<NodeId>,
    /// Publishers that notified their dependents during the pass.
    pub notified: Vec<Notification>,
    pub duration: Duration,
}

impl RebuildReport {
    pub(crate) fn new(pass: u64) -> Self {
        Self {
            pass,
            ..Self::default()
        }
    }

    pub fn was_built(&self, node: NodeId) -> bool {
        self.built.contains(&node)
    }

    /// Renders the tree as a Mermaid diagram.
    ///
    /// * **Green**: built in this pass
    /// * **Gray**: untouched
    ///
    /// Solid edges follow the tree, dotted edges point from a publisher to
    /// the dependents it notified.
    pub fn render_mermaid(&self, tree: &Tree) -> String {
        let mut f = String::new();
        writeln!(f, "graph TD").unwrap();

        for (node, name) in tree.nodes() {
            let name = name
                .replace('"', "\\\"")
                .replace('<', "&lt;")
                .replace('>', "&gt;");

            let color = if self.was_built(node) {
                "#90EE90"
            } else {
                "#D3D3D3"
            };

            writeln!(f, "    {}[\"{}\"]", node.index(), name).unwrap();
            writeln!(f, "    style {} fill:{}", node.index(), color).unwrap();
        }

        for (parent, child) in tree.edges() {
            writeln!(f, "    {} --> {}", parent.index(), child.index()).unwrap();
        }

        for notification in &self.notified {
            for dependent in &notification.dependents {
                writeln!(
                    f,
                    "    {} -.-> {}",
                    notification.publisher.index(),
                    dependent.index()
                )
                .unwrap();
            }
        }

        f
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::{Component, Publisher};

    use super::*;

    struct Theme;

    #[test]
    fn test_render_mermaid() {
        let mut tree = Tree::default();
        let publisher = tree
            .mount_publisher(tree.root(), Publisher::value(Rc::new(Theme)).name("theme"))
            .unwrap();
        let leaf = tree
            .mount_component(
                publisher,
                Component::new("label", |cx| {
                    cx.watch::<Theme>()?;
                    Ok(())
                }),
            )
            .unwrap();

        tree.update_publisher(publisher, Publisher::value(Rc::new(Theme)).name("theme"))
            .unwrap();
        let report = tree.rebuild().unwrap();
        let chart = report.render_mermaid(&tree);

        assert!(chart.starts_with("graph TD\n"));
        assert!(chart.contains(&format!("{}[\"label\"]", leaf.index())));
        assert!(chart.contains(&format!("style {} fill:#90EE90", leaf.index())));
        assert!(chart.contains(&format!("style {} fill:#D3D3D3", tree.root().index())));
        assert!(chart.contains(&format!("{} -.-> {}", publisher.index(), leaf.index())));
    }
}
