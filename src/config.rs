use std::borrow::Cow;

/// Runtime configuration of a [`Tree`](crate::Tree).
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Name of the root node, shown first in every node path.
    pub root_name: Cow<'static, str>,
    /// Upper bound on the passes [`Tree::flush`](crate::Tree::flush) runs
    /// before giving up on a tree that keeps scheduling rebuilds.
    pub max_passes: usize,
    /// Number of consecutive updates delivering a distinct instance to a
    /// value publisher after which a warning is logged.
    pub value_churn_warning: u32,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            root_name: Cow::Borrowed("root"),
            max_passes: 64,
            value_churn_warning: 3,
        }
    }
}

impl TreeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.root_name = name.into();
        self
    }

    pub fn max_passes(mut self, passes: usize) -> Self {
        self.max_passes = passes;
        self
    }

    pub fn value_churn_warning(mut self, updates: u32) -> Self {
        self.value_churn_warning = updates;
        self
    }
}
