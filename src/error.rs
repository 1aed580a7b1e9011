use std::sync::Arc;

use thiserror::Error;

use crate::engine::NodeId;

/// A failure raised by a creation function.
///
/// Creation runs at most once per mounted publisher, so the failure is kept
/// and handed to every later lookup. The inner error is shared, which makes
/// this type cheap to clone.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct CreateError(#[from] pub(crate) Arc<anyhow::Error>);

impl CreateError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for CreateError {
    fn from(e: anyhow::Error) -> Self {
        CreateError(Arc::new(e))
    }
}

/// No ancestor of the looking-up node publishes the requested type.
///
/// This always points at a structural mistake in the tree (a missing
/// publisher declaration), so it is surfaced as a hard error instead of
/// being defaulted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("No ancestor publishes `{type_name}` above `{position}`")]
pub struct LookupError {
    /// Full type name of the requested value.
    pub type_name: &'static str,
    /// Ancestor path of the node that performed the lookup.
    pub position: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Node {0:?} is not mounted")]
    Unmounted(NodeId),

    #[error("Node {0:?} is not a publisher of `{1}`")]
    NotAPublisher(NodeId, &'static str),

    #[error("The root node cannot be unmounted")]
    Root,
}

#[derive(Debug, Error)]
pub enum HakobuError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("Publisher '{0}' failed to create its value:\n{1}")]
    Create(String, CreateError),

    #[error("Build of '{0}':\n{1}")]
    Build(String, anyhow::Error),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("Tree did not settle after {0} rebuild passes")]
    Unsettled(usize),
}

impl HakobuError {
    /// Returns the lookup failure behind this error, looking through build
    /// errors raised by components.
    pub fn as_lookup(&self) -> Option<&LookupError> {
        match self {
            HakobuError::Lookup(err) => Some(err),
            HakobuError::Build(_, err) => match err.downcast_ref::<HakobuError>() {
                Some(inner) => inner.as_lookup(),
                None => err.downcast_ref::<LookupError>(),
            },
            _ => None,
        }
    }
}
