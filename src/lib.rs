#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod deferred;
mod diagnostics;
mod engine;
mod error;
#[cfg(feature = "logging")]
mod logging;
pub mod lookup;
mod publisher;
mod tree;

pub use crate::config::TreeOptions;
pub use crate::deferred::{Continuation, Deferred, DeferredToken, Resolver, Settlement};
pub use crate::diagnostics::{Notification, RebuildReport};
pub use crate::engine::{Host, NodeId, PropagationHandle, Status};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::lookup::{read, watch, watch_completion};
pub use crate::publisher::{Created, Publisher};
pub use crate::tree::{BuildContext, Component, Tree};
