//! Building graphs of derivations: dependency graphs, the concurrent
//! walk-and-patch walker, and the driver feeding it to a builder.
mod errors;
pub mod driver;
pub mod graph;
pub mod locked_map;
pub mod walker;

#[cfg(test)]
mod fixtures;

pub use driver::{build, BuildRequest, BuildResult, BuiltDerivation};
pub use errors::Error;
pub use graph::{DependencyGraph, Vertex};
pub use walker::{FailurePolicy, WalkOptions, Walker};
