//! The bramble store: content addressed build outputs and the machinery to
//! build a single derivation into it.
pub mod archive;
pub mod builder;
pub mod cache;
mod config;
pub mod derivation;
mod errors;
pub mod fetch;
pub mod hasher;
pub mod lockfile;
pub mod paths;
pub mod sandbox;
mod store;
pub mod textreplace;

pub use builder::{BuildOptions, Builder};
pub use config::StoreConfig;
pub use derivation::{Dependency, Derivation, Output, Source};
pub use errors::Error;
pub use store::{HashedDirectory, Store};
