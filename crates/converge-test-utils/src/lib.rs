//! Shared test utilities for the converge workspace.
//!
//! A dev-dependency only, never published.
//!
//! # Modules
//!
//! - [`tree`]: [`TestTree`] builder for scratch directory trees

pub mod tree;

pub use tree::TestTree;
