//! # incbuild
//!
//! The incremental compilation-unit pipeline of a source-to-bytecode
//! cross-compiler. Every source artifact is a [`unit::CompilationUnit`] whose
//! five stages are computed on demand, memoized, and shared safely between
//! threads; a [`project::Project`] tracks which unit provides each qualified
//! name and which units depend on which, so that a change invalidates only
//! what it must.

pub mod backend;
pub mod cache;
pub mod config;
pub mod diag;
pub mod embed;
pub mod error;
pub mod graph;
pub mod names;
pub mod paths;
pub mod priority;
pub mod project;
pub mod registry;
pub(crate) mod request;
pub mod setup;
pub mod unit;
pub mod workspace;

#[cfg(test)]
mod test;

use std::hash::BuildHasherDefault;

use dashmap::DashMap;
use indexmap::IndexSet;
use rustc_hash::FxHasher;

pub use self::{
	project::{Project, ProjectId, UnitId},
	unit::UnitRef,
	workspace::Workspace,
};

pub type ErrorBox = Box<dyn std::error::Error + Send + Sync>;
pub type UnitResult = Result<(), error::Error>;

pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;
