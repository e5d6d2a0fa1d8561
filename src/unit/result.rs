//! The payloads of the five stages.

use std::{any::Any, path::PathBuf, sync::Arc, time::SystemTime};

use crate::{diag::Problem, embed::EmbedDescription, names::QName};

use super::Stage;

/// Implemented by each stage's result type.
pub trait StageOutput: Send + Sync + Sized + 'static {
	const STAGE: Stage;

	#[must_use]
	fn problems(&self) -> &[Problem];

	/// A result carrying nothing but `problem`.
	#[must_use]
	fn from_problem(problem: Problem) -> Self;
}

/// A type-erased parse tree. Only the builder that produced it knows its type.
#[derive(Clone)]
pub struct SyntaxTree(Arc<dyn Any + Send + Sync>);

impl SyntaxTree {
	#[must_use]
	pub fn new<T: Any + Send + Sync>(root: T) -> Self {
		Self(Arc::new(root))
	}

	#[must_use]
	pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
		self.0.downcast_ref::<T>()
	}
}

impl std::fmt::Debug for SyntaxTree {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("SyntaxTree(..)")
	}
}

#[derive(Debug, Default)]
pub struct SyntaxTreeResult {
	/// `None` if the root source could not be read, or if the unit's kind has
	/// no tree (prebuilt bytecode, for instance).
	pub tree: Option<SyntaxTree>,
	/// Every file read while parsing besides the root, transitively.
	pub included: Vec<PathBuf>,
	pub last_modified: Option<SystemTime>,
	/// Explicit imports, in source order. May contain wildcards.
	pub imports: Vec<QName>,
	pub problems: Box<[Problem]>,
}

impl StageOutput for SyntaxTreeResult {
	const STAGE: Stage = Stage::SyntaxTree;

	fn problems(&self) -> &[Problem] {
		&self.problems
	}

	fn from_problem(problem: Problem) -> Self {
		Self {
			problems: Box::new([problem]),
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
	Class,
	Interface,
	Function,
	Variable,
	Constant,
	Namespace,
	/// Produced by embedded assets and resource bundles.
	Resource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
	pub qname: QName,
	pub kind: DefinitionKind,
	/// One-based.
	pub line: Option<u32>,
}

/// The externally visible definitions of one file or one prebuilt fragment.
#[derive(Debug, Clone, Default)]
pub struct FileScope {
	pub definitions: Vec<Arc<Definition>>,
}

impl FileScope {
	#[must_use]
	pub fn new(definitions: impl IntoIterator<Item = Definition>) -> Self {
		Self {
			definitions: definitions.into_iter().map(Arc::new).collect(),
		}
	}
}

#[derive(Debug, Default)]
pub struct FileScopeResult {
	pub scopes: Vec<FileScope>,
	pub problems: Box<[Problem]>,
}

impl FileScopeResult {
	pub fn definitions(&self) -> impl Iterator<Item = &Arc<Definition>> + '_ {
		self.scopes.iter().flat_map(|s| s.definitions.iter())
	}
}

impl StageOutput for FileScopeResult {
	const STAGE: Stage = Stage::FileScope;

	fn problems(&self) -> &[Problem] {
		&self.problems
	}

	fn from_problem(problem: Problem) -> Self {
		Self {
			problems: Box::new([problem]),
			..Default::default()
		}
	}
}

#[derive(Debug)]
pub struct CodeBytesResult {
	pub bytes: Arc<[u8]>,
	/// Assets and bundles referenced by the generated code.
	pub embeds: Vec<EmbedDescription>,
	pub problems: Box<[Problem]>,
}

impl StageOutput for CodeBytesResult {
	const STAGE: Stage = Stage::CodeBytes;

	fn problems(&self) -> &[Problem] {
		&self.problems
	}

	fn from_problem(problem: Problem) -> Self {
		Self {
			bytes: Arc::from(Vec::new()),
			embeds: vec![],
			problems: Box::new([problem]),
		}
	}
}

/// One packaged record of the output container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTag {
	pub name: String,
	pub bytes: Arc<[u8]>,
	/// Tags of embedded assets, in the order the unit references them.
	pub assets: Vec<OutputTag>,
}

#[derive(Debug, Default)]
pub struct OutputTagResult {
	pub tag: Option<OutputTag>,
	pub problems: Box<[Problem]>,
}

impl StageOutput for OutputTagResult {
	const STAGE: Stage = Stage::OutputTag;

	fn problems(&self) -> &[Problem] {
		&self.problems
	}

	fn from_problem(problem: Problem) -> Self {
		Self {
			tag: None,
			problems: Box::new([problem]),
		}
	}
}

/// The dependency stage's effects live in the project's graph and registry.
#[derive(Debug, Default)]
pub struct DependenciesResult {
	pub problems: Box<[Problem]>,
}

impl StageOutput for DependenciesResult {
	const STAGE: Stage = Stage::Dependencies;

	fn problems(&self) -> &[Problem] {
		&self.problems
	}

	fn from_problem(problem: Problem) -> Self {
		Self {
			problems: Box::new([problem]),
		}
	}
}
