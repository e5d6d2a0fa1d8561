//! The collaborators a [project](Project) builds with.
//!
//! Each [`UnitKind`] gets a [`UnitBuilder`] that knows how to parse, scope,
//! generate code for and discover the dependencies of that kind of source;
//! a single [`Packager`] turns code into output tags. [`Backends`] bundles
//! them. The [`plain`] module provides a complete reference set.

pub mod plain;

use std::{
	borrow::Cow,
	path::{Path, PathBuf},
	sync::Arc,
	time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{
	diag::Problem,
	embed::EmbedDescription,
	error::StageError,
	graph::DependencyKinds,
	names::QName,
	project::Project,
	registry::Resolution,
	unit::{
		CodeBytesResult, CompilationUnit, FileScope, OutputTag, Stage, SyntaxTree, UnitKind,
		UnitSource,
	},
};

// Collaborator traits /////////////////////////////////////////////////////////

/// Turns one kind of source into stage payloads. Content errors go to
/// [`BuildContext::raise`]; only unrecoverable failures are `Err`.
pub trait UnitBuilder: Send + Sync {
	/// Whether the file scope is built from the syntax tree, as opposed to
	/// from the raw source.
	fn scope_from_tree(&self) -> bool {
		true
	}

	/// Whether dependencies are only known once code has been generated.
	fn deps_during_codegen(&self) -> bool {
		false
	}

	/// `source` is `None` for synthetic units with no registered content.
	fn parse(
		&self,
		cx: &BuildContext,
		source: Option<&SourceFile>,
	) -> Result<ParsedSource, StageError>;

	fn build_scopes(
		&self,
		cx: &BuildContext,
		tree: Option<&SyntaxTree>,
	) -> Result<Vec<FileScope>, StageError>;

	fn generate(
		&self,
		cx: &BuildContext,
		tree: Option<&SyntaxTree>,
	) -> Result<GeneratedCode, StageError>;

	/// `code` is present only for builders that
	/// [discover during codegen](UnitBuilder::deps_during_codegen).
	fn discover(
		&self,
		cx: &BuildContext,
		tree: Option<&SyntaxTree>,
		code: Option<&CodeBytesResult>,
	) -> Result<Discovered, StageError>;
}

pub trait Packager: Send + Sync {
	/// `assets` are the output tags of the unit's embedded sub-units.
	fn package(
		&self,
		cx: &BuildContext,
		code: &CodeBytesResult,
		assets: Vec<OutputTag>,
	) -> Result<OutputTag, StageError>;
}

/// Where file contents come from when the workspace has no overlay for them.
pub trait SourceProvider: Send + Sync {
	fn read(&self, path: &Path) -> std::io::Result<SourceFile>;
}

/// Reads from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSources;

impl SourceProvider for DiskSources {
	fn read(&self, path: &Path) -> std::io::Result<SourceFile> {
		let bytes = std::fs::read(path)?;
		let last_modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();

		Ok(SourceFile {
			path: path.to_path_buf(),
			bytes: Arc::from(bytes),
			last_modified,
		})
	}
}

// Payloads ////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct SourceFile {
	pub path: PathBuf,
	pub bytes: Arc<[u8]>,
	pub last_modified: Option<SystemTime>,
}

impl SourceFile {
	#[must_use]
	pub fn from_text(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
		Self {
			path: path.into(),
			bytes: Arc::from(text.into().into_bytes()),
			last_modified: Some(SystemTime::now()),
		}
	}

	/// Invalid UTF-8 is replaced.
	#[must_use]
	pub fn text(&self) -> Cow<'_, str> {
		String::from_utf8_lossy(&self.bytes)
	}
}

#[derive(Debug, Default)]
pub struct ParsedSource {
	pub tree: Option<SyntaxTree>,
	pub included: Vec<PathBuf>,
	pub imports: Vec<QName>,
}

#[derive(Debug, Default)]
pub struct GeneratedCode {
	pub bytes: Vec<u8>,
	pub embeds: Vec<EmbedDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
	pub qname: QName,
	pub kind: DependencyKinds,
	/// One-based.
	pub line: Option<u32>,
}

#[derive(Debug, Default)]
pub struct Discovered {
	pub references: Vec<Reference>,
	pub embeds: Vec<EmbedDescription>,
}

// Backends ////////////////////////////////////////////////////////////////////

/// Builders by unit kind, source file extensions by unit kind, and the packager.
#[derive(Clone)]
pub struct Backends {
	builders: FxHashMap<UnitKind, Arc<dyn UnitBuilder>>,
	extensions: FxHashMap<String, UnitKind>,
	packager: Arc<dyn Packager>,
}

impl std::fmt::Debug for Backends {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Backends")
			.field("kinds", &self.builders.keys().collect::<Vec<_>>())
			.field("extensions", &self.extensions)
			.finish_non_exhaustive()
	}
}

impl Backends {
	#[must_use]
	pub fn new(packager: impl Packager + 'static) -> Self {
		Self {
			builders: FxHashMap::default(),
			extensions: FxHashMap::default(),
			packager: Arc::new(packager),
		}
	}

	/// The [`plain`] reference language for every kind.
	#[must_use]
	pub fn plain() -> Self {
		plain::backends()
	}

	#[must_use]
	pub fn with_builder(self, kind: UnitKind, builder: impl UnitBuilder + 'static) -> Self {
		self.with_shared_builder(kind, Arc::new(builder))
	}

	#[must_use]
	pub fn with_shared_builder(mut self, kind: UnitKind, builder: Arc<dyn UnitBuilder>) -> Self {
		self.builders.insert(kind, builder);
		self
	}

	#[must_use]
	pub fn with_packager(mut self, packager: impl Packager + 'static) -> Self {
		self.packager = Arc::new(packager);
		self
	}

	/// `ext` is given without a leading dot.
	#[must_use]
	pub fn with_extension(mut self, ext: &str, kind: UnitKind) -> Self {
		self.extensions.insert(ext.to_string(), kind);
		self
	}

	#[must_use]
	pub fn builder(&self, kind: UnitKind) -> Option<&Arc<dyn UnitBuilder>> {
		self.builders.get(&kind)
	}

	#[must_use]
	pub fn packager(&self) -> &Arc<dyn Packager> {
		&self.packager
	}

	#[must_use]
	pub fn kind_for_path(&self, path: &Path) -> Option<UnitKind> {
		let ext = path.extension()?.to_str()?;
		self.extensions.get(ext).copied()
	}
}

// BuildContext ////////////////////////////////////////////////////////////////

/// What a builder sees of the unit it works on and of the wider build.
pub struct BuildContext<'p> {
	project: &'p Project,
	unit: &'p CompilationUnit,
	stage: Stage,
	problems: Mutex<Vec<Problem>>,
}

impl std::fmt::Debug for BuildContext<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BuildContext")
			.field("unit", &self.unit.name())
			.field("stage", &self.stage)
			.finish_non_exhaustive()
	}
}

impl<'p> BuildContext<'p> {
	#[must_use]
	pub(crate) fn new(project: &'p Project, unit: &'p CompilationUnit, stage: Stage) -> Self {
		Self {
			project,
			unit,
			stage,
			problems: Mutex::new(vec![]),
		}
	}

	#[must_use]
	pub fn project(&self) -> &'p Project {
		self.project
	}

	#[must_use]
	pub fn unit(&self) -> &'p CompilationUnit {
		self.unit
	}

	#[must_use]
	pub fn stage(&self) -> Stage {
		self.stage
	}

	/// Problems without a path are attributed to the unit's root source.
	pub fn raise(&self, mut problem: Problem) {
		if problem.path.is_none() {
			problem.path = self.unit.path().map(Path::to_path_buf);
		}

		self.problems.lock().push(problem);
	}

	#[must_use]
	pub(crate) fn take_problems(&self) -> Box<[Problem]> {
		std::mem::take(&mut *self.problems.lock()).into_boxed_slice()
	}

	/// Builders doing lengthy work should call this now and then.
	pub fn check_interrupt(&self) -> Result<(), StageError> {
		if self.project.workspace().is_interrupted() {
			Err(StageError::Interrupted)
		} else {
			Ok(())
		}
	}

	pub(crate) fn builder(&self) -> Result<&'p Arc<dyn UnitBuilder>, StageError> {
		self.project
			.backends()
			.builder(self.unit.kind())
			.ok_or_else(|| {
				StageError::fault(format!(
					"no builder registered for {:?} units",
					self.unit.kind()
				))
			})
	}

	/// The unit's own content. `Ok(None)` for synthetic units with no content
	/// registered in the workspace.
	pub fn source(&self) -> Result<Option<SourceFile>, StageError> {
		match self.unit.source() {
			UnitSource::File(path) => self.read(path).map(Some),
			UnitSource::Library { container, entry } => {
				let cache = self.project.workspace().library_cache();

				let Some(cached) = cache.get(container, entry) else {
					return Err(StageError::Io {
						path: container.clone(),
						source: std::io::Error::new(
							std::io::ErrorKind::NotFound,
							format!("no cached library entry `{entry}`"),
						),
					});
				};

				Ok(Some(SourceFile {
					path: container.clone(),
					bytes: Arc::from(cached.bytes.as_slice()),
					last_modified: Some(
						SystemTime::UNIX_EPOCH + Duration::from_millis(cached.timestamp),
					),
				}))
			}
			UnitSource::Synthetic(key) => Ok(self.project.workspace().synthetic_source(key)),
		}
	}

	/// Reads any file, preferring the workspace's in-memory overlay.
	pub fn read(&self, path: &Path) -> Result<SourceFile, StageError> {
		self.project
			.workspace()
			.read_source(path)
			.map_err(|source| StageError::Io {
				path: path.to_path_buf(),
				source,
			})
	}

	#[must_use]
	pub fn promises(&self) -> &'p [QName] {
		self.unit.promises()
	}

	/// Set only for units made by the embed factory.
	#[must_use]
	pub fn embed_description(&self) -> Option<EmbedDescription> {
		self.project.embed_description(self.unit.id())
	}

	#[must_use]
	pub fn resolve(&self, qname: &str) -> Option<Resolution> {
		self.project.registry().resolve(qname)
	}
}
