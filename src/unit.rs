//! [`CompilationUnit`]: one source artifact and its memoized stages.
//!
//! Every unit moves through five stages; each stage's result lives in a
//! [`RequestSlot`] and is computed at most once per generation, however many
//! threads ask for it. [`UnitRef`] is the public handle pairing a unit with
//! the [project](Project) that owns it.

mod handlers;
mod result;

use std::{
	panic::AssertUnwindSafe,
	path::{Path, PathBuf},
	sync::{
		atomic::{self, AtomicU8},
		Arc,
	},
};

use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{
	backend::BuildContext,
	config::TargetKind,
	diag::{Problem, ProblemKind},
	error::StageError,
	names::QName,
	paths::PathIx,
	priority::DefinitionPriority,
	project::Project,
	request::{Request, RequestSlot, RunningGuard, StageKey, WaitError},
	FxIndexSet, UnitId,
};

pub use self::result::*;

pub(crate) use self::handlers::StageHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
	Script,
	Markup,
	BinaryImport,
	Embed,
	ResourceBundle,
	LibraryScript,
	SyntheticModule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
	SyntaxTree,
	FileScope,
	CodeBytes,
	OutputTag,
	Dependencies,
}

impl Stage {
	pub const ALL: [Self; 5] = [
		Self::SyntaxTree,
		Self::FileScope,
		Self::CodeBytes,
		Self::OutputTag,
		Self::Dependencies,
	];

	#[must_use]
	pub fn flag(self) -> Stages {
		match self {
			Self::SyntaxTree => Stages::SYNTAX_TREE,
			Self::FileScope => Stages::FILE_SCOPE,
			Self::CodeBytes => Stages::CODE_BYTES,
			Self::OutputTag => Stages::OUTPUT_TAG,
			Self::Dependencies => Stages::DEPENDENCIES,
		}
	}

	#[must_use]
	pub fn name(self) -> &'static str {
		match self {
			Self::SyntaxTree => "syntax tree",
			Self::FileScope => "file scope",
			Self::CodeBytes => "code bytes",
			Self::OutputTag => "output tag",
			Self::Dependencies => "dependencies",
		}
	}
}

bitflags::bitflags! {
	/// The completion state of a unit.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct Stages: u8 {
		const SYNTAX_TREE = 1 << 0;
		const FILE_SCOPE = 1 << 1;
		const CODE_BYTES = 1 << 2;
		const OUTPUT_TAG = 1 << 3;
		const DEPENDENCIES = 1 << 4;
	}
}

/// Where a unit's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnitSource {
	/// Normalized and absolute.
	File(PathBuf),
	/// An entry inside a library container; content comes from the
	/// [library cache](crate::cache::LibraryCache).
	Library { container: PathBuf, entry: String },
	/// Generated units, such as embedded assets, keyed by a canonical string.
	Synthetic(String),
}

impl UnitSource {
	/// The file whose changes invalidate this unit, if any.
	#[must_use]
	pub fn watched_path(&self) -> Option<&Path> {
		match self {
			Self::File(p) => Some(p),
			Self::Library { container, .. } => Some(container),
			Self::Synthetic(_) => None,
		}
	}
}

impl std::fmt::Display for UnitSource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::File(p) => write!(f, "{}", p.display()),
			Self::Library { container, entry } => write!(f, "{}({entry})", container.display()),
			Self::Synthetic(key) => write!(f, "<{key}>"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
	Unset,
	Visible,
	Invisible,
}

pub struct CompilationUnit {
	pub(crate) id: UnitId,
	source: UnitSource,
	pub(crate) path_ix: Option<PathIx>,
	kind: UnitKind,
	name: String,
	promises: Vec<QName>,
	priority: DefinitionPriority,
	visibility: AtomicCell<Visibility>,
	state: AtomicU8,
	/// Handlers hold this for reading; [`CompilationUnit::clean`] for writing.
	clean_lock: RwLock<()>,
	pub(crate) embeds: Mutex<FxIndexSet<UnitId>>,
	pub(crate) included: Mutex<Vec<PathIx>>,
	pub(crate) syntax_tree: RequestSlot<SyntaxTreeResult>,
	pub(crate) file_scope: RequestSlot<FileScopeResult>,
	pub(crate) code_bytes: RequestSlot<CodeBytesResult>,
	pub(crate) output_tag: RequestSlot<OutputTagResult>,
	pub(crate) dependencies: RequestSlot<DependenciesResult>,
}

impl std::fmt::Debug for CompilationUnit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CompilationUnit")
			.field("id", &self.id)
			.field("name", &self.name)
			.field("kind", &self.kind)
			.field("state", &self.completed())
			.finish_non_exhaustive()
	}
}

impl CompilationUnit {
	#[must_use]
	pub(crate) fn new(
		id: UnitId,
		source: UnitSource,
		path_ix: Option<PathIx>,
		kind: UnitKind,
		priority: DefinitionPriority,
		promises: Vec<QName>,
		scope_from_tree: bool,
	) -> Self {
		let name = match promises.first() {
			Some(q) => q.to_string(),
			None => source.to_string(),
		};

		Self {
			id,
			source,
			path_ix,
			kind,
			name,
			promises,
			priority,
			visibility: AtomicCell::new(Visibility::Unset),
			state: AtomicU8::new(0),
			clean_lock: RwLock::new(()),
			embeds: Mutex::new(FxIndexSet::default()),
			included: Mutex::new(vec![]),
			syntax_tree: RequestSlot::new(false),
			file_scope: RequestSlot::new(scope_from_tree),
			code_bytes: RequestSlot::new(false),
			output_tag: RequestSlot::new(false),
			dependencies: RequestSlot::new(false),
		}
	}

	#[must_use]
	pub fn id(&self) -> UnitId {
		self.id
	}

	#[must_use]
	pub fn source(&self) -> &UnitSource {
		&self.source
	}

	#[must_use]
	pub fn kind(&self) -> UnitKind {
		self.kind
	}

	/// The first promised name if there is one, else the source's display
	/// form. Used to order units deterministically.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn promises(&self) -> &[QName] {
		&self.promises
	}

	#[must_use]
	pub fn priority(&self) -> DefinitionPriority {
		self.priority
	}

	/// The root source file, if the unit has one on disk.
	#[must_use]
	pub fn path(&self) -> Option<&Path> {
		match &self.source {
			UnitSource::File(p) => Some(p),
			_ => None,
		}
	}

	#[must_use]
	pub fn is_invisible(&self) -> bool {
		self.visibility.load() == Visibility::Invisible
	}

	/// Returns `false` if visibility was already decided.
	pub(crate) fn set_visibility(&self, vis: Visibility) -> bool {
		debug_assert_ne!(vis, Visibility::Unset);
		self.visibility
			.compare_exchange(Visibility::Unset, vis)
			.is_ok()
	}

	#[must_use]
	pub fn completed(&self) -> Stages {
		Stages::from_bits_truncate(self.state.load(atomic::Ordering::Acquire))
	}

	fn mark_done(&self, stage: Stage) {
		let bit = stage.flag().bits();
		let mut current = self.state.load(atomic::Ordering::Acquire);

		loop {
			match self.state.compare_exchange_weak(
				current,
				current | bit,
				atomic::Ordering::AcqRel,
				atomic::Ordering::Acquire,
			) {
				Ok(_) => break,
				Err(actual) => current = actual,
			}
		}
	}

	#[must_use]
	fn key(&self, project: &Project, stage: Stage) -> StageKey {
		StageKey {
			project: project.id(),
			unit: self.id,
			stage,
		}
	}

	// Requests ////////////////////////////////////////////////////////////////

	/// Returns the memoized result of stage `S`, computing it on this thread
	/// if nobody else has started.
	pub(crate) fn request<S: StageHandler>(&self, project: &Project) -> Arc<S> {
		let (req, _) = self.install::<S>(project);

		if let Some(done) = req.peek() {
			return done;
		}

		if let Some(done) = self.drive::<S>(project, &req) {
			return done;
		}

		let ws = project.workspace();

		match req.wait(ws.waits(), ws.config().wait_timeout()) {
			Ok(done) => done,
			Err(WaitError::Cycle(chain)) => {
				let names: Vec<_> = chain
					.iter()
					.map(|k| format!("{} of {}", k.stage.name(), project.unit_name(k.unit)))
					.collect();

				warn!(
					"Cyclic wait on the {} stage of `{}`.",
					S::STAGE.name(),
					self.name
				);

				Arc::new(S::from_problem(
					Problem::error(
						ProblemKind::Cycle,
						format!("cyclic stage dependency: {}", names.join(" <- ")),
					)
					.at(self.path()),
				))
			}
			Err(WaitError::Timeout) => {
				warn!(
					"Timed out waiting on the {} stage of `{}`.",
					S::STAGE.name(),
					self.name
				);

				Arc::new(S::from_problem(
					Problem::error(
						ProblemKind::Timeout,
						format!(
							"timed out after {} ms waiting for the {} stage",
							ws.config().wait_timeout_ms,
							S::STAGE.name()
						),
					)
					.at(self.path()),
				))
			}
		}
	}

	/// Installs stage `S`'s request if the slot is empty.
	fn install<S: StageHandler>(&self, project: &Project) -> (Arc<Request<S>>, bool) {
		let slot = S::slot(self);

		if slot.needs_predecessor && slot.peek().is_none() {
			let _ = self.install::<SyntaxTreeResult>(project);
		}

		slot.get_or_install(self.key(project, S::STAGE))
	}

	/// Schedules stage `S` on the workspace pool if nothing has requested it
	/// yet in this generation.
	pub(crate) fn start<S: StageHandler>(&self, project: &Project) {
		let (req, installed) = self.install::<S>(project);

		if !installed {
			return;
		}

		let weak = project.weak();
		let id = self.id;

		project.workspace().spawn(move || {
			let Some(project) = weak.upgrade() else {
				return;
			};

			let Some(unit) = project.unit_arc(id) else {
				return;
			};

			let _ = unit.drive::<S>(&project, &req);
		});
	}

	/// Runs `req` on this thread if nobody has claimed it.
	fn drive<S: StageHandler>(&self, project: &Project, req: &Arc<Request<S>>) -> Option<Arc<S>> {
		let ws = project.workspace();
		let _activity = ws.sync().start_request();
		let running = req.claim(ws.waits())?;
		Some(self.run(project, req, running))
	}

	fn run<S: StageHandler>(
		&self,
		project: &Project,
		req: &Arc<Request<S>>,
		_running: RunningGuard,
	) -> Arc<S> {
		let slot = S::slot(self);
		let _guard = self.clean_lock.read_recursive();

		if !slot.is_current(req) {
			// Cleaned between installation and now.
			let ret = Arc::new(S::from_problem(
				Problem::warning(ProblemKind::Interrupted, "unit was invalidated mid-request")
					.at(self.path()),
			));

			req.complete(ret.clone());
			return ret;
		}

		debug!("Running the {} stage of `{}`.", S::STAGE.name(), self.name);

		let cx = BuildContext::new(project, self, S::STAGE);

		let outcome = match cx.check_interrupt() {
			Ok(()) => std::panic::catch_unwind(AssertUnwindSafe(|| S::compute(&cx))),
			Err(err) => Ok(Err(err)),
		};

		let value = match outcome {
			Ok(Ok(value)) => value,
			Ok(Err(StageError::Interrupted)) => {
				debug!(
					"The {} stage of `{}` was interrupted.",
					S::STAGE.name(),
					self.name
				);

				slot.reset_if(req);

				let ret = Arc::new(S::from_problem(
					Problem::warning(ProblemKind::Interrupted, "build interrupted").at(self.path()),
				));

				req.complete(ret.clone());
				return ret;
			}
			Ok(Err(StageError::Io { path, source })) => S::from_problem(
				Problem::error(
					ProblemKind::Io,
					format!("failed to read `{}`: {source}", path.display()),
				)
				.at(Some(path.as_path())),
			),
			Ok(Err(StageError::Fault(err))) => {
				error!(
					"Internal fault in the {} stage of `{}`: {err}",
					S::STAGE.name(),
					self.name
				);

				S::from_problem(self.fault_problem(S::STAGE, &err.to_string()))
			}
			Err(payload) => {
				let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
					(*s).to_string()
				} else if let Some(s) = payload.downcast_ref::<String>() {
					s.clone()
				} else {
					"unknown panic".to_string()
				};

				error!(
					"Panic in the {} stage of `{}`: {msg}",
					S::STAGE.name(),
					self.name
				);

				S::from_problem(self.fault_problem(S::STAGE, &msg))
			}
		};

		self.mark_done(S::STAGE);
		let ret = Arc::new(value);
		req.complete(ret.clone());
		debug!("Finished the {} stage of `{}`.", S::STAGE.name(), self.name);
		ret
	}

	#[must_use]
	fn fault_problem(&self, stage: Stage, msg: &str) -> Problem {
		Problem::error(
			ProblemKind::InternalFault,
			format!("internal error in the {} stage: {msg}", stage.name()),
		)
		.at(self.path())
	}

	/// Resets the slots of every stage, or with `clear_file_scope` unset, of
	/// every stage after the file scope, along with their completion bits.
	/// Requests nobody has started are completed with an interruption so their
	/// waiters wake. Everything beyond the unit itself is the project's
	/// business.
	pub(crate) fn reset(&self, clear_file_scope: bool) -> parking_lot::RwLockWriteGuard<'_, ()> {
		fn abandon<S: StageOutput>(slot: &RequestSlot<S>) {
			if let Some(req) = slot.reset() {
				req.abandon(|| {
					S::from_problem(Problem::warning(
						ProblemKind::Interrupted,
						"unit was invalidated mid-request",
					))
				});
			}
		}

		let guard = self.clean_lock.write();
		let mut cleared = Stages::CODE_BYTES | Stages::OUTPUT_TAG | Stages::DEPENDENCIES;

		if clear_file_scope {
			abandon(&self.syntax_tree);
			abandon(&self.file_scope);
			cleared |= Stages::SYNTAX_TREE | Stages::FILE_SCOPE;
		}

		abandon(&self.code_bytes);
		abandon(&self.output_tag);
		abandon(&self.dependencies);
		self.state.fetch_and(!cleared.bits(), atomic::Ordering::AcqRel);
		guard
	}
}

// UnitRef /////////////////////////////////////////////////////////////////////

/// A unit together with its project.
#[derive(Debug, Clone)]
pub struct UnitRef<'p> {
	pub(crate) project: &'p Project,
	pub(crate) unit: Arc<CompilationUnit>,
}

impl std::ops::Deref for UnitRef<'_> {
	type Target = CompilationUnit;

	fn deref(&self) -> &Self::Target {
		&self.unit
	}
}

impl<'p> UnitRef<'p> {
	#[must_use]
	pub fn project(&self) -> &'p Project {
		self.project
	}

	pub fn syntax_tree(&self) -> Arc<SyntaxTreeResult> {
		self.unit.request(self.project)
	}

	pub fn file_scope(&self) -> Arc<FileScopeResult> {
		self.unit.request(self.project)
	}

	pub fn code_bytes(&self) -> Arc<CodeBytesResult> {
		self.unit.request(self.project)
	}

	pub fn output_tag(&self) -> Arc<OutputTagResult> {
		self.unit.request(self.project)
	}

	pub fn dependencies(&self) -> Arc<DependenciesResult> {
		self.unit.request(self.project)
	}

	/// Schedules, without waiting, every stage `target` needs.
	pub fn start_build_async(&self, target: TargetKind) {
		self.unit.start::<SyntaxTreeResult>(self.project);
		self.unit.start::<FileScopeResult>(self.project);
		self.unit.start::<DependenciesResult>(self.project);
		self.unit.start::<CodeBytesResult>(self.project);

		if target == TargetKind::Package {
			self.unit.start::<OutputTagResult>(self.project);
		}
	}

	/// Blocks until every stage `target` needs is done, appending their
	/// problems to `problems`. Without a target, only dependency analysis is
	/// of interest, and internal faults from code generation are dropped.
	pub fn wait_for_build_finish(&self, problems: &mut Vec<Problem>, target: Option<TargetKind>) {
		problems.extend_from_slice(self.syntax_tree().problems());
		problems.extend_from_slice(self.file_scope().problems());
		problems.extend_from_slice(self.dependencies().problems());

		let code = self.code_bytes();

		match target {
			None => problems.extend(
				code.problems()
					.iter()
					.filter(|p| p.kind != ProblemKind::InternalFault)
					.cloned(),
			),
			Some(target) => {
				problems.extend_from_slice(code.problems());

				if target == TargetKind::Package {
					problems.extend_from_slice(self.output_tag().problems());
				}
			}
		}
	}

	/// Returns the unit to its freshly-constructed state, retracting what it
	/// contributed to the project. Idempotent.
	pub fn clean(&self) {
		self.project.clean_unit(&self.unit, true);
	}

	/// Invisible units never contribute definitions. Decided at most once;
	/// returns `false` if it already was.
	pub fn make_invisible(&self) -> bool {
		if !self.unit.set_visibility(Visibility::Invisible) {
			return false;
		}

		self.project.registry().remove_unit(self.unit.id);
		true
	}

	/// Synthetic units this one references, in reference order.
	#[must_use]
	pub fn embedded_units(&self) -> Vec<UnitId> {
		self.unit.embeds.lock().iter().copied().collect()
	}

	/// The promised names, or if there are none, the names this unit's file
	/// scope defines.
	pub fn qualified_names(&self) -> Vec<QName> {
		if !self.unit.promises.is_empty() {
			return self.unit.promises.clone();
		}

		self.file_scope()
			.definitions()
			.map(|def| def.qname.clone())
			.collect()
	}
}
