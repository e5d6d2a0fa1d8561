//! [`Workspace`]: what every project in one build session shares.
//!
//! That is the path interner, in-memory file overlays, the mapping from files
//! to the units built from them, the worker pool, the idle bracket that file
//! events mutate projects under, and the library cache.

mod sync;

use std::{
	path::Path,
	sync::{
		atomic::{self, AtomicBool, AtomicU32},
		Arc, Weak,
	},
};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
	backend::{DiskSources, SourceFile, SourceProvider},
	cache::LibraryCache,
	config::WorkspaceConfig,
	error::Error,
	paths::{PathInterner, PathIx},
	project::{Project, ProjectId},
	request::WaitGraph,
	unit::CompilationUnit,
	FxDashMap, UnitId, UnitResult,
};

pub(crate) use self::sync::BuildSync;

/// A unit in some project, held weakly.
#[derive(Debug, Clone)]
pub(crate) struct UnitHandle {
	project: Weak<Project>,
	project_id: ProjectId,
	unit: UnitId,
}

impl UnitHandle {
	#[must_use]
	pub(crate) fn new(project: &Project, unit: UnitId) -> Self {
		Self {
			project: project.weak(),
			project_id: project.id(),
			unit,
		}
	}

	#[must_use]
	fn is(&self, project: ProjectId, unit: UnitId) -> bool {
		self.project_id == project && self.unit == unit
	}
}

/// Units whose definitions must be registered again when idle ends.
#[derive(Debug, Default)]
pub struct PendingUpdates {
	units: Vec<(Weak<Project>, UnitId)>,
}

impl PendingUpdates {
	pub(crate) fn push(&mut self, project: Weak<Project>, unit: UnitId) {
		self.units.push((project, unit));
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.units.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.units.is_empty()
	}
}

pub struct Workspace {
	config: WorkspaceConfig,
	paths: PathInterner,
	provider: Box<dyn SourceProvider>,
	overlay: FxDashMap<PathIx, SourceFile>,
	synthetic: FxDashMap<String, SourceFile>,
	units_by_path: FxDashMap<PathIx, Vec<UnitHandle>>,
	/// Included file to the units whose syntax trees read it.
	included_by: FxDashMap<PathIx, Vec<UnitHandle>>,
	projects: RwLock<Vec<Weak<Project>>>,
	pool: rayon::ThreadPool,
	sync: BuildSync,
	waits: WaitGraph,
	interrupted: AtomicBool,
	library_cache: LibraryCache,
	next_project: AtomicU32,
}

impl std::fmt::Debug for Workspace {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Workspace")
			.field("config", &self.config)
			.field("paths", &self.paths)
			.field("threads", &self.pool.current_num_threads())
			.finish_non_exhaustive()
	}
}

impl Workspace {
	pub fn new(config: WorkspaceConfig) -> Result<Arc<Self>, Error> {
		Self::with_provider(config, DiskSources)
	}

	pub fn with_provider(
		config: WorkspaceConfig,
		provider: impl SourceProvider + 'static,
	) -> Result<Arc<Self>, Error> {
		let pool = rayon::ThreadPoolBuilder::new()
			.num_threads(config.threads)
			.thread_name(|i| format!("incbuild-worker{i}"))
			.build()?;

		info!(
			"Build pool started with {} thread(s).",
			pool.current_num_threads()
		);

		Ok(Arc::new(Self {
			config,
			paths: PathInterner::default(),
			provider: Box::new(provider),
			overlay: FxDashMap::default(),
			synthetic: FxDashMap::default(),
			units_by_path: FxDashMap::default(),
			included_by: FxDashMap::default(),
			projects: RwLock::new(vec![]),
			pool,
			sync: BuildSync::default(),
			waits: WaitGraph::default(),
			interrupted: AtomicBool::new(false),
			library_cache: LibraryCache::default(),
			next_project: AtomicU32::new(0),
		}))
	}

	#[must_use]
	pub fn config(&self) -> &WorkspaceConfig {
		&self.config
	}

	#[must_use]
	pub fn paths(&self) -> &PathInterner {
		&self.paths
	}

	#[must_use]
	pub fn library_cache(&self) -> &LibraryCache {
		&self.library_cache
	}

	#[must_use]
	pub(crate) fn sync(&self) -> &BuildSync {
		&self.sync
	}

	#[must_use]
	pub(crate) fn waits(&self) -> &WaitGraph {
		&self.waits
	}

	pub(crate) fn spawn(&self, f: impl FnOnce() + Send + 'static) {
		self.pool.spawn(f);
	}

	#[must_use]
	pub(crate) fn next_project_id(&self) -> ProjectId {
		ProjectId(self.next_project.fetch_add(1, atomic::Ordering::Relaxed))
	}

	pub(crate) fn add_project(&self, project: &Arc<Project>) {
		let mut projects = self.projects.write();
		projects.retain(|p| p.strong_count() > 0);
		projects.push(Arc::downgrade(project));
	}

	/// Every project still alive, in creation order.
	#[must_use]
	pub fn projects(&self) -> Vec<Arc<Project>> {
		self.projects
			.read()
			.iter()
			.filter_map(Weak::upgrade)
			.collect()
	}

	#[must_use]
	pub fn is_building(&self) -> bool {
		self.sync.is_building()
	}

	// Sources /////////////////////////////////////////////////////////////////

	/// The overlay if there is one, else the source provider.
	pub fn read_source(&self, path: &Path) -> std::io::Result<SourceFile> {
		if let Some(ix) = self.paths.get(path) {
			if let Some(file) = self.overlay.get(&ix) {
				return Ok(file.value().clone());
			}
		}

		self.provider.read(path)
	}

	/// Replaces what builders see of `path` and invalidates what read it.
	/// Returns the number of units invalidated.
	pub fn set_overlay(&self, path: &Path, text: impl Into<String>) -> usize {
		let ix = self.paths.intern(path);
		let norm = self.paths.resolve(ix).to_path_buf();
		self.overlay.insert(ix, SourceFile::from_text(norm, text));
		self.file_changed(path)
	}

	/// Returns the number of units invalidated.
	pub fn clear_overlay(&self, path: &Path) -> usize {
		let Some(ix) = self.paths.get(path) else {
			return 0;
		};

		if self.overlay.remove(&ix).is_none() {
			return 0;
		}

		self.file_changed(path)
	}

	/// Content for a [synthetic unit](crate::unit::UnitSource::Synthetic).
	pub fn set_synthetic_source(&self, key: impl Into<String>, text: impl Into<String>) {
		let key = key.into();
		let file = SourceFile::from_text(format!("<{key}>"), text);
		self.synthetic.insert(key, file);
	}

	#[must_use]
	pub(crate) fn synthetic_source(&self, key: &str) -> Option<SourceFile> {
		self.synthetic.get(key).map(|f| f.value().clone())
	}

	// Unit mapping ////////////////////////////////////////////////////////////

	pub(crate) fn map_unit(&self, ix: PathIx, handle: UnitHandle) {
		self.units_by_path.entry(ix).or_default().push(handle);
	}

	pub(crate) fn unmap_unit(&self, ix: PathIx, project: ProjectId, unit: UnitId) {
		if let Some(mut handles) = self.units_by_path.get_mut(&ix) {
			handles.retain(|h| !h.is(project, unit));
		}
	}

	pub(crate) fn record_included(
		&self,
		handle: UnitHandle,
		unit: &CompilationUnit,
		paths: &[std::path::PathBuf],
	) {
		let ixs: Vec<PathIx> = paths.iter().map(|p| self.paths.intern(p)).collect();

		for ix in &ixs {
			self.included_by.entry(*ix).or_default().push(handle.clone());
		}

		unit.included.lock().extend(ixs);
	}

	pub(crate) fn forget_included(&self, project: ProjectId, unit: &CompilationUnit) {
		let ixs = std::mem::take(&mut *unit.included.lock());

		for ix in ixs {
			if let Some(mut handles) = self.included_by.get_mut(&ix) {
				handles.retain(|h| !h.is(project, unit.id()));
			}
		}
	}

	/// Units whose root source or included files contain `path`.
	#[must_use]
	fn affected_by(&self, ix: PathIx) -> Vec<UnitHandle> {
		let mut ret: Vec<UnitHandle> = self
			.units_by_path
			.get(&ix)
			.map(|h| h.value().clone())
			.unwrap_or_default();

		if let Some(includers) = self.included_by.get(&ix) {
			ret.extend(includers.value().iter().cloned());
		}

		ret
	}

	// Idle bracket ////////////////////////////////////////////////////////////

	/// Waits for every running stage request to finish, then keeps new ones
	/// from starting on other threads until the guard drops. Must not be
	/// called from inside a stage handler.
	#[must_use]
	pub fn begin_idle(&self) -> IdleGuard<'_> {
		self.sync.start_idle();
		debug!("Idle state acquired.");

		IdleGuard {
			workspace: self,
			pending: PendingUpdates::default(),
		}
	}

	/// Re-registers the definitions of each pending unit, then releases idle.
	fn end_idle(&self, pending: PendingUpdates) {
		struct Release<'s>(&'s BuildSync);

		impl Drop for Release<'_> {
			fn drop(&mut self) {
				self.0.end_idle();
			}
		}

		let _release = Release(&self.sync);

		for (project, id) in pending.units {
			if let Some(project) = project.upgrade() {
				project.reregister(id);
			}
		}

		debug!("Idle state released.");
	}

	// File events /////////////////////////////////////////////////////////////

	/// Cleans every unit built from `path`, plus their dependents.
	/// Returns the number of units invalidated.
	pub fn file_changed(&self, path: &Path) -> usize {
		let Some(ix) = self.paths.get(path) else {
			return 0;
		};

		let handles = self.affected_by(ix);

		if handles.is_empty() {
			return 0;
		}

		let mut idle = self.begin_idle();
		let mut ret = 0;

		for handle in handles {
			if let Some(project) = handle.project.upgrade() {
				ret += project.invalidate(&[handle.unit], idle.pending_mut());
			}
		}

		info!("`{}` changed.", path.display());
		ret
	}

	/// Gives `path` a unit in every project with a source root containing
	/// it, then cleans units that referenced names the new units promise
	/// back when those names were missing. Returns the new units.
	pub fn file_added(&self, path: &Path) -> Vec<(ProjectId, UnitId)> {
		let norm = crate::paths::normalize(path);
		let mut idle = self.begin_idle();
		let mut ret = vec![];

		for project in self.projects() {
			let Some(id) = project.handle_added_file(&norm) else {
				continue;
			};

			let names = project
				.unit(id)
				.map(|u| u.promises().to_vec())
				.unwrap_or_default();

			let stale = project.units_depending_on_missing(&names);
			project.invalidate(&stale, idle.pending_mut());
			ret.push((project.id(), id));
		}

		// Includers of a file that did not exist before now read something new.
		if let Some(ix) = self.paths.get(&norm) {
			if let Some(includers) = self.included_by.get(&ix).map(|h| h.value().clone()) {
				for handle in includers {
					if let Some(project) = handle.project.upgrade() {
						project.invalidate(&[handle.unit], idle.pending_mut());
					}
				}
			}
		}

		info!("`{}` added.", norm.display());
		ret
	}

	/// Invalidates the dependents of every unit built from `path`, then
	/// removes those units.
	pub fn file_removed(&self, path: &Path) {
		let Some(ix) = self.paths.get(path) else {
			return;
		};

		self.overlay.remove(&ix);
		let handles = self.affected_by(ix);
		let mut idle = self.begin_idle();

		for handle in handles {
			let Some(project) = handle.project.upgrade() else {
				continue;
			};

			project.invalidate(&[handle.unit], idle.pending_mut());

			let own_unit = project
				.unit(handle.unit)
				.is_some_and(|u| u.path_ix == Some(ix));

			if own_unit {
				project.remove_unit(handle.unit);
			}
		}

		info!("`{}` removed.", path.display());
	}

	// Interruption ////////////////////////////////////////////////////////////

	/// Stage handlers that poll their context stop early, and their results
	/// are not memoized. Lasts until [`Workspace::resume`].
	pub fn interrupt(&self) {
		self.interrupted.store(true, atomic::Ordering::Release);
		info!("Build interrupted.");
	}

	pub fn resume(&self) {
		self.interrupted.store(false, atomic::Ordering::Release);
	}

	#[must_use]
	pub fn is_interrupted(&self) -> bool {
		self.interrupted.load(atomic::Ordering::Acquire)
	}

	// Library cache ///////////////////////////////////////////////////////////

	/// Waits for idle so no handler reads the cache mid-write.
	pub fn save_library_cache(&self, path: &Path) -> UnitResult {
		let _idle = self.begin_idle();
		self.library_cache.save(path)
	}

	pub fn load_library_cache(&self, path: &Path) -> UnitResult {
		let _idle = self.begin_idle();
		self.library_cache.load(path)
	}
}

/// Holds the workspace idle. Dropping it re-registers the definitions of the
/// [pending](PendingUpdates) units, then lets stage requests run again.
pub struct IdleGuard<'w> {
	workspace: &'w Workspace,
	pending: PendingUpdates,
}

impl std::fmt::Debug for IdleGuard<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("IdleGuard")
			.field("pending", &self.pending.len())
			.finish()
	}
}

impl IdleGuard<'_> {
	pub fn pending_mut(&mut self) -> &mut PendingUpdates {
		&mut self.pending
	}
}

impl Drop for IdleGuard<'_> {
	fn drop(&mut self) {
		let pending = std::mem::take(&mut self.pending);
		self.workspace.end_idle(pending);
	}
}
