//! [`Project`]: the unit arena plus the symbol registry, dependency graph and
//! embed table those units feed.

use std::{
	collections::VecDeque,
	path::{Path, PathBuf},
	sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use tracing::{debug, info, warn};

use crate::{
	backend::{Backends, BuildContext, Reference},
	config::{ProjectConfig, TargetKind},
	diag::{Problem, ProblemKind},
	embed::{EmbedDescription, EmbedTable},
	error::Error,
	graph::{DependencyGraph, DependencyKinds},
	names::QName,
	paths::{normalize, path_is_child_of, qname_from_relative},
	priority::DefinitionPriority,
	registry::{DefinitionRef, Registration, Resolution, SymbolRegistry},
	unit::{CompilationUnit, Definition, FileScope, Stages, UnitKind, UnitRef, UnitSource},
	workspace::{PendingUpdates, UnitHandle, Workspace},
	FxIndexSet,
};

slotmap::new_key_type! {
	/// A handle to a unit in its [project](Project)'s arena.
	pub struct UnitId;
}

/// Distinguishes projects sharing a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProjectId(pub(crate) u32);

#[derive(Debug, Clone)]
struct SourceRoot {
	path: PathBuf,
	order: u32,
}

/// How much of a unit [`Project::retract`] takes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retraction {
	/// Everything, promises included; the unit is going away.
	Remove,
	/// Every stage; promises are registered again.
	Clean,
	/// Every stage after the file scope.
	KeepScope,
}

/// Names a unit referenced without any unit providing them.
#[derive(Debug, Default)]
struct Unfound {
	by_name: FxHashMap<QName, FxIndexSet<UnitId>>,
	by_unit: FxHashMap<UnitId, Vec<QName>>,
}

impl Unfound {
	fn record(&mut self, unit: UnitId, qname: QName) {
		if self.by_name.entry(qname.clone()).or_default().insert(unit) {
			self.by_unit.entry(unit).or_default().push(qname);
		}
	}

	fn forget(&mut self, unit: UnitId) {
		let Some(names) = self.by_unit.remove(&unit) else {
			return;
		};

		for qname in names {
			if let Some(units) = self.by_name.get_mut(&qname) {
				units.shift_remove(&unit);

				if units.is_empty() {
					self.by_name.remove(&qname);
				}
			}
		}
	}
}

pub struct Project {
	id: ProjectId,
	this: Weak<Project>,
	workspace: Arc<Workspace>,
	config: ProjectConfig,
	backends: Backends,
	units: RwLock<SlotMap<UnitId, Arc<CompilationUnit>>>,
	registry: SymbolRegistry,
	graph: DependencyGraph,
	embeds: EmbedTable,
	unfound: Mutex<Unfound>,
	/// Units without promises whose definitions are not registered yet.
	pending: Mutex<FxIndexSet<UnitId>>,
	roots: RwLock<Vec<SourceRoot>>,
	libraries: RwLock<Vec<PathBuf>>,
}

impl std::fmt::Debug for Project {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Project")
			.field("id", &self.id)
			.field("units", &self.units.read().len())
			.field("names", &self.registry.len())
			.field("edges", &self.graph.edge_count())
			.finish_non_exhaustive()
	}
}

impl Project {
	#[must_use]
	pub fn new(workspace: &Arc<Workspace>, config: ProjectConfig, backends: Backends) -> Arc<Self> {
		let ret = Arc::new_cyclic(|this| Self {
			id: workspace.next_project_id(),
			this: this.clone(),
			workspace: workspace.clone(),
			config,
			backends,
			units: RwLock::new(SlotMap::with_key()),
			registry: SymbolRegistry::default(),
			graph: DependencyGraph::default(),
			embeds: EmbedTable::default(),
			unfound: Mutex::new(Unfound::default()),
			pending: Mutex::new(FxIndexSet::default()),
			roots: RwLock::new(vec![]),
			libraries: RwLock::new(vec![]),
		});

		workspace.add_project(&ret);
		ret
	}

	#[must_use]
	pub fn id(&self) -> ProjectId {
		self.id
	}

	#[must_use]
	pub(crate) fn weak(&self) -> Weak<Self> {
		self.this.clone()
	}

	#[must_use]
	pub fn workspace(&self) -> &Arc<Workspace> {
		&self.workspace
	}

	#[must_use]
	pub fn config(&self) -> &ProjectConfig {
		&self.config
	}

	#[must_use]
	pub fn backends(&self) -> &Backends {
		&self.backends
	}

	#[must_use]
	pub fn registry(&self) -> &SymbolRegistry {
		&self.registry
	}

	#[must_use]
	pub fn graph(&self) -> &DependencyGraph {
		&self.graph
	}

	// Units ///////////////////////////////////////////////////////////////////

	/// Registers `promises` at `priority` right away. A unit without promises
	/// has its definitions registered the first time anything resolves
	/// references in this project.
	pub fn create_unit(
		&self,
		source: UnitSource,
		kind: UnitKind,
		priority: DefinitionPriority,
		promises: Vec<QName>,
	) -> UnitId {
		let source = match source {
			UnitSource::File(p) => UnitSource::File(normalize(&p)),
			UnitSource::Library { container, entry } => UnitSource::Library {
				container: normalize(&container),
				entry,
			},
			other => other,
		};

		let path_ix = source
			.watched_path()
			.map(|p| self.workspace.paths().intern(p));

		let scope_from_tree = self
			.backends
			.builder(kind)
			.map_or(true, |b| b.scope_from_tree());

		let no_promises = promises.is_empty();

		let unit = {
			let mut units = self.units.write();

			let id = units.insert_with_key(|id| {
				Arc::new(CompilationUnit::new(
					id,
					source,
					path_ix,
					kind,
					priority,
					promises,
					scope_from_tree,
				))
			});

			units[id].clone()
		};

		self.graph.add_unit(unit.id());

		for qname in unit.promises() {
			self.registry
				.register(DefinitionRef::Promise(qname.clone()), unit.id(), priority);
		}

		if no_promises {
			self.pending.lock().insert(unit.id());
		}

		if let Some(ix) = path_ix {
			self.workspace.map_unit(ix, UnitHandle::new(self, unit.id()));
		}

		debug!("Created unit `{}` ({kind:?}).", unit.name());
		unit.id()
	}

	/// A source-list unit for `path`, whose kind follows its extension.
	/// Returns `None` for unrecognized extensions. Adding the same path twice
	/// returns the existing unit.
	pub fn add_source_file(&self, path: &Path) -> Option<UnitId> {
		let kind = self.backends.kind_for_path(path)?;
		let norm = normalize(path);

		if let Some(existing) = self.units_for_path(&norm).first() {
			return Some(*existing);
		}

		Some(self.create_unit(
			UnitSource::File(norm),
			kind,
			DefinitionPriority::source_list(),
			vec![],
		))
	}

	/// Walks `root`, creating a unit for every recognized file that promises
	/// the name spelled by its relative path. Earlier roots take precedence.
	pub fn add_source_path(&self, root: &Path) -> Result<Vec<UnitId>, Error> {
		let root = normalize(root);

		let order = {
			let mut roots = self.roots.write();
			let order = roots.len() as u32;

			roots.push(SourceRoot {
				path: root.clone(),
				order,
			});

			order
		};

		let mut ret = vec![];

		let walker = walkdir::WalkDir::new(&root)
			.follow_links(true)
			.sort_by_file_name()
			.into_iter();

		for result in walker {
			let dir_entry = result?;

			if !dir_entry.file_type().is_file() {
				continue;
			}

			if let Some(id) = self.source_path_unit(&root, order, dir_entry.path()) {
				ret.push(id);
			}
		}

		info!(
			"Found {} source(s) under `{}`.",
			ret.len(),
			root.display()
		);

		Ok(ret)
	}

	fn source_path_unit(&self, root: &Path, order: u32, path: &Path) -> Option<UnitId> {
		let kind = self.backends.kind_for_path(path)?;
		let qname = qname_from_relative(root, path)?;

		Some(self.create_unit(
			UnitSource::File(path.to_path_buf()),
			kind,
			DefinitionPriority::source_path(order),
			vec![qname],
		))
	}

	/// Creates a unit for every entry the library cache holds for
	/// `container`. Earlier containers take precedence.
	pub fn add_library(&self, container: &Path) -> Vec<UnitId> {
		let container = normalize(container);

		let order = {
			let mut libs = self.libraries.write();
			libs.push(container.clone());
			(libs.len() - 1) as u32
		};

		let entries = self.workspace.library_cache().entries_of(&container);

		if entries.is_empty() {
			warn!("No cached entries for library `{}`.", container.display());
		}

		entries
			.into_iter()
			.map(|(entry, cached)| {
				self.create_unit(
					UnitSource::Library {
						container: container.clone(),
						entry,
					},
					UnitKind::LibraryScript,
					DefinitionPriority::library(order, cached.timestamp),
					cached.qnames.iter().map(|q| QName::new(q)).collect(),
				)
			})
			.collect()
	}

	/// Everything the configuration names. Returns the source-list units,
	/// which are the roots of a build.
	pub fn load_configured(&self) -> Result<Vec<UnitId>, Error> {
		let mut roots = vec![];

		for path in &self.config.sources {
			match self.add_source_file(path) {
				Some(id) => roots.push(id),
				None => warn!("Unrecognized source kind: `{}`", path.display()),
			}
		}

		for root in &self.config.source_paths {
			self.add_source_path(root)?;
		}

		for container in &self.config.libraries {
			self.add_library(container);
		}

		Ok(roots)
	}

	/// A new file appeared; if it falls under a source root, it gets a unit.
	pub(crate) fn handle_added_file(&self, path: &Path) -> Option<UnitId> {
		if !self.units_for_path(path).is_empty() {
			return None;
		}

		let roots = self.roots.read().clone();

		roots
			.iter()
			.find(|root| path_is_child_of(path, &root.path))
			.and_then(|root| self.source_path_unit(&root.path, root.order, path))
	}

	#[must_use]
	pub fn unit(&self, id: UnitId) -> Option<UnitRef<'_>> {
		self.unit_arc(id).map(|unit| UnitRef {
			project: self,
			unit,
		})
	}

	#[must_use]
	pub(crate) fn unit_arc(&self, id: UnitId) -> Option<Arc<CompilationUnit>> {
		self.units.read().get(id).cloned()
	}

	/// Every unit, ordered by name.
	#[must_use]
	pub fn units(&self) -> Vec<UnitId> {
		let units = self.units.read();
		let mut ret: Vec<_> = units.keys().collect();
		ret.sort_by(|a, b| units[*a].name().cmp(units[*b].name()).then(a.cmp(b)));
		ret
	}

	#[must_use]
	pub fn unit_name(&self, id: UnitId) -> String {
		self.units
			.read()
			.get(id)
			.map_or_else(|| "<removed>".to_string(), |u| u.name().to_string())
	}

	/// Units whose root source, or library container, is `path`.
	#[must_use]
	pub fn units_for_path(&self, path: &Path) -> Vec<UnitId> {
		let Some(ix) = self.workspace.paths().get(path) else {
			return vec![];
		};

		self.units
			.read()
			.iter()
			.filter(|(_, u)| u.path_ix == Some(ix))
			.map(|(id, _)| id)
			.collect()
	}

	/// Cleans the unit, then forgets it entirely.
	pub fn remove_unit(&self, id: UnitId) {
		let Some(unit) = self.unit_arc(id) else {
			return;
		};

		self.retract(&unit, Retraction::Remove);
		self.graph.remove_unit(id);
		self.embeds.forget(id);
		self.pending.lock().shift_remove(&id);

		if let Some(ix) = unit.path_ix {
			self.workspace.unmap_unit(ix, self.id, id);
		}

		self.units.write().remove(id);
		info!("Removed unit `{}`.", unit.name());
	}

	/// Without `clear_file_scope`, the unit keeps its syntax tree and file
	/// scope, and with them its registered definitions and included files.
	pub(crate) fn clean_unit(&self, unit: &CompilationUnit, clear_file_scope: bool) {
		if clear_file_scope {
			self.retract(unit, Retraction::Clean);
		} else {
			self.retract(unit, Retraction::KeepScope);
		}

		debug!("Cleaned `{}`.", unit.name());
	}

	/// Resets the unit's stages, and takes back what they contributed: the
	/// outgoing edges, unresolved names and embeds of the dependency stage,
	/// and unless the scope is kept, definitions and included files.
	fn retract(&self, unit: &CompilationUnit, how: Retraction) {
		let _guard = unit.reset(how != Retraction::KeepScope);

		if how != Retraction::KeepScope {
			if !unit.is_invisible() {
				self.registry.remove_unit(unit.id());

				if how == Retraction::Clean {
					for qname in unit.promises() {
						self.registry.register(
							DefinitionRef::Promise(qname.clone()),
							unit.id(),
							unit.priority(),
						);
					}
				}
			}

			self.workspace.forget_included(self.id, unit);

			if how == Retraction::Clean && unit.promises().is_empty() {
				self.pending.lock().insert(unit.id());
			}
		}

		self.graph.remove_edges_from(unit.id());
		self.unfound.lock().forget(unit.id());
		self.update_embeds(unit, vec![]);
	}

	/// Cleans `roots` fully, and everything else that must be rebuilt with
	/// them short of its file scope: the [dependents](DependencyGraph::invalidation_set)
	/// of the roots, and units that failed to find a name the roots define.
	/// Roots whose definitions must be re-registered are added to `pending`.
	pub fn invalidate(&self, roots: &[UnitId], pending: &mut PendingUpdates) -> usize {
		let mut names = vec![];

		for id in roots {
			if let Some(unit) = self.unit_arc(*id) {
				names.extend(unit.promises().iter().cloned());
			}

			names.extend(self.registry.names_of(*id));
		}

		let mut set = self.graph.invalidation_set(roots);
		set.extend(self.units_depending_on_missing(&names));

		for id in &set {
			let Some(unit) = self.unit_arc(*id) else {
				continue;
			};

			let root = roots.contains(id);
			self.clean_unit(&unit, root);

			if root && unit.promises().is_empty() && !unit.is_invisible() {
				pending.push(self.weak(), *id);
			}
		}

		info!("Invalidated {} unit(s).", set.len());
		set.len()
	}

	/// Builds the dependencies of everything reachable from `roots`, then
	/// orders it all so that each unit follows what it depends on.
	pub fn reachable_units_in_order(&self, roots: &[UnitId]) -> Vec<UnitId> {
		let mut seen = FxIndexSet::default();
		let mut queue: VecDeque<UnitId> = roots.iter().copied().collect();

		while let Some(id) = queue.pop_front() {
			if !seen.insert(id) {
				continue;
			}

			let Some(unit) = self.unit(id) else {
				continue;
			};

			let _ = unit.dependencies();
			queue.extend(self.graph.direct_dependencies(id));
		}

		let subset: Vec<UnitId> = seen.into_iter().collect();
		let order = self.graph.stable_topo_order(&subset, |id| self.unit_name(id));

		for cycle in &order.cycles {
			let names: Vec<_> = cycle.iter().map(|id| self.unit_name(*id)).collect();
			warn!("Dependency cycle: {}", names.join(" -> "));
		}

		order.units
	}

	/// Starts every stage `target` needs on every unit, without waiting.
	pub fn start_build_all(&self, target: TargetKind) {
		for id in self.units() {
			if let Some(unit) = self.unit(id) {
				unit.start_build_async(target);
			}
		}
	}

	// Names ///////////////////////////////////////////////////////////////////

	#[must_use]
	pub fn resolve(&self, qname: &str) -> Option<Resolution> {
		self.registry.resolve(qname)
	}

	/// Like [`Project::resolve`], but satisfies a promise by running its
	/// owner's file-scope stage.
	pub fn resolve_definition(&self, qname: &str) -> Option<Arc<Definition>> {
		let res = self.registry.resolve(qname)?;

		if let DefinitionRef::Actual(def) = res.definition {
			return Some(def);
		}

		let _ = self.unit(res.unit)?.file_scope();

		match self.registry.resolve(qname)?.definition {
			DefinitionRef::Actual(def) => Some(def),
			DefinitionRef::Promise(_) => None,
		}
	}

	/// Runs the file-scope stage of every unit still waiting to register its
	/// definitions. A unit leaves the pending set before its stage runs, so a
	/// clean racing with the stage puts it back.
	pub fn ensure_definitions(&self) {
		let pending: Vec<UnitId> = self.pending.lock().iter().copied().collect();

		for id in pending {
			if !self.pending.lock().shift_remove(&id) {
				continue;
			}

			let Some(unit) = self.unit(id) else {
				continue;
			};

			let _ = unit.file_scope();

			if !unit.completed().contains(Stages::FILE_SCOPE) {
				// Interrupted, or cleaned since.
				self.pending.lock().insert(id);
			}
		}
	}

	/// Registers the definitions of a unit cleaned under the idle bracket,
	/// then cleans, short of their file scopes, the units that failed to find
	/// any of those names.
	pub(crate) fn reregister(&self, id: UnitId) {
		let Some(unit) = self.unit(id) else {
			return;
		};

		let _ = unit.file_scope();
		let names = self.registry.names_of(id);

		for stale in self.units_depending_on_missing(&names) {
			if let Some(unit) = self.unit_arc(stale) {
				self.clean_unit(&unit, false);
			}
		}
	}

	/// Units that referenced any of `names` back when nothing provided them.
	#[must_use]
	pub fn units_depending_on_missing(&self, names: &[QName]) -> Vec<UnitId> {
		let unfound = self.unfound.lock();
		let mut ret = FxIndexSet::default();

		for qname in names {
			if let Some(units) = unfound.by_name.get(qname) {
				ret.extend(units.iter().copied());
			}
		}

		ret.into_iter().collect()
	}

	pub(crate) fn register_scopes(&self, cx: &BuildContext, scopes: &[FileScope]) {
		let unit = cx.unit();

		for def in scopes.iter().flat_map(|s| s.definitions.iter()) {
			let reg = self.registry.register(
				DefinitionRef::Actual(def.clone()),
				unit.id(),
				unit.priority(),
			);

			match reg {
				Registration::Collision { with } => {
					let mut problem = Problem::error(
						ProblemKind::Collision,
						format!(
							"`{}` is also defined by `{}`",
							def.qname,
							self.unit_name(with)
						),
					);

					problem.line = def.line;
					cx.raise(problem);
				}
				Registration::Visible {
					superseded: Some(prev),
				} => {
					debug!(
						"`{}` from `{}` shadows `{}`.",
						def.qname,
						unit.name(),
						self.unit_name(prev)
					);
				}
				Registration::Visible { superseded: None } | Registration::Shadowed { .. } => {}
			}
		}
	}

	pub(crate) fn resolve_references(&self, cx: &BuildContext, refs: &[Reference]) {
		let unit = cx.unit();

		for reference in refs {
			if reference.qname.is_wildcard() {
				continue;
			}

			match self.registry.owner_of(reference.qname.as_str()) {
				Some(owner) => {
					self.graph.add_edge(
						unit.id(),
						owner,
						reference.kind,
						Some(reference.qname.clone()),
					);
				}
				None => {
					self.unfound
						.lock()
						.record(unit.id(), reference.qname.clone());

					let mut problem = Problem::error(
						ProblemKind::Unresolved,
						format!("no definition found for `{}`", reference.qname),
					);

					problem.line = reference.line;
					cx.raise(problem);
				}
			}
		}
	}

	/// Kicks off the providers of `imports` on the pool.
	pub(crate) fn start_import_providers(&self, unit: &CompilationUnit, imports: &[QName]) {
		for import in imports.iter().filter(|q| !q.is_wildcard()) {
			let Some(owner) = self.registry.owner_of(import.as_str()) else {
				continue;
			};

			if owner == unit.id() {
				continue;
			}

			if let Some(provider) = self.unit(owner) {
				provider.start_build_async(TargetKind::Binary);
			}
		}
	}

	pub(crate) fn note_included(&self, unit: &CompilationUnit, included: &[PathBuf]) {
		if included.is_empty() {
			return;
		}

		let handle = UnitHandle::new(self, unit.id());
		self.workspace.record_included(handle, unit, included);
	}

	// Embeds //////////////////////////////////////////////////////////////////

	#[must_use]
	pub(crate) fn embed_description(&self, id: UnitId) -> Option<EmbedDescription> {
		self.embeds.description(id)
	}

	/// Units referencing the embedded unit `embed`.
	#[must_use]
	pub fn embed_referrers(&self, embed: UnitId) -> Vec<UnitId> {
		self.embeds.referrers(embed)
	}

	/// Makes `descs` the embeds of `unit`, creating synthetic units for new
	/// descriptions and removing old ones nothing else references.
	pub(crate) fn update_embeds(&self, unit: &CompilationUnit, descs: Vec<EmbedDescription>) {
		let mut next = FxIndexSet::default();

		for desc in &descs {
			let id = self.embeds.acquire(desc, unit.id(), || {
				self.create_unit(
					UnitSource::Synthetic(desc.canonical_key()),
					desc.unit_kind(),
					DefinitionPriority::source_list(),
					vec![desc.qname()],
				)
			});

			self.graph.add_edge(
				unit.id(),
				id,
				DependencyKinds::EXPRESSION,
				Some(desc.qname()),
			);

			next.insert(id);
		}

		let prev = std::mem::replace(&mut *unit.embeds.lock(), next.clone());

		for id in prev.iter().filter(|id| !next.contains(*id)) {
			if self.embeds.release(*id, unit.id()) {
				self.remove_unit(*id);
			}
		}
	}
}
