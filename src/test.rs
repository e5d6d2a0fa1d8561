use std::{
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Barrier,
	},
	time::Duration,
};

use indoc::indoc;
use tracing::level_filters::LevelFilter;

use crate::{
	backend::{
		plain::PlainPackager, Backends, BuildContext, Discovered, GeneratedCode, Packager,
		ParsedSource, SourceFile, UnitBuilder,
	},
	cache::CachedEntry,
	config::{ProjectConfig, TargetKind, WorkspaceConfig},
	diag::ProblemKind,
	embed::EmbedDescription,
	error::StageError,
	graph::DependencyKinds,
	registry::DefinitionRef,
	setup,
	unit::{
		CodeBytesResult, FileScope, OutputTag, StageOutput, Stages, SyntaxTree, UnitKind,
	},
	Project, UnitId, Workspace,
};

// Fixtures ////////////////////////////////////////////////////////////////////

fn workspace() -> Arc<Workspace> {
	setup::logging(LevelFilter::INFO);

	Workspace::new(WorkspaceConfig {
		threads: 4,
		wait_timeout_ms: 20_000,
	})
	.unwrap()
}

fn write(dir: &Path, rel: &str, text: &str) -> PathBuf {
	let path = dir.join(rel);
	std::fs::create_dir_all(path.parent().unwrap()).unwrap();
	std::fs::write(&path, text).unwrap();
	crate::paths::normalize(&path)
}

#[derive(Debug, Default)]
struct Counts {
	parse: AtomicUsize,
	scopes: AtomicUsize,
	generate: AtomicUsize,
	discover: AtomicUsize,
	package: AtomicUsize,
}

impl Counts {
	fn get(&self) -> [usize; 5] {
		[
			self.parse.load(Ordering::SeqCst),
			self.scopes.load(Ordering::SeqCst),
			self.generate.load(Ordering::SeqCst),
			self.discover.load(Ordering::SeqCst),
			self.package.load(Ordering::SeqCst),
		]
	}
}

/// Runs before the wrapped builder does, letting a handler reach outside its
/// own unit.
type Hook = Box<dyn Fn(&BuildContext) + Send + Sync>;

fn hook(f: impl Fn(&BuildContext) + Send + Sync + 'static) -> Option<Hook> {
	Some(Box::new(f))
}

/// Delegates to another builder, counting calls. Optionally panics when
/// generating code for a file with the given name.
struct Counting {
	inner: Arc<dyn UnitBuilder>,
	counts: Arc<Counts>,
	panic_on: Option<&'static str>,
	on_parse: Option<Hook>,
	on_scopes: Option<Hook>,
}

impl UnitBuilder for Counting {
	fn scope_from_tree(&self) -> bool {
		self.inner.scope_from_tree()
	}

	fn deps_during_codegen(&self) -> bool {
		self.inner.deps_during_codegen()
	}

	fn parse(
		&self,
		cx: &BuildContext,
		source: Option<&SourceFile>,
	) -> Result<ParsedSource, StageError> {
		self.counts.parse.fetch_add(1, Ordering::SeqCst);

		if let Some(hook) = &self.on_parse {
			hook(cx);
		}

		self.inner.parse(cx, source)
	}

	fn build_scopes(
		&self,
		cx: &BuildContext,
		tree: Option<&SyntaxTree>,
	) -> Result<Vec<FileScope>, StageError> {
		self.counts.scopes.fetch_add(1, Ordering::SeqCst);

		if let Some(hook) = &self.on_scopes {
			hook(cx);
		}

		self.inner.build_scopes(cx, tree)
	}

	fn generate(
		&self,
		cx: &BuildContext,
		tree: Option<&SyntaxTree>,
	) -> Result<GeneratedCode, StageError> {
		self.counts.generate.fetch_add(1, Ordering::SeqCst);

		if let Some(name) = self.panic_on {
			if cx.unit().path().is_some_and(|p| p.ends_with(name)) {
				panic!("code generator exploded on `{name}`");
			}
		}

		self.inner.generate(cx, tree)
	}

	fn discover(
		&self,
		cx: &BuildContext,
		tree: Option<&SyntaxTree>,
		code: Option<&CodeBytesResult>,
	) -> Result<Discovered, StageError> {
		self.counts.discover.fetch_add(1, Ordering::SeqCst);
		self.inner.discover(cx, tree, code)
	}
}

struct CountingPackager(Arc<Counts>);

impl Packager for CountingPackager {
	fn package(
		&self,
		cx: &BuildContext,
		code: &CodeBytesResult,
		assets: Vec<OutputTag>,
	) -> Result<OutputTag, StageError> {
		self.0.package.fetch_add(1, Ordering::SeqCst);
		PlainPackager.package(cx, code, assets)
	}
}

/// The plain backends, with script building counted.
fn counted(counts: &Arc<Counts>, panic_on: Option<&'static str>) -> Backends {
	hooked(counts, panic_on, None, None)
}

fn hooked(
	counts: &Arc<Counts>,
	panic_on: Option<&'static str>,
	on_parse: Option<Hook>,
	on_scopes: Option<Hook>,
) -> Backends {
	let plain = Backends::plain();
	let inner = plain.builder(UnitKind::Script).unwrap().clone();

	plain
		.with_builder(
			UnitKind::Script,
			Counting {
				inner,
				counts: counts.clone(),
				panic_on,
				on_parse,
				on_scopes,
			},
		)
		.with_packager(CountingPackager(counts.clone()))
}

// Tests ///////////////////////////////////////////////////////////////////////

/// `a.src` defines `pkg.A` from the source list; a cached library entry
/// defines it too, at lower priority.
#[test]
fn end_to_end() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let counts = Arc::new(Counts::default());

	let a_path = write(
		dir.path(),
		"a.src",
		indoc! {"
			package pkg
			class A
			function make(): A
		"},
	);

	let lib_path = crate::paths::normalize(&dir.path().join("lib.bin"));

	ws.library_cache().insert(
		&lib_path,
		"A",
		CachedEntry {
			timestamp: 1,
			qnames: vec!["pkg.A".to_string()],
			bytes: b"def class pkg.A\n".to_vec(),
		},
	);

	let project = Project::new(&ws, ProjectConfig::default(), counted(&counts, None));
	let libs = project.add_library(&lib_path);
	let a = project.add_source_file(&a_path).unwrap();
	assert_eq!(libs.len(), 1);

	// Before anything is built, only the library's promise is known.
	assert_eq!(project.resolve("pkg.A").unwrap().unit, libs[0]);

	project.ensure_definitions();
	let res = project.resolve("pkg.A").unwrap();
	assert_eq!(res.unit, a);
	assert!(matches!(res.definition, DefinitionRef::Actual(_)));
	assert_eq!(project.registry().candidates("pkg.A"), [a, libs[0]]);

	let unit = project.unit(a).unwrap();
	let tag = unit.output_tag();
	let deps = unit.dependencies();
	assert!(deps.problems().is_empty());

	let tag = tag.tag.as_ref().unwrap();
	assert_eq!(tag.name, a_path.display().to_string());
	assert!(String::from_utf8_lossy(&tag.bytes).contains("def class pkg.A"));

	assert_eq!(counts.get(), [1, 1, 1, 1, 1]);
	assert_eq!(unit.completed(), Stages::all());

	// The library unit was never needed.
	assert!(project.unit(libs[0]).unwrap().completed().is_empty());
}

#[test]
fn memoized_under_contention() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let counts = Arc::new(Counts::default());

	let path = write(
		dir.path(),
		"hot.src",
		indoc! {"
			package hot
			class Spot
			var heat: int
		"},
	);

	let project = Project::new(&ws, ProjectConfig::default(), counted(&counts, None));
	let id = project.add_source_file(&path).unwrap();
	project.start_build_all(TargetKind::Package);

	let results: Vec<_> = std::thread::scope(|scope| {
		let handles: Vec<_> = (0..8)
			.map(|i| {
				let project = &project;

				scope.spawn(move || {
					let unit = project.unit(id).unwrap();

					if i % 2 == 0 {
						assert!(unit.output_tag().tag.is_some());
					}

					(unit.file_scope(), unit.dependencies())
				})
			})
			.collect();

		handles.into_iter().map(|h| h.join().unwrap()).collect()
	});

	// Every caller got the same result objects.
	for (scope, deps) in &results {
		assert!(scope.problems().is_empty());
		assert!(deps.problems().is_empty());
		assert!(Arc::ptr_eq(scope, &results[0].0));
		assert!(Arc::ptr_eq(deps, &results[0].1));
	}

	assert!(Arc::ptr_eq(
		&project.unit(id).unwrap().file_scope(),
		&results[0].0
	));

	let unit = project.unit(id).unwrap();
	let mut problems = vec![];
	unit.wait_for_build_finish(&mut problems, Some(TargetKind::Package));
	assert!(problems.is_empty());
	assert_eq!(counts.get(), [1, 1, 1, 1, 1]);
}

#[test]
fn clean_is_idempotent() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let counts = Arc::new(Counts::default());
	let path = write(dir.path(), "c.src", "package c\nclass C\n");

	let project = Project::new(&ws, ProjectConfig::default(), counted(&counts, None));
	let id = project.add_source_file(&path).unwrap();
	let unit = project.unit(id).unwrap();

	let _ = unit.dependencies();
	assert!(project.resolve("c.C").is_some());

	unit.clean();
	unit.clean();

	assert!(unit.completed().is_empty());
	assert!(project.resolve("c.C").is_none());
	assert!(project.registry().names_of(id).is_empty());

	// Builds again from scratch, once.
	let _ = unit.file_scope();
	let _ = unit.file_scope();
	assert_eq!(counts.parse.load(Ordering::SeqCst), 2);
	assert!(project.resolve("c.C").is_some());
}

#[test]
fn priority_and_fallback() {
	for list_first in [true, false] {
		let dir = tempfile::tempdir().unwrap();
		let ws = workspace();
		let root = dir.path().join("root");
		let path_file = write(&root, "pkg/B.src", "package pkg\nclass B\n");
		let list_file = write(dir.path(), "b.src", "package pkg\nclass B\n");

		let project = Project::new(&ws, ProjectConfig::default(), Backends::plain());

		let (listed, found) = if list_first {
			let listed = project.add_source_file(&list_file).unwrap();
			let found = project.add_source_path(&root).unwrap();
			(listed, found)
		} else {
			let found = project.add_source_path(&root).unwrap();
			let listed = project.add_source_file(&list_file).unwrap();
			(listed, found)
		};

		assert_eq!(found.len(), 1);
		assert_eq!(project.unit(found[0]).unwrap().promises()[0].as_str(), "pkg.B");
		assert_eq!(project.unit(found[0]).unwrap().path(), Some(path_file.as_path()));

		project.ensure_definitions();
		assert_eq!(project.resolve("pkg.B").unwrap().unit, listed);

		project.unit(listed).unwrap().clean();
		assert_eq!(project.resolve("pkg.B").unwrap().unit, found[0]);

		let def = project.resolve_definition("pkg.B").unwrap();
		assert_eq!(def.qname.as_str(), "pkg.B");
		assert_eq!(project.resolve("pkg.B").unwrap().unit, found[0]);
		assert_eq!(list_file, project.unit(listed).unwrap().path().unwrap());
	}
}

#[test]
fn equal_priority_collides() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let first = write(dir.path(), "one.src", "package dup\nclass Twice\n");
	let second = write(dir.path(), "two.src", "package dup\nclass Twice\n");

	let project = Project::new(&ws, ProjectConfig::default(), Backends::plain());
	let one = project.add_source_file(&first).unwrap();
	let two = project.add_source_file(&second).unwrap();

	let _ = project.unit(one).unwrap().file_scope();
	let scope = project.unit(two).unwrap().file_scope();

	assert_eq!(project.resolve("dup.Twice").unwrap().unit, one);
	assert_eq!(scope.problems().len(), 1);
	assert_eq!(scope.problems()[0].kind, ProblemKind::Collision);
	assert_eq!(scope.problems()[0].line, Some(2));
}

#[test]
fn deterministic_order() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().join("root");

	let main = write(
		dir.path(),
		"main.src",
		indoc! {"
			package app
			import lib.*
			class Main extends Base
			uses Helper
		"},
	);

	write(&root, "lib/Base.src", "package lib\nclass Base\n");
	write(&root, "lib/Helper.src", "package lib\nclass Helper extends Base\n");
	write(&root, "lib/Unused.src", "package lib\nclass Unused\n");

	let mut runs = vec![];

	for threads in [1, 4] {
		let ws = Workspace::new(WorkspaceConfig {
			threads,
			..Default::default()
		})
		.unwrap();

		let project = Project::new(&ws, ProjectConfig::default(), Backends::plain());
		project.add_source_path(&root).unwrap();
		let main = project.add_source_file(&main).unwrap();
		project.unit(main).unwrap().start_build_async(TargetKind::Binary);

		let order: Vec<String> = project
			.reachable_units_in_order(&[main])
			.into_iter()
			.map(|id| project.unit_name(id))
			.collect();

		let base = project.resolve("lib.Base").unwrap().unit;
		let edge = project.graph().edge(main, base).unwrap();
		assert_eq!(edge.kinds, DependencyKinds::INHERITANCE);

		runs.push(order);
	}

	let main_name = main.display().to_string();
	assert_eq!(runs[0], ["lib.Base", "lib.Helper", main_name.as_str()]);
	assert_eq!(runs[0], runs[1]);
}

#[test]
fn faults_are_isolated() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let counts = Arc::new(Counts::default());
	let boom = write(dir.path(), "boom.src", "package x\nclass Boom\n");
	let fine = write(dir.path(), "fine.src", "package x\nclass Fine\n");

	let project = Project::new(&ws, ProjectConfig::default(), counted(&counts, Some("boom.src")));
	let boom = project.add_source_file(&boom).unwrap();
	let fine = project.add_source_file(&fine).unwrap();

	project.start_build_all(TargetKind::Package);

	let (code, fine_tag) = std::thread::scope(|scope| {
		let code = scope.spawn(|| project.unit(boom).unwrap().code_bytes());
		let tag = scope.spawn(|| project.unit(fine).unwrap().output_tag());
		(code.join().unwrap(), tag.join().unwrap())
	});

	assert_eq!(code.problems().len(), 1);
	assert_eq!(code.problems()[0].kind, ProblemKind::InternalFault);
	assert!(code.problems()[0].message.contains("exploded"));

	// The healthy unit built beside it, untouched.
	assert!(fine_tag.problems().is_empty());
	assert!(fine_tag.tag.is_some());

	let fine = project.unit(fine).unwrap();
	assert!(fine.code_bytes().problems().is_empty());
	assert!(fine.completed().contains(Stages::CODE_BYTES | Stages::OUTPUT_TAG));

	// Cached like any other result.
	let boom = project.unit(boom).unwrap();
	assert!(Arc::ptr_eq(&boom.code_bytes(), &code));
	assert_eq!(counts.generate.load(Ordering::SeqCst), 2);
	assert!(boom.completed().contains(Stages::CODE_BYTES));

	// Dependency-only builds drop the fault.
	let mut problems = vec![];
	boom.wait_for_build_finish(&mut problems, None);
	assert!(problems.is_empty());

	let mut problems = vec![];
	boom.wait_for_build_finish(&mut problems, Some(TargetKind::Binary));
	assert_eq!(problems.len(), 1);
}

#[test]
fn invalidation_cascade() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let counts = Arc::new(Counts::default());
	write(dir.path(), "e.png", "E");
	write(dir.path(), "f.png", "F");

	let x_path = write(
		dir.path(),
		"x.src",
		indoc! {r#"
			package p
			class X
			uses Y
			embed "e.png"
			embed "f.png"
		"#},
	);

	let y_path = write(dir.path(), "y.src", "package p\nclass Y\nembed \"f.png\"\n");
	let z_path = write(dir.path(), "z.src", "package p\nclass Z extends X\n");

	let project = Project::new(&ws, ProjectConfig::default(), counted(&counts, None));
	let x = project.add_source_file(&x_path).unwrap();
	let y = project.add_source_file(&y_path).unwrap();
	let z = project.add_source_file(&z_path).unwrap();

	for id in [x, y, z] {
		let deps = project.unit(id).unwrap().dependencies();
		assert!(deps.problems().is_empty(), "{:?}", deps.problems());
	}

	assert_eq!(counts.parse.load(Ordering::SeqCst), 3);

	let e_name = EmbedDescription::asset(dir.path().join("e.png")).qname();
	let f_name = EmbedDescription::asset(dir.path().join("f.png")).qname();
	let e = project.resolve(e_name.as_str()).unwrap().unit;
	let f = project.resolve(f_name.as_str()).unwrap().unit;
	assert_eq!(project.unit(x).unwrap().embedded_units(), [e, f]);
	assert_eq!(project.embed_referrers(f), [x, y]);
	assert!(project.graph().edge(x, y).is_some());
	assert!(project.graph().edge(z, x).is_some());

	// Packaging nests the embedded assets.
	let tag = project.unit(x).unwrap().output_tag();
	let assets = &tag.tag.as_ref().unwrap().assets;
	assert_eq!(assets.len(), 2);
	assert_eq!(&*assets[0].bytes, b"E");

	let cleaned = ws.set_overlay(&x_path, "package p\nclass X\nuses Y\nembed \"f.png\"\n");
	assert_eq!(cleaned, 2);

	// The dependent keeps its tree and scope, and only those.
	let z_unit = project.unit(z).unwrap();
	assert!(!z_unit.completed().contains(Stages::DEPENDENCIES));
	assert!(z_unit.completed().contains(Stages::FILE_SCOPE));
	assert_eq!(project.resolve("p.Z").unwrap().unit, z);
	assert!(project.graph().edge(z, x).is_none());
	assert!(project.unit(y).unwrap().completed().contains(Stages::DEPENDENCIES));

	// The changed unit lost its outgoing edges, and its embed nothing else uses.
	assert!(project.graph().edge(x, y).is_none());
	assert!(project.unit(e).is_none());
	assert!(project.resolve(e_name.as_str()).is_none());
	assert_eq!(project.embed_referrers(f), [y]);

	// Only the changed unit was parsed again, when the idle state ended.
	assert_eq!(counts.parse.load(Ordering::SeqCst), 4);
	assert_eq!(project.resolve("p.X").unwrap().unit, x);

	let _ = project.unit(x).unwrap().dependencies();
	assert_eq!(project.unit(x).unwrap().embedded_units(), [f]);
	assert_eq!(project.embed_referrers(f), [y, x]);
	assert!(project.graph().edge(x, y).is_some());
	assert!(project.unit(e).is_none());

	assert!(z_unit.dependencies().problems().is_empty());
	assert_eq!(
		project.graph().edge(z, x).unwrap().kinds,
		DependencyKinds::INHERITANCE
	);
	assert_eq!(counts.parse.load(Ordering::SeqCst), 4);
}

#[test]
fn shared_embeds_survive_concurrent_cleans() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	write(dir.path(), "f.png", "F");
	let x_path = write(dir.path(), "x.src", "package s\nclass X\nembed \"f.png\"\n");
	let y_path = write(dir.path(), "y.src", "package s\nclass Y\nembed \"f.png\"\n");

	let project = Project::new(&ws, ProjectConfig::default(), Backends::plain());
	let x = project.add_source_file(&x_path).unwrap();
	let y = project.add_source_file(&y_path).unwrap();

	for _ in 0..300 {
		let _ = project.unit(x).unwrap().dependencies();
		project.unit(y).unwrap().clean();

		std::thread::scope(|scope| {
			scope.spawn(|| {
				let _ = project.unit(y).unwrap().dependencies();
			});

			scope.spawn(|| project.unit(x).unwrap().clean());
		});

		let y_unit = project.unit(y).unwrap();
		let embeds = y_unit.embedded_units();
		assert_eq!(embeds.len(), 1);
		assert!(project.unit(embeds[0]).is_some());
		assert_eq!(project.embed_referrers(embeds[0]), [y]);

		let tag = y_unit.output_tag();
		assert_eq!(tag.tag.as_ref().unwrap().assets.len(), 1);
	}
}

#[test]
fn included_files_invalidate() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let inc = write(dir.path(), "common.inc", "class Shared\n");
	let main = write(dir.path(), "main.src", "package m\ninclude \"common.inc\"\n");

	let project = Project::new(&ws, ProjectConfig::default(), Backends::plain());
	let id = project.add_source_file(&main).unwrap();
	let tree = project.unit(id).unwrap().syntax_tree();
	assert_eq!(tree.included, [inc.clone()]);

	project.ensure_definitions();
	assert!(project.resolve("m.Shared").is_some());

	assert_eq!(ws.set_overlay(&inc, "class Renamed\n"), 1);
	assert!(project.resolve("m.Shared").is_none());
	assert!(project.resolve("m.Renamed").is_some());

	// Back to what is on disk.
	assert_eq!(ws.clear_overlay(&inc), 1);
	assert!(project.resolve("m.Shared").is_some());
	assert!(project.resolve("m.Renamed").is_none());
	assert_eq!(ws.clear_overlay(&inc), 0);
}

#[test]
fn added_file_satisfies_missing_name() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let root = dir.path().join("root");
	write(&root, "p/A.src", "package p\nclass A\nuses B\n");

	let project = Project::new(&ws, ProjectConfig::default(), Backends::plain());
	let found = project.add_source_path(&root).unwrap();
	let a: UnitId = found[0];

	let deps = project.unit(a).unwrap().dependencies();
	assert_eq!(deps.problems().len(), 1);
	assert_eq!(deps.problems()[0].kind, ProblemKind::Unresolved);
	assert_eq!(deps.problems()[0].line, Some(3));

	let b_path = write(&root, "p/B.src", "package p\nclass B\n");
	let added = ws.file_added(&b_path);
	assert_eq!(added.len(), 1);
	let b = added[0].1;

	assert!(project.unit(a).unwrap().completed().is_empty());
	assert!(project.unit(a).unwrap().dependencies().problems().is_empty());
	assert!(project.graph().edge(a, b).is_some());

	ws.file_removed(&b_path);
	assert!(project.unit(b).is_none());
	assert!(project.resolve("p.B").is_none());

	let a = project.unit(a).unwrap();
	assert!(!a.completed().contains(Stages::DEPENDENCIES));
	assert!(a.completed().contains(Stages::FILE_SCOPE));
	assert_eq!(a.dependencies().problems()[0].kind, ProblemKind::Unresolved);
}

#[test]
fn missing_names_invalidate() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let a_path = write(dir.path(), "a.src", "package p\nclass A\nuses B\n");
	let d_path = write(dir.path(), "d.src", "package p\nclass D\nuses E\n");

	let project = Project::new(&ws, ProjectConfig::default(), Backends::plain());
	let a = project.add_source_file(&a_path).unwrap();
	let d = project.add_source_file(&d_path).unwrap();

	for id in [a, d] {
		let deps = project.unit(id).unwrap().dependencies();
		assert_eq!(deps.problems()[0].kind, ProblemKind::Unresolved);
	}

	// Registered without invalidating anything.
	let b_path = write(dir.path(), "b.src", "package p\nclass B\n");
	let b = project.add_source_file(&b_path).unwrap();
	project.ensure_definitions();
	assert_eq!(project.resolve("p.B").unwrap().unit, b);
	assert!(project.unit(a).unwrap().completed().contains(Stages::DEPENDENCIES));

	// `a` failed to find a name `b` defined; `d` fails to find one `b` now
	// defines.
	assert_eq!(ws.set_overlay(&b_path, "package p\nclass B\nclass E\n"), 2);

	for id in [a, d] {
		let unit = project.unit(id).unwrap();
		assert!(!unit.completed().contains(Stages::DEPENDENCIES));
		assert!(unit.completed().contains(Stages::FILE_SCOPE));
		assert!(unit.dependencies().problems().is_empty());
		assert!(project.graph().edge(id, b).is_some());
	}
}

#[test]
fn cleaned_pending_unit_stays_pending() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let counts = Arc::new(Counts::default());
	let v_path = write(dir.path(), "v.src", "package q\nclass V\n");
	let u_path = write(dir.path(), "u.src", "package q\nclass U\n");

	// Building `u`'s scope cleans `v`, whose scope was built just before.
	let target = v_path.clone();

	let on_scopes = hook(move |cx| {
		if !cx.unit().path().is_some_and(|p| p.ends_with("u.src")) {
			return;
		}

		let project = cx.project();

		for id in project.units_for_path(&target) {
			project.unit(id).unwrap().clean();
		}
	});

	let project = Project::new(
		&ws,
		ProjectConfig::default(),
		hooked(&counts, None, None, on_scopes),
	);

	let v = project.add_source_file(&v_path).unwrap();
	let u = project.add_source_file(&u_path).unwrap();

	project.ensure_definitions();
	assert_eq!(project.resolve("q.U").unwrap().unit, u);
	assert!(project.resolve("q.V").is_none());

	project.ensure_definitions();
	assert_eq!(project.resolve("q.V").unwrap().unit, v);
	assert_eq!(counts.scopes.load(Ordering::SeqCst), 3);
}

#[test]
fn waits_time_out() {
	setup::logging(LevelFilter::INFO);
	let dir = tempfile::tempdir().unwrap();
	let counts = Arc::new(Counts::default());
	let path = write(dir.path(), "slow.src", "package t\nclass Slow\n");

	let ws = Workspace::new(WorkspaceConfig {
		threads: 2,
		wait_timeout_ms: 50,
	})
	.unwrap();

	let started = Arc::new(Barrier::new(2));
	let barrier = started.clone();

	let on_parse = hook(move |_| {
		barrier.wait();
		std::thread::sleep(Duration::from_millis(500));
	});

	let project = Project::new(
		&ws,
		ProjectConfig::default(),
		hooked(&counts, None, on_parse, None),
	);

	let id = project.add_source_file(&path).unwrap();

	std::thread::scope(|scope| {
		let slow = scope.spawn(|| project.unit(id).unwrap().syntax_tree());
		started.wait();

		let unit = project.unit(id).unwrap();
		let waited = unit.syntax_tree();
		assert_eq!(waited.problems().len(), 1);
		assert_eq!(waited.problems()[0].kind, ProblemKind::Timeout);
		assert!(waited.tree.is_none());

		let done = slow.join().unwrap();
		assert!(done.problems().is_empty());

		// The timeout was not memoized.
		assert!(Arc::ptr_eq(&unit.syntax_tree(), &done));
	});

	assert_eq!(counts.parse.load(Ordering::SeqCst), 1);
}

#[test]
fn cyclic_waits_are_reported() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let counts = Arc::new(Counts::default());
	let a_path = write(dir.path(), "a.src", "package c\nclass A\n");
	let b_path = write(dir.path(), "b.src", "package c\nclass B\n");

	// Each unit's parse needs the other's syntax tree.
	let (first, second) = (a_path.clone(), b_path.clone());

	let on_parse = hook(move |cx| {
		let Some(path) = cx.unit().path() else {
			return;
		};

		let other = if path == first { &second } else { &first };
		let project = cx.project();

		for id in project.units_for_path(other) {
			for problem in project.unit(id).unwrap().syntax_tree().problems() {
				cx.raise(problem.clone());
			}
		}
	});

	let project = Project::new(
		&ws,
		ProjectConfig::default(),
		hooked(&counts, None, on_parse, None),
	);

	let a = project.add_source_file(&a_path).unwrap();
	let b = project.add_source_file(&b_path).unwrap();

	let a_tree = project.unit(a).unwrap().syntax_tree();
	let b_tree = project.unit(b).unwrap().syntax_tree();

	for tree in [&a_tree, &b_tree] {
		assert_eq!(tree.problems().len(), 1);
		assert_eq!(tree.problems()[0].kind, ProblemKind::Cycle);
		assert!(tree.problems()[0].message.contains("cyclic"));
		assert!(tree.tree.is_some());
	}

	assert_eq!(counts.parse.load(Ordering::SeqCst), 2);
	assert!(ws.waits().is_quiet());
}

#[test]
fn interruption_is_not_memoized() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let counts = Arc::new(Counts::default());
	let path = write(dir.path(), "i.src", "package i\nclass I\n");

	let project = Project::new(&ws, ProjectConfig::default(), counted(&counts, None));
	let id = project.add_source_file(&path).unwrap();
	let unit = project.unit(id).unwrap();

	ws.interrupt();
	let tree = unit.syntax_tree();
	assert_eq!(tree.problems()[0].kind, ProblemKind::Interrupted);
	assert!(unit.completed().is_empty());

	ws.resume();
	let tree = unit.syntax_tree();
	assert!(tree.problems().is_empty());
	assert!(tree.tree.is_some());
	assert_eq!(counts.parse.load(Ordering::SeqCst), 1);
}

#[test]
fn markup_discovers_during_codegen() {
	let dir = tempfile::tempdir().unwrap();
	let ws = workspace();
	let view = write(dir.path(), "view.mkp", "package ui\nclass View extends Model\n");
	let model = write(dir.path(), "model.src", "package ui\nclass Model\n");

	let project = Project::new(&ws, ProjectConfig::default(), Backends::plain());
	let view = project.add_source_file(&view).unwrap();
	let model = project.add_source_file(&model).unwrap();

	let unit = project.unit(view).unwrap();
	assert_eq!(unit.kind(), UnitKind::Markup);
	assert!(unit.dependencies().problems().is_empty());
	assert!(unit.completed().contains(Stages::CODE_BYTES));

	let edge = project.graph().edge(view, model).unwrap();
	assert_eq!(edge.kinds, DependencyKinds::INHERITANCE);
}
