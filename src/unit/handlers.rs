//! What each stage does when its slot runs it.

use std::sync::Arc;

use crate::{
	backend::BuildContext,
	diag::{Problem, ProblemKind},
	error::StageError,
	request::RequestSlot,
	UnitId,
};

use super::{
	CodeBytesResult, CompilationUnit, DependenciesResult, FileScopeResult, OutputTagResult,
	StageOutput, SyntaxTreeResult,
};

pub(crate) trait StageHandler: StageOutput {
	#[must_use]
	fn slot(unit: &CompilationUnit) -> &RequestSlot<Self>;

	fn compute(cx: &BuildContext) -> Result<Self, StageError>;
}

impl StageHandler for SyntaxTreeResult {
	fn slot(unit: &CompilationUnit) -> &RequestSlot<Self> {
		&unit.syntax_tree
	}

	fn compute(cx: &BuildContext) -> Result<Self, StageError> {
		let builder = cx.builder()?;

		let source = match cx.source() {
			Ok(s) => s,
			Err(StageError::Io { path, source }) => {
				cx.raise(
					Problem::error(
						ProblemKind::Io,
						format!("failed to open `{}`: {source}", path.display()),
					)
					.at(Some(path.as_path())),
				);

				return Ok(Self {
					problems: cx.take_problems(),
					..Default::default()
				});
			}
			Err(other) => return Err(other),
		};

		let parsed = builder.parse(cx, source.as_ref())?;
		let project = cx.project();
		project.note_included(cx.unit(), &parsed.included);

		if project.config().eager_imports {
			project.start_import_providers(cx.unit(), &parsed.imports);
		}

		Ok(Self {
			tree: parsed.tree,
			included: parsed.included,
			last_modified: source.and_then(|s| s.last_modified),
			imports: parsed.imports,
			problems: cx.take_problems(),
		})
	}
}

impl StageHandler for FileScopeResult {
	fn slot(unit: &CompilationUnit) -> &RequestSlot<Self> {
		&unit.file_scope
	}

	fn compute(cx: &BuildContext) -> Result<Self, StageError> {
		let builder = cx.builder()?;

		let scopes = if builder.scope_from_tree() {
			let tree = cx.unit().request::<SyntaxTreeResult>(cx.project());

			match tree.tree.as_ref() {
				// The tree stage has already reported why.
				None => vec![],
				Some(t) => builder.build_scopes(cx, Some(t))?,
			}
		} else {
			builder.build_scopes(cx, None)?
		};

		if !cx.unit().is_invisible() {
			cx.project().register_scopes(cx, &scopes);
		}

		Ok(Self {
			scopes,
			problems: cx.take_problems(),
		})
	}
}

impl StageHandler for CodeBytesResult {
	fn slot(unit: &CompilationUnit) -> &RequestSlot<Self> {
		&unit.code_bytes
	}

	fn compute(cx: &BuildContext) -> Result<Self, StageError> {
		let builder = cx.builder()?;
		let project = cx.project();
		let tree = cx.unit().request::<SyntaxTreeResult>(project);

		if builder.scope_from_tree() {
			if tree.tree.is_none() {
				return Ok(Self {
					bytes: Arc::from(Vec::new()),
					embeds: vec![],
					problems: cx.take_problems(),
				});
			}

			let _ = cx.unit().request::<FileScopeResult>(project);
		}

		let code = builder.generate(cx, tree.tree.as_ref())?;

		Ok(Self {
			bytes: code.bytes.into(),
			embeds: code.embeds,
			problems: cx.take_problems(),
		})
	}
}

impl StageHandler for OutputTagResult {
	fn slot(unit: &CompilationUnit) -> &RequestSlot<Self> {
		&unit.output_tag
	}

	fn compute(cx: &BuildContext) -> Result<Self, StageError> {
		let project = cx.project();
		let unit = cx.unit();

		// Materializes the embedded sub-units.
		let _ = unit.request::<DependenciesResult>(project);
		let code = unit.request::<CodeBytesResult>(project);

		let embeds: Vec<UnitId> = unit.embeds.lock().iter().copied().collect();
		let mut assets = Vec::with_capacity(embeds.len());

		for id in embeds {
			let Some(embed) = project.unit(id) else {
				continue;
			};

			if let Some(tag) = &embed.output_tag().tag {
				assets.push(tag.clone());
			}
		}

		cx.check_interrupt()?;
		let tag = project.backends().packager().package(cx, &code, assets)?;

		Ok(Self {
			tag: Some(tag),
			problems: cx.take_problems(),
		})
	}
}

impl StageHandler for DependenciesResult {
	fn slot(unit: &CompilationUnit) -> &RequestSlot<Self> {
		&unit.dependencies
	}

	fn compute(cx: &BuildContext) -> Result<Self, StageError> {
		let builder = cx.builder()?;
		let project = cx.project();
		let unit = cx.unit();

		let tree = unit.request::<SyntaxTreeResult>(project);
		let _ = unit.request::<FileScopeResult>(project);

		let code = if builder.deps_during_codegen() {
			Some(unit.request::<CodeBytesResult>(project))
		} else {
			None
		};

		// Names from units without promises are only known once their file
		// scopes have run.
		project.ensure_definitions();

		let discovered = builder.discover(cx, tree.tree.as_ref(), code.as_deref())?;
		project.resolve_references(cx, &discovered.references);

		let mut embeds = discovered.embeds;

		for desc in code.iter().flat_map(|c| c.embeds.iter()) {
			if !embeds.contains(desc) {
				embeds.push(desc.clone());
			}
		}

		project.update_embeds(unit, embeds);

		Ok(Self {
			problems: cx.take_problems(),
		})
	}
}
