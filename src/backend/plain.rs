//! A small line-oriented language with a textual bytecode, implementing every
//! collaborator trait. Used by the command line driver and by tests.
//!
//! Source files hold one directive per line:
//!
//! ```text
//! # comment
//! package com.acme
//! import com.util.Helper
//! import com.util.*
//! include "common.inc"
//! class Widget extends Base implements IFoo, IBar
//! interface IFoo extends IBase
//! function make(Config, int): Widget
//! var count: int
//! const MAX: int
//! namespace internal
//! use namespace com.acme.internal
//! uses Helper
//! embed "logo.png" mime=image/png
//! bundle "strings.properties"
//! ```
//!
//! Generated code, and prebuilt binaries, are lines of `def <kind> <qname>`,
//! `ref <kind bits> <qname>` and `embed <asset|bundle> "<path>" [key=value..]`.

use std::{
	collections::BTreeMap,
	fmt::Write,
	path::{Path, PathBuf},
	sync::Arc,
};

use crate::{
	diag::{Problem, ProblemKind},
	embed::{EmbedDescription, EmbedKind},
	error::StageError,
	graph::DependencyKinds,
	names::QName,
	unit::{CodeBytesResult, Definition, DefinitionKind, FileScope, OutputTag, SyntaxTree, UnitKind},
};

use super::{
	Backends, BuildContext, Discovered, GeneratedCode, Packager, ParsedSource, Reference,
	SourceFile, UnitBuilder,
};

/// Builds the reference set: `.src` scripts, `.mkp` markup, `.bin` prebuilt
/// binaries and `.properties` resource bundles.
#[must_use]
pub fn backends() -> Backends {
	let script: Arc<dyn UnitBuilder> = Arc::new(ScriptBuilder::default());

	Backends::new(PlainPackager)
		.with_shared_builder(UnitKind::Script, script.clone())
		.with_shared_builder(UnitKind::SyntheticModule, script)
		.with_builder(UnitKind::Markup, ScriptBuilder::markup())
		.with_builder(UnitKind::BinaryImport, BinaryBuilder)
		.with_builder(UnitKind::LibraryScript, BinaryBuilder)
		.with_builder(UnitKind::Embed, ResourceBuilder)
		.with_builder(UnitKind::ResourceBundle, ResourceBuilder)
		.with_extension("src", UnitKind::Script)
		.with_extension("mkp", UnitKind::Markup)
		.with_extension("bin", UnitKind::BinaryImport)
		.with_extension("properties", UnitKind::ResourceBundle)
}

/// Type names that never refer to a definition.
const BUILTIN_TYPES: &[&str] = &[
	"*", "any", "boolean", "int", "number", "string", "uint", "void",
];

// Syntax //////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
	Package(String),
	Import(QName),
	Class {
		name: String,
		extends: Option<String>,
		implements: Vec<String>,
	},
	Interface {
		name: String,
		extends: Vec<String>,
	},
	Function {
		name: String,
		params: Vec<String>,
		ret: Option<String>,
	},
	Variable {
		name: String,
		ty: String,
		constant: bool,
	},
	Namespace(String),
	UseNamespace(String),
	Uses(String),
	/// `source` is absolute.
	Embed(EmbedDescription),
}

#[derive(Debug, Clone)]
pub struct Item {
	pub directive: Directive,
	/// One-based, within `origin`.
	pub line: u32,
	/// The included file the item came from; `None` for the root source.
	pub origin: Option<Arc<Path>>,
}

/// The syntax tree of a script or markup unit.
#[derive(Debug, Default)]
pub struct Script {
	pub package: String,
	pub items: Vec<Item>,
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
	Blank,
	Include(PathBuf),
	Directive(Directive),
}

fn parse_line(text: &str, dir: &Path) -> Result<Line, String> {
	let text = text.trim();

	if text.is_empty() || text.starts_with('#') {
		return Ok(Line::Blank);
	}

	let (head, rest) = text
		.split_once(char::is_whitespace)
		.map_or((text, ""), |(h, r)| (h, r.trim()));

	let directive = match head {
		"package" => Directive::Package(ident(rest)?),
		"import" => Directive::Import(QName::new(&ident(rest)?)),
		"include" => {
			let (path, trailing) = quoted(rest)?;
			no_trailing(trailing)?;
			return Ok(Line::Include(dir.join(path)));
		}
		"class" => {
			let (decl, implements) = match rest.split_once(" implements ") {
				Some((d, i)) => (d, ident_list(i)?),
				None => (rest, vec![]),
			};

			let (name, extends) = match decl.split_once(" extends ") {
				Some((n, e)) => (ident(n)?, Some(ident(e)?)),
				None => (ident(decl)?, None),
			};

			Directive::Class {
				name,
				extends,
				implements,
			}
		}
		"interface" => {
			let (name, extends) = match rest.split_once(" extends ") {
				Some((n, e)) => (ident(n)?, ident_list(e)?),
				None => (ident(rest)?, vec![]),
			};

			Directive::Interface { name, extends }
		}
		"function" => {
			let (Some(open), Some(close)) = (rest.find('('), rest.rfind(')')) else {
				return Err("expected a parameter list".to_string());
			};

			if close < open {
				return Err("malformed parameter list".to_string());
			}

			let name = ident(&rest[..open])?;
			let params = ident_list(&rest[(open + 1)..close])?;
			let tail = rest[(close + 1)..].trim();

			let ret = if tail.is_empty() {
				None
			} else if let Some(t) = tail.strip_prefix(':') {
				Some(ident(t)?)
			} else {
				return Err(format!("unexpected `{tail}` after parameter list"));
			};

			Directive::Function { name, params, ret }
		}
		"var" | "const" => {
			let Some((name, ty)) = rest.split_once(':') else {
				return Err(format!("`{head}` needs a type annotation"));
			};

			Directive::Variable {
				name: ident(name)?,
				ty: ident(ty)?,
				constant: head == "const",
			}
		}
		"namespace" => Directive::Namespace(ident(rest)?),
		"use" => {
			let Some(ns) = rest.strip_prefix("namespace ") else {
				return Err("expected `use namespace <name>`".to_string());
			};

			Directive::UseNamespace(ident(ns)?)
		}
		"uses" => Directive::Uses(ident(rest)?),
		"embed" | "bundle" => {
			let (path, trailing) = quoted(rest)?;

			let mut desc = if head == "embed" {
				EmbedDescription::asset(dir.join(path))
			} else {
				EmbedDescription::bundle(dir.join(path))
			};

			for attr in trailing.split_whitespace() {
				let Some((k, v)) = attr.split_once('=') else {
					return Err(format!("expected `key=value`, found `{attr}`"));
				};

				desc = desc.with_attribute(k, v);
			}

			Directive::Embed(desc)
		}
		other => return Err(format!("unknown directive `{other}`")),
	};

	Ok(Line::Directive(directive))
}

fn ident(text: &str) -> Result<String, String> {
	let text = text.trim();

	if text.is_empty() {
		return Err("expected a name".to_string());
	}

	let valid = text
		.chars()
		.all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '*'));

	if !valid || text.starts_with('.') || text.ends_with('.') {
		return Err(format!("invalid name `{text}`"));
	}

	Ok(text.to_string())
}

fn ident_list(text: &str) -> Result<Vec<String>, String> {
	if text.trim().is_empty() {
		return Ok(vec![]);
	}

	text.split(',').map(ident).collect()
}

/// Returns the contents of a leading double-quoted string and what follows it.
fn quoted(text: &str) -> Result<(&str, &str), String> {
	let Some(inner) = text.strip_prefix('"') else {
		return Err("expected a quoted path".to_string());
	};

	let Some(end) = inner.find('"') else {
		return Err("unterminated string".to_string());
	};

	Ok((&inner[..end], inner[(end + 1)..].trim()))
}

fn no_trailing(text: &str) -> Result<(), String> {
	if text.is_empty() {
		Ok(())
	} else {
		Err(format!("unexpected `{text}`"))
	}
}

/// Walks a root source and, recursively, what it includes.
struct Parser<'c, 'p> {
	cx: &'c BuildContext<'p>,
	script: Script,
	included: Vec<PathBuf>,
	imports: Vec<QName>,
	stack: Vec<PathBuf>,
	saw_package: bool,
}

impl Parser<'_, '_> {
	fn raise(&self, kind: ProblemKind, msg: String, line: u32, origin: Option<&Path>) {
		self.cx.raise(Problem::error(kind, msg).at(origin).line(line));
	}

	fn text(&mut self, text: &str, dir: &Path, origin: Option<Arc<Path>>) -> Result<(), StageError> {
		for (i, raw) in text.lines().enumerate() {
			let line = (i + 1) as u32;

			match parse_line(raw, dir) {
				Ok(Line::Blank) => {}
				Ok(Line::Include(path)) => {
					self.include(path, line, origin.as_deref())?;
				}
				Ok(Line::Directive(Directive::Package(pkg))) => {
					if origin.is_some() {
						self.raise(
							ProblemKind::Syntax,
							"`package` is not allowed in included files".to_string(),
							line,
							origin.as_deref(),
						);
					} else if self.saw_package {
						self.raise(
							ProblemKind::Syntax,
							"duplicate `package` directive".to_string(),
							line,
							None,
						);
					} else {
						self.saw_package = true;
						self.script.package = pkg;
					}
				}
				Ok(Line::Directive(directive)) => {
					if let Directive::Import(qname) = &directive {
						self.imports.push(qname.clone());
					}

					self.script.items.push(Item {
						directive,
						line,
						origin: origin.clone(),
					});
				}
				Err(msg) => self.raise(ProblemKind::Syntax, msg, line, origin.as_deref()),
			}
		}

		Ok(())
	}

	fn include(&mut self, path: PathBuf, line: u32, from: Option<&Path>) -> Result<(), StageError> {
		let path = crate::paths::normalize(&path);

		if self.stack.contains(&path) {
			self.raise(
				ProblemKind::Syntax,
				format!("`{}` includes itself", path.display()),
				line,
				from,
			);

			return Ok(());
		}

		// Recorded even if unreadable, so that creating it later is noticed.
		if !self.included.contains(&path) {
			self.included.push(path.clone());
		}

		let file = match self.cx.read(&path) {
			Ok(f) => f,
			Err(StageError::Io { source, .. }) => {
				self.raise(
					ProblemKind::Io,
					format!("failed to include `{}`: {source}", path.display()),
					line,
					from,
				);

				return Ok(());
			}
			Err(other) => return Err(other),
		};

		self.cx.check_interrupt()?;
		let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
		self.stack.push(path.clone());
		let ret = self.text(&file.text(), &dir, Some(Arc::from(path.as_path())));
		self.stack.pop();
		ret
	}
}

impl Script {
	/// Class, interface, function, variable and namespace declarations.
	#[must_use]
	pub fn definitions(&self) -> Vec<Definition> {
		self.items
			.iter()
			.filter_map(|item| {
				let (name, kind) = match &item.directive {
					Directive::Class { name, .. } => (name, DefinitionKind::Class),
					Directive::Interface { name, .. } => (name, DefinitionKind::Interface),
					Directive::Function { name, .. } => (name, DefinitionKind::Function),
					Directive::Variable {
						name,
						constant: false,
						..
					} => (name, DefinitionKind::Variable),
					Directive::Variable {
						name,
						constant: true,
						..
					} => (name, DefinitionKind::Constant),
					Directive::Namespace(name) => (name, DefinitionKind::Namespace),
					_ => return None,
				};

				Some(Definition {
					qname: QName::join(&self.package, name),
					kind,
					line: item.origin.is_none().then_some(item.line),
				})
			})
			.collect()
	}

	/// Every name the script mentions, resolved against its package and
	/// imports in that order of preference.
	#[must_use]
	pub fn references(&self, cx: &BuildContext) -> Vec<Reference> {
		let imports: Vec<&QName> = self
			.items
			.iter()
			.filter_map(|item| match &item.directive {
				Directive::Import(q) => Some(q),
				_ => None,
			})
			.collect();

		let mut ret = vec![];

		for item in &self.items {
			let mut push = |name: &str, kind: DependencyKinds| {
				if BUILTIN_TYPES.contains(&name) {
					return;
				}

				ret.push(Reference {
					qname: self.resolve_name(name, &imports, cx),
					kind,
					line: item.origin.is_none().then_some(item.line),
				});
			};

			match &item.directive {
				Directive::Class {
					extends,
					implements,
					..
				} => {
					for name in extends.iter().chain(implements) {
						push(name.as_str(), DependencyKinds::INHERITANCE);
					}
				}
				Directive::Interface { extends, .. } => {
					for name in extends {
						push(name.as_str(), DependencyKinds::INHERITANCE);
					}
				}
				Directive::Function { params, ret, .. } => {
					for name in params.iter().chain(ret) {
						push(name.as_str(), DependencyKinds::SIGNATURE);
					}
				}
				Directive::Variable { ty, .. } => push(ty.as_str(), DependencyKinds::SIGNATURE),
				Directive::UseNamespace(name) => push(name.as_str(), DependencyKinds::NAMESPACE),
				Directive::Uses(name) => push(name.as_str(), DependencyKinds::EXPRESSION),
				Directive::Package(_)
				| Directive::Import(_)
				| Directive::Namespace(_)
				| Directive::Embed(_) => {}
			}
		}

		ret
	}

	#[must_use]
	pub fn embeds(&self) -> Vec<EmbedDescription> {
		let mut ret: Vec<EmbedDescription> = vec![];

		for item in &self.items {
			if let Directive::Embed(desc) = &item.directive {
				if !ret.contains(desc) {
					ret.push(desc.clone());
				}
			}
		}

		ret
	}

	/// Explicit imports win over the script's own package, which wins over
	/// wildcard imports. The first candidate some unit provides is taken;
	/// failing that, the most preferred one.
	#[must_use]
	fn resolve_name(&self, name: &str, imports: &[&QName], cx: &BuildContext) -> QName {
		if name.contains('.') {
			return QName::new(name);
		}

		let mut candidates: Vec<QName> = imports
			.iter()
			.filter(|q| !q.is_wildcard() && q.base_name() == name)
			.map(|q| QName::clone(q))
			.collect();

		candidates.push(QName::join(&self.package, name));

		candidates.extend(
			imports
				.iter()
				.filter(|q| q.is_wildcard())
				.map(|q| QName::join(q.package(), name)),
		);

		let fallback = candidates[0].clone();

		candidates
			.into_iter()
			.find(|q| cx.resolve(q.as_str()).is_some())
			.unwrap_or(fallback)
	}
}

// Bytecode ////////////////////////////////////////////////////////////////////

/// Parsed generated code or prebuilt binary.
#[derive(Debug, Default)]
pub struct Bytecode {
	pub definitions: Vec<Definition>,
	pub references: Vec<Reference>,
	pub embeds: Vec<EmbedDescription>,
}

#[must_use]
fn kind_name(kind: DefinitionKind) -> &'static str {
	match kind {
		DefinitionKind::Class => "class",
		DefinitionKind::Interface => "interface",
		DefinitionKind::Function => "function",
		DefinitionKind::Variable => "var",
		DefinitionKind::Constant => "const",
		DefinitionKind::Namespace => "namespace",
		DefinitionKind::Resource => "resource",
	}
}

#[must_use]
fn kind_from_name(name: &str) -> Option<DefinitionKind> {
	Some(match name {
		"class" => DefinitionKind::Class,
		"interface" => DefinitionKind::Interface,
		"function" => DefinitionKind::Function,
		"var" => DefinitionKind::Variable,
		"const" => DefinitionKind::Constant,
		"namespace" => DefinitionKind::Namespace,
		"resource" => DefinitionKind::Resource,
		_ => return None,
	})
}

fn parse_bytecode_line(text: &str, line: u32, code: &mut Bytecode) -> Result<(), String> {
	let text = text.trim();

	if text.is_empty() || text.starts_with('#') {
		return Ok(());
	}

	let mut parts = text.splitn(3, ' ');
	let head = parts.next().unwrap_or_default();
	let first = parts.next().unwrap_or_default();
	let rest = parts.next().unwrap_or_default().trim();

	match head {
		"def" => {
			let Some(kind) = kind_from_name(first) else {
				return Err(format!("unknown definition kind `{first}`"));
			};

			code.definitions.push(Definition {
				qname: QName::new(&ident(rest)?),
				kind,
				line: Some(line),
			});
		}
		"ref" => {
			let Ok(bits) = first.parse::<u8>() else {
				return Err(format!("invalid dependency kinds `{first}`"));
			};

			code.references.push(Reference {
				qname: QName::new(&ident(rest)?),
				kind: DependencyKinds::from_bits_truncate(bits),
				line: None,
			});
		}
		"embed" => {
			let (path, trailing) = quoted(rest)?;

			let mut desc = match first {
				"asset" => EmbedDescription::asset(PathBuf::from(path)),
				"bundle" => EmbedDescription::bundle(PathBuf::from(path)),
				other => return Err(format!("unknown embed kind `{other}`")),
			};

			for attr in trailing.split_whitespace() {
				let Some((k, v)) = attr.split_once('=') else {
					return Err(format!("expected `key=value`, found `{attr}`"));
				};

				desc = desc.with_attribute(k, v);
			}

			code.embeds.push(desc);
		}
		other => return Err(format!("unknown instruction `{other}`")),
	}

	Ok(())
}

/// Malformed lines are passed to `raise` and otherwise skipped.
fn parse_bytecode(text: &str, mut raise: impl FnMut(Problem)) -> Bytecode {
	let mut ret = Bytecode::default();

	for (i, raw) in text.lines().enumerate() {
		let line = (i + 1) as u32;

		if let Err(msg) = parse_bytecode_line(raw, line, &mut ret) {
			raise(Problem::error(ProblemKind::Syntax, msg).line(line));
		}
	}

	ret
}

fn write_embed(out: &mut String, desc: &EmbedDescription) {
	let kind = match desc.kind {
		EmbedKind::Asset => "asset",
		EmbedKind::ResourceBundle => "bundle",
	};

	let _ = write!(out, "embed {kind} \"{}\"", desc.source.display());

	for (k, v) in &desc.attributes {
		let _ = write!(out, " {k}={v}");
	}

	out.push('\n');
}

// Builders ////////////////////////////////////////////////////////////////////

fn script_of<'t>(tree: Option<&'t SyntaxTree>) -> Result<&'t Script, StageError> {
	tree.and_then(|t| t.downcast_ref::<Script>())
		.ok_or_else(|| StageError::fault("expected a script syntax tree"))
}

/// Scripts, markup and synthetic modules.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
	markup: bool,
}

impl ScriptBuilder {
	/// Markup only knows its dependencies once its code is generated.
	#[must_use]
	pub fn markup() -> Self {
		Self { markup: true }
	}
}

impl UnitBuilder for ScriptBuilder {
	fn deps_during_codegen(&self) -> bool {
		self.markup
	}

	fn parse(
		&self,
		cx: &BuildContext,
		source: Option<&SourceFile>,
	) -> Result<ParsedSource, StageError> {
		let Some(source) = source else {
			return Ok(ParsedSource::default());
		};

		let dir = source
			.path
			.parent()
			.map(Path::to_path_buf)
			.unwrap_or_default();

		let mut parser = Parser {
			cx,
			script: Script::default(),
			included: vec![],
			imports: vec![],
			stack: vec![crate::paths::normalize(&source.path)],
			saw_package: false,
		};

		parser.text(&source.text(), &dir, None)?;

		Ok(ParsedSource {
			tree: Some(SyntaxTree::new(parser.script)),
			included: parser.included,
			imports: parser.imports,
		})
	}

	fn build_scopes(
		&self,
		cx: &BuildContext,
		tree: Option<&SyntaxTree>,
	) -> Result<Vec<FileScope>, StageError> {
		let script = script_of(tree)?;
		let definitions = script.definitions();

		for promise in cx.promises() {
			if !definitions.iter().any(|d| &d.qname == promise) {
				cx.raise(Problem::warning(
					ProblemKind::Unresolved,
					format!("expected a definition of `{promise}`"),
				));
			}
		}

		Ok(vec![FileScope::new(definitions)])
	}

	fn generate(
		&self,
		cx: &BuildContext,
		tree: Option<&SyntaxTree>,
	) -> Result<GeneratedCode, StageError> {
		let script = script_of(tree)?;
		let mut out = String::new();
		let _ = writeln!(out, "# {}", cx.unit().name());

		for def in script.definitions() {
			let _ = writeln!(out, "def {} {}", kind_name(def.kind), def.qname);
		}

		// Exported code must carry its references for the library units that
		// get built from it.
		cx.project().ensure_definitions();

		for reference in script.references(cx) {
			let _ = writeln!(out, "ref {} {}", reference.kind.bits(), reference.qname);
		}

		let embeds = script.embeds();

		for desc in &embeds {
			write_embed(&mut out, desc);
		}

		cx.check_interrupt()?;

		Ok(GeneratedCode {
			bytes: out.into_bytes(),
			embeds,
		})
	}

	fn discover(
		&self,
		cx: &BuildContext,
		tree: Option<&SyntaxTree>,
		code: Option<&CodeBytesResult>,
	) -> Result<Discovered, StageError> {
		if let Some(code) = code {
			let text = String::from_utf8_lossy(&code.bytes);
			let parsed = parse_bytecode(&text, |_| {});

			return Ok(Discovered {
				references: parsed.references,
				embeds: vec![],
			});
		}

		// The tree stage has already reported why there is none.
		let Some(tree) = tree else {
			return Ok(Discovered::default());
		};

		let script = script_of(Some(tree))?;

		Ok(Discovered {
			references: script.references(cx),
			embeds: script.embeds(),
		})
	}
}

/// Prebuilt binaries and library entries. Their definitions come straight
/// from the bytecode, without a syntax tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryBuilder;

impl UnitBuilder for BinaryBuilder {
	fn scope_from_tree(&self) -> bool {
		false
	}

	fn parse(
		&self,
		cx: &BuildContext,
		source: Option<&SourceFile>,
	) -> Result<ParsedSource, StageError> {
		let Some(source) = source else {
			return Ok(ParsedSource::default());
		};

		let code = parse_bytecode(&source.text(), |p| cx.raise(p));

		Ok(ParsedSource {
			tree: Some(SyntaxTree::new(code)),
			..Default::default()
		})
	}

	fn build_scopes(
		&self,
		cx: &BuildContext,
		_: Option<&SyntaxTree>,
	) -> Result<Vec<FileScope>, StageError> {
		let Some(source) = cx.source()? else {
			return Ok(vec![]);
		};

		// Malformed lines are the tree stage's to report.
		let code = parse_bytecode(&source.text(), |_| {});
		Ok(vec![FileScope::new(code.definitions)])
	}

	fn generate(
		&self,
		cx: &BuildContext,
		_: Option<&SyntaxTree>,
	) -> Result<GeneratedCode, StageError> {
		let Some(source) = cx.source()? else {
			return Ok(GeneratedCode::default());
		};

		let code = parse_bytecode(&source.text(), |_| {});

		Ok(GeneratedCode {
			bytes: source.bytes.to_vec(),
			embeds: code.embeds,
		})
	}

	fn discover(
		&self,
		_: &BuildContext,
		tree: Option<&SyntaxTree>,
		_: Option<&CodeBytesResult>,
	) -> Result<Discovered, StageError> {
		let Some(code) = tree.and_then(|t| t.downcast_ref::<Bytecode>()) else {
			return Ok(Discovered::default());
		};

		Ok(Discovered {
			references: code.references.clone(),
			embeds: code.embeds.clone(),
		})
	}
}

/// The syntax tree of an embedded asset or a resource bundle.
#[derive(Debug)]
pub struct Resource {
	pub kind: EmbedKind,
	pub bytes: Arc<[u8]>,
	/// Only filled for bundles.
	pub entries: BTreeMap<String, String>,
}

fn parse_properties(text: &str, mut raise: impl FnMut(Problem)) -> BTreeMap<String, String> {
	let mut ret = BTreeMap::new();

	for (i, raw) in text.lines().enumerate() {
		let line = raw.trim();

		if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
			continue;
		}

		match line.split_once('=') {
			Some((k, v)) if !k.trim().is_empty() => {
				ret.insert(k.trim().to_string(), v.trim().to_string());
			}
			_ => raise(
				Problem::error(ProblemKind::Syntax, format!("expected `key=value`, found `{line}`"))
					.line((i + 1) as u32),
			),
		}
	}

	ret
}

/// Embedded assets and resource bundles, whether made by the embed factory
/// or found on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceBuilder;

impl UnitBuilder for ResourceBuilder {
	fn parse(
		&self,
		cx: &BuildContext,
		source: Option<&SourceFile>,
	) -> Result<ParsedSource, StageError> {
		let (kind, file, included) = match cx.embed_description() {
			Some(desc) => {
				let included = vec![desc.source.clone()];

				match cx.read(&desc.source) {
					Ok(file) => (desc.kind, file, included),
					Err(StageError::Io { path, source }) => {
						cx.raise(
							Problem::error(
								ProblemKind::Io,
								format!("failed to read embedded `{}`: {source}", path.display()),
							)
							.at(Some(path.as_path())),
						);

						return Ok(ParsedSource {
							included,
							..Default::default()
						});
					}
					Err(other) => return Err(other),
				}
			}
			None => {
				let Some(source) = source else {
					return Ok(ParsedSource::default());
				};

				let kind = if cx.unit().kind() == UnitKind::ResourceBundle {
					EmbedKind::ResourceBundle
				} else {
					EmbedKind::Asset
				};

				(kind, source.clone(), vec![])
			}
		};

		let entries = match kind {
			EmbedKind::Asset => BTreeMap::new(),
			EmbedKind::ResourceBundle => parse_properties(&file.text(), |p| {
				cx.raise(p.at(Some(file.path.as_path())));
			}),
		};

		Ok(ParsedSource {
			tree: Some(SyntaxTree::new(Resource {
				kind,
				bytes: file.bytes,
				entries,
			})),
			included,
			imports: vec![],
		})
	}

	fn build_scopes(
		&self,
		cx: &BuildContext,
		_: Option<&SyntaxTree>,
	) -> Result<Vec<FileScope>, StageError> {
		let definitions = cx.promises().iter().map(|qname| Definition {
			qname: qname.clone(),
			kind: DefinitionKind::Resource,
			line: None,
		});

		Ok(vec![FileScope::new(definitions)])
	}

	fn generate(
		&self,
		_: &BuildContext,
		tree: Option<&SyntaxTree>,
	) -> Result<GeneratedCode, StageError> {
		let Some(res) = tree.and_then(|t| t.downcast_ref::<Resource>()) else {
			return Err(StageError::fault("expected a resource syntax tree"));
		};

		let bytes = match res.kind {
			EmbedKind::Asset => res.bytes.to_vec(),
			EmbedKind::ResourceBundle => {
				let mut out = String::new();

				for (k, v) in &res.entries {
					let _ = writeln!(out, "{k}={v}");
				}

				out.into_bytes()
			}
		};

		Ok(GeneratedCode {
			bytes,
			embeds: vec![],
		})
	}

	fn discover(
		&self,
		_: &BuildContext,
		_: Option<&SyntaxTree>,
		_: Option<&CodeBytesResult>,
	) -> Result<Discovered, StageError> {
		Ok(Discovered::default())
	}
}

/// Names each tag after its unit and nests embedded assets beneath it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainPackager;

impl Packager for PlainPackager {
	fn package(
		&self,
		cx: &BuildContext,
		code: &CodeBytesResult,
		assets: Vec<OutputTag>,
	) -> Result<OutputTag, StageError> {
		Ok(OutputTag {
			name: cx.unit().name().to_string(),
			bytes: code.bytes.clone(),
			assets,
		})
	}
}
