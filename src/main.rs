//! # incbuild
//!
//! Builds the project a JSON configuration file describes, prints the build
//! order and every problem found, and writes the packaged output.

use std::{
	io::Write,
	path::{Path, PathBuf},
	process::ExitCode,
	time::{SystemTime, UNIX_EPOCH},
};

use clap::{Parser, ValueEnum};
use incbuild::{
	backend::Backends,
	cache::CachedEntry,
	config::{BuildConfig, TargetKind},
	error::Error,
	setup,
	unit::OutputTag,
	Project, UnitId, Workspace,
};
use tracing::{info, level_filters::LevelFilter, warn};

#[derive(Parser, Debug)]
#[command(name = "incbuild", version, about = "Incremental compilation-unit builder")]
struct Cli {
	/// Path to the JSON build configuration.
	config: PathBuf,

	/// Overrides the configured build target.
	#[arg(short, long, value_enum)]
	target: Option<TargetArg>,

	/// Overrides the configured worker thread count.
	#[arg(long)]
	threads: Option<usize>,

	/// Records the built code in the library cache as entries of this
	/// container, so other projects can link against it.
	#[arg(long)]
	export: Option<PathBuf>,

	/// Enable debug-level logging.
	#[arg(short, long)]
	verbose: bool,

	/// Only log errors.
	#[arg(short, long)]
	quiet: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum TargetArg {
	Binary,
	Package,
}

impl From<TargetArg> for TargetKind {
	fn from(value: TargetArg) -> Self {
		match value {
			TargetArg::Binary => Self::Binary,
			TargetArg::Package => Self::Package,
		}
	}
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	let level = if cli.verbose {
		LevelFilter::DEBUG
	} else if cli.quiet {
		LevelFilter::ERROR
	} else {
		LevelFilter::INFO
	};

	setup::logging(level);

	match run(cli) {
		Ok(true) => ExitCode::SUCCESS,
		Ok(false) => ExitCode::from(1),
		Err(err) => {
			eprintln!("incbuild: {err}");
			ExitCode::from(2)
		}
	}
}

/// Returns `false` if any problem of error severity was found.
fn run(cli: Cli) -> Result<bool, Error> {
	let mut config = BuildConfig::load(&cli.config)?;

	if let Some(threads) = cli.threads {
		config.workspace.threads = threads;
	}

	if let Some(target) = cli.target {
		config.project.target = target.into();
	}

	let target = config.project.target;
	let output = config.project.output.clone();
	let cache_path = config.project.library_cache.clone();
	let ws = Workspace::new(config.workspace)?;

	if let Some(path) = &cache_path {
		if path.exists() {
			ws.load_library_cache(path)?;
		}
	}

	let project = Project::new(&ws, config.project, Backends::plain());
	let roots = project.load_configured()?;

	if roots.is_empty() {
		warn!("No sources configured.");
	}

	for id in &roots {
		if let Some(unit) = project.unit(*id) {
			unit.start_build_async(target);
		}
	}

	let order = project.reachable_units_in_order(&roots);
	let mut problems = vec![];

	for id in &order {
		if let Some(unit) = project.unit(*id) {
			unit.wait_for_build_finish(&mut problems, Some(target));
		}

		println!("{}", project.unit_name(*id));
	}

	for problem in &problems {
		eprintln!("{problem}");
	}

	let errors = problems.iter().filter(|p| p.is_error()).count();

	info!(
		"Built {} unit(s) with {errors} error(s) and {} warning(s).",
		order.len(),
		problems.len() - errors
	);

	if errors > 0 {
		return Ok(false);
	}

	if target == TargetKind::Package {
		if let Some(path) = &output {
			write_output(&project, &order, path)?;
		}
	}

	if let Some(container) = &cli.export {
		let Some(path) = &cache_path else {
			warn!("`--export` given without a configured library cache.");
			return Ok(true);
		};

		export(&project, &roots, container);
		ws.save_library_cache(path)?;
	}

	Ok(true)
}

fn write_output(project: &Project, order: &[UnitId], path: &Path) -> Result<(), Error> {
	fn write_tag(out: &mut Vec<u8>, tag: &OutputTag, depth: usize) {
		let _ = writeln!(
			out,
			"{:indent$}tag {} {}",
			"",
			tag.name,
			tag.bytes.len(),
			indent = depth * 2
		);

		out.extend_from_slice(&tag.bytes);
		out.push(b'\n');

		for asset in &tag.assets {
			write_tag(out, asset, depth + 1);
		}
	}

	let mut out = vec![];

	for id in order {
		let Some(unit) = project.unit(*id) else {
			continue;
		};

		if let Some(tag) = &unit.output_tag().tag {
			write_tag(&mut out, tag, 0);
		}
	}

	std::fs::write(path, out).map_err(|err| Error::Io {
		path: path.to_path_buf(),
		source: err,
	})?;

	info!("Wrote `{}`.", path.display());
	Ok(())
}

fn export(project: &Project, roots: &[UnitId], container: &Path) {
	let timestamp = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |d| d.as_millis() as u64);

	for id in roots {
		let Some(unit) = project.unit(*id) else {
			continue;
		};

		let qnames = unit.qualified_names();

		let Some(entry) = qnames.first().map(|q| q.to_string()) else {
			continue;
		};

		project.workspace().library_cache().insert(
			container,
			entry,
			CachedEntry {
				timestamp,
				qnames: qnames.iter().map(|q| q.to_string()).collect(),
				bytes: unit.code_bytes().bytes.to_vec(),
			},
		);
	}

	info!("Exported {} unit(s) to `{}`.", roots.len(), container.display());
}
