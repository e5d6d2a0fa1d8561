//! JSON-backed configuration for a [workspace](crate::workspace::Workspace)
//! and a [project](crate::project::Project).

use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
	/// Worker threads in the build pool. Zero lets rayon decide.
	pub threads: usize,
	/// Upper bound on any blocking wait for another thread's stage result.
	pub wait_timeout_ms: u64,
}

impl Default for WorkspaceConfig {
	fn default() -> Self {
		Self {
			threads: 0,
			wait_timeout_ms: 120_000,
		}
	}
}

impl WorkspaceConfig {
	#[must_use]
	pub fn wait_timeout(&self) -> Duration {
		Duration::from_millis(self.wait_timeout_ms)
	}
}

/// What a build produces for each unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
	/// Code bytes and dependencies only.
	Binary,
	/// Everything, including packaged output tags.
	#[default]
	Package,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
	pub target: TargetKind,
	/// Individually listed source files; these carry the highest priority.
	pub sources: Vec<PathBuf>,
	/// Roots scanned for sources named after the definition they provide.
	/// Earlier roots win over later ones.
	pub source_paths: Vec<PathBuf>,
	/// Containers whose entries are read from the library cache.
	/// Earlier containers win over later ones.
	pub libraries: Vec<PathBuf>,
	pub library_cache: Option<PathBuf>,
	/// Start building the providers of a unit's imports as soon as its
	/// syntax tree is available.
	pub eager_imports: bool,
	/// Written by the command line driver when packaging.
	pub output: Option<PathBuf>,
}

impl Default for ProjectConfig {
	fn default() -> Self {
		Self {
			target: TargetKind::Package,
			sources: vec![],
			source_paths: vec![],
			libraries: vec![],
			library_cache: None,
			eager_imports: true,
			output: None,
		}
	}
}

/// The top-level document read by the command line driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
	pub workspace: WorkspaceConfig,
	pub project: ProjectConfig,
}

impl BuildConfig {
	/// Relative paths inside the document are taken relative to its directory.
	pub fn load(path: &Path) -> Result<Self, Error> {
		let text = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
		let mut ret: Self = serde_json::from_str(&text).map_err(|err| Error::json(path, err))?;

		if let Some(dir) = path.parent() {
			ret.project.rebase(dir);
		}

		Ok(ret)
	}
}

impl ProjectConfig {
	fn rebase(&mut self, dir: &Path) {
		let fix = |p: &mut PathBuf| {
			if p.is_relative() {
				*p = dir.join(&*p);
			}
		};

		self.sources.iter_mut().for_each(fix);
		self.source_paths.iter_mut().for_each(fix);
		self.libraries.iter_mut().for_each(fix);
		self.library_cache.iter_mut().for_each(fix);
		self.output.iter_mut().for_each(fix);
	}
}
