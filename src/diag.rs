//! [`Problem`]: the diagnostics carried by every stage result.

use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
	Warning,
	Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
	/// Malformed source content.
	Syntax,
	/// A reference to a name no unit in the project provides.
	Unresolved,
	/// Two units of equal priority claim the same qualified name.
	Collision,
	Io,
	/// A stage handler returned an error or panicked.
	InternalFault,
	/// Waiting on a stage would have closed a wait-for cycle.
	Cycle,
	Timeout,
	Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Problem {
	pub kind: ProblemKind,
	pub severity: Severity,
	pub message: String,
	pub path: Option<PathBuf>,
	/// One-based.
	pub line: Option<u32>,
}

impl Problem {
	#[must_use]
	pub fn error(kind: ProblemKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			severity: Severity::Error,
			message: message.into(),
			path: None,
			line: None,
		}
	}

	#[must_use]
	pub fn warning(kind: ProblemKind, message: impl Into<String>) -> Self {
		Self {
			severity: Severity::Warning,
			..Self::error(kind, message)
		}
	}

	#[must_use]
	pub fn at(mut self, path: Option<&Path>) -> Self {
		self.path = path.map(Path::to_path_buf);
		self
	}

	#[must_use]
	pub fn line(mut self, line: u32) -> Self {
		self.line = Some(line);
		self
	}

	#[must_use]
	pub fn is_error(&self) -> bool {
		self.severity >= Severity::Error
	}
}

impl std::fmt::Display for Problem {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let sev = match self.severity {
			Severity::Warning => "warning",
			Severity::Error => "error",
		};

		match (&self.path, self.line) {
			(Some(p), Some(l)) => write!(f, "{}:{l}: {sev}: {}", p.display(), self.message),
			(Some(p), None) => write!(f, "{}: {sev}: {}", p.display(), self.message),
			(None, _) => write!(f, "{sev}: {}", self.message),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn display() {
		let p = Problem::error(ProblemKind::Syntax, "unknown directive `clas`")
			.at(Some(Path::new("/proj/a.src")))
			.line(3);
		assert_eq!(p.to_string(), "/proj/a.src:3: error: unknown directive `clas`");

		let w = Problem::warning(ProblemKind::Unresolved, "no definition for `pkg.Q`");
		assert!(!w.is_error());
		assert_eq!(w.to_string(), "warning: no definition for `pkg.Q`");
	}
}
