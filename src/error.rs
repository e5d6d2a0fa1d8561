//! Host-level failures: anything that is not a stage request.
//!
//! Problems met while deriving a unit's stages are data (see [`crate::diag`]);
//! this type covers configuration, library-cache persistence, source-root
//! scanning and worker-pool setup.

use std::path::PathBuf;

use crate::ErrorBox;

#[derive(Debug)]
pub enum Error {
	Io {
		path: PathBuf,
		source: std::io::Error,
	},
	Json {
		path: Option<PathBuf>,
		source: serde_json::Error,
	},
	/// A source root could not be walked.
	Scan(walkdir::Error),
	Process {
		source: Option<ErrorBox>,
		ctx: String,
	},
}

impl Error {
	#[must_use]
	pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source,
		}
	}

	#[must_use]
	pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
		Self::Json {
			path: Some(path.into()),
			source,
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Io { source, .. } => Some(source),
			Self::Json { source, .. } => Some(source),
			Self::Scan(err) => Some(err),
			Self::Process { source, .. } => {
				let s: &(dyn std::error::Error + 'static) = source.as_deref()?;
				Some(s)
			}
		}
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Io { path, source } => {
				write!(f, "file I/O failure at `{}`: {source}", path.display())
			}
			Self::Json { path, source } => match path {
				Some(p) => write!(f, "malformed JSON in `{}`: {source}", p.display()),
				None => write!(f, "malformed JSON: {source}"),
			},
			Self::Scan(err) => write!(f, "failed to scan a source root: {err}"),
			Self::Process { source, ctx } => match source {
				Some(s) => {
					write!(f, "{ctx}: {s}")
				}
				None => {
					write!(f, "{ctx}")
				}
			},
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(value: std::io::Error) -> Self {
		Self::Process {
			source: Some(Box::new(value)),
			ctx: "file I/O failure".to_string(),
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(value: serde_json::Error) -> Self {
		Self::Json {
			path: None,
			source: value,
		}
	}
}

impl From<walkdir::Error> for Error {
	fn from(value: walkdir::Error) -> Self {
		Self::Scan(value)
	}
}

impl From<rayon::ThreadPoolBuildError> for Error {
	fn from(value: rayon::ThreadPoolBuildError) -> Self {
		Self::Process {
			source: Some(Box::new(value)),
			ctx: "failed to build the worker pool".to_string(),
		}
	}
}

/// Why a stage handler stopped without producing its payload.
///
/// Content errors are not represented here; handlers raise those as
/// [problems](crate::diag::Problem) and still return a payload.
#[derive(Debug)]
pub enum StageError {
	/// The workspace was [interrupted](crate::workspace::Workspace::interrupt).
	/// The result is not memoized, so a later request runs the handler again.
	Interrupted,
	/// A source could not be read.
	Io {
		path: PathBuf,
		source: std::io::Error,
	},
	/// Anything else a handler could not recover from.
	Fault(ErrorBox),
}

impl StageError {
	#[must_use]
	pub fn fault(msg: impl Into<String>) -> Self {
		Self::Fault(Box::new(MsgError(msg.into())))
	}
}

impl std::error::Error for StageError {}

impl std::fmt::Display for StageError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Interrupted => write!(f, "build interrupted"),
			Self::Io { path, source } => {
				write!(f, "failed to read `{}`: {source}", path.display())
			}
			Self::Fault(err) => write!(f, "{err}"),
		}
	}
}

impl From<std::io::Error> for StageError {
	fn from(value: std::io::Error) -> Self {
		Self::Fault(Box::new(value))
	}
}

#[derive(Debug)]
pub(crate) struct MsgError(pub(crate) String);

impl std::error::Error for MsgError {}

impl std::fmt::Display for MsgError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}
