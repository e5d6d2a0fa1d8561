//! [`PathInterner`], [`PathIx`] and path helpers.

use std::{
	borrow::Borrow,
	hash::{Hash, Hasher},
	path::{Component, Path, PathBuf},
};

use append_only_vec::AppendOnlyVec;

use crate::{names::QName, FxDashMap};

/// An index into a [`PathInterner`]. Acts as a unique identifier for files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathIx(u32);

/// A concurrent interner for normalized filesystem paths, allowing
/// [32-bit indices](PathIx) to be used as map keys in place of paths.
pub struct PathInterner {
	array: AppendOnlyVec<PathArc>,
	map: FxDashMap<PathArc, PathIx>,
}

impl Default for PathInterner {
	fn default() -> Self {
		Self {
			array: AppendOnlyVec::new(),
			map: FxDashMap::default(),
		}
	}
}

impl std::fmt::Debug for PathInterner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PathInterner")
			.field("len", &self.map.len())
			.finish()
	}
}

impl PathInterner {
	/// `path` is [normalized](normalize) first.
	#[must_use]
	pub fn intern(&self, path: &Path) -> PathIx {
		self.add(PathArc::from(normalize(path).as_path()))
	}

	#[must_use]
	pub fn get(&self, path: &Path) -> Option<PathIx> {
		let norm = normalize(path);
		self.map.get(norm.as_path()).map(|r| *r.value())
	}

	#[must_use]
	fn add(&self, path: PathArc) -> PathIx {
		let vac = match self.map.entry(path.clone()) {
			dashmap::mapref::entry::Entry::Occupied(occ) => return *occ.get(),
			dashmap::mapref::entry::Entry::Vacant(vac) => vac,
		};

		let ix = self.array.push(path);
		debug_assert!(ix < (u32::MAX as usize));
		let ret = PathIx(ix as u32);
		vac.insert(ret);
		ret
	}

	#[must_use]
	pub fn resolve(&self, ix: PathIx) -> &Path {
		self.array[ix.0 as usize].as_path()
	}
}

#[derive(Clone)]
struct PathArc(triomphe::ThinArc<(), u8>);

impl PathArc {
	#[must_use]
	fn as_str(&self) -> &str {
		// SAFETY: All constructions of this type go through `to_string_lossy`.
		unsafe { std::str::from_utf8_unchecked(&self.0.slice) }
	}

	#[must_use]
	fn as_path(&self) -> &Path {
		Path::new(self.as_str())
	}
}

impl From<&Path> for PathArc {
	fn from(value: &Path) -> Self {
		Self(triomphe::ThinArc::from_header_and_slice(
			(),
			value.to_string_lossy().as_bytes(),
		))
	}
}

impl Borrow<Path> for PathArc {
	fn borrow(&self) -> &Path {
		self.as_path()
	}
}

impl PartialEq for PathArc {
	fn eq(&self, other: &Self) -> bool {
		self.as_path() == other.as_path()
	}
}

impl Eq for PathArc {}

impl Hash for PathArc {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.as_path().hash(state)
	}
}

/// Makes `path` absolute against the current directory and folds away `.` and
/// `..` components lexically. Symbolic links are left alone.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
	let joined;

	let path = if path.is_relative() {
		joined = std::env::current_dir()
			.map(|cwd| cwd.join(path))
			.unwrap_or_else(|_| path.to_path_buf());
		joined.as_path()
	} else {
		path
	};

	let mut ret = PathBuf::new();

	for comp in path.components() {
		match comp {
			Component::CurDir => {}
			Component::ParentDir => {
				ret.pop();
			}
			other => ret.push(other.as_os_str()),
		}
	}

	ret
}

/// Results are only valid for absolute paths; will always return `false` if
/// either is relative. A path can not be a child of itself; giving two equal
/// paths will also return `false`.
#[must_use]
pub fn path_is_child_of(longer: &Path, shorter: &Path) -> bool {
	if longer.is_relative() | shorter.is_relative() {
		return false;
	}

	if longer == shorter {
		return false;
	}

	let mut a_comps = longer.components();

	for comp in shorter.components() {
		let Some(self_comp) = a_comps.next() else {
			return false;
		};

		if self_comp != comp {
			return false;
		}
	}

	true
}

/// `com/acme/Foo.src` under `root` becomes `com.acme.Foo`.
/// Returns `None` if `path` is not under `root` or has a non-UTF-8 component.
#[must_use]
pub fn qname_from_relative(root: &Path, path: &Path) -> Option<QName> {
	let rel = path.strip_prefix(root).ok()?;
	let stem = rel.file_stem()?.to_str()?;
	let mut parts = vec![];

	if let Some(parent) = rel.parent() {
		for comp in parent.components() {
			let Component::Normal(c) = comp else {
				return None;
			};

			parts.push(c.to_str()?);
		}
	}

	Some(QName::join(&parts.join("."), stem))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn normalization() {
		assert_eq!(
			normalize(Path::new("/proj/src/./pkg/../a.src")),
			PathBuf::from("/proj/src/a.src")
		);

		let interner = PathInterner::default();
		let a = interner.intern(Path::new("/proj/src/a.src"));
		let b = interner.intern(Path::new("/proj/src/pkg/../a.src"));
		assert_eq!(a, b);
		assert_eq!(interner.resolve(a), Path::new("/proj/src/a.src"));
		assert_eq!(interner.get(Path::new("/proj/./src/a.src")), Some(a));
		assert_eq!(interner.get(Path::new("/proj/b.src")), None);
	}

	#[test]
	fn children() {
		assert!(path_is_child_of(Path::new("/a/b/c"), Path::new("/a/b")));
		assert!(!path_is_child_of(Path::new("/a/b"), Path::new("/a/b")));
		assert!(!path_is_child_of(Path::new("/a/x/c"), Path::new("/a/b")));
		assert!(!path_is_child_of(Path::new("a/b/c"), Path::new("a/b")));
	}

	#[test]
	fn relative_qnames() {
		let root = Path::new("/proj/src");

		assert_eq!(
			qname_from_relative(root, Path::new("/proj/src/com/acme/Foo.src")),
			Some(QName::new("com.acme.Foo"))
		);

		assert_eq!(
			qname_from_relative(root, Path::new("/proj/src/Main.src")),
			Some(QName::new("Main"))
		);

		assert_eq!(qname_from_relative(root, Path::new("/other/Foo.src")), None);
	}
}
