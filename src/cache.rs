//! [`LibraryCache`]: prebuilt library entries, keyed by container and entry.

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::Error, FxDashMap, UnitResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
	pub container: PathBuf,
	pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
	/// Milliseconds since the Unix epoch at which the entry was built.
	pub timestamp: u64,
	/// What the entry defines, in declaration order.
	pub qnames: Vec<String>,
	pub bytes: Vec<u8>,
}

/// The on-disk form: a flat list, sorted by key.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
	container: PathBuf,
	entry: String,
	#[serde(flatten)]
	cached: CachedEntry,
}

#[derive(Debug, Default)]
pub struct LibraryCache {
	entries: FxDashMap<CacheKey, Arc<CachedEntry>>,
}

impl LibraryCache {
	#[must_use]
	pub fn get(&self, container: &Path, entry: &str) -> Option<Arc<CachedEntry>> {
		let key = CacheKey {
			container: crate::paths::normalize(container),
			entry: entry.to_string(),
		};

		self.entries.get(&key).map(|e| e.value().clone())
	}

	/// Keeps whichever of the old and new entries is newer.
	pub fn insert(&self, container: &Path, entry: impl Into<String>, cached: CachedEntry) {
		let key = CacheKey {
			container: crate::paths::normalize(container),
			entry: entry.into(),
		};

		self.entries
			.entry(key)
			.and_modify(|prev| {
				if cached.timestamp >= prev.timestamp {
					*prev = Arc::new(cached.clone());
				}
			})
			.or_insert_with(|| Arc::new(cached.clone()));
	}

	/// Every entry of `container`, sorted by entry name.
	#[must_use]
	pub fn entries_of(&self, container: &Path) -> Vec<(String, Arc<CachedEntry>)> {
		let container = crate::paths::normalize(container);

		let mut ret: Vec<_> = self
			.entries
			.iter()
			.filter(|kvp| kvp.key().container == container)
			.map(|kvp| (kvp.key().entry.clone(), kvp.value().clone()))
			.collect();

		ret.sort_by(|a, b| a.0.cmp(&b.0));
		ret
	}

	pub fn remove_container(&self, container: &Path) -> usize {
		let container = crate::paths::normalize(container);
		let before = self.entries.len();
		self.entries.retain(|k, _| k.container != container);
		before - self.entries.len()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub(crate) fn save(&self, path: &Path) -> UnitResult {
		let mut records: Vec<Record> = self
			.entries
			.iter()
			.map(|kvp| Record {
				container: kvp.key().container.clone(),
				entry: kvp.key().entry.clone(),
				cached: CachedEntry::clone(kvp.value()),
			})
			.collect();

		records.sort_by(|a, b| (&a.container, &a.entry).cmp(&(&b.container, &b.entry)));

		let json = serde_json::to_vec_pretty(&records).map_err(|err| Error::json(path, err))?;
		std::fs::write(path, json).map_err(|err| Error::io(path, err))?;

		info!(
			"Saved {} library cache entries to `{}`.",
			records.len(),
			path.display()
		);

		Ok(())
	}

	/// Merges the file's entries into this cache.
	pub(crate) fn load(&self, path: &Path) -> UnitResult {
		let bytes = std::fs::read(path).map_err(|err| Error::io(path, err))?;
		let records: Vec<Record> =
			serde_json::from_slice(&bytes).map_err(|err| Error::json(path, err))?;
		let count = records.len();

		for record in records {
			self.insert(&record.container, record.entry, record.cached);
		}

		info!(
			"Loaded {count} library cache entries from `{}`.",
			path.display()
		);

		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn entry(timestamp: u64, qname: &str) -> CachedEntry {
		CachedEntry {
			timestamp,
			qnames: vec![qname.to_string()],
			bytes: format!("def class {qname}\n").into_bytes(),
		}
	}

	#[test]
	fn newer_entries_win() {
		let cache = LibraryCache::default();
		let lib = Path::new("/libs/core.lib");

		cache.insert(lib, "A", entry(20, "core.A"));
		cache.insert(lib, "A", entry(10, "core.Old"));
		assert_eq!(cache.get(lib, "A").unwrap().qnames, ["core.A"]);

		cache.insert(lib, "A", entry(30, "core.New"));
		assert_eq!(cache.get(lib, "A").unwrap().qnames, ["core.New"]);
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn save_and_load() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("cache.json");
		let lib = Path::new("/libs/core.lib");
		let other = Path::new("/libs/extra.lib");

		let cache = LibraryCache::default();
		cache.insert(lib, "B", entry(2, "core.B"));
		cache.insert(lib, "A", entry(1, "core.A"));
		cache.insert(other, "C", entry(3, "extra.C"));
		cache.save(&file).unwrap();

		let loaded = LibraryCache::default();
		loaded.load(&file).unwrap();
		assert_eq!(loaded.len(), 3);

		let names: Vec<_> = loaded.entries_of(lib).into_iter().map(|(e, _)| e).collect();
		assert_eq!(names, ["A", "B"]);
		assert_eq!(*loaded.get(other, "C").unwrap(), entry(3, "extra.C"));

		assert_eq!(loaded.remove_container(lib), 2);
		assert!(loaded.entries_of(lib).is_empty());
	}

	#[test]
	fn malformed_file() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("cache.json");
		std::fs::write(&file, "{ not json").unwrap();

		let cache = LibraryCache::default();
		assert!(matches!(cache.load(&file), Err(Error::Json { .. })));
	}
}
