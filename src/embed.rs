//! Embedded assets and resource bundles.
//!
//! Code may reference files to be packaged beside it. Each distinct
//! [`EmbedDescription`] becomes one synthetic unit, shared by every unit that
//! references it and removed once nothing does.

use std::{
	collections::BTreeMap,
	hash::{Hash, Hasher},
	path::PathBuf,
};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use crate::{names::QName, unit::UnitKind, FxIndexSet, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EmbedKind {
	Asset,
	ResourceBundle,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbedDescription {
	pub kind: EmbedKind,
	/// Normalized and absolute.
	pub source: PathBuf,
	pub attributes: BTreeMap<String, String>,
}

impl EmbedDescription {
	#[must_use]
	pub fn asset(source: PathBuf) -> Self {
		Self {
			kind: EmbedKind::Asset,
			source: crate::paths::normalize(&source),
			attributes: BTreeMap::new(),
		}
	}

	#[must_use]
	pub fn bundle(source: PathBuf) -> Self {
		Self {
			kind: EmbedKind::ResourceBundle,
			..Self::asset(source)
		}
	}

	#[must_use]
	pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.attributes.insert(key.into(), value.into());
		self
	}

	/// Equal for descriptions that would produce identical units, regardless
	/// of attribute order.
	#[must_use]
	pub fn canonical_key(&self) -> String {
		let kind = match self.kind {
			EmbedKind::Asset => "asset",
			EmbedKind::ResourceBundle => "bundle",
		};

		let mut ret = format!("{kind}|{}", self.source.display());

		for (k, v) in &self.attributes {
			ret.push('|');
			ret.push_str(k);
			ret.push('=');
			ret.push_str(v);
		}

		ret
	}

	/// The name the synthetic unit defines. Stable across runs.
	#[must_use]
	pub fn qname(&self) -> QName {
		let mut hasher = FxHasher::default();
		self.canonical_key().hash(&mut hasher);
		let stem = self
			.source
			.file_stem()
			.map(|s| s.to_string_lossy())
			.unwrap_or_default();
		let stem: String = stem
			.chars()
			.map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
			.collect();

		QName::from(format!("_embed.{stem}_{:016x}", hasher.finish()))
	}

	#[must_use]
	pub fn unit_kind(&self) -> UnitKind {
		match self.kind {
			EmbedKind::Asset => UnitKind::Embed,
			EmbedKind::ResourceBundle => UnitKind::ResourceBundle,
		}
	}
}

/// Canonical key to unit, plus the reverse references.
#[derive(Debug, Default)]
pub(crate) struct EmbedTable {
	inner: Mutex<EmbedInner>,
}

#[derive(Debug, Default)]
struct EmbedInner {
	by_key: FxHashMap<String, UnitId>,
	descs: FxHashMap<UnitId, EmbedDescription>,
	referrers: FxHashMap<UnitId, FxIndexSet<UnitId>>,
}

impl EmbedTable {
	/// Records `referrer` against the unit for `desc` and returns it, calling
	/// `create` if there is none yet. Lookup, creation and the new reference
	/// happen under one lock, so a concurrent [`EmbedTable::release`] cannot
	/// retire the unit in between.
	pub(crate) fn acquire(
		&self,
		desc: &EmbedDescription,
		referrer: UnitId,
		create: impl FnOnce() -> UnitId,
	) -> UnitId {
		let key = desc.canonical_key();
		let mut inner = self.inner.lock();

		let id = match inner.by_key.get(&key) {
			Some(id) => *id,
			None => {
				let id = create();
				inner.by_key.insert(key, id);
				inner.descs.insert(id, desc.clone());
				id
			}
		};

		inner.referrers.entry(id).or_default().insert(referrer);
		id
	}

	#[must_use]
	pub(crate) fn description(&self, embed: UnitId) -> Option<EmbedDescription> {
		self.inner.lock().descs.get(&embed).cloned()
	}

	/// Returns `true` if `embed` was left without referrers, in which case it
	/// has already been forgotten: later acquisitions of its description get
	/// a new unit, and the caller must remove this one.
	pub(crate) fn release(&self, embed: UnitId, referrer: UnitId) -> bool {
		let mut inner = self.inner.lock();

		if let Some(refs) = inner.referrers.get_mut(&embed) {
			refs.shift_remove(&referrer);

			if !refs.is_empty() {
				return false;
			}
		}

		if !inner.descs.contains_key(&embed) {
			// Forgotten by another release.
			return false;
		}

		Self::forget_locked(&mut inner, embed);
		true
	}

	pub(crate) fn forget(&self, embed: UnitId) {
		Self::forget_locked(&mut self.inner.lock(), embed);
	}

	fn forget_locked(inner: &mut EmbedInner, embed: UnitId) {
		inner.referrers.remove(&embed);

		if let Some(desc) = inner.descs.remove(&embed) {
			inner.by_key.remove(&desc.canonical_key());
		}
	}

	#[must_use]
	pub(crate) fn referrers(&self, embed: UnitId) -> Vec<UnitId> {
		self.inner
			.lock()
			.referrers
			.get(&embed)
			.map(|r| r.iter().copied().collect())
			.unwrap_or_default()
	}
}
