//! [`DefinitionPriority`], deciding which unit wins a contested name.

use serde::{Deserialize, Serialize};

/// Where a unit's source was found. Declared lowest-priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasePriority {
	LibraryPath,
	SourcePath,
	SourceList,
}

/// Totally ordered; the greater priority wins.
///
/// Within a base class, the lower `order` (the position of the unit's root or
/// container in the project configuration) wins. Ties there fall to the newer
/// `timestamp`, which only library entries carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefinitionPriority {
	pub base: BasePriority,
	pub order: u32,
	/// Milliseconds since the Unix epoch.
	pub timestamp: Option<u64>,
}

impl DefinitionPriority {
	#[must_use]
	pub fn source_list() -> Self {
		Self {
			base: BasePriority::SourceList,
			order: 0,
			timestamp: None,
		}
	}

	#[must_use]
	pub fn source_path(order: u32) -> Self {
		Self {
			base: BasePriority::SourcePath,
			order,
			timestamp: None,
		}
	}

	#[must_use]
	pub fn library(order: u32, timestamp: u64) -> Self {
		Self {
			base: BasePriority::LibraryPath,
			order,
			timestamp: Some(timestamp),
		}
	}
}

impl PartialOrd for DefinitionPriority {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for DefinitionPriority {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.base
			.cmp(&other.base)
			.then_with(|| other.order.cmp(&self.order))
			.then_with(|| self.timestamp.cmp(&other.timestamp))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn ordering() {
		let list = DefinitionPriority::source_list();
		let path0 = DefinitionPriority::source_path(0);
		let path1 = DefinitionPriority::source_path(1);
		let lib_old = DefinitionPriority::library(0, 1_000);
		let lib_new = DefinitionPriority::library(0, 2_000);
		let lib_late = DefinitionPriority::library(1, 9_000);

		assert!(list > path0);
		assert!(path0 > path1);
		assert!(path1 > lib_new);
		assert!(lib_new > lib_old);
		assert!(lib_old > lib_late);

		let mut v = vec![lib_late, path1, list, lib_old, path0, lib_new];
		v.sort_by(|a, b| b.cmp(a));
		assert_eq!(v, [list, path0, path1, lib_new, lib_old, lib_late]);
	}
}
