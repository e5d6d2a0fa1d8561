//! [`QName`], the dotted qualified name every definition is registered under.

use std::{borrow::Borrow, sync::Arc};

/// A qualified name such as `com.acme.Widget`. Cheap to clone.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QName(Arc<str>);

impl QName {
	#[must_use]
	pub fn new(name: &str) -> Self {
		Self(Arc::from(name))
	}

	/// Joins a package and a base name. An empty package yields the base name.
	#[must_use]
	pub fn join(package: &str, base: &str) -> Self {
		if package.is_empty() {
			Self::new(base)
		} else {
			Self(Arc::from(format!("{package}.{base}")))
		}
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// The part after the last `.`.
	#[must_use]
	pub fn base_name(&self) -> &str {
		match self.0.rfind('.') {
			Some(i) => &self.0[(i + 1)..],
			None => &self.0,
		}
	}

	/// Everything before the last `.`, or an empty string.
	#[must_use]
	pub fn package(&self) -> &str {
		match self.0.rfind('.') {
			Some(i) => &self.0[..i],
			None => "",
		}
	}

	/// `true` for an import-style `pkg.*` name.
	#[must_use]
	pub fn is_wildcard(&self) -> bool {
		self.base_name() == "*"
	}
}

impl std::fmt::Debug for QName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "`{}`", self.0)
	}
}

impl std::fmt::Display for QName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl Borrow<str> for QName {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl From<&str> for QName {
	fn from(value: &str) -> Self {
		Self::new(value)
	}
}

impl From<String> for QName {
	fn from(value: String) -> Self {
		Self(Arc::from(value))
	}
}
