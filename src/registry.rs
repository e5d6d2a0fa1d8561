//! [`SymbolRegistry`]: which unit provides each qualified name.
//!
//! Every name maps to a list of candidates sorted from highest to lowest
//! [priority](DefinitionPriority). The head of the list is visible; the rest
//! are shadowed, and get promoted when the head's unit retracts.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::{names::QName, priority::DefinitionPriority, unit::Definition, FxIndexSet, UnitId};

/// What a unit contributes under one name.
#[derive(Debug, Clone)]
pub enum DefinitionRef {
	/// Known before the unit is built; materialized by its file-scope stage.
	Promise(QName),
	Actual(Arc<Definition>),
}

impl DefinitionRef {
	#[must_use]
	pub fn qname(&self) -> &QName {
		match self {
			Self::Promise(qname) => qname,
			Self::Actual(def) => &def.qname,
		}
	}

	#[must_use]
	pub fn is_promise(&self) -> bool {
		matches!(self, Self::Promise(_))
	}
}

#[derive(Debug, Clone)]
pub struct Resolution {
	pub unit: UnitId,
	pub definition: DefinitionRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
	/// Now visible. `superseded` held the name before, if anything did.
	Visible { superseded: Option<UnitId> },
	Shadowed { by: UnitId },
	/// `with` registered first at equal priority and stays visible.
	Collision { with: UnitId },
}

#[derive(Debug, Clone)]
struct Candidate {
	unit: UnitId,
	priority: DefinitionPriority,
	def: DefinitionRef,
}

#[derive(Debug, Default)]
struct Inner {
	names: FxHashMap<QName, Vec<Candidate>>,
	by_unit: FxHashMap<UnitId, FxIndexSet<QName>>,
}

#[derive(Debug, Default)]
pub struct SymbolRegistry {
	inner: RwLock<Inner>,
}

impl SymbolRegistry {
	/// A unit registering a name it already holds replaces its own candidate,
	/// which is how promises become actual definitions.
	pub fn register(
		&self,
		def: DefinitionRef,
		unit: UnitId,
		priority: DefinitionPriority,
	) -> Registration {
		let mut guard = self.inner.write();
		let inner = &mut *guard;
		let qname = def.qname().clone();

		inner
			.by_unit
			.entry(unit)
			.or_default()
			.insert(qname.clone());

		let cands = inner.names.entry(qname).or_default();

		if let Some(pos) = cands.iter().position(|c| c.unit == unit) {
			cands[pos].def = def;

			return if pos == 0 {
				Registration::Visible { superseded: None }
			} else {
				Registration::Shadowed { by: cands[0].unit }
			};
		}

		let prev = cands.first().map(|c| c.unit);
		let tie = cands.iter().find(|c| c.priority == priority).map(|c| c.unit);

		// After every candidate of equal or greater priority.
		let pos = cands
			.iter()
			.position(|c| c.priority < priority)
			.unwrap_or(cands.len());

		cands.insert(
			pos,
			Candidate {
				unit,
				priority,
				def,
			},
		);

		if let Some(with) = tie {
			Registration::Collision { with }
		} else if pos == 0 {
			Registration::Visible { superseded: prev }
		} else {
			Registration::Shadowed { by: cands[0].unit }
		}
	}

	/// Retracts every candidate `unit` holds. Returns the names whose visible
	/// provider changed or vanished as a result.
	pub fn remove_unit(&self, unit: UnitId) -> Vec<QName> {
		let mut guard = self.inner.write();
		let inner = &mut *guard;

		let Some(names) = inner.by_unit.remove(&unit) else {
			return vec![];
		};

		let mut ret = vec![];

		for qname in names {
			let Some(cands) = inner.names.get_mut(&qname) else {
				continue;
			};

			let was_visible = cands.first().is_some_and(|c| c.unit == unit);
			cands.retain(|c| c.unit != unit);

			if cands.is_empty() {
				inner.names.remove(&qname);
			}

			if was_visible {
				ret.push(qname);
			}
		}

		ret
	}

	#[must_use]
	pub fn resolve(&self, qname: &str) -> Option<Resolution> {
		let inner = self.inner.read();
		let head = inner.names.get(qname)?.first()?;

		Some(Resolution {
			unit: head.unit,
			definition: head.def.clone(),
		})
	}

	#[must_use]
	pub fn owner_of(&self, qname: &str) -> Option<UnitId> {
		self.inner
			.read()
			.names
			.get(qname)
			.and_then(|c| c.first())
			.map(|c| c.unit)
	}

	/// Every unit holding `qname`, visible one first.
	#[must_use]
	pub fn candidates(&self, qname: &str) -> Vec<UnitId> {
		self.inner
			.read()
			.names
			.get(qname)
			.map(|cands| cands.iter().map(|c| c.unit).collect())
			.unwrap_or_default()
	}

	/// Names `unit` holds, visible or not, in registration order.
	#[must_use]
	pub fn names_of(&self, unit: UnitId) -> Vec<QName> {
		self.inner
			.read()
			.by_unit
			.get(&unit)
			.map(|names| names.iter().cloned().collect())
			.unwrap_or_default()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.inner.read().names.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod test {
	use slotmap::SlotMap;

	use super::*;
	use crate::unit::DefinitionKind;

	fn actual(name: &str) -> DefinitionRef {
		DefinitionRef::Actual(Arc::new(Definition {
			qname: QName::new(name),
			kind: DefinitionKind::Class,
			line: None,
		}))
	}

	#[test]
	fn shadowing_is_order_independent() {
		let mut arena = SlotMap::<UnitId, ()>::with_key();
		let list = arena.insert(());
		let lib = arena.insert(());
		let list_prio = DefinitionPriority::source_list();
		let lib_prio = DefinitionPriority::library(0, 5);

		let first = SymbolRegistry::default();
		first.register(DefinitionRef::Promise(QName::new("pkg.A")), lib, lib_prio);
		let reg = first.register(actual("pkg.A"), list, list_prio);
		assert_eq!(reg, Registration::Visible { superseded: Some(lib) });

		let second = SymbolRegistry::default();
		second.register(actual("pkg.A"), list, list_prio);
		let reg = second.register(DefinitionRef::Promise(QName::new("pkg.A")), lib, lib_prio);
		assert_eq!(reg, Registration::Shadowed { by: list });

		for r in [&first, &second] {
			let res = r.resolve("pkg.A").unwrap();
			assert_eq!(res.unit, list);
			assert!(!res.definition.is_promise());
			assert_eq!(r.candidates("pkg.A"), [list, lib]);
		}

		let changed = first.remove_unit(list);
		assert_eq!(changed, [QName::new("pkg.A")]);
		let res = first.resolve("pkg.A").unwrap();
		assert_eq!(res.unit, lib);
		assert!(res.definition.is_promise());
	}

	#[test]
	fn collision_keeps_first() {
		let mut arena = SlotMap::<UnitId, ()>::with_key();
		let a = arena.insert(());
		let b = arena.insert(());
		let prio = DefinitionPriority::source_list();
		let reg = SymbolRegistry::default();

		assert_eq!(
			reg.register(actual("pkg.Dup"), a, prio),
			Registration::Visible { superseded: None }
		);
		assert_eq!(
			reg.register(actual("pkg.Dup"), b, prio),
			Registration::Collision { with: a }
		);
		assert_eq!(reg.owner_of("pkg.Dup"), Some(a));

		reg.remove_unit(a);
		assert_eq!(reg.owner_of("pkg.Dup"), Some(b));
		reg.remove_unit(b);
		assert!(reg.is_empty());
		assert!(reg.remove_unit(b).is_empty());
	}

	#[test]
	fn promise_becomes_actual() {
		let mut arena = SlotMap::<UnitId, ()>::with_key();
		let u = arena.insert(());
		let reg = SymbolRegistry::default();
		let prio = DefinitionPriority::source_path(0);

		reg.register(DefinitionRef::Promise(QName::new("com.acme.Foo")), u, prio);
		assert!(reg.resolve("com.acme.Foo").unwrap().definition.is_promise());
		reg.register(actual("com.acme.Foo"), u, prio);
		assert!(!reg.resolve("com.acme.Foo").unwrap().definition.is_promise());
		assert_eq!(reg.candidates("com.acme.Foo"), [u]);
		assert_eq!(reg.names_of(u), [QName::new("com.acme.Foo")]);
	}
}
