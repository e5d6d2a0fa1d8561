//! [`DependencyGraph`]: typed edges between the units of one project.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use petgraph::{graphmap::DiGraphMap, Direction};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{names::QName, FxIndexSet, UnitId};

bitflags::bitflags! {
	/// Why one unit needs another.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct DependencyKinds: u8 {
		/// Extends or implements a definition of the target.
		const INHERITANCE = 1 << 0;
		/// Mentions a target definition in a type annotation or signature.
		const SIGNATURE = 1 << 1;
		/// Opens or qualifies by one of the target's namespaces.
		const NAMESPACE = 1 << 2;
		/// Uses a target definition in a body only.
		const EXPRESSION = 1 << 3;
	}
}

impl DependencyKinds {
	/// The kinds whose targets, when changed, invalidate the source as well
	/// as the source's own dependents of these kinds.
	pub const TRANSITIVE: Self = Self::INHERITANCE
		.union(Self::SIGNATURE)
		.union(Self::NAMESPACE);
}

#[derive(Debug, Clone, Default)]
pub struct Edge {
	pub kinds: DependencyKinds,
	/// Which of the target's definitions were referenced, and how.
	pub names: BTreeMap<QName, DependencyKinds>,
}

/// Units in dependency order, with any cycles that had to be broken.
#[derive(Debug, Default)]
pub struct TopoOrder {
	pub units: Vec<UnitId>,
	/// Each cycle lists its members starting at the first one reached.
	pub cycles: Vec<Vec<UnitId>>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
	inner: RwLock<DiGraphMap<UnitId, Edge>>,
}

impl DependencyGraph {
	pub(crate) fn add_unit(&self, unit: UnitId) {
		self.inner.write().add_node(unit);
	}

	/// Removes `unit` and every edge touching it.
	pub(crate) fn remove_unit(&self, unit: UnitId) {
		self.inner.write().remove_node(unit);
	}

	/// Self-edges are ignored.
	pub fn add_edge(&self, from: UnitId, to: UnitId, kind: DependencyKinds, qname: Option<QName>) {
		if from == to {
			return;
		}

		let mut graph = self.inner.write();

		if let Some(edge) = graph.edge_weight_mut(from, to) {
			edge.kinds |= kind;

			if let Some(qname) = qname {
				*edge.names.entry(qname).or_default() |= kind;
			}

			return;
		}

		let mut edge = Edge {
			kinds: kind,
			names: BTreeMap::new(),
		};

		if let Some(qname) = qname {
			edge.names.insert(qname, kind);
		}

		graph.add_edge(from, to, edge);
	}

	/// Leaves incoming edges in place.
	pub fn remove_edges_from(&self, unit: UnitId) {
		let mut graph = self.inner.write();

		let targets: Vec<_> = graph
			.neighbors_directed(unit, Direction::Outgoing)
			.collect();

		for target in targets {
			graph.remove_edge(unit, target);
		}
	}

	#[must_use]
	pub fn edge(&self, from: UnitId, to: UnitId) -> Option<Edge> {
		self.inner.read().edge_weight(from, to).cloned()
	}

	#[must_use]
	pub fn contains(&self, unit: UnitId) -> bool {
		self.inner.read().contains_node(unit)
	}

	#[must_use]
	pub fn direct_dependencies(&self, unit: UnitId) -> Vec<UnitId> {
		let graph = self.inner.read();

		if !graph.contains_node(unit) {
			return vec![];
		}

		graph
			.neighbors_directed(unit, Direction::Outgoing)
			.collect()
	}

	/// Units with an edge to `unit` carrying any of `kinds`.
	#[must_use]
	pub fn direct_dependents(&self, unit: UnitId, kinds: DependencyKinds) -> Vec<UnitId> {
		let graph = self.inner.read();

		if !graph.contains_node(unit) {
			return vec![];
		}

		graph
			.neighbors_directed(unit, Direction::Incoming)
			.filter(|from| {
				graph
					.edge_weight(*from, unit)
					.is_some_and(|edge| edge.kinds.intersects(kinds))
			})
			.collect()
	}

	/// Everything that must be cleaned when `roots` change: the roots, every
	/// direct dependent of any kind, and, through inheritance, signature and
	/// namespace edges, the dependents of those dependents.
	#[must_use]
	pub fn invalidation_set(&self, roots: &[UnitId]) -> FxIndexSet<UnitId> {
		let graph = self.inner.read();
		let mut ret = FxIndexSet::default();
		let mut transitive = FxHashSet::default();
		let mut stack: Vec<UnitId> = roots.to_vec();

		for root in roots {
			ret.insert(*root);
		}

		while let Some(unit) = stack.pop() {
			if !transitive.insert(unit) || !graph.contains_node(unit) {
				continue;
			}

			for from in graph.neighbors_directed(unit, Direction::Incoming) {
				ret.insert(from);

				let transitive_edge = graph
					.edge_weight(from, unit)
					.is_some_and(|edge| edge.kinds.intersects(DependencyKinds::TRANSITIVE));

				if transitive_edge {
					stack.push(from);
				}
			}
		}

		ret
	}

	/// Orders `subset` so that every unit follows the units it depends on.
	/// Edges leaving `subset` are ignored. Roots and siblings are visited in
	/// ascending `key` order, so the result depends only on the graph and the
	/// keys. A cycle is broken at the edge that closes it.
	#[must_use]
	pub fn stable_topo_order<K: Ord>(
		&self,
		subset: &[UnitId],
		key: impl Fn(UnitId) -> K,
	) -> TopoOrder {
		#[derive(Clone, Copy, PartialEq, Eq)]
		enum Mark {
			Unvisited,
			InProgress,
			Done,
		}

		/// Dependencies of `unit` inside the subset, in ascending key order.
		fn deps_of<K: Ord>(
			graph: &DiGraphMap<UnitId, Edge>,
			keys: &FxHashMap<UnitId, K>,
			unit: UnitId,
		) -> Vec<UnitId> {
			if !graph.contains_node(unit) {
				return vec![];
			}

			let mut ret: Vec<UnitId> = graph
				.neighbors_directed(unit, Direction::Outgoing)
				.filter(|d| keys.contains_key(d))
				.collect();

			ret.sort_by(|a, b| keys[a].cmp(&keys[b]));
			ret
		}

		/// A unit being visited, its dependencies, and how many of those
		/// have been looked at.
		struct Frame {
			unit: UnitId,
			deps: Vec<UnitId>,
			next: usize,
		}

		let graph = self.inner.read();

		let mut roots: Vec<UnitId> = subset.to_vec();
		roots.sort_by_cached_key(|u| (key(*u), *u));
		roots.dedup();

		let keys: FxHashMap<UnitId, K> = roots.iter().map(|u| (*u, key(*u))).collect();
		let mut marks: FxHashMap<UnitId, Mark> =
			roots.iter().map(|u| (*u, Mark::Unvisited)).collect();
		let mut frames: Vec<Frame> = vec![];
		let mut out = TopoOrder::default();

		for root in roots {
			if marks[&root] != Mark::Unvisited {
				continue;
			}

			marks.insert(root, Mark::InProgress);

			frames.push(Frame {
				unit: root,
				deps: deps_of(&graph, &keys, root),
				next: 0,
			});

			while let Some(frame) = frames.last_mut() {
				let Some(dep) = frame.deps.get(frame.next).copied() else {
					let unit = frame.unit;
					frames.pop();
					marks.insert(unit, Mark::Done);
					out.units.push(unit);
					continue;
				};

				frame.next += 1;

				match marks[&dep] {
					Mark::Unvisited => {
						marks.insert(dep, Mark::InProgress);

						frames.push(Frame {
							unit: dep,
							deps: deps_of(&graph, &keys, dep),
							next: 0,
						});
					}
					Mark::InProgress => {
						let start = frames
							.iter()
							.position(|f| f.unit == dep)
							.unwrap_or_default();
						out.cycles
							.push(frames[start..].iter().map(|f| f.unit).collect());
					}
					Mark::Done => {}
				}
			}
		}

		out
	}

	#[must_use]
	pub fn edge_count(&self) -> usize {
		self.inner.read().edge_count()
	}
}

#[cfg(test)]
mod test {
	use slotmap::SlotMap;

	use super::*;

	fn units(n: usize) -> Vec<UnitId> {
		let mut arena = SlotMap::<UnitId, ()>::with_key();
		(0..n).map(|_| arena.insert(())).collect()
	}

	#[test]
	fn edges() {
		let u = units(3);
		let g = DependencyGraph::default();
		let q = QName::new("pkg.B");

		g.add_edge(u[0], u[1], DependencyKinds::EXPRESSION, Some(q.clone()));
		g.add_edge(u[0], u[1], DependencyKinds::INHERITANCE, Some(q.clone()));
		g.add_edge(u[0], u[0], DependencyKinds::EXPRESSION, None);
		g.add_edge(u[2], u[0], DependencyKinds::SIGNATURE, None);

		let edge = g.edge(u[0], u[1]).unwrap();
		assert_eq!(
			edge.kinds,
			DependencyKinds::EXPRESSION | DependencyKinds::INHERITANCE
		);
		assert_eq!(edge.names[&q], edge.kinds);
		assert!(g.edge(u[0], u[0]).is_none());
		assert_eq!(g.edge_count(), 2);

		assert_eq!(g.direct_dependencies(u[0]), [u[1]]);
		assert_eq!(
			g.direct_dependents(u[1], DependencyKinds::INHERITANCE),
			[u[0]]
		);
		assert!(g
			.direct_dependents(u[1], DependencyKinds::NAMESPACE)
			.is_empty());

		g.remove_edges_from(u[0]);
		assert!(g.direct_dependencies(u[0]).is_empty());
		assert_eq!(g.direct_dependents(u[0], DependencyKinds::all()), [u[2]]);
	}

	#[test]
	fn invalidation() {
		// 1 extends 0; 2 uses 1 in a body; 3 uses 2 in a body.
		let u = units(4);
		let g = DependencyGraph::default();
		g.add_edge(u[1], u[0], DependencyKinds::INHERITANCE, None);
		g.add_edge(u[2], u[1], DependencyKinds::EXPRESSION, None);
		g.add_edge(u[3], u[2], DependencyKinds::EXPRESSION, None);

		let set = g.invalidation_set(&[u[0]]);
		assert!(set.contains(&u[0]));
		assert!(set.contains(&u[1]));
		assert!(set.contains(&u[2]));
		assert!(!set.contains(&u[3]));
	}

	#[test]
	fn topo_order_is_stable() {
		let u = units(5);
		let names = ["e", "d", "c", "b", "a"];
		let key = |id: UnitId| names[u.iter().position(|x| *x == id).unwrap()];
		let g = DependencyGraph::default();

		// a -> c, b -> c, c -> e, d independent.
		g.add_edge(u[4], u[2], DependencyKinds::INHERITANCE, None);
		g.add_edge(u[3], u[2], DependencyKinds::EXPRESSION, None);
		g.add_edge(u[2], u[0], DependencyKinds::SIGNATURE, None);

		let first = g.stable_topo_order(&u, key);
		let mut shuffled = u.clone();
		shuffled.reverse();
		let second = g.stable_topo_order(&shuffled, key);

		let order: Vec<_> = first.units.iter().map(|id| key(*id)).collect();
		assert_eq!(order, ["e", "c", "a", "b", "d"]);
		assert_eq!(first.units, second.units);
		assert!(first.cycles.is_empty());
	}

	#[test]
	fn cycles_are_broken() {
		let u = units(3);
		let names = ["x", "y", "z"];
		let key = |id: UnitId| names[u.iter().position(|x| *x == id).unwrap()];
		let g = DependencyGraph::default();
		g.add_edge(u[0], u[1], DependencyKinds::EXPRESSION, None);
		g.add_edge(u[1], u[2], DependencyKinds::EXPRESSION, None);
		g.add_edge(u[2], u[0], DependencyKinds::EXPRESSION, None);

		let out = g.stable_topo_order(&u, key);
		assert_eq!(out.units, [u[2], u[1], u[0]]);
		assert_eq!(out.cycles, [vec![u[0], u[1], u[2]]]);
	}

	#[test]
	fn long_chains() {
		const LEN: usize = 100_000;

		let u = units(LEN);
		let g = DependencyGraph::default();

		for pair in u.windows(2) {
			g.add_edge(pair[0], pair[1], DependencyKinds::INHERITANCE, None);
		}

		let out = g.stable_topo_order(&u, |id| id);
		assert_eq!(out.units.len(), LEN);
		assert_eq!(out.units[0], u[LEN - 1]);
		assert_eq!(out.units[LEN - 1], u[0]);
		assert!(out.cycles.is_empty());

		assert_eq!(g.invalidation_set(&[u[LEN - 1]]).len(), LEN);
	}
}
