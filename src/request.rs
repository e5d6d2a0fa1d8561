//! [`RequestSlot`]: the memoizing cell behind each stage of a unit, and the
//! [`WaitGraph`] that keeps blocking waits between stages from deadlocking.
//!
//! A slot holds at most one [`Request`] per generation. Whoever installs it,
//! or finds it installed but unclaimed, may claim it and run the handler; all
//! other callers block on the request's condition variable. A worker that
//! would block on a stage already running further up its own wait chain gets
//! a cycle error instead.

use std::{
	sync::{
		atomic::{self, AtomicBool},
		Arc,
	},
	thread::ThreadId,
	time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::{project::ProjectId, unit::Stage, UnitId};

/// Identifies one stage of one unit across every project in a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StageKey {
	pub(crate) project: ProjectId,
	pub(crate) unit: UnitId,
	pub(crate) stage: Stage,
}

// RequestSlot /////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub(crate) struct RequestSlot<T> {
	current: Mutex<Option<Arc<Request<T>>>>,
	/// Set for the file-scope stage of tree-built units: the syntax tree must
	/// be requested before this slot's request is installed.
	pub(crate) needs_predecessor: bool,
}

impl<T> RequestSlot<T> {
	#[must_use]
	pub(crate) fn new(needs_predecessor: bool) -> Self {
		Self {
			current: Mutex::new(None),
			needs_predecessor,
		}
	}

	/// The second element is `true` if this call installed the request.
	#[must_use]
	pub(crate) fn get_or_install(&self, key: StageKey) -> (Arc<Request<T>>, bool) {
		let mut guard = self.current.lock();

		if let Some(req) = guard.as_ref() {
			return (req.clone(), false);
		}

		let req = Arc::new(Request::new(key));
		*guard = Some(req.clone());
		(req, true)
	}

	#[must_use]
	pub(crate) fn peek(&self) -> Option<Arc<Request<T>>> {
		self.current.lock().clone()
	}

	/// Empties the slot, returning what it held.
	pub(crate) fn reset(&self) -> Option<Arc<Request<T>>> {
		self.current.lock().take()
	}

	/// Empties the slot only if it still holds `req`.
	pub(crate) fn reset_if(&self, req: &Arc<Request<T>>) -> bool {
		let mut guard = self.current.lock();

		match guard.as_ref() {
			Some(r) if Arc::ptr_eq(r, req) => {
				*guard = None;
				true
			}
			_ => false,
		}
	}

	#[must_use]
	pub(crate) fn is_current(&self, req: &Arc<Request<T>>) -> bool {
		self.current
			.lock()
			.as_ref()
			.is_some_and(|r| Arc::ptr_eq(r, req))
	}

	#[cfg(test)]
	#[must_use]
	pub(crate) fn is_done(&self) -> bool {
		self.current
			.lock()
			.as_ref()
			.is_some_and(|r| r.peek().is_some())
	}
}

// Request /////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub(crate) struct Request<T> {
	pub(crate) key: StageKey,
	claimed: AtomicBool,
	result: Mutex<Option<Arc<T>>>,
	cond: Condvar,
}

#[derive(Debug)]
pub(crate) enum WaitError {
	/// Every stage along the wait chain, starting with the one waited on.
	Cycle(Vec<StageKey>),
	Timeout,
}

impl<T> Request<T> {
	#[must_use]
	fn new(key: StageKey) -> Self {
		Self {
			key,
			claimed: AtomicBool::new(false),
			result: Mutex::new(None),
			cond: Condvar::new(),
		}
	}

	#[must_use]
	pub(crate) fn peek(&self) -> Option<Arc<T>> {
		self.result.lock().clone()
	}

	/// Succeeds for exactly one caller per request. The winner is recorded as
	/// running this stage until the returned guard drops.
	#[must_use]
	pub(crate) fn claim<'g>(&self, waits: &'g WaitGraph) -> Option<RunningGuard<'g>> {
		let mut inner = waits.inner.lock();

		if self
			.claimed
			.compare_exchange(
				false,
				true,
				atomic::Ordering::AcqRel,
				atomic::Ordering::Acquire,
			)
			.is_err()
		{
			return None;
		}

		let me = std::thread::current().id();
		let prev = inner.running.insert(self.key, me);
		debug_assert!(prev.is_none());

		Some(RunningGuard {
			graph: waits,
			key: self.key,
		})
	}

	/// Claims a request nobody has started and completes it with `value`.
	/// Returns `false` if the request was already claimed.
	pub(crate) fn abandon(&self, value: impl FnOnce() -> T) -> bool {
		if self
			.claimed
			.compare_exchange(
				false,
				true,
				atomic::Ordering::AcqRel,
				atomic::Ordering::Acquire,
			)
			.is_err()
		{
			return false;
		}

		self.complete(Arc::new(value()));
		true
	}

	pub(crate) fn complete(&self, value: Arc<T>) {
		let mut guard = self.result.lock();
		debug_assert!(guard.is_none());
		*guard = Some(value);
		drop(guard);
		self.cond.notify_all();
	}

	/// Blocks until another thread completes this request.
	pub(crate) fn wait(&self, waits: &WaitGraph, timeout: Duration) -> Result<Arc<T>, WaitError> {
		if let Some(done) = self.peek() {
			return Ok(done);
		}

		let _waiting = waits.enter_waiting(self.key).map_err(WaitError::Cycle)?;
		let deadline = Instant::now() + timeout;
		let mut guard = self.result.lock();

		loop {
			if let Some(done) = guard.as_ref() {
				return Ok(done.clone());
			}

			if self.cond.wait_until(&mut guard, deadline).timed_out() {
				return match guard.as_ref() {
					Some(done) => Ok(done.clone()),
					None => Err(WaitError::Timeout),
				};
			}
		}
	}
}

// WaitGraph ///////////////////////////////////////////////////////////////////

/// Which thread runs which stage, and which stage each blocked thread waits on.
#[derive(Debug, Default)]
pub(crate) struct WaitGraph {
	inner: Mutex<WaitInner>,
}

#[derive(Debug, Default)]
struct WaitInner {
	running: FxHashMap<StageKey, ThreadId>,
	waiting: FxHashMap<ThreadId, StageKey>,
}

impl WaitGraph {
	/// Fails if following `key` through its runner's own wait, and so on,
	/// leads back to the calling thread.
	fn enter_waiting(&self, key: StageKey) -> Result<WaitingGuard<'_>, Vec<StageKey>> {
		let me = std::thread::current().id();
		let mut inner = self.inner.lock();
		let mut chain = vec![key];
		let mut cur = key;

		while let Some(owner) = inner.running.get(&cur) {
			if *owner == me {
				return Err(chain);
			}

			let Some(next) = inner.waiting.get(owner) else {
				break;
			};

			if chain.contains(next) {
				// A cycle this thread is not part of; its members will see it.
				break;
			}

			chain.push(*next);
			cur = *next;
		}

		inner.waiting.insert(me, key);

		Ok(WaitingGuard {
			graph: self,
			thread: me,
		})
	}

	#[cfg(test)]
	#[must_use]
	pub(crate) fn is_quiet(&self) -> bool {
		let inner = self.inner.lock();
		inner.running.is_empty() && inner.waiting.is_empty()
	}
}

#[derive(Debug)]
pub(crate) struct RunningGuard<'g> {
	graph: &'g WaitGraph,
	key: StageKey,
}

impl Drop for RunningGuard<'_> {
	fn drop(&mut self) {
		self.graph.inner.lock().running.remove(&self.key);
	}
}

#[derive(Debug)]
struct WaitingGuard<'g> {
	graph: &'g WaitGraph,
	thread: ThreadId,
}

impl Drop for WaitingGuard<'_> {
	fn drop(&mut self) {
		self.graph.inner.lock().waiting.remove(&self.thread);
	}
}

#[cfg(test)]
mod test {
	use slotmap::SlotMap;

	use super::*;

	fn keys() -> (StageKey, StageKey) {
		let mut arena = SlotMap::<UnitId, ()>::with_key();
		let a = arena.insert(());
		let b = arena.insert(());

		(
			StageKey {
				project: ProjectId(0),
				unit: a,
				stage: Stage::FileScope,
			},
			StageKey {
				project: ProjectId(0),
				unit: b,
				stage: Stage::FileScope,
			},
		)
	}

	#[test]
	fn smoke_install_once() {
		let (ka, _) = keys();
		let slot = RequestSlot::<u32>::new(false);
		let waits = WaitGraph::default();

		let (r1, installed1) = slot.get_or_install(ka);
		let (r2, installed2) = slot.get_or_install(ka);
		assert!(installed1);
		assert!(!installed2);
		assert!(Arc::ptr_eq(&r1, &r2));

		let guard = r1.claim(&waits).unwrap();
		assert!(r2.claim(&waits).is_none());
		assert!(!r2.abandon(|| 0));
		r1.complete(Arc::new(7));
		drop(guard);

		assert!(slot.is_done());
		assert_eq!(*r2.wait(&waits, Duration::from_secs(1)).unwrap(), 7);
		assert!(waits.is_quiet());

		assert!(slot.reset_if(&r1));
		assert!(!slot.reset_if(&r1));
		assert!(slot.peek().is_none());
	}

	#[test]
	fn same_thread_reentry_is_a_cycle() {
		let (ka, _) = keys();
		let slot = RequestSlot::<u32>::new(false);
		let waits = WaitGraph::default();
		let (req, _) = slot.get_or_install(ka);
		let _running = req.claim(&waits).unwrap();

		let Err(WaitError::Cycle(chain)) = req.wait(&waits, Duration::from_secs(5)) else {
			panic!("expected a cycle");
		};

		assert_eq!(chain, [ka]);
	}

	#[test]
	fn cross_thread_cycle() {
		let (ka, kb) = keys();
		let slot_a = Arc::new(RequestSlot::<u32>::new(false));
		let slot_b = Arc::new(RequestSlot::<u32>::new(false));
		let waits = Arc::new(WaitGraph::default());
		let (req_a, _) = slot_a.get_or_install(ka);
		let (req_b, _) = slot_b.get_or_install(kb);
		let barrier = Arc::new(std::sync::Barrier::new(2));

		let other = {
			let waits = waits.clone();
			let req_a = req_a.clone();
			let req_b = req_b.clone();
			let barrier = barrier.clone();

			std::thread::spawn(move || {
				let _running = req_b.claim(&waits).unwrap();
				barrier.wait();
				// Blocks until the main thread gives up on `b` and finishes `a`.
				let ret = req_a.wait(&waits, Duration::from_secs(10));
				req_b.complete(Arc::new(2));
				ret.map(|v| *v)
			})
		};

		let running = req_a.claim(&waits).unwrap();
		barrier.wait();

		// Give the other thread time to start waiting on `a`.
		while !waits.inner.lock().waiting.values().any(|k| *k == ka) {
			std::thread::yield_now();
		}

		let Err(WaitError::Cycle(chain)) = req_b.wait(&waits, Duration::from_secs(10)) else {
			panic!("expected a cycle");
		};

		assert_eq!(chain, [kb, ka]);
		req_a.complete(Arc::new(1));
		drop(running);
		assert_eq!(other.join().unwrap().unwrap(), 1);
		assert!(waits.is_quiet());
	}

	#[test]
	fn timeout() {
		let (ka, _) = keys();
		let slot = Arc::new(RequestSlot::<u32>::new(false));
		let waits = Arc::new(WaitGraph::default());
		let (req, _) = slot.get_or_install(ka);

		let holder = {
			let waits = waits.clone();
			let req = req.clone();

			std::thread::spawn(move || {
				let guard = req.claim(&waits).unwrap();
				std::thread::sleep(Duration::from_millis(300));
				req.complete(Arc::new(3));
				drop(guard);
			})
		};

		while req.peek().is_none() && !waits.inner.lock().running.contains_key(&ka) {
			std::thread::yield_now();
		}

		assert!(matches!(
			req.wait(&waits, Duration::from_millis(10)),
			Err(WaitError::Timeout)
		));

		holder.join().unwrap();
		assert_eq!(*req.wait(&waits, Duration::from_millis(10)).unwrap(), 3);
	}
}
