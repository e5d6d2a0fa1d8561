//! [`BuildSync`]: counts running stage requests and hands out the exclusive
//! idle state the workspace mutates its projects under.

use std::{collections::VecDeque, thread::ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub(crate) struct BuildSync {
	state: Mutex<SyncState>,
	cond: Condvar,
}

#[derive(Debug, Default)]
struct SyncState {
	/// Stage requests currently running, on any thread.
	activity: usize,
	/// Nesting depth of the idle state held by the front of `idle_queue`.
	idle_depth: usize,
	/// Threads holding or awaiting idle, holder first.
	idle_queue: VecDeque<ThreadId>,
}

impl SyncState {
	#[must_use]
	fn can_start_request(&self, me: ThreadId) -> bool {
		match self.idle_queue.front() {
			None => true,
			Some(owner) if *owner == me => true,
			// Let running builds finish the requests they depend on, so the
			// thread awaiting idle is not starved of its precondition.
			Some(_) => self.idle_depth == 0 && self.activity > 0,
		}
	}
}

impl BuildSync {
	/// Blocks while another thread holds the idle state.
	#[must_use]
	pub(crate) fn start_request(&self) -> ActivityGuard<'_> {
		let me = std::thread::current().id();
		let mut state = self.state.lock();

		while !state.can_start_request(me) {
			self.cond.wait(&mut state);
		}

		state.activity += 1;
		ActivityGuard(self)
	}

	fn end_request(&self) {
		let mut state = self.state.lock();
		state.activity -= 1;

		if state.activity == 0 {
			drop(state);
			self.cond.notify_all();
		}
	}

	/// Blocks until no stage request is running and every thread queued for
	/// idle earlier has released it. Re-entrant on the holding thread.
	/// Must not be called from inside a stage handler.
	pub(crate) fn start_idle(&self) {
		let me = std::thread::current().id();
		let mut state = self.state.lock();

		if state.idle_depth > 0 && state.idle_queue.front() == Some(&me) {
			state.idle_depth += 1;
			return;
		}

		state.idle_queue.push_back(me);

		while state.activity > 0 || state.idle_queue.front() != Some(&me) {
			self.cond.wait(&mut state);
		}

		state.idle_depth = 1;
	}

	pub(crate) fn end_idle(&self) {
		let mut state = self.state.lock();
		debug_assert_eq!(state.idle_queue.front(), Some(&std::thread::current().id()));
		state.idle_depth -= 1;

		if state.idle_depth == 0 {
			state.idle_queue.pop_front();
			drop(state);
			self.cond.notify_all();
		}
	}

	#[must_use]
	pub(crate) fn is_building(&self) -> bool {
		self.state.lock().activity > 0
	}

	#[cfg(test)]
	#[must_use]
	pub(crate) fn is_idle(&self) -> bool {
		self.state.lock().idle_depth > 0
	}
}

#[derive(Debug)]
pub(crate) struct ActivityGuard<'s>(&'s BuildSync);

impl Drop for ActivityGuard<'_> {
	fn drop(&mut self) {
		self.0.end_request();
	}
}

#[cfg(test)]
mod test {
	use std::{
		sync::{
			atomic::{AtomicBool, Ordering},
			Arc,
		},
		time::Duration,
	};

	use super::*;

	#[test]
	fn idle_waits_for_activity() {
		let sync = Arc::new(BuildSync::default());
		let idle_reached = Arc::new(AtomicBool::new(false));
		let activity = sync.start_request();

		let waiter = {
			let sync = sync.clone();
			let idle_reached = idle_reached.clone();

			std::thread::spawn(move || {
				sync.start_idle();
				idle_reached.store(true, Ordering::SeqCst);
				// Nested idle on the same thread.
				sync.start_idle();
				sync.end_idle();
				sync.end_idle();
			})
		};

		std::thread::sleep(Duration::from_millis(50));
		assert!(!idle_reached.load(Ordering::SeqCst));

		// Requests nested inside running work may still start.
		let nested = sync.start_request();
		drop(nested);
		drop(activity);

		waiter.join().unwrap();
		assert!(idle_reached.load(Ordering::SeqCst));
		assert!(!sync.is_building());
		assert!(!sync.is_idle());
	}

	#[test]
	fn requests_wait_for_idle() {
		let sync = Arc::new(BuildSync::default());
		let started = Arc::new(AtomicBool::new(false));
		sync.start_idle();

		// The idle holder may run requests itself.
		drop(sync.start_request());

		let worker = {
			let sync = sync.clone();
			let started = started.clone();

			std::thread::spawn(move || {
				let _activity = sync.start_request();
				started.store(true, Ordering::SeqCst);
			})
		};

		std::thread::sleep(Duration::from_millis(50));
		assert!(!started.load(Ordering::SeqCst));
		sync.end_idle();
		worker.join().unwrap();
		assert!(started.load(Ordering::SeqCst));
	}
}
