use crate::registry::{self, Inner};
use log::debug;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A level-triggered wake signal with a stop state
#[derive(Default)]
pub(crate) struct Wake {
	state: Mutex<Signal>,
	condvar: Condvar,
}

#[derive(Default)]
struct Signal {
	raised: bool,
	stopped: bool,
}

impl Wake {
	fn state(&self) -> MutexGuard<'_, Signal> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Set the signal, waking the waiter
	pub(crate) fn raise(&self) {
		self.state().raised = true;
		self.condvar.notify_all();
	}

	/// Reset the signal
	pub(crate) fn clear(&self) {
		self.state().raised = false;
	}

	/// Permanently wake the waiter, asking it to exit
	pub(crate) fn stop(&self) {
		self.state().stopped = true;
		self.condvar.notify_all();
	}

	/// Wait until the signal is raised, the timeout elapses, or the
	/// signal is stopped. Returns `false` once stopped.
	pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
		let state = self.state();
		let state = match timeout {
			None => self
				.condvar
				.wait_while(state, |s| !s.raised && !s.stopped)
				.unwrap_or_else(PoisonError::into_inner),
			Some(timeout) => {
				self.condvar
					.wait_timeout_while(state, timeout, |s| !s.raised && !s.stopped)
					.unwrap_or_else(PoisonError::into_inner)
					.0
			}
		};
		!state.stopped
	}
}

/// The report scheduling loop, run on a dedicated thread until stopped.
///
/// Each pass reports every pending session which is due, then sleeps
/// until the earliest deadline among those which are not, or until the
/// next scope exits.
pub(crate) fn run(inner: &Inner) {
	let mut timeout: Option<Duration> = None;
	// Loop until the registry shuts down
	while inner.wake.wait(timeout) {
		// Reports never overlap with profiled scopes, in any registry
		let _exclusive = registry::exclusive();
		let mut table = inner.lock();
		// Anything raised before this point is handled by this pass
		inner.wake.clear();
		// Report due sessions and find the next deadline
		timeout = table.service(inner.renderer.as_ref());
		debug!("Scheduler sleeping for {timeout:?}");
	}
	debug!("Scheduler stopped");
}
