use crate::capability::{Capability, Sampler, Sampling};
use crate::config::Config;
use crate::error::Result;
use crate::render::{Graphviz, Render};
use crate::scheduler::{self, Wake};
use crate::session::{Due, Entry, Options, Session, normalize};
use log::{debug, error, warn};
use std::collections::hash_map;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Serializes every profiled scope and every report, across all registries
static EXCLUSIVE: Mutex<()> = Mutex::new(());

/// Wait until no scope is open and no report is running, in any registry
pub(crate) fn exclusive() -> MutexGuard<'static, ()> {
	EXCLUSIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The shared coordination point for a set of sessions.
///
/// A registry owns a set of sessions, the subset waiting to be reported,
/// and the background thread which reports them. Profiled scopes and
/// reports are serialized by one process-wide lock shared by every
/// registry, so at most one scope is ever sampling. Most programs use the
/// lazily created [`Registry::global`] instance through [`Session::new`].
#[derive(Clone)]
pub struct Registry {
	inner: Arc<Inner>,
}

pub(crate) struct Inner {
	/// Session entries and the pending set
	table: Mutex<Table>,
	/// Wakes the scheduler when the pending set changes
	pub(crate) wake: Wake,
	/// The render pipeline shared by all sessions
	pub(crate) renderer: Box<dyn Render>,
	/// Settings for newly created samplers
	sampling: Sampling,
	/// The scheduler thread, started on first attach
	scheduler: Mutex<Scheduler>,
}

#[derive(Default)]
struct Scheduler {
	/// Set once a scheduler thread was spawned
	started: bool,
	/// The running scheduler thread, until joined
	handle: Option<JoinHandle<()>>,
}

impl Inner {
	pub(crate) fn lock(&self) -> MutexGuard<'_, Table> {
		self.table.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Session state. Capabilities and the pending set only change while the
/// process-wide exclusive lock is also held.
#[derive(Default)]
pub(crate) struct Table {
	/// Session state, keyed by normalized output path
	pub(crate) entries: HashMap<PathBuf, Entry>,
	/// Sessions with samples not yet reported
	pub(crate) pending: BTreeSet<PathBuf>,
}

impl Table {
	/// Report every pending entry which is due, returning how long until
	/// the next one becomes due, if any remain.
	pub(crate) fn service(&mut self, renderer: &dyn Render) -> Option<Duration> {
		let mut timeout: Option<Duration> = None;
		// Iterate over a snapshot, as reported entries are removed
		let pending: Vec<PathBuf> = self.pending.iter().cloned().collect();
		for output in pending {
			let Some(entry) = self.entries.get_mut(&output) else {
				self.pending.remove(&output);
				continue;
			};
			match entry.due(Instant::now()) {
				// This session is due for a report
				Due::Now => {
					if let Err(e) = entry.report(&output, renderer) {
						error!("Failed to generate report {}: {e}", output.display());
					}
					self.pending.remove(&output);
				}
				// Wake again for the earliest deadline
				Due::In(wait) => {
					timeout = Some(timeout.map_or(wait, |t| t.min(wait)));
				}
				// Left for the final flush
				Due::Never => (),
			}
		}
		timeout
	}

	/// Report every pending entry regardless of its interval
	pub(crate) fn flush(&mut self, renderer: &dyn Render) {
		for output in mem::take(&mut self.pending) {
			if let Some(entry) = self.entries.get_mut(&output) {
				if let Err(e) = entry.report(&output, renderer) {
					error!("Failed to flush report {}: {e}", output.display());
				}
			}
		}
	}
}

impl Registry {
	/// Create a registry rendering through the configured graphviz pipeline.
	///
	/// Fails immediately if the pipeline binaries cannot be found.
	pub fn new(config: Config) -> Result<Self> {
		config.validate()?;
		Ok(Self::build(Box::new(Graphviz::new(&config)), config.sampling))
	}

	/// Create a registry with a custom render pipeline
	pub fn with_renderer(renderer: impl Render + 'static) -> Self {
		Self::build(Box::new(renderer), Sampling::default())
	}

	fn build(renderer: Box<dyn Render>, sampling: Sampling) -> Self {
		Self {
			inner: Arc::new(Inner {
				table: Mutex::new(Table::default()),
				wake: Wake::default(),
				renderer,
				sampling,
				scheduler: Mutex::new(Scheduler::default()),
			}),
		}
	}

	/// The process-wide registry, created on first use from [`Config::discover`]
	pub fn global() -> Result<&'static Registry> {
		if let Some(registry) = GLOBAL.get() {
			return Ok(registry);
		}
		let registry = Registry::new(Config::discover()?)?;
		Ok(GLOBAL.get_or_init(|| registry))
	}

	/// Shut down the process-wide registry, if it was ever created
	pub(crate) fn shutdown_global() {
		if let Some(registry) = GLOBAL.get() {
			registry.shutdown();
		}
	}

	/// Create a session sampled with `pprof`.
	///
	/// If a session with the same output path already exists in this
	/// registry, the new session shares its samples and options. Fails if
	/// the scheduler thread cannot be started.
	pub fn session(&self, output: impl AsRef<Path>, options: Options) -> Result<Session> {
		let sampling = self.inner.sampling.clone();
		self.attach(output.as_ref(), options, || Box::new(Sampler::new(sampling)))
	}

	/// Create a session recording through a custom capability
	pub fn session_with_capability(
		&self,
		output: impl AsRef<Path>,
		options: Options,
		capability: impl Capability + 'static,
	) -> Result<Session> {
		self.attach(output.as_ref(), options, || Box::new(capability))
	}

	fn attach<F>(&self, output: &Path, options: Options, capability: F) -> Result<Session>
	where
		F: FnOnce() -> Box<dyn Capability>,
	{
		let output = normalize(output);
		{
			let mut table = self.lock();
			match table.entries.entry(output.clone()) {
				hash_map::Entry::Occupied(entry) => {
					if entry.get().options != options {
						warn!(
							"{} is already registered with {:?}, ignoring {:?}",
							output.display(),
							entry.get().options,
							options
						);
					}
				}
				hash_map::Entry::Vacant(entry) => {
					entry.insert(Entry::new(options, capability()));
				}
			}
		}
		self.start()?;
		Ok(Session::attached(self.clone(), output))
	}

	/// Start the scheduler thread unless it is already running
	fn start(&self) -> Result<()> {
		self.start_with(|inner| {
			thread::Builder::new()
				.name("scopegraph-scheduler".to_string())
				.spawn(move || scheduler::run(&inner))
		})
	}

	/// Start the scheduler thread through `spawn`. A failed spawn is
	/// returned to the caller and attempted again on the next call.
	fn start_with<F>(&self, spawn: F) -> Result<()>
	where
		F: FnOnce(Arc<Inner>) -> io::Result<JoinHandle<()>>,
	{
		let mut scheduler = self.inner.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
		if scheduler.started {
			return Ok(());
		}
		let handle = spawn(self.inner.clone()).inspect_err(|e| {
			error!("Failed to start scheduler thread: {e}");
		})?;
		debug!("Started scheduler thread");
		scheduler.started = true;
		scheduler.handle = Some(handle);
		Ok(())
	}

	/// The output paths of sessions waiting to be reported.
	///
	/// This does not wait for open scopes, and may be called inside one.
	pub fn pending(&self) -> Vec<PathBuf> {
		self.lock().pending.iter().cloned().collect()
	}

	/// Stop the scheduler and report every pending session immediately.
	///
	/// Call this before the process exits so that no samples are lost. It
	/// waits for open scopes, so calling it inside a scope on the same
	/// thread deadlocks. Calling it again reports anything which became
	/// pending since.
	pub fn shutdown(&self) {
		// Ask the scheduler to exit
		self.inner.wake.stop();
		// Wait for any report in progress
		let handle =
			self.inner.scheduler.lock().unwrap_or_else(PoisonError::into_inner).handle.take();
		if let Some(handle) = handle {
			if handle.join().is_err() {
				error!("The scheduler thread panicked");
			}
		}
		// Flush everything still pending, outside of any scope
		let _exclusive = exclusive();
		self.lock().flush(self.inner.renderer.as_ref());
	}

	pub(crate) fn lock(&self) -> MutexGuard<'_, Table> {
		self.inner.lock()
	}

	pub(crate) fn wake(&self) {
		self.inner.wake.raise();
	}
}
