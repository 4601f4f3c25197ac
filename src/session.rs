use crate::capability::Capability;
use crate::error::{Error, Result};
use crate::registry::{self, Registry};
use crate::render::Render;
use log::{error, info, trace};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;
use std::time::{Duration, Instant};

/// The extension of every rendered report
pub const EXTENSION: &str = "png";

/// Per-session reporting settings
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
	/// Nodes below this percentage of the total are left out of the graph
	pub threshold: f64,
	/// The minimum time between two reports of the same session
	pub interval: Duration,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			threshold: 2.5,
			interval: Duration::from_secs(5),
		}
	}
}

impl Options {
	/// Set the percentage threshold passed to the render pipeline
	pub fn threshold(mut self, threshold: f64) -> Self {
		self.threshold = threshold;
		self
	}

	/// Set the minimum time between reports
	pub fn interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}
}

/// A named profiling target.
///
/// Work run inside [`Session::enter`] (or [`Session::profile`]) is sampled
/// and attributed to this session's output image. Only one scope can be
/// open at a time in the whole process, whichever session or registry it
/// belongs to, and reports are never generated while a scope is open. Two
/// profiled scopes which wait on each other will therefore deadlock, as
/// will opening a scope, or shutting down, inside another scope on the same
/// thread. [`Session::is_pending`], [`Session::last_report`] and
/// [`Registry::pending`] never wait for scopes.
///
/// Sessions constructed with the same output path share their samples, and
/// their reports are combined. A `Session` is cheap to clone and may be
/// used from any thread.
///
/// ```no_run
/// use scopegraph::Session;
///
/// let profiler = Session::new("output.png")?;
/// profiler.profile(|| do_some_stuff())?;
/// do_some_stuff_that_wont_be_profiled();
/// profiler.profile(|| do_some_more_stuff())?;
/// scopegraph::shutdown();
/// # fn do_some_stuff() {}
/// # fn do_some_stuff_that_wont_be_profiled() {}
/// # fn do_some_more_stuff() {}
/// # Ok::<(), scopegraph::Error>(())
/// ```
#[derive(Clone)]
pub struct Session {
	registry: Registry,
	output: PathBuf,
}

impl Session {
	/// Create a session on the process-wide registry with default options
	pub fn new(output: impl AsRef<Path>) -> Result<Self> {
		Self::with_options(output, Options::default())
	}

	/// Create a session on the process-wide registry
	pub fn with_options(output: impl AsRef<Path>, options: Options) -> Result<Self> {
		Registry::global()?.session(output, options)
	}

	pub(crate) fn attached(registry: Registry, output: PathBuf) -> Self {
		Self {
			registry,
			output,
		}
	}

	/// The normalized path of the rendered image
	pub fn output_path(&self) -> &Path {
		&self.output
	}

	/// The registry this session belongs to
	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	/// When this session was last successfully reported
	pub fn last_report(&self) -> Option<Instant> {
		self.registry.lock().entries.get(&self.output).and_then(|e| e.last_report)
	}

	/// Whether this session has samples which have not been reported yet
	pub fn is_pending(&self) -> bool {
		self.registry.lock().pending.contains(&self.output)
	}

	/// Open a profiling scope, blocking until no other scope or report is running.
	///
	/// Sampling stops and the session is queued for reporting when the
	/// returned [`Scope`] is dropped, including during a panic unwind.
	pub fn enter(&self) -> Result<Scope<'_>> {
		// Wait for every other scope and report to finish
		let exclusive = registry::exclusive();
		{
			let mut table = self.registry.lock();
			let entry = table.entries.get_mut(&self.output).ok_or_else(|| {
				Error::Scope(format!("{} is not registered", self.output.display()))
			})?;
			entry.capability.enable()?;
		}
		trace!("Entered scope for {}", self.output.display());
		Ok(Scope {
			_exclusive: exclusive,
			session: self,
		})
	}

	/// Run `work` inside a profiling scope, returning its result
	pub fn profile<F, R>(&self, work: F) -> Result<R>
	where
		F: FnOnce() -> R,
	{
		let _scope = self.enter()?;
		Ok(work())
	}
}

/// An open profiling scope, holding the process-wide exclusive lock until dropped
#[must_use = "the scope ends as soon as it is dropped"]
pub struct Scope<'a> {
	_exclusive: MutexGuard<'static, ()>,
	session: &'a Session,
}

impl Drop for Scope<'_> {
	fn drop(&mut self) {
		let output = &self.session.output;
		{
			let mut table = self.session.registry.lock();
			if let Some(entry) = table.entries.get_mut(output) {
				if let Err(e) = entry.capability.disable() {
					error!("Failed to stop sampling for {}: {e}", output.display());
				}
			}
			// Set semantics: repeated scopes queue the session once
			table.pending.insert(output.clone());
		}
		// The scheduler only clears this once the exclusive lock is released
		self.session.registry.wake();
		trace!("Exited scope for {}", output.display());
	}
}

/// When an entry may next be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Due {
	/// Right away
	Now,
	/// Once this much time has passed
	In(Duration),
	/// Only when the registry is flushed
	Never,
}

/// The mutable state of a session, only reachable through the locked registry table
pub(crate) struct Entry {
	pub(crate) options: Options,
	pub(crate) capability: Box<dyn Capability>,
	pub(crate) last_report: Option<Instant>,
}

impl Entry {
	pub(crate) fn new(options: Options, capability: Box<dyn Capability>) -> Self {
		Self {
			options,
			capability,
			last_report: None,
		}
	}

	/// When this entry may be reported again, measured from `now`
	pub(crate) fn due(&self, now: Instant) -> Due {
		let Some(last) = self.last_report else {
			return Due::Now;
		};
		// An interval beyond the range of `Instant` never elapses
		let Some(deadline) = last.checked_add(self.options.interval) else {
			return Due::Never;
		};
		match deadline.checked_duration_since(now) {
			Some(wait) if !wait.is_zero() => Due::In(wait),
			_ => Due::Now,
		}
	}

	/// Export the samples and render them to `output`.
	///
	/// Temporary files are removed on success, and left behind on failure.
	pub(crate) fn report(&mut self, output: &Path, renderer: &dyn Render) -> Result<()> {
		let stats = temporary(output, "stats");
		let graph = temporary(output, "dot");
		// Export the samples
		self.capability.export(&stats)?;
		// Run the render pipeline
		renderer.render(&stats, &graph, output, self.options.threshold)?;
		// Clean up the intermediate files
		remove(&graph)?;
		remove(&stats)?;
		self.last_report = Some(Instant::now());
		info!("Generated report {}", output.display());
		Ok(())
	}
}

/// Append the report extension unless already present
pub(crate) fn normalize(output: &Path) -> PathBuf {
	match output.extension() {
		Some(ext) if ext.eq_ignore_ascii_case(EXTENSION) => output.to_path_buf(),
		_ => temporary(output, EXTENSION),
	}
}

/// The path of an intermediate file derived from the output path
pub(crate) fn temporary(output: &Path, suffix: &str) -> PathBuf {
	let mut path = OsString::from(output.as_os_str());
	path.push(".");
	path.push(suffix);
	PathBuf::from(path)
}

fn remove(path: &Path) -> io::Result<()> {
	match fs::remove_file(path) {
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
		res => res,
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::fake::{Counter, Recorder};

	#[test]
	fn test_normalize() {
		assert_eq!(normalize(Path::new("out")), PathBuf::from("out.png"));
		assert_eq!(normalize(Path::new("out.png")), PathBuf::from("out.png"));
		assert_eq!(normalize(Path::new("out.PNG")), PathBuf::from("out.PNG"));
		assert_eq!(normalize(Path::new("dir/out.svg")), PathBuf::from("dir/out.svg.png"));
	}

	#[test]
	fn test_temporary() {
		assert_eq!(temporary(Path::new("out.png"), "stats"), PathBuf::from("out.png.stats"));
		assert_eq!(temporary(Path::new("out.png"), "dot"), PathBuf::from("out.png.dot"));
	}

	#[test]
	fn test_options() {
		let options = Options::default();
		assert_eq!(options.threshold, 2.5);
		assert_eq!(options.interval, Duration::from_secs(5));
		let options = options.threshold(1.0).interval(Duration::from_millis(100));
		assert_eq!(options.threshold, 1.0);
		assert_eq!(options.interval, Duration::from_millis(100));
	}

	#[test]
	fn test_fresh_entry_is_due() {
		let entry = Entry::new(Options::default(), Box::new(Counter::default()));
		assert_eq!(entry.due(Instant::now()), Due::Now);
	}

	#[test]
	fn test_due_counts_down_from_last_report() {
		let mut entry = Entry::new(Options::default(), Box::new(Counter::default()));
		let now = Instant::now();
		entry.last_report = Some(now);
		assert_eq!(entry.due(now), Due::In(Duration::from_secs(5)));
		assert_eq!(entry.due(now + Duration::from_secs(2)), Due::In(Duration::from_secs(3)));
		assert_eq!(entry.due(now + Duration::from_secs(5)), Due::Now);
		assert_eq!(entry.due(now + Duration::from_secs(6)), Due::Now);
	}

	#[test]
	fn test_overflowing_interval_is_never_due() {
		let mut entry =
			Entry::new(Options::default().interval(Duration::MAX), Box::new(Counter::default()));
		// A fresh entry is still reported straight away
		assert_eq!(entry.due(Instant::now()), Due::Now);
		entry.last_report = Some(Instant::now());
		assert_eq!(entry.due(Instant::now()), Due::Never);
	}

	#[test]
	fn test_zero_interval_is_always_due() {
		let mut entry =
			Entry::new(Options::default().interval(Duration::ZERO), Box::new(Counter::default()));
		entry.last_report = Some(Instant::now());
		assert_eq!(entry.due(Instant::now()), Due::Now);
	}

	#[test]
	fn test_report_removes_temporaries() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let output = dir.path().join("out.png");
		let recorder = Recorder::default();
		let mut counter = Counter::default();
		counter.enable()?;
		counter.disable()?;
		let mut entry = Entry::new(Options::default(), Box::new(counter));
		let before = Instant::now();
		entry.report(&output, &recorder)?;
		assert!(output.exists());
		assert!(!temporary(&output, "stats").exists());
		assert!(!temporary(&output, "dot").exists());
		assert!(entry.last_report.unwrap() >= before);
		let records = recorder.records();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].stats, "calls 1");
		assert_eq!(records[0].threshold, 2.5);
		Ok(())
	}

	#[test]
	fn test_failed_report_keeps_temporaries() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let output = dir.path().join("broken.png");
		let recorder = Recorder::default();
		let mut entry = Entry::new(Options::default(), Box::new(Counter::default()));
		assert!(matches!(entry.report(&output, &recorder), Err(Error::Report { .. })));
		assert!(temporary(&output, "stats").exists());
		assert!(!output.exists());
		assert_eq!(entry.last_report, None);
		Ok(())
	}
}
