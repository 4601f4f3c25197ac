use crate::error::{Error, Result};
use log::trace;
use pprof::{Frames, ProfilerGuard, ProfilerGuardBuilder};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// The default sampling frequency in hertz
pub const FREQUENCY: i32 = 1000;

/// Libraries whose frames are never sampled
pub const BLOCKLIST: [&str; 4] = ["libc", "libgcc", "pthread", "vdso"];

/// Something which can record where time is spent between
/// [`enable`](Capability::enable) and [`disable`](Capability::disable),
/// and write everything recorded so far to a statistics file.
///
/// A capability is owned by exactly one session entry, and is only
/// enabled and disabled while the process-wide exclusive lock is held,
/// from the thread which opened the scope.
pub trait Capability: Send {
	/// Start recording
	fn enable(&mut self) -> Result<()>;
	/// Stop recording, keeping what was recorded
	fn disable(&mut self) -> Result<()>;
	/// Write the accumulated statistics to `path`
	fn export(&self, path: &Path) -> Result<()>;
}

/// Settings for the sampling profiler
#[derive(Debug, Clone, PartialEq)]
pub struct Sampling {
	/// The number of samples taken per second
	pub frequency: i32,
	/// Libraries to exclude from the sampled stacks
	pub blocklist: Vec<String>,
}

impl Default for Sampling {
	fn default() -> Self {
		Self {
			frequency: FREQUENCY,
			blocklist: BLOCKLIST.iter().map(|s| s.to_string()).collect(),
		}
	}
}

/// A [`Capability`] backed by the `pprof` signal-based sampler.
///
/// The sampler interrupts every thread in the process, so only samples
/// taken on the thread which enabled it are kept. Samples from every
/// enabled period are merged into a single set of folded stacks, which is
/// exported in the collapsed-stack text format (`root;child;leaf count`),
/// one stack per line.
pub struct Sampler {
	sampling: Sampling,
	guard: Option<ProfilerGuard<'static>>,
	/// The thread which enabled the running sampler
	thread: u64,
	stacks: BTreeMap<String, isize>,
}

impl Sampler {
	pub fn new(sampling: Sampling) -> Self {
		Self {
			sampling,
			guard: None,
			thread: 0,
			stacks: BTreeMap::new(),
		}
	}

	/// The number of distinct stacks recorded so far
	pub fn stacks(&self) -> usize {
		self.stacks.len()
	}
}

impl Capability for Sampler {
	fn enable(&mut self) -> Result<()> {
		if self.guard.is_some() {
			return Err(Error::Scope("the sampler is already enabled".to_string()));
		}
		// Start the signal-based sampler
		let guard = ProfilerGuardBuilder::default()
			.frequency(self.sampling.frequency)
			.blocklist(self.sampling.blocklist.as_slice())
			.build()?;
		self.guard = Some(guard);
		self.thread = current_thread();
		Ok(())
	}

	fn disable(&mut self) -> Result<()> {
		let Some(guard) = self.guard.take() else {
			return Ok(());
		};
		// Resolve the samples taken during this period
		let report = guard.report().build()?;
		// Stop the sampler before merging
		drop(guard);
		// Merge the profiled thread into the accumulated stacks
		for (frames, count) in report.data.iter().filter(|(f, _)| f.thread_id == self.thread) {
			*self.stacks.entry(fold(frames)).or_insert(0) += count;
		}
		trace!("Sampler holds {} distinct stacks", self.stacks.len());
		Ok(())
	}

	fn export(&self, path: &Path) -> Result<()> {
		let mut file = BufWriter::new(File::create(path)?);
		for (stack, count) in &self.stacks {
			writeln!(file, "{stack} {count}")?;
		}
		file.flush()?;
		Ok(())
	}
}

/// The calling thread, as identified in sampled frames
fn current_thread() -> u64 {
	// SAFETY: pthread_self has no preconditions and always succeeds
	unsafe { libc::pthread_self() as u64 }
}

/// Fold a sampled stack into a single root-first line
fn fold(frames: &Frames) -> String {
	let mut line = match frames.thread_name.is_empty() {
		true => format!("{}", frames.thread_id),
		false => frames.thread_name.replace([';', ' '], "_"),
	};
	// Frames are stored innermost first
	for frame in frames.frames.iter().rev() {
		for symbol in frame.iter().rev() {
			line.push(';');
			line.push_str(&symbol.name().replace(';', ":"));
		}
	}
	line
}
