//! In-process stand-ins for the sampler and the render pipeline

use crate::capability::Capability;
use crate::error::{Error, Result};
use crate::render::Render;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Counts enabled periods, and detects any two siblings enabled at once
#[derive(Default)]
pub(crate) struct Counter {
	calls: usize,
	enabled: bool,
	refuse: bool,
	active: Arc<AtomicUsize>,
	overlap: Arc<AtomicBool>,
}

impl Counter {
	/// A counter which fails to enable
	pub(crate) fn refusing() -> Self {
		Self {
			refuse: true,
			..Self::default()
		}
	}

	/// A new counter sharing overlap detection with this one
	pub(crate) fn sibling(&self) -> Self {
		Self {
			active: self.active.clone(),
			overlap: self.overlap.clone(),
			..Self::default()
		}
	}

	/// Whether two siblings were ever enabled at the same time
	pub(crate) fn overlapped(&self) -> bool {
		self.overlap.load(Ordering::SeqCst)
	}
}

impl Capability for Counter {
	fn enable(&mut self) -> Result<()> {
		if self.refuse {
			return Err(Error::Scope("counter refused to enable".to_string()));
		}
		if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
			self.overlap.store(true, Ordering::SeqCst);
		}
		self.enabled = true;
		self.calls += 1;
		Ok(())
	}

	fn disable(&mut self) -> Result<()> {
		if self.enabled {
			self.enabled = false;
			self.active.fetch_sub(1, Ordering::SeqCst);
		}
		Ok(())
	}

	fn export(&self, path: &Path) -> Result<()> {
		fs::write(path, format!("calls {}", self.calls))?;
		Ok(())
	}
}

#[derive(Debug, Clone)]
pub(crate) struct Record {
	pub(crate) output: PathBuf,
	pub(crate) stats: String,
	pub(crate) threshold: f64,
	pub(crate) at: Instant,
}

/// Records each render, failing for outputs whose name starts with `broken`
#[derive(Clone, Default)]
pub(crate) struct Recorder {
	records: Arc<Mutex<Vec<Record>>>,
	/// The number of enabled siblings of a watched counter
	watched: Option<Arc<AtomicUsize>>,
	/// Set if a render started while a watched sibling was enabled
	clashed: Arc<AtomicBool>,
}

impl Recorder {
	/// A recorder which notes any render while a sibling of `counter` is enabled
	pub(crate) fn watching(counter: &Counter) -> Self {
		Self {
			watched: Some(counter.active.clone()),
			..Self::default()
		}
	}

	/// Whether any render ran while a watched sibling was enabled
	pub(crate) fn clashed(&self) -> bool {
		self.clashed.load(Ordering::SeqCst)
	}

	pub(crate) fn records(&self) -> Vec<Record> {
		self.records.lock().unwrap().clone()
	}

	/// The number of successful renders
	pub(crate) fn count(&self) -> usize {
		self.records.lock().unwrap().len()
	}

	/// Poll until at least `count` renders have succeeded
	pub(crate) fn wait_for(&self, count: usize, timeout: Duration) -> bool {
		let start = Instant::now();
		while start.elapsed() < timeout {
			if self.count() >= count {
				return true;
			}
			thread::sleep(Duration::from_millis(2));
		}
		self.count() >= count
	}
}

impl Render for Recorder {
	fn render(&self, stats: &Path, graph: &Path, output: &Path, threshold: f64) -> Result<()> {
		if self.watched.as_ref().is_some_and(|active| active.load(Ordering::SeqCst) != 0) {
			self.clashed.store(true, Ordering::SeqCst);
		}
		let content = fs::read_to_string(stats)?;
		let broken = output
			.file_name()
			.is_some_and(|name| name.to_string_lossy().starts_with("broken"));
		if broken {
			return Err(Error::Report {
				command: format!("render {}", output.display()),
				status: "exit status: 1".to_string(),
				stderr: "broken".to_string(),
			});
		}
		fs::write(graph, "digraph {}")?;
		fs::write(output, &content)?;
		self.records.lock().unwrap().push(Record {
			output: output.to_path_buf(),
			stats: content,
			threshold,
			at: Instant::now(),
		});
		Ok(())
	}
}
