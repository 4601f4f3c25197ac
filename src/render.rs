use crate::command::Command;
use crate::config::Config;
use crate::error::Result;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// The two-stage conversion from a statistics file to an image.
///
/// Stage one turns `stats` into a graph description at `graph`, dropping
/// nodes below `threshold` percent of the total. Stage two draws `graph`
/// into `output`. Either stage failing fails the whole render.
pub trait Render: Send + Sync {
	fn render(&self, stats: &Path, graph: &Path, output: &Path, threshold: f64) -> Result<()>;
}

/// Renders through `gprof2dot` and graphviz `dot`
#[derive(Debug, Clone)]
pub struct Graphviz {
	gprof2dot: Command,
	dot: PathBuf,
}

impl Graphviz {
	pub fn new(config: &Config) -> Self {
		// Python scripts are run through the interpreter
		let gprof2dot = match config.gprof2dot.extension().is_some_and(|e| e == "py") {
			true => Command::new(PYTHON).args([&config.gprof2dot]),
			false => Command::new(&config.gprof2dot),
		};
		Self {
			gprof2dot,
			dot: config.dot.clone(),
		}
	}

	/// The stage one command: collapsed stacks to a dot graph
	pub fn convert(&self, stats: &Path, graph: &Path, threshold: f64) -> Command {
		let threshold = threshold.to_string();
		self.gprof2dot.clone().args([
			OsStr::new("-n"),
			OsStr::new(&threshold),
			OsStr::new("-f"),
			OsStr::new("collapse"),
			OsStr::new("-o"),
			graph.as_os_str(),
			stats.as_os_str(),
		])
	}

	/// The stage two command: a dot graph to a png image
	pub fn draw(&self, graph: &Path, output: &Path) -> Command {
		Command::new(&self.dot).args([
			OsStr::new("-o"),
			output.as_os_str(),
			OsStr::new("-Tpng"),
			graph.as_os_str(),
		])
	}
}

#[cfg(windows)]
const PYTHON: &str = "python";

#[cfg(not(windows))]
const PYTHON: &str = "python3";

impl Render for Graphviz {
	fn render(&self, stats: &Path, graph: &Path, output: &Path, threshold: f64) -> Result<()> {
		self.convert(stats, graph, threshold).execute()?;
		self.draw(graph, output).execute()?;
		Ok(())
	}
}
