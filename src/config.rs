use crate::capability::Sampling;
use crate::error::{Error, Result};
use log::debug;
use std::env;
use std::path::{Path, PathBuf};

/// Registry configuration: where the render pipeline lives, and how to sample
#[derive(Debug, Clone)]
pub struct Config {
	/// The graphviz `dot` binary
	pub dot: PathBuf,
	/// The `gprof2dot` converter, either an executable or a python script
	pub gprof2dot: PathBuf,
	/// Sampling profiler settings
	pub sampling: Sampling,
}

impl Config {
	/// Locate the render pipeline on this host.
	///
	/// `SCOPEGRAPH_DOT` and `SCOPEGRAPH_GPROF2DOT` override the search, and
	/// `SCOPEGRAPH_FREQUENCY` overrides the sampling frequency.
	pub fn discover() -> Result<Self> {
		// Find the graph renderer
		let dot = match env::var_os("SCOPEGRAPH_DOT") {
			Some(v) => PathBuf::from(v),
			None => find_dot()?,
		};
		// Find the stats converter
		let gprof2dot = match env::var_os("SCOPEGRAPH_GPROF2DOT") {
			Some(v) => PathBuf::from(v),
			None => locate(&["gprof2dot", "gprof2dot.py"]).ok_or_else(|| {
				Error::Configuration("'gprof2dot' not found, please install gprof2dot".to_string())
			})?,
		};
		// Configure the sampler
		let mut sampling = Sampling::default();
		if let Ok(v) = env::var("SCOPEGRAPH_FREQUENCY") {
			sampling.frequency = v.parse().map_err(|_| {
				Error::Configuration(format!("Invalid SCOPEGRAPH_FREQUENCY value: {v}"))
			})?;
		}
		debug!("Using dot at {} and gprof2dot at {}", dot.display(), gprof2dot.display());
		let config = Self {
			dot,
			gprof2dot,
			sampling,
		};
		config.validate()?;
		Ok(config)
	}

	/// Check that the configured binaries exist and the sampler settings are usable
	pub fn validate(&self) -> Result<()> {
		if self.sampling.frequency <= 0 {
			return Err(Error::Configuration(format!(
				"Sampling frequency must be positive, got {}",
				self.sampling.frequency
			)));
		}
		for path in [&self.dot, &self.gprof2dot] {
			if !path.is_file() {
				return Err(Error::Configuration(format!("{} does not exist", path.display())));
			}
		}
		Ok(())
	}
}

/// Search each directory on `PATH` for the first of `names`
pub(crate) fn locate(names: &[&str]) -> Option<PathBuf> {
	let path = env::var_os("PATH")?;
	env::split_paths(&path).find_map(|dir| {
		names.iter().map(|name| dir.join(name)).find(|candidate| is_executable(candidate))
	})
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
	use std::os::unix::fs::PermissionsExt;
	path.metadata().map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
	path.is_file()
}

#[cfg(not(windows))]
fn find_dot() -> Result<PathBuf> {
	locate(&["dot"])
		.ok_or_else(|| Error::Configuration("'dot' not found, please install graphviz".to_string()))
}

#[cfg(windows)]
fn find_dot() -> Result<PathBuf> {
	if let Some(dot) = locate(&["dot.exe"]) {
		return Ok(dot);
	}
	// Graphviz installers do not always update PATH
	for var in ["ProgramFiles", "ProgramFiles(x86)"] {
		let Some(folder) = env::var_os(var) else {
			continue;
		};
		let Ok(entries) = std::fs::read_dir(folder) else {
			continue;
		};
		for entry in entries.flatten() {
			if entry.file_name().to_string_lossy().to_lowercase().contains("graphviz") {
				let dot = entry.path().join("bin").join("dot.exe");
				if dot.is_file() {
					return Ok(dot);
				}
			}
		}
	}
	Err(Error::Configuration("dot.exe not found, please install graphviz".to_string()))
}
