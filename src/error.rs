use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
	/// The render pipeline could not be located or the configuration is invalid
	#[error("Configuration error: {0}")]
	Configuration(String),
	/// A render pipeline stage exited unsuccessfully
	#[error("Command `{command}` failed with {status}: {stderr}")]
	Report {
		command: String,
		status: String,
		stderr: String,
	},
	/// The sampling profiler could not be started or queried
	#[error("Profiler error: {0}")]
	Profiler(#[from] pprof::Error),
	/// A profiling scope was misused
	#[error("Scope error: {0}")]
	Scope(String),
	#[error(transparent)]
	Io(#[from] io::Error),
}
