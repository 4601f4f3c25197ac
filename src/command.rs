use crate::error::{Error, Result};
use log::info;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process;

/// An external program invocation, used for each render pipeline stage
#[derive(Debug, Clone)]
pub struct Command {
	program: PathBuf,
	args: Arguments,
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self.args.0.is_empty() {
			true => write!(f, "{}", self.program.display()),
			false => write!(f, "{} {}", self.program.display(), self.args),
		}
	}
}

impl Command {
	/// Create a new command for the given program
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Arguments::default(),
		}
	}

	/// The program which will be executed
	pub fn program(&self) -> &Path {
		&self.program
	}

	/// Append arguments to this command
	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<OsStr>,
	{
		self.args.add(args);
		self
	}

	/// Run the command to completion, returning its trimmed standard output.
	///
	/// A non-zero exit status is returned as [`Error::Report`], carrying
	/// the trimmed standard error of the process.
	pub fn execute(&self) -> Result<String> {
		// Output debug information to the logs
		info!("Running command `{self}`");
		// Create a new process command
		let mut command = process::Command::new(&self.program);
		// Set the arguments on the command
		let command = command.args(&self.args.0);
		// Catch all output from the command
		let output = command.output().map_err(|e| {
			Error::Configuration(format!("Unable to run `{}`: {e}", self.program.display()))
		})?;
		// Output command failure if errored
		match output.status.success() {
			// Get the stderr out from the command
			false => Err(Error::Report {
				command: self.to_string(),
				status: output.status.to_string(),
				stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			}),
			// Get the stdout out from the command
			true => Ok(String::from_utf8_lossy(&output.stdout).trim().to_string()),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Arguments(Vec<OsString>);

impl fmt::Display for Arguments {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let args: Vec<_> = self.0.iter().map(|a| a.to_string_lossy()).collect();
		write!(f, "{}", args.join(" "))
	}
}

impl Arguments {
	fn add<I, S>(&mut self, args: I)
	where
		I: IntoIterator<Item = S>,
		S: AsRef<OsStr>,
	{
		for arg in args {
			self.0.push(arg.as_ref().to_owned());
		}
	}
}
