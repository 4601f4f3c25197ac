//! Scoped call-graph profiling for long-running programs.
//!
//! Wrap the code you care about in a [`Session`] scope and a `.png` call
//! graph is regenerated in the background, at most once per reporting
//! interval, through `gprof2dot` and graphviz `dot`. Profiled scopes and
//! report generation are serialized through one process-wide lock, shared
//! by every [`Registry`], so the cost of rendering never shows up in the
//! profile itself.

mod capability;
mod command;
mod config;
mod error;
mod registry;
mod render;
mod scheduler;
mod session;

#[cfg(test)]
mod fake;

pub use capability::{BLOCKLIST, Capability, FREQUENCY, Sampler, Sampling};
pub use command::Command;
pub use config::Config;
pub use error::{Error, Result};
pub use registry::Registry;
pub use render::{Graphviz, Render};
pub use session::{EXTENSION, Options, Scope, Session};

/// Flush every pending report of the process-wide registry and stop its scheduler.
///
/// Call this once before the process exits.
pub fn shutdown() {
	Registry::shutdown_global()
}
