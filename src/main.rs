use anyhow::{Result, anyhow};
use clap::Parser;
use scopegraph::{Options, Registry, Session};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(term_width = 0)]
pub(crate) struct Args {
	/// The report image to write, `.png` is appended if missing
	#[arg(short, long, env = "SCOPEGRAPH_OUTPUT", default_value = "scopegraph.png")]
	pub(crate) output: String,

	/// Minimum percentage of total time for a call to appear in the graph
	#[arg(short = 'n', long, default_value_t = 2.5)]
	pub(crate) threshold: f64,

	/// Minimum number of seconds between two reports
	#[arg(short, long, env = "SCOPEGRAPH_INTERVAL", default_value_t = 5.0)]
	pub(crate) interval: f64,

	/// Number of profiled iterations per thread
	#[arg(short = 'c', long, default_value = "100", value_parser=clap::value_parser!(u32).range(1..))]
	pub(crate) iterations: u32,

	/// Number of threads competing for the profiler
	#[arg(short, long, default_value = "1", value_parser=clap::value_parser!(u32).range(1..))]
	pub(crate) threads: u32,

	/// Milliseconds of work per iteration, split between the workload functions
	#[arg(short, long, default_value = "250")]
	pub(crate) work: u64,
}

fn main() -> Result<()> {
	// Initialise the logger
	env_logger::init();
	// Parse the command line arguments
	let args = Args::parse();
	// Locate the render pipeline
	let registry = Registry::global()?;
	// Run the workload
	let res = run(registry, &args);
	// Generate any pending reports
	scopegraph::shutdown();
	// Output the results
	let elapsed = res?;
	println!("--------------------------------------------------");
	println!(
		"Profiled {} iterations on {} threads in {:.2?}",
		args.iterations, args.threads, elapsed
	);
	println!("Report written to {}", args.output);
	println!("--------------------------------------------------");
	Ok(())
}

fn run(registry: &Registry, args: &Args) -> Result<Duration> {
	// Negative, infinite and oversized intervals are rejected
	let interval = Duration::try_from_secs_f64(args.interval)
		.map_err(|e| anyhow!("Invalid report interval {}: {e}", args.interval))?;
	// Configure the session
	let options = Options::default().threshold(args.threshold).interval(interval);
	let session = registry.session(&args.output, options)?;
	// Run the profiled workload on every thread
	let work = Duration::from_millis(args.work);
	let start = Instant::now();
	thread::scope(|s| {
		let handles: Vec<_> = (0..args.threads)
			.map(|_| {
				let session = &session;
				s.spawn(move || -> Result<()> {
					for i in 0..args.iterations {
						log::debug!("Iteration {i}");
						session.profile(|| workload(work))?;
					}
					Ok(())
				})
			})
			.collect();
		handles
			.into_iter()
			.try_for_each(|h| h.join().map_err(|_| anyhow!("A workload thread panicked"))?)
	})?;
	Ok(start.elapsed())
}

/// A workload with a recognisable call graph
fn workload(work: Duration) {
	thread::sleep(work * 2 / 5);
	foo(work / 5);
	bar(work * 2 / 5);
}

#[inline(never)]
fn foo(work: Duration) {
	spin(work);
}

#[inline(never)]
fn bar(work: Duration) {
	spin(work / 2);
	thread::sleep(work / 2);
}

fn spin(work: Duration) {
	let start = Instant::now();
	let mut n = 0u64;
	while start.elapsed() < work {
		n = std::hint::black_box(n.wrapping_mul(6364136223846793005).wrapping_add(1));
	}
}
