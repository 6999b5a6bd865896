//! High-level emulation of a console guest kernel's thread, process and
//! scheduling layer.
//!
//! Guest threads run on host threads and are scheduled across a configurable
//! number of virtual cores by guest priority. Waitable kernel objects (mutexes
//! with priority inheritance, semaphores, events and process exit signals)
//! are reached through the supervisor-call interface in [`kernel::svc`].
use clap::Parser;
use kernel::KernelConfig;
use std::{process::ExitCode, time::Duration};
use tracing_subscriber::EnvFilter;

pub mod kernel;
pub mod scenarios;
pub mod utils;

use scenarios::Scenario;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run guest scheduling scenarios on the emulated kernel"
)]
pub struct Args {
    /// Number of virtual cores (overrides HLE_KERNEL_CORES)
    #[arg(long, value_name = "N")]
    pub cores: Option<usize>,
    /// Round-robin time slice in microseconds (overrides HLE_KERNEL_TIME_SLICE_US)
    #[arg(long, value_name = "N")]
    pub time_slice_us: Option<u64>,
    /// Emit the report as JSON instead of text
    #[arg(long)]
    pub json: bool,
    #[arg(value_enum)]
    pub scenario: Scenario,
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();

    if !args.json {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = KernelConfig::from_env();
    if let Some(cores) = args.cores {
        config = config.with_core_count(cores);
    }
    if let Some(us) = args.time_slice_us {
        config = config.with_time_slice(Duration::from_micros(us));
    }

    let report = match scenarios::run(args.scenario, config) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("scenario failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("failed to serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("Observed ordering:");
        for (i, event) in report.events.iter().enumerate() {
            println!("  {:>2}. {}", i + 1, event);
        }
        if !report.passed {
            println!("Expected ordering:");
            for (i, event) in report.expected.iter().enumerate() {
                println!("  {:>2}. {}", i + 1, event);
            }
        }
        println!();
        print!("{}", report.snapshot);
        println!(
            "{:?}: {}",
            report.scenario,
            if report.passed { "PASS" } else { "FAIL" }
        );
    }

    if report.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
