use mender_core::scenario::Scenario;
use mender_core::session::{SessionController, SessionError, SessionOutcome, Toolchain};
use mender_core::ScenarioError;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_PATCH_FOUND: u8 = EXIT_OK;
const EXIT_EXHAUSTED: u8 = 1;
const EXIT_BUILD_FAILURE: u8 = 2;
const EXIT_CONFIG_ERROR: u8 = 3;
const EXIT_OTHER_ERROR: u8 = 4;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Scenario-driven program repair validated in simulation", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Searches for a patch that makes every test match its expected outcome.
    Repair {
        scenario: PathBuf,
        #[clap(long)]
        threads: Option<usize>,
        #[clap(long)]
        candidates: Option<u64>,
        #[clap(long)]
        time_minutes: Option<u64>,
        /// Write collected coverage to this file as JSON.
        #[clap(long)]
        save_coverage: Option<PathBuf>,
        /// Write the patch here instead of printing it.
        #[clap(long)]
        patch_output: Option<PathBuf>,
    },
    /// Parses and validates a scenario without running anything.
    Check { scenario: PathBuf },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn is_config_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ScenarioError>().is_some()
        || err
            .downcast_ref::<SessionError>()
            .is_some_and(SessionError::is_config_error)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            if is_config_error(&err) {
                ExitCode::from(EXIT_CONFIG_ERROR)
            } else {
                ExitCode::from(EXIT_OTHER_ERROR)
            }
        }
    }
}

fn run(command: Command) -> Result<u8, anyhow::Error> {
    match command {
        Command::Check { scenario } => {
            let loaded = Scenario::load_from_file(&scenario)?;
            println!(
                "{scenario:?}: ok ({} test(s), {} schema(s), {} thread(s))",
                loaded.tests.tests.len(),
                loaded.transformations.schemas.len(),
                loaded.threads
            );
            Ok(EXIT_OK)
        }
        Command::Repair {
            scenario,
            threads,
            candidates,
            time_minutes,
            save_coverage,
            patch_output,
        } => {
            info!("loading scenario from {scenario:?}");
            let mut loaded = Scenario::load_from_file(&scenario)?;
            if let Some(threads) = threads {
                loaded.threads = threads;
            }
            if let Some(candidates) = candidates {
                loaded.resource_limits.candidates = Some(candidates);
            }
            if let Some(minutes) = time_minutes {
                loaded.resource_limits.time_minutes = Some(minutes);
            }
            loaded.validate()?;

            let mut session = SessionController::new(&loaded, Toolchain::from_scenario(&loaded));
            if let Some(path) = save_coverage {
                session = session.save_coverage_to(path);
            }

            match session.run()? {
                SessionOutcome::PatchFound { candidate, diff } => {
                    info!("PATCH_FOUND: {candidate}");
                    match patch_output {
                        Some(path) => {
                            std::fs::write(&path, &diff)
                                .with_context(|| format!("failed to write patch to {path:?}"))?;
                            info!("patch written to {path:?}");
                        }
                        None => print!("{diff}"),
                    }
                    Ok(EXIT_PATCH_FOUND)
                }
                SessionOutcome::Exhausted(reason) => {
                    info!("EXHAUSTED: {reason}");
                    Ok(EXIT_EXHAUSTED)
                }
                SessionOutcome::BuildFailure { log } => {
                    error!("BUILD_FAILURE: the unmodified program does not build");
                    eprintln!("{log}");
                    Ok(EXIT_BUILD_FAILURE)
                }
            }
        }
    }
}
