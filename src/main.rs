use clap::{Parser, Subcommand};
use ecsearch::grammar::Grammar;
use ecsearch::library::{self, SymbolTable, LIBRARIES};
use ecsearch::parser::{parse_type, ParseError};
use ecsearch::protocol::{seconds, ProtocolError, TaskSpec};
use ecsearch::scheduler::{Scheduler, SchedulerConfig, SchedulerError};
use ecsearch::worker::{self, ProcessLauncher, ThreadLauncher, WorkerError};
use ecsearch::enumerate_window;
use std::io;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
enum CliError {
    #[error("unknown library {0:?} (available: {1})")]
    UnknownLibrary(String, String),
    #[error("timeout of {0} seconds is out of range")]
    Timeout(f64),
    #[error("bad type: {0}")]
    Type(#[from] ParseError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Parser)]
#[command(name = "ecsearch")]
#[command(about = "Typed enumerative program search", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Built-in primitive library
    #[arg(long, global = true, env = "ECSEARCH_LIBRARY", default_value = "list")]
    library: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a solver request on stdin and write the response on stdout
    Worker,

    /// Print every program of a uniform grammar within a cost window
    Enumerate {
        /// Requested type, e.g. "list(int) -> int"
        #[arg(long)]
        request: String,
        #[arg(long, default_value_t = 0.0)]
        lower: f64,
        #[arg(long)]
        upper: f64,
        #[arg(long, default_value_t = 99)]
        max_depth: usize,
    },

    /// Search for programs solving the tasks of a JSON file
    Search {
        /// JSON array of tasks, each with a "request" type
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long, env = "ECSEARCH_CPUS", default_value_t = 1)]
        cpus: usize,
        /// Seconds of search per job
        #[arg(long, default_value_t = 10.0)]
        timeout: f64,
        #[arg(long, default_value_t = 10)]
        maximum_frontier: usize,
        /// One job per task with a tapered budget
        #[arg(long)]
        per_task: bool,
        /// Run workers as threads instead of child processes
        #[arg(long)]
        threads: bool,
    },
}

fn symbols(name: &str) -> Result<SymbolTable, CliError> {
    library::builtin(name).ok_or_else(|| CliError::UnknownLibrary(name.to_string(), LIBRARIES.join(", ")))
}

fn run(cli: Cli) -> Result<(), CliError> {
    let symbols = symbols(&cli.library)?;
    match cli.command {
        Commands::Worker => {
            worker::run_stdio(&symbols, io::stdin().lock(), io::stdout().lock())?;
        }
        Commands::Enumerate {
            request,
            lower,
            upper,
            max_depth,
        } => {
            let request = parse_type(&request)?;
            let grammar = Grammar::uniform(&symbols);
            let _ = enumerate_window(&grammar, &request, lower, upper, max_depth, &mut |program, log_prior| {
                println!("{:.3}\t{}", -log_prior, program);
                ControlFlow::Continue(())
            });
        }
        Commands::Search {
            tasks,
            cpus,
            timeout,
            maximum_frontier,
            per_task,
            threads,
        } => {
            let specs: Vec<TaskSpec> = serde_json::from_reader(std::fs::File::open(tasks)?)?;
            let tasks = specs
                .iter()
                .map(TaskSpec::to_task)
                .collect::<Result<Vec<_>, _>>()?;
            let enumeration_timeout = seconds(timeout).ok_or(CliError::Timeout(timeout))?;
            let base = if per_task { SchedulerConfig::per_task() } else { SchedulerConfig::default() };
            let config = SchedulerConfig {
                cpus,
                enumeration_timeout,
                maximum_frontier,
                ..base
            };
            let grammar = Grammar::uniform(&symbols);
            let symbols = Arc::new(symbols);
            let result = if threads {
                Scheduler::new(config, ThreadLauncher::new(Arc::clone(&symbols)), symbols).run(&grammar, &tasks)?
            } else {
                let launcher = ProcessLauncher::current_exe(&cli.library)?.with_kill_grace(Duration::from_secs(5));
                Scheduler::new(config, launcher, symbols).run(&grammar, &tasks)?
            };

            let report: serde_json::Map<String, serde_json::Value> = tasks
                .iter()
                .zip(result.frontiers.iter().zip(&result.search_times))
                .map(|(task, (frontier, time))| {
                    let programs: Vec<_> = frontier
                        .clone()
                        .top_k(maximum_frontier)
                        .entries()
                        .iter()
                        .map(|e| {
                            serde_json::json!({
                                "program": e.program.to_string(),
                                "logPrior": e.log_prior,
                                "logLikelihood": e.log_likelihood,
                            })
                        })
                        .collect();
                    let entry = serde_json::json!({
                        "programs": programs,
                        "time": time.map(|t| t.as_secs_f64()),
                    });
                    (task.name.clone(), entry)
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr).without_time())
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
