//! Enumeration workers and the launchers that run them.
//!
//! A worker turns one [`SolverRequest`] into one [`SolverResponse`]. The
//! scheduler starts workers through a [`WorkerLauncher`] and hears back from
//! them only through [`Completion`] messages on a single channel.

use crate::enumeration::{enumerate_for_tasks, EnumerationConfig};
use crate::grammar::{Grammar, GrammarError};
use crate::library::SymbolTable;
use crate::program::EvaluationError;
use crate::protocol::{seconds, ProtocolError, SolutionSpec, SolverRequest, SolverResponse};
use crate::task::{AllOrNothingLikelihoodModel, Task};
use crate::types::Type;
use std::any::Any;
use std::io::{self, Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::Sender;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Grammar(#[from] GrammarError),
    #[error("fatal evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),
    #[error("malformed request: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Built-in worker: enumerates every task of `request` with the request's
/// grammar and window, scoring with the all-or-nothing model.
pub fn solve(request: &SolverRequest, symbols: &SymbolTable) -> Result<SolverResponse, WorkerError> {
    let started = Instant::now();
    let grammar = Grammar::from_dsl(&request.dsl, symbols)?;
    let hints = request.hints();
    let tasks = request
        .tasks
        .iter()
        .map(|spec| -> Result<Task, WorkerError> {
            Ok(spec.to_task()?.with_hints(hints.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let program_timeout = match request.program_timeout.filter(|t| *t > 0.0) {
        Some(t) => Some(seconds(t).ok_or(ProtocolError::BadSeconds {
            field: "programTimeout",
            value: t,
        })?),
        None => None,
    };
    let model = AllOrNothingLikelihoodModel::new(program_timeout);
    let timeout = seconds(request.timeout).ok_or(ProtocolError::BadSeconds {
        field: "timeout",
        value: request.timeout,
    })?;

    // Tasks of one request normally share a type; enumerate each type once.
    let mut groups: Vec<(Type, Vec<usize>)> = Vec::new();
    for (idx, task) in tasks.iter().enumerate() {
        match groups.iter_mut().find(|(t, _)| *t == task.request) {
            Some((_, members)) => members.push(idx),
            None => groups.push((task.request.clone(), vec![idx])),
        }
    }

    let mut response = SolverResponse::new();
    for task in &tasks {
        response.insert(task.name.clone(), Vec::new());
    }
    for (request_type, members) in groups {
        let config = EnumerationConfig {
            lower_bound: request.lower_bound,
            upper_bound: request.upper_bound,
            budget_increment: request.budget_increment,
            timeout: Some(timeout.saturating_sub(started.elapsed())),
            cpus: request.nc.max(1),
            ..Default::default()
        };
        let group: Vec<Task> = members.iter().map(|&i| tasks[i].clone()).collect();
        let maximum_frontiers: Vec<usize> = members
            .iter()
            .map(|&i| request.tasks[i].maximum_frontier)
            .collect();
        let outcome =
            enumerate_for_tasks(&grammar, &request_type, &group, &maximum_frontiers, &model, &config)?;
        debug!(
            "{} programs of type {} explored, {:?}",
            outcome.explored, request_type, outcome.status
        );
        for (task, result) in group.iter().zip(outcome.tasks) {
            let solutions = result
                .solutions
                .into_iter()
                .map(|s| SolutionSpec {
                    program: s.program.to_string(),
                    log_likelihood: s.log_likelihood,
                    time: s.time.as_secs_f64(),
                })
                .collect();
            response.insert(task.name.clone(), solutions);
        }
    }
    Ok(response)
}

/// Worker process entry point: request on `input`, response on `output`.
pub fn run_stdio(
    symbols: &SymbolTable,
    input: impl Read,
    mut output: impl Write,
) -> Result<(), WorkerError> {
    let request: SolverRequest = serde_json::from_reader(input)?;
    let response = solve(&request, symbols)?;
    serde_json::to_writer(&mut output, &response)?;
    output.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFailure {
    pub message: String,
    /// Diagnostic output of the worker (stderr, error chain or panic payload).
    pub trace: String,
}

#[derive(Debug)]
pub struct Completion {
    pub worker: usize,
    pub outcome: Result<SolverResponse, WorkerFailure>,
}

/// The one [`Completion`] a worker owes the scheduler. Dropping a reply
/// without sending it reports the worker as failed.
#[derive(Debug)]
pub struct Reply {
    worker: usize,
    sender: Option<Sender<Completion>>,
}

impl Reply {
    pub fn new(worker: usize, sender: Sender<Completion>) -> Self {
        Self {
            worker,
            sender: Some(sender),
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn send(mut self, outcome: Result<SolverResponse, WorkerFailure>) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: Result<SolverResponse, WorkerFailure>) {
        if let Some(sender) = self.sender.take() {
            // The scheduler may already have given up on the run.
            let _ = sender.send(Completion {
                worker: self.worker,
                outcome,
            });
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        self.deliver(Err(WorkerFailure {
            message: "worker ended without a response".to_string(),
            trace: String::new(),
        }));
    }
}

pub trait WorkerLauncher {
    /// Starts worker `reply.worker()` on `request`. The worker's outcome goes
    /// through `reply` once it finishes.
    fn launch(&self, request: SolverRequest, reply: Reply) -> io::Result<()>;

    /// Stops every worker still running. Launchers that cannot preempt their
    /// workers do nothing.
    fn cancel(&self) {}
}

/// Runs each worker as a child process speaking the JSON protocol over its
/// standard streams, so it can be killed from outside.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    /// When set, a worker still running this long past its own timeout is
    /// killed and reported as having found nothing.
    kill_grace: Option<Duration>,
    /// Bumped by `cancel`; workers launched under an older value are killed.
    generation: Arc<AtomicU64>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            kill_grace: None,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// This executable's `worker` subcommand using library `library`.
    pub fn current_exe(library: &str) -> io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            vec!["worker".to_string(), "--library".to_string(), library.to_string()],
        ))
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = Some(grace);
        self
    }
}

fn read_all(mut stream: impl Read + Send + 'static) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut out = String::new();
        let _ = stream.read_to_string(&mut out);
        out
    })
}

enum Exit {
    Finished(ExitStatus),
    Killed,
    Cancelled,
}

fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Instant>,
    cancelled: impl Fn() -> bool,
) -> io::Result<Exit> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Exit::Finished(status));
        }
        let exit = if cancelled() {
            Exit::Cancelled
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            Exit::Killed
        } else {
            thread::sleep(POLL_INTERVAL);
            continue;
        };
        child.kill()?;
        child.wait()?;
        return Ok(exit);
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, request: SolverRequest, reply: Reply) -> io::Result<()> {
        let worker = reply.worker();
        let payload = serde_json::to_vec(&request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // A timeout too large for a `Duration` means no deadline at all.
        let deadline = self.kill_grace.and_then(|grace| {
            Instant::now()
                .checked_add(seconds(request.timeout)?)?
                .checked_add(grace)
        });
        let generation = Arc::clone(&self.generation);
        let launched_in = generation.load(Ordering::SeqCst);

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take().map(read_all);
        let stderr = child.stderr.take().map(read_all);

        thread::spawn(move || {
            if let Some(stdin) = stdin.as_mut() {
                // A worker that dies before reading shows up in its exit status.
                let _ = stdin.write_all(&payload);
            }
            drop(stdin);

            let exit = wait_with_deadline(&mut child, deadline, || {
                generation.load(Ordering::SeqCst) != launched_in
            });
            let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
            let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

            let outcome = match exit {
                Ok(Exit::Killed) => {
                    warn!("worker {} exceeded its timeout and was killed", worker);
                    Ok(SolverResponse::new())
                }
                Ok(Exit::Cancelled) => {
                    debug!("worker {} cancelled", worker);
                    Ok(SolverResponse::new())
                }
                Ok(Exit::Finished(status)) if status.success() => {
                    if !stderr.is_empty() {
                        debug!("worker {} stderr:\n{}", worker, stderr);
                    }
                    serde_json::from_str::<SolverResponse>(&stdout).map_err(|e| WorkerFailure {
                        message: format!("malformed worker response: {}", e),
                        trace: stderr,
                    })
                }
                Ok(Exit::Finished(status)) => Err(WorkerFailure {
                    message: format!("worker exited with {}", status),
                    trace: stderr,
                }),
                Err(e) => Err(WorkerFailure {
                    message: format!("lost track of worker: {}", e),
                    trace: stderr,
                }),
            };
            reply.send(outcome);
        });
        Ok(())
    }

    fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs each worker on its own thread in this process. Cannot preempt a
/// worker; panics are reported as failures.
#[derive(Debug, Clone)]
pub struct ThreadLauncher {
    symbols: Arc<SymbolTable>,
}

impl ThreadLauncher {
    pub fn new(symbols: Arc<SymbolTable>) -> Self {
        Self { symbols }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, request: SolverRequest, reply: Reply) -> io::Result<()> {
        let worker = reply.worker();
        let symbols = Arc::clone(&self.symbols);
        thread::Builder::new()
            .name(format!("worker-{}", worker))
            .spawn(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(|| solve(&request, &symbols))) {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => Err(WorkerFailure {
                        message: e.to_string(),
                        trace: format!("{:?}", e),
                    }),
                    Err(payload) => Err(WorkerFailure {
                        message: "worker panicked".to_string(),
                        trace: panic_message(payload.as_ref()),
                    }),
                };
                debug!("worker {} finished", worker);
                reply.send(outcome);
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::arithmetic;
    use crate::protocol::{TaskSpec, Window};
    use crate::task::Example;
    use crate::types::tint;
    use crate::value::Value;
    use std::sync::mpsc;

    fn two_request() -> SolverRequest {
        let mut grammar = Grammar::uniform(&arithmetic());
        grammar.log_variable = f64::NEG_INFINITY;
        let task = Task::new("two", tint(), vec![Example { inputs: vec![], output: Value::Int(2) }]);
        let window = Window { lower_bound: 0.0, upper_bound: 8.0, budget_increment: 8.0 };
        SolverRequest::for_job(&grammar, &[(&task, 3)], window, 10.0, 1, None).unwrap()
    }

    #[test]
    fn test_solve_finds_two() {
        let response = solve(&two_request(), &arithmetic()).unwrap();
        let programs: Vec<_> = response["two"].iter().map(|s| s.program.as_str()).collect();
        assert!(programs.contains(&"(+ 1 1)"));
        assert!(response["two"].iter().all(|s| s.log_likelihood == 0.0));
    }

    #[test]
    fn test_missing_request_is_worker_error() {
        let mut request = two_request();
        request.tasks[0] = TaskSpec { request: None, ..request.tasks[0].clone() };
        assert!(matches!(
            solve(&request, &arithmetic()),
            Err(WorkerError::Protocol(ProtocolError::MissingRequest(_)))
        ));
    }

    #[test]
    fn test_thread_launcher_reports_completion() {
        let launcher = ThreadLauncher::new(Arc::new(arithmetic()));
        let (tx, rx) = mpsc::channel();
        launcher.launch(two_request(), Reply::new(7, tx)).unwrap();
        let done = rx.recv().unwrap();
        assert_eq!(done.worker, 7);
        assert!(!done.outcome.unwrap()["two"].is_empty());
    }

    #[test]
    fn test_dropped_reply_reports_failure() {
        let (tx, rx) = mpsc::channel();
        drop(Reply::new(3, tx));
        let done = rx.recv().unwrap();
        assert_eq!(done.worker, 3);
        assert!(done.outcome.is_err());
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_oversized_timeout_is_worker_error() {
        let mut request = two_request();
        request.timeout = 1e300;
        assert!(matches!(
            solve(&request, &arithmetic()),
            Err(WorkerError::Protocol(ProtocolError::BadSeconds { field: "timeout", .. }))
        ));
        let mut request = two_request();
        request.program_timeout = Some(f64::INFINITY);
        assert!(matches!(
            solve(&request, &arithmetic()),
            Err(WorkerError::Protocol(ProtocolError::BadSeconds { field: "programTimeout", .. }))
        ));
    }

    #[test]
    fn test_run_stdio() {
        let input = serde_json::to_vec(&two_request()).unwrap();
        let mut output = Vec::new();
        run_stdio(&arithmetic(), input.as_slice(), &mut output).unwrap();
        let response: SolverResponse = serde_json::from_slice(&output).unwrap();
        assert!(response.contains_key("two"));
    }
}
