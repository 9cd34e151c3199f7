//! Allocation of a fixed pool of CPUs across enumeration jobs.
//!
//! Tasks are grouped into jobs that share a grammar and a requested type
//! (or one job per task). Each round, idle jobs that still have time left
//! are ordered by how far their search has got, CPUs are dealt out to them
//! round-robin, and every job that received CPUs gets a worker for the next
//! window above its lower bound. The lower bound advances at launch, so
//! windows of one job never overlap.

use crate::frontier::{Frontier, FrontierEntry};
use crate::grammar::Grammar;
use crate::library::SymbolTable;
use crate::parser::Parser;
use crate::protocol::{seconds, ProtocolError, SolverRequest, SolverResponse, Window};
use crate::task::Task;
use crate::types::Type;
use crate::worker::{Completion, Reply, WorkerLauncher};
use rustc_hash::FxHashMap;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("worker {worker} failed: {message}")]
    WorkerFailed {
        worker: usize,
        message: String,
        trace: String,
    },
    #[error("cannot launch worker: {0}")]
    Launch(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{tasks} tasks but {grammars} grammars")]
    GrammarCount { tasks: usize, grammars: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// One job per distinct (grammar, request type).
    Job,
    /// One job per task.
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetSchedule {
    Constant(f64),
    /// Narrower windows as the search deepens.
    Tapered,
}

impl BudgetSchedule {
    pub fn increment(&self, lower_bound: f64) -> f64 {
        match self {
            BudgetSchedule::Constant(step) => *step,
            BudgetSchedule::Tapered if lower_bound < 24.0 => 1.0,
            BudgetSchedule::Tapered if lower_bound < 27.0 => 0.5,
            BudgetSchedule::Tapered => 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cpus: usize,
    /// Wall time each job may spend in workers.
    pub enumeration_timeout: Duration,
    /// Hits after which a task is no longer searched.
    pub maximum_frontier: usize,
    pub evaluation_timeout: Option<Duration>,
    pub granularity: Granularity,
    pub budget_schedule: BudgetSchedule,
    /// A job with less time than this left is not launched again.
    pub launch_margin: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            enumeration_timeout: Duration::from_secs(10),
            maximum_frontier: 10,
            evaluation_timeout: None,
            granularity: Granularity::Job,
            budget_schedule: BudgetSchedule::Constant(1.5),
            launch_margin: Duration::from_millis(500),
        }
    }
}

impl SchedulerConfig {
    /// One job per task with a tapered budget, for per-task grammars.
    pub fn per_task() -> Self {
        Self {
            granularity: Granularity::Task,
            budget_schedule: BudgetSchedule::Tapered,
            ..Self::default()
        }
    }
}

/// Accumulates running time across start/stop intervals.
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    started: Option<Instant>,
}

impl Stopwatch {
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    pub fn running(&self) -> bool {
        self.started.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.accumulated + self.started.map_or(Duration::ZERO, |s| s.elapsed())
    }
}

struct Job {
    grammar: usize,
    request: Type,
    tasks: Vec<usize>,
    lower_bound: f64,
    stopwatch: Stopwatch,
    running: usize,
}

struct InFlight {
    job: usize,
    cpus: usize,
    tasks: Vec<usize>,
    elapsed_at_launch: Duration,
}

/// Orders `idle` jobs (id, lower bound) by lower bound and deals out
/// `free_cpus` one at a time round-robin. Returns (id, cpus) for each job
/// that received at least one CPU, least explored first.
pub fn plan_allocation(idle: &[(usize, f64)], free_cpus: usize) -> Vec<(usize, usize)> {
    let mut order = idle.to_vec();
    order.sort_by(|a, b| a.1.total_cmp(&b.1));
    let mut allocation = vec![0usize; order.len()];
    let mut remaining = free_cpus;
    while remaining > 0 && !order.is_empty() {
        for slot in allocation.iter_mut() {
            if remaining == 0 {
                break;
            }
            *slot += 1;
            remaining -= 1;
        }
    }
    order
        .into_iter()
        .zip(allocation)
        .filter(|(_, cpus)| *cpus > 0)
        .map(|((id, _), cpus)| (id, cpus))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumerationResult {
    /// Per task, in input order.
    pub frontiers: Vec<Frontier>,
    /// Earliest time at which a worker found a solution, per task.
    pub search_times: Vec<Option<Duration>>,
}

pub struct Scheduler<L> {
    config: SchedulerConfig,
    launcher: L,
    symbols: Arc<SymbolTable>,
}

impl<L: WorkerLauncher> Scheduler<L> {
    pub fn new(config: SchedulerConfig, launcher: L, symbols: Arc<SymbolTable>) -> Self {
        Self {
            config,
            launcher,
            symbols,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Searches every task with one shared grammar.
    pub fn run(&self, grammar: &Grammar, tasks: &[Task]) -> Result<EnumerationResult, SchedulerError> {
        self.schedule(&[grammar], &vec![0; tasks.len()], tasks)
    }

    /// Searches task `i` with `grammars[i]`. Equal grammars are pooled.
    pub fn run_per_task(
        &self,
        grammars: &[Grammar],
        tasks: &[Task],
    ) -> Result<EnumerationResult, SchedulerError> {
        if grammars.len() != tasks.len() {
            return Err(SchedulerError::GrammarCount {
                tasks: tasks.len(),
                grammars: grammars.len(),
            });
        }
        let mut distinct: Vec<&Grammar> = Vec::new();
        let mut assignment = Vec::with_capacity(tasks.len());
        for g in grammars {
            let idx = match distinct.iter().position(|d| *d == g) {
                Some(idx) => idx,
                None => {
                    distinct.push(g);
                    distinct.len() - 1
                }
            };
            assignment.push(idx);
        }
        self.schedule(&distinct, &assignment, tasks)
    }

    fn group(&self, assignment: &[usize], tasks: &[Task]) -> Vec<Job> {
        let mut jobs: Vec<Job> = Vec::new();
        for (t, task) in tasks.iter().enumerate() {
            let grammar = assignment[t];
            let existing = match self.config.granularity {
                Granularity::Job => jobs
                    .iter_mut()
                    .find(|j| j.grammar == grammar && j.request == task.request),
                Granularity::Task => None,
            };
            match existing {
                Some(job) => job.tasks.push(t),
                None => jobs.push(Job {
                    grammar,
                    request: task.request.clone(),
                    tasks: vec![t],
                    lower_bound: 0.0,
                    stopwatch: Stopwatch::default(),
                    running: 0,
                }),
            }
        }
        jobs
    }

    /// On a fatal error, workers still running are cancelled before the
    /// error is returned.
    fn schedule(
        &self,
        grammars: &[&Grammar],
        assignment: &[usize],
        tasks: &[Task],
    ) -> Result<EnumerationResult, SchedulerError> {
        self.drive(grammars, assignment, tasks).inspect_err(|e| {
            warn!("cancelling outstanding workers: {}", e);
            self.launcher.cancel();
        })
    }

    fn drive(
        &self,
        grammars: &[&Grammar],
        assignment: &[usize],
        tasks: &[Task],
    ) -> Result<EnumerationResult, SchedulerError> {
        let config = &self.config;
        let cpus = config.cpus.max(1);
        let started = Instant::now();
        let mut jobs = self.group(assignment, tasks);
        let mut frontiers = vec![Frontier::default(); tasks.len()];
        let mut search_times: Vec<Option<Duration>> = vec![None; tasks.len()];
        let mut in_flight: FxHashMap<usize, InFlight> = FxHashMap::default();
        let mut active_cpus = 0;
        let mut next_worker = 0;
        let (sender, receiver) = mpsc::channel::<Completion>();

        loop {
            for job in jobs.iter_mut() {
                let expired = job.stopwatch.elapsed() > config.enumeration_timeout;
                job.tasks
                    .retain(|&t| !expired && frontiers[t].hits() < config.maximum_frontier);
            }

            let idle: Vec<(usize, f64)> = jobs
                .iter()
                .enumerate()
                .filter(|(_, j)| {
                    !j.tasks.is_empty()
                        && j.running == 0
                        && j.stopwatch.elapsed() + config.launch_margin < config.enumeration_timeout
                })
                .map(|(idx, j)| (idx, j.lower_bound))
                .collect();

            if active_cpus < cpus {
                for (idx, allotted) in plan_allocation(&idle, cpus - active_cpus) {
                    let job = &mut jobs[idx];
                    let increment = config.budget_schedule.increment(job.lower_bound);
                    let window = Window {
                        lower_bound: job.lower_bound,
                        upper_bound: job.lower_bound + increment,
                        budget_increment: increment,
                    };
                    let remaining = config.enumeration_timeout.saturating_sub(job.stopwatch.elapsed());
                    let members: Vec<(&Task, usize)> = job
                        .tasks
                        .iter()
                        .map(|&t| {
                            let wanted = config.maximum_frontier.saturating_sub(frontiers[t].hits());
                            (&tasks[t], wanted)
                        })
                        .collect();
                    let request = SolverRequest::for_job(
                        grammars[job.grammar],
                        &members,
                        window,
                        remaining.as_secs_f64(),
                        allotted,
                        config.evaluation_timeout.map(|t| t.as_secs_f64()),
                    )?;

                    info!(
                        "launching {} ({} tasks) with {} CPUs, {:.2} < MDL <= {:.2}, timeout {:.1}s",
                        job.request,
                        job.tasks.len(),
                        allotted,
                        window.lower_bound,
                        window.upper_bound,
                        remaining.as_secs_f64()
                    );
                    self.launcher.launch(request, Reply::new(next_worker, sender.clone()))?;
                    in_flight.insert(
                        next_worker,
                        InFlight {
                            job: idx,
                            cpus: allotted,
                            tasks: job.tasks.clone(),
                            elapsed_at_launch: job.stopwatch.elapsed(),
                        },
                    );
                    next_worker += 1;
                    job.stopwatch.start();
                    job.running += 1;
                    job.lower_bound += increment;
                    active_cpus += allotted;
                }
            }

            if in_flight.is_empty() {
                break;
            }

            // Every launched worker holds a `Reply`, which always answers, and
            // `sender` outlives the loop, so this only ends on a dead channel.
            let Ok(completion) = receiver.recv() else {
                break;
            };
            let Some(flight) = in_flight.remove(&completion.worker) else {
                warn!("completion from unknown worker {}", completion.worker);
                continue;
            };
            active_cpus -= flight.cpus;
            let job = &mut jobs[flight.job];
            job.running -= 1;
            if job.running == 0 {
                job.stopwatch.stop();
            }

            let response = match completion.outcome {
                Ok(response) => response,
                Err(failure) => {
                    error!(
                        "worker {} failed: {}\n{}",
                        completion.worker, failure.message, failure.trace
                    );
                    return Err(SchedulerError::WorkerFailed {
                        worker: completion.worker,
                        message: failure.message,
                        trace: failure.trace,
                    });
                }
            };
            let grammar = grammars[job.grammar];
            for &t in &flight.tasks {
                let (frontier, first) = self.rescore(grammar, &tasks[t], &response);
                if let Some(dt) = first {
                    let dt = dt + flight.elapsed_at_launch;
                    if search_times[t].is_none() {
                        info!(
                            "first solution to {} after {:.2}s ({:.2}s since start)",
                            tasks[t].name,
                            dt.as_secs_f64(),
                            started.elapsed().as_secs_f64()
                        );
                    }
                    search_times[t] = Some(search_times[t].map_or(dt, |best| best.min(dt)));
                }
                frontiers[t] = std::mem::take(&mut frontiers[t]).combine(frontier);
            }
        }

        info!(
            "enumeration of {} tasks finished in {:.2}s",
            tasks.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(EnumerationResult {
            frontiers,
            search_times,
        })
    }

    /// Frontier of the well-typed programs a worker returned for `task`, with
    /// priors recomputed under `grammar`, and the earliest time among them.
    fn rescore(
        &self,
        grammar: &Grammar,
        task: &Task,
        response: &SolverResponse,
    ) -> (Frontier, Option<Duration>) {
        let parser = Parser::new(&self.symbols);
        let mut entries = Vec::new();
        let mut first: Option<Duration> = None;
        for solution in response.get(&task.name).into_iter().flatten() {
            let program = match parser.parse(&solution.program) {
                Ok(p) => p,
                Err(e) => {
                    warn!("discarding unparsable program for {}: {}", task.name, e);
                    continue;
                }
            };
            if !program.can_have_type(&task.request) {
                debug!("discarding {} for {}: not a {}", program, task.name, task.request);
                continue;
            }
            let Some(time) = seconds(solution.time) else {
                warn!(
                    "discarding {} for {}: bad discovery time {}",
                    program, task.name, solution.time
                );
                continue;
            };
            first = Some(first.map_or(time, |t| t.min(time)));
            entries.push(FrontierEntry {
                log_prior: grammar.log_likelihood(&task.request, &program),
                program,
                log_likelihood: solution.log_likelihood,
            });
        }
        (Frontier::new(entries), first)
    }
}
