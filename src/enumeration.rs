//! Budgeted enumeration of programs in order of description length.
//!
//! A window `(lower, upper]` of description lengths is searched
//! depth-first: each goal type is filled by every candidate the grammar
//! offers, arguments left to right, and a branch is cut as soon as its
//! accumulated cost leaves the window. Arrow goals introduce an abstraction
//! and do not consume depth; every application head consumes one level.

use crate::frontier::{Frontier, FrontierEntry};
use crate::grammar::Grammar;
use crate::program::{EvaluationError, Term};
use crate::task::{LikelihoodModel, Task};
use crate::types::{Type, TypeContext};
use rayon::prelude::*;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tracing::debug;

/// Slack for pruning on accumulated floating-point costs. The final
/// membership test of a program in its window is exact.
const EPSILON: f64 = 1e-9;

type Continuation<'k> = dyn FnMut(f64, TypeContext, Term) -> ControlFlow<()> + 'k;

struct Search<'g> {
    grammar: &'g Grammar,
}

impl<'g> Search<'g> {
    /// Calls `k` with (log probability, context, term) for every term of
    /// type `request` whose cost `c` satisfies `lower < c <= upper`. Both
    /// bounds are what remains of the window after the cost already spent.
    #[allow(clippy::too_many_arguments)]
    fn enumerate(
        &self,
        context: &TypeContext,
        environment: &[Type],
        request: &Type,
        lower: f64,
        upper: f64,
        depth: usize,
        k: &mut Continuation<'_>,
    ) -> ControlFlow<()> {
        if upper < -EPSILON || depth == 0 {
            return ControlFlow::Continue(());
        }

        let request = context.apply(request);
        if let Some((argument, result)) = request.as_arrow() {
            let mut inner = Vec::with_capacity(environment.len() + 1);
            inner.push(argument.clone());
            inner.extend_from_slice(environment);
            return self.enumerate(context, &inner, result, lower, upper, depth, &mut |l, ctx, body| {
                k(l, ctx, Term::abstraction(body))
            });
        }

        for candidate in self.grammar.candidates(&request, context, environment) {
            let l = candidate.log_probability;
            if -l > upper + EPSILON {
                continue;
            }
            let arguments = candidate.tp.function_arguments();
            self.enumerate_application(
                &candidate.context,
                environment,
                candidate.program,
                &arguments,
                lower + l,
                upper + l,
                depth - 1,
                &mut |al, ctx, t| k(al + l, ctx, t),
            )?;
        }
        ControlFlow::Continue(())
    }

    #[allow(clippy::too_many_arguments)]
    fn enumerate_application(
        &self,
        context: &TypeContext,
        environment: &[Type],
        function: Term,
        arguments: &[Type],
        lower: f64,
        upper: f64,
        depth: usize,
        k: &mut Continuation<'_>,
    ) -> ControlFlow<()> {
        if upper < -EPSILON {
            return ControlFlow::Continue(());
        }
        let Some((first, rest)) = arguments.split_first() else {
            if lower < 0.0 && 0.0 <= upper {
                return k(0.0, context.clone(), function);
            }
            return ControlFlow::Continue(());
        };

        let request = context.apply(first);
        self.enumerate(
            context,
            environment,
            &request,
            f64::NEG_INFINITY,
            upper,
            depth,
            &mut |arg_l, ctx, arg| {
                let applied = Term::application(function.clone(), arg);
                self.enumerate_application(
                    &ctx,
                    environment,
                    applied,
                    rest,
                    lower + arg_l,
                    upper + arg_l,
                    depth,
                    &mut |rest_l, rest_ctx, result| k(rest_l + arg_l, rest_ctx, result),
                )
            },
        )
    }
}

/// Visits every program of type `request` with description length in
/// `(lower, upper]`, exactly once, together with its log prior. Programs
/// nested deeper than `max_depth` application heads are skipped.
pub fn enumerate_window(
    grammar: &Grammar,
    request: &Type,
    lower: f64,
    upper: f64,
    max_depth: usize,
    visitor: &mut dyn FnMut(Term, f64) -> ControlFlow<()>,
) -> ControlFlow<()> {
    let mut context = TypeContext::new();
    let request = context.instantiate_in_place(request);
    Search { grammar }.enumerate(
        &context,
        &[],
        &request,
        lower,
        upper,
        max_depth,
        &mut |l, _, program| visitor(program, l),
    )
}

#[derive(Debug, Clone)]
pub struct EnumerationConfig {
    pub lower_bound: f64,
    /// Absolute ceiling on the budget.
    pub upper_bound: f64,
    pub budget_increment: f64,
    pub maximum_depth: usize,
    pub timeout: Option<Duration>,
    /// Each window is split into this many disjoint sub-windows searched
    /// concurrently.
    pub cpus: usize,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            lower_bound: 0.0,
            upper_bound: 100.0,
            budget_increment: 1.5,
            maximum_depth: 99,
            timeout: None,
            cpus: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    /// The budget passed the configured ceiling.
    Exhausted,
    /// Every task reached its maximum frontier size.
    FrontierFull,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub program: Term,
    pub log_prior: f64,
    pub log_likelihood: f64,
    /// Time since the search started when the program was found.
    pub time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    /// Best solutions by posterior, best first.
    pub solutions: Vec<Solution>,
    pub first_hit: Option<Duration>,
}

impl TaskOutcome {
    pub fn frontier(&self) -> Frontier {
        Frontier::new(self.solutions.iter().map(|s| FrontierEntry {
            program: s.program.clone(),
            log_prior: s.log_prior,
            log_likelihood: s.log_likelihood,
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub status: SearchStatus,
    /// One entry per task, in task order.
    pub tasks: Vec<TaskOutcome>,
    pub explored: usize,
}

enum WindowEnd {
    Completed,
    TimedOut,
    Failed(EvaluationError),
}

struct WindowResult {
    hits: Vec<(usize, Solution)>,
    explored: usize,
    end: WindowEnd,
}

struct Job<'a> {
    grammar: &'a Grammar,
    request: &'a Type,
    tasks: &'a [Task],
    model: &'a dyn LikelihoodModel,
    config: &'a EnumerationConfig,
    started: Instant,
}

impl Job<'_> {
    fn search_window(&self, lower: f64, upper: f64) -> WindowResult {
        let mut hits = Vec::new();
        let mut explored = 0;
        let mut end = WindowEnd::Completed;

        let _ = enumerate_window(
            self.grammar,
            self.request,
            lower,
            upper,
            self.config.maximum_depth,
            &mut |program, log_prior| {
                explored += 1;
                for (idx, task) in self.tasks.iter().enumerate() {
                    match self.model.score(&program, task) {
                        Ok(score) if score.success => hits.push((
                            idx,
                            Solution {
                                program: program.clone(),
                                log_prior,
                                log_likelihood: score.log_likelihood,
                                time: self.started.elapsed(),
                            },
                        )),
                        Ok(_) => {}
                        Err(e) => {
                            end = WindowEnd::Failed(e);
                            return ControlFlow::Break(());
                        }
                    }
                }
                match self.config.timeout {
                    Some(limit) if self.started.elapsed() > limit => {
                        end = WindowEnd::TimedOut;
                        ControlFlow::Break(())
                    }
                    _ => ControlFlow::Continue(()),
                }
            },
        );

        WindowResult {
            hits,
            explored,
            end,
        }
    }

    /// Splits `(lower, upper]` into disjoint sub-windows, one per CPU.
    fn search_split(&self, lower: f64, upper: f64) -> Vec<WindowResult> {
        let cpus = self.config.cpus.max(1);
        if cpus == 1 {
            return vec![self.search_window(lower, upper)];
        }
        let bounds: Vec<f64> = (0..=cpus)
            .map(|i| match i {
                0 => lower,
                i if i == cpus => upper,
                i => lower + (upper - lower) * i as f64 / cpus as f64,
            })
            .collect();

        bounds
            .par_windows(2)
            .map(|w| self.search_window(w[0], w[1]))
            .collect()
    }
}

/// Searches successive windows for programs solving any of `tasks`, all of
/// which share `request`. Stops when every task holds its maximum number of
/// solutions, when the budget passes `config.upper_bound`, or on timeout;
/// the partial result is returned in every case. Only a fatal evaluation
/// error is an `Err`.
pub fn enumerate_for_tasks(
    grammar: &Grammar,
    request: &Type,
    tasks: &[Task],
    maximum_frontiers: &[usize],
    model: &dyn LikelihoodModel,
    config: &EnumerationConfig,
) -> Result<SearchOutcome, EvaluationError> {
    let job = Job {
        grammar,
        request,
        tasks,
        model,
        config,
        started: Instant::now(),
    };
    let mut outcomes = vec![TaskOutcome::default(); tasks.len()];
    let mut explored = 0;
    let mut previous = config.lower_bound;
    let mut budget = config.lower_bound + config.budget_increment;

    let full = |outcomes: &[TaskOutcome]| {
        outcomes
            .iter()
            .zip(maximum_frontiers)
            .all(|(o, &max)| o.solutions.len() >= max)
    };

    let status = loop {
        if full(&outcomes) {
            break SearchStatus::FrontierFull;
        }

        let mut window_explored = 0;
        let mut timed_out = false;
        for window in job.search_split(previous, budget) {
            window_explored += window.explored;
            for (idx, solution) in window.hits {
                let outcome = &mut outcomes[idx];
                outcome.first_hit = Some(match outcome.first_hit {
                    Some(t) => t.min(solution.time),
                    None => solution.time,
                });
                outcome.solutions.push(solution);
            }
            match window.end {
                WindowEnd::Completed => {}
                WindowEnd::TimedOut => timed_out = true,
                WindowEnd::Failed(e) => return Err(e),
            }
        }
        explored += window_explored;
        debug!(
            "enumerated {} programs with {:.2} < MDL <= {:.2}",
            window_explored, previous, budget
        );

        if timed_out {
            debug!("search timed out after {:?}", job.started.elapsed());
            break SearchStatus::TimedOut;
        }
        previous = budget;
        budget += config.budget_increment;
        if budget > config.upper_bound {
            break SearchStatus::Exhausted;
        }
    };

    for (outcome, &max) in outcomes.iter_mut().zip(maximum_frontiers) {
        outcome.solutions.sort_by(|a, b| {
            (b.log_prior + b.log_likelihood).total_cmp(&(a.log_prior + a.log_likelihood))
        });
        outcome.solutions.truncate(max);
    }

    Ok(SearchOutcome {
        status,
        tasks: outcomes,
        explored,
    })
}

/// Single-task form of [`enumerate_for_tasks`].
pub fn enumerate_for_task(
    grammar: &Grammar,
    task: &Task,
    model: &dyn LikelihoodModel,
    maximum_frontier: usize,
    config: &EnumerationConfig,
) -> Result<(TaskOutcome, SearchStatus), EvaluationError> {
    let mut outcome = enumerate_for_tasks(
        grammar,
        &task.request,
        std::slice::from_ref(task),
        &[maximum_frontier],
        model,
        config,
    )?;
    Ok((outcome.tasks.remove(0), outcome.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::arithmetic;
    use crate::types::{arrow, tint};

    fn collect(grammar: &Grammar, request: &Type, lower: f64, upper: f64) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        let _ = enumerate_window(grammar, request, lower, upper, 6, &mut |p, l| {
            out.push((p.to_string(), l));
            ControlFlow::Continue(())
        });
        out
    }

    #[test]
    fn test_costs_fall_in_window() {
        let g = Grammar::uniform(&arithmetic());
        for (p, l) in collect(&g, &tint(), 2.0, 6.0) {
            assert!(-l > 2.0 && -l <= 6.0, "{} has cost {}", p, -l);
        }
    }

    #[test]
    fn test_arrow_request_binds_variable() {
        let g = Grammar::uniform(&arithmetic());
        let found = collect(&g, &arrow(tint(), tint()), 0.0, 2.0);
        // six equally likely leaves at the int goal
        assert!(found.iter().any(|(p, _)| p == "(lambda $0)"));
        assert!(found.iter().any(|(p, _)| p == "(lambda 1)"));
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_visitor_can_stop_search() {
        let g = Grammar::uniform(&arithmetic());
        let mut seen = 0;
        let flow = enumerate_window(&g, &tint(), 0.0, 10.0, 6, &mut |_, _| {
            seen += 1;
            if seen == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(seen, 3);
    }
}
