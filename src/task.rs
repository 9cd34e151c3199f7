//! Tasks and the likelihood models that score programs against them.

use crate::program::{EvaluationError, Term};
use crate::types::Type;
use crate::value::Value;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub inputs: Vec<Value>,
    pub output: Value,
}

/// Scoring hints forwarded verbatim to external solvers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskHints {
    pub parameter_penalty: Option<f64>,
    pub likelihood_threshold: Option<f64>,
    pub max_parameters: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub request: Type,
    pub examples: Vec<Example>,
    pub hints: TaskHints,
}

impl Task {
    pub fn new(name: impl Into<String>, request: Type, examples: Vec<Example>) -> Self {
        Self {
            name: name.into(),
            request,
            examples,
            hints: TaskHints::default(),
        }
    }

    pub fn with_hints(mut self, hints: TaskHints) -> Self {
        self.hints = hints;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub success: bool,
    pub log_likelihood: f64,
}

impl Score {
    pub const HIT: Score = Score {
        success: true,
        log_likelihood: 0.0,
    };
    pub const MISS: Score = Score {
        success: false,
        log_likelihood: f64::NEG_INFINITY,
    };
}

/// `success` with zero log likelihood is an exact match. Only fatal
/// evaluation errors are returned as `Err`.
pub trait LikelihoodModel: Sync {
    fn score(&self, program: &Term, task: &Task) -> Result<Score, EvaluationError>;
}

/// Hit iff the program maps every example's inputs to its output.
///
/// The evaluation timeout is checked after each example; a program whose
/// example exceeds it is scored as a miss.
#[derive(Debug, Clone, Default)]
pub struct AllOrNothingLikelihoodModel {
    pub evaluation_timeout: Option<Duration>,
}

impl AllOrNothingLikelihoodModel {
    pub fn new(evaluation_timeout: Option<Duration>) -> Self {
        Self { evaluation_timeout }
    }

    fn run(program: &Term, inputs: &[Value]) -> Result<Value, EvaluationError> {
        let mut value = program.evaluate(&[])?;
        for input in inputs {
            value = value.apply(input.clone())?;
        }
        Ok(value)
    }
}

impl LikelihoodModel for AllOrNothingLikelihoodModel {
    fn score(&self, program: &Term, task: &Task) -> Result<Score, EvaluationError> {
        for example in &task.examples {
            let started = Instant::now();
            let outcome = Self::run(program, &example.inputs);
            if let Some(limit) = self.evaluation_timeout {
                if started.elapsed() > limit {
                    return Ok(Score::MISS);
                }
            }
            match outcome {
                Ok(output) if output == example.output => {}
                Ok(_) => return Ok(Score::MISS),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => return Ok(Score::MISS),
            }
        }
        Ok(Score::HIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::lists;
    use crate::parser::Parser;
    use crate::types::{arrow, tint, tlist};

    fn length_task() -> Task {
        let xs = |n: i64| Value::list((0..n).map(Value::Int).collect());
        Task::new(
            "length",
            arrow(tlist(tint()), tint()),
            vec![
                Example { inputs: vec![xs(0)], output: Value::Int(0) },
                Example { inputs: vec![xs(3)], output: Value::Int(3) },
            ],
        )
    }

    #[test]
    fn test_all_or_nothing() {
        let symbols = lists();
        let parser = Parser::new(&symbols);
        let model = AllOrNothingLikelihoodModel::default();
        let task = length_task();

        let right = parser.parse("(lambda (length $0))").unwrap();
        assert_eq!(model.score(&right, &task).unwrap(), Score::HIT);

        // fails on the empty list with a runtime error
        let wrong = parser.parse("(lambda (+ 1 (length (cdr $0))))").unwrap();
        assert!(!model.score(&wrong, &task).unwrap().success);
    }

    #[test]
    fn test_hole_is_fatal() {
        let model = AllOrNothingLikelihoodModel::default();
        let hole = Term::abstraction(Term::FragmentVariable);
        assert!(model.score(&hole, &length_task()).is_err());
    }
}
