//! JSON messages exchanged with enumeration workers.
//!
//! A worker reads one [`SolverRequest`] on stdin and writes one
//! [`SolverResponse`] on stdout. Field names follow the external solver's
//! camelCase contract.

use crate::grammar::{Grammar, GrammarError};
use crate::parser::{parse_type, ParseError};
use crate::task::{Example, Task, TaskHints};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("task {0:?} carries no request type")]
    MissingRequest(String),
    #[error("task {task:?} has a malformed request type: {source}")]
    BadRequest { task: String, source: ParseError },
    #[error("task {0:?} has an example value with no JSON form")]
    BadValue(String),
    #[error("{field} of {value} seconds is not a valid duration")]
    BadSeconds { field: &'static str, value: f64 },
    #[error(transparent)]
    Grammar(#[from] GrammarError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// `-inf` log probabilities travel as JSON `null`.
mod log_probability {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_finite() {
            value.serialize(serializer)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionSpec {
    pub expression: String,
    #[serde(with = "log_probability")]
    pub log_probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DslSpec {
    #[serde(with = "log_probability")]
    pub log_variable: f64,
    pub productions: Vec<ProductionSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleSpec {
    pub inputs: Vec<serde_json::Value>,
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub examples: Vec<ExampleSpec>,
    pub name: String,
    pub maximum_frontier: usize,
    /// Canonical type text. Required by the built-in worker only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
}

impl TaskSpec {
    pub fn from_task(task: &Task, maximum_frontier: usize) -> Result<Self, ProtocolError> {
        let bad = || ProtocolError::BadValue(task.name.clone());
        let examples = task
            .examples
            .iter()
            .map(|e| -> Result<ExampleSpec, ProtocolError> {
                Ok(ExampleSpec {
                    inputs: e
                        .inputs
                        .iter()
                        .map(|v| v.to_json().ok_or_else(bad))
                        .collect::<Result<_, _>>()?,
                    output: e.output.to_json().ok_or_else(bad)?,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            examples,
            name: task.name.clone(),
            maximum_frontier,
            request: Some(task.request.to_string()),
        })
    }

    pub fn to_task(&self) -> Result<Task, ProtocolError> {
        let text = self
            .request
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingRequest(self.name.clone()))?;
        let request = parse_type(text).map_err(|source| ProtocolError::BadRequest {
            task: self.name.clone(),
            source,
        })?;
        let bad = || ProtocolError::BadValue(self.name.clone());
        let examples = self
            .examples
            .iter()
            .map(|e| -> Result<Example, ProtocolError> {
                Ok(Example {
                    inputs: e
                        .inputs
                        .iter()
                        .map(|v| Value::from_json(v).ok_or_else(bad))
                        .collect::<Result<_, _>>()?,
                    output: Value::from_json(&e.output).ok_or_else(bad)?,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Task::new(self.name.clone(), request, examples))
    }
}

/// Wire seconds as a `Duration`. Negative values clamp to zero; NaN and
/// values too large for a `Duration` are rejected.
pub fn seconds(value: f64) -> Option<Duration> {
    if value.is_nan() {
        return None;
    }
    Duration::try_from_secs_f64(value.max(0.0)).ok()
}

/// Cost window of one worker run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub budget_increment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverRequest {
    #[serde(rename = "DSL")]
    pub dsl: DslSpec,
    pub tasks: Vec<TaskSpec>,
    pub program_timeout: Option<f64>,
    pub nc: usize,
    pub timeout: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub budget_increment: f64,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parameters: Option<usize>,
}

impl SolverRequest {
    /// Request for one job. Scoring hints come from the first task.
    pub fn for_job(
        grammar: &Grammar,
        tasks: &[(&Task, usize)],
        window: Window,
        timeout: f64,
        cpus: usize,
        program_timeout: Option<f64>,
    ) -> Result<Self, ProtocolError> {
        let hints = tasks
            .first()
            .map(|(t, _)| t.hints.clone())
            .unwrap_or_default();
        Ok(Self {
            dsl: grammar.to_dsl(),
            tasks: tasks
                .iter()
                .map(|(t, max)| TaskSpec::from_task(t, *max))
                .collect::<Result<_, _>>()?,
            program_timeout,
            nc: cpus,
            timeout,
            lower_bound: window.lower_bound,
            upper_bound: window.upper_bound,
            budget_increment: window.budget_increment,
            verbose: false,
            parameter_penalty: hints.parameter_penalty,
            loss_threshold: hints.likelihood_threshold.map(|t| -t),
            max_parameters: hints.max_parameters,
        })
    }

    pub fn hints(&self) -> TaskHints {
        TaskHints {
            parameter_penalty: self.parameter_penalty,
            likelihood_threshold: self.loss_threshold.map(|t| -t),
            max_parameters: self.max_parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionSpec {
    pub program: String,
    #[serde(with = "log_probability")]
    pub log_likelihood: f64,
    /// Seconds from the worker's start to the discovery of `program`.
    pub time: f64,
}

/// Task name to solutions found.
pub type SolverResponse = BTreeMap<String, Vec<SolutionSpec>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::arithmetic;
    use crate::types::{arrow, tint};

    #[test]
    fn test_request_wire_names() {
        let mut grammar = Grammar::uniform(&arithmetic());
        grammar.log_variable = f64::NEG_INFINITY;
        let task = Task::new(
            "inc",
            arrow(tint(), tint()),
            vec![Example { inputs: vec![Value::Int(1)], output: Value::Int(2) }],
        );
        let window = Window { lower_bound: 0.0, upper_bound: 1.5, budget_increment: 1.5 };
        let request =
            SolverRequest::for_job(&grammar, &[(&task, 5)], window, 10.0, 2, None).unwrap();
        let json = serde_json::to_value(&request).unwrap();

        assert!(json["DSL"]["logVariable"].is_null());
        assert_eq!(json["DSL"]["productions"][2]["expression"], "+");
        assert_eq!(json["tasks"][0]["maximumFrontier"], 5);
        assert_eq!(json["tasks"][0]["request"], "int -> int");
        assert_eq!(json["upperBound"], 1.5);
        assert_eq!(json["nc"], 2);
        assert!(json.get("lossThreshold").is_none());

        let back: SolverRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.dsl.log_variable, f64::NEG_INFINITY);
        assert_eq!(back.tasks[0].to_task().unwrap(), task);
    }

    #[test]
    fn test_seconds_rejects_unrepresentable() {
        assert_eq!(seconds(0.25), Some(Duration::from_millis(250)));
        assert_eq!(seconds(-3.0), Some(Duration::ZERO));
        assert_eq!(seconds(1e300), None);
        assert_eq!(seconds(f64::INFINITY), None);
        assert_eq!(seconds(f64::NAN), None);
    }

    #[test]
    fn test_external_task_without_request() {
        let json = r#"{"examples": [{"inputs": [], "output": 2}], "name": "two", "maximumFrontier": 1}"#;
        let spec: TaskSpec = serde_json::from_str(json).unwrap();
        assert!(matches!(spec.to_task(), Err(ProtocolError::MissingRequest(_))));
    }
}
