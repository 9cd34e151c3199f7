//! Runtime values produced by evaluating terms.

use crate::program::EvaluationError;
use std::fmt;
use std::sync::Arc;

pub type Function = Arc<dyn Fn(Value) -> Result<Value, EvaluationError> + Send + Sync>;

#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Arc<Vec<Value>>),
    Function(Function),
}

impl Value {
    pub fn function<F>(f: F) -> Value
    where
        F: Fn(Value) -> Result<Value, EvaluationError> + Send + Sync + 'static,
    {
        Value::Function(Arc::new(f))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(items))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "real",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Function(_) => "function",
        }
    }

    pub fn apply(&self, argument: Value) -> Result<Value, EvaluationError> {
        match self {
            Value::Function(f) => f(argument),
            other => Err(EvaluationError::NotAFunction(other.kind())),
        }
    }

    pub fn as_int(&self) -> Result<i64, EvaluationError> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(EvaluationError::Runtime(format!("expected int, got {}", other.kind()))),
        }
    }

    pub fn as_bool(&self) -> Result<bool, EvaluationError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(EvaluationError::Runtime(format!("expected bool, got {}", other.kind()))),
        }
    }

    pub fn as_list(&self) -> Result<&Arc<Vec<Value>>, EvaluationError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(EvaluationError::Runtime(format!("expected list, got {}", other.kind()))),
        }
    }

    /// JSON form used on the worker wire. Functions have none.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(x) => serde_json::Value::from(*x),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Option<Vec<_>>>()?,
            ),
            Value::Function(_) => return None,
        })
    }

    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Int(i)),
                None => n.as_f64().map(Value::Float),
            },
            serde_json::Value::String(s) => Some(Value::Str(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Value::from_json)
                .collect::<Option<Vec<_>>>()
                .map(Value::list),
            serde_json::Value::Null | serde_json::Value::Object(_) => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Function(_) => f.write_str("<function>"),
        }
    }
}
