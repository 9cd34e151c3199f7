//! Symbol tables of primitives and the built-in primitive libraries.

use crate::program::{EvaluationError, Primitive};
use crate::types::{arrows, tbool, tint, tlist, tvar};
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::sync::Arc;

pub const LIBRARIES: &[&str] = &["arithmetic", "list"];

const RANGE_LIMIT: i64 = 10_000;

/// Name-to-primitive table. Each name has one live instance per table; the
/// first registration wins.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    primitives: Vec<Arc<Primitive>>,
    by_name: FxHashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, primitive: Primitive) -> Arc<Primitive> {
        if let Some(&idx) = self.by_name.get(&primitive.name) {
            return Arc::clone(&self.primitives[idx]);
        }
        let shared = Arc::new(primitive);
        self.by_name
            .insert(shared.name.clone(), self.primitives.len());
        self.primitives.push(Arc::clone(&shared));
        shared
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Primitive>> {
        self.by_name.get(name).map(|&idx| &self.primitives[idx])
    }

    pub fn primitives(&self) -> &[Arc<Primitive>] {
        &self.primitives
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn extend(&mut self, other: &SymbolTable) {
        for p in &other.primitives {
            if !self.by_name.contains_key(&p.name) {
                self.by_name.insert(p.name.clone(), self.primitives.len());
                self.primitives.push(Arc::clone(p));
            }
        }
    }
}

/// Built-in library by name, see [`LIBRARIES`].
pub fn builtin(name: &str) -> Option<SymbolTable> {
    match name {
        "arithmetic" => Some(arithmetic()),
        "list" => Some(lists()),
        _ => None,
    }
}

fn curry2<F>(f: F) -> Value
where
    F: Fn(Value, Value) -> Result<Value, EvaluationError> + Clone + Send + Sync + 'static,
{
    Value::function(move |a| {
        let f = f.clone();
        Ok(Value::function(move |b| f(a.clone(), b)))
    })
}

fn curry3<F>(f: F) -> Value
where
    F: Fn(Value, Value, Value) -> Result<Value, EvaluationError> + Clone + Send + Sync + 'static,
{
    Value::function(move |a| {
        let f = f.clone();
        Ok(curry2(move |b, c| f(a.clone(), b, c)))
    })
}

fn overflow() -> EvaluationError {
    EvaluationError::Runtime("integer overflow".to_string())
}

fn register_arithmetic(table: &mut SymbolTable) {
    let binary = || arrows(vec![tint(), tint(), tint()]);
    table.register(Primitive::new("0", tint(), Value::Int(0)));
    table.register(Primitive::new("1", tint(), Value::Int(1)));
    table.register(Primitive::new(
        "+",
        binary(),
        curry2(|a, b| a.as_int()?.checked_add(b.as_int()?).map(Value::Int).ok_or_else(overflow)),
    ));
    table.register(Primitive::new(
        "-",
        binary(),
        curry2(|a, b| a.as_int()?.checked_sub(b.as_int()?).map(Value::Int).ok_or_else(overflow)),
    ));
    table.register(Primitive::new(
        "*",
        binary(),
        curry2(|a, b| a.as_int()?.checked_mul(b.as_int()?).map(Value::Int).ok_or_else(overflow)),
    ));
}

pub fn arithmetic() -> SymbolTable {
    let mut table = SymbolTable::new();
    register_arithmetic(&mut table);
    table
}

pub fn lists() -> SymbolTable {
    let mut table = SymbolTable::new();
    let t0 = || tvar(0);
    let t1 = || tvar(1);

    table.register(Primitive::new("empty", tlist(t0()), Value::list(Vec::new())));
    table.register(Primitive::new(
        "cons",
        arrows(vec![t0(), tlist(t0()), tlist(t0())]),
        curry2(|x, xs| {
            let xs = xs.as_list()?;
            let mut out = Vec::with_capacity(xs.len() + 1);
            out.push(x);
            out.extend(xs.iter().cloned());
            Ok(Value::list(out))
        }),
    ));
    table.register(Primitive::new(
        "car",
        arrows(vec![tlist(t0()), t0()]),
        Value::function(|xs| {
            xs.as_list()?
                .first()
                .cloned()
                .ok_or_else(|| EvaluationError::Runtime("car of empty list".to_string()))
        }),
    ));
    table.register(Primitive::new(
        "cdr",
        arrows(vec![tlist(t0()), tlist(t0())]),
        Value::function(|xs| {
            let xs = xs.as_list()?;
            if xs.is_empty() {
                return Err(EvaluationError::Runtime("cdr of empty list".to_string()));
            }
            Ok(Value::list(xs[1..].to_vec()))
        }),
    ));
    table.register(Primitive::new(
        "empty?",
        arrows(vec![tlist(t0()), tbool()]),
        Value::function(|xs| Ok(Value::Bool(xs.as_list()?.is_empty()))),
    ));
    table.register(Primitive::new(
        "if",
        arrows(vec![tbool(), t0(), t0(), t0()]),
        curry3(|c, yes, no| Ok(if c.as_bool()? { yes } else { no })),
    ));
    table.register(Primitive::new(
        "map",
        arrows(vec![arrows(vec![t0(), t1()]), tlist(t0()), tlist(t1())]),
        curry2(|f, xs| {
            let out = xs
                .as_list()?
                .iter()
                .map(|x| f.apply(x.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::list(out))
        }),
    ));
    table.register(Primitive::new(
        "fold",
        arrows(vec![
            tlist(t0()),
            t1(),
            arrows(vec![t0(), t1(), t1()]),
            t1(),
        ]),
        curry3(|xs, init, f| {
            let mut acc = init;
            for x in xs.as_list()?.iter().rev() {
                acc = f.apply(x.clone())?.apply(acc)?;
            }
            Ok(acc)
        }),
    ));
    table.register(Primitive::new(
        "length",
        arrows(vec![tlist(t0()), tint()]),
        Value::function(|xs| Ok(Value::Int(xs.as_list()?.len() as i64))),
    ));
    table.register(Primitive::new(
        "range",
        arrows(vec![tint(), tlist(tint())]),
        Value::function(|n| {
            let n = n.as_int()?;
            if !(0..=RANGE_LIMIT).contains(&n) {
                return Err(EvaluationError::Runtime(format!("range of {}", n)));
            }
            Ok(Value::list((0..n).map(Value::Int).collect()))
        }),
    ));
    table.register(Primitive::new(
        "eq?",
        arrows(vec![tint(), tint(), tbool()]),
        curry2(|a, b| Ok(Value::Bool(a.as_int()? == b.as_int()?))),
    ));
    table.register(Primitive::new(
        "gt?",
        arrows(vec![tint(), tint(), tbool()]),
        curry2(|a, b| Ok(Value::Bool(a.as_int()? > b.as_int()?))),
    ));
    register_arithmetic(&mut table);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Term;

    #[test]
    fn test_first_registration_wins() {
        let mut table = arithmetic();
        let before = Arc::clone(table.get("+").unwrap());
        let again = table.register(Primitive::new("+", tint(), Value::Int(7)));
        assert!(Arc::ptr_eq(&before, &again));
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_fold_sums_list() {
        let table = lists();
        let p = |name: &str| Term::primitive(table.get(name).unwrap());
        // (fold xs 0 +)
        let program = Term::apply_all(p("fold"), [Term::Index(0), p("0"), p("+")]);
        let xs = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let out = program.evaluate(&[xs]).unwrap();
        assert_eq!(out, Value::Int(6));
    }

    #[test]
    fn test_car_of_empty_is_runtime_failure() {
        let table = lists();
        let program = Term::application(
            Term::primitive(table.get("car").unwrap()),
            Term::primitive(table.get("empty").unwrap()),
        );
        let err = program.evaluate(&[]).unwrap_err();
        assert!(!err.is_fatal());
    }
}
