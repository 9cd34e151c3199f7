//! Program terms: a small typed lambda calculus over named primitives,
//! with de Bruijn indices for variables.

use crate::types::{arrow, Type, TypeContext, UnificationError};
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("shift would make a free index negative")]
pub struct ShiftError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("attempt to evaluate a fragment variable")]
    FragmentVariable,
    #[error("index ${0} is not bound")]
    UnboundIndex(usize),
    #[error("cannot apply a value of kind {0}")]
    NotAFunction(&'static str),
    #[error("{0}")]
    Runtime(String),
}

impl EvaluationError {
    /// Holes reaching the evaluator are contract violations; everything else
    /// is an ordinary failure of the program on its input.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvaluationError::FragmentVariable)
    }
}

/// A named leaf with a type scheme and a runtime value. Identity is the name.
pub struct Primitive {
    pub name: String,
    pub tp: Type,
    pub value: Value,
}

impl Primitive {
    pub fn new(name: &str, tp: Type, value: Value) -> Self {
        Self {
            name: name.to_string(),
            tp,
            value,
        }
    }
}

impl PartialEq for Primitive {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Primitive {}

impl Hash for Primitive {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.name, self.tp)
    }
}

/// A closed, previously discovered term reused as a single production.
#[derive(Debug)]
pub struct Invented {
    pub body: Arc<Term>,
    pub tp: Type,
}

impl Invented {
    pub fn new(body: Term) -> Result<Self, UnificationError> {
        let tp = body.infer()?;
        Ok(Self {
            body: Arc::new(body),
            tp,
        })
    }
}

impl PartialEq for Invented {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
    }
}

impl Eq for Invented {}

impl Hash for Invented {
    fn hash<H: Hasher>(&self, state: &mut H) {
        0u8.hash(state);
        self.body.hash(state);
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Application(Arc<Term>, Arc<Term>),
    Abstraction(Arc<Term>),
    Index(usize),
    Primitive(Arc<Primitive>),
    Invented(Arc<Invented>),
    FragmentVariable,
}

impl Term {
    pub fn application(f: Term, x: Term) -> Term {
        Term::Application(Arc::new(f), Arc::new(x))
    }

    pub fn abstraction(body: Term) -> Term {
        Term::Abstraction(Arc::new(body))
    }

    pub fn apply_all(head: Term, arguments: impl IntoIterator<Item = Term>) -> Term {
        arguments.into_iter().fold(head, Term::application)
    }

    pub fn primitive(p: &Arc<Primitive>) -> Term {
        Term::Primitive(Arc::clone(p))
    }

    pub fn invented(body: Term) -> Result<Term, UnificationError> {
        Ok(Term::Invented(Arc::new(Invented::new(body)?)))
    }

    pub fn evaluate(&self, environment: &[Value]) -> Result<Value, EvaluationError> {
        match self {
            Term::Index(i) => environment
                .get(*i)
                .cloned()
                .ok_or(EvaluationError::UnboundIndex(*i)),
            Term::Abstraction(body) => {
                let body = Arc::clone(body);
                let captured = environment.to_vec();
                Ok(Value::function(move |x| {
                    let mut inner = Vec::with_capacity(captured.len() + 1);
                    inner.push(x);
                    inner.extend(captured.iter().cloned());
                    body.evaluate(&inner)
                }))
            }
            Term::Application(f, x) => {
                let f = f.evaluate(environment)?;
                let x = x.evaluate(environment)?;
                f.apply(x)
            }
            Term::Primitive(p) => Ok(p.value.clone()),
            Term::Invented(inv) => inv.body.evaluate(&[]),
            Term::FragmentVariable => Err(EvaluationError::FragmentVariable),
        }
    }

    /// Infers a type under `environment` (innermost binder first). Free
    /// indices are keyed by their distance past the environment in
    /// `free_variables` so repeated occurrences share a type.
    pub fn infer_type(
        &self,
        context: &TypeContext,
        environment: &[Type],
        free_variables: &mut FxHashMap<usize, Type>,
    ) -> Result<(TypeContext, Type), UnificationError> {
        let mut context = context.clone();
        let t = self.infer_in_place(&mut context, environment, free_variables)?;
        Ok((context, t))
    }

    fn infer_in_place(
        &self,
        context: &mut TypeContext,
        environment: &[Type],
        free_variables: &mut FxHashMap<usize, Type>,
    ) -> Result<Type, UnificationError> {
        match self {
            Term::Index(i) => {
                if *i < environment.len() {
                    return Ok(context.apply(&environment[*i]));
                }
                let key = *i - environment.len();
                if let Some(t) = free_variables.get(&key) {
                    return Ok(context.apply(t));
                }
                let t = context.fresh();
                free_variables.insert(key, t.clone());
                Ok(t)
            }
            Term::Application(f, x) => {
                let ft = f.infer_in_place(context, environment, free_variables)?;
                let xt = x.infer_in_place(context, environment, free_variables)?;
                let result = context.fresh();
                context.unify_in_place(&ft, &arrow(xt, result.clone()))?;
                Ok(context.apply(&result))
            }
            Term::Abstraction(body) => {
                let argument = context.fresh();
                let mut inner = Vec::with_capacity(environment.len() + 1);
                inner.push(argument.clone());
                inner.extend_from_slice(environment);
                let result = body.infer_in_place(context, &inner, free_variables)?;
                Ok(context.apply(&arrow(argument, result)))
            }
            Term::Primitive(p) => Ok(context.instantiate_in_place(&p.tp)),
            Term::Invented(inv) => Ok(context.instantiate_in_place(&inv.tp)),
            Term::FragmentVariable => Ok(context.fresh()),
        }
    }

    /// Canonical type of the term in an empty context.
    pub fn infer(&self) -> Result<Type, UnificationError> {
        let mut context = TypeContext::new();
        let t = self.infer_in_place(&mut context, &[], &mut FxHashMap::default())?;
        Ok(context.resolve(&t))
    }

    pub fn can_have_type(&self, request: &Type) -> bool {
        let mut context = TypeContext::new();
        let Ok(t) = self.infer_in_place(&mut context, &[], &mut FxHashMap::default()) else {
            return false;
        };
        let request = context.instantiate_in_place(request);
        context.unify_in_place(&t, &request).is_ok()
    }

    pub fn shift(&self, offset: i64) -> Result<Term, ShiftError> {
        self.shift_at(offset, 0)
    }

    /// Adds `offset` to every index that is free below `depth` binders.
    pub fn shift_at(&self, offset: i64, depth: usize) -> Result<Term, ShiftError> {
        match self {
            Term::Index(i) if *i < depth => Ok(self.clone()),
            Term::Index(i) => {
                let shifted = *i as i64 + offset;
                if shifted < 0 {
                    return Err(ShiftError);
                }
                Ok(Term::Index(shifted as usize))
            }
            Term::Application(f, x) => Ok(Term::application(
                f.shift_at(offset, depth)?,
                x.shift_at(offset, depth)?,
            )),
            Term::Abstraction(body) => Ok(Term::abstraction(body.shift_at(offset, depth + 1)?)),
            // Inventions are closed and a hole stands for no index, so
            // neither has free indices to move.
            Term::Primitive(_) | Term::Invented(_) | Term::FragmentVariable => Ok(self.clone()),
        }
    }

    fn lift(&self) -> Term {
        match self.shift_at(1, 0) {
            Ok(t) => t,
            Err(ShiftError) => unreachable!("raising indices cannot go negative"),
        }
    }

    /// Replaces every occurrence of `old` with `new`, lifting both by one
    /// level under each abstraction.
    pub fn substitute(&self, old: &Term, new: &Term) -> Term {
        if self == old {
            return new.clone();
        }
        match self {
            Term::Application(f, x) => {
                Term::application(f.substitute(old, new), x.substitute(old, new))
            }
            Term::Abstraction(body) => {
                Term::abstraction(body.substitute(&old.lift(), &new.lift()))
            }
            _ => self.clone(),
        }
    }

    /// Every subterm in preorder, paired with its number of enclosing binders.
    pub fn walk(&self) -> Vec<(usize, &Term)> {
        let mut out = Vec::new();
        let mut stack = vec![(0usize, self)];
        while let Some((depth, term)) = stack.pop() {
            out.push((depth, term));
            match term {
                Term::Application(f, x) => {
                    stack.push((depth, x.as_ref()));
                    stack.push((depth, f.as_ref()));
                }
                Term::Abstraction(body) => stack.push((depth + 1, body.as_ref())),
                _ => {}
            }
        }
        out
    }

    pub fn is_closed(&self) -> bool {
        self.walk().into_iter().all(|(depth, t)| match t {
            Term::FragmentVariable => false,
            Term::Index(i) => *i < depth,
            _ => true,
        })
    }

    pub fn number_of_free_variables(&self) -> usize {
        self.walk()
            .into_iter()
            .filter_map(|(depth, t)| match t {
                Term::Index(i) if *i >= depth => Some(*i - depth + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn size(&self) -> usize {
        match self {
            Term::Application(f, x) => f.size() + x.size(),
            Term::Abstraction(body) => body.size(),
            _ => 1,
        }
    }

    /// Head of the application spine and its arguments, left to right.
    pub fn application_parse(&self) -> (&Term, Vec<&Term>) {
        let mut arguments = Vec::new();
        let mut head = self;
        while let Term::Application(f, x) = head {
            arguments.push(x.as_ref());
            head = f;
        }
        arguments.reverse();
        (head, arguments)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        enum Frame<'a> {
            // The flag marks the function position of an application, which
            // is printed without its own parentheses.
            Enter(&'a Term, bool),
            Text(&'a str),
        }

        let mut out = String::new();
        let mut stack = vec![Frame::Enter(self, false)];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Text(s) => out.push_str(s),
                Frame::Enter(t, is_function) => match t {
                    Term::Application(g, x) => {
                        if !is_function {
                            stack.push(Frame::Text(")"));
                        }
                        stack.push(Frame::Enter(x.as_ref(), false));
                        stack.push(Frame::Text(" "));
                        stack.push(Frame::Enter(g.as_ref(), true));
                        if !is_function {
                            stack.push(Frame::Text("("));
                        }
                    }
                    Term::Abstraction(body) => {
                        stack.push(Frame::Text(")"));
                        stack.push(Frame::Enter(body.as_ref(), false));
                        stack.push(Frame::Text("(lambda "));
                    }
                    Term::Index(i) => out.push_str(&format!("${}", i)),
                    Term::Primitive(p) => out.push_str(&p.name),
                    Term::Invented(inv) => {
                        stack.push(Frame::Enter(inv.body.as_ref(), false));
                        stack.push(Frame::Text("#"));
                    }
                    Term::FragmentVariable => out.push_str("??"),
                },
            }
        }

        f.write_str(&out)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{tint, tvar};

    fn plus() -> Arc<Primitive> {
        Arc::new(Primitive::new(
            "+",
            crate::types::arrows(vec![tint(), tint(), tint()]),
            Value::function(|a| {
                let a = a.as_int()?;
                Ok(Value::function(move |b| Ok(Value::Int(a + b.as_int()?))))
            }),
        ))
    }

    #[test]
    fn test_show_flattens_application_spine() {
        let p = plus();
        let t = Term::abstraction(Term::apply_all(
            Term::primitive(&p),
            [Term::Index(0), Term::Index(1)],
        ));
        assert_eq!(t.to_string(), "(lambda (+ $0 $1))");
    }

    #[test]
    fn test_free_index_types_are_shared() {
        let p = plus();
        let t = Term::apply_all(Term::primitive(&p), [Term::Index(0), Term::Index(0)]);
        let mut free = FxHashMap::default();
        let (ctx, tp) = t.infer_type(&TypeContext::new(), &[], &mut free).unwrap();
        assert_eq!(tp, tint());
        assert_eq!(ctx.apply(&free[&0]), tint());
    }

    #[test]
    fn test_identity_is_polymorphic() {
        let id = Term::abstraction(Term::Index(0));
        assert_eq!(id.infer().unwrap(), arrow(tvar(0), tvar(0)));
    }

    #[test]
    fn test_shift_leaves_holes_alone() {
        let p = plus();
        let t = Term::apply_all(Term::primitive(&p), [Term::FragmentVariable, Term::Index(2)]);
        let shifted = t.shift(-2).unwrap();
        assert_eq!(
            shifted,
            Term::apply_all(Term::primitive(&p), [Term::FragmentVariable, Term::Index(0)])
        );
        assert_eq!(Term::FragmentVariable.shift(-5), Ok(Term::FragmentVariable));
        assert_eq!(t.number_of_free_variables(), 3);
    }

    #[test]
    fn test_shift_below_zero_fails() {
        assert_eq!(Term::Index(0).shift(-1), Err(ShiftError));
        let bound = Term::abstraction(Term::Index(0));
        assert_eq!(bound.shift(-1), Ok(bound.clone()));
    }

    #[test]
    fn test_substitute_lifts_under_binder() {
        let t = Term::abstraction(Term::Index(1));
        let replaced = t.substitute(&Term::Index(0), &Term::Index(3));
        assert_eq!(replaced, Term::abstraction(Term::Index(4)));
    }

    #[test]
    fn test_fragment_variable_cannot_evaluate() {
        let err = Term::FragmentVariable.evaluate(&[]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_closed_and_free_counts() {
        let t = Term::abstraction(Term::application(Term::Index(0), Term::Index(2)));
        assert!(!t.is_closed());
        assert_eq!(t.number_of_free_variables(), 2);
        assert!(Term::abstraction(Term::Index(0)).is_closed());
    }
}
