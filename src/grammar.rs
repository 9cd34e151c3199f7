//! Weighted productions and the type-directed choice of the next term.

use crate::library::SymbolTable;
use crate::parser::{ParseError, Parser};
use crate::program::Term;
use crate::protocol::{DslSpec, ProductionSpec};
use crate::types::{Type, TypeContext, UnificationError};
use rand::Rng;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Production {
    pub log_probability: f64,
    /// Type scheme of `program`.
    pub tp: Type,
    pub program: Term,
}

impl Production {
    pub fn new(log_probability: f64, program: Term) -> Result<Self, UnificationError> {
        let tp = match &program {
            Term::Primitive(p) => p.tp.clone(),
            Term::Invented(inv) => inv.tp.clone(),
            other => other.infer()?,
        };
        Ok(Self {
            log_probability,
            tp,
            program,
        })
    }
}

/// One way to fill a goal: the term, its normalized log probability, its
/// type after unification with the goal, and the context that unification
/// produced.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub log_probability: f64,
    pub tp: Type,
    pub program: Term,
    pub context: TypeContext,
}

#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("production {expression:?}: {source}")]
    Parse {
        expression: String,
        source: ParseError,
    },
    #[error("production {expression:?} is ill-typed: {source}")]
    IllTyped {
        expression: String,
        source: UnificationError,
    },
}

/// Log probability of referencing an in-scope variable, plus productions.
/// Weights need not be normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Grammar {
    pub log_variable: f64,
    pub productions: Vec<Production>,
}

fn log_sum_exp(xs: impl Iterator<Item = f64> + Clone) -> f64 {
    let largest = xs.clone().fold(f64::NEG_INFINITY, f64::max);
    if largest == f64::NEG_INFINITY {
        return largest;
    }
    largest + xs.map(|x| (x - largest).exp()).sum::<f64>().ln()
}

impl Grammar {
    pub fn new(log_variable: f64, productions: Vec<Production>) -> Self {
        Self {
            log_variable,
            productions,
        }
    }

    /// Every primitive of `symbols` with equal weight.
    pub fn uniform(symbols: &SymbolTable) -> Self {
        let productions = symbols
            .primitives()
            .iter()
            .map(|p| Production {
                log_probability: 0.0,
                tp: p.tp.clone(),
                program: Term::primitive(p),
            })
            .collect();
        Self::new(0.0, productions)
    }

    /// Productions and in-scope variables whose return type unifies with
    /// `request`, renormalized over that subset. Variable mass is split
    /// evenly among matching variables. Candidates of zero probability are
    /// left out.
    pub fn candidates(
        &self,
        request: &Type,
        context: &TypeContext,
        environment: &[Type],
    ) -> Vec<Candidate> {
        let mut out = Vec::with_capacity(self.productions.len() + environment.len());

        for production in &self.productions {
            if production.log_probability == f64::NEG_INFINITY {
                continue;
            }
            let mut ctx = context.clone();
            let tp = ctx.instantiate_in_place(&production.tp);
            if ctx.unify_in_place(tp.returns(), request).is_ok() {
                out.push(Candidate {
                    log_probability: production.log_probability,
                    tp: ctx.apply(&tp),
                    program: production.program.clone(),
                    context: ctx,
                });
            }
        }

        if self.log_variable > f64::NEG_INFINITY {
            let start = out.len();
            for (i, tp) in environment.iter().enumerate() {
                let mut ctx = context.clone();
                // A variable bound to an arrow only shows its return type once resolved.
                let tp = ctx.apply(tp);
                if ctx.unify_in_place(tp.returns(), request).is_ok() {
                    out.push(Candidate {
                        log_probability: self.log_variable,
                        tp: ctx.apply(&tp),
                        program: Term::Index(i),
                        context: ctx,
                    });
                }
            }
            let matching = out.len() - start;
            if matching > 0 {
                let share = (matching as f64).ln();
                for c in &mut out[start..] {
                    c.log_probability -= share;
                }
            }
        }

        let z = log_sum_exp(out.iter().map(|c| c.log_probability));
        for c in &mut out {
            c.log_probability -= z;
        }
        out
    }

    /// Log probability of deriving `program` at `request`, or `-inf` when the
    /// grammar cannot produce it.
    pub fn log_likelihood(&self, request: &Type, program: &Term) -> f64 {
        let mut context = TypeContext::new();
        let request = context.instantiate_in_place(request);
        self.log_likelihood_under(&request, program, &mut context, &[])
    }

    fn log_likelihood_under(
        &self,
        request: &Type,
        program: &Term,
        context: &mut TypeContext,
        environment: &[Type],
    ) -> f64 {
        let request = context.apply(request);
        if let Some((argument, result)) = request.as_arrow() {
            let Term::Abstraction(body) = program else {
                return f64::NEG_INFINITY;
            };
            let mut inner = Vec::with_capacity(environment.len() + 1);
            inner.push(argument.clone());
            inner.extend_from_slice(environment);
            return self.log_likelihood_under(result, body, context, &inner);
        }

        let (head, arguments) = program.application_parse();
        let Some(chosen) = self
            .candidates(&request, context, environment)
            .into_iter()
            .find(|c| &c.program == head)
        else {
            return f64::NEG_INFINITY;
        };
        let argument_types = chosen.tp.function_arguments();
        if argument_types.len() != arguments.len() {
            return f64::NEG_INFINITY;
        }
        *context = chosen.context;
        let mut total = chosen.log_probability;
        for (tp, argument) in argument_types.iter().zip(arguments) {
            total += self.log_likelihood_under(tp, argument, context, environment);
            if total == f64::NEG_INFINITY {
                break;
            }
        }
        total
    }

    /// Draws a program of type `request`. Returns `None` when a draw runs
    /// past `max_depth` or hits a goal no candidate can fill.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        request: &Type,
        rng: &mut R,
        max_depth: usize,
    ) -> Option<Term> {
        let mut context = TypeContext::new();
        let request = context.instantiate_in_place(request);
        self.sample_under(&request, rng, &mut context, &[], max_depth)
    }

    fn sample_under<R: Rng + ?Sized>(
        &self,
        request: &Type,
        rng: &mut R,
        context: &mut TypeContext,
        environment: &[Type],
        depth: usize,
    ) -> Option<Term> {
        let request = context.apply(request);
        if let Some((argument, result)) = request.as_arrow() {
            let mut inner = Vec::with_capacity(environment.len() + 1);
            inner.push(argument.clone());
            inner.extend_from_slice(environment);
            let body = self.sample_under(result, rng, context, &inner, depth)?;
            return Some(Term::abstraction(body));
        }
        if depth == 0 {
            return None;
        }

        let candidates = self.candidates(&request, context, environment);
        let mut draw = rng.gen::<f64>();
        let chosen = candidates
            .iter()
            .find(|c| {
                draw -= c.log_probability.exp();
                draw <= 0.0
            })
            .or_else(|| candidates.last())?;

        *context = chosen.context.clone();
        let mut program = chosen.program.clone();
        for tp in chosen.tp.function_arguments() {
            let argument = self.sample_under(&tp, rng, context, environment, depth - 1)?;
            program = Term::application(program, argument);
        }
        Some(program)
    }

    /// Wire form for workers. Productions print in canonical term syntax.
    pub fn to_dsl(&self) -> DslSpec {
        DslSpec {
            log_variable: self.log_variable,
            productions: self
                .productions
                .iter()
                .map(|p| ProductionSpec {
                    expression: p.program.to_string(),
                    log_probability: p.log_probability,
                })
                .collect(),
        }
    }

    pub fn from_dsl(dsl: &DslSpec, symbols: &SymbolTable) -> Result<Self, GrammarError> {
        let parser = Parser::new(symbols);
        let productions = dsl
            .productions
            .iter()
            .map(|spec| {
                let program = parser.parse(&spec.expression).map_err(|source| {
                    GrammarError::Parse {
                        expression: spec.expression.clone(),
                        source,
                    }
                })?;
                Production::new(spec.log_probability, program).map_err(|source| {
                    GrammarError::IllTyped {
                        expression: spec.expression.clone(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(dsl.log_variable, productions))
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:.3}\tt0\t$_", self.log_variable)?;
        for p in &self.productions {
            writeln!(f, "{:.3}\t{}\t{}", p.log_probability, p.tp, p.program)?;
        }
        Ok(())
    }
}
