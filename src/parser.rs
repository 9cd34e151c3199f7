//! Textual forms of terms and types.
//!
//! Terms print as fully parenthesized prefix expressions: `(f x y)`,
//! `(lambda body)`, `$i`, `#body`, `??`. Types print as `name`,
//! `name(arg, ...)`, `tN` for variables and right-associative `a -> b`.

use crate::library::SymbolTable;
use crate::program::Term;
use crate::types::{arrow, Type};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse at {remainder:?}")]
pub struct ParseError {
    pub remainder: String,
}

impl ParseError {
    fn at(remainder: &str) -> Self {
        Self {
            remainder: remainder.to_string(),
        }
    }
}

type Parsed<'s, T> = Option<(T, &'s str)>;

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || c == '(' || c == ')'
}

fn skip_ws(s: &str) -> &str {
    s.trim_start()
}

/// Longest non-empty run of non-delimiter characters.
fn symbol(s: &str) -> Parsed<'_, &str> {
    let end = s.find(is_delimiter).unwrap_or(s.len());
    if end == 0 {
        None
    } else {
        Some((&s[..end], &s[end..]))
    }
}

fn keyword<'s>(s: &'s str, word: &str) -> Option<&'s str> {
    let rest = s.strip_prefix(word)?;
    match rest.chars().next() {
        Some(c) if !is_delimiter(c) => None,
        _ => Some(rest),
    }
}

/// Term parser resolving primitive names against one symbol table.
pub struct Parser<'a> {
    symbols: &'a SymbolTable,
}

impl<'a> Parser<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self {
        Self { symbols }
    }

    pub fn parse(&self, text: &str) -> Result<Term, ParseError> {
        let text = skip_ws(text);
        match self.term(text) {
            Some((term, rest)) if skip_ws(rest).is_empty() => Ok(term),
            Some((_, rest)) => Err(ParseError::at(skip_ws(rest))),
            None => Err(ParseError::at(text)),
        }
    }

    /// Sub-parsers in priority order; the first to accept a prefix wins.
    fn term<'s>(&self, s: &'s str) -> Parsed<'s, Term> {
        let s = skip_ws(s);
        self.application(s)
            .or_else(|| self.abstraction(s))
            .or_else(|| self.index(s))
            .or_else(|| self.invented(s))
            .or_else(|| self.fragment_variable(s))
            .or_else(|| self.primitive(s))
    }

    fn application<'s>(&self, s: &'s str) -> Parsed<'s, Term> {
        let s = s.strip_prefix('(')?;
        let (head, mut rest) = self.term(s)?;
        let mut arguments = Vec::new();
        loop {
            rest = skip_ws(rest);
            if let Some(after) = rest.strip_prefix(')') {
                // `(e)` is `e`.
                return Some((Term::apply_all(head, arguments), after));
            }
            let (x, after) = self.term(rest)?;
            arguments.push(x);
            rest = after;
        }
    }

    fn abstraction<'s>(&self, s: &'s str) -> Parsed<'s, Term> {
        let s = skip_ws(s.strip_prefix('(')?);
        let s = keyword(s, "lambda").or_else(|| keyword(s, "\\"))?;
        let (body, rest) = self.term(s)?;
        let rest = skip_ws(rest).strip_prefix(')')?;
        Some((Term::abstraction(body), rest))
    }

    fn index<'s>(&self, s: &'s str) -> Parsed<'s, Term> {
        let s = s.strip_prefix('$')?;
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let i = s[..end].parse().ok()?;
        Some((Term::Index(i), &s[end..]))
    }

    fn invented<'s>(&self, s: &'s str) -> Parsed<'s, Term> {
        let s = s.strip_prefix('#')?;
        let (body, rest) = self.term(s)?;
        Some((Term::invented(body).ok()?, rest))
    }

    fn fragment_variable<'s>(&self, s: &'s str) -> Parsed<'s, Term> {
        let rest = keyword(s, "??").or_else(|| keyword(s, "?"))?;
        Some((Term::FragmentVariable, rest))
    }

    fn primitive<'s>(&self, s: &'s str) -> Parsed<'s, Term> {
        let (name, rest) = symbol(s)?;
        let p = self.symbols.get(name)?;
        Some((Term::primitive(p), rest))
    }
}

pub fn parse_type(text: &str) -> Result<Type, ParseError> {
    let text = skip_ws(text);
    match type_expr(text) {
        Some((t, rest)) if skip_ws(rest).is_empty() => Ok(t),
        Some((_, rest)) => Err(ParseError::at(skip_ws(rest))),
        None => Err(ParseError::at(text)),
    }
}

fn type_expr(s: &str) -> Parsed<'_, Type> {
    let (left, rest) = type_atom(skip_ws(s))?;
    match skip_ws(rest).strip_prefix("->") {
        Some(after) => {
            let (right, rest) = type_expr(after)?;
            Some((arrow(left, right), rest))
        }
        None => Some((left, rest)),
    }
}

fn type_name(s: &str) -> Parsed<'_, &str> {
    let end = s
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '\''))
        .unwrap_or(s.len());
    if end == 0 {
        None
    } else {
        Some((&s[..end], &s[end..]))
    }
}

fn type_atom(s: &str) -> Parsed<'_, Type> {
    if let Some(inner) = s.strip_prefix('(') {
        let (t, rest) = type_expr(inner)?;
        let rest = skip_ws(rest).strip_prefix(')')?;
        return Some((t, rest));
    }
    let (name, rest) = type_name(s)?;
    if let Some(id) = name.strip_prefix('t').and_then(|n| n.parse::<usize>().ok()) {
        return Some((Type::Variable(id), rest));
    }
    let Some(mut rest) = rest.strip_prefix('(') else {
        return Some((Type::Constructed(name.to_string(), Vec::new()), rest));
    };
    let mut args = Vec::new();
    loop {
        let (arg, after) = type_expr(rest)?;
        args.push(arg);
        let after = skip_ws(after);
        if let Some(after) = after.strip_prefix(',') {
            rest = after;
        } else {
            let after = after.strip_prefix(')')?;
            return Some((Type::Constructed(name.to_string(), args), after));
        }
    }
}
