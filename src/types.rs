//! Types and unification contexts.
//!
//! A [`Type`] is either a variable local to a [`TypeContext`] or a named
//! constructor applied to arguments. Function types are the `->`
//! constructor of arity two.
//!
//! Contexts are values: every search branch owns its own copy, and the
//! functional entry points (`unify`, `fresh_variable`, `instantiate`) hand
//! back a new context instead of touching the receiver.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

pub const ARROW: &str = "->";

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Variable(usize),
    Constructed(String, Vec<Type>),
}

pub fn ground(name: &str) -> Type {
    Type::Constructed(name.to_string(), Vec::new())
}

pub fn tint() -> Type {
    ground("int")
}

pub fn tbool() -> Type {
    ground("bool")
}

pub fn tfloat() -> Type {
    ground("real")
}

pub fn tstr() -> Type {
    ground("str")
}

pub fn tlist(element: Type) -> Type {
    Type::Constructed("list".to_string(), vec![element])
}

pub fn tvar(id: usize) -> Type {
    Type::Variable(id)
}

pub fn arrow(argument: Type, result: Type) -> Type {
    Type::Constructed(ARROW.to_string(), vec![argument, result])
}

/// Right-nested arrow over `parts`; the last element is the return type.
///
/// Panics if `parts` is empty.
pub fn arrows(mut parts: Vec<Type>) -> Type {
    let mut result = parts.pop().expect("arrows needs at least a return type");
    while let Some(argument) = parts.pop() {
        result = arrow(argument, result);
    }
    result
}

impl Type {
    pub fn is_arrow(&self) -> bool {
        matches!(self, Type::Constructed(name, args) if name == ARROW && args.len() == 2)
    }

    /// Domain and codomain of an arrow type.
    pub fn as_arrow(&self) -> Option<(&Type, &Type)> {
        match self {
            Type::Constructed(name, args) if name == ARROW && args.len() == 2 => {
                Some((&args[0], &args[1]))
            }
            _ => None,
        }
    }

    pub fn function_arguments(&self) -> SmallVec<[Type; 4]> {
        let mut out = SmallVec::new();
        let mut current = self;
        while let Some((argument, result)) = current.as_arrow() {
            out.push(argument.clone());
            current = result;
        }
        out
    }

    /// Final codomain after stripping every arrow.
    pub fn returns(&self) -> &Type {
        let mut current = self;
        while let Some((_, result)) = current.as_arrow() {
            current = result;
        }
        current
    }

    pub fn occurs(&self, variable: usize) -> bool {
        match self {
            Type::Variable(v) => *v == variable,
            Type::Constructed(_, args) => args.iter().any(|a| a.occurs(variable)),
        }
    }

    pub fn is_polymorphic(&self) -> bool {
        match self {
            Type::Variable(_) => true,
            Type::Constructed(_, args) => args.iter().any(Type::is_polymorphic),
        }
    }

    /// Variables in order of first appearance, without repeats.
    pub fn free_variables(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<usize>) {
        match self {
            Type::Variable(v) => {
                if !out.contains(v) {
                    out.push(*v);
                }
            }
            Type::Constructed(_, args) => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
        }
    }

    /// Renumbers variables `t0, t1, ...` in order of first appearance.
    pub fn canonical(&self) -> Type {
        let mapping: FxHashMap<usize, usize> = self
            .free_variables()
            .into_iter()
            .enumerate()
            .map(|(new, old)| (old, new))
            .collect();
        self.rename(&mapping)
    }

    fn rename(&self, mapping: &FxHashMap<usize, usize>) -> Type {
        match self {
            Type::Variable(v) => Type::Variable(mapping.get(v).copied().unwrap_or(*v)),
            Type::Constructed(name, args) => Type::Constructed(
                name.clone(),
                args.iter().map(|a| a.rename(mapping)).collect(),
            ),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        enum Frame<'a> {
            // The flag marks the left operand of an arrow, which needs parentheses.
            Enter(&'a Type, bool),
            Text(&'a str),
            Owned(String),
        }

        let mut out = String::new();
        let mut stack = vec![Frame::Enter(self, false)];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Text(s) => out.push_str(s),
                Frame::Owned(s) => out.push_str(&s),
                Frame::Enter(t, left_of_arrow) => match (t, t.as_arrow()) {
                    (Type::Variable(id), _) => out.push_str(&format!("t{}", id)),
                    (_, Some((a, b))) => {
                        if left_of_arrow {
                            stack.push(Frame::Text(")"));
                        }
                        stack.push(Frame::Enter(b, false));
                        stack.push(Frame::Text(" -> "));
                        stack.push(Frame::Enter(a, true));
                        if left_of_arrow {
                            stack.push(Frame::Text("("));
                        }
                    }
                    (Type::Constructed(name, args), None) if args.is_empty() => out.push_str(name),
                    (Type::Constructed(name, args), None) => {
                        stack.push(Frame::Text(")"));
                        for idx in (0..args.len()).rev() {
                            stack.push(Frame::Enter(&args[idx], false));
                            if idx > 0 {
                                stack.push(Frame::Text(", "));
                            }
                        }
                        stack.push(Frame::Owned(format!("{}(", name)));
                    }
                },
            }
        }

        f.write_str(&out)
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnificationError {
    #[error("occurs check failed: t{variable} occurs in {ty}")]
    Occurs { variable: usize, ty: Type },
    #[error("cannot unify {left} with {right}")]
    Mismatch { left: Type, right: Type },
}

/// Append-only substitution plus the fresh-variable counter.
///
/// A variable is bound at most once; `bindings.len()` is the next fresh id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeContext {
    bindings: Vec<Option<Type>>,
}

impl TypeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_variable(&self) -> usize {
        self.bindings.len()
    }

    pub fn lookup(&self, variable: usize) -> Option<&Type> {
        self.bindings.get(variable).and_then(Option::as_ref)
    }

    pub fn fresh_variable(&self) -> (TypeContext, Type) {
        let mut next = self.clone();
        let t = next.fresh();
        (next, t)
    }

    /// In-place variant of [`TypeContext::fresh_variable`] for callers that
    /// already own their copy of the context.
    pub fn fresh(&mut self) -> Type {
        self.bindings.push(None);
        Type::Variable(self.bindings.len() - 1)
    }

    /// Substitutes every bound variable, following chains to a fixed point.
    pub fn apply(&self, t: &Type) -> Type {
        match t {
            Type::Variable(v) => match self.lookup(*v) {
                Some(bound) => self.apply(bound),
                None => t.clone(),
            },
            Type::Constructed(name, args) => {
                if !t.is_polymorphic() {
                    return t.clone();
                }
                Type::Constructed(name.clone(), args.iter().map(|a| self.apply(a)).collect())
            }
        }
    }

    /// `apply` followed by canonical variable numbering, for display.
    pub fn resolve(&self, t: &Type) -> Type {
        self.apply(t).canonical()
    }

    pub fn unify(&self, left: &Type, right: &Type) -> Result<TypeContext, UnificationError> {
        let mut next = self.clone();
        next.unify_in_place(left, right)?;
        Ok(next)
    }

    /// On failure the receiver may hold partial bindings and must be dropped.
    pub fn unify_in_place(&mut self, left: &Type, right: &Type) -> Result<(), UnificationError> {
        let left = self.apply(left);
        let right = self.apply(right);
        match (&left, &right) {
            (Type::Variable(a), Type::Variable(b)) if a == b => Ok(()),
            (Type::Variable(v), other) | (other, Type::Variable(v)) => {
                if other.occurs(*v) {
                    return Err(UnificationError::Occurs {
                        variable: *v,
                        ty: other.clone(),
                    });
                }
                self.bind(*v, other.clone());
                Ok(())
            }
            (Type::Constructed(n1, a1), Type::Constructed(n2, a2)) => {
                if n1 != n2 || a1.len() != a2.len() {
                    return Err(UnificationError::Mismatch {
                        left: left.clone(),
                        right: right.clone(),
                    });
                }
                for (x, y) in a1.iter().zip(a2.iter()) {
                    self.unify_in_place(x, y)?;
                }
                Ok(())
            }
        }
    }

    fn bind(&mut self, variable: usize, t: Type) {
        if variable >= self.bindings.len() {
            self.bindings.resize(variable + 1, None);
        }
        debug_assert!(self.bindings[variable].is_none(), "t{} rebound", variable);
        self.bindings[variable] = Some(t);
    }

    /// Replaces each distinct variable of `scheme` with a fresh one.
    pub fn instantiate(&self, scheme: &Type) -> (TypeContext, Type) {
        let mut next = self.clone();
        let t = next.instantiate_in_place(scheme);
        (next, t)
    }

    pub fn instantiate_in_place(&mut self, scheme: &Type) -> Type {
        if !scheme.is_polymorphic() {
            return scheme.clone();
        }
        let mut mapping: FxHashMap<usize, usize> = FxHashMap::default();
        for v in scheme.free_variables() {
            if let Type::Variable(fresh) = self.fresh() {
                mapping.insert(v, fresh);
            }
        }
        scheme.rename(&mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let t = arrows(vec![arrow(tint(), tbool()), tlist(tvar(0)), tint()]);
        assert_eq!(t.to_string(), "(int -> bool) -> list(t0) -> int");
    }

    #[test]
    fn test_unify_binds_variable() {
        let (ctx, v) = TypeContext::new().fresh_variable();
        let ctx = ctx.unify(&v, &tlist(tint())).unwrap();
        assert_eq!(ctx.apply(&v), tlist(tint()));
    }

    #[test]
    fn test_occurs_check() {
        let (ctx, v) = TypeContext::new().fresh_variable();
        let err = ctx.unify(&v, &tlist(v.clone())).unwrap_err();
        assert!(matches!(err, UnificationError::Occurs { variable: 0, .. }));
    }

    #[test]
    fn test_branches_do_not_share_bindings() {
        let (ctx, v) = TypeContext::new().fresh_variable();
        let left = ctx.unify(&v, &tint()).unwrap();
        let right = ctx.unify(&v, &tbool()).unwrap();
        assert_eq!(left.apply(&v), tint());
        assert_eq!(right.apply(&v), tbool());
        assert_eq!(ctx.apply(&v), v);
    }

    #[test]
    fn test_instantiate_is_consistent() {
        let scheme = arrow(tvar(0), arrow(tvar(1), tvar(0)));
        let (ctx, t) = TypeContext::new().instantiate(&scheme);
        assert_eq!(ctx.next_variable(), 2);
        assert_eq!(t, arrow(tvar(0), arrow(tvar(1), tvar(0))));
        let (_, again) = ctx.instantiate(&scheme);
        assert_eq!(again, arrow(tvar(2), arrow(tvar(3), tvar(2))));
    }
}
