//! Arena - hash-consing storage for terms
use crate::program::{Invented, Term};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Stable handle to an interned term.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TermId(pub u32);

/// Interning key: one node with its children already replaced by ids.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum NodeKey {
    Application(TermId, TermId),
    Abstraction(TermId),
    Index(usize),
    Primitive(String),
    Invented(TermId),
    FragmentVariable,
}

/// Rebuilds terms bottom-up so that structurally identical subtrees share
/// one `Arc<Term>`. A cache only: sharing never changes typing or evaluation.
#[derive(Default)]
pub struct TermArena {
    nodes: Vec<Arc<Term>>,
    interner: FxHashMap<NodeKey, TermId>,
}

impl TermArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn share(&mut self, term: &Term) -> TermId {
        let (key, rebuilt) = match term {
            Term::Application(f, x) => {
                let f = self.share(f);
                let x = self.share(x);
                (NodeKey::Application(f, x), None)
            }
            Term::Abstraction(body) => (NodeKey::Abstraction(self.share(body)), None),
            Term::Invented(inv) => (NodeKey::Invented(self.share(&inv.body)), None),
            Term::Index(i) => (NodeKey::Index(*i), Some(term.clone())),
            Term::Primitive(p) => (NodeKey::Primitive(p.name.clone()), Some(term.clone())),
            Term::FragmentVariable => (NodeKey::FragmentVariable, Some(Term::FragmentVariable)),
        };

        if let Some(&id) = self.interner.get(&key) {
            return id;
        }
        let node = match (rebuilt, &key, term) {
            (Some(leaf), _, _) => leaf,
            (None, NodeKey::Application(f, x), _) => {
                Term::Application(Arc::clone(self.get(*f)), Arc::clone(self.get(*x)))
            }
            (None, NodeKey::Abstraction(body), _) => Term::Abstraction(Arc::clone(self.get(*body))),
            (None, NodeKey::Invented(body), Term::Invented(inv)) => {
                Term::Invented(Arc::new(Invented {
                    body: Arc::clone(self.get(*body)),
                    tp: inv.tp.clone(),
                }))
            }
            (None, _, _) => term.clone(),
        };
        let id = TermId(self.nodes.len() as u32);
        self.nodes.push(Arc::new(node));
        self.interner.insert(key, id);
        id
    }

    pub fn get(&self, id: TermId) -> &Arc<Term> {
        &self.nodes[id.0 as usize]
    }

    /// Shared instance of `term`.
    pub fn intern(&mut self, term: &Term) -> Arc<Term> {
        let id = self.share(term);
        Arc::clone(self.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
