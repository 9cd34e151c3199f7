//! Per-task collections of scored programs.

use crate::program::Term;

#[derive(Debug, Clone, PartialEq)]
pub struct FrontierEntry {
    pub program: Term,
    pub log_prior: f64,
    pub log_likelihood: f64,
}

impl FrontierEntry {
    pub fn posterior(&self) -> f64 {
        self.log_prior + self.log_likelihood
    }

    pub fn is_hit(&self) -> bool {
        self.log_likelihood == 0.0
    }
}

/// Scored programs for one task, unique by program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontier {
    entries: Vec<FrontierEntry>,
}

impl Frontier {
    pub fn new(entries: impl IntoIterator<Item = FrontierEntry>) -> Self {
        let mut frontier = Self::default();
        for entry in entries {
            frontier.insert(entry);
        }
        frontier
    }

    /// Adds `entry`; a program already present keeps the better-scored entry.
    pub fn insert(&mut self, entry: FrontierEntry) {
        match self.entries.iter_mut().find(|e| e.program == entry.program) {
            Some(existing) => {
                if entry.posterior() > existing.posterior() {
                    *existing = entry;
                }
            }
            None => self.entries.push(entry),
        }
    }

    /// Union of both frontiers.
    pub fn combine(mut self, other: Frontier) -> Frontier {
        for entry in other.entries {
            self.insert(entry);
        }
        self
    }

    /// The `k` best entries by posterior, best first.
    pub fn top_k(mut self, k: usize) -> Frontier {
        self.entries
            .sort_by(|a, b| b.posterior().total_cmp(&a.posterior()));
        self.entries.truncate(k);
        self
    }

    pub fn hits(&self) -> usize {
        self.entries.iter().filter(|e| e.is_hit()).count()
    }

    pub fn best(&self) -> Option<&FrontierEntry> {
        self.entries
            .iter()
            .max_by(|a, b| a.posterior().total_cmp(&b.posterior()))
    }

    pub fn entries(&self) -> &[FrontierEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: usize, log_prior: f64, log_likelihood: f64) -> FrontierEntry {
        FrontierEntry {
            program: Term::Index(i),
            log_prior,
            log_likelihood,
        }
    }

    #[test]
    fn test_combine_is_union_by_program() {
        let a = Frontier::new([entry(0, -1.0, 0.0), entry(1, -2.0, 0.0)]);
        let b = Frontier::new([entry(1, -1.5, 0.0), entry(2, -4.0, -1.0)]);
        let merged = a.combine(b);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.hits(), 2);
        let one = merged.entries().iter().find(|e| e.program == Term::Index(1)).unwrap();
        assert_eq!(one.log_prior, -1.5);
    }

    #[test]
    fn test_top_k_keeps_best_posteriors() {
        let f = Frontier::new([entry(0, -3.0, 0.0), entry(1, -1.0, 0.0), entry(2, -2.0, 0.0)]);
        let top = f.top_k(2);
        let kept: Vec<_> = top.entries().iter().map(|e| e.program.clone()).collect();
        assert_eq!(kept, vec![Term::Index(1), Term::Index(2)]);
    }
}
