//! Context assembly.
//!
//! Turns a ranked passage list into the bundle handed to the model:
//! near-duplicates are dropped first, then passages are packed in rank
//! order into a fixed character budget.

use std::collections::HashSet;

use serde::Serialize;

use super::passage::Passage;

/// Passages selected for one prompt, in rank order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextBundle {
    pub passages: Vec<Passage>,
    /// Characters used by the selected passages
    pub used: usize,
    pub budget: usize,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Whether the answer can be grounded in supplied context.
    pub fn is_grounded(&self) -> bool {
        !self.passages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    budget: usize,
    dedup_threshold: f64,
}

impl ContextAssembler {
    pub fn new(budget: usize, dedup_threshold: f64) -> Self {
        Self {
            budget,
            dedup_threshold,
        }
    }

    /// Builds a bundle whose total character count never exceeds the budget.
    ///
    /// A passage that does not fit in the remaining budget is skipped whole,
    /// and smaller passages further down may still be packed.
    pub fn assemble(&self, ranked: Vec<Passage>) -> ContextBundle {
        let total = ranked.len();
        let unique = self.dedup(ranked);
        let deduped = total - unique.len();

        let mut used = 0usize;
        let mut skipped = 0usize;
        let mut passages = Vec::new();
        for passage in unique {
            let len = passage.char_len();
            if len == 0 || used + len > self.budget {
                skipped += 1;
                continue;
            }
            used += len;
            passages.push(passage);
        }

        tracing::debug!(
            kept = passages.len(),
            deduped,
            skipped,
            used,
            budget = self.budget,
            "Assembled context"
        );

        ContextBundle {
            passages,
            used,
            budget: self.budget,
        }
    }

    fn dedup(&self, ranked: Vec<Passage>) -> Vec<Passage> {
        let mut kept: Vec<(Passage, HashSet<String>)> = Vec::with_capacity(ranked.len());
        for passage in ranked {
            let words = word_set(&passage.text);
            let duplicate = kept
                .iter()
                .any(|(_, other)| jaccard(&words, other) >= self.dedup_threshold);
            if !duplicate {
                kept.push((passage, words));
            }
        }
        kept.into_iter().map(|(passage, _)| passage).collect()
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::passage::SourceKind;

    fn passage(id: &str, text: &str, score: f64) -> Passage {
        Passage {
            kind: SourceKind::Local,
            source_id: id.to_string(),
            origin: "doc.txt".to_string(),
            title: None,
            page: None,
            text: text.to_string(),
            score,
        }
    }

    fn ids(bundle: &ContextBundle) -> Vec<&str> {
        bundle.passages.iter().map(|p| p.source_id.as_str()).collect()
    }

    #[test]
    fn many_small_passages_stop_at_budget() {
        let ranked: Vec<Passage> = (0..100)
            .map(|i| passage(&format!("p{}", i), &format!("passage {:03}", i), 1.0))
            .collect();
        let bundle = ContextAssembler::new(50, 0.9).assemble(ranked);

        // each passage is 11 chars
        assert_eq!(bundle.passages.len(), 4);
        assert_eq!(bundle.used, 44);
        assert!(bundle.used <= bundle.budget);
        assert_eq!(ids(&bundle), vec!["p0", "p1", "p2", "p3"]);
    }

    #[test]
    fn oversized_passage_is_skipped_not_truncated() {
        let huge = "word ".repeat(500);
        let ranked = vec![
            passage("huge", &huge, 1.0),
            passage("small", "a short fact", 0.5),
        ];
        let bundle = ContextAssembler::new(100, 0.9).assemble(ranked);
        assert_eq!(ids(&bundle), vec!["small"]);
        assert_eq!(bundle.passages[0].text, "a short fact");
    }

    #[test]
    fn duplicates_keep_the_higher_ranked_instance() {
        let ranked = vec![
            passage("first", "Employees get 25 vacation days per year", 0.9),
            passage("other", "The office closes at six", 0.8),
            passage("copy", "employees get 25 vacation days per year.", 0.7),
        ];
        let bundle = ContextAssembler::new(1000, 0.9).assemble(ranked);
        assert_eq!(ids(&bundle), vec!["first", "other"]);
    }

    #[test]
    fn nothing_fits_yields_empty_bundle() {
        let ranked = vec![passage("a", &"x".repeat(20), 1.0)];
        let bundle = ContextAssembler::new(10, 0.9).assemble(ranked);
        assert!(bundle.is_empty());
        assert!(!bundle.is_grounded());
        assert_eq!(bundle.used, 0);

        assert!(ContextAssembler::new(10, 0.9).assemble(Vec::new()).is_empty());
    }

    #[test]
    fn output_keeps_rank_order() {
        let ranked = vec![
            passage("a", "alpha one", 0.9),
            passage("b", "beta two", 0.5),
            passage("c", "gamma three", 0.1),
        ];
        let bundle = ContextAssembler::new(1000, 0.9).assemble(ranked);
        assert_eq!(ids(&bundle), vec!["a", "b", "c"]);
    }
}
