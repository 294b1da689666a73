//! Resumable human-in-the-loop review.
//!
//! An [`InteractiveSession`] processes rows one batch at a time. Each
//! [`advance`](InteractiveSession::advance) commits the current batch and
//! resolves the next, returning the items that still need review. Feedback
//! registered between calls is applied to the current batch before it is
//! committed; completed batches are never revisited.
//!
//! Dropping a session at any point is safe: every registry and memory
//! mutation made so far is already persisted.

use std::collections::VecDeque;

use crate::entity::Entity;
use crate::error::EngineResult;
use crate::funnel::DecisionCache;
use crate::orchestrator::{CategorizationOrchestrator, Row, UnknownEntity};

/// Items needing review in one processed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewBatch {
    /// Zero-based batch number.
    pub batch_index: usize,
    /// Total number of batches in the session.
    pub total_batches: usize,
    /// Unresolved descriptions of this batch, grouped.
    pub unknowns: Vec<UnknownEntity>,
}

/// Batch-at-a-time resolution with feedback between batches.
#[derive(Debug)]
pub struct InteractiveSession<'a> {
    orchestrator: &'a CategorizationOrchestrator,
    description_col: String,
    batch_size: usize,
    total_batches: usize,
    pending: VecDeque<Row>,
    current: Vec<Row>,
    current_index: Option<usize>,
    completed: Vec<Row>,
    seen_generation: u64,
    decisions: DecisionCache,
}

impl<'a> InteractiveSession<'a> {
    pub(crate) fn new(
        orchestrator: &'a CategorizationOrchestrator,
        rows: Vec<Row>,
        description_col: &str,
        batch_size: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let total_batches = rows.len().div_ceil(batch_size);
        Self {
            orchestrator,
            description_col: description_col.to_string(),
            batch_size,
            total_batches,
            pending: rows.into(),
            current: Vec::new(),
            current_index: None,
            completed: Vec::new(),
            seen_generation: orchestrator.registry().generation(),
            decisions: DecisionCache::new(),
        }
    }

    /// Commits the current batch and processes the next one.
    ///
    /// If the registry changed since the current batch was resolved, the
    /// current batch is re-resolved first. Returns `None` once every batch
    /// has been committed.
    pub fn advance(&mut self) -> Option<ReviewBatch> {
        self.commit_current();

        if self.pending.is_empty() {
            return None;
        }
        let take = self.batch_size.min(self.pending.len());
        self.current = self.pending.drain(..take).collect();
        let batch_index = self.current_index.map_or(0, |i| i + 1);
        self.current_index = Some(batch_index);
        self.resolve_current();

        let unknowns = self.unknowns();
        tracing::info!(
            batch = batch_index + 1,
            total = self.total_batches,
            rows = self.current.len(),
            unknowns = unknowns.len(),
            "batch ready for review"
        );
        Some(ReviewBatch {
            batch_index,
            total_batches: self.total_batches,
            unknowns,
        })
    }

    /// Registers an entity from reviewer feedback.
    ///
    /// The current batch picks it up on the next [`advance`](Self::advance)
    /// or [`refresh`](Self::refresh).
    pub fn feedback(
        &mut self,
        name: &str,
        category: Option<&str>,
        alias: Option<&str>,
    ) -> EngineResult<Entity> {
        self.orchestrator.register_entity(name, category, alias)
    }

    /// Re-resolves the current batch now and returns what still needs review.
    ///
    /// Generative decisions already made in this session are reused, so
    /// rows the oracle could not categorize are not sent again.
    pub fn refresh(&mut self) -> Vec<UnknownEntity> {
        self.resolve_current();
        self.unknowns()
    }

    /// Items of the current batch that still need review.
    #[must_use]
    pub fn unknowns(&self) -> Vec<UnknownEntity> {
        self.orchestrator
            .discover_entities(&self.current, &self.description_col)
    }

    /// Rows of the current batch as last resolved.
    #[must_use]
    pub fn current_rows(&self) -> &[Row] {
        &self.current
    }

    /// Index of the batch under review, if any.
    #[must_use]
    pub fn batch_index(&self) -> Option<usize> {
        self.current_index
    }

    /// Total number of batches.
    #[must_use]
    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    /// True when every row has been processed and committed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.current.is_empty()
    }

    /// Processes the remaining rows without pausing and returns all rows.
    #[must_use]
    pub fn finish(mut self) -> Vec<Row> {
        while self.advance().is_some() {}
        self.completed
    }

    /// Rows processed so far, committed batches first. Unprocessed rows are
    /// discarded.
    #[must_use]
    pub fn into_rows(mut self) -> Vec<Row> {
        self.completed.append(&mut self.current);
        self.completed
    }

    fn resolve_current(&mut self) {
        self.seen_generation = self.orchestrator.registry().generation();
        for row in &mut self.current {
            self.orchestrator
                .annotate(row, &self.description_col, &self.decisions);
        }
    }

    fn commit_current(&mut self) {
        if self.current.is_empty() {
            return;
        }
        if self.orchestrator.registry().generation() != self.seen_generation {
            tracing::debug!(batch = ?self.current_index, "registry changed; re-resolving batch");
            self.resolve_current();
        }
        self.completed.append(&mut self.current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::orchestrator::columns;
    use serde_json::json;

    fn orchestrator() -> CategorizationOrchestrator {
        CategorizationOrchestrator::builder(EngineConfig {
            rules: Vec::new(),
            ..EngineConfig::default()
        })
        .build()
        .unwrap()
    }

    fn rows(descriptions: &[&str]) -> Vec<Row> {
        descriptions
            .iter()
            .map(|d| {
                let mut row = Row::new();
                row.insert("description".to_string(), json!(d));
                row
            })
            .collect()
    }

    #[test]
    fn batches_are_sized_and_counted() {
        let o = orchestrator();
        let mut session = o.run_interactive(rows(&["a1", "b2", "c3", "d4", "e5"]), "description", 2);
        assert_eq!(session.total_batches(), 3);

        let sizes: Vec<usize> = std::iter::from_fn(|| {
            session.advance().map(|b| b.batch_index)
        })
        .collect();
        assert_eq!(sizes, vec![0, 1, 2]);
        assert!(session.is_finished());
        assert_eq!(session.into_rows().len(), 5);
    }

    #[test]
    fn zero_batch_size_is_one() {
        let o = orchestrator();
        let session = o.run_interactive(rows(&["a1", "b2"]), "description", 0);
        assert_eq!(session.total_batches(), 2);
    }

    #[test]
    fn feedback_applies_to_current_batch_only() {
        let o = orchestrator();
        let mut session = o.run_interactive(
            rows(&["Konijnenburg BV", "other thing", "Konijnenburg BV 12.05.24"]),
            "description",
            2,
        );

        let first = session.advance().unwrap();
        assert!(first.unknowns.iter().any(|u| u.raw == "konijnenburg bv"));

        // Move on without feedback: the first batch is committed as unresolved.
        let second = session.advance().unwrap();
        assert_eq!(second.batch_index, 1);
        assert_eq!(second.unknowns.len(), 1);

        session
            .feedback("Konijnenburg", Some("Expenses:Business"), Some("konijnenburg bv"))
            .unwrap();
        let refreshed = session.refresh();
        assert!(refreshed.is_empty());

        let out = session.finish();
        assert_eq!(out[0][columns::ENTITY], serde_json::Value::Null);
        assert_eq!(out[2][columns::ENTITY], json!("Konijnenburg"));
        assert_eq!(out[2][columns::CATEGORY], json!("Expenses:Business"));
    }

    #[test]
    fn advance_reresolves_changed_batch() {
        let o = orchestrator();
        let mut session = o.run_interactive(rows(&["picnic order", "other"]), "description", 1);
        let first = session.advance().unwrap();
        assert_eq!(first.unknowns.len(), 1);

        session.feedback("Picnic", Some("Expenses:Groceries"), None).unwrap();
        session.advance();

        let out = session.into_rows();
        assert_eq!(out[0][columns::ENTITY], json!("Picnic"));
        assert_eq!(out[0][columns::METHOD], json!("substring"));
    }

    #[test]
    fn abandoned_session_keeps_processed_rows() {
        let o = orchestrator();
        let mut session = o.run_interactive(rows(&["a1", "b2", "c3"]), "description", 2);
        session.advance();
        let out = session.into_rows();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.contains_key(columns::CATEGORY)));
    }
}
