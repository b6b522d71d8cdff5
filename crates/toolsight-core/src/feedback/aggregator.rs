//! Feedback aggregation
//!
//! Raw transport signals (button presses, free text) are resolved against the
//! originating search session to recover the target item and the similarity
//! the engine reported at verdict time. A missing session demotes the signal
//! to an orphan rather than dropping it; orphans still train the model, they
//! just carry no score.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::session::{SearchSession, SessionStore};

use super::{
    FeedbackKind, FeedbackStats, FeedbackStore, NewAnnotation, NewExample, WriterHandle,
};

/// Unconsumed-example threshold for the automatic retrain hint
pub const DEFAULT_RETRAIN_THRESHOLD: usize = 50;

// ============================================================================
// TYPES
// ============================================================================

/// What "the correct answer was ..." carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectTarget {
    /// A concrete catalog item id
    Item(String),
    /// Free text naming the item; no catalog reference exists yet
    Text(String),
}

/// Who sent a verdict
#[derive(Debug, Clone, Copy)]
pub struct Verdict<'a> {
    pub user_id: i64,
    pub username: Option<&'a str>,
    /// Local photo copy saved by the transport, when available
    pub image_path: Option<&'a str>,
}

// ============================================================================
// AGGREGATOR
// ============================================================================

/// Resolves transport feedback signals into stored training examples
pub struct FeedbackAggregator {
    sessions: Arc<SessionStore>,
    writer: WriterHandle,
    store: Arc<FeedbackStore>,
    retrain_threshold: usize,
}

impl FeedbackAggregator {
    /// Build an aggregator over the session map and the writer queue
    pub fn new(
        sessions: Arc<SessionStore>,
        writer: WriterHandle,
        store: Arc<FeedbackStore>,
        retrain_threshold: usize,
    ) -> Self {
        Self {
            sessions,
            writer,
            store,
            retrain_threshold,
        }
    }

    /// The user confirmed a result
    pub fn mark_correct(
        &self,
        short_id: &str,
        result_index: usize,
        item_id: &str,
        verdict: Verdict<'_>,
    ) -> Result<()> {
        self.record_verdict(short_id, result_index, item_id, FeedbackKind::Correct, verdict)
    }

    /// The user rejected a result
    pub fn mark_incorrect(
        &self,
        short_id: &str,
        result_index: usize,
        item_id: &str,
        verdict: Verdict<'_>,
    ) -> Result<()> {
        self.record_verdict(short_id, result_index, item_id, FeedbackKind::Incorrect, verdict)
    }

    /// The user reported that the photographed item is missing from the
    /// catalog entirely
    pub fn propose_new_item(
        &self,
        short_id: &str,
        name: &str,
        category: Option<&str>,
        description: Option<&str>,
        verdict: Verdict<'_>,
    ) -> Result<()> {
        let session = self.sessions.get(short_id);
        let fingerprint = self.fingerprint_for(short_id, session.as_ref());

        self.writer.annotation(NewAnnotation {
            photo_fingerprint: fingerprint.clone(),
            user_id: verdict.user_id,
            username: verdict.username.map(Into::into),
            product_name: name.to_string(),
            product_category: category.map(Into::into),
            product_description: description.map(Into::into),
            image_path: verdict.image_path.map(Into::into),
        })?;

        // The report doubles as a labeled example so the next session can
        // push the photo away from everything it was confused with.
        self.writer.example(NewExample {
            photo_fingerprint: fingerprint,
            user_id: verdict.user_id,
            username: verdict.username.map(Into::into),
            feedback_kind: Some(FeedbackKind::NewItem),
            target_item_id: None,
            similarity_score: None,
            user_comment: Some(name.to_string()),
            image_path: verdict.image_path.map(Into::into),
            quality_rating: None,
        })?;
        Ok(())
    }

    /// The user named the correct answer after rejecting the shown results
    pub fn specify_correct(
        &self,
        short_id: &str,
        target: CorrectTarget,
        verdict: Verdict<'_>,
    ) -> Result<()> {
        let session = self.sessions.get(short_id);
        let fingerprint = self.fingerprint_for(short_id, session.as_ref());

        let example = match target {
            CorrectTarget::Item(item_id) => NewExample {
                photo_fingerprint: fingerprint,
                user_id: verdict.user_id,
                username: verdict.username.map(Into::into),
                feedback_kind: Some(FeedbackKind::Correct),
                target_item_id: Some(item_id),
                similarity_score: None,
                user_comment: None,
                image_path: verdict.image_path.map(Into::into),
                quality_rating: None,
            },
            // Free text cannot reference a catalog row, so it is stored as a
            // new-item example carrying the text.
            CorrectTarget::Text(text) => NewExample {
                photo_fingerprint: fingerprint,
                user_id: verdict.user_id,
                username: verdict.username.map(Into::into),
                feedback_kind: Some(FeedbackKind::NewItem),
                target_item_id: None,
                similarity_score: None,
                user_comment: Some(text),
                image_path: verdict.image_path.map(Into::into),
                quality_rating: None,
            },
        };
        self.writer.example(example)
    }

    /// Whether enough balanced, unconsumed data has accumulated to make a
    /// fine-tuning run worthwhile
    pub fn should_retrain_hint(&self, stats: &FeedbackStats) -> bool {
        stats.unconsumed >= self.retrain_threshold && stats.correct > 0 && stats.incorrect > 0
    }

    /// Current feedback counters
    pub fn statistics(&self) -> Result<FeedbackStats> {
        self.store.statistics()
    }

    fn record_verdict(
        &self,
        short_id: &str,
        result_index: usize,
        item_id: &str,
        kind: FeedbackKind,
        verdict: Verdict<'_>,
    ) -> Result<()> {
        let session = self.sessions.get(short_id);
        let fingerprint = self.fingerprint_for(short_id, session.as_ref());

        let similarity = session.as_ref().and_then(|s| {
            match s.result_at(result_index) {
                Some((id, sim)) if id == item_id => Some(sim),
                Some((id, sim)) => {
                    // Index and id disagree (stale keyboard); trust the
                    // explicit id but keep the positional score for context.
                    warn!(short_id, result_index, expected = id, got = item_id,
                          "verdict index/id mismatch");
                    Some(sim)
                }
                None => None,
            }
        });

        if session.is_none() {
            info!(short_id, kind = %kind, "session expired, verdict stored as orphan");
        }

        self.writer.example(NewExample {
            photo_fingerprint: fingerprint,
            user_id: verdict.user_id,
            username: verdict.username.map(Into::into),
            feedback_kind: Some(kind),
            target_item_id: Some(item_id.to_string()),
            similarity_score: similarity,
            user_comment: None,
            image_path: verdict.image_path.map(Into::into),
            quality_rating: None,
        })
    }

    /// A live session knows the real fingerprint; orphans fall back to the
    /// short id so the datum is still attributable
    fn fingerprint_for(&self, short_id: &str, session: Option<&SearchSession>) -> String {
        session
            .map(|s| s.photo_fingerprint.clone())
            .unwrap_or_else(|| format!("orphan:{short_id}"))
    }
}

// ============================================================================
// TESTS
// ============================================================================
