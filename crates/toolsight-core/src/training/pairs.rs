//! Contrastive pair construction
//!
//! Positive pairs: two `correct` verdicts on the same target item. Negative
//! pairs: a `correct` crossed with an `incorrect`, regardless of item. The
//! train/validation split happens on examples, in insertion order, before
//! pairing, so a rerun over the same log reproduces the same sets.

use std::path::PathBuf;

use crate::feedback::{FeedbackKind, TrainingExample};

/// Validation share of the example split
const VALIDATION_FRACTION: f64 = 0.2;

// ============================================================================
// PAIR TYPE
// ============================================================================

/// Two photos and a same/different label
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastivePair {
    pub first: PathBuf,
    pub second: PathBuf,
    /// 1.0 = same item, 0.0 = different
    pub label: f32,
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

/// Split examples 80/20 by insertion order; no shuffling, so the split is
/// reproducible for a given feedback log
pub fn split_ordered(examples: &[TrainingExample]) -> (Vec<TrainingExample>, Vec<TrainingExample>) {
    let validation = ((examples.len() as f64) * VALIDATION_FRACTION).floor() as usize;
    let boundary = examples.len() - validation;
    (
        examples[..boundary].to_vec(),
        examples[boundary..].to_vec(),
    )
}

/// Build contrastive pairs from a set of examples
///
/// Only examples with an image path participate; the caller has already
/// filtered for readability.
pub fn build_pairs(examples: &[TrainingExample]) -> Vec<ContrastivePair> {
    let correct: Vec<&TrainingExample> = examples
        .iter()
        .filter(|e| e.feedback_kind == FeedbackKind::Correct && e.image_path.is_some())
        .collect();
    let incorrect: Vec<&TrainingExample> = examples
        .iter()
        .filter(|e| e.feedback_kind == FeedbackKind::Incorrect && e.image_path.is_some())
        .collect();

    let mut pairs = Vec::new();

    // Same target, both confirmed: the photos show the same item.
    for (i, a) in correct.iter().enumerate() {
        for b in correct.iter().skip(i + 1) {
            if a.target_item_id.is_some() && a.target_item_id == b.target_item_id {
                pairs.push(ContrastivePair {
                    first: PathBuf::from(a.image_path.as_deref().unwrap_or_default()),
                    second: PathBuf::from(b.image_path.as_deref().unwrap_or_default()),
                    label: 1.0,
                });
            }
        }
    }

    // Confirmed against rejected: pushed apart regardless of item ids.
    for a in &correct {
        for b in &incorrect {
            pairs.push(ContrastivePair {
                first: PathBuf::from(a.image_path.as_deref().unwrap_or_default()),
                second: PathBuf::from(b.image_path.as_deref().unwrap_or_default()),
                label: 0.0,
            });
        }
    }

    pairs
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn example(id: i64, kind: FeedbackKind, target: Option<&str>, path: Option<&str>) -> TrainingExample {
        TrainingExample {
            id,
            photo_fingerprint: format!("fp{id}"),
            user_id: 1,
            username: None,
            feedback_kind: kind,
            target_item_id: target.map(Into::into),
            similarity_score: Some(0.5),
            user_comment: None,
            image_path: path.map(Into::into),
            quality_rating: 5,
            created_at: Utc::now(),
            consumed_by_session: None,
        }
    }

    #[test]
    fn test_positive_pairs_share_target() {
        let examples = vec![
            example(1, FeedbackKind::Correct, Some("A"), Some("/p/1.jpg")),
            example(2, FeedbackKind::Correct, Some("A"), Some("/p/2.jpg")),
            example(3, FeedbackKind::Correct, Some("B"), Some("/p/3.jpg")),
        ];
        let pairs = build_pairs(&examples);
        let positives: Vec<_> = pairs.iter().filter(|p| p.label == 1.0).collect();
        // Only (1,2) share a target; (1,3) and (2,3) do not pair.
        assert_eq!(positives.len(), 1);
        assert_eq!(positives[0].first, PathBuf::from("/p/1.jpg"));
        assert_eq!(positives[0].second, PathBuf::from("/p/2.jpg"));
    }

    #[test]
    fn test_negative_pairs_cross_kinds() {
        let examples = vec![
            example(1, FeedbackKind::Correct, Some("A"), Some("/p/1.jpg")),
            example(2, FeedbackKind::Correct, Some("B"), Some("/p/2.jpg")),
            example(3, FeedbackKind::Incorrect, Some("C"), Some("/p/3.jpg")),
            example(4, FeedbackKind::Incorrect, Some("A"), Some("/p/4.jpg")),
        ];
        let pairs = build_pairs(&examples);
        let negatives: Vec<_> = pairs.iter().filter(|p| p.label == 0.0).collect();
        // 2 correct x 2 incorrect, item ids irrelevant.
        assert_eq!(negatives.len(), 4);
    }

    #[test]
    fn test_examples_without_images_excluded() {
        let examples = vec![
            example(1, FeedbackKind::Correct, Some("A"), None),
            example(2, FeedbackKind::Correct, Some("A"), Some("/p/2.jpg")),
            example(3, FeedbackKind::Incorrect, Some("B"), Some("/p/3.jpg")),
        ];
        let pairs = build_pairs(&examples);
        assert!(pairs.iter().all(|p| p.label == 0.0));
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_new_item_examples_do_not_pair() {
        let examples = vec![
            example(1, FeedbackKind::Correct, Some("A"), Some("/p/1.jpg")),
            example(2, FeedbackKind::NewItem, None, Some("/p/2.jpg")),
        ];
        assert!(build_pairs(&examples).is_empty());
    }

    #[test]
    fn test_split_is_ordered_80_20() {
        let examples: Vec<TrainingExample> = (0..10)
            .map(|i| example(i, FeedbackKind::Correct, Some("A"), Some("/p/x.jpg")))
            .collect();
        let (train, validation) = split_ordered(&examples);
        assert_eq!(train.len(), 8);
        assert_eq!(validation.len(), 2);
        // Insertion order preserved: validation is the tail.
        assert_eq!(validation[0].id, 8);
        assert_eq!(validation[1].id, 9);
    }

    #[test]
    fn test_split_of_tiny_set() {
        let examples = vec![example(0, FeedbackKind::Correct, Some("A"), None)];
        let (train, validation) = split_ordered(&examples);
        assert_eq!(train.len(), 1);
        assert!(validation.is_empty());
    }
}
