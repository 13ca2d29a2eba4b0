//! Process-lifetime validation statistics.
//!
//! Lives on the client instance (never a language-level global) so
//! independent clients in tests do not interfere. Folding an outcome in is
//! non-destructive; `reset` is the only way to clear.

use serde::Serialize;

use crate::domain::{Confidence, ValidationAction, ValidationOutcome};

#[derive(Clone, Debug, Default, Serialize)]
pub struct ValidationStats {
  pub total_validations: u64,
  pub confirmed: u64,
  pub corrected: u64,
  pub flagged: u64,
  pub regenerated: u64,
  /// Verification calls that failed outright (network, unparseable).
  pub validation_errors: u64,
  pub confidence_high: u64,
  pub confidence_medium: u64,
  pub confidence_low: u64,
  scores: Vec<f32>,
}

impl ValidationStats {
  /// Fold one verification outcome in. The confidence histogram only counts
  /// validations that produced a usable verdict (i.e. not regenerations).
  pub fn record_outcome(&mut self, outcome: &ValidationOutcome) {
    self.total_validations += 1;
    self.scores.push(outcome.match_score);
    match outcome.action {
      ValidationAction::Confirmed => self.confirmed += 1,
      ValidationAction::Corrected => self.corrected += 1,
      ValidationAction::Flagged => self.flagged += 1,
      ValidationAction::Regenerate => self.regenerated += 1,
    }
    if outcome.action != ValidationAction::Regenerate {
      match outcome.confidence {
        Confidence::High => self.confidence_high += 1,
        Confidence::Medium => self.confidence_medium += 1,
        Confidence::Low => self.confidence_low += 1,
      }
    }
  }

  /// A verification attempt that never produced a verdict.
  pub fn record_error(&mut self) {
    self.total_validations += 1;
    self.validation_errors += 1;
  }

  pub fn successful(&self) -> u64 {
    self.confirmed + self.corrected + self.flagged
  }

  pub fn average_score(&self) -> Option<f32> {
    if self.scores.is_empty() {
      None
    } else {
      Some(self.scores.iter().sum::<f32>() / self.scores.len() as f32)
    }
  }

  pub fn min_score(&self) -> Option<f32> {
    self.scores.iter().copied().reduce(f32::min)
  }

  pub fn max_score(&self) -> Option<f32> {
    self.scores.iter().copied().reduce(f32::max)
  }

  pub fn reset(&mut self) {
    *self = ValidationStats::default();
  }

  /// Human-readable report for debug surfaces.
  pub fn report(&self) -> String {
    let fmt = |v: Option<f32>| v.map(|s| format!("{s:.2}")).unwrap_or_else(|| "-".into());
    format!(
      "validations: {} total | {} confirmed, {} corrected, {} flagged, {} regenerated, {} errors\n\
       confidence: high={} medium={} low={}\n\
       match score: avg={} min={} max={}",
      self.total_validations,
      self.confirmed,
      self.corrected,
      self.flagged,
      self.regenerated,
      self.validation_errors,
      self.confidence_high,
      self.confidence_medium,
      self.confidence_low,
      fmt(self.average_score()),
      fmt(self.min_score()),
      fmt(self.max_score()),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn outcome(action: ValidationAction, confidence: Confidence, score: f32) -> ValidationOutcome {
    ValidationOutcome {
      action,
      confidence,
      match_score: score,
      suggested_index: None,
      reason: String::new(),
      regenerate_required: action == ValidationAction::Regenerate,
    }
  }

  #[test]
  fn counters_and_histogram_stay_consistent() {
    let mut stats = ValidationStats::default();
    stats.record_outcome(&outcome(ValidationAction::Confirmed, Confidence::High, 0.95));
    stats.record_outcome(&outcome(ValidationAction::Corrected, Confidence::Medium, 0.8));
    stats.record_outcome(&outcome(ValidationAction::Flagged, Confidence::Low, 0.65));
    stats.record_outcome(&outcome(ValidationAction::Regenerate, Confidence::High, 0.3));
    stats.record_error();

    assert_eq!(stats.total_validations, 5);
    assert!(stats.successful() + stats.validation_errors <= stats.total_validations);

    // Histogram counts only validations with a usable verdict.
    let histogram = stats.confidence_high + stats.confidence_medium + stats.confidence_low;
    assert_eq!(histogram, 3);
    assert_eq!(stats.regenerated, 1);
  }

  #[test]
  fn score_aggregates_track_min_avg_max() {
    let mut stats = ValidationStats::default();
    assert!(stats.average_score().is_none());
    stats.record_outcome(&outcome(ValidationAction::Confirmed, Confidence::High, 1.0));
    stats.record_outcome(&outcome(ValidationAction::Flagged, Confidence::Low, 0.6));
    assert_eq!(stats.min_score(), Some(0.6));
    assert_eq!(stats.max_score(), Some(1.0));
    let avg = stats.average_score().expect("avg");
    assert!((avg - 0.8).abs() < 1e-6);
  }

  #[test]
  fn reset_clears_everything() {
    let mut stats = ValidationStats::default();
    stats.record_outcome(&outcome(ValidationAction::Confirmed, Confidence::High, 1.0));
    stats.record_error();
    stats.reset();
    assert_eq!(stats.total_validations, 0);
    assert!(stats.report().contains("0 total"));
  }
}
