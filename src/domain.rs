//! Domain models: questions, generation requests, server endpoints,
//! validation outcomes, and the caller-facing cancellation token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// A fully validated multiple-choice question handed to the caller.
///
/// Invariants (enforced by the validator before a question leaves the
/// pipeline): exactly 4 answers, pairwise distinct ignoring case and
/// spacing, `correct_index` in `0..=3`. After that, the struct is mutated at
/// most once: auto-correction may rewrite `correct_index` and `explanation`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
  pub text: String,
  pub answers: Vec<String>,
  pub correct_index: usize,
  pub category: String,
  pub difficulty: String,
  pub explanation: String,
  pub topic: String,
  pub source: String,
  pub created_at: DateTime<Utc>,
}

/// One caller request. Immutable per call; the prompt rendered from it is
/// the key used for request coalescing.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
  pub category: String,
  pub difficulty: String,   // free-form (e.g., "easy", "hard")
  pub topic: Option<String>,
  pub avoid_topics: Vec<String>,
  pub language: String,
  pub cancel: Option<CancelToken>,
}

impl GenerationRequest {
  pub fn new(category: impl Into<String>, difficulty: impl Into<String>) -> Self {
    Self {
      category: category.into(),
      difficulty: difficulty.into(),
      topic: None,
      avoid_topics: Vec::new(),
      language: "es".into(),
      cancel: None,
    }
  }
}

/// One probed candidate backend. Transient; rebuilt on every discovery pass.
#[derive(Clone, Debug, Serialize)]
pub struct ServerEndpoint {
  pub url: String,
  pub available: bool,
  pub version: Option<String>,
  pub latency_ms: Option<u64>,
}

/// Confidence label reported by the backend during blind verification.
/// Spanish labels are accepted because the generation prompt is Spanish-first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
  High,
  Medium,
  Low,
}

impl Confidence {
  pub fn parse(label: &str) -> Confidence {
    match label.trim().to_lowercase().as_str() {
      "high" | "alta" => Confidence::High,
      "low" | "baja" => Confidence::Low,
      _ => Confidence::Medium,
    }
  }
}

/// What the decision policy did with a verified question.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationAction {
  /// Model-suggested answer agrees with the stored one.
  Confirmed,
  /// Mismatch strong enough to rewrite `correct_index` in place.
  Corrected,
  /// Low-confidence mismatch: recorded, question left untouched.
  Flagged,
  /// Best match score too low to interpret; question discarded.
  Regenerate,
}

/// Result of one blind-verification pass. Transient: folded into
/// `ValidationStats` and then dropped.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationOutcome {
  pub action: ValidationAction,
  pub confidence: Confidence,
  pub match_score: f32,
  pub suggested_index: Option<usize>,
  pub reason: String,
  pub regenerate_required: bool,
}

/// Caller-side cancellation. Dropping the source without calling `cancel`
/// leaves the token inert (the call runs to completion).
pub struct CancelSource {
  tx: watch::Sender<bool>,
}

#[derive(Clone, Debug)]
pub struct CancelToken {
  rx: watch::Receiver<bool>,
}

impl CancelSource {
  pub fn new() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
  }

  pub fn cancel(&self) {
    let _ = self.tx.send(true);
  }
}

impl CancelToken {
  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves when the source cancels. Never resolves if the source is
  /// dropped without cancelling.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    if *rx.borrow() {
      return;
    }
    loop {
      if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
      }
      if *rx.borrow() {
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn confidence_labels_accept_both_languages() {
    assert_eq!(Confidence::parse("ALTA"), Confidence::High);
    assert_eq!(Confidence::parse("high"), Confidence::High);
    assert_eq!(Confidence::parse("baja"), Confidence::Low);
    assert_eq!(Confidence::parse("something else"), Confidence::Medium);
  }

  #[tokio::test]
  async fn cancel_token_fires_once_cancelled() {
    let (src, tok) = CancelSource::new();
    assert!(!tok.is_cancelled());
    src.cancel();
    assert!(tok.is_cancelled());
    tok.cancelled().await; // must not hang
  }
}
