//! Error taxonomy for the generation pipeline.
//!
//! Every variant is `Clone` on purpose: a coalesced request fans its single
//! outcome out to every waiter through a broadcast channel, so the error has
//! to be cheap to duplicate. Transport errors are therefore carried as
//! strings rather than as their original source types.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum GenerateError {
  /// HTTP/fetch-level failure talking to the backend. Retryable.
  #[error("network error: {0}")]
  Network(String),

  /// The per-attempt timeout fired and the call was cancelled. Retryable.
  #[error("request timed out after {ms} ms")]
  Timeout { ms: u64 },

  /// Caller-initiated abort. Never retried, surfaces immediately.
  #[error("generation cancelled by caller")]
  Cancelled,

  /// No question could be recovered from the raw output, even after the
  /// strict-JSON reformat fallback. Counts as a failed attempt. Retryable.
  #[error("could not recover a question from model output: {0}")]
  Parse(String),

  /// The recovered question violates a structural invariant (answer count,
  /// duplicates, index range, length). Forces a fresh generation. Retryable.
  #[error("structural validation failed: {0}")]
  Structural(String),

  /// Blind verification could not match the model's answer against any
  /// option with enough confidence to interpret the mismatch. The question
  /// is discarded, not patched. Retryable.
  #[error("verification too ambiguous (best match score {score:.2}); regeneration required")]
  RegenerationRequired { score: f32 },

  /// No reachable backend. Not retryable; callers should re-check
  /// availability before generating again.
  #[error("backend unavailable: {0}")]
  Unavailable(String),

  /// Terminal failure after exhausting the retry budget.
  #[error("generation failed after {attempts} attempts: {last}")]
  Failed { attempts: u32, last: String },
}

impl GenerateError {
  /// Whether the outer attempt loop may re-issue generation for this error.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      GenerateError::Network(_)
        | GenerateError::Timeout { .. }
        | GenerateError::Parse(_)
        | GenerateError::Structural(_)
        | GenerateError::RegenerationRequired { .. }
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retryable_classification_matches_policy() {
    assert!(GenerateError::Network("boom".into()).is_retryable());
    assert!(GenerateError::Timeout { ms: 100 }.is_retryable());
    assert!(GenerateError::Parse("no json".into()).is_retryable());
    assert!(GenerateError::Structural("3 answers".into()).is_retryable());
    assert!(GenerateError::RegenerationRequired { score: 0.4 }.is_retryable());

    assert!(!GenerateError::Cancelled.is_retryable());
    assert!(!GenerateError::Unavailable("down".into()).is_retryable());
    assert!(!GenerateError::Failed { attempts: 3, last: "x".into() }.is_retryable());
  }
}
