//! Bounded FIFO cache of pre-validated questions.
//!
//! Keyed by (category, difficulty, topic) with the empty topic normalized.
//! Two bounds: per-key length (oldest question evicted on append) and total
//! key count (whole oldest key evicted on insert). All operations are
//! synchronous; the client serializes access behind its own lock so
//! append-then-trim and insert-then-evict stay atomic.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::domain::Question;

pub fn cache_key(category: &str, difficulty: &str, topic: &str) -> String {
  format!(
    "{}|{}|{}",
    category.trim().to_lowercase(),
    difficulty.trim().to_lowercase(),
    topic.trim().to_lowercase()
  )
}

pub struct QuestionCache {
  entries: HashMap<String, VecDeque<Question>>,
  /// Key insertion order, oldest first.
  order: VecDeque<String>,
  max_per_key: usize,
  max_keys: usize,
}

impl QuestionCache {
  pub fn new(max_per_key: usize, max_keys: usize) -> Self {
    Self {
      entries: HashMap::new(),
      order: VecDeque::new(),
      max_per_key: max_per_key.max(1),
      max_keys: max_keys.max(1),
    }
  }

  /// Pop the oldest stored question for this key, if any.
  pub fn pop(&mut self, key: &str) -> Option<Question> {
    let entry = self.entries.get_mut(key)?;
    let q = entry.pop_front();
    if entry.is_empty() {
      self.entries.remove(key);
      self.order.retain(|k| k != key);
    }
    q
  }

  /// Append a validated question. Trims the entry to the per-key bound and
  /// then evicts whole keys FIFO if the key set outgrew its bound.
  pub fn push(&mut self, key: &str, q: Question) {
    if !self.entries.contains_key(key) {
      self.order.push_back(key.to_string());
    }
    let entry = self.entries.entry(key.to_string()).or_default();
    entry.push_back(q);
    while entry.len() > self.max_per_key {
      entry.pop_front();
    }

    while self.entries.len() > self.max_keys {
      if let Some(oldest) = self.order.pop_front() {
        debug!(target: "pipeline", key = %oldest, "evicting oldest cache key");
        self.entries.remove(&oldest);
      } else {
        break;
      }
    }
  }

  pub fn len(&self, key: &str) -> usize {
    self.entries.get(key).map(|e| e.len()).unwrap_or(0)
  }

  pub fn key_count(&self) -> usize {
    self.entries.len()
  }

  pub fn total_questions(&self) -> usize {
    self.entries.values().map(|e| e.len()).sum()
  }
}
