//! Fuzzy matching of a free-text verification answer against the four
//! candidate options.
//!
//! Score composition, in increasing precedence:
//! - token-overlap ratio over words longer than 2 chars, where token
//!   equality is relaxed to substring containment or edit distance <= 1
//! - containment bonus (>= 0.8) when one normalized string wholly contains
//!   the other
//! - numeric bonus (>= 0.9) when both sides embed the same number (years,
//!   counts) — numeric tokens are matched exactly, never fuzzily, because
//!   "1944" and "1945" are different answers
//! - exact normalized equality scores 1.0

use regex::Regex;
use std::sync::OnceLock;

fn number_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"))
}

/// Lowercase, strip punctuation/diacritic-free symbols to spaces, collapse
/// whitespace. Keeps letters and digits of any script.
fn normalize(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for ch in s.trim().chars() {
    if ch.is_alphanumeric() {
      out.extend(ch.to_lowercase());
    } else {
      out.push(' ');
    }
  }
  out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokens(s: &str) -> Vec<&str> {
  s.split_whitespace().filter(|w| w.chars().count() > 2).collect()
}

fn is_numeric(token: &str) -> bool {
  !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

/// Levenshtein distance <= 1, checked without building the full matrix.
fn within_one_edit(a: &str, b: &str) -> bool {
  let ac: Vec<char> = a.chars().collect();
  let bc: Vec<char> = b.chars().collect();
  let (la, lb) = (ac.len(), bc.len());
  if la.abs_diff(lb) > 1 {
    return false;
  }
  if la == lb {
    return ac.iter().zip(&bc).filter(|(x, y)| x != y).count() <= 1;
  }
  // One insertion: walk the longer side allowing a single skip.
  let (long, short) = if la > lb { (&ac, &bc) } else { (&bc, &ac) };
  let mut i = 0;
  let mut j = 0;
  let mut skipped = false;
  while i < long.len() && j < short.len() {
    if long[i] == short[j] {
      i += 1;
      j += 1;
    } else if skipped {
      return false;
    } else {
      skipped = true;
      i += 1;
    }
  }
  true
}

fn token_matches(a: &str, b: &str) -> bool {
  if a == b {
    return true;
  }
  // Years/counts must agree exactly.
  if is_numeric(a) || is_numeric(b) {
    return false;
  }
  a.contains(b) || b.contains(a) || within_one_edit(a, b)
}

fn embedded_numbers(s: &str) -> Vec<String> {
  number_re().find_iter(s).map(|m| m.as_str().to_string()).collect()
}

/// Similarity in [0, 1] between a free-text answer and one option.
pub fn match_score(free_text: &str, option: &str) -> f32 {
  let a = normalize(free_text);
  let b = normalize(option);
  if a.is_empty() || b.is_empty() {
    return 0.0;
  }
  if a == b {
    return 1.0;
  }

  let ta = tokens(&a);
  let tb = tokens(&b);
  let mut score = if ta.is_empty() || tb.is_empty() {
    0.0
  } else {
    let matched = tb
      .iter()
      .filter(|bt| ta.iter().any(|at| token_matches(at, bt)))
      .count();
    matched as f32 / ta.len().max(tb.len()) as f32
  };

  if a.contains(&b) || b.contains(&a) {
    score = score.max(0.85);
  }

  let na = embedded_numbers(&a);
  if !na.is_empty() {
    let nb = embedded_numbers(&b);
    if na.iter().any(|n| nb.contains(n)) {
      score = score.max(0.92);
    }
  }

  score.clamp(0.0, 1.0)
}

/// Index and score of the best-matching option. Ties keep the first option.
pub fn best_match(free_text: &str, options: &[String]) -> (usize, f32) {
  let mut best_idx = 0;
  let mut best_score = f32::MIN;
  for (i, opt) in options.iter().enumerate() {
    let s = match_score(free_text, opt);
    if s > best_score {
      best_idx = i;
      best_score = s;
    }
  }
  (best_idx, best_score.max(0.0))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exact_match_scores_one() {
    assert_eq!(match_score("Madrid", "madrid"), 1.0);
    assert_eq!(match_score("  La Paz ", "la paz"), 1.0);
  }

  #[test]
  fn year_answers_pick_the_matching_year() {
    let options: Vec<String> =
      ["1944", "1945", "1946", "1943"].iter().map(|s| s.to_string()).collect();
    let (idx, score) = best_match("1945", &options);
    assert_eq!(idx, 1);
    assert_eq!(score, 1.0);
  }

  #[test]
  fn embedded_year_gets_the_numeric_bonus() {
    let s = match_score("the war ended in 1945", "En 1945 (fin de la guerra)");
    assert!(s >= 0.9, "got {s}");
  }

  #[test]
  fn close_years_are_not_confused() {
    assert!(match_score("1945", "1944") < 0.6);
    assert!(match_score("ended in 1945", "ended in 1944") < 1.0);
  }

  #[test]
  fn unrelated_options_stay_below_the_regenerate_cutoff() {
    for opt in ["banana", "apple", "mountain bike"] {
      assert!(match_score("1945", opt) < 0.6, "1945 vs {opt}");
    }
  }

  #[test]
  fn containment_scores_high() {
    let s = match_score("the answer is Lake Titicaca", "Titicaca");
    assert!(s >= 0.8, "got {s}");
  }

  #[test]
  fn token_overlap_tolerates_one_typo() {
    let s = match_score("Gabriel Garcia Marquez", "Gabriel García Márques");
    assert!(s >= 0.6, "got {s}");
  }

  #[test]
  fn best_match_ties_keep_the_first_option() {
    let options: Vec<String> = ["x", "x"].iter().map(|s| s.to_string()).collect();
    let (idx, _) = best_match("x", &options);
    assert_eq!(idx, 0);
  }
}
