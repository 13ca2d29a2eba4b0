//! Question validation: structural invariants, blind-verification reply
//! parsing, the accept / auto-correct / regenerate decision policy, and the
//! cheap pattern fallback used when full verification is disabled.
//!
//! The decision is pure: the pipeline performs the backend calls and hands
//! the reply text in, so every branch of the policy is testable offline.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::info;

use crate::domain::{Confidence, Question, ValidationAction, ValidationOutcome};
use crate::similarity;
use crate::util::squash;

/// Thresholds for the decision policy. Carried as data so deployments can
/// tune the empirically chosen cutoffs.
#[derive(Clone, Copy, Debug)]
pub struct ValidationPolicy {
  pub regenerate_threshold: f32,
  pub correction_threshold: f32,
}

/// Structural invariants checked on every question, verification or not.
/// Any failure forces a fresh generation; nothing here is silently patched.
pub fn check_structure(q: &Question, min_question_len: usize) -> Result<(), String> {
  if q.text.trim().chars().count() < min_question_len {
    return Err(format!("question text shorter than {min_question_len} chars"));
  }
  if q.answers.len() != 4 {
    return Err(format!("expected 4 answers, got {}", q.answers.len()));
  }
  if q.answers.iter().any(|a| a.trim().is_empty()) {
    return Err("empty answer option".into());
  }
  for i in 0..q.answers.len() {
    for j in i + 1..q.answers.len() {
      if squash(&q.answers[i]) == squash(&q.answers[j]) {
        return Err(format!("duplicate answers at {i} and {j}"));
      }
    }
  }
  if q.correct_index > 3 {
    return Err(format!("correct_index {} out of range", q.correct_index));
  }
  Ok(())
}

/// What the backend said when asked the bare question, options withheld.
#[derive(Clone, Debug)]
pub struct VerificationReply {
  pub answer: String,
  pub confidence: Confidence,
  pub reason: String,
}

/// Parse a blind-verification reply through the same tolerant lens as
/// generation output: balanced JSON with duck-typed field names, degrading
/// to "the whole reply is the answer" at medium confidence.
pub fn parse_verification_reply(raw: &str) -> VerificationReply {
  let cleaned = crate::normalize::strip_noise(raw);

  if let Some(start) = cleaned.find('{') {
    // Reuse the JSON-object tolerance: parse whatever object is there.
    let candidate = &cleaned[start..];
    if let Ok(value) = loose_json(candidate) {
      let answer = str_of(&value, &["respuesta", "answer", "respuesta_correcta"]);
      if let Some(answer) = answer {
        let confidence = str_of(&value, &["confianza", "confidence"])
          .map(|s| Confidence::parse(&s))
          .unwrap_or(Confidence::Medium);
        let reason = str_of(&value, &["razon", "razón", "reason", "explicacion", "explanation"])
          .unwrap_or_default();
        return VerificationReply { answer, confidence, reason };
      }
    }
  }

  // Free-text degradation: first non-empty line, medium confidence.
  let answer = cleaned
    .lines()
    .map(str::trim)
    .find(|l| !l.is_empty())
    .unwrap_or("")
    .to_string();
  VerificationReply { answer, confidence: Confidence::Medium, reason: String::new() }
}

fn loose_json(text: &str) -> Result<Value, serde_json::Error> {
  // Balanced-prefix parse: serde stops at the first complete object when we
  // hand it a trimmed candidate, so cut at the last '}' we can find.
  let end = text.rfind('}').map(|i| i + 1).unwrap_or(text.len());
  serde_json::from_str(&text[..end])
}

fn str_of(value: &Value, names: &[&str]) -> Option<String> {
  for n in names {
    match value.get(*n) {
      Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
      Some(Value::Number(num)) => return Some(num.to_string()),
      _ => {}
    }
  }
  None
}

/// Apply the decision policy. May mutate the question exactly once
/// (auto-correction rewrites `correct_index` and `explanation`).
pub fn decide(q: &mut Question, reply: &VerificationReply, policy: &ValidationPolicy) -> ValidationOutcome {
  let (suggested, score) = similarity::best_match(&reply.answer, &q.answers);
  decide_scored(q, reply, policy, suggested, score)
}

fn decide_scored(
  q: &mut Question,
  reply: &VerificationReply,
  policy: &ValidationPolicy,
  suggested: usize,
  score: f32,
) -> ValidationOutcome {
  if score < policy.regenerate_threshold {
    // Too unreliable to interpret either way: discard, never patch.
    return ValidationOutcome {
      action: ValidationAction::Regenerate,
      confidence: reply.confidence,
      match_score: score,
      suggested_index: None,
      reason: format!("no option matched the verified answer '{}'", reply.answer),
      regenerate_required: true,
    };
  }

  if suggested == q.correct_index {
    return ValidationOutcome {
      action: ValidationAction::Confirmed,
      confidence: reply.confidence,
      match_score: score,
      suggested_index: Some(suggested),
      reason: "verification agrees with the stored answer".into(),
      regenerate_required: false,
    };
  }

  if score >= policy.correction_threshold && reply.confidence != Confidence::Low {
    info!(
      target: "validation",
      from = q.correct_index,
      to = suggested,
      score,
      "auto-correcting answer index"
    );
    q.correct_index = suggested;
    if !reply.reason.trim().is_empty() {
      q.explanation = reply.reason.trim().to_string();
    }
    return ValidationOutcome {
      action: ValidationAction::Corrected,
      confidence: reply.confidence,
      match_score: score,
      suggested_index: Some(suggested),
      reason: format!("verified answer matched option {suggested}"),
      regenerate_required: false,
    };
  }

  // Mismatch we are not confident enough to act on: flag only.
  ValidationOutcome {
    action: ValidationAction::Flagged,
    confidence: reply.confidence,
    match_score: score,
    suggested_index: Some(suggested),
    reason: "low-confidence mismatch; question left unchanged".into(),
    regenerate_required: false,
  }
}

// --- Pattern fallback (full verification disabled) ---

/// Coarse question families the cheap heuristic can reason about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuestionKind {
  HistoricalDate,
  Geography,
  Science,
  Entertainment,
}

fn year_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\b(1[0-9]{3}|20[0-2][0-9])\b").expect("static regex"))
}

fn geo_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"(?i)\b(capital|pa[ií]s|r[ií]o|ciudad|continente|monta[ñn]a|ocean[oa]?|country|river|city|mountain)\b")
      .expect("static regex")
  })
}

fn sci_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"(?i)\b(elemento|qu[ií]mic[oa]|planeta|c[eé]lula|f[ií]sica|especie|element|planet|cell|physics|species|chemical)\b")
      .expect("static regex")
  })
}

pub fn classify_question(text: &str) -> QuestionKind {
  if year_re().is_match(text) {
    QuestionKind::HistoricalDate
  } else if geo_re().is_match(text) {
    QuestionKind::Geography
  } else if sci_re().is_match(text) {
    QuestionKind::Science
  } else {
    QuestionKind::Entertainment
  }
}

/// The token that makes the chosen answer distinguishable. The strategy
/// follows the question family: date questions anchor on the year embedded
/// in the answer, everything else on its most specific word.
fn distinguishing_token(answer: &str, kind: QuestionKind) -> Option<String> {
  if kind == QuestionKind::HistoricalDate {
    if let Some(m) = year_re().find(answer) {
      return Some(m.as_str().to_string());
    }
  }
  keyword_token(answer)
}

fn keyword_token(answer: &str) -> Option<String> {
  answer
    .split_whitespace()
    .filter(|w| w.chars().count() > 3)
    .max_by_key(|w| w.chars().count())
    .map(|w| squash(w))
}

/// Cheap plausibility check: does the explanation mention what makes the
/// chosen answer special? When it doesn't, the caller escalates to a
/// one-off blind verification for this question only.
pub fn needs_escalation(q: &Question) -> bool {
  let chosen = match q.answers.get(q.correct_index) {
    Some(a) => a,
    None => return true,
  };
  let kind = classify_question(&q.text);
  let token = match distinguishing_token(chosen, kind) {
    Some(t) => t,
    // Nothing to anchor on ("yes", "42"): trust the structural checks.
    None => return false,
  };
  let haystack = squash(&format!("{} {}", q.explanation, q.text));
  !haystack.contains(&token)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;

  fn question(answers: [&str; 4], correct: usize) -> Question {
    Question {
      text: "¿En qué año terminó la Segunda Guerra Mundial en Europa?".into(),
      answers: answers.iter().map(|s| s.to_string()).collect(),
      correct_index: correct,
      category: "historia".into(),
      difficulty: "easy".into(),
      explanation: "La guerra terminó en 1945.".into(),
      topic: "world wars".into(),
      source: "ollama".into(),
      created_at: Utc::now(),
    }
  }

  fn policy() -> ValidationPolicy {
    ValidationPolicy { regenerate_threshold: 0.6, correction_threshold: 0.7 }
  }

  fn reply(answer: &str, confidence: Confidence) -> VerificationReply {
    VerificationReply { answer: answer.into(), confidence, reason: "porque sí".into() }
  }

  #[test]
  fn structure_rejects_bad_shapes() {
    let ok = question(["1944", "1945", "1946", "1943"], 1);
    assert!(check_structure(&ok, 10).is_ok());

    let mut too_short = ok.clone();
    too_short.text = "¿Año?".into();
    assert!(check_structure(&too_short, 10).is_err());

    let mut dup = ok.clone();
    dup.answers[2] = " 1944 ".into();
    assert!(check_structure(&dup, 10).is_err());

    let mut oob = ok.clone();
    oob.correct_index = 4;
    assert!(check_structure(&oob, 10).is_err());

    let mut empty = ok;
    empty.answers[3] = "  ".into();
    assert!(check_structure(&empty, 10).is_err());
  }

  #[test]
  fn high_confidence_strong_match_auto_corrects() {
    let mut q = question(["1944", "1945", "1946", "1943"], 0);
    let out = decide_scored(&mut q, &reply("1945", Confidence::High), &policy(), 1, 0.85);
    assert_eq!(out.action, ValidationAction::Corrected);
    assert_eq!(q.correct_index, 1);
    assert_eq!(q.explanation, "porque sí");
    assert!(!out.regenerate_required);
  }

  #[test]
  fn low_confidence_mismatch_is_flag_only() {
    let mut q = question(["1944", "1945", "1946", "1943"], 0);
    let out = decide_scored(&mut q, &reply("1945", Confidence::Low), &policy(), 1, 0.65);
    assert_eq!(out.action, ValidationAction::Flagged);
    assert_eq!(q.correct_index, 0, "question must stay untouched");
    assert_eq!(out.suggested_index, Some(1));
  }

  #[test]
  fn unmatchable_reply_forces_regeneration() {
    let mut q = question(["1944", "1945", "1946", "1943"], 0);
    let out = decide_scored(&mut q, &reply("a banana", Confidence::High), &policy(), 2, 0.4);
    assert_eq!(out.action, ValidationAction::Regenerate);
    assert!(out.regenerate_required);
    assert_eq!(out.suggested_index, None);
    assert_eq!(q.correct_index, 0);
  }

  #[test]
  fn agreement_is_confirmed_without_mutation() {
    let mut q = question(["1944", "1945", "1946", "1943"], 1);
    let out = decide(&mut q, &reply("1945", Confidence::High), &policy());
    assert_eq!(out.action, ValidationAction::Confirmed);
    assert_eq!(q.correct_index, 1);
  }

  #[test]
  fn end_to_end_decide_corrects_on_real_scoring() {
    let mut q = question(["1944", "1945", "1946", "1943"], 0);
    let out = decide(&mut q, &reply("en 1945", Confidence::High), &policy());
    assert_eq!(out.action, ValidationAction::Corrected);
    assert_eq!(q.correct_index, 1);
    assert!(out.match_score >= 0.9);
  }

  #[test]
  fn verification_reply_parses_json_and_free_text() {
    let r = parse_verification_reply(
      "```json\n{\"respuesta\": \"1945\", \"confianza\": \"alta\", \"razon\": \"fin de la guerra\"}\n```",
    );
    assert_eq!(r.answer, "1945");
    assert_eq!(r.confidence, Confidence::High);
    assert_eq!(r.reason, "fin de la guerra");

    let r = parse_verification_reply("La respuesta es 1945.\nSin más detalle.");
    assert_eq!(r.answer, "La respuesta es 1945.");
    assert_eq!(r.confidence, Confidence::Medium);
  }

  #[test]
  fn classification_covers_the_four_families() {
    assert_eq!(classify_question("¿Qué pasó en 1492?"), QuestionKind::HistoricalDate);
    assert_eq!(classify_question("¿Cuál es la capital de Francia?"), QuestionKind::Geography);
    assert_eq!(classify_question("¿Qué elemento tiene símbolo Fe?"), QuestionKind::Science);
    assert_eq!(classify_question("¿Quién dirigió esa película?"), QuestionKind::Entertainment);
  }

  #[test]
  fn escalation_triggers_when_explanation_ignores_the_answer() {
    let mut q = question(["1944", "1945", "1946", "1943"], 1);
    assert!(!needs_escalation(&q), "explanation mentions 1945");

    q.explanation = "Fue un momento importante de la historia.".into();
    q.text = "¿Cuándo terminó la guerra en Europa occidental exactamente?".into();
    assert!(needs_escalation(&q));
  }

  #[test]
  fn question_family_picks_the_anchor_token() {
    // Date question: the year in the answer is the anchor, words are not.
    let mut q = question(["en 1945", "en 1946", "en 1947", "en 1944"], 0);
    q.text = "¿Qué ocurrió en 1940 en el continente europeo?".into();
    q.explanation = "Terminó la guerra en ese momento.".into();
    assert!(needs_escalation(&q), "the year 1945 is missing from the explanation");

    // Entertainment question: keyword anchor, the embedded year is ignored.
    let mut q = question(["Titanic 1997", "Casablanca 1942", "Vértigo 1958", "Psicosis 1960"], 0);
    q.text = "¿Qué famosa superproducción dirigió James Cameron?".into();
    q.explanation = "Cameron dirigió Titanic.".into();
    assert!(!needs_escalation(&q), "the keyword Titanic is present");
  }

  #[test]
  fn short_answers_without_anchor_do_not_escalate() {
    let mut q = question(["sí", "no", "42", "ns"], 0);
    q.explanation = "irrelevante".into();
    assert!(!needs_escalation(&q));
  }
}
