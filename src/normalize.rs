//! Tolerant recovery of a structured question from raw model output.
//!
//! Strategy chain, tried in order until one yields a question:
//! 1. JSON: strip reasoning sections / code fences / smart quotes, extract
//!    the first balanced JSON object by brace counting (synthesizing missing
//!    closers), apply light repairs, parse, adapt field names.
//! 2. Prose reconstruction: question line, bullet/lettered/numbered options
//!    or a 4-way delimiter split, correct-answer line, explanation line.
//!
//! The strict-JSON reformat fallback (one extra backend call) lives in the
//! pipeline, which re-runs only strategy 1 on the follow-up output.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::domain::{GenerationRequest, Question};
use crate::util::squash;

/// A question recovered from raw text, before request metadata is attached
/// and before structural validation.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveredQuestion {
  pub text: String,
  pub answers: Vec<String>,
  pub correct_index: usize,
  pub explanation: String,
}

impl RecoveredQuestion {
  /// Attach request metadata to produce the caller-facing question.
  pub fn into_question(self, req: &GenerationRequest, topic: &str) -> Question {
    Question {
      text: self.text,
      answers: self.answers,
      correct_index: self.correct_index,
      category: req.category.clone(),
      difficulty: req.difficulty.clone(),
      explanation: self.explanation,
      topic: topic.to_string(),
      source: "ollama".into(),
      created_at: Utc::now(),
    }
  }
}

/// Full strategy chain. Errors describe the *last* failure for logging.
pub fn recover(raw: &str) -> Result<RecoveredQuestion, String> {
  let cleaned = strip_noise(raw);
  if let Some(q) = recover_from_json(&cleaned) {
    return Ok(q);
  }
  debug!(target: "pipeline", "no usable JSON object; trying prose reconstruction");
  if let Some(q) = reconstruct_from_prose(&cleaned) {
    return Ok(q);
  }
  Err("no JSON object and prose reconstruction failed".into())
}

/// JSON-only chain, used on the output of the strict reformat call.
pub fn recover_json_only(raw: &str) -> Result<RecoveredQuestion, String> {
  let cleaned = strip_noise(raw);
  recover_from_json(&cleaned).ok_or_else(|| "reformat output still not parseable".into())
}

// --- Step 1: noise stripping ---

/// Remove reasoning sections and code-fence markers, normalize smart quotes.
/// Fence *markers* are dropped but fenced content survives, since models
/// love wrapping the JSON we asked for in ```json fences.
pub fn strip_noise(text: &str) -> String {
  let mut s = text.replace(['\u{201C}', '\u{201D}'], "\"").replace(['\u{2018}', '\u{2019}'], "'");
  for tag in ["think", "thinking", "reasoning"] {
    s = strip_tagged_section(&s, tag);
  }
  s.lines()
    .filter(|line| !line.trim_start().starts_with("```"))
    .collect::<Vec<_>>()
    .join("\n")
}

/// Drop `<tag>…</tag>` (case-insensitive). An unclosed tag swallows the rest
/// of the text — models that get cut off mid-reasoning produce nothing
/// useful after the opener anyway.
fn strip_tagged_section(text: &str, tag: &str) -> String {
  let lower: String = text.chars().map(|c| c.to_ascii_lowercase()).collect();
  let open = format!("<{tag}>");
  let close = format!("</{tag}>");
  let mut out = String::with_capacity(text.len());
  let mut pos = 0;
  while let Some(rel) = lower[pos..].find(&open) {
    let start = pos + rel;
    out.push_str(&text[pos..start]);
    match lower[start..].find(&close) {
      Some(rel_close) => pos = start + rel_close + close.len(),
      None => return out,
    }
  }
  out.push_str(&text[pos..]);
  out
}

// --- Step 2/3: balanced extraction and light repair ---

/// First balanced JSON object found by brace depth, string-aware. When the
/// text ends before depth returns to zero the missing closers are
/// synthesized.
fn extract_balanced_json(text: &str) -> Option<String> {
  let start = text.find('{')?;
  let mut depth = 0i32;
  let mut in_str = false;
  let mut escape = false;
  for (i, ch) in text[start..].char_indices() {
    if in_str {
      if escape {
        escape = false;
      } else if ch == '\\' {
        escape = true;
      } else if ch == '"' {
        in_str = false;
      }
      continue;
    }
    match ch {
      '"' => in_str = true,
      '{' => depth += 1,
      '}' => {
        depth -= 1;
        if depth == 0 {
          return Some(text[start..start + i + ch.len_utf8()].to_string());
        }
      }
      _ => {}
    }
  }
  // Truncated object: close the open string and the open braces.
  let mut s = text[start..].trim_end().to_string();
  if in_str {
    s.push('"');
  }
  for _ in 0..depth.max(0) {
    s.push('}');
  }
  Some(s)
}

/// Light repairs only: single-quoted keys/values become double-quoted, and
/// trailing commas before `}`/`]` are dropped. Anything beyond that is the
/// reformat call's job.
fn repair_json(s: &str) -> String {
  let mut quoted = String::with_capacity(s.len());
  let mut in_dq = false;
  let mut in_sq = false;
  let mut escape = false;
  for ch in s.chars() {
    if escape {
      quoted.push(ch);
      escape = false;
      continue;
    }
    match ch {
      '\\' => {
        escape = true;
        quoted.push(ch);
      }
      '"' if !in_sq => {
        in_dq = !in_dq;
        quoted.push(ch);
      }
      '\'' if !in_dq => {
        in_sq = !in_sq;
        quoted.push('"');
      }
      _ => quoted.push(ch),
    }
  }

  let chars: Vec<char> = quoted.chars().collect();
  let mut out = String::with_capacity(quoted.len());
  let mut in_str = false;
  let mut esc = false;
  for (i, &ch) in chars.iter().enumerate() {
    if in_str {
      out.push(ch);
      if esc {
        esc = false;
      } else if ch == '\\' {
        esc = true;
      } else if ch == '"' {
        in_str = false;
      }
      continue;
    }
    if ch == '"' {
      in_str = true;
      out.push(ch);
      continue;
    }
    if ch == ',' {
      let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
      if matches!(next, Some('}') | Some(']')) {
        continue;
      }
    }
    out.push(ch);
  }
  out
}

fn recover_from_json(cleaned: &str) -> Option<RecoveredQuestion> {
  let candidate = extract_balanced_json(cleaned)?;
  let value: Value = match serde_json::from_str(&candidate) {
    Ok(v) => v,
    Err(_) => serde_json::from_str(&repair_json(&candidate)).ok()?,
  };
  question_from_value(&value)
}

// --- Field-name adapters ---

fn field<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a Value> {
  names.iter().find_map(|n| obj.get(*n))
}

fn string_field(obj: &Value, names: &[&str]) -> Option<String> {
  let v = field(obj, names)?;
  match v {
    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
    _ => None,
  }
}

/// Adapt the duck-typed response shapes: Spanish schema first (that's what
/// the prompt asks for), then the English variants models drift into.
fn question_from_value(value: &Value) -> Option<RecoveredQuestion> {
  let text = string_field(value, &["pregunta", "question", "text", "enunciado"])?;

  let raw_answers = field(value, &["opciones", "options", "answers", "respuestas", "alternativas"])?
    .as_array()?;
  let mut answers: Vec<String> = raw_answers
    .iter()
    .filter_map(|v| match v {
      Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    })
    .collect();
  if answers.len() < 4 {
    return None;
  }
  // Longer lists are truncated, never padded.
  answers.truncate(4);

  let correct_value =
    field(value, &["respuesta_correcta", "correct_index", "correctIndex", "correct", "respuesta", "answer"])?;
  let correct_index = parse_correct_index(correct_value, &answers)?;

  let explanation = string_field(value, &["explicacion", "explicación", "explanation", "razon", "reason"])
    .unwrap_or_default();

  Some(RecoveredQuestion { text, answers, correct_index, explanation })
}

/// Accepted correct-answer encodings:
/// - JSON number: 0-based when in 0..=3; 4 is taken as 1-based and clamped
/// - string letter "A".."D" (either case)
/// - string numeral: 1-based ("1".."4"), except "0" which is 0-based
/// - string matching one option literally (case/space-insensitive)
fn parse_correct_index(value: &Value, answers: &[String]) -> Option<usize> {
  match value {
    Value::Number(n) => {
      let n = n.as_i64()?;
      match n {
        0..=3 => Some(n as usize),
        4 => Some(3),
        _ => None,
      }
    }
    Value::String(s) => {
      let s = s.trim();
      if s.len() == 1 {
        let c = s.chars().next()?.to_ascii_uppercase();
        if ('A'..='D').contains(&c) {
          return Some(c as usize - 'A' as usize);
        }
      }
      if let Ok(n) = s.parse::<i64>() {
        return match n {
          0 => Some(0),
          1..=4 => Some((n - 1) as usize),
          _ => None,
        };
      }
      let target = squash(s);
      answers.iter().position(|a| squash(a) == target)
    }
    _ => None,
  }
}

// --- Step 4: heuristic prose reconstruction ---

fn reconstruct_from_prose(text: &str) -> Option<RecoveredQuestion> {
  let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
  if lines.is_empty() {
    return None;
  }

  let question = find_question_line(&lines)?;
  let answers = extract_marked_options(&lines)
    .or_else(|| delimiter_split(&lines))
    .filter(|a| a.len() == 4)?;
  let correct_index = find_correct_index(&lines, &answers)?;
  let explanation = find_labeled_line(&lines, &["explicacion", "explicación", "explanation", "porque", "because"])
    .unwrap_or_default();

  Some(RecoveredQuestion { text: question, answers, correct_index, explanation })
}

fn find_question_line(lines: &[&str]) -> Option<String> {
  for line in lines {
    // ASCII-lowercasing keeps byte offsets stable for slicing.
    let lower: String = line.chars().map(|c| c.to_ascii_lowercase()).collect();
    if lower.starts_with("pregunta:") {
      let q = line["pregunta:".len()..].trim();
      if !q.is_empty() {
        return Some(q.to_string());
      }
    }
    if line.ends_with('?') || line.ends_with('？') {
      return Some((*line).to_string());
    }
  }
  None
}

/// Lines marked `- `, `* `, `A) `, `a. `, `1. `, `1) ` etc.
fn extract_marked_options(lines: &[&str]) -> Option<Vec<String>> {
  let mut opts = Vec::new();
  for line in lines {
    if let Some(opt) = strip_option_marker(line) {
      opts.push(opt);
    }
  }
  if opts.len() >= 4 {
    opts.truncate(4);
    Some(opts)
  } else {
    None
  }
}

fn strip_option_marker(line: &str) -> Option<String> {
  let mut chars = line.chars();
  let first = chars.next()?;
  let rest = chars.as_str();

  if (first == '-' || first == '*' || first == '•') && rest.starts_with(' ') {
    return non_empty(rest.trim());
  }
  if first.is_ascii_alphabetic() || first.is_ascii_digit() {
    // Letter/number markers are at most 2 digits ("10.") before the
    // separator; anything longer is prose.
    let mut tail = rest;
    if first.is_ascii_digit() {
      if let Some(c) = tail.chars().next() {
        if c.is_ascii_digit() {
          tail = &tail[1..];
        }
      }
    }
    let mut t = tail.chars();
    if matches!(t.next(), Some(')') | Some('.') | Some(':')) {
      return non_empty(t.as_str().trim());
    }
  }
  None
}

fn non_empty(s: &str) -> Option<String> {
  if s.is_empty() {
    None
  } else {
    Some(s.to_string())
  }
}

/// Last resort: a single line splitting into exactly 4 non-empty segments
/// on `;`, `|` or `/`.
fn delimiter_split(lines: &[&str]) -> Option<Vec<String>> {
  for line in lines {
    for delim in [';', '|', '/'] {
      let parts: Vec<String> = line
        .split(delim)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
      if parts.len() == 4 {
        return Some(parts);
      }
    }
  }
  None
}

fn find_correct_index(lines: &[&str], answers: &[String]) -> Option<usize> {
  for line in lines {
    let lower = line.to_lowercase();
    if !(lower.contains("correct") || lower.contains("respuesta") || lower.contains("answer")) {
      continue;
    }
    // Letter reference ("la correcta es B").
    for (i, letter) in ["a", "b", "c", "d"].iter().enumerate() {
      for pat in [format!(" {letter})"), format!(" {letter}."), format!(" {letter}:")] {
        if lower.contains(&pat) || lower.ends_with(&format!(" {letter}")) {
          return Some(i);
        }
      }
    }
    // 1-based index reference.
    for (i, digit) in ["1", "2", "3", "4"].iter().enumerate() {
      if lower.contains(&format!(" {digit})"))
        || lower.contains(&format!(" {digit}."))
        || lower.ends_with(&format!(" {digit}"))
      {
        return Some(i);
      }
    }
    // Literal text match against an extracted answer.
    let squashed = squash(&lower);
    if let Some(i) = answers.iter().position(|a| !a.is_empty() && squashed.contains(&squash(a))) {
      return Some(i);
    }
  }
  None
}

fn find_labeled_line(lines: &[&str], labels: &[&str]) -> Option<String> {
  for line in lines {
    let lower: String = line.chars().map(|c| c.to_ascii_lowercase()).collect();
    for label in labels {
      if let Some(pos) = lower.find(&format!("{label}:")) {
        let after = &line[pos + label.len() + 1..];
        let trimmed = after.trim();
        if !trimmed.is_empty() {
          return Some(trimmed.to_string());
        }
      }
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn answers(a: [&str; 4]) -> Vec<String> {
    a.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn extracts_json_surrounded_by_noise() {
    let raw = "blah blah {\"pregunta\":\"Q?\",\"opciones\":[\"A\",\"B\",\"C\",\"D\"],\"respuesta_correcta\":2,\"explicacion\":\"why\"} trailing junk";
    let q = recover(raw).expect("question");
    assert_eq!(q.text, "Q?");
    assert_eq!(q.answers, answers(["A", "B", "C", "D"]));
    assert_eq!(q.correct_index, 2);
  }

  #[test]
  fn letter_index_normalizes_to_zero_based() {
    let raw = r#"{"pregunta":"Q longer than min?","opciones":["A1","B2","C3","D4"],"respuesta_correcta":"C"}"#;
    let q = recover(raw).expect("question");
    assert_eq!(q.correct_index, 2);
  }

  #[test]
  fn one_based_string_index_normalizes_to_zero_based() {
    let raw = r#"{"pregunta":"Q?","opciones":["A1","B2","C3","D4"],"respuesta_correcta":"3"}"#;
    let q = recover(raw).expect("question");
    assert_eq!(q.correct_index, 2);
  }

  #[test]
  fn numeric_index_is_taken_as_zero_based() {
    let raw = r#"{"pregunta":"Q?","opciones":["A1","B2","C3","D4"],"respuesta_correcta":2}"#;
    let q = recover(raw).expect("question");
    assert_eq!(q.correct_index, 2);
  }

  #[test]
  fn numeric_four_is_clamped_as_one_based() {
    let raw = r#"{"pregunta":"Q?","opciones":["A1","B2","C3","D4"],"respuesta_correcta":4}"#;
    let q = recover(raw).expect("question");
    assert_eq!(q.correct_index, 3);
  }

  #[test]
  fn literal_answer_string_resolves_to_its_index() {
    let raw = r#"{"pregunta":"Q?","opciones":["Lima","Quito","Bogotá","Caracas"],"respuesta":"  quito "}"#;
    let q = recover(raw).expect("question");
    assert_eq!(q.correct_index, 1);
  }

  #[test]
  fn unbalanced_object_is_completed_by_brace_counting() {
    let raw = r#"{"pregunta":"Q?","opciones":["A","B","C","D"],"respuesta_correcta":1,"meta":{"x":"y"#;
    let q = recover(raw).expect("question");
    assert_eq!(q.correct_index, 1);
    assert_eq!(q.answers.len(), 4);
  }

  #[test]
  fn trailing_commas_and_single_quotes_are_repaired() {
    let raw = "{'pregunta':'Q?','opciones':['A','B','C','D'],'respuesta_correcta':0,}";
    let q = recover(raw).expect("question");
    assert_eq!(q.correct_index, 0);
    assert_eq!(q.answers, answers(["A", "B", "C", "D"]));
  }

  #[test]
  fn reasoning_sections_and_fences_are_stripped() {
    let raw = "<think>lots of musing { not json }</think>\n```json\n{\"pregunta\":\"Q?\",\"opciones\":[\"A\",\"B\",\"C\",\"D\"],\"respuesta_correcta\":1}\n```";
    let q = recover(raw).expect("question");
    assert_eq!(q.correct_index, 1);
  }

  #[test]
  fn smart_quotes_are_normalized() {
    let raw = "{\u{201C}pregunta\u{201D}:\u{201C}Q?\u{201D},\u{201C}opciones\u{201D}:[\u{201C}A\u{201D},\u{201C}B\u{201D},\u{201C}C\u{201D},\u{201C}D\u{201D}],\u{201C}respuesta_correcta\u{201D}:3}";
    let q = recover(raw).expect("question");
    assert_eq!(q.correct_index, 3);
  }

  #[test]
  fn answer_lists_longer_than_four_are_truncated() {
    let raw = r#"{"pregunta":"Q?","opciones":["A","B","C","D","E","F"],"respuesta_correcta":1}"#;
    let q = recover(raw).expect("question");
    assert_eq!(q.answers, answers(["A", "B", "C", "D"]));
  }

  #[test]
  fn three_answers_are_not_padded() {
    let raw = r#"{"pregunta":"Q?","opciones":["A","B","C"],"respuesta_correcta":1}"#;
    assert!(recover(raw).is_err());
  }

  #[test]
  fn prose_with_lettered_options_reconstructs() {
    let raw = "\
¿Cuál es la capital de Bolivia?
A) La Paz
B) Lima
C) Quito
D) Bogotá
La respuesta correcta es A) porque allí está la sede de gobierno.
Explicacion: La Paz es la sede de gobierno.";
    let q = recover(raw).expect("question");
    assert_eq!(q.text, "¿Cuál es la capital de Bolivia?");
    assert_eq!(q.answers.len(), 4);
    assert_eq!(q.correct_index, 0);
    assert!(q.explanation.contains("sede de gobierno"));
  }

  #[test]
  fn prose_with_bullets_and_literal_answer_reconstructs() {
    let raw = "\
Pregunta: ¿Qué planeta es el más grande?
- Marte
- Júpiter
- Saturno
- Venus
Respuesta: Júpiter";
    let q = recover(raw).expect("question");
    assert_eq!(q.answers[1], "Júpiter");
    assert_eq!(q.correct_index, 1);
  }

  #[test]
  fn prose_with_delimiter_split_reconstructs() {
    let raw = "\
¿Cuántos continentes hay?
cinco; seis; siete; cuatro
Respuesta correcta: 3)";
    let q = recover(raw).expect("question");
    assert_eq!(q.answers.len(), 4);
    assert_eq!(q.correct_index, 2);
  }

  #[test]
  fn hopeless_text_reports_an_error() {
    assert!(recover("nothing useful here at all").is_err());
    assert!(recover_json_only("still nothing").is_err());
  }

  #[test]
  fn json_only_chain_ignores_prose() {
    assert!(recover_json_only("¿Q?\nA) a\nB) b\nC) c\nD) d\nRespuesta: A").is_err());
  }
}
