//! Deterministic prompt rendering.
//!
//! The generation prompt is a pure function of
//! (category, difficulty, topic, avoid_topics, language): identical inputs
//! always render byte-identical text. That text doubles as the coalescing
//! key, so nothing random may leak into it — when the caller supplies no
//! topic, one is picked from the per-category tables *before* rendering.

use rand::seq::SliceRandom;

use crate::util::fill_template;

const GENERATION_TEMPLATE: &str = "\
You write multiple-choice trivia questions. Respond with ONE JSON object and \
nothing else: no prose, no code fences, no reasoning, no markdown.

Category: {category}
Topic: {topic}
Difficulty: {difficulty} ({difficulty_description})
Question language: {language}
{avoid_clause}
Required JSON shape (keys exactly as written):
{\"pregunta\": \"the question text\", \"opciones\": [\"option 1\", \"option 2\", \"option 3\", \"option 4\"], \"respuesta_correcta\": 0, \"explicacion\": \"why the correct option is right\"}

Rules:
- exactly 4 options, all different and all plausible
- respuesta_correcta is the 0-based index (0, 1, 2 or 3) of the single correct option
- explicacion is one or two short sentences
- the output must start with '{' and end with '}'";

const VERIFICATION_TEMPLATE: &str = "\
Answer this trivia question factually, in {language}, in as few words as possible.
Respond with ONE JSON object and nothing else:
{\"respuesta\": \"your answer\", \"confianza\": \"alta\" | \"media\" | \"baja\", \"razon\": \"one short sentence\"}

Question: {question}";

const REFORMAT_TEMPLATE: &str = "\
The following text describes one multiple-choice question. Convert it to ONE \
strict JSON object with keys: pregunta (string), opciones (array of exactly 4 \
strings), respuesta_correcta (0-based integer), explicacion (string). Output \
only the JSON object.

Text:
{raw}";

/// Fallback topics per category. Keys are matched loosely so both the
/// English and Spanish category names used around the game resolve.
fn topic_table(category: &str) -> &'static [&'static str] {
  let c = category.trim().to_lowercase();
  if c.contains("histor") {
    &[
      "ancient civilizations",
      "world wars",
      "famous revolutions",
      "medieval Europe",
      "explorers and discoveries",
      "20th century politics",
    ]
  } else if c.contains("geo") {
    &[
      "capitals of the world",
      "rivers and mountains",
      "countries and borders",
      "oceans and islands",
      "deserts and climates",
    ]
  } else if c.contains("cien") || c.contains("scien") {
    &[
      "the solar system",
      "human biology",
      "chemical elements",
      "famous scientists",
      "physics in everyday life",
      "animals and ecosystems",
    ]
  } else if c.contains("deport") || c.contains("sport") {
    &[
      "football world cups",
      "the Olympic Games",
      "tennis grand slams",
      "basketball",
      "motor racing",
    ]
  } else if c.contains("arte") || c.contains("art") || c.contains("liter") {
    &[
      "famous painters",
      "classic novels",
      "music history",
      "architecture",
      "Nobel laureates in literature",
    ]
  } else if c.contains("entreten") || c.contains("entertain") || c.contains("cine") {
    &[
      "classic movies",
      "television series",
      "pop music",
      "video games",
      "actors and directors",
    ]
  } else {
    &[
      "general knowledge",
      "inventions",
      "food and drink",
      "traditions around the world",
    ]
  }
}

/// Pick a random topic for the category. Called once per request when the
/// caller did not supply a topic, before the prompt is rendered.
pub fn pick_topic(category: &str) -> String {
  let table = topic_table(category);
  let mut rng = rand::thread_rng();
  table
    .choose(&mut rng)
    .copied()
    .unwrap_or("general knowledge")
    .to_string()
}

fn difficulty_description(difficulty: &str) -> &'static str {
  match difficulty.trim().to_lowercase().as_str() {
    "easy" | "facil" | "fácil" => "well-known facts a casual player can answer",
    "hard" | "dificil" | "difícil" => "obscure details only an enthusiast would know",
    _ => "requires some familiarity with the subject, but no specialist knowledge",
  }
}

/// Render the generation prompt. Pure: same inputs, same text.
pub fn build_generation_prompt(
  category: &str,
  difficulty: &str,
  topic: &str,
  avoid_topics: &[String],
  language: &str,
) -> String {
  let avoid_clause = if avoid_topics.is_empty() {
    String::new()
  } else {
    format!("Avoid these topics entirely: {}.\n", avoid_topics.join(", "))
  };
  fill_template(
    GENERATION_TEMPLATE,
    &[
      ("category", category),
      ("difficulty", difficulty),
      ("difficulty_description", difficulty_description(difficulty)),
      ("topic", topic),
      ("language", language),
      ("avoid_clause", &avoid_clause),
    ],
  )
}

/// Render the blind-verification prompt. The candidate options are withheld
/// on purpose so the model cannot anchor on them.
pub fn build_verification_prompt(question_text: &str, language: &str) -> String {
  fill_template(
    VERIFICATION_TEMPLATE,
    &[("question", question_text), ("language", language)],
  )
}

/// Render the reformat-to-strict-JSON follow-up. Oversized raw output is
/// truncated so the follow-up stays cheap.
pub fn build_reformat_prompt(raw: &str) -> String {
  const MAX_RAW: usize = 2_000;
  let trimmed = raw.trim();
  let mut end = trimmed.len().min(MAX_RAW);
  while !trimmed.is_char_boundary(end) {
    end -= 1;
  }
  fill_template(REFORMAT_TEMPLATE, &[("raw", &trimmed[..end])])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generation_prompt_is_deterministic() {
    let avoid = vec!["rivers".to_string()];
    let a = build_generation_prompt("geography", "easy", "capitals of the world", &avoid, "es");
    let b = build_generation_prompt("geography", "easy", "capitals of the world", &avoid, "es");
    assert_eq!(a, b);
  }

  #[test]
  fn avoid_clause_only_when_non_empty() {
    let with = build_generation_prompt("history", "hard", "world wars", &["tanks".into()], "en");
    let without = build_generation_prompt("history", "hard", "world wars", &[], "en");
    assert!(with.contains("Avoid these topics entirely: tanks."));
    assert!(!without.contains("Avoid these topics"));
  }

  #[test]
  fn prompt_pins_the_output_schema() {
    let p = build_generation_prompt("science", "medium", "the solar system", &[], "es");
    assert!(p.contains("respuesta_correcta"));
    assert!(p.contains("exactly 4 options"));
    assert!(p.contains("no code fences"));
  }

  #[test]
  fn picked_topics_come_from_the_category_table() {
    for _ in 0..20 {
      let t = pick_topic("Historia");
      assert!(topic_table("historia").contains(&t.as_str()));
    }
  }

  #[test]
  fn verification_prompt_never_leaks_options() {
    let p = build_verification_prompt("¿En qué año terminó la Segunda Guerra Mundial?", "es");
    assert!(p.contains("Segunda Guerra Mundial"));
    assert!(!p.contains("opciones"));
  }
}
