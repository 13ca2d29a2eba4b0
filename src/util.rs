//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// This is intentionally simple (no nested/conditional logic).
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Normalize an answer for equality checks: lowercase, all whitespace removed.
/// Two options that collide under this mapping count as duplicates.
pub fn squash(s: &str) -> String {
  s.chars()
    .filter(|c| !c.is_whitespace())
    .flat_map(|c| c.to_lowercase())
    .collect()
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    s.to_string()
  } else {
    let mut end = max;
    while !s.is_char_boundary(end) {
      end -= 1;
    }
    format!("{}… ({} bytes total)", &s[..end], s.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fill_template_replaces_all_occurrences() {
    let out = fill_template("{a} and {b} and {a}", &[("a", "x"), ("b", "y")]);
    assert_eq!(out, "x and y and x");
  }

  #[test]
  fn squash_ignores_case_and_spacing() {
    assert_eq!(squash("  La  Paz "), squash("la paz"));
    assert_ne!(squash("La Paz"), squash("El Alto"));
  }

  #[test]
  fn trunc_respects_char_boundaries() {
    let s = "ñandú ñandú ñandú";
    let t = trunc_for_log(s, 4);
    assert!(t.contains("bytes total"));
  }
}
