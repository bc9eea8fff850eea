//! Answer extraction from free-form model output.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

const NUMBER: &str = r"-?\d[\d,]*(?:\.\d+)?";

static GSM8K_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"####\s*\$?\s*({NUMBER})")).expect("valid regex")
});

static LABELLED_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:final answer|answer|result)\b\s*(?:is\b|:|=)?\s*\$?\s*({NUMBER})"
    ))
    .expect("valid regex")
});

static BARE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("({NUMBER})")).expect("valid regex"));

static BOXED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\\boxed\{\s*\(?([A-J])\)?\s*\}").expect("valid regex")
});

static LABELLED_CHOICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:answer|option|choice)\s*:\s*\(?([A-J])\b").expect("valid regex")
});

static ANSWER_IS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bthe\s+(?:correct\s+)?answer\s+is\s*:?\s*\(?([A-J])\b").expect("valid regex")
});

static IS_CORRECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\(([A-J])\)|\b([A-J])\b)\s+is\s+(?:the\s+)?correct").expect("valid regex")
});

static CHOSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:choose|chose|pick|picked|select|selected)\s+(?:option\s+)?\(?([A-J])\b")
        .expect("valid regex")
});

static WHOLE_LETTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\(?([A-J])\)?\.?$").expect("valid regex"));

/// Extract the numeric answer from a response.
///
/// Preference order: a `#### N` marker, the last number labelled as an
/// answer/result, the last bare number. Numbers immediately followed by `%`
/// are never selected. Thousands separators are stripped.
pub fn extract_numeric_answer(text: &str) -> Option<String> {
    if let Some(caps) = GSM8K_MARKER.captures(text) {
        return caps.get(1).map(|m| strip_commas(m.as_str()));
    }

    last_non_percent(&LABELLED_NUMBER, text)
        .or_else(|| last_non_percent(&BARE_NUMBER, text))
        .map(|n| strip_commas(&n))
}

fn last_non_percent(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter(|m| !text[m.end()..].starts_with('%'))
        .last()
        .map(|m| m.as_str().to_string())
}

fn strip_commas(number: &str) -> String {
    number.replace(',', "")
}

/// Extract a multiple-choice letter (`A`..`J`), upper-cased.
pub fn extract_choice_letter(text: &str) -> Option<String> {
    let first = |re: &Regex| re.captures(text).and_then(|c| letter(&c));

    first(&BOXED)
        .or_else(|| first(&LABELLED_CHOICE))
        .or_else(|| first(&ANSWER_IS))
        .or_else(|| first(&IS_CORRECT))
        .or_else(|| CHOSE.captures_iter(text).filter_map(|c| letter(&c)).last())
        .or_else(|| {
            WHOLE_LETTER
                .captures(text.trim())
                .and_then(|c| letter(&c))
        })
}

fn letter(caps: &Captures<'_>) -> Option<String> {
    caps.iter()
        .skip(1)
        .flatten()
        .next()
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// Canonical form used when comparing predictions across models.
pub fn normalize_answer(answer: &str) -> String {
    let collapsed = answer.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches('.')
        .to_lowercase()
}

/// Numeric equality when both sides parse as numbers, string equality
/// otherwise.
pub fn numbers_match(a: &str, b: &str) -> bool {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => (x - y).abs() < 1e-6,
        _ => a.trim() == b.trim(),
    }
}
