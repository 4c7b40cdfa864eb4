//! Gmail-like query parser (C9, §4.9).
//!
//! Generalizes the teacher's `search/query_parser.rs` character-by-
//! character scanner (which only recognized `from/to/subject/in/is/
//! has/before/after`) to the full operator set named in the spec and
//! emits a [`crate::storage::MessageFilter`] directly instead of a
//! search-crate-specific `ParsedQuery`.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use crate::storage::MessageFilter;

const VALID_OPERATORS: &[&str] = &[
    "from", "to", "cc", "bcc", "subject", "label", "has", "before", "after", "older_than", "newer_than", "larger",
    "smaller",
];

/// Parse a query string into a [`MessageFilter`]. Unknown `key:value`
/// pairs and anything that doesn't match an operator fall through to
/// free-text terms.
pub fn parse_query(input: &str) -> MessageFilter {
    parse_query_at(input, Utc::now())
}

/// Testable variant: `now` anchors `older_than`/`newer_than` so tests
/// don't depend on wall-clock time.
pub fn parse_query_at(input: &str, now: DateTime<Utc>) -> MessageFilter {
    let mut filter = MessageFilter::default();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let rest: String = chars[i..].iter().collect();
        if let Some((key, value, consumed)) = parse_operator(&rest) {
            apply_operator(&mut filter, &key, &value, now);
            i += consumed;
        } else {
            let (word, consumed) = parse_word(&rest);
            if !word.is_empty() {
                filter.free_text.push(word);
            }
            i += consumed;
        }
    }

    filter
}

fn apply_operator(filter: &mut MessageFilter, key: &str, value: &str, now: DateTime<Utc>) {
    match key {
        "from" => filter.from.push(value.to_string()),
        "to" => filter.to.push(value.to_string()),
        "cc" => filter.cc.push(value.to_string()),
        "bcc" => filter.bcc.push(value.to_string()),
        "subject" => filter.subject.push(value.to_string()),
        "label" => filter.label.push(value.to_string()),
        "has" => {
            if value.eq_ignore_ascii_case("attachment") {
                filter.has_attachment = Some(true);
            }
        }
        "before" => {
            if let Some(date) = parse_date(value) {
                filter.before = Some(date);
            }
        }
        "after" => {
            if let Some(date) = parse_date(value) {
                filter.after = Some(date);
            }
        }
        "older_than" => {
            if let Some(d) = parse_relative_duration(value) {
                filter.before = Some(now - d);
            }
        }
        "newer_than" => {
            if let Some(d) = parse_relative_duration(value) {
                filter.after = Some(now - d);
            }
        }
        "larger" => {
            if let Some(n) = parse_size(value) {
                filter.larger = Some(n);
            }
        }
        "smaller" => {
            if let Some(n) = parse_size(value) {
                filter.smaller = Some(n);
            }
        }
        _ => {}
    }
}

fn parse_operator(input: &str) -> Option<(String, String, usize)> {
    let colon_pos = input.find(':')?;
    let key = &input[..colon_pos];
    let key_lower = key.to_lowercase();
    if !VALID_OPERATORS.contains(&key_lower.as_str()) {
        return None;
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return None;
    }

    let after_colon = &input[colon_pos + 1..];
    let (value, value_len) = parse_value(after_colon);
    if value.is_empty() {
        return None;
    }

    Some((key_lower, value, colon_pos + 1 + value_len))
}

fn parse_value(input: &str) -> (String, usize) {
    let chars: Vec<char> = input.chars().collect();
    if chars.is_empty() {
        return (String::new(), 0);
    }
    if chars[0] == '"' {
        let mut value = String::new();
        let mut i = 1;
        while i < chars.len() && chars[i] != '"' {
            value.push(chars[i]);
            i += 1;
        }
        let consumed = if i < chars.len() { i + 1 } else { i };
        return (value, consumed);
    }
    let mut value = String::new();
    let mut i = 0;
    while i < chars.len() && !chars[i].is_whitespace() {
        value.push(chars[i]);
        i += 1;
    }
    (value, i)
}

fn parse_word(input: &str) -> (String, usize) {
    let chars: Vec<char> = input.chars().collect();
    if chars.is_empty() {
        return (String::new(), 0);
    }
    if chars[0] == '"' {
        let mut word = String::new();
        let mut i = 1;
        while i < chars.len() && chars[i] != '"' {
            word.push(chars[i]);
            i += 1;
        }
        let consumed = if i < chars.len() { i + 1 } else { i };
        return (word, consumed);
    }
    let mut word = String::new();
    let mut i = 0;
    while i < chars.len() && !chars[i].is_whitespace() {
        word.push(chars[i]);
        i += 1;
    }
    (word, i)
}

fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y/%m/%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
    }
    None
}

/// `older_than:1y`, `newer_than:3m`, `older_than:10d` — a count plus a
/// unit in `{d, m, y}`, matching Gmail's own syntax for these operators.
fn parse_relative_duration(input: &str) -> Option<Duration> {
    let unit = input.chars().last()?;
    let count: i64 = input[..input.len() - unit.len_utf8()].parse().ok()?;
    match unit {
        'd' => Some(Duration::days(count)),
        'm' => Some(Duration::days(count * 30)),
        'y' => Some(Duration::days(count * 365)),
        _ => None,
    }
}

/// `larger:5M`, `smaller:200K` — a count plus an optional `K`/`M`/`G`
/// suffix; a bare number is bytes.
fn parse_size(input: &str) -> Option<i64> {
    let last = input.chars().last()?;
    let (digits, multiplier) = match last.to_ascii_uppercase() {
        'K' => (&input[..input.len() - 1], 1024),
        'M' => (&input[..input.len() - 1], 1024 * 1024),
        'G' => (&input[..input.len() - 1], 1024 * 1024 * 1024),
        _ => (input, 1),
    };
    digits.parse::<i64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_terms() {
        let f = parse_query("hello world");
        assert_eq!(f.free_text, vec!["hello", "world"]);
        assert!(f.from.is_empty());
    }

    #[test]
    fn parses_from_and_subject() {
        let f = parse_query("from:alice@example.com subject:meeting");
        assert_eq!(f.from, vec!["alice@example.com"]);
        assert_eq!(f.subject, vec!["meeting"]);
    }

    #[test]
    fn parses_quoted_operator_value() {
        let f = parse_query("from:\"Alice Smith\"");
        assert_eq!(f.from, vec!["Alice Smith"]);
    }

    #[test]
    fn parses_has_attachment() {
        let f = parse_query("has:attachment");
        assert_eq!(f.has_attachment, Some(true));
    }

    #[test]
    fn parses_label() {
        let f = parse_query("label:receipts");
        assert_eq!(f.label, vec!["receipts"]);
    }

    #[test]
    fn parses_absolute_dates() {
        let f = parse_query("after:2024-01-01 before:2024/12/31");
        assert!(f.after.is_some());
        assert!(f.before.is_some());
    }

    #[test]
    fn parses_older_than_relative_to_now() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let f = parse_query_at("older_than:1y", now);
        let before = f.before.unwrap();
        assert_eq!(before.format("%Y").to_string(), "2023");
    }

    #[test]
    fn parses_size_suffixes() {
        let f = parse_query("larger:5M smaller:200K");
        assert_eq!(f.larger, Some(5 * 1024 * 1024));
        assert_eq!(f.smaller, Some(200 * 1024));
    }

    #[test]
    fn unknown_operator_falls_through_to_free_text() {
        let f = parse_query("foo:bar");
        assert_eq!(f.free_text, vec!["foo:bar"]);
    }

    #[test]
    fn mixed_query() {
        let f = parse_query("from:alice important meeting has:attachment");
        assert_eq!(f.from, vec!["alice"]);
        assert_eq!(f.free_text, vec!["important", "meeting"]);
        assert_eq!(f.has_attachment, Some(true));
    }
}
