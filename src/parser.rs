//! Structured-output extraction from free-form reasoning text.
//!
//! The engine is asked for a JSON block, but the surrounding prose is
//! unconstrained. Extraction never fails: an unparseable payload yields the
//! gate-closed defaults and the raw text stays on the run row.

use crate::models::{ParsedAnalysis, Recommendation};
use serde_json::Value;

/// First well-formed JSON object in `text`: a triple-backtick fenced block
/// wins, otherwise the first balanced `{...}` that parses.
pub fn extract_first_json(text: &str) -> Option<Value> {
    for block in fenced_blocks(text) {
        if let Some(v) = first_object_in(block) {
            return Some(v);
        }
    }
    first_object_in(text)
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        // Skip the info string ("json", "JSON", ...) up to the newline.
        let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_open[body_start..];
        match body.find("```") {
            Some(close) => {
                out.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }
    out
}

/// Balanced-brace scan, string- and escape-aware.
fn first_object_in(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(open_rel) = text[start..].find('{') {
        let open = start + open_rel;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate().skip(open) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[open..=i];
                        if let Ok(v) = serde_json::from_str::<Value>(candidate) {
                            if v.is_object() {
                                return Some(v);
                            }
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        start = open + 1;
    }
    None
}

fn get_f64(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64).filter(|x| x.is_finite())
}

fn get_string(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Map reasoning output to the structured record. All fields default rather
/// than error.
pub fn parse_analysis(text: &str) -> ParsedAnalysis {
    let Some(v) = extract_first_json(text) else {
        return ParsedAnalysis::default();
    };

    let recommendation = v
        .get("recommendation")
        .and_then(Value::as_str)
        .map(Recommendation::parse)
        .unwrap_or(Recommendation::Unknown);

    let confidence = v
        .get("confidence")
        .and_then(Value::as_f64)
        .map(|c| c.round() as i64)
        .unwrap_or(0)
        .clamp(0, 100);

    ParsedAnalysis {
        gate_passed: v.get("gate_passed").and_then(Value::as_bool).unwrap_or(false),
        recommendation,
        confidence,
        expected_value_pct: get_f64(&v, "expected_value_pct").unwrap_or(0.0),
        entry_price: get_f64(&v, "entry_price"),
        stop_price: get_f64(&v, "stop_price"),
        target_price: get_f64(&v, "target_price"),
        position_size_pct: get_f64(&v, "position_size_pct"),
        trade_structure: get_string(&v, "trade_structure"),
        expiry: get_string(&v, "expiry"),
        strikes: get_string(&v, "strikes"),
        rationale: get_string(&v, "rationale"),
        snapshot_price: get_f64(&v, "snapshot_price"),
        implied_vol: get_f64(&v, "implied_vol"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_block_wins() {
        let text = "Analysis below.\n```json\n{\"gate_passed\": true, \
                    \"recommendation\": \"BUY\", \"confidence\": 76, \
                    \"expected_value_pct\": 12.0}\n```\nTrailing prose {not json}.";
        let p = parse_analysis(text);
        assert!(p.gate_passed);
        assert_eq!(p.recommendation, Recommendation::Buy);
        assert_eq!(p.confidence, 76);
        assert_eq!(p.expected_value_pct, 12.0);
    }

    #[test]
    fn leading_bare_object() {
        let text = "{\"recommendation\": \"short\", \"confidence\": 55}\nnotes";
        let p = parse_analysis(text);
        assert_eq!(p.recommendation, Recommendation::Short);
        assert_eq!(p.confidence, 55);
        assert!(!p.gate_passed);
    }

    #[test]
    fn braces_inside_strings_do_not_break_the_scan() {
        let text = "prefix {\"rationale\": \"support at {100}\", \"confidence\": 40} suffix";
        let p = parse_analysis(text);
        assert_eq!(p.confidence, 40);
        assert_eq!(p.rationale.as_deref(), Some("support at {100}"));
    }

    #[test]
    fn malformed_candidates_are_skipped() {
        let text = "{broken json} then {\"confidence\": 33}";
        let p = parse_analysis(text);
        assert_eq!(p.confidence, 33);
    }

    #[test]
    fn garbage_yields_defaults() {
        let p = parse_analysis("no structure here at all");
        assert!(!p.gate_passed);
        assert_eq!(p.recommendation, Recommendation::Unknown);
        assert_eq!(p.confidence, 0);
        assert_eq!(p.expected_value_pct, 0.0);
        assert!(p.entry_price.is_none());
    }

    #[test]
    fn confidence_clamped_and_unknown_recommendation() {
        let p = parse_analysis("{\"recommendation\": \"MOON\", \"confidence\": 250}");
        assert_eq!(p.recommendation, Recommendation::Unknown);
        assert_eq!(p.confidence, 100);

        let p = parse_analysis("{\"confidence\": -5}");
        assert_eq!(p.confidence, 0);
    }

    #[test]
    fn numeric_trade_fields_optional() {
        let p = parse_analysis(
            "{\"entry_price\": 101.5, \"stop_price\": 95.0, \"target_price\": 120.0, \
             \"position_size_pct\": 2.5, \"implied_vol\": 0.4}",
        );
        assert_eq!(p.entry_price, Some(101.5));
        assert_eq!(p.stop_price, Some(95.0));
        assert_eq!(p.target_price, Some(120.0));
        assert_eq!(p.position_size_pct, Some(2.5));
        assert_eq!(p.implied_vol, Some(0.4));
        assert!(p.snapshot_price.is_none());
    }
}
