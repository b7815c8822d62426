//! Layered, best-effort parsing of classifier responses.
//!
//! Text-generation oracles rarely return exactly the JSON they were asked
//! for. [`parse_response`] tries an ordered list of pure strategies and
//! stops at the first that yields a JSON array of items:
//!
//! 1. [`fenced`]: strip an outer markdown code fence, parse the body.
//! 2. [`bracket_slice`]: parse the first `[` through the last `]`.
//! 3. [`raw`]: parse the whole response as-is.
//! 4. [`fragments`]: scan for flat `{"passage_id": ...}` objects and
//!    parse each on its own, keeping whichever succeed.
//!
//! Parsed values are then coerced into the strict [`RelationItem`] schema
//! by [`coerce_items`]; items that fail coercion are dropped with a
//! diagnostic instead of failing the batch.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{RelationError, Result};
use crate::models::RelationType;

/// A parser strategy: `Some(items)` on success, `None` to fall through.
pub type Strategy = fn(&str) -> Option<Vec<Value>>;

/// Strategies in the order they are attempted.
pub const STRATEGIES: [(&str, Strategy); 4] = [
    ("fenced", fenced),
    ("bracket_slice", bracket_slice),
    ("raw", raw),
    ("fragments", fragments),
];

/// One validated classifier item.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationItem {
    /// The related (candidate / target) passage.
    pub passage_id: String,
    /// The focus passage, present only in full-context responses.
    pub source_id: Option<String>,
    pub relation: RelationType,
    pub evidence: String,
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
    })
}

fn fragment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{[^{}]*"passage_id"\s*:[^{}]*\}"#).expect("fragment pattern is valid")
    })
}

/// Normalize a parsed JSON document into a list of item values.
///
/// Accepts a bare array, an object wrapping an array under `relations`,
/// or a single item object.
fn into_items(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove("relations") {
            Some(Value::Array(items)) => Some(items),
            Some(_) => None,
            None if map.contains_key("passage_id") => Some(vec![Value::Object(map)]),
            None => None,
        },
        _ => None,
    }
}

fn parse_json(text: &str) -> Option<Vec<Value>> {
    serde_json::from_str::<Value>(text.trim())
        .ok()
        .and_then(into_items)
}

/// Strategy 1: the body of the first markdown code fence.
pub fn fenced(response: &str) -> Option<Vec<Value>> {
    let caps = fence_re().captures(response)?;
    parse_json(caps.get(1)?.as_str())
}

/// Strategy 2: the slice from the first `[` to the last `]`.
pub fn bracket_slice(response: &str) -> Option<Vec<Value>> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    if end <= start {
        return None;
    }
    parse_json(&response[start..=end])
}

/// Strategy 3: the whole response.
pub fn raw(response: &str) -> Option<Vec<Value>> {
    parse_json(response)
}

/// Strategy 4: independent `{"passage_id": ...}` fragments.
///
/// Partial success is success: fragments that fail to parse are skipped.
pub fn fragments(response: &str) -> Option<Vec<Value>> {
    let items: Vec<Value> = fragment_re()
        .find_iter(response)
        .filter_map(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .filter(Value::is_object)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Run the strategy chain and return the items plus the winning
/// strategy's name.
///
/// # Errors
///
/// [`RelationError::ParseFailure`] when every strategy falls through.
pub fn parse_response(response: &str) -> Result<(Vec<Value>, &'static str)> {
    STRATEGIES
        .iter()
        .find_map(|(name, strategy)| strategy(response).map(|items| (items, *name)))
        .ok_or(RelationError::ParseFailure)
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Coerce one parsed value into a [`RelationItem`].
pub fn coerce_item(value: &Value) -> std::result::Result<RelationItem, String> {
    let obj = value.as_object().ok_or("item is not an object")?;
    let passage_id = string_field(obj, "passage_id").ok_or("missing passage_id")?;
    let relation_raw = obj
        .get("relation")
        .and_then(Value::as_str)
        .ok_or("missing relation")?;
    let relation = relation_raw.parse::<RelationType>()?;
    let evidence = obj
        .get("evidence")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let source_id = string_field(obj, "source_id");

    Ok(RelationItem {
        passage_id,
        source_id,
        relation,
        evidence,
    })
}

/// Coerce every parsed value, dropping the malformed ones.
pub fn coerce_items(values: &[Value]) -> Vec<RelationItem> {
    values
        .iter()
        .enumerate()
        .filter_map(|(pos, value)| match coerce_item(value) {
            Ok(item) => Some(item),
            Err(reason) => {
                debug!(position = pos, %reason, "dropping malformed classifier item");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"[
        {"passage_id": "p1", "relation": "supports", "evidence": "Both cite Rayleigh."},
        {"passage_id": "p2", "relation": "Contradicts", "evidence": "Opposite claim."}
    ]"#;

    fn items(response: &str) -> Vec<RelationItem> {
        let (values, _) = parse_response(response).unwrap();
        coerce_items(&values)
    }

    #[test]
    fn test_fenced_strategy() {
        let response = format!("```json\n{PAYLOAD}\n```");
        let values = fenced(&response).unwrap();
        assert_eq!(values.len(), 2);
        assert!(fenced(PAYLOAD).is_none());
    }

    #[test]
    fn test_fenced_without_language_tag() {
        let response = format!("Here you go:\n```\n{PAYLOAD}\n```\nDone.");
        assert_eq!(fenced(&response).unwrap().len(), 2);
    }

    #[test]
    fn test_bracket_slice_strategy() {
        let response = format!("Sure! The relations are: {PAYLOAD} Hope this helps.");
        assert!(raw(&response).is_none());
        assert_eq!(bracket_slice(&response).unwrap().len(), 2);
        assert!(bracket_slice("no brackets").is_none());
        assert!(bracket_slice("] backwards [").is_none());
    }

    #[test]
    fn test_raw_strategy_single_object() {
        let response = r#"{"passage_id": "p9", "relation": "extends", "evidence": "x"}"#;
        assert!(bracket_slice(response).is_none());
        let values = raw(response).unwrap();
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_raw_strategy_wrapped_object() {
        let response = format!(r#"{{"relations": {PAYLOAD}}}"#);
        assert_eq!(raw(&response).unwrap().len(), 2);
    }

    #[test]
    fn test_fragments_partial_success() {
        let response = r#"Item one: {"passage_id": "p1", "relation": "supports", "evidence": "ok"}
            Item two: {"passage_id": "p2", "relation": "extends", "evidence": broken}
            Item three: {"passage_id": 7, "relation": "analogous", "evidence": "num id"}"#;
        let values = fragments(response).unwrap();
        assert_eq!(values.len(), 2);
        let got = coerce_items(&values);
        assert_eq!(got[0].passage_id, "p1");
        assert_eq!(got[1].passage_id, "7");
    }

    #[test]
    fn test_not_json_fails_every_strategy() {
        for (_, strategy) in STRATEGIES {
            assert!(strategy("not json at all").is_none());
        }
        assert!(matches!(
            parse_response("not json at all"),
            Err(RelationError::ParseFailure)
        ));
    }

    #[test]
    fn test_fenced_and_raw_agree() {
        let fenced_items = items(&format!("```json\n{PAYLOAD}\n```"));
        let raw_items = items(PAYLOAD);
        assert_eq!(fenced_items, raw_items);
        assert_eq!(
            parse_response(&format!("```json\n{PAYLOAD}\n```")).unwrap().1,
            "fenced"
        );
    }

    #[test]
    fn test_strategy_order() {
        assert_eq!(parse_response(PAYLOAD).unwrap().1, "bracket_slice");
        let single = r#"{"passage_id": "p1", "relation": "supports"}"#;
        assert_eq!(parse_response(single).unwrap().1, "raw");
    }

    #[test]
    fn test_empty_array_is_success() {
        let (values, _) = parse_response("[]").unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_coerce_drops_malformed() {
        let values: Vec<Value> = serde_json::from_str(
            r#"[
                {"passage_id": "p1", "relation": "supports", "evidence": "fine"},
                {"passage_id": "p2", "relation": "refutes", "evidence": "bad enum"},
                {"relation": "supports", "evidence": "no id"},
                {"passage_id": "", "relation": "supports"},
                "just a string",
                {"passage_id": "p3", "relation": "ANALOGOUS"}
            ]"#,
        )
        .unwrap();
        let got = coerce_items(&values);
        let ids: Vec<&str> = got.iter().map(|i| i.passage_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
        assert_eq!(got[1].relation, RelationType::Analogous);
        assert_eq!(got[1].evidence, "");
    }

    #[test]
    fn test_coerce_source_id() {
        let value: Value = serde_json::from_str(
            r#"{"source_id": "a1", "passage_id": "b1", "relation": "extends", "evidence": "e"}"#,
        )
        .unwrap();
        let item = coerce_item(&value).unwrap();
        assert_eq!(item.source_id.as_deref(), Some("a1"));
    }
}
