//! Raw payload field access
//!
//! Sources disagree on field names and shapes. Every canonical column is
//! looked up through an alias list; values may be plain scalars, `{en, fr}`
//! localized objects, or API paths such as `/bills/44-1/C-10/`.

use serde_json::{Map, Value};

/// First non-null value among `aliases`
pub fn lookup<'a>(body: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|alias| body.get(*alias))
        .find(|v| !v.is_null())
}

/// Scalar text form of a value
///
/// Localized objects prefer English. Blank strings are treated as absent.
pub fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(map) => {
            return ["en", "fr"]
                .iter()
                .filter_map(|lang| map.get(*lang))
                .find_map(value_text)
        }
        _ => return None,
    };

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Text of the first alias that has a non-blank value
pub fn text_field(body: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .filter_map(|alias| body.get(*alias))
        .find_map(value_text)
}

/// Integer form of a value; `Err` carries the offending text
pub fn value_integer(value: &Value) -> Result<Option<i64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Some(i))
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Some(f as i64)),
                    _ => Err(n.to_string()),
                }
            }
        }
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s.trim().parse::<i64>().map(Some).map_err(|_| s.clone()),
        other => Err(other.to_string()),
    }
}

/// Last path segment of an API reference (`/committees/fina/` → `fina`)
///
/// Values without a `/` are returned as-is.
pub fn path_tail(raw: &str) -> &str {
    if !raw.contains('/') {
        return raw;
    }
    raw.trim_end_matches('/').rsplit('/').next().unwrap_or(raw)
}

/// Split a combined session label (`"44-1"`, `"44th-1st"`) into parts
pub fn split_session_label(raw: &str) -> Option<(u32, u32)> {
    let (parliament, session) = raw.trim().split_once('-')?;
    let digits = |s: &str| -> Option<u32> {
        let d: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
        d.parse().ok()
    };
    Some((digits(parliament)?, digits(session)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn localized_text_prefers_english() {
        assert_eq!(value_text(&json!({"en": "Finance", "fr": "Finances"})).as_deref(), Some("Finance"));
        assert_eq!(value_text(&json!({"en": "", "fr": "Finances"})).as_deref(), Some("Finances"));
        assert_eq!(value_text(&json!("   ")), None);
        assert_eq!(value_text(&json!(12)).as_deref(), Some("12"));
    }

    #[test]
    fn aliases_are_tried_in_order() {
        let body = object(json!({"bill_number": "", "number": "C-10", "date": null}));
        assert_eq!(text_field(&body, &["bill_number", "number"]).as_deref(), Some("C-10"));
        assert!(lookup(&body, &["date"]).is_none());
    }

    #[test]
    fn integers_from_numbers_and_strings() {
        assert_eq!(value_integer(&json!(171)), Ok(Some(171)));
        assert_eq!(value_integer(&json!(" 42 ")), Ok(Some(42)));
        assert_eq!(value_integer(&json!(3.0)), Ok(Some(3)));
        assert_eq!(value_integer(&json!("")), Ok(None));
        assert!(value_integer(&json!("many")).is_err());
        assert!(value_integer(&json!(2.5)).is_err());
    }

    #[test]
    fn api_paths_reduce_to_their_tail() {
        assert_eq!(path_tail("/committees/fina/"), "fina");
        assert_eq!(path_tail("/bills/44-1/C-10/"), "C-10");
        assert_eq!(path_tail("C-10"), "C-10");
    }

    #[test]
    fn session_labels_split() {
        assert_eq!(split_session_label("44-1"), Some((44, 1)));
        assert_eq!(split_session_label("44th-1st"), Some((44, 1)));
        assert_eq!(split_session_label("44"), None);
    }
}
