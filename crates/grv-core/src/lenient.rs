//! Forgiving field decoders for externally produced JSON.
//!
//! Every decoder accepts any JSON value and maps what it cannot use to `None`,
//! so a malformed optional field never rejects the surrounding record.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::RawView;

pub fn text_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A single string counts as a one-element list; empty lists count as absent.
pub fn list_from_value(value: &Value) -> Option<Vec<String>> {
    let items = match value {
        Value::Array(items) => items.iter().filter_map(text_from_value).collect::<Vec<_>>(),
        other => text_from_value(other).into_iter().collect(),
    };
    (!items.is_empty()).then_some(items)
}

/// Decodes a persisted JSON list, tolerating plain text written by older rows.
pub fn list_from_text(text: &str) -> Option<Vec<String>> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => list_from_value(&value),
        Err(_) => text_from_value(&Value::String(text.to_string())).map(|s| vec![s]),
    }
}

pub fn severity_from_i64(raw: i64) -> Option<u8> {
    (1..=3).contains(&raw).then_some(raw as u8)
}

pub fn severity_from_value(value: &Value) -> Option<u8> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .and_then(severity_from_i64),
        Value::String(s) => s.trim().parse::<i64>().ok().and_then(severity_from_i64),
        _ => None,
    }
}

pub fn text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(text_from_value))
}

pub fn text_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(list_from_value))
}

pub fn severity<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(severity_from_value))
}

pub fn view<'de, D>(deserializer: D) -> Result<Option<RawView>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(obj @ Value::Object(_)) => serde_json::from_value(obj).ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn severity_rejects_out_of_range_and_garbage() {
        assert_eq!(severity_from_value(&json!(2)), Some(2));
        assert_eq!(severity_from_value(&json!("1")), Some(1));
        assert_eq!(severity_from_value(&json!(3.0)), Some(3));
        assert_eq!(severity_from_value(&json!(9)), None);
        assert_eq!(severity_from_value(&json!("high")), None);
        assert_eq!(severity_from_value(&json!(null)), None);
    }

    #[test]
    fn lists_accept_scalars_and_drop_blanks() {
        assert_eq!(list_from_value(&json!("Hostel")), Some(vec!["Hostel".to_string()]));
        assert_eq!(
            list_from_value(&json!(["A", "", 5, {"x": 1}])),
            Some(vec!["A".to_string(), "5".to_string()])
        );
        assert_eq!(list_from_value(&json!([])), None);
        assert_eq!(list_from_text(r#"["a","b"]"#).map(|v| v.len()), Some(2));
        assert_eq!(list_from_text("call the warden"), Some(vec!["call the warden".to_string()]));
    }

    #[test]
    fn malformed_view_degrades_to_none() {
        let view: RawView = serde_json::from_value(json!({
            "complaint": {"nested": true},
            "severity": "very",
            "departments": 42,
            "status": "Resolved"
        }))
        .unwrap();
        assert_eq!(view.complaint, None);
        assert_eq!(view.severity, None);
        assert_eq!(view.departments, Some(vec!["42".to_string()]));
        assert_eq!(view.status.as_deref(), Some("Resolved"));
    }
}
