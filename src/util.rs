//! Shared utility functions

use serde_json::Value;

/// Resolve a dot-notation path (`"changes.0.metric"`) against a JSON value.
///
/// Object keys are matched literally; numeric segments index into arrays.
/// Returns `None` as soon as a segment does not resolve.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                current = items.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Resolve a path the way filters see an event payload: the payload root is
/// searched first, then the nested `data` object. Lets pipeline authors write
/// `cpu_percent` instead of `data.cpu_percent`.
pub fn resolve_event_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(found) = resolve_path(payload, path) {
        return Some(found);
    }
    payload
        .get("data")
        .and_then(|data| resolve_path(data, path))
}

/// Render a JSON value the way it should appear inside a template or a
/// stringly filter comparison: bare strings lose their quotes, everything
/// else uses its JSON form.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Coerce a JSON value to f64 for numeric filter operators and math
/// transforms. Strings are parsed; booleans and other shapes fail.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Truncate a string to at most `max_bytes` without splitting a UTF-8
/// character: the cut lands after the last whole character that still fits.
/// Used to bound captured shell output and clipboard previews.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let fitting = s
        .char_indices()
        .map(|(start, c)| start + c.len_utf8())
        .take_while(|&end| end <= max_bytes)
        .last()
        .unwrap_or(0);
    &s[..fitting]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_path_objects_and_arrays() {
        let v = json!({"a": {"b": [{"c": 7}]}});
        assert_eq!(resolve_path(&v, "a.b.0.c"), Some(&json!(7)));
        assert_eq!(resolve_path(&v, "a.b.1.c"), None);
        assert_eq!(resolve_path(&v, "a.x"), None);
    }

    #[test]
    fn test_resolve_event_path_falls_back_to_data() {
        let payload = json!({
            "source_type": "cpu",
            "data": {"cpu_percent": 95.0}
        });
        assert_eq!(
            resolve_event_path(&payload, "cpu_percent"),
            Some(&json!(95.0))
        );
        assert_eq!(
            resolve_event_path(&payload, "source_type"),
            Some(&json!("cpu"))
        );
    }

    #[test]
    fn test_stringify_strips_quotes_from_strings() {
        assert_eq!(stringify(&json!("hello")), "hello");
        assert_eq!(stringify(&json!(3.5)), "3.5");
        assert_eq!(stringify(&json!(null)), "");
    }

    #[test]
    fn test_as_f64_coercions() {
        assert_eq!(as_f64(&json!(2)), Some(2.0));
        assert_eq!(as_f64(&json!("2.5")), Some(2.5));
        assert_eq!(as_f64(&json!(true)), None);
    }

    #[test]
    fn test_truncate_at_utf8_boundary() {
        let s = "日本語";
        assert_eq!(truncate_utf8_safe(s, 4), "日");
        assert_eq!(truncate_utf8_safe(s, 9), "日本語");
        assert_eq!(truncate_utf8_safe("hello", 0), "");
    }
}
