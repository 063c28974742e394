//! `{key}` template substitution shared by actions and transformers
//!
//! One resolution order everywhere: a literal top-level key wins, then a
//! dotted path into the mapping, then the auto-injected `_timestamp`,
//! `_date`, `_time` helpers. Anything still unresolved becomes the empty
//! string so a half-filled template never leaks placeholder syntax into a
//! shell command or notification.

use chrono::Local;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::util::{resolve_path, stringify};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^{}]+)\}").expect("placeholder regex"))
}

/// Substitute every `{key}` in `template` with values from `mapping`.
pub fn substitute(template: &str, mapping: &Value) -> String {
    let now = Local::now();
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            if let Some(v) = mapping.get(key) {
                return stringify(v);
            }
            if let Some(v) = resolve_path(mapping, key) {
                return stringify(v);
            }
            match key {
                "_timestamp" => now.format("%Y%m%d_%H%M%S").to_string(),
                "_date" => now.format("%Y-%m-%d").to_string(),
                "_time" => now.format("%H%M%S").to_string(),
                _ => String::new(),
            }
        })
        .into_owned()
}
