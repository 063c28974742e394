// Pipeline transformers - produce a new payload for the current branch
//
// A transformer never mutates its input: it returns a fresh payload and
// the executor swaps it in for this branch only, so siblings after a
// fan-out keep their own copies. The registry is closed; unknown types
// fail construction and reject the pipeline at load.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::OnceLock;

use crate::template;
use crate::util::{as_f64, resolve_path};

/// A materialized transformer
pub enum Transformer {
    Passthrough,
    ExtractField(ExtractFieldTransformer),
    FormatString(FormatStringTransformer),
    Math(MathTransformer),
    JsonPath(JsonPathTransformer),
}

impl Transformer {
    pub fn from_config(config: &Value) -> Result<Self> {
        let transformer_type = config
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("passthrough");
        let params = config.get("params").cloned().unwrap_or_else(|| json!({}));

        match transformer_type {
            "passthrough" => Ok(Transformer::Passthrough),
            "extract_field" => Ok(Transformer::ExtractField(
                ExtractFieldTransformer::from_params(&params)?,
            )),
            "format_string" => Ok(Transformer::FormatString(
                FormatStringTransformer::from_params(&params)?,
            )),
            "math" => Ok(Transformer::Math(MathTransformer::from_params(&params)?)),
            "json_path" => Ok(Transformer::JsonPath(JsonPathTransformer::from_params(
                &params,
            )?)),
            other => bail!("unknown transformer type: {other}"),
        }
    }

    /// Produce the next payload for this branch. On Err the executor keeps
    /// the old payload (fail-open).
    pub fn transform(&self, payload: &Value) -> Result<Value> {
        match self {
            Transformer::Passthrough => Ok(payload.clone()),
            Transformer::ExtractField(t) => t.transform(payload),
            Transformer::FormatString(t) => Ok(t.transform(payload)),
            Transformer::Math(t) => t.transform(payload),
            Transformer::JsonPath(t) => Ok(t.transform(payload)),
        }
    }
}

fn insert_at(payload: &Value, key: &str, value: Value) -> Value {
    let mut result = payload.clone();
    if let Value::Object(map) = &mut result {
        map.insert(key.to_string(), value);
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// extract_field
// ─────────────────────────────────────────────────────────────────────────────

pub struct ExtractFieldTransformer {
    fields: Vec<String>,
    output_key: String,
    flatten: bool,
}

impl ExtractFieldTransformer {
    fn from_params(params: &Value) -> Result<Self> {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            fields: Vec<String>,
            #[serde(default = "default_output_key")]
            output_key: String,
            #[serde(default)]
            flatten: bool,
        }
        fn default_output_key() -> String {
            "extracted".to_string()
        }

        let params: Params = serde_json::from_value(params.clone())
            .context("invalid extract_field transformer params")?;
        Ok(Self {
            fields: params.fields,
            output_key: params.output_key,
            flatten: params.flatten,
        })
    }

    fn transform(&self, payload: &Value) -> Result<Value> {
        let mut extracted = serde_json::Map::new();
        for field_path in &self.fields {
            let value = resolve_path(payload, field_path)
                .cloned()
                .unwrap_or(Value::Null);
            let key = if self.flatten {
                field_path
                    .rsplit('.')
                    .next()
                    .unwrap_or(field_path)
                    .to_string()
            } else {
                field_path.clone()
            };
            extracted.insert(key, value);
        }
        Ok(insert_at(payload, &self.output_key, Value::Object(extracted)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// format_string
// ─────────────────────────────────────────────────────────────────────────────

pub struct FormatStringTransformer {
    template: String,
    output_key: String,
}

impl FormatStringTransformer {
    fn from_params(params: &Value) -> Result<Self> {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            template: String,
            #[serde(default = "default_output_key")]
            output_key: String,
        }
        fn default_output_key() -> String {
            "formatted".to_string()
        }

        let params: Params = serde_json::from_value(params.clone())
            .context("invalid format_string transformer params")?;
        Ok(Self {
            template: params.template,
            output_key: params.output_key,
        })
    }

    fn transform(&self, payload: &Value) -> Value {
        let formatted = template::substitute(&self.template, payload);
        insert_at(payload, &self.output_key, Value::String(formatted))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// math
// ─────────────────────────────────────────────────────────────────────────────

pub struct MathTransformer {
    field: String,
    operation: MathOp,
    operand: f64,
    output_key: String,
}

#[derive(Debug, Clone, Copy)]
enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Min,
    Max,
    Abs,
    Round,
}

impl MathTransformer {
    fn from_params(params: &Value) -> Result<Self> {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            field: String,
            #[serde(default = "default_operation")]
            operation: String,
            #[serde(default)]
            operand: Value,
            #[serde(default = "default_output_key")]
            output_key: String,
        }
        fn default_operation() -> String {
            "add".to_string()
        }
        fn default_output_key() -> String {
            "result".to_string()
        }

        let params: Params =
            serde_json::from_value(params.clone()).context("invalid math transformer params")?;

        let operation = match params.operation.as_str() {
            "add" => MathOp::Add,
            "subtract" => MathOp::Subtract,
            "multiply" | "mul" => MathOp::Multiply,
            "divide" => MathOp::Divide,
            "modulo" => MathOp::Modulo,
            "power" => MathOp::Power,
            "min" => MathOp::Min,
            "max" => MathOp::Max,
            "abs" => MathOp::Abs,
            "round" => MathOp::Round,
            other => bail!("unknown math operation: {other}"),
        };

        let operand = if params.operand.is_null() {
            0.0
        } else {
            as_f64(&params.operand).context("math operand is not numeric")?
        };

        Ok(Self {
            field: params.field,
            operation,
            operand,
            output_key: params.output_key,
        })
    }

    fn transform(&self, payload: &Value) -> Result<Value> {
        let Some(value) = resolve_path(payload, &self.field) else {
            // Nothing to compute on; branch continues with the old payload
            return Ok(payload.clone());
        };
        let a = as_f64(value).with_context(|| format!("field '{}' is not numeric", self.field))?;
        let b = self.operand;

        let computed = match self.operation {
            MathOp::Add => a + b,
            MathOp::Subtract => a - b,
            MathOp::Multiply => a * b,
            // Division and modulo by zero yield zero rather than an error
            MathOp::Divide => {
                if b == 0.0 {
                    0.0
                } else {
                    a / b
                }
            }
            MathOp::Modulo => {
                if b == 0.0 {
                    0.0
                } else {
                    a % b
                }
            }
            MathOp::Power => a.powf(b),
            MathOp::Min => a.min(b),
            MathOp::Max => a.max(b),
            MathOp::Abs => a.abs(),
            MathOp::Round => {
                let factor = 10f64.powi(b as i32);
                (a * factor).round() / factor
            }
        };

        Ok(insert_at(payload, &self.output_key, json!(computed)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// json_path
// ─────────────────────────────────────────────────────────────────────────────

pub struct JsonPathTransformer {
    path: String,
    output_key: String,
}

fn bracket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("bracket regex"))
}

impl JsonPathTransformer {
    fn from_params(params: &Value) -> Result<Self> {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default = "default_path")]
            path: String,
            #[serde(default = "default_output_key")]
            output_key: String,
        }
        fn default_path() -> String {
            "$".to_string()
        }
        fn default_output_key() -> String {
            "json_result".to_string()
        }

        let params: Params = serde_json::from_value(params.clone())
            .context("invalid json_path transformer params")?;
        Ok(Self {
            path: params.path,
            output_key: params.output_key,
        })
    }

    fn transform(&self, payload: &Value) -> Value {
        let path = self
            .path
            .trim_start_matches('$')
            .trim_start_matches('.')
            .to_string();
        let resolved = Self::eval_path(Some(payload), &path)
            .cloned()
            .unwrap_or(Value::Null);
        insert_at(payload, &self.output_key, resolved)
    }

    /// Restricted JSONPath: `a.b`, `a[0]`, `a.b[1].c`.
    fn eval_path<'a>(data: Option<&'a Value>, path: &str) -> Option<&'a Value> {
        let data = data?;
        if path.is_empty() {
            return Some(data);
        }

        // One dot-separated segment at a time; a segment may carry
        // trailing [n] indices ("readings[1]", "grid[0][2]")
        let (segment, rest) = path.split_once('.').unwrap_or((path, ""));
        let (name, brackets) = match segment.find('[') {
            Some(pos) => segment.split_at(pos),
            None => (segment, ""),
        };

        let mut current = if name.is_empty() { data } else { data.get(name)? };
        for caps in bracket_re().captures_iter(brackets) {
            let idx: usize = caps[1].parse().ok()?;
            current = current.get(idx)?;
        }
        Self::eval_path(Some(current), rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Value {
        json!({
            "source_type": "cpu",
            "data": {
                "cpu_percent": 95.0,
                "readings": [10, 20, 30],
                "host": {"name": "workstation"},
            }
        })
    }

    fn transformer(config: Value) -> Transformer {
        Transformer::from_config(&config).unwrap()
    }

    #[test]
    fn test_passthrough_is_identity() {
        let t = transformer(json!({"type": "passthrough"}));
        assert_eq!(t.transform(&payload()).unwrap(), payload());
        // Missing type defaults to passthrough
        let t = Transformer::from_config(&json!({})).unwrap();
        assert_eq!(t.transform(&payload()).unwrap(), payload());
    }

    #[test]
    fn test_extract_field_full_paths() {
        let t = transformer(json!({
            "type": "extract_field",
            "params": {"fields": ["data.cpu_percent", "data.host.name", "data.missing"]}
        }));
        let out = t.transform(&payload()).unwrap();
        assert_eq!(out["extracted"]["data.cpu_percent"], json!(95.0));
        assert_eq!(out["extracted"]["data.host.name"], json!("workstation"));
        assert_eq!(out["extracted"]["data.missing"], Value::Null);
        // Original payload fields survive
        assert_eq!(out["source_type"], json!("cpu"));
    }

    #[test]
    fn test_extract_field_flatten_uses_leaf_segment() {
        let t = transformer(json!({
            "type": "extract_field",
            "params": {"fields": ["data.host.name"], "flatten": true, "output_key": "picked"}
        }));
        let out = t.transform(&payload()).unwrap();
        assert_eq!(out["picked"]["name"], json!("workstation"));
    }

    #[test]
    fn test_format_string_substitutes_and_blanks_missing() {
        let t = transformer(json!({
            "type": "format_string",
            "params": {"template": "cpu={data.cpu_percent} host={data.host.name} x={nope}"}
        }));
        let out = t.transform(&payload()).unwrap();
        assert_eq!(out["formatted"], json!("cpu=95.0 host=workstation x="));
    }

    #[test]
    fn test_math_operations() {
        let case = |op: &str, operand: Value, expect: f64| {
            let t = transformer(json!({
                "type": "math",
                "params": {"field": "data.cpu_percent", "operation": op, "operand": operand}
            }));
            let out = t.transform(&payload()).unwrap();
            assert_eq!(out["result"], json!(expect), "operation {op}");
        };
        case("add", json!(5), 100.0);
        case("subtract", json!(5), 90.0);
        case("multiply", json!(2), 190.0);
        case("mul", json!(2), 190.0);
        case("divide", json!(2), 47.5);
        case("min", json!(50), 50.0);
        case("max", json!(99), 99.0);
        case("power", json!(2), 9025.0);
    }

    #[test]
    fn test_math_divide_and_modulo_by_zero_yield_zero() {
        for op in ["divide", "modulo"] {
            let t = transformer(json!({
                "type": "math",
                "params": {"field": "data.cpu_percent", "operation": op, "operand": 0}
            }));
            assert_eq!(t.transform(&payload()).unwrap()["result"], json!(0.0));
        }
    }

    #[test]
    fn test_math_round_to_digits() {
        let p = json!({"data": {"v": 3.14159}});
        let t = transformer(json!({
            "type": "math",
            "params": {"field": "data.v", "operation": "round", "operand": 2}
        }));
        assert_eq!(t.transform(&p).unwrap()["result"], json!(3.14));
    }

    #[test]
    fn test_math_missing_field_keeps_payload() {
        let t = transformer(json!({
            "type": "math",
            "params": {"field": "data.absent", "operation": "add", "operand": 1}
        }));
        assert_eq!(t.transform(&payload()).unwrap(), payload());
    }

    #[test]
    fn test_json_path_variants() {
        let case = |path: &str, expect: Value| {
            let t = transformer(json!({
                "type": "json_path",
                "params": {"path": path}
            }));
            let out = t.transform(&payload()).unwrap();
            assert_eq!(out["json_result"], expect, "path {path}");
        };
        case("$.data.cpu_percent", json!(95.0));
        case("$.data.readings[1]", json!(20));
        case("$.data.host.name", json!("workstation"));
        case("$.data.readings[9]", Value::Null);
        case("$.data.nope.deeper", Value::Null);

        let grid = json!({"grid": [[1, 2], [3, 4]]});
        let t = transformer(json!({
            "type": "json_path",
            "params": {"path": "$.grid[1][0]"}
        }));
        assert_eq!(t.transform(&grid).unwrap()["json_result"], json!(3));
    }

    #[test]
    fn test_unknown_type_and_operation_fail_construction() {
        assert!(Transformer::from_config(&json!({"type": "teleport"})).is_err());
        assert!(Transformer::from_config(&json!({
            "type": "math",
            "params": {"field": "x", "operation": "sqrt"}
        }))
        .is_err());
    }

    #[test]
    fn test_transform_does_not_mutate_input() {
        let p = payload();
        let t = transformer(json!({
            "type": "math",
            "params": {"field": "data.cpu_percent", "operation": "add", "operand": 1}
        }));
        let _ = t.transform(&p).unwrap();
        assert_eq!(p, payload());
    }
}
