// Pipeline filters - evaluate an event payload to a boolean
//
// Three variants: boolean (field vs literal), time_window (local wall
// clock), composite (and/or/not). The registry is closed: an unknown type
// or operator fails construction, which rejects the whole pipeline at
// load. Evaluation errors surface as Err so the executor can prune
// (fail-closed) while the conditional policy admits (fail-open).

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, NaiveTime, Timelike};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::util::{as_f64, resolve_event_path, stringify};

/// A materialized filter, ready to evaluate payloads
pub enum Filter {
    Boolean(BooleanFilter),
    TimeWindow(TimeWindowFilter),
    Composite(CompositeFilter),
}

impl Filter {
    /// Build a filter from its node config. Unknown types, operators, and
    /// malformed params are construction-time failures.
    pub fn from_config(config: &Value) -> Result<Self> {
        let filter_type = config
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("boolean");
        let params = config.get("params").cloned().unwrap_or_else(|| json!({}));

        match filter_type {
            "boolean" => Ok(Filter::Boolean(BooleanFilter::from_params(&params)?)),
            "time_window" => Ok(Filter::TimeWindow(TimeWindowFilter::from_params(&params)?)),
            "composite" => Ok(Filter::Composite(CompositeFilter::from_params(&params)?)),
            other => bail!("unknown filter type: {other}"),
        }
    }

    pub fn evaluate(&self, payload: &Value) -> Result<bool> {
        match self {
            Filter::Boolean(f) => f.evaluate(payload),
            Filter::TimeWindow(f) => Ok(f.evaluate_now()),
            Filter::Composite(f) => f.evaluate(payload),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Boolean filter
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    IsTrue,
    IsFalse,
    IsNull,
    IsNotNull,
}

impl Operator {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "==" | "equals" => Operator::Eq,
            "!=" | "not_equals" => Operator::Ne,
            ">" | "greater_than" => Operator::Gt,
            "<" | "less_than" => Operator::Lt,
            ">=" | "greater_equal" => Operator::Ge,
            "<=" | "less_equal" => Operator::Le,
            "contains" => Operator::Contains,
            "not_contains" => Operator::NotContains,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            "matches" => Operator::Matches,
            "is_true" => Operator::IsTrue,
            "is_false" => Operator::IsFalse,
            "is_null" => Operator::IsNull,
            "is_not_null" => Operator::IsNotNull,
            other => bail!("unknown filter operator: {other}"),
        })
    }

    fn is_unary(&self) -> bool {
        matches!(
            self,
            Operator::IsTrue | Operator::IsFalse | Operator::IsNull | Operator::IsNotNull
        )
    }
}

pub struct BooleanFilter {
    field: String,
    operator: Operator,
    value: Value,
    // Compiled with a \A anchor so patterns match from the start
    regex: Option<Regex>,
}

impl BooleanFilter {
    fn from_params(params: &Value) -> Result<Self> {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            field: String,
            #[serde(default = "default_operator")]
            operator: String,
            #[serde(default)]
            value: Value,
        }
        fn default_operator() -> String {
            "equals".to_string()
        }

        let params: Params = serde_json::from_value(params.clone())
            .context("invalid boolean filter params")?;
        let operator = Operator::parse(&params.operator)?;

        let regex = if operator == Operator::Matches {
            let pattern = params
                .value
                .as_str()
                .context("matches operator requires a string pattern")?;
            Some(
                Regex::new(&format!(r"\A(?:{pattern})"))
                    .with_context(|| format!("invalid filter regex: {pattern}"))?,
            )
        } else {
            None
        };

        Ok(Self {
            field: params.field,
            operator,
            value: params.value,
            regex,
        })
    }

    fn evaluate(&self, payload: &Value) -> Result<bool> {
        let field_value = resolve_event_path(payload, &self.field);

        if self.operator.is_unary() {
            // A missing field reads as null for the unary operators
            let v = field_value.unwrap_or(&Value::Null);
            return Ok(match self.operator {
                Operator::IsNull => v.is_null(),
                Operator::IsNotNull => !v.is_null(),
                Operator::IsTrue => truthy(v),
                Operator::IsFalse => !truthy(v),
                _ => unreachable!(),
            });
        }

        // Binary operators cannot decide without both sides
        let Some(field_value) = field_value else {
            tracing::debug!(field = %self.field, "filter field missing, evaluating false");
            return Ok(false);
        };
        if self.value.is_null() {
            tracing::debug!(field = %self.field, "filter comparand is null, evaluating false");
            return Ok(false);
        }

        match self.operator {
            Operator::Eq => Ok(loose_eq(field_value, &self.value)),
            Operator::Ne => Ok(!loose_eq(field_value, &self.value)),
            Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => {
                let a = as_f64(field_value)
                    .with_context(|| format!("field '{}' is not numeric", self.field))?;
                let b = as_f64(&self.value).context("comparand is not numeric")?;
                Ok(match self.operator {
                    Operator::Gt => a > b,
                    Operator::Lt => a < b,
                    Operator::Ge => a >= b,
                    Operator::Le => a <= b,
                    _ => unreachable!(),
                })
            }
            Operator::Contains => Ok(stringify(field_value).contains(&stringify(&self.value))),
            Operator::NotContains => {
                Ok(!stringify(field_value).contains(&stringify(&self.value)))
            }
            Operator::StartsWith => {
                Ok(stringify(field_value).starts_with(&stringify(&self.value)))
            }
            Operator::EndsWith => Ok(stringify(field_value).ends_with(&stringify(&self.value))),
            Operator::Matches => {
                let re = self.regex.as_ref().expect("regex compiled at construction");
                Ok(re.is_match(&stringify(field_value)))
            }
            _ => unreachable!(),
        }
    }
}

/// Numbers compare numerically regardless of integer/float representation;
/// everything else compares as JSON values.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a == b;
    }
    a == b
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Time window filter
// ─────────────────────────────────────────────────────────────────────────────

pub struct TimeWindowFilter {
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
    /// Weekdays 0-6, Monday = 0
    days_of_week: Option<Vec<u32>>,
}

impl TimeWindowFilter {
    fn from_params(params: &Value) -> Result<Self> {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            start_time: Option<String>,
            #[serde(default)]
            end_time: Option<String>,
            #[serde(default)]
            days_of_week: Option<Vec<u32>>,
        }

        let params: Params = serde_json::from_value(params.clone())
            .context("invalid time_window filter params")?;

        let parse = |s: &str| -> Result<NaiveTime> {
            NaiveTime::parse_from_str(s, "%H:%M")
                .with_context(|| format!("invalid time '{s}', expected HH:MM"))
        };

        if let Some(days) = &params.days_of_week {
            if days.iter().any(|d| *d > 6) {
                bail!("days_of_week entries must be 0-6 (0 = Monday)");
            }
        }

        Ok(Self {
            start: params.start_time.as_deref().map(parse).transpose()?,
            end: params.end_time.as_deref().map(parse).transpose()?,
            days_of_week: params.days_of_week,
        })
    }

    fn evaluate_now(&self) -> bool {
        let now = Local::now();
        let time = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
            .unwrap_or(NaiveTime::MIN);
        self.evaluate_at(time, now.weekday().num_days_from_monday())
    }

    fn evaluate_at(&self, time: NaiveTime, weekday: u32) -> bool {
        if let Some(days) = &self.days_of_week {
            if !days.contains(&weekday) {
                return false;
            }
        }

        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start <= end {
                // Normal window (e.g., 09:00 to 17:00)
                if !(start <= time && time <= end) {
                    return false;
                }
            } else {
                // Overnight window (e.g., 22:00 to 06:00)
                if !(time >= start || time <= end) {
                    return false;
                }
            }
        }

        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Composite filter
// ─────────────────────────────────────────────────────────────────────────────

pub struct CompositeFilter {
    operator: CompositeOp,
    filters: Vec<Filter>,
}

#[derive(Debug, Clone, Copy)]
enum CompositeOp {
    And,
    Or,
    Not,
}

impl CompositeFilter {
    fn from_params(params: &Value) -> Result<Self> {
        let operator = match params.get("operator").and_then(Value::as_str).unwrap_or("and") {
            "and" => CompositeOp::And,
            "or" => CompositeOp::Or,
            "not" => CompositeOp::Not,
            other => bail!("unknown composite operator: {other}"),
        };

        let mut filters = Vec::new();
        if let Some(configs) = params.get("filters").and_then(Value::as_array) {
            for config in configs {
                filters.push(Filter::from_config(config)?);
            }
        }

        Ok(Self { operator, filters })
    }

    fn evaluate(&self, payload: &Value) -> Result<bool> {
        if self.filters.is_empty() {
            return Ok(true);
        }
        match self.operator {
            CompositeOp::And => {
                for f in &self.filters {
                    if !f.evaluate(payload)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            CompositeOp::Or => {
                for f in &self.filters {
                    if f.evaluate(payload)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            // NOT applies to the first child only
            CompositeOp::Not => Ok(!self.filters[0].evaluate(payload)?),
        }
    }
}
