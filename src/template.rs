//! Conditional SQL template renderer.
//!
//! Query templates carry `{% if flag %} ... {% endif %}` blocks so filter
//! clauses only appear when the user supplied a value:
//!
//! ```sql
//! SELECT category, SUM(amount) AS total
//! FROM orders
//! WHERE 1=1
//! {% if date_start %} AND created_at >= :date_start {% endif %}
//! {% if status %} AND status = :status {% endif %}
//! GROUP BY category
//! ```
//!
//! The evaluator is a deliberately tiny closed grammar: block conditions
//! may only name a flag (optionally negated), and the evaluation context
//! holds nothing but booleans derived from parameter presence. Raw
//! parameter values never reach the evaluator, so user input cannot be
//! interpreted as template control flow.

use crate::error::{PipelineError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    static ref CONDITIONAL_RE: Regex = Regex::new(r"\{[%{#]").unwrap();
    static ref BLANK_LINE_RE: Regex = Regex::new(r"\n\s*\n").unwrap();
    static ref FLAG_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Render a conditional SQL template and return the final SQL together
/// with the parameters that must be bound.
///
/// Steps: normalize double-escaped delimiters, evaluate conditional
/// blocks against a boolean-only context, collapse blank lines left by
/// removed blocks, strip a trailing statement terminator, then keep only
/// the parameters whose `:name` placeholder survived rendering (numeric
/// strings coerced so clauses like `LIMIT` bind correctly).
pub fn render_query(
    template: &str,
    params: &HashMap<String, Value>,
) -> Result<(String, HashMap<String, Value>)> {
    let normalized = normalize_delimiters(template);

    let flags: HashMap<&str, bool> = params
        .iter()
        .map(|(name, value)| (name.as_str(), truthy(value)))
        .collect();

    let rendered = render_blocks(&normalized, &flags)?;

    let sql = BLANK_LINE_RE.replace_all(&rendered, "\n").trim().to_string();
    let sql = sql.strip_suffix(';').map(|s| s.trim_end().to_string()).unwrap_or(sql);

    let used = extract_placeholders(&sql);

    let mut bound: HashMap<String, Value> = HashMap::new();
    for (name, value) in params {
        if used.contains(name.as_str()) {
            bound.insert(name.clone(), coerce_numeric(value));
        }
    }

    // Templates without any conditional syntax predate the block grammar
    // and use the `(:param IS NULL OR ...)` pattern. Null-bind whatever
    // the caller did not supply so execution does not fail on an unbound
    // name.
    if !has_conditional_syntax(&normalized) {
        for name in &used {
            bound.entry(name.clone()).or_insert(Value::Null);
        }
    }

    Ok((sql, bound))
}

/// Whether a template contains any conditional/template syntax at all.
pub fn has_conditional_syntax(template: &str) -> bool {
    CONDITIONAL_RE.is_match(template)
}

/// All `:name` placeholders in a template, regardless of which
/// conditional block they sit in.
pub fn extract_placeholders(text: &str) -> HashSet<String> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Collapse double-escaped block delimiters some model outputs produce
/// (`{%% if x %%}` -> `{% if x %}`).
fn normalize_delimiters(template: &str) -> String {
    template.replace("{%%", "{%").replace("%%}", "%}")
}

/// Presence/truthiness of a raw parameter value. Mirrors the truthiness
/// rules callers expect from query-string parameters: empty strings and
/// nulls disable a block, any non-empty value enables it.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Coerce numeric strings to numbers; anything else passes through.
fn coerce_numeric(value: &Value) -> Value {
    if let Value::String(s) = value {
        if let Ok(int_val) = s.parse::<i64>() {
            return Value::from(int_val);
        }
        if let Ok(float_val) = s.parse::<f64>() {
            if float_val.is_finite() {
                if let Some(n) = serde_json::Number::from_f64(float_val) {
                    return Value::Number(n);
                }
            }
        }
    }
    value.clone()
}

/// One parsed `{% ... %}` directive.
enum Directive<'a> {
    If { flag: &'a str, negated: bool },
    Else,
    EndIf,
}

/// Open conditional block during evaluation.
struct Frame {
    condition: bool,
    emitting: bool,
    parent_emitting: bool,
    seen_else: bool,
}

fn render_blocks(template: &str, flags: &HashMap<&str, bool>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut stack: Vec<Frame> = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{%") {
        if emitting(&stack) {
            out.push_str(&rest[..start]);
        }
        let after = &rest[start + 2..];
        let end = after.find("%}").ok_or_else(|| {
            PipelineError::Render("unclosed '{%' block delimiter".to_string())
        })?;
        let directive = parse_directive(after[..end].trim())?;
        rest = &after[end + 2..];

        match directive {
            Directive::If { flag, negated } => {
                let parent = emitting(&stack);
                let value = flags.get(flag).copied().unwrap_or(false);
                let condition = if negated { !value } else { value };
                stack.push(Frame {
                    condition,
                    emitting: parent && condition,
                    parent_emitting: parent,
                    seen_else: false,
                });
            }
            Directive::Else => {
                let frame = stack.last_mut().ok_or_else(|| {
                    PipelineError::Render("'{% else %}' outside of a block".to_string())
                })?;
                if frame.seen_else {
                    return Err(PipelineError::Render(
                        "duplicate '{% else %}' in block".to_string(),
                    ));
                }
                frame.seen_else = true;
                frame.emitting = frame.parent_emitting && !frame.condition;
            }
            Directive::EndIf => {
                stack.pop().ok_or_else(|| {
                    PipelineError::Render("'{% endif %}' without matching if".to_string())
                })?;
            }
        }
    }

    if !stack.is_empty() {
        return Err(PipelineError::Render(
            "unclosed '{% if %}' block".to_string(),
        ));
    }
    out.push_str(rest);
    Ok(out)
}

fn emitting(stack: &[Frame]) -> bool {
    stack.last().map(|f| f.emitting).unwrap_or(true)
}

fn parse_directive(content: &str) -> Result<Directive<'_>> {
    let tokens: Vec<&str> = content.split_whitespace().collect();
    match tokens.as_slice() {
        ["endif"] => Ok(Directive::EndIf),
        ["else"] => Ok(Directive::Else),
        ["if", flag] => {
            validate_flag(flag)?;
            Ok(Directive::If { flag, negated: false })
        }
        ["if", "not", flag] => {
            validate_flag(flag)?;
            Ok(Directive::If { flag, negated: true })
        }
        _ => Err(PipelineError::Render(format!(
            "unsupported template directive '{{% {} %}}'",
            content
        ))),
    }
}

fn validate_flag(flag: &str) -> Result<()> {
    if FLAG_RE.is_match(flag) {
        Ok(())
    } else {
        Err(PipelineError::Render(format!(
            "block condition must be a single flag name, got '{}'",
            flag
        )))
    }
}
