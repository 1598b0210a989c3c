// crates/convoy-core/src/template.rs

//! The `{{dotted.path}}` template resolver
//!
//! Templates are the only data-flow primitive between steps. Two modes:
//!
//! 1. Whole-string: the entire field equals one `{{…}}` reference. The
//!    referenced value replaces the field verbatim, keeping its native type.
//! 2. Interpolation: references inside a larger string are stringified in
//!    place; a reference that does not resolve is left as literal text.
//!
//! Path evaluation walks dotted segments through mappings only; a
//! non-mapping intermediate yields undefined. Resolution is pure and
//! deterministic, and substituted output is never re-evaluated.

use crate::types::JobContext;
use serde_json::{Map, Value};

/// Resolve a dotted path against the context. `None` means undefined.
pub fn resolve_path(path: &str, ctx: &JobContext) -> Option<Value> {
    let mut segments = path.split('.');
    let root = segments.next()?;
    if root.is_empty() {
        return None;
    }
    let mut current = ctx.root(root)?;
    for segment in segments {
        match current {
            Value::Object(ref map) => {
                current = map.get(segment)?.clone();
            }
            // Sequences may appear only as leaves; numeric indexing into
            // arrays is not part of the language.
            _ => return None,
        }
    }
    Some(current)
}

/// If the whole string is a single `{{…}}` reference, return the inner path.
fn whole_template(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Stringify a resolved value for interpolation.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Interpolate `{{…}}` references inside a string.
///
/// Resolved references are stringified in place; unresolved references stay
/// as the literal `{{path}}` text. The input is scanned left to right once,
/// so substituted output is never re-expanded.
pub fn resolve_string(input: &str, ctx: &JobContext) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let raw = &after_open[..end];
                let path = raw.trim();
                match resolve_path(path, ctx) {
                    Some(value) => output.push_str(&stringify(&value)),
                    None => {
                        output.push_str("{{");
                        output.push_str(raw);
                        output.push_str("}}");
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                // Unterminated reference; keep the remainder verbatim.
                output.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    output.push_str(rest);
    output
}

/// Resolve one field value. `None` means the field resolved to undefined
/// and should be omitted from the child payload.
pub fn resolve_value(value: &Value, ctx: &JobContext) -> Option<Value> {
    match value {
        Value::String(s) => match whole_template(s) {
            Some(path) => resolve_path(path, ctx),
            None => Some(Value::String(resolve_string(s, ctx))),
        },
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                // Element arity is preserved: an undefined element keeps its
                // literal template text instead of being dropped.
                .map(|item| resolve_value(item, ctx).unwrap_or_else(|| item.clone()))
                .collect(),
        )),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, field) in map {
                if let Some(v) = resolve_value(field, ctx) {
                    resolved.insert(key.clone(), v);
                }
            }
            Some(Value::Object(resolved))
        }
        other => Some(other.clone()),
    }
}

/// Resolve a step input map; undefined fields are omitted.
pub fn resolve_input(input: &Map<String, Value>, ctx: &JobContext) -> Map<String, Value> {
    let mut resolved = Map::with_capacity(input.len());
    for (key, value) in input {
        if let Some(v) = resolve_value(value, ctx) {
            resolved.insert(key.clone(), v);
        }
    }
    resolved
}

/// Deep-interpolate a record (effect records, enqueue child jobs).
///
/// Every string is resolved; whole-string references substitute natively so
/// the record stays shape-compatible with its declared schema. References
/// that do not resolve keep their literal text rather than dropping fields.
pub fn resolve_tree(value: &Value, ctx: &JobContext) -> Value {
    match value {
        Value::String(s) => match whole_template(s) {
            Some(path) => resolve_path(path, ctx).unwrap_or_else(|| value.clone()),
            None => Value::String(resolve_string(s, ctx)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_tree(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_tree(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Evaluate a `runWhen` template: null, false, 0, "" and "false" are falsy,
/// as is an unresolved reference.
pub fn evaluate_condition(template: &str, ctx: &JobContext) -> bool {
    let resolved = match whole_template(template) {
        Some(path) => resolve_path(path, ctx),
        None => {
            let text = resolve_string(template, ctx);
            if text.contains("{{") {
                None
            } else {
                Some(Value::String(text))
            }
        }
    };
    match resolved {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty() && s != "false" && s != "0",
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> JobContext {
        let mut ctx = JobContext::new(json!({
            "x": "A",
            "count": 3,
            "items": [1, 2, 3],
            "nested": {"inner": {"flag": true}}
        }));
        ctx.steps.insert("download".into(), json!({"path": "/tmp/a.wav", "bytes": 1024}));
        ctx
    }

    #[test]
    fn whole_string_preserves_native_type() {
        let ctx = context();
        let resolved = resolve_value(&json!("{{payload.items}}"), &ctx).unwrap();
        assert_eq!(resolved, json!([1, 2, 3]));

        let resolved = resolve_value(&json!("{{ payload.count }}"), &ctx).unwrap();
        assert_eq!(resolved, json!(3));
    }

    #[test]
    fn interpolation_stringifies() {
        let ctx = context();
        let out = resolve_string("file {{steps.download.path}} ({{steps.download.bytes}} bytes)", &ctx);
        assert_eq!(out, "file /tmp/a.wav (1024 bytes)");
    }

    #[test]
    fn unresolved_interpolation_keeps_literal() {
        let ctx = context();
        assert_eq!(resolve_string("v={{payload.missing}}", &ctx), "v={{payload.missing}}");
    }

    #[test]
    fn undefined_whole_template_is_omitted_from_input() {
        let ctx = context();
        let mut input = Map::new();
        input.insert("a".into(), json!("{{payload.x}}"));
        input.insert("b".into(), json!("{{payload.absent}}"));
        let resolved = resolve_input(&input, &ctx);
        assert_eq!(resolved.get("a"), Some(&json!("A")));
        assert!(!resolved.contains_key("b"));
    }

    #[test]
    fn non_mapping_intermediate_is_undefined() {
        let ctx = context();
        // items is a sequence; indexing through it is not supported.
        assert_eq!(resolve_path("payload.items.0", &ctx), None);
        assert_eq!(resolve_path("payload.x.deeper", &ctx), None);
    }

    #[test]
    fn deep_paths_walk_mappings() {
        let ctx = context();
        assert_eq!(resolve_path("payload.nested.inner.flag", &ctx), Some(json!(true)));
    }

    #[test]
    fn iteration_variables_resolve() {
        let ctx = context().with_iteration(json!({"name": "clip"}), 2);
        assert_eq!(resolve_path("item.name", &ctx), Some(json!("clip")));
        assert_eq!(resolve_path("index", &ctx), Some(json!(2)));
    }

    #[test]
    fn resolution_is_pure() {
        let ctx = context();
        let template = json!({"v": "{{payload.x}}-{{payload.count}}"});
        let first = resolve_value(&template, &ctx);
        let second = resolve_value(&template, &ctx);
        assert_eq!(first, second);
    }

    #[test]
    fn substituted_output_is_not_reevaluated() {
        let mut ctx = JobContext::new(json!({"a": "{{payload.b}}", "b": "X"}));
        ctx.steps.clear();
        // payload.a resolves to the literal text "{{payload.b}}" and stays that way.
        assert_eq!(resolve_string("{{payload.a}}", &ctx), "{{payload.b}}");
    }

    #[test]
    fn resolve_tree_keeps_shape() {
        let ctx = context();
        let record = json!({
            "$event": "notify",
            "message": "count is {{payload.count}}",
            "task": {"type": "echo", "payload": "{{payload.nested}}"}
        });
        let resolved = resolve_tree(&record, &ctx);
        assert_eq!(resolved["message"], json!("count is 3"));
        assert_eq!(resolved["task"]["payload"], json!({"inner": {"flag": true}}));
        assert_eq!(resolved["$event"], json!("notify"));
    }

    #[test]
    fn condition_truthiness() {
        let ctx = context();
        assert!(evaluate_condition("{{payload.nested.inner.flag}}", &ctx));
        assert!(evaluate_condition("{{payload.count}}", &ctx));
        assert!(!evaluate_condition("{{payload.missing}}", &ctx));
        assert!(!evaluate_condition("false", &ctx));
        assert!(!evaluate_condition("", &ctx));
        assert!(evaluate_condition("yes", &ctx));
    }
}
