//! Reference-expression resolution.
//!
//! Parameters may embed `{{nodeId.path.to.field}}` expressions that
//! resolve against the run's accumulated outputs. Resolution is a pure
//! function of the expression and the context: no side effects, and
//! identical inputs produce identical results.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use taskweave_core::error::{Result, WeaveError};

use crate::context::ExecutionContext;

fn expression_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // {{ node }} or {{ node.path.to.field }}
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)((?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
            .expect("reference expression regex is valid")
    })
}

/// Node ids referenced anywhere inside a parameter value.
///
/// These are exactly a node's dependencies — there are no hidden edges.
pub fn references(value: &serde_json::Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    collect_references(value, &mut ids);
    ids
}

fn collect_references(value: &serde_json::Value, ids: &mut BTreeSet<String>) {
    match value {
        serde_json::Value::String(s) => {
            for caps in expression_re().captures_iter(s) {
                ids.insert(caps[1].to_string());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_references(item, ids);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_references(item, ids);
            }
        }
        _ => {}
    }
}

/// Substitute every reference expression in `value` with the referenced
/// node's output (or sub-field).
///
/// A string that is exactly one expression resolves to the referenced
/// JSON value itself; an expression embedded in a longer string resolves
/// to the value's string rendering. Fails with `UnresolvedReference`
/// when the referenced node has not reached success or the path misses.
pub fn resolve(value: &serde_json::Value, ctx: &ExecutionContext) -> Result<serde_json::Value> {
    match value {
        serde_json::Value::String(s) => resolve_string(s, ctx),
        serde_json::Value::Array(items) => {
            let resolved: Result<Vec<_>> = items.iter().map(|v| resolve(v, ctx)).collect();
            Ok(serde_json::Value::Array(resolved?))
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, ctx)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, ctx: &ExecutionContext) -> Result<serde_json::Value> {
    let re = expression_re();

    // Whole-string single expression keeps the referenced value's type.
    if let Some(caps) = re.captures(s.trim()) {
        if caps.get(0).map(|m| m.as_str()) == Some(s.trim()) {
            return lookup(ctx, &caps[1], caps.get(2).map_or("", |m| m.as_str()));
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let whole = caps.get(0).expect("capture 0 is the whole match");
        out.push_str(&s[last..whole.start()]);
        let value = lookup(ctx, &caps[1], caps.get(2).map_or("", |m| m.as_str()))?;
        out.push_str(&render(&value));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(serde_json::Value::String(out))
}

/// String rendering for embedded substitution: strings stay raw, other
/// values use their JSON form.
fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup(ctx: &ExecutionContext, node_id: &str, dotted_path: &str) -> Result<serde_json::Value> {
    let expression = format!("{}{}", node_id, dotted_path);
    let output = ctx.output(node_id).ok_or_else(|| WeaveError::UnresolvedReference {
        expression: expression.clone(),
        node: node_id.to_string(),
    })?;

    let mut current = output;
    for segment in dotted_path.split('.').filter(|s| !s.is_empty()) {
        current = current
            .get(segment)
            .ok_or_else(|| WeaveError::UnresolvedReference {
                expression: expression.clone(),
                node: node_id.to_string(),
            })?;
    }
    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(node: &str, output: serde_json::Value) -> ExecutionContext {
        let mut ctx = ExecutionContext::new([node.to_string()]);
        ctx.record_success(node, output, 1);
        ctx
    }

    #[test]
    fn test_references_extraction() {
        let value = json!({
            "url": "{{fetch.url}}",
            "nested": {"items": ["{{parse.items}}", "literal"]},
            "plain": 42
        });
        let ids = references(&value);
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["fetch".to_string(), "parse".to_string()]
        );
    }

    #[test]
    fn test_whole_string_keeps_type() {
        let ctx = ctx_with("a", json!({"count": 3, "tags": ["x", "y"]}));
        let resolved = resolve(&json!("{{a.count}}"), &ctx).unwrap();
        assert_eq!(resolved, json!(3));

        let resolved = resolve(&json!("{{a.tags}}"), &ctx).unwrap();
        assert_eq!(resolved, json!(["x", "y"]));
    }

    #[test]
    fn test_embedded_expression_renders_to_string() {
        let ctx = ctx_with("a", json!({"name": "widget", "count": 3}));
        let resolved = resolve(&json!("found {{a.count}} of {{a.name}}"), &ctx).unwrap();
        assert_eq!(resolved, json!("found 3 of widget"));
    }

    #[test]
    fn test_bare_node_reference_yields_full_output() {
        let ctx = ctx_with("a", json!({"value": 1}));
        let resolved = resolve(&json!("{{a}}"), &ctx).unwrap();
        assert_eq!(resolved, json!({"value": 1}));
    }

    #[test]
    fn test_recurses_into_arrays_and_objects() {
        let ctx = ctx_with("a", json!({"v": "deep"}));
        let value = json!({"list": ["{{a.v}}", 1], "map": {"k": "{{a.v}}"}});
        let resolved = resolve(&value, &ctx).unwrap();
        assert_eq!(resolved, json!({"list": ["deep", 1], "map": {"k": "deep"}}));
    }

    #[test]
    fn test_unresolved_when_node_not_success() {
        let ctx = ExecutionContext::new(["a".to_string()]);
        let err = resolve(&json!("{{a.value}}"), &ctx).unwrap_err();
        assert!(matches!(err, WeaveError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_unresolved_when_path_misses() {
        let ctx = ctx_with("a", json!({"value": 1}));
        let err = resolve(&json!("{{a.missing.deep}}"), &ctx).unwrap_err();
        assert!(matches!(err, WeaveError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let ctx = ctx_with("a", json!({"value": {"x": [1, 2]}}));
        let value = json!({"p": "{{a.value}}", "q": "x={{a.value.x}}"});
        let first = resolve(&value, &ctx).unwrap();
        let second = resolve(&value, &ctx).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_non_expression_text_untouched() {
        let ctx = ctx_with("a", json!({"value": 1}));
        let value = json!("no references here {not one}");
        assert_eq!(resolve(&value, &ctx).unwrap(), value);
    }
}
