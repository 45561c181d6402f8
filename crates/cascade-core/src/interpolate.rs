//! Variable interpolation: `{{nodeId.path}}` references resolved against
//! step results.
//!
//! Path segments are dot-separated; object segments index keys and numeric
//! segments index array positions. A missing path substitutes the empty
//! string; the miss is logged at debug level but is never fatal.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid template regex"))
}

fn exact_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\{\{\s*([^{}]+?)\s*\}\}$").expect("valid exact-ref regex"))
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Layered lookup environment: the run's step results at the bottom, loop
/// iteration bindings stacked above. Lookups search innermost-first, so a
/// loop's `iterationVariable` shadows a step result of the same name.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    layers: Vec<HashMap<String, Value>>,
}

impl Scope {
    /// Root scope over a run's step results.
    pub fn root(step_results: HashMap<String, Value>) -> Self {
        Self {
            layers: vec![step_results],
        }
    }

    /// A child scope layering `bindings` over this scope. The parent layers
    /// are cloned, so sibling children never observe each other's writes.
    pub fn child(&self, bindings: HashMap<String, Value>) -> Self {
        let mut layers = self.layers.clone();
        layers.push(bindings);
        Self { layers }
    }

    /// Record a value in the innermost layer.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        if self.layers.is_empty() {
            self.layers.push(HashMap::new());
        }
        self.layers
            .last_mut()
            .expect("at least one layer")
            .insert(key.into(), value);
    }

    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.layers.iter().rev().find_map(|layer| layer.get(key))
    }

    /// Resolve a dotted path against this scope.
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let mut current = self.lookup(head)?;

        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => {
                    let idx: usize = segment.parse().ok()?;
                    items.get(idx)?
                }
                _ => return None,
            };
        }

        Some(current.clone())
    }
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

/// Textual form of a resolved value: strings verbatim, numbers and booleans
/// via their display form, null and misses as the empty string, objects and
/// arrays as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Replace every `{{path}}` occurrence in `template` with the string form
/// of the dereferenced value. A template with no occurrences is returned
/// unchanged.
pub fn interpolate(template: &str, scope: &Scope) -> String {
    template_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = &caps[1];
            match scope.resolve_path(path) {
                Some(value) => stringify(&value),
                None => {
                    debug!(path, "interpolation path not found, substituting empty string");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Resolve a template to a JSON value. A template that is exactly one
/// `{{path}}` reference yields the referenced value with its type intact
/// (so `"{{input.items}}"` can produce an array); anything else
/// interpolates to a string.
pub fn resolve_expression(template: &str, scope: &Scope) -> Value {
    if let Some(caps) = exact_ref_re().captures(template.trim()) {
        let path = &caps[1];
        return match scope.resolve_path(path) {
            Some(value) => value,
            None => {
                debug!(path, "interpolation path not found, substituting null");
                Value::Null
            }
        };
    }
    Value::String(interpolate(template, scope))
}

/// Recursively interpolate a JSON value: strings go through
/// [`resolve_expression`], objects and arrays recurse, everything else
/// passes through untouched.
pub fn interpolate_value(value: &Value, scope: &Scope) -> Value {
    match value {
        Value::String(s) => resolve_expression(s, scope),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, scope))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
