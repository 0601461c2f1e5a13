//! Variable environment and textual interpolation.
//!
//! Each test execution owns a mutable `vars` map (seeded from inputs,
//! extended by steps tagged with `as`) and an immutable `env` map taken
//! from the test definition. Interpolation is a pre-pass over every
//! string-valued field of a step immediately before that step executes,
//! so side effects of previous steps are visible.
//!
//! Substitution is raw textual replacement: string values are spliced in
//! without quoting, so test authors write `'$vars.name'` when a JS string
//! literal is required. Non-string scalars are JSON-encoded; absent keys
//! become the empty string. This no-automatic-quoting behavior is a
//! compatibility contract and must not change.

use crate::definition::{InputSpec, InputType};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\$(vars|env)\.([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    static ref NAME_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Returns true when `name` is a legal variable name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// The per-run variable environment: mutable `vars`, immutable `env`.
#[derive(Debug, Clone, Default)]
pub struct VarEnv {
    vars: HashMap<String, Value>,
    env: HashMap<String, Value>,
}

impl VarEnv {
    /// Create an environment with the given static env map.
    pub fn new(env: HashMap<String, Value>) -> Self {
        Self {
            vars: HashMap::new(),
            env,
        }
    }

    /// Store a variable produced by a step or seeded from an input.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Get a previously stored variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// True when `vars` holds the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Number of stored variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True when no variables are stored.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Replace `$vars.KEY` / `$env.KEY` references left-to-right,
    /// non-overlapping, with the textual form of the named value.
    pub fn interpolate(&self, input: &str) -> String {
        let mut result = String::with_capacity(input.len());
        let mut last_end = 0;

        for caps in PLACEHOLDER_RE.captures_iter(input) {
            let whole = caps.get(0).unwrap();
            result.push_str(&input[last_end..whole.start()]);

            let scope = caps.get(1).unwrap().as_str();
            let key = caps.get(2).unwrap().as_str();
            let lookup = match scope {
                "vars" => self.vars.get(key),
                _ => self.env.get(key),
            };
            result.push_str(&value_to_text(lookup));

            last_end = whole.end();
        }

        result.push_str(&input[last_end..]);
        result
    }

    /// Recursively interpolate string leaves inside a JSON value.
    pub fn interpolate_value(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.interpolate(&s)),
            Value::Array(items) => Value::Array(
                items.into_iter().map(|v| self.interpolate_value(v)).collect(),
            ),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.interpolate_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Seed `vars` from input declarations and caller-provided values.
    ///
    /// Declared defaults apply when the caller provides nothing; a
    /// required input with neither a value nor a default is an error, as
    /// is a value that does not match the declared type.
    pub fn seed_inputs(
        &mut self,
        inputs: &[InputSpec],
        provided: &HashMap<String, Value>,
    ) -> Result<(), String> {
        for input in inputs {
            let raw = provided
                .get(&input.name)
                .cloned()
                .or_else(|| input.default_value.clone());

            let value = match raw {
                Some(v) => coerce_input(&input.name, input.input_type, v)?,
                None if input.required => {
                    return Err(format!("Missing required input '{}'", input.name));
                }
                None => continue,
            };

            self.vars.insert(input.name.clone(), value);
        }
        Ok(())
    }
}

/// Textual form of a looked-up value: strings splice in raw, other
/// scalars JSON-encode, absent keys become the empty string.
fn value_to_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn coerce_input(name: &str, ty: InputType, value: Value) -> Result<Value, String> {
    match ty {
        InputType::Text => match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(format!("Input '{}' expects text", name)),
        },
        InputType::Number => match value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("Input '{}' expects a number", name)),
            _ => Err(format!("Input '{}' expects a number", name)),
        },
        InputType::Boolean => match value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("Input '{}' expects a boolean", name)),
            },
            _ => Err(format!("Input '{}' expects a boolean", name)),
        },
    }
}
