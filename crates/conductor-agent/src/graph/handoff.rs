use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use conductor_core::workflow::{DataTransform, Step};

/// Key holding non-object output handed to a step.
pub const PREVIOUS_OUTPUT_KEY: &str = "previous_output";
/// Key holding input supplied on resume.
pub const USER_INPUT_KEY: &str = "user_input";

/// Data handed to a step: the run input, predecessor outputs, and user input.
///
/// Keys are strings; values are JSON. Later writes win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffContext {
    data: Map<String, Value>,
}

impl HandoffContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a value; objects are spread into keys, scalars land under `input`.
    pub fn from_value(value: &Value) -> Self {
        let mut ctx = Self::new();
        match value {
            Value::Null => {}
            Value::Object(map) => ctx.data = map.clone(),
            other => {
                ctx.data.insert("input".into(), other.clone());
            }
        }
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Merge another context into this one. Overwrites existing keys.
    pub fn merge(&mut self, other: &HandoffContext) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Take in a predecessor's (possibly transformed) output.
    pub fn absorb(&mut self, value: Value) {
        match value {
            Value::Null => {}
            Value::Object(map) => self.data.extend(map),
            other => {
                self.data.insert(PREVIOUS_OUTPUT_KEY.into(), other);
            }
        }
    }

    pub fn set_user_input(&mut self, value: Value) {
        self.data.insert(USER_INPUT_KEY.into(), value);
    }

    pub fn has_user_input(&self) -> bool {
        self.data.contains_key(USER_INPUT_KEY)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

/// Reshape a step output before it is handed to the edge target.
pub fn apply_transform(transform: &DataTransform, output: Value) -> Value {
    match transform {
        DataTransform::Pick { keys } => match output {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(k, _)| keys.contains(k))
                    .collect(),
            ),
            other => other,
        },
        DataTransform::Rename { from, to } => match output {
            Value::Object(mut map) => {
                if let Some(v) = map.remove(from) {
                    map.insert(to.clone(), v);
                }
                Value::Object(map)
            }
            other => other,
        },
        DataTransform::Wrap { key } => {
            let mut map = Map::new();
            map.insert(key.clone(), output);
            Value::Object(map)
        }
        DataTransform::Extract { path } => lookup_path(&output, path),
        DataTransform::Merge { value } => {
            let mut base = match output {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("output".into(), other);
                    map
                }
            };
            if let Value::Object(extra) = value {
                for (k, v) in extra {
                    base.insert(k.clone(), v.clone());
                }
            }
            Value::Object(base)
        }
    }
}

/// Follow a dotted path through objects (and array indices). Missing = null.
pub fn lookup_path(value: &Value, path: &str) -> Value {
    let mut current = value;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let next = match current {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Parse worker output text: JSON objects and arrays stay structured, anything else is a string.
pub fn parse_output(content: &str) -> Value {
    let trimmed = content.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            return json;
        }
    }
    Value::String(content.to_string())
}

/// Build the worker prompt for a step from its template and handed-off data.
pub fn build_prompt(step: &Step, context: &HandoffContext) -> String {
    let base = match &step.prompt {
        Some(template) => render_template(template, context),
        None if step.description.is_empty() => step.name.clone(),
        None => format!("{}\n\n{}", step.name, step.description),
    };

    if context.is_empty() {
        return base;
    }

    let mut prompt = String::from("## Context Data\n\n");
    for (key, value) in context.data() {
        prompt.push_str(&format!("**{}**: {}\n", key, display(value)));
    }
    prompt.push_str("\n---\n\n");
    prompt.push_str(&base);
    prompt
}

/// Substitute `{{input}}` and `{{input.<path>}}` placeholders.
fn render_template(template: &str, context: &HandoffContext) -> String {
    let whole = context.to_value();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = after[..end].trim();
        let replacement = if name == "input" {
            Some(display(&whole))
        } else {
            name.strip_prefix("input.")
                .map(|path| display(&lookup_path(&whole, path)))
        };
        match replacement {
            Some(text) => out.push_str(&text),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
