use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::Template;
use crate::error::{RenderError, TemplateError};

/// A JSON-shaped value whose string leaves are templates.
///
/// Built once from configuration; rendering keeps the tree's shape and only
/// replaces string leaves with their rendered text. Numbers, booleans and
/// nulls pass through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralTemplate {
    Text(Template),
    Number(serde_json::Number),
    Bool(bool),
    Null,
    Sequence(Vec<StructuralTemplate>),
    Mapping(Vec<(String, StructuralTemplate)>),
}

impl StructuralTemplate {
    /// Parse every string leaf of `value`. Fails with the path of the first
    /// leaf that is not a valid template.
    pub fn from_value(value: &Value) -> Result<Self, RenderError> {
        Self::build(value, &mut String::new())
    }

    fn build(value: &Value, path: &mut String) -> Result<Self, RenderError> {
        Ok(match value {
            Value::String(src) => {
                let template = Template::parse(src).map_err(|source| RenderError {
                    path: path.clone(),
                    source,
                })?;
                StructuralTemplate::Text(template)
            }
            Value::Number(n) => StructuralTemplate::Number(n.clone()),
            Value::Bool(b) => StructuralTemplate::Bool(*b),
            Value::Null => StructuralTemplate::Null,
            Value::Array(items) => {
                let mut nodes = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let mark = push_index(path, i);
                    nodes.push(Self::build(item, path)?);
                    path.truncate(mark);
                }
                StructuralTemplate::Sequence(nodes)
            }
            Value::Object(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, item) in map {
                    let mark = push_key(path, key);
                    entries.push((key.clone(), Self::build(item, path)?));
                    path.truncate(mark);
                }
                StructuralTemplate::Mapping(entries)
            }
        })
    }

    /// A template tree consisting of a single text leaf.
    pub fn text(template: Template) -> Self {
        StructuralTemplate::Text(template)
    }

    /// Render against `data`, returning a value of the same shape.
    pub fn render(&self, data: &Value) -> Result<Value, RenderError> {
        self.render_at(data, &mut String::new())
    }

    /// Like [`render`](Self::render), with any serializable context.
    pub fn render_context<T: Serialize>(&self, context: &T) -> Result<Value, RenderError> {
        let data = serde_json::to_value(context).map_err(|e| RenderError {
            path: String::new(),
            source: TemplateError::exec(format!("serialize context: {e}")),
        })?;
        self.render(&data)
    }

    fn render_at(&self, data: &Value, path: &mut String) -> Result<Value, RenderError> {
        Ok(match self {
            StructuralTemplate::Text(template) => {
                let text = template.render(data).map_err(|source| RenderError {
                    path: path.clone(),
                    source,
                })?;
                Value::String(text)
            }
            StructuralTemplate::Number(n) => Value::Number(n.clone()),
            StructuralTemplate::Bool(b) => Value::Bool(*b),
            StructuralTemplate::Null => Value::Null,
            StructuralTemplate::Sequence(nodes) => {
                let mut out = Vec::with_capacity(nodes.len());
                for (i, node) in nodes.iter().enumerate() {
                    let mark = push_index(path, i);
                    out.push(node.render_at(data, path)?);
                    path.truncate(mark);
                }
                Value::Array(out)
            }
            StructuralTemplate::Mapping(entries) => {
                let mut out = Map::with_capacity(entries.len());
                for (key, node) in entries {
                    let mark = push_key(path, key);
                    out.insert(key.clone(), node.render_at(data, path)?);
                    path.truncate(mark);
                }
                Value::Object(out)
            }
        })
    }

    /// The unrendered tree, with templates as their source strings.
    pub fn to_value(&self) -> Value {
        match self {
            StructuralTemplate::Text(template) => Value::String(template.source().to_string()),
            StructuralTemplate::Number(n) => Value::Number(n.clone()),
            StructuralTemplate::Bool(b) => Value::Bool(*b),
            StructuralTemplate::Null => Value::Null,
            StructuralTemplate::Sequence(nodes) => {
                Value::Array(nodes.iter().map(Self::to_value).collect())
            }
            StructuralTemplate::Mapping(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, node)| (k.clone(), node.to_value()))
                    .collect(),
            ),
        }
    }
}

fn push_index(path: &mut String, index: usize) -> usize {
    let mark = path.len();
    path.push_str(&format!("[{index}]"));
    mark
}

fn push_key(path: &mut String, key: &str) -> usize {
    let mark = path.len();
    if !path.is_empty() {
        path.push('.');
    }
    path.push_str(key);
    mark
}

impl From<Template> for StructuralTemplate {
    fn from(template: Template) -> Self {
        StructuralTemplate::Text(template)
    }
}

impl Serialize for StructuralTemplate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StructuralTemplate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        StructuralTemplate::from_value(&value).map_err(serde::de::Error::custom)
    }
}
