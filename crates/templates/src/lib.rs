//! Text templates for notification payloads.
//!
//! [`Template`] understands the Go `text/template` action syntax (fields,
//! pipelines, `if`/`with`/`range`, variables) together with a sprig-style helper
//! library. [`StructuralTemplate`] applies templates to every string leaf of a
//! JSON-shaped value, which is how webhook bodies are configured.

mod error;
mod exec;
mod funcs;
mod lexer;
mod parse;
mod structural;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub use error::{RenderError, TemplateError};
pub use funcs::names as function_names;
pub use structural::StructuralTemplate;

/// A parsed scalar template. Cheap to clone.
#[derive(Clone)]
pub struct Template {
    source: String,
    nodes: Arc<Vec<parse::Node>>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let nodes = parse::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            nodes: Arc::new(nodes),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, data: &Value) -> Result<String, TemplateError> {
        exec::execute(&self.nodes, data)
    }

    pub fn render_context<T: Serialize>(&self, context: &T) -> Result<String, TemplateError> {
        let data = serde_json::to_value(context)
            .map_err(|e| TemplateError::exec(format!("serialize context: {e}")))?;
        self.render(&data)
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Template").field(&self.source).finish()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Template {}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Template::parse(s)
    }
}

impl Serialize for Template {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Template::parse(&source).map_err(serde::de::Error::custom)
    }
}

