use thiserror::Error;

/// Errors produced while parsing or executing a scalar template.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("parse template: line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("execute template: {0}")]
    Exec(String),

    #[error("execute template: calling {name}: {message}")]
    Func { name: String, message: String },
}

impl TemplateError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        TemplateError::Parse {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn exec(message: impl Into<String>) -> Self {
        TemplateError::Exec(message.into())
    }
}

/// A structural template failure, carrying the position of the failing node
/// (`body.items[2]`, `headers.auth`, ...).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}: {source}", display_path(.path))]
pub struct RenderError {
    pub path: String,
    #[source]
    pub source: TemplateError,
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}
