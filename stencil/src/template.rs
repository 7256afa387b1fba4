//! Template rendering
//!
//! Static file contents and every file's target path are rendered through
//! tera against the package's input data. A template is constructed once
//! per source and reused for both the content and the path rendering.

use serde_json::{Map, Value};
use tera::Tera;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to parse template {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: tera::Error,
    },

    #[error("failed to render template {name}: {source}")]
    Render {
        name: String,
        #[source]
        source: tera::Error,
    },

    #[error("template data is not a valid context: {0}")]
    Context(#[source] tera::Error),
}

/// A parsed template bound to a name for error reporting.
#[derive(Debug)]
pub struct Template {
    tera: Tera,
    name: String,
}

impl Template {
    /// Parse `text` as a template named `name`.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, TemplateError> {
        let name = name.into();
        let mut tera = Tera::default();
        tera.add_raw_template(&name, text)
            .map_err(|e| TemplateError::Parse {
                name: name.clone(),
                source: e,
            })?;
        Ok(Self { tera, name })
    }

    /// Render against the package's input data.
    pub fn render(&self, data: &Map<String, Value>) -> Result<String, TemplateError> {
        let context = tera::Context::from_serialize(data).map_err(TemplateError::Context)?;
        self.tera
            .render(&self.name, &context)
            .map_err(|e| TemplateError::Render {
                name: self.name.clone(),
                source: e,
            })
    }
}

/// Render a one-off expression, as used for target paths.
pub fn render_str(name: &str, text: &str, data: &Map<String, Value>) -> Result<String, TemplateError> {
    Template::parse(name, text)?.render(data)
}
