//! Manifest template engine
//!
//! Uses minijinja with its standard `{{ ... }}` / `{% ... %}` syntax and strict
//! undefined handling: referencing a key the feature never populated is an
//! error rather than an empty string, so a missing data entry cannot silently
//! render a half-empty manifest.

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::Error;

/// Template engine for feature manifests
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine with strict undefined behavior
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.add_filter("csv", csv);
        Self { env }
    }

    /// Render a template with a serializable context
    ///
    /// `name` identifies the template in error messages (usually its path).
    pub fn render(&self, name: &str, template: &str, ctx: &impl Serialize) -> Result<String, Error> {
        self.env
            .render_str(template, ctx)
            .map_err(|e| Error::Template(format!("{name}: {}", describe(&e))))
    }

    /// Check if a string contains any template syntax
    pub fn has_template_syntax(s: &str) -> bool {
        s.contains("{{") || s.contains("{%") || s.contains("{#")
    }
}

/// Join a sequence of values with commas
fn csv(values: Vec<minijinja::Value>) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn describe(err: &minijinja::Error) -> String {
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    msg
}
