//! Template rendering for the Decision Agent's prompts.
//!
//! `AgentConfig` carries two opaque [handlebars](https://docs.rs/handlebars)
//! templates (`system_template`, `action_template`); we only ever supply
//! variables, never structure. This mirrors the flat system+user rendering
//! this codebase has always used for chat prompts, generalized from a
//! single prompt *file* to a pair of template *strings* supplied per agent.

use handlebars::Handlebars;

use crate::prelude::*;

/// Render a single handlebars template against a JSON object of bindings.
pub fn render(template: &str, bindings: &Value) -> Result<String> {
    let handlebars = Handlebars::new();
    handlebars
        .render_template(template, bindings)
        .context("error rendering prompt template")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_simple_bindings() {
        let out = render("hello {{name}}", &json!({"name": "world"})).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn missing_binding_renders_empty() {
        let out = render("choice: {{missing}}", &json!({})).unwrap();
        assert_eq!(out, "choice: ");
    }
}
