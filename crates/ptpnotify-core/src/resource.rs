//! Resource address templating.
//!
//! Every published resource address is `<prefix>/<nodeName>/<suffix>`
//! rendered from a single format string with exactly two `%s` placeholders.
//! The same rendering feeds both the bus address and `event.source`, so the
//! template is validated once at construction instead of at every publish.

use thiserror::Error;

/// Default resource prefix template. The first placeholder receives the node
/// name, the second the resource suffix (which carries its own leading `/`).
pub const DEFAULT_RESOURCE_PREFIX: &str = "/cluster/node/%s%s";

/// Errors raised when constructing a [`ResourceTemplate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// The template does not contain exactly two `%s` placeholders.
    #[error("resource template must contain exactly two %s placeholders, found {0}")]
    PlaceholderCount(usize),
}

/// A validated resource prefix template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTemplate {
    template: String,
}

impl ResourceTemplate {
    /// Validates and wraps a template string.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::PlaceholderCount`] unless the string contains
    /// exactly two `%s` placeholders.
    pub fn new(template: impl Into<String>) -> Result<Self, TemplateError> {
        let template = template.into();
        let placeholders = template.matches("%s").count();
        if placeholders != 2 {
            return Err(TemplateError::PlaceholderCount(placeholders));
        }
        Ok(Self { template })
    }

    /// Renders the template with the node name and resource suffix.
    #[must_use]
    pub fn render(&self, node_name: &str, suffix: &str) -> String {
        let mut parts = self.template.splitn(3, "%s");
        // new() guarantees three parts
        let head = parts.next().unwrap_or_default();
        let mid = parts.next().unwrap_or_default();
        let tail = parts.next().unwrap_or_default();
        format!("{head}{node_name}{mid}{suffix}{tail}")
    }

    /// Returns the raw template string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.template
    }
}

impl Default for ResourceTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_RESOURCE_PREFIX.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_default_template() {
        let template = ResourceTemplate::default();
        assert_eq!(
            template.render("worker-0", "/sync/ptp-status/ptp-state-change"),
            "/cluster/node/worker-0/sync/ptp-status/ptp-state-change"
        );
    }

    #[test]
    fn rejects_wrong_arity() {
        assert_eq!(
            ResourceTemplate::new("/cluster/%s"),
            Err(TemplateError::PlaceholderCount(1))
        );
        assert_eq!(
            ResourceTemplate::new("/%s/%s/%s"),
            Err(TemplateError::PlaceholderCount(3))
        );
    }

    #[test]
    fn custom_template() {
        let template = ResourceTemplate::new("/edge/%s/events%s").expect("valid template");
        assert_eq!(template.render("n1", "/ptp"), "/edge/n1/events/ptp");
    }
}
