//! Decision prompt for the classifier.
//!
//! Rendered with Handlebars in strict mode, so a template that references a
//! variable we never supply fails loudly instead of rendering blanks.

use std::path::Path;

use handlebars::{Handlebars, handlebars_helper};
use serde::Serialize;

use crate::error::ConfigError;
use crate::pipeline::render::RenderedMessage;

handlebars_helper!(inc: |v: i64| format!("{}", v + 1));

const TEMPLATE_NAME: &str = "classify";

const DEFAULT_TEMPLATE: &str = include_str!("../../prompts/classify.hbs");

/// System message sent ahead of every decision prompt unless overridden.
pub const DEFAULT_SYSTEM_POLICY: &str = "You triage a single email inbox. \
You act conservatively: when in doubt, you leave an email where it is. \
You never reply to, forward, or delete email.";

/// Rules every decision must respect, whatever the template says.
pub const POLICY_RULES: &[&str] = &[
    "Never move pending-payment, invoice-due or refund notices.",
    "Never move calendar invitations unless they are clearly automated notifications.",
    "Never move security-related mail: sign-in alerts, password resets, verification codes.",
    "Anything else that does not clearly match a listed folder: take no action.",
];

/// Template variables.
#[derive(Debug, Serialize)]
struct PromptContext<'a> {
    folders: &'a [&'a str],
    rules: &'a [&'a str],
    tool_name: &'a str,
    no_action_phrase: &'a str,
    message: &'a RenderedMessage,
}

/// Compiled decision prompt plus the system policy that accompanies it.
pub struct DecisionPrompt {
    registry: Handlebars<'static>,
    system_policy: String,
}

impl DecisionPrompt {
    /// The embedded template.
    pub fn embedded(system_policy: Option<String>) -> Result<Self, ConfigError> {
        Self::from_template(DEFAULT_TEMPLATE, system_policy)
    }

    /// A template read from disk.
    pub fn from_file(path: &Path, system_policy: Option<String>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Template(format!("{}: {e}", path.display()))
        })?;
        Self::from_template(&source, system_policy)
    }

    pub fn from_template(source: &str, system_policy: Option<String>) -> Result<Self, ConfigError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        // Plain-text prompt; HTML escaping would mangle `&` and quotes.
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("inc", Box::new(inc));
        registry
            .register_template_string(TEMPLATE_NAME, source)
            .map_err(|e| ConfigError::Template(e.to_string()))?;

        Ok(Self {
            registry,
            system_policy: system_policy
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SYSTEM_POLICY.to_string()),
        })
    }

    pub fn system_policy(&self) -> &str {
        &self.system_policy
    }

    pub fn render(
        &self,
        folders: &[&str],
        tool_name: &str,
        no_action_phrase: &str,
        message: &RenderedMessage,
    ) -> Result<String, handlebars::RenderError> {
        let context = PromptContext {
            folders,
            rules: POLICY_RULES,
            tool_name,
            no_action_phrase,
            message,
        };
        self.registry.render(TEMPLATE_NAME, &context)
    }
}

impl std::fmt::Debug for DecisionPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionPrompt")
            .field("system_policy", &self.system_policy)
            .finish_non_exhaustive()
    }
}
