//! Rendering of executor result tuples into reply messages.
//!
//! Skills declare a format spec per output type; each rule is a template
//! over the output value. Rendering is deterministic: same tuple, same
//! locale, same messages.

pub mod interpolate;

pub use interpolate::interpolate;

use crate::agent::types::{Rdl, ReplyMessage};
use serde::{Deserialize, Serialize};

/// One declared rendering rule for an output type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormatRule {
    Text { text: String },
    Picture { url: String },
    Rdl {
        display_title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_text: Option<String>,
        web_callback: String,
    },
}

/// Locale-scoped formatter. Timezone and preferred units come from the
/// platform preferences at construction and stay fixed for the session.
#[derive(Clone)]
pub struct Formatter {
    locale: String,
    temperature_unit: String,
}

impl Formatter {
    pub fn new(locale: impl Into<String>, temperature_unit: impl Into<String>) -> Self {
        Self { locale: locale.into(), temperature_unit: temperature_unit.into() }
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// Render one result tuple with its format spec. Rules that interpolate
    /// to nothing (all placeholders missing) are dropped rather than sent as
    /// blank bubbles.
    pub fn render(&self, spec: &[FormatRule], output_value: &serde_json::Value) -> Vec<ReplyMessage> {
        let mut messages = Vec::with_capacity(spec.len());
        for rule in spec {
            match rule {
                FormatRule::Text { text } => {
                    let text = self.expand(text, output_value);
                    if !text.is_empty() {
                        messages.push(ReplyMessage::Text { text });
                    }
                }
                FormatRule::Picture { url } => {
                    let url = self.expand(url, output_value);
                    if !url.is_empty() {
                        messages.push(ReplyMessage::Picture { url });
                    }
                }
                FormatRule::Rdl { display_title, display_text, web_callback } => {
                    messages.push(ReplyMessage::Rdl {
                        rdl: Rdl {
                            display_title: self.expand(display_title, output_value),
                            display_text: display_text
                                .as_ref()
                                .map(|t| self.expand(t, output_value))
                                .filter(|t| !t.is_empty()),
                            web_callback: self.expand(web_callback, output_value),
                            callback: None,
                        },
                    });
                }
            }
        }
        messages
    }

    /// Fallback for output types with no declared spec.
    pub fn render_fallback(
        &self,
        app_name: &str,
        output_value: &serde_json::Value,
    ) -> Vec<ReplyMessage> {
        let body = serde_json::to_string(output_value).unwrap_or_default();
        vec![ReplyMessage::Text { text: format!("Notification from {}: {}", app_name, body) }]
    }

    fn expand(&self, template: &str, args: &serde_json::Value) -> String {
        // Bare `${x:temperature}` placeholders pick up the preferred unit.
        let template = template
            .replace(":temperature}", &format!(":temperature:{}}}", self.temperature_unit));
        interpolate(&template, args)
    }
}
