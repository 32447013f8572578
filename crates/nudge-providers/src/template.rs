//! Template composer — one text per stage, with placeholder fill.
//!
//! Placeholders: `{name}` and `{product}` come from the context snapshot,
//! `{last_message}` is the user's last inbound text (shortened).

use std::collections::BTreeMap;

use async_trait::async_trait;
use nudge_core::error::Result;
use nudge_core::traits::{ComposeRequest, ComposedMessage, MessageComposer};
use nudge_core::types::Stage;

/// Fallback key used when a stage has no template of its own.
const DEFAULT_KEY: &str = "default";
const LAST_MESSAGE_MAX_CHARS: usize = 80;

pub struct TemplateComposer {
    templates: BTreeMap<String, String>,
}

impl TemplateComposer {
    /// Built-in texts, overridden key by key by `overrides`.
    pub fn new(overrides: &BTreeMap<String, String>) -> Self {
        let mut templates = builtin_templates();
        templates.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { templates }
    }

    fn template_for(&self, stage: Stage) -> (String, &str) {
        let key = stage.key();
        match self.templates.get(&key) {
            Some(text) => (key, text.as_str()),
            None => (
                DEFAULT_KEY.to_string(),
                self.templates
                    .get(DEFAULT_KEY)
                    .map(String::as_str)
                    .unwrap_or("Hi {name}, just checking in. Anything we can help with?"),
            ),
        }
    }
}

impl Default for TemplateComposer {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

#[async_trait]
impl MessageComposer for TemplateComposer {
    fn name(&self) -> &str {
        "template"
    }

    async fn compose(&self, request: &ComposeRequest) -> Result<ComposedMessage> {
        let (key, template) = self.template_for(request.stage);
        Ok(ComposedMessage {
            text: fill(template, request),
            template: format!("template:{key}"),
        })
    }
}

fn fill(template: &str, request: &ComposeRequest) -> String {
    let context = &request.context_snapshot;
    let name = context
        .get("name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("there");
    let product = context
        .get("product")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("what you were looking at");
    let last_message = request
        .last_user_message
        .as_deref()
        .map(shorten)
        .unwrap_or_default();

    template
        .replace("{name}", name)
        .replace("{product}", product)
        .replace("{last_message}", &last_message)
}

fn shorten(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= LAST_MESSAGE_MAX_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(LAST_MESSAGE_MAX_CHARS).collect();
        format!("{}…", cut.trim_end())
    }
}

fn builtin_templates() -> BTreeMap<String, String> {
    [
        ("0", "Hi {name}! You asked about \"{last_message}\". Happy to help if you have more questions."),
        ("1", "Hi {name}, still thinking about {product}? I can send details or photos."),
        ("2", "{name}, quick reminder: {product} is still available. Want me to hold one for you?"),
        ("3", "Hi {name}! Anything stopping you from going ahead with {product}? Maybe I can help."),
        ("4", "{name}, we have a few new options similar to {product}. Want to take a look?"),
        ("5", "Hi {name}, just checking in. Let me know if {product} is still on your list."),
        ("6", "{name}, it's been a while! Reply any time and I'll pick up where we left off."),
        ("7", "Hi {name}, this is our last reminder about {product}. We're here whenever you need us."),
        ("maintenance", "Hi {name}! New arrivals this week. Reply if you'd like to see them."),
        (DEFAULT_KEY, "Hi {name}, just checking in. Anything we can help with?"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
