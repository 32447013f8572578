//! # Nudge Providers
//!
//! Message composers for follow-up text.
//! - `template` — per-stage texts with `{name}` / `{product}` / `{last_message}`
//! - `llm` — OpenAI-compatible chat completions, falling back to templates

pub mod failover;
pub mod openai_compatible;
pub mod template;

use std::sync::Arc;

use nudge_core::config::ComposerConfig;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::MessageComposer;

pub use failover::FailoverComposer;
pub use openai_compatible::LlmComposer;
pub use template::TemplateComposer;

/// Build the configured composer.
pub fn build_composer(config: &ComposerConfig) -> Result<Arc<dyn MessageComposer>> {
    let templates: Arc<dyn MessageComposer> = Arc::new(TemplateComposer::new(&config.templates));
    let composer: Arc<dyn MessageComposer> = match config.kind.as_str() {
        "template" => templates,
        "llm" => {
            let settings = config
                .llm
                .clone()
                .ok_or_else(|| NudgeError::Config("[composer.llm] section missing".into()))?;
            let llm: Arc<dyn MessageComposer> = Arc::new(LlmComposer::new(settings)?);
            Arc::new(FailoverComposer::new(vec![llm, templates])?)
        }
        other => {
            return Err(NudgeError::Config(format!(
                "unknown composer kind '{other}' (expected template or llm)"
            )));
        }
    };
    tracing::info!("✍️ Message composer: {}", composer.name());
    Ok(composer)
}
