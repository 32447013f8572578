//! OpenAI-compatible composer.
//!
//! Works with any `/chat/completions` endpoint (OpenAI, Groq, DeepSeek,
//! Ollama, llama.cpp server...). Providers differ only by endpoint and key.

use async_trait::async_trait;
use nudge_core::config::LlmSettings;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{ComposeRequest, ComposedMessage, MessageComposer};
use nudge_core::types::Stage;
use serde_json::{Value, json};

const DEFAULT_SYSTEM_PROMPT: &str = "You write short, friendly follow-up messages for a sales \
assistant chatting with a customer who stopped replying. One or two sentences, no pressure, \
no invented prices or promises. Reply with the message text only.";

pub struct LlmComposer {
    settings: LlmSettings,
    name: String,
    client: reqwest::Client,
}

impl LlmComposer {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        if settings.endpoint.trim().is_empty() {
            return Err(NudgeError::Config("composer.llm.endpoint is empty".into()));
        }
        let name = format!("llm:{}", settings.model);
        Ok(Self {
            settings,
            name,
            client: reqwest::Client::new(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.settings.endpoint.trim_end_matches('/'))
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.settings.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.settings.api_key)
        }
    }

    fn user_prompt(request: &ComposeRequest) -> String {
        let tone = match request.stage {
            Stage::Numbered(0) => "a gentle first check-in".to_string(),
            Stage::Numbered(n) => format!("follow-up number {} (keep it lighter than the last)", n + 1),
            Stage::Maintenance => "an occasional light-touch update for a long-quiet customer".to_string(),
        };
        let mut prompt = format!("Write {tone}.\n");
        if let Some(last) = &request.last_user_message {
            prompt.push_str(&format!("The customer's last message was: \"{last}\"\n"));
        }
        if !request.context_snapshot.is_null() && request.context_snapshot != json!({}) {
            prompt.push_str(&format!("Conversation context: {}\n", request.context_snapshot));
        }
        prompt
    }
}

#[async_trait]
impl MessageComposer for LlmComposer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn compose(&self, request: &ComposeRequest) -> Result<ComposedMessage> {
        let system = self
            .settings
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let body = json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": Self::user_prompt(request) },
            ],
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
        });

        let response = self
            .apply_auth(self.client.post(self.chat_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| NudgeError::Http(format!("{} request failed: {e}", self.name)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(NudgeError::RateLimited(format!("{} returned 429", self.name)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(NudgeError::Compose(format!("{} API error {status}: {text}", self.name)));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| NudgeError::Compose(format!("Invalid {} response: {e}", self.name)))?;
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().trim_matches('"').trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NudgeError::Compose(format!("{} returned no text", self.name)))?;

        tracing::debug!("🤖 {} composed {} for {}", self.name, request.stage, request.user_id);
        Ok(ComposedMessage {
            text,
            template: self.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn composer(server: &MockServer) -> LlmComposer {
        LlmComposer::new(LlmSettings {
            endpoint: format!("{}/v1", server.uri()),
            api_key: "sk-test".into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn request() -> ComposeRequest {
        ComposeRequest {
            user_id: "u1".into(),
            stage: Stage::Numbered(2),
            context_snapshot: json!({ "product": "ceramic vase" }),
            last_user_message: Some("do you ship to Da Nang?".into()),
        }
    }

    #[tokio::test]
    async fn test_compose_reads_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": " \"We do ship to Da Nang!\" " } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let msg = composer(&server).compose(&request()).await.unwrap();
        assert_eq!(msg.text, "We do ship to Da Nang!");
        assert_eq!(msg.template, "llm:gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        let err = composer(&server).compose(&request()).await.unwrap_err();
        assert!(matches!(err, NudgeError::Compose(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_content_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "   " } }]
            })))
            .mount(&server)
            .await;
        assert!(composer(&server).compose(&request()).await.is_err());
    }

    #[test]
    fn test_prompt_mentions_last_message_and_context() {
        let prompt = LlmComposer::user_prompt(&request());
        assert!(prompt.contains("follow-up number 3"));
        assert!(prompt.contains("do you ship to Da Nang?"));
        assert!(prompt.contains("ceramic vase"));
    }
}
