use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::session::{MessageRole, Session};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Free-text reply generator for casual and onboarding turns.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, messages: Vec<Message>) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client,
        }
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, messages: Vec<Message>) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.7),
            max_tokens: Some(300),
        };

        let mut req = self.client.post(&url).json(&request);

        // Local models run without a key
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }
}

/// Used when no completion backend is configured. Always fails, so callers fall back.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionService for DisabledCompletion {
    async fn complete(&self, _messages: Vec<Message>) -> Result<String> {
        anyhow::bail!("Completion service disabled")
    }
}

pub fn from_config(config: &CompletionConfig) -> Arc<dyn CompletionService> {
    if !config.enabled {
        return Arc::new(DisabledCompletion);
    }
    tracing::info!(
        "Using completion service at {} (model {})",
        config.api_url,
        config.model
    );
    Arc::new(LlmClient::new(
        config.api_url.clone(),
        config.api_key.clone().unwrap_or_default(),
        config.model.clone(),
    ))
}

const GUIDE_PERSONA: &str = "Ты добрый проводник InnerWorld Edu для ребёнка 8-12 лет. \
Отвечай по-русски, коротко (1-3 предложения), тепло и без оценок. \
Не давай медицинских советов. Если ребёнку плохо, мягко предложи поговорить со взрослым.";

/// Persona, session context and recent log as chat messages. The log already holds `text`.
pub fn conversation_messages(session: &Session, history: usize) -> Vec<Message> {
    let mut context = String::from(GUIDE_PERSONA);
    if let Some(name) = &session.name {
        context.push_str(&format!("\nИмя ребёнка: {}.", name));
    }
    if let Some(reading) = &session.latest_emotion {
        context.push_str(&format!(
            "\nТекущее настроение: {} ({:.1}).",
            reading.state.as_str(),
            reading.intensity
        ));
    }
    if let Some(location) = &session.location {
        context.push_str(&format!("\nЛокация: {}.", location));
    }

    let mut messages = vec![Message::system(context)];
    for entry in session.message_log.recent(history) {
        messages.push(match entry.role {
            MessageRole::Child => Message::user(entry.text.clone()),
            MessageRole::Guide => Message::assistant(entry.text.clone()),
        });
    }
    messages
}

/// Ask the service, replacing any failure with `fallback`.
pub async fn complete_or_fallback(
    service: &dyn CompletionService,
    messages: Vec<Message>,
    fallback: &str,
) -> String {
    match service.complete(messages).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!("Completion failed, using fallback reply: {:#}", e);
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use chrono::Utc;

    struct Canned(&'static str);

    #[async_trait]
    impl CompletionService for Canned {
        async fn complete(&self, messages: Vec<Message>) -> Result<String> {
            assert_eq!(messages[0].role, "system");
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn failures_become_the_fallback() {
        let reply = complete_or_fallback(&DisabledCompletion, vec![], "Расскажи ещё!").await;
        assert_eq!(reply, "Расскажи ещё!");

        let reply =
            complete_or_fallback(&Canned("Привет!"), vec![Message::system("x")], "fallback").await;
        assert_eq!(reply, "Привет!");
    }

    #[test]
    fn messages_follow_the_log_roles() {
        let now = Utc::now();
        let mut session = Session::new("kid", now, &EngineConfig::default());
        session.name = Some("Оля".into());
        session.message_log.push(MessageRole::Child, "привет", now);
        session.message_log.push(MessageRole::Guide, "здравствуй", now);
        session.message_log.push(MessageRole::Child, "как дела?", now);

        let messages = conversation_messages(&session, 2);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].content.contains("Оля"));
        assert_eq!(messages[1], Message::assistant("здравствуй"));
        assert_eq!(messages[2], Message::user("как дела?"));
    }

    #[test]
    fn client_normalizes_trailing_slash() {
        let client = LlmClient::new(
            "http://localhost:11434/v1/".into(),
            String::new(),
            "llama3.2".into(),
        );
        assert_eq!(client.api_url, "http://localhost:11434/v1");
    }
}
