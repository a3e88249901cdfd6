//! OpenAI-compatible chat completion client used as the default generation
//! backend. Prompt shaping stays minimal: the conversation context is replayed
//! as chat turns and the trigger message comes last.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::memory::Message;
use crate::orchestrator::{GenerationBackend, GenerationRequest};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

pub struct HttpGenerationBackend {
    backend_url: String,
    model: String,
    agent_id: String,
    max_tokens: u32,
    temperature: f32,
    http_client: reqwest::Client,
}

impl HttpGenerationBackend {
    pub fn new(backend_url: &str, model: &str, agent_id: &str, request_timeout: Duration) -> Self {
        info!("Generation backend initialized: {} (model {})", backend_url, model);
        Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            agent_id: agent_id.to_string(),
            max_tokens: 512,
            temperature: 0.7,
            http_client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn to_chat_message(&self, message: &Message) -> ChatMessage {
        if message.sender_id == self.agent_id {
            ChatMessage { role: "assistant".to_string(), content: message.text.clone() }
        } else {
            ChatMessage {
                role: "user".to_string(),
                content: format!("{}: {}", message.sender_id, message.text),
            }
        }
    }

    fn build_messages(&self, request: &GenerationRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.context.len() + 2);
        let mut system = format!(
            "You are {} in a group conversation. Reply briefly to the last message, or reply with nothing if there is nothing worth saying.",
            self.agent_id
        );
        if !request.recent_replies.is_empty() {
            system.push_str("\nAvoid repeating your recent replies:");
            for reply in &request.recent_replies {
                system.push_str("\n- ");
                system.push_str(reply);
            }
        }
        messages.push(ChatMessage { role: "system".to_string(), content: system });
        messages.extend(request.context.iter().map(|m| self.to_chat_message(m)));
        messages.push(self.to_chat_message(&request.trigger));
        messages
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn generate_reply(&self, request: &GenerationRequest) -> anyhow::Result<Option<String>> {
        debug!(
            "[{}] requesting completion for {} with {} context messages",
            request.conversation_id,
            request.thinking_id,
            request.context.len()
        );
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: self.build_messages(request),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };

        let response = self
            .http_client
            .post(self.completions_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("generation backend request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("generation backend returned {}: {}", status, body));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to parse generation response: {}", e))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content.trim().to_string())
            .filter(|c| !c.is_empty());
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(context: Vec<Message>) -> GenerationRequest {
        GenerationRequest {
            conversation_id: "conv".into(),
            thinking_id: "tid-1".into(),
            trigger: Message::new("m9", "conv", "alice", "what do you think?", Utc::now()),
            context,
            recent_replies: vec!["earlier reply".into()],
        }
    }

    #[test]
    fn test_build_messages_roles() {
        let backend = HttpGenerationBackend::new("http://localhost:1/", "m", "agent", Duration::from_secs(5));
        let context = vec![
            Message::new("m1", "conv", "alice", "hi", Utc::now()),
            Message::new("m2", "conv", "agent", "hello", Utc::now()),
        ];
        let messages = backend.build_messages(&request(context));

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("earlier reply"));
        assert_eq!(messages[1], ChatMessage { role: "user".into(), content: "alice: hi".into() });
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3].content, "alice: what do you think?");
        assert_eq!(backend.completions_url(), "http://localhost:1/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_generate_reply_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("content-type", "application/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"  sounds good  "}}]}"#)
            .create_async()
            .await;

        let backend = HttpGenerationBackend::new(&server.url(), "local-llm", "agent", Duration::from_secs(5));
        let reply = backend.generate_reply(&request(Vec::new())).await.unwrap();

        assert_eq!(reply.as_deref(), Some("sounds good"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_completion_is_none() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let backend = HttpGenerationBackend::new(&server.url(), "local-llm", "agent", Duration::from_secs(5));
        assert_eq!(backend.generate_reply(&request(Vec::new())).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("loading model")
            .create_async()
            .await;

        let backend = HttpGenerationBackend::new(&server.url(), "local-llm", "agent", Duration::from_secs(5));
        let err = backend.generate_reply(&request(Vec::new())).await.unwrap_err();
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("loading model"));
    }
}
