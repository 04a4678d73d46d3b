//! Language-model client used for embeddings, query rewriting and re-ranking.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};

use crate::config::OpenAiConfig;

#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub instructions: &'a str,
    pub input: &'a str,
    pub temperature: f32,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Text of the first choice of a system + user chat completion.
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    embedding_model: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiClient {
    pub fn new(config: &OpenAiConfig, timeout: Duration) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let mut auth: header::HeaderValue = format!("Bearer {}", config.api_key)
            .parse()
            .context("OPENAI_API_KEY is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build language model http client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {} failed", path))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            bail!("{} returned {}: {}", path, status, detail);
        }

        response
            .json()
            .await
            .with_context(|| format!("failed to parse {} response", path))
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String> {
        let body = ChatCompletionBody {
            model: request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: request.instructions,
                },
                ChatMessage {
                    role: "user",
                    content: request.input,
                },
            ],
            temperature: request.temperature,
        };

        let response: ChatCompletionResponse = self.post("chat/completions", &body).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| anyhow!("completion returned no content"))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingBody {
            model: &self.embedding_model,
            input: text,
        };

        let response: EmbeddingResponse = self.post("embeddings", &body).await?;
        response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| anyhow!("embedding response was empty"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_body_shape() {
        let body = ChatCompletionBody {
            model: "gpt-test",
            messages: [
                ChatMessage {
                    role: "system",
                    content: "rewrite",
                },
                ChatMessage {
                    role: "user",
                    content: "where is lunch",
                },
            ],
            temperature: 0.5,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "where is lunch");
        assert_eq!(value["temperature"], 0.5);
    }

    #[test]
    fn completion_response_parses_null_content() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
