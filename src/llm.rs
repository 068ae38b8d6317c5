//! LLM collaborator
//!
//! The harness treats the model as a black box: messages in, text out, with
//! token accounting and an optional reasoning trace. `OpenAiClient` talks to
//! any OpenAI-compatible `/chat/completions` endpoint; tests plug in scripted
//! implementations of `LanguageModel`.

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// Single user turn, the shape every harness prompt uses.
    pub fn prompt(model: &str, prompt: impl Into<String>, temperature: f32) -> Self {
        Self {
            messages: vec![ChatMessage::user(prompt)],
            model: model.to_string(),
            temperature,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Text of the last user message.
    pub fn last_user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning: Option<String>,
    pub text: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Model names used by the harness roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoles {
    /// Sub-question generation, exploration, aggregation.
    pub reasoning: String,
    /// Repair and schema-linking sampling.
    pub base: String,
    /// Extraction and completion sub-calls.
    pub tool: String,
}

impl ModelRoles {
    pub fn from_env() -> Self {
        let base = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        Self {
            reasoning: std::env::var("REASONING_MODEL").unwrap_or_else(|_| base.clone()),
            tool: std::env::var("TOOL_MODEL").unwrap_or_else(|_| base.clone()),
            base,
        }
    }

    pub fn uniform(model: &str) -> Self {
        Self {
            reasoning: model.to_string(),
            base: model.to_string(),
            tool: model.to_string(),
        }
    }
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    transcript: Option<TranscriptLogger>,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HarnessError::Llm(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            transcript: None,
        })
    }

    /// `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `LLM_TRANSCRIPT`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| HarnessError::Config("OPENAI_API_KEY is not set".to_string()))?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let mut client = Self::new(api_key, base_url)?;
        if let Ok(path) = std::env::var("LLM_TRANSCRIPT") {
            client.transcript = Some(TranscriptLogger::new(PathBuf::from(path)));
        }
        Ok(client)
    }

    pub fn with_transcript(mut self, transcript: TranscriptLogger) -> Self {
        self.transcript = Some(transcript);
        self
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let started = Instant::now();
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| HarnessError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HarnessError::Llm(format!("LLM API returned {}: {}", status, text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| HarnessError::Llm(format!("Failed to parse LLM response: {}", e)))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::Llm("No choices in LLM response".to_string()))?;
        let text = choice
            .message
            .content
            .ok_or_else(|| HarnessError::Llm("No content in LLM response".to_string()))?;

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        let completion = Completion {
            input_tokens,
            output_tokens,
            reasoning: choice.message.reasoning_content,
            text,
        };
        debug!(
            "LLM {} answered in {:.2}s ({} in / {} out tokens)",
            request.model,
            started.elapsed().as_secs_f64(),
            input_tokens,
            output_tokens
        );
        if let Some(transcript) = &self.transcript {
            transcript.record(request, &completion, started.elapsed());
        }
        Ok(completion)
    }
}

/// Appends one JSON line per model call: timestamp, session, model, prompt,
/// answer, token counts and latency.
pub struct TranscriptLogger {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

#[derive(Serialize)]
struct TranscriptLine<'a> {
    timestamp: String,
    session_id: &'a str,
    model: &'a str,
    temperature: f32,
    prompt: &'a str,
    response: &'a str,
    input_tokens: u64,
    output_tokens: u64,
    elapsed_ms: u128,
}

impl TranscriptLogger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            session_id: uuid::Uuid::new_v4().to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn record(&self, request: &CompletionRequest, completion: &Completion, elapsed: Duration) {
        let line = TranscriptLine {
            timestamp: Utc::now().to_rfc3339(),
            session_id: &self.session_id,
            model: &request.model,
            temperature: request.temperature,
            prompt: request.last_user_text(),
            response: &completion.text,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            elapsed_ms: elapsed.as_millis(),
        };
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let written = serde_json::to_string(&line)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
                writeln!(file, "{}", json)
            });
        if let Err(e) = written {
            warn!("Failed to write LLM transcript {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_user_text() {
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system("be terse"),
                ChatMessage::user("first"),
                ChatMessage::assistant("ok"),
                ChatMessage::user("second"),
            ],
            model: "m".to_string(),
            temperature: 0.0,
            max_tokens: None,
        };
        assert_eq!(request.last_user_text(), "second");
    }

    #[test]
    fn test_transcript_appends_lines() {
        let path = std::env::temp_dir()
            .join(format!("sqlrefine_transcript_{}", uuid::Uuid::new_v4()))
            .join("calls.jsonl");
        let logger = TranscriptLogger::new(path.clone());
        let request = CompletionRequest::prompt("m", "hello", 0.2).with_max_tokens(10);
        let completion = Completion { text: "world".to_string(), ..Default::default() };
        logger.record(&request, &completion, Duration::from_millis(5));
        logger.record(&request, &completion, Duration::from_millis(7));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["prompt"], "hello");
        assert_eq!(first["session_id"], logger.session_id());
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
