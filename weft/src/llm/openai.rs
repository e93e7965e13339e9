//! OpenAI-compatible chat completions client (`POST {base_url}/chat/completions`).
//!
//! Streaming uses server-sent events: `data: {json}` lines, terminated by `data: [DONE]`.
//! Works with any endpoint that speaks the same protocol (set `OPENAI_BASE_URL`).

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::llm::{LlmClient, LlmError, LlmResponse, LlmUsage};
use crate::message::Message;
use crate::stream::MessageChunk;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Clone, Debug)]
pub struct ChatOpenAI {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
}

impl ChatOpenAI {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: model.into(),
            temperature: None,
        }
    }

    /// Reads `OPENAI_API_KEY` (required), `OPENAI_BASE_URL` and `OPENAI_MODEL`.
    ///
    /// Call [`env_config::load_and_apply`] first to pick up `.env` and XDG values.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LlmError::Config("OPENAI_API_KEY is not set".to_string()))?;
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let mut llm = Self::new(model).with_api_key(api_key);
        if let Ok(base) = std::env::var("OPENAI_BASE_URL") {
            llm = llm.with_base_url(base);
        }
        Ok(llm)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, messages: &[Message], stream: bool) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role(), "content": m.content()}))
            .collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

fn parse_usage(v: &Value) -> Option<LlmUsage> {
    serde_json::from_value(v.get("usage")?.clone()).ok()
}

/// One decoded SSE line.
#[derive(Debug, PartialEq)]
enum SseLine {
    Delta {
        content: Option<String>,
        usage: Option<LlmUsage>,
    },
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let v: Value = serde_json::from_str(data).map_err(|e| LlmError::Decode(e.to_string()))?;
    let content = v
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Ok(SseLine::Delta {
        content,
        usage: parse_usage(&v),
    })
}

#[async_trait]
impl LlmClient for ChatOpenAI {
    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, LlmError> {
        let resp = self.post(&self.request_body(messages, false)).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;
        let content = v
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::Decode("missing choices[0].message.content".to_string()))?
            .to_string();
        tracing::debug!(model = %self.model, chars = content.len(), "chat completion received");
        Ok(LlmResponse {
            content,
            usage: parse_usage(&v),
        })
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<LlmResponse, LlmError> {
        let Some(tx) = chunk_tx else {
            return self.invoke(messages).await;
        };
        let resp = self.post(&self.request_body(messages, true)).await?;
        let mut bytes = resp.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut usage = None;

        'read: while let Some(piece) = bytes.next().await {
            let piece = piece.map_err(|e| LlmError::Request(e.to_string()))?;
            pending.extend_from_slice(&piece);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                match parse_sse_line(String::from_utf8_lossy(&line).trim_end())? {
                    SseLine::Done => break 'read,
                    SseLine::Skip => {}
                    SseLine::Delta {
                        content: delta,
                        usage: u,
                    } => {
                        if u.is_some() {
                            usage = u;
                        }
                        if let Some(delta) = delta {
                            content.push_str(&delta);
                            if tx.send(MessageChunk::new(delta)).await.is_err() {
                                tracing::debug!("stream receiver closed; stopping completion");
                                break 'read;
                            }
                        }
                    }
                }
            }
        }
        Ok(LlmResponse { content, usage })
    }
}
