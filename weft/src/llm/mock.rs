//! Scripted LLM for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::llm::{LlmClient, LlmError, LlmResponse};
use crate::message::Message;
use crate::stream::MessageChunk;

/// Replies with scripted responses in order, one per call.
///
/// With [`chunked`](MockLlm::chunked), streaming calls split the reply into pieces of the
/// given size (in chars), which exercises incremental parsing.
#[derive(Debug, Default)]
pub struct MockLlm {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    repeat: Option<String>,
    chunk_size: Option<usize>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockLlm {
    /// Replies with each response once, in order; further calls fail with
    /// [`LlmError::Exhausted`].
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(|s| Ok(s.into())).collect()),
            ..Self::default()
        }
    }

    /// Replies with `content` on every call.
    pub fn with_reply(content: impl Into<String>) -> Self {
        Self {
            repeat: Some(content.into()),
            ..Self::default()
        }
    }

    /// Queues a failure as the next scripted step.
    pub fn then_error(self, error: LlmError) -> Self {
        self.lock_script().push_back(Err(error));
        self
    }

    /// Queues another reply.
    pub fn then_reply(self, content: impl Into<String>) -> Self {
        self.lock_script().push_back(Ok(content.into()));
        self
    }

    pub fn chunked(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages received by each call so far.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_reply(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        match self.lock_script().pop_front() {
            Some(step) => step,
            None => self.repeat.clone().ok_or(LlmError::Exhausted),
        }
    }
}

fn split_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, LlmError> {
        Ok(LlmResponse {
            content: self.next_reply(messages)?,
            usage: None,
        })
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<LlmResponse, LlmError> {
        let content = self.next_reply(messages)?;
        if let Some(tx) = chunk_tx {
            let pieces = match self.chunk_size {
                Some(size) => split_chars(&content, size),
                None => vec![content.clone()],
            };
            for piece in pieces.into_iter().filter(|p| !p.is_empty()) {
                if tx.send(MessageChunk::new(piece)).await.is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        Ok(LlmResponse {
            content,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_in_order_then_exhausts() {
        let llm = MockLlm::new(["a", "b"]);
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "a");
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "b");
        assert_eq!(llm.invoke(&[]).await.unwrap_err(), LlmError::Exhausted);
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn with_reply_repeats_after_script() {
        let llm = MockLlm::with_reply("same").then_error(LlmError::Request("down".into()));
        assert!(llm.invoke(&[]).await.is_err());
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "same");
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "same");
    }

    #[tokio::test]
    async fn chunked_stream_splits_reply() {
        let llm = MockLlm::new(["abcdefg"]).chunked(3);
        let (tx, mut rx) = mpsc::channel(8);
        let resp = llm.invoke_stream(&[Message::user("q")], Some(tx)).await.unwrap();
        assert_eq!(resp.content, "abcdefg");
        let mut got = Vec::new();
        while let Some(c) = rx.recv().await {
            got.push(c.content);
        }
        assert_eq!(got, vec!["abc", "def", "g"]);
        assert_eq!(llm.requests(), vec![vec![Message::user("q")]]);
    }
}
