//! Mock / 脚本化 LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - MockLlmClient：对叙述请求回显用户最后一条消息，对要求 JSON 的请求返回 `{}`
//! - ScriptedLlmClient：由闭包决定每次回复，记录调用次数与最大并发，可注入延迟

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{GenerateRequest, GenerateResponse, LlmClient, LlmError, TextStream};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let wants_json = request
            .system_prompt()
            .map(|s| s.contains("JSON"))
            .unwrap_or(false);
        if wants_json {
            return Ok(GenerateResponse {
                content: "{}".to_string(),
                usage: None,
            });
        }

        let last_user = request.last_user().unwrap_or("(no input)");
        Ok(GenerateResponse {
            content: format!("The story continues. You {}.", last_user.trim_end_matches('.')),
            usage: None,
        })
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<TextStream, LlmError> {
        let content = self.generate(request).await?.content;
        Ok(word_chunks(content))
    }
}

type Responder = dyn Fn(&GenerateRequest) -> Result<String, LlmError> + Send + Sync;

/// 脚本化客户端：测试中精确控制每次 LLM 回复
pub struct ScriptedLlmClient {
    responder: Arc<Responder>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&GenerateRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// 每次调用前等待一段时间（模拟慢请求，便于测试取消与并发）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 观测到的最大同时进行中的调用数
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = (self.responder)(&request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result.map(|content| GenerateResponse {
            content,
            usage: None,
        })
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<TextStream, LlmError> {
        let content = self.generate(request).await?.content;
        Ok(word_chunks(content))
    }
}

/// 按词切分为流式块（保留空白，拼接后与原文一致）
fn word_chunks(content: String) -> TextStream {
    let chunks: Vec<Result<String, LlmError>> = content
        .split_inclusive(' ')
        .map(|s| Ok(s.to_string()))
        .collect();
    Box::pin(stream::iter(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_mock_returns_empty_json_for_json_tasks() {
        let llm = MockLlmClient;
        let req = GenerateRequest::new(vec![
            Message::system("Respond with JSON only."),
            Message::user("anything"),
        ]);
        assert_eq!(llm.generate(req).await.unwrap().content, "{}");
    }

    #[tokio::test]
    async fn test_scripted_stream_concatenates_to_full_text() {
        let llm = ScriptedLlmClient::new(|_| Ok("the tide rolls in".to_string()));
        let mut stream = llm
            .generate_stream(GenerateRequest::new(vec![Message::user("go")]))
            .await
            .unwrap();
        let mut text = String::new();
        let mut chunks = 0;
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk.unwrap());
            chunks += 1;
        }
        assert_eq!(text, "the tide rolls in");
        assert_eq!(chunks, 4);
        assert_eq!(llm.calls(), 1);
    }
}
