//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 脚本化）实现 LlmClient：generate（非流式）、generate_stream（流式文本块）。
//! 流水线中的每次调用都通过 [`generate_cancellable`] 与取消令牌赛跑。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use tokio_util::sync::CancellationToken;

use crate::llm::Message;

/// LLM 层错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("empty response from model")]
    EmptyResponse,

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenCounts {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// 生成请求：model / messages / temperature / max_tokens / extra_body
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// 为空时使用客户端默认模型
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// 透传给兼容端点的附加字段（部分后端忽略）
    pub extra_body: Option<serde_json::Value>,
}

impl GenerateRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.is_empty() {
            self.model = Some(model);
        }
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_extra_body(mut self, extra: serde_json::Value) -> Self {
        self.extra_body = Some(extra);
        self
    }

    /// 第一条 system 消息内容（Mock 客户端据此判断任务类型）
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == crate::llm::Role::System)
            .map(|m| m.content.as_str())
    }

    /// 最后一条 user 消息内容
    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::llm::Role::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    pub content: String,
    pub usage: Option<TokenCounts>,
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式生成
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError>;

    /// 流式生成，默认退化为一次性返回整段内容
    async fn generate_stream(&self, request: GenerateRequest) -> Result<TextStream, LlmError> {
        let response = self.generate(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(response.content)])))
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 与取消令牌赛跑的 generate；令牌先触发时丢弃进行中的请求并返回 `LlmError::Cancelled`
pub async fn generate_cancellable(
    llm: &dyn LlmClient,
    request: GenerateRequest,
    cancel: &CancellationToken,
) -> Result<GenerateResponse, LlmError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        result = llm.generate(request) => result,
    }
}

/// 图片生成器（Image 阶段的外部协作者），返回图片引用（URL 或存储 key）
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_returns_cancelled_when_token_fired() {
        let slow = ScriptedLlmClient::new(|_| Ok("late".to_string()))
            .with_delay(Duration::from_secs(5));
        let token = CancellationToken::new();
        token.cancel();
        let result =
            generate_cancellable(&slow, GenerateRequest::new(vec![Message::user("x")]), &token)
                .await;
        assert!(matches!(result, Err(LlmError::Cancelled)));
    }

    #[test]
    fn test_request_builder_ignores_empty_model() {
        let req = GenerateRequest::new(vec![]).with_model("");
        assert!(req.model.is_none());
        let req = req.with_model("gpt-4o-mini").with_temperature(0.2);
        assert_eq!(req.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(req.temperature, Some(0.2));
    }
}
