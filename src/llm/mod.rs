//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use message::{Message, Role};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{
    generate_cancellable, GenerateRequest, GenerateResponse, ImageGenerator, LlmClient, LlmError,
    TextStream, TokenCounts,
};

/// 从模型回复中提取 JSON：优先取 ```json 代码块，其次普通代码块，最后取首个 `{` 到末个 `}` 之间的内容
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // 前后夹杂说明文字
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain() {
        let text = r#"{"selected": [1]}"#;
        assert_eq!(extract_json(text), text);
    }

    #[test]
    fn test_extract_json_fenced() {
        let text = "```json\n{\"selected\": []}\n```";
        assert_eq!(extract_json(text), r#"{"selected": []}"#);
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json(text), r#"{"a": 1}"#);
    }

    #[test]
    fn test_extract_json_with_leading_prose() {
        let text = "Sure! Here is the result: {\"a\": {\"b\": 2}} Hope this helps.";
        assert_eq!(extract_json(text), r#"{"a": {"b": 2}}"#);
    }
}
