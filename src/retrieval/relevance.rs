//! Tier 3 相关性判定
//!
//! 用 LLM 在候选条目中挑出与当前文本语义相关、但未被关键词命中的条目。
//! 回复中的条目可以是候选序号，也可以是条目名。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{extract_json, generate_cancellable, GenerateRequest, LlmClient, LlmError, Message};
use crate::lore::LoreEntry;
use crate::world::EntityId;

#[derive(Debug, Error)]
pub enum RelevanceError {
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("failed to parse relevance response: {0}")]
    Parse(String),
}

#[async_trait]
pub trait RelevanceSelector: Send + Sync {
    /// 返回被选中条目的 id（至多 max 个，按模型给出的顺序）
    async fn select(
        &self,
        text: &str,
        candidates: &[LoreEntry],
        max: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<EntityId>, RelevanceError>;
}

pub struct LlmRelevanceSelector {
    llm: Arc<dyn LlmClient>,
    model: Option<String>,
}

impl LlmRelevanceSelector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm, model: None }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.is_empty());
        self
    }
}

#[async_trait]
impl RelevanceSelector for LlmRelevanceSelector {
    async fn select(
        &self,
        text: &str,
        candidates: &[LoreEntry],
        max: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<EntityId>, RelevanceError> {
        if candidates.is_empty() || max == 0 {
            return Ok(Vec::new());
        }

        let listing = candidates
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let summary: String = e.description.chars().take(160).collect();
                format!("{i}. {} ({}): {summary}", e.name, e.entry_type.as_str())
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "## Current scene\n{text}\n\n## Lorebook candidates\n{listing}\n\n\
             Pick at most {max} candidates that are relevant to the scene even if not named in it."
        );

        let mut request = GenerateRequest::new(vec![
            Message::system(
                "You select background knowledge for a story. Respond with ONLY a JSON object \
                 {\"selected\": [<candidate numbers>]}. Return an empty array if nothing is relevant.",
            ),
            Message::user(prompt),
        ])
        .with_temperature(0.0)
        .with_max_tokens(200);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let response = generate_cancellable(self.llm.as_ref(), request, cancel).await?;
        parse_selection(&response.content, candidates, max)
    }
}

/// 解析 `{"selected": [...]}`：数字按候选序号，字符串按条目名（大小写不敏感）；去重并截断到 max
pub fn parse_selection(
    response: &str,
    candidates: &[LoreEntry],
    max: usize,
) -> Result<Vec<EntityId>, RelevanceError> {
    let json = extract_json(response);
    let value: Value =
        serde_json::from_str(json).map_err(|e| RelevanceError::Parse(format!("{e}: {json}")))?;
    let Some(items) = value.get("selected").and_then(Value::as_array) else {
        return Err(RelevanceError::Parse("missing 'selected' array".to_string()));
    };

    let mut ids: Vec<EntityId> = Vec::new();
    for item in items {
        let found = match item {
            Value::Number(n) => n
                .as_u64()
                .and_then(|i| candidates.get(i as usize)),
            Value::String(name) => candidates
                .iter()
                .find(|e| e.name.eq_ignore_ascii_case(name.trim())),
            _ => None,
        };
        if let Some(entry) = found {
            if !ids.contains(&entry.id) {
                ids.push(entry.id.clone());
            }
        }
        if ids.len() >= max {
            break;
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::lore::LoreEntryType;

    fn candidates() -> Vec<LoreEntry> {
        vec![
            LoreEntry::new("s1", "Tidecallers", LoreEntryType::Faction),
            LoreEntry::new("s1", "The Drowning", LoreEntryType::Event),
            LoreEntry::new("s1", "Saltglass", LoreEntryType::Item),
        ]
    }

    #[test]
    fn test_parse_indices_and_names() {
        let c = candidates();
        let ids = parse_selection(r#"{"selected": [2, "tidecallers", 2, 99]}"#, &c, 5).unwrap();
        assert_eq!(ids, vec![c[2].id.clone(), c[0].id.clone()]);
    }

    #[test]
    fn test_parse_truncates_to_max() {
        let c = candidates();
        let ids = parse_selection(r#"{"selected": [0, 1, 2]}"#, &c, 2).unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_parse_errors() {
        let c = candidates();
        assert!(parse_selection("nothing relevant", &c, 3).is_err());
        assert!(parse_selection(r#"{"picked": []}"#, &c, 3).is_err());
    }

    #[tokio::test]
    async fn test_empty_candidates_skip_llm() {
        let llm = Arc::new(ScriptedLlmClient::new(|_| Ok("{}".into())));
        let selector = LlmRelevanceSelector::new(llm.clone());
        let ids = selector
            .select("text", &[], 3, &CancellationToken::new())
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert_eq!(llm.calls(), 0);
    }
}
