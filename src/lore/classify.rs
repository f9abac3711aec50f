//! 设定集条目类型分类
//!
//! 导入的条目往往没有可靠类型。按固定大小分批并发调用 LLM，每批全部完成后再开始下一批；
//! LLM 失败时退回关键词启发式；取消令牌在批与批之间检查。

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{extract_json, generate_cancellable, GenerateRequest, LlmClient, LlmError, Message};
use crate::lore::{LoreEntry, LoreEntryType};

pub const DEFAULT_BATCH_SIZE: usize = 5;

const SYSTEM_PROMPT: &str = "You categorize entries of a story lorebook. \
Answer with ONLY a JSON object {\"type\": \"character|location|item|faction|concept|event\"}.";

/// 分类统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoreClassifyReport {
    pub by_llm: usize,
    pub by_heuristic: usize,
    /// 因取消而未处理的条目数
    pub skipped: usize,
}

pub struct LoreEntryClassifier {
    llm: Arc<dyn LlmClient>,
    batch_size: usize,
    model: Option<String>,
}

#[derive(Deserialize)]
struct TypeAnswer {
    #[serde(rename = "type")]
    entry_type: String,
}

impl LoreEntryClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, batch_size: usize) -> Self {
        Self {
            llm,
            batch_size: batch_size.max(1),
            model: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.is_empty());
        self
    }

    /// 原地写入每条条目的类型
    pub async fn classify_entries(
        &self,
        entries: &mut [LoreEntry],
        cancel: &CancellationToken,
    ) -> LoreClassifyReport {
        let mut report = LoreClassifyReport::default();
        let total = entries.len();

        for (batch_index, batch) in entries.chunks_mut(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                report.skipped = total - batch_index * self.batch_size;
                info!(skipped = report.skipped, "lore classification cancelled");
                break;
            }

            let answers = join_all(batch.iter().map(|e| self.classify_one(e, cancel))).await;
            for (entry, answer) in batch.iter_mut().zip(answers) {
                match answer {
                    Ok(t) => {
                        entry.entry_type = t;
                        report.by_llm += 1;
                    }
                    Err(e) => {
                        let t = heuristic_type(entry);
                        debug!(entry = %entry.name, error = %e, fallback = t.as_str(), "lore type via heuristic");
                        entry.entry_type = t;
                        report.by_heuristic += 1;
                    }
                }
            }
        }

        if report.by_heuristic > 0 {
            warn!(count = report.by_heuristic, "some lore entries classified heuristically");
        }
        report
    }

    async fn classify_one(
        &self,
        entry: &LoreEntry,
        cancel: &CancellationToken,
    ) -> Result<LoreEntryType, LlmError> {
        let mut request = GenerateRequest::new(vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(format!("Name: {}\nDescription: {}", entry.name, entry.description)),
        ])
        .with_temperature(0.0)
        .with_max_tokens(50);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let response = generate_cancellable(self.llm.as_ref(), request, cancel).await?;
        let answer: TypeAnswer = serde_json::from_str(extract_json(&response.content))
            .map_err(|e| LlmError::InvalidRequest(format!("unparseable answer: {e}")))?;
        LoreEntryType::parse(&answer.entry_type)
            .ok_or_else(|| LlmError::InvalidRequest(format!("unknown type '{}'", answer.entry_type)))
    }
}

const EVENT_WORDS: &[&str] = &["war", "battle", "festival", "ceremony", "siege", "rebellion", "coronation", "massacre"];
const FACTION_WORDS: &[&str] = &["guild", "order", "clan", "tribe", "faction", "army", "cult", "alliance", "brotherhood", "council"];
const LOCATION_WORDS: &[&str] = &[
    "city", "town", "village", "kingdom", "forest", "mountain", "river", "castle", "tavern", "inn",
    "temple", "realm", "island", "dungeon", "harbor", "valley",
];
const ITEM_WORDS: &[&str] = &[
    "sword", "blade", "ring", "amulet", "staff", "potion", "artifact", "weapon", "armor", "key",
    "shield", "tome", "relic",
];
const CHARACTER_WORDS: &[&str] = &["he", "she", "his", "her", "born", "warrior", "king", "queen", "captain", "mage", "knight"];

/// 关键词启发式：按事件、组织、地点、物品、人物的顺序检查词表，都不命中时为概念
pub fn heuristic_type(entry: &LoreEntry) -> LoreEntryType {
    let text = format!("{} {}", entry.name, entry.description).to_lowercase();
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let hit = |list: &[&str]| words.iter().any(|w| list.contains(w));

    if hit(EVENT_WORDS) {
        LoreEntryType::Event
    } else if hit(FACTION_WORDS) {
        LoreEntryType::Faction
    } else if hit(LOCATION_WORDS) {
        LoreEntryType::Location
    } else if hit(ITEM_WORDS) {
        LoreEntryType::Item
    } else if hit(CHARACTER_WORDS) {
        LoreEntryType::Character
    } else {
        LoreEntryType::Concept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use std::time::Duration;

    fn entries(n: usize) -> Vec<LoreEntry> {
        (0..n)
            .map(|i| LoreEntry::new("s1", format!("Entry {i}"), LoreEntryType::Concept))
            .collect()
    }

    #[tokio::test]
    async fn test_batches_never_exceed_batch_size() {
        let llm = Arc::new(
            ScriptedLlmClient::new(|_| Ok(r#"{"type": "faction"}"#.to_string()))
                .with_delay(Duration::from_millis(20)),
        );
        let classifier = LoreEntryClassifier::new(llm.clone(), 5);
        let mut list = entries(12);

        let report = classifier
            .classify_entries(&mut list, &CancellationToken::new())
            .await;
        assert_eq!(report.by_llm, 12);
        assert_eq!(llm.calls(), 12);
        assert!(llm.max_in_flight() <= 5);
        assert!(llm.max_in_flight() > 1);
        assert!(list.iter().all(|e| e.entry_type == LoreEntryType::Faction));
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_heuristic() {
        let llm = Arc::new(ScriptedLlmClient::new(|_| Ok("no idea".to_string())));
        let classifier = LoreEntryClassifier::new(llm, 5);
        let mut list = vec![
            LoreEntry::new("s1", "Thornwall", LoreEntryType::Concept)
                .with_description("A walled town on the river."),
            LoreEntry::new("s1", "Silver Blade", LoreEntryType::Concept),
        ];
        let report = classifier
            .classify_entries(&mut list, &CancellationToken::new())
            .await;
        assert_eq!(report.by_heuristic, 2);
        assert_eq!(list[0].entry_type, LoreEntryType::Location);
        assert_eq!(list[1].entry_type, LoreEntryType::Item);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let llm = Arc::new(ScriptedLlmClient::new(|_| Ok(r#"{"type":"item"}"#.to_string())));
        let classifier = LoreEntryClassifier::new(llm.clone(), 5);
        let token = CancellationToken::new();
        token.cancel();
        let mut list = entries(7);
        let report = classifier.classify_entries(&mut list, &token).await;
        assert_eq!(report.skipped, 7);
        assert_eq!(llm.calls(), 0);
    }

    #[test]
    fn test_heuristic_defaults_to_concept() {
        let e = LoreEntry::new("s1", "Aether", LoreEntryType::Item)
            .with_description("The invisible force binding all magic.");
        assert_eq!(heuristic_type(&e), LoreEntryType::Concept);
    }
}
