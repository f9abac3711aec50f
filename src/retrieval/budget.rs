//! Token 预算控制
//!
//! 按 Tier 顺序拼接上下文块。Tier 1 无条件进入；Tier 2、Tier 3 依次贪心放入剩余预算，
//! 放不下的条目记入 omitted（之后更短的条目仍可继续放入）。

use serde::Serialize;

use crate::lore::LoreEntry;
use crate::retrieval::RetrievedEntry;
use crate::world::EntityId;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }
        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}

/// 因预算不足未注入的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OmittedEntry {
    pub id: EntityId,
    pub name: String,
    pub estimated_tokens: usize,
}

/// 条目在上下文块中的文本形式
pub fn render_entry(entry: &LoreEntry) -> String {
    let description = entry.description.trim();
    if description.is_empty() {
        format!("[{}] {}", entry.entry_type.as_str(), entry.name)
    } else {
        format!("[{}] {}: {}", entry.entry_type.as_str(), entry.name, description)
    }
}

/// 拼接上下文块，返回 (文本, 未放入的条目)
pub fn assemble_context(
    tier1: &[LoreEntry],
    tier2: &[RetrievedEntry],
    tier3: &[RetrievedEntry],
    budget: usize,
) -> (String, Vec<OmittedEntry>) {
    let mut lines = Vec::new();
    let mut used = 0usize;
    let mut omitted = Vec::new();

    for entry in tier1 {
        let line = render_entry(entry);
        used += TokenEstimator::estimate(&line);
        lines.push(line);
    }

    for retrieved in tier2.iter().chain(tier3) {
        let line = render_entry(&retrieved.entry);
        let cost = TokenEstimator::estimate(&line);
        if used + cost <= budget {
            used += cost;
            lines.push(line);
        } else {
            omitted.push(OmittedEntry {
                id: retrieved.entry.id.clone(),
                name: retrieved.entry.name.clone(),
                estimated_tokens: cost,
            });
        }
    }

    (lines.join("\n"), omitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lore::LoreEntryType;
    use crate::retrieval::MatchReason;

    #[test]
    fn test_token_estimation() {
        assert_eq!(TokenEstimator::estimate("Hello world!"), 3);
        assert!(TokenEstimator::estimate("你好世界") >= 2);
        assert_eq!(TokenEstimator::estimate(""), 1);
    }

    fn retrieved(name: &str, description: &str) -> RetrievedEntry {
        RetrievedEntry {
            entry: LoreEntry::new("s1", name, LoreEntryType::Concept).with_description(description),
            match_reason: MatchReason::Keyword {
                keyword: name.to_lowercase(),
            },
        }
    }

    #[test]
    fn test_tier1_always_included_and_overflow_omitted() {
        let always = LoreEntry::new("s1", "World", LoreEntryType::Concept)
            .with_description("A drowned world of islands and storms.");
        let small = retrieved("Gull", "A bird.");
        let large = retrieved("Archive", &"Very long history. ".repeat(40));

        let (block, omitted) = assemble_context(&[always], &[large.clone()], &[small], 20);
        assert!(block.starts_with("[concept] World:"));
        assert!(block.contains("Gull"));
        assert!(!block.contains("Archive"));
        assert_eq!(omitted.len(), 1);
        assert_eq!(omitted[0].name, "Archive");
    }
}
