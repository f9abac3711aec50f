//! 设定集分层检索
//!
//! - Tier 1：always 条目，无条件注入，按优先级降序
//! - Tier 2：keyword 条目，名字/关键词/别名在当前文本中以独立词出现
//! - Tier 3：relevant 条目，由 LLM 在未进入前两层的候选中挑选
//!
//! 选入 Tier 2/3 的条目在粘滞窗口内无需再次命中即可保留（reason = sticky）。

pub mod activation;
pub mod budget;
pub mod keyword;
pub mod relevance;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lore::{InjectionMode, LoreEntry};

pub use activation::{ActivationTracker, DEFAULT_STICKY_WINDOW};
pub use budget::{assemble_context, OmittedEntry, TokenEstimator};
pub use keyword::{first_match, term_matches};
pub use relevance::{LlmRelevanceSelector, RelevanceError, RelevanceSelector};

/// 条目被选中的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchReason {
    Keyword { keyword: String },
    Sticky { last_position: u64 },
    LlmSelected,
}

impl MatchReason {
    pub fn is_fresh(&self) -> bool {
        !matches!(self, MatchReason::Sticky { .. })
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchReason::Keyword { keyword } => write!(f, "matched: {keyword}"),
            MatchReason::Sticky { .. } => write!(f, "sticky"),
            MatchReason::LlmSelected => write!(f, "llm-selected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedEntry {
    pub entry: LoreEntry,
    pub match_reason: MatchReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub tier1: Vec<LoreEntry>,
    pub tier2: Vec<RetrievedEntry>,
    pub tier3: Vec<RetrievedEntry>,
    pub context_block: String,
    pub omitted: Vec<OmittedEntry>,
}

impl RetrievalResult {
    pub fn total(&self) -> usize {
        self.tier1.len() + self.tier2.len() + self.tier3.len()
    }
}

/// 检索参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalOptions {
    pub token_budget: usize,
    pub use_llm_relevance: bool,
    pub max_tier3: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            token_budget: 1500,
            use_llm_relevance: true,
            max_tier3: 5,
        }
    }
}

/// 一次检索的输入：当前文本（用户输入 + 最近叙述）与当前回合位置
#[derive(Debug, Clone, Copy)]
pub struct RetrievalRequest<'a> {
    pub text: &'a str,
    pub position: u64,
}

pub struct EntryRetrievalEngine {
    selector: Option<Arc<dyn RelevanceSelector>>,
    options: RetrievalOptions,
}

impl EntryRetrievalEngine {
    pub fn new(selector: Option<Arc<dyn RelevanceSelector>>, options: RetrievalOptions) -> Self {
        Self { selector, options }
    }

    /// 计算分层结果，并更新激活追踪（记录新选中的条目、清理过期记录）。
    /// 相关性判定失败或被取消时 Tier 3 只包含粘滞条目。
    pub async fn retrieve(
        &self,
        entries: &[LoreEntry],
        request: RetrievalRequest<'_>,
        tracker: &mut ActivationTracker,
        cancel: &CancellationToken,
    ) -> RetrievalResult {
        let position = request.position;
        let in_mode = move |mode: InjectionMode| entries.iter().filter(move |e| e.injection.mode == mode);

        // Tier 1 按优先级降序；Tier 2/3 保持存储顺序，关键词冲突时先出现的条目优先
        let mut tier1: Vec<LoreEntry> = in_mode(InjectionMode::Always).cloned().collect();
        tier1.sort_by(|a, b| b.injection.priority.cmp(&a.injection.priority));

        let mut tier2 = Vec::new();
        for entry in in_mode(InjectionMode::Keyword) {
            let reason = match first_match(entry, request.text) {
                Some(keyword) => MatchReason::Keyword { keyword },
                None => match sticky_reason(tracker, entry, position) {
                    Some(reason) => reason,
                    None => continue,
                },
            };
            tier2.push(RetrievedEntry {
                entry: entry.clone(),
                match_reason: reason,
            });
        }

        let mut tier3 = Vec::new();
        let mut candidates = Vec::new();
        for entry in in_mode(InjectionMode::Relevant) {
            match sticky_reason(tracker, entry, position) {
                Some(reason) => tier3.push(RetrievedEntry {
                    entry: entry.clone(),
                    match_reason: reason,
                }),
                None => candidates.push(entry.clone()),
            }
        }

        let remaining = self.options.max_tier3.saturating_sub(tier3.len());
        if let Some(selector) = self.selector.as_ref().filter(|_| self.options.use_llm_relevance) {
            if !candidates.is_empty() && remaining > 0 && !cancel.is_cancelled() {
                match selector.select(request.text, &candidates, remaining, cancel).await {
                    Ok(ids) => {
                        for id in ids {
                            if let Some(entry) = candidates.iter().find(|e| e.id == id) {
                                tier3.push(RetrievedEntry {
                                    entry: entry.clone(),
                                    match_reason: MatchReason::LlmSelected,
                                });
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "relevance selection failed, tier 3 limited to sticky entries"),
                }
            }
        }

        for retrieved in tier2.iter().chain(tier3.iter()) {
            if retrieved.match_reason.is_fresh() {
                tracker.record(&retrieved.entry.id, position);
            }
        }
        let pruned = tracker.prune(position);

        let (context_block, omitted) =
            assemble_context(&tier1, &tier2, &tier3, self.options.token_budget);
        debug!(
            tier1 = tier1.len(),
            tier2 = tier2.len(),
            tier3 = tier3.len(),
            omitted = omitted.len(),
            pruned,
            "lore retrieval complete"
        );

        RetrievalResult {
            tier1,
            tier2,
            tier3,
            context_block,
            omitted,
        }
    }
}

fn sticky_reason(tracker: &ActivationTracker, entry: &LoreEntry, position: u64) -> Option<MatchReason> {
    if tracker.is_sticky(&entry.id, position) {
        tracker
            .last_activation(&entry.id)
            .map(|last_position| MatchReason::Sticky { last_position })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::lore::LoreEntryType;

    fn lorebook() -> Vec<LoreEntry> {
        vec![
            LoreEntry::new("s1", "Setting", LoreEntryType::Concept)
                .with_mode(InjectionMode::Always, 1),
            LoreEntry::new("s1", "Magic Law", LoreEntryType::Concept)
                .with_mode(InjectionMode::Always, 9),
            LoreEntry::new("s1", "Captain Rhys", LoreEntryType::Character)
                .with_keywords(["rhys", "captain"])
                .with_mode(InjectionMode::Keyword, 0),
            LoreEntry::new("s1", "Old Lighthouse", LoreEntryType::Location)
                .with_keywords(["lighthouse"])
                .with_mode(InjectionMode::Keyword, 0),
            LoreEntry::new("s1", "The Sunken Crown", LoreEntryType::Item)
                .with_mode(InjectionMode::Relevant, 0),
            LoreEntry::new("s1", "Forbidden", LoreEntryType::Concept)
                .with_keywords(["captain"])
                .with_mode(InjectionMode::Never, 0),
        ]
    }

    fn engine_without_llm() -> EntryRetrievalEngine {
        EntryRetrievalEngine::new(None, RetrievalOptions::default())
    }

    #[tokio::test]
    async fn test_tiering() {
        let book = lorebook();
        let mut tracker = ActivationTracker::default();
        let result = engine_without_llm()
            .retrieve(
                &book,
                RetrievalRequest {
                    text: "The captain points at the horizon.",
                    position: 1,
                },
                &mut tracker,
                &CancellationToken::new(),
            )
            .await;

        let t1: Vec<_> = result.tier1.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(t1, vec!["Magic Law", "Setting"]);
        assert_eq!(result.tier2.len(), 1);
        assert_eq!(result.tier2[0].entry.name, "Captain Rhys");
        assert_eq!(result.tier2[0].match_reason.to_string(), "matched: captain");
        assert!(result.tier3.is_empty());
        assert!(!result.context_block.contains("Forbidden"));
    }

    #[tokio::test]
    async fn test_keyword_collision_keeps_storage_order_under_budget() {
        let book = vec![
            LoreEntry::new("s1", "Red Wyrm", LoreEntryType::Character)
                .with_keywords(["dragon"])
                .with_mode(InjectionMode::Keyword, 0),
            LoreEntry::new("s1", "Blue Wyrm", LoreEntryType::Character)
                .with_keywords(["dragon"])
                .with_mode(InjectionMode::Keyword, 5),
        ];
        // 每个条目约 5 token，预算只够放一个
        let engine = EntryRetrievalEngine::new(
            None,
            RetrievalOptions {
                token_budget: 8,
                use_llm_relevance: false,
                ..Default::default()
            },
        );
        let mut tracker = ActivationTracker::default();
        let r = engine
            .retrieve(
                &book,
                RetrievalRequest {
                    text: "A dragon circles the bay.",
                    position: 2,
                },
                &mut tracker,
                &CancellationToken::new(),
            )
            .await;

        let order: Vec<_> = r.tier2.iter().map(|e| e.entry.name.as_str()).collect();
        assert_eq!(order, vec!["Red Wyrm", "Blue Wyrm"]);
        let omitted: Vec<_> = r.omitted.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(omitted, vec!["Blue Wyrm"]);
        assert!(r.context_block.contains("Red Wyrm"));
        assert!(!r.context_block.contains("Blue Wyrm"));
    }

    #[tokio::test]
    async fn test_sticky_keyword_entry_stays_until_window_expires() {
        let book = lorebook();
        let engine = EntryRetrievalEngine::new(
            None,
            RetrievalOptions {
                use_llm_relevance: false,
                ..Default::default()
            },
        );
        let mut tracker = ActivationTracker::new(2);
        let token = CancellationToken::new();
        let retrieve = |text: &'static str, position: u64| RetrievalRequest { text, position };

        engine
            .retrieve(&book, retrieve("A lighthouse looms.", 3), &mut tracker, &token)
            .await;
        let r = engine
            .retrieve(&book, retrieve("Silence.", 5), &mut tracker, &token)
            .await;
        assert_eq!(r.tier2.len(), 1);
        assert_eq!(r.tier2[0].match_reason, MatchReason::Sticky { last_position: 3 });

        let r = engine
            .retrieve(&book, retrieve("Silence.", 6), &mut tracker, &token)
            .await;
        assert!(r.tier2.is_empty());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_llm_selection_and_failure() {
        let book = lorebook();
        let token = CancellationToken::new();

        let llm = Arc::new(ScriptedLlmClient::new(|_| Ok(r#"{"selected": [0]}"#.to_string())));
        let engine = EntryRetrievalEngine::new(
            Some(Arc::new(LlmRelevanceSelector::new(llm))),
            RetrievalOptions::default(),
        );
        let mut tracker = ActivationTracker::default();
        let r = engine
            .retrieve(&book, RetrievalRequest { text: "Waves.", position: 4 }, &mut tracker, &token)
            .await;
        assert_eq!(r.tier3.len(), 1);
        assert_eq!(r.tier3[0].entry.name, "The Sunken Crown");
        assert_eq!(r.tier3[0].match_reason.to_string(), "llm-selected");
        assert_eq!(tracker.last_activation(&r.tier3[0].entry.id), Some(4));

        let broken = Arc::new(ScriptedLlmClient::new(|_| Ok("garbage".to_string())));
        let engine = EntryRetrievalEngine::new(
            Some(Arc::new(LlmRelevanceSelector::new(broken))),
            RetrievalOptions::default(),
        );
        let mut fresh = ActivationTracker::default();
        let r = engine
            .retrieve(&book, RetrievalRequest { text: "Waves.", position: 4 }, &mut fresh, &token)
            .await;
        assert!(r.tier3.is_empty());
        assert_eq!(r.tier1.len(), 2);
    }
}
