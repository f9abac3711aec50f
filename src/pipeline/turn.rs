//! 回合的输入/输出契约与重试备份

use serde::Serialize;

use crate::classifier::ClassificationResult;
use crate::pipeline::events::PhaseReport;
use crate::retrieval::{ActivationTracker, RetrievalResult};
use crate::store::StorySnapshot;
use crate::world::{EntityId, StoryEntry, WorldStateDelta};

/// PreGeneration 捕获的重试备份：不含章节的快照 + 激活追踪状态 + 本回合首个位置
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBackup {
    pub user_input: String,
    pub first_position: u64,
    pub snapshot: StorySnapshot,
    pub tracker: ActivationTracker,
}

/// 一个回合的汇总结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub user_entry: StoryEntry,
    pub narration_entry: StoryEntry,
    pub retrieval: RetrievalResult,
    /// 分类被跳过或失败时为 None
    pub classification: Option<ClassificationResult>,
    pub delta: Option<WorldStateDelta>,
    pub translation: Option<String>,
    /// 图片在后台生成，完成后通过事件总线发出 ImageReady
    pub image_pending: bool,
    pub auto_checkpoint_id: Option<EntityId>,
    pub phases: Vec<PhaseReport>,
}

impl TurnResult {
    pub fn phase(&self, phase: crate::pipeline::Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|r| r.phase == phase)
    }
}
