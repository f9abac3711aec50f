//! 流水线过程事件：阶段开始/完成、叙述流式片段、中止与错误，供 REPL / 前端展示

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 回合阶段（固定顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreGeneration,
    Retrieval,
    Narrative,
    Classification,
    Translation,
    Image,
    PostGeneration,
}

impl Phase {
    pub const ORDER: [Phase; 7] = [
        Phase::PreGeneration,
        Phase::Retrieval,
        Phase::Narrative,
        Phase::Classification,
        Phase::Translation,
        Phase::Image,
        Phase::PostGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreGeneration => "pre_generation",
            Phase::Retrieval => "retrieval",
            Phase::Narrative => "narrative",
            Phase::Classification => "classification",
            Phase::Translation => "translation",
            Phase::Image => "image",
            Phase::PostGeneration => "post_generation",
        }
    }

    /// 可选阶段失败或跳过不影响回合
    pub fn is_optional(&self) -> bool {
        matches!(self, Phase::Classification | Phase::Translation | Phase::Image)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段被跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NotConfigured,
    InlineMode,
    Aborted,
    EmptyInput,
}

/// 单个阶段的过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PhaseStart {
        phase: Phase,
    },
    PhaseComplete {
        phase: Phase,
        /// 跳过时给出原因，正常完成时为 None
        #[serde(skip_serializing_if = "Option::is_none")]
        skipped_reason: Option<SkipReason>,
        duration_ms: u64,
    },
    /// 叙述的一小段（流式输出）
    NarrativeChunk { text: String },
    /// 观察到取消，阶段未开始或被中断
    Aborted { phase: Phase },
    /// fatal = false 表示回合继续，阶段输出退化为空/默认值
    Error {
        phase: Phase,
        message: String,
        fatal: bool,
    },
}

pub(crate) fn send_event(tx: Option<&UnboundedSender<PipelineEvent>>, ev: PipelineEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 单个阶段的执行记录（汇总到 TurnResult）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseReport {
    pub phase: Phase,
    pub skipped_reason: Option<SkipReason>,
    pub duration_ms: u64,
}

impl PhaseReport {
    pub fn skipped(&self) -> bool {
        self.skipped_reason.is_some()
    }
}
