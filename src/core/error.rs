//! 流水线错误类型
//!
//! 只有致命失败会以 Err 返回：叙述失败、中止、PreGeneration 的存储错误。
//! 分类 / 翻译 / 图片的失败以非致命 error 事件报告，不会出现在这里。

use thiserror::Error;

use crate::pipeline::{Phase, RetryBackup};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("user input is empty")]
    EmptyInput,

    /// 取消令牌在必需阶段之前或之中触发；备份存在时可用 restore_backup 撤销已写入的条目
    #[error("turn aborted at {phase}")]
    Aborted {
        phase: Phase,
        backup: Option<Box<RetryBackup>>,
    },

    #[error("narrative generation failed: {message}")]
    NarrativeFailed {
        message: String,
        backup: Box<RetryBackup>,
    },

    #[error("no retry backup available")]
    NoBackup,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// 本回合 PreGeneration 捕获的备份（若已捕获）
    pub fn backup(&self) -> Option<&RetryBackup> {
        match self {
            PipelineError::Aborted { backup, .. } => backup.as_deref(),
            PipelineError::NarrativeFailed { backup, .. } => Some(backup),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, PipelineError::Aborted { .. })
    }
}
