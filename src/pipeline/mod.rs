//! 回合流水线：阶段事件、提示词、回合契约与编排器

pub mod events;
pub mod orchestrator;
pub mod prompts;
pub mod turn;

pub use events::{Phase, PhaseReport, PipelineEvent, SkipReason};
pub use orchestrator::PipelineOrchestrator;
pub use turn::{RetryBackup, TurnResult};
