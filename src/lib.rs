//! Aventura - AI 互动小说回合引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 应用上下文、流水线错误、会话监管（取消）
//! - **classifier**: 世界状态分类器契约与 LLM 实现
//! - **events**: 进程内事件总线（封闭事件集合 + 历史环形缓冲）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）
//! - **lore**: 设定集条目、合并与批量类型判定
//! - **pipeline**: 回合流水线编排器与阶段事件
//! - **retrieval**: 设定集三层检索与激活追踪
//! - **rollback**: 增量回滚引擎
//! - **store**: 持久化契约、内存实现与快照文件
//! - **story**: 检查点、章节、删除回合
//! - **world**: 实体模型、分类结果应用与可逆增量

pub mod classifier;
pub mod config;
pub mod core;
pub mod events;
pub mod llm;
pub mod lore;
pub mod observability;
pub mod pipeline;
pub mod retrieval;
pub mod rollback;
pub mod store;
pub mod story;
pub mod world;

pub use crate::core::{AppContext, PipelineError};
pub use pipeline::{PipelineEvent, PipelineOrchestrator, TurnResult};
pub use store::{InMemoryWorldStore, WorldStore};
