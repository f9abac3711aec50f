//! 持久化契约：WorldStore
//!
//! 每个调用独立成败（StoreError）。分支为写时复制：在分支内更新主线实体会写入以原 id 为键的覆盖副本，
//! 分支视图中以覆盖副本替代原实体。SQL 等具体持久化由外部实现该 trait；本 crate 提供内存参考实现。

pub mod memory;
pub mod snapshot_file;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lore::LoreEntry;
use crate::world::{
    Chapter, Character, CharacterPatch, EntityId, EntityKind, Item, ItemPatch, Location,
    LocationPatch, StoryBeat, StoryBeatPatch, StoryEntry, StoryEnvironment, StoryScope,
    WorldStateDelta, WorldView,
};

pub use memory::InMemoryWorldStore;
pub use snapshot_file::SnapshotFile;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    Duplicate { kind: &'static str, id: String },

    #[error("{kind} '{id}' belongs to the main line and cannot be deleted from a branch")]
    NotOwnedByBranch { kind: &'static str, id: String },

    #[error("entry position {position} is not after the last position {last}")]
    PositionOutOfOrder { position: u64, last: u64 },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: kind.as_str(),
            id: id.into(),
        }
    }
}

/// 某条分支所有故事集合的完整快照（检查点与重试备份共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorySnapshot {
    pub environment: StoryEnvironment,
    pub characters: Vec<Character>,
    pub locations: Vec<Location>,
    pub items: Vec<Item>,
    pub story_beats: Vec<StoryBeat>,
    pub lore_entries: Vec<LoreEntry>,
    pub entries: Vec<StoryEntry>,
    /// 重试备份不含章节
    pub chapters: Option<Vec<Chapter>>,
    pub captured_at: DateTime<Utc>,
}

impl StorySnapshot {
    pub fn world_view(&self) -> WorldView {
        WorldView {
            environment: self.environment.clone(),
            characters: self.characters.clone(),
            locations: self.locations.clone(),
            items: self.items.clone(),
            story_beats: self.story_beats.clone(),
        }
    }

    pub fn last_position(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.position).max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub include_chapters: bool,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            include_chapters: true,
        }
    }
}

/// 命名的完整快照；auto 检查点由流水线每 N 回合自动创建
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: EntityId,
    pub story_id: String,
    pub branch_id: Option<String>,
    pub name: String,
    /// 创建时的最后条目位置
    pub position: u64,
    pub auto: bool,
    pub created_at: DateTime<Utc>,
    pub snapshot: StorySnapshot,
}

/// 持久化契约
#[async_trait]
pub trait WorldStore: Send + Sync {
    // --- 环境 ---
    /// 分支没有环境时返回初始环境
    async fn environment(&self, scope: &StoryScope) -> Result<StoryEnvironment, StoreError>;
    async fn set_environment(&self, scope: &StoryScope, env: StoryEnvironment) -> Result<(), StoreError>;

    // --- 实体 ---
    async fn characters(&self, scope: &StoryScope) -> Result<Vec<Character>, StoreError>;
    async fn add_character(&self, scope: &StoryScope, character: Character) -> Result<(), StoreError>;
    async fn update_character(&self, scope: &StoryScope, id: &str, patch: &CharacterPatch) -> Result<(), StoreError>;
    async fn delete_character(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError>;

    async fn locations(&self, scope: &StoryScope) -> Result<Vec<Location>, StoreError>;
    async fn add_location(&self, scope: &StoryScope, location: Location) -> Result<(), StoreError>;
    async fn update_location(&self, scope: &StoryScope, id: &str, patch: &LocationPatch) -> Result<(), StoreError>;
    async fn delete_location(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError>;

    async fn items(&self, scope: &StoryScope) -> Result<Vec<Item>, StoreError>;
    async fn add_item(&self, scope: &StoryScope, item: Item) -> Result<(), StoreError>;
    async fn update_item(&self, scope: &StoryScope, id: &str, patch: &ItemPatch) -> Result<(), StoreError>;
    async fn delete_item(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError>;

    async fn story_beats(&self, scope: &StoryScope) -> Result<Vec<StoryBeat>, StoreError>;
    async fn add_story_beat(&self, scope: &StoryScope, beat: StoryBeat) -> Result<(), StoreError>;
    async fn update_story_beat(&self, scope: &StoryScope, id: &str, patch: &StoryBeatPatch) -> Result<(), StoreError>;
    async fn delete_story_beat(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError>;

    /// 分支的完整实体视图
    async fn world_view(&self, scope: &StoryScope) -> Result<WorldView, StoreError> {
        Ok(WorldView {
            environment: self.environment(scope).await?,
            characters: self.characters(scope).await?,
            locations: self.locations(scope).await?,
            items: self.items(scope).await?,
            story_beats: self.story_beats(scope).await?,
        })
    }

    // --- 设定集 ---
    async fn lore_entries(&self, story_id: &str) -> Result<Vec<LoreEntry>, StoreError>;
    /// 插入或按 id 替换
    async fn upsert_lore_entry(&self, entry: LoreEntry) -> Result<(), StoreError>;
    async fn delete_lore_entry(&self, story_id: &str, id: &str) -> Result<(), StoreError>;

    // --- 故事条目 ---
    async fn add_entry(&self, entry: StoryEntry) -> Result<(), StoreError>;
    /// 按 position 升序
    async fn entries(&self, scope: &StoryScope) -> Result<Vec<StoryEntry>, StoreError>;
    async fn set_entry_delta(
        &self,
        scope: &StoryScope,
        entry_id: &str,
        delta: Option<WorldStateDelta>,
    ) -> Result<(), StoreError>;
    async fn set_entry_translation(&self, scope: &StoryScope, entry_id: &str, translation: String) -> Result<(), StoreError>;
    /// 删除 position ≥ from 的条目，返回删除数
    async fn delete_entries_from(&self, scope: &StoryScope, from: u64) -> Result<usize, StoreError>;
    /// 下一条条目的 position（空分支为 0）
    async fn next_position(&self, scope: &StoryScope) -> Result<u64, StoreError>;

    // --- 章节 ---
    async fn add_chapter(&self, chapter: Chapter) -> Result<(), StoreError>;
    async fn chapters(&self, scope: &StoryScope) -> Result<Vec<Chapter>, StoreError>;

    // --- 检查点 ---
    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError>;
    /// 按创建顺序
    async fn checkpoints(&self, scope: &StoryScope) -> Result<Vec<Checkpoint>, StoreError>;
    async fn delete_checkpoint(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError>;
    /// 删除 position ≥ from 的自动检查点，返回删除数
    async fn delete_auto_checkpoints_from(&self, scope: &StoryScope, from: u64) -> Result<usize, StoreError>;

    // --- 快照 ---
    async fn capture_snapshot(&self, scope: &StoryScope, options: SnapshotOptions) -> Result<StorySnapshot, StoreError>;
    /// 以快照替换分支的全部集合；快照不含章节时保留现有章节
    async fn restore_snapshot(&self, scope: &StoryScope, snapshot: &StorySnapshot) -> Result<(), StoreError>;

    /// 删除内容已与主线原实体一致的分支覆盖，返回删除数（主线上恒为 0）
    async fn prune_redundant_overrides(&self, scope: &StoryScope) -> Result<usize, StoreError>;
}
