//! 世界状态分类器：叙述文本 → 结构化实体更新
//!
//! 线格式（LLM 输出）中的状态、类型均为字符串，解析在应用计划阶段宽松完成；所有字段都有默认值，
//! 任何缺失都不会导致整次分类失败。`classify()` 永不失败，失败时返回空结果。

pub mod llm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::world::{Metadata, WorldView};

pub use llm::{parse_classification, LlmWorldStateClassifier};

/// 故事模式：冒险（第二人称、主角视角）或创作（作者视角）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryMode {
    #[default]
    Adventure,
    Creative,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassificationResult {
    pub entry_updates: EntryUpdates,
    pub scene: SceneUpdate,
}

impl ClassificationResult {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntryUpdates {
    pub character_updates: Vec<CharacterUpdate>,
    pub location_updates: Vec<LocationUpdate>,
    pub item_updates: Vec<ItemUpdate>,
    pub story_beat_updates: Vec<StoryBeatUpdate>,
    pub new_characters: Vec<NewCharacter>,
    pub new_locations: Vec<NewLocation>,
    pub new_items: Vec<NewItem>,
    pub new_story_beats: Vec<NewStoryBeat>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterUpdate {
    pub name: String,
    pub changes: CharacterChanges,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterChanges {
    pub status: Option<String>,
    pub relationship: Option<String>,
    pub add_traits: Vec<String>,
    pub remove_traits: Vec<String>,
    pub add_visual_descriptors: Vec<String>,
    pub remove_visual_descriptors: Vec<String>,
    /// 与现有元数据浅合并
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationUpdate {
    pub name: String,
    pub changes: LocationChanges,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationChanges {
    pub visited: Option<bool>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemUpdate {
    pub name: String,
    pub changes: ItemChanges,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemChanges {
    pub quantity: Option<u32>,
    pub equipped: Option<bool>,
    pub location: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoryBeatUpdate {
    pub title: String,
    pub changes: StoryBeatChanges,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoryBeatChanges {
    pub status: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewCharacter {
    pub name: String,
    pub description: String,
    pub relationship: Option<String>,
    pub traits: Vec<String>,
    pub visual_descriptors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewLocation {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewItem {
    pub name: String,
    pub description: String,
    pub quantity: Option<u32>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewStoryBeat {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub beat_type: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SceneUpdate {
    pub current_location_name: Option<String>,
    pub present_character_names: Vec<String>,
    /// none / minutes / hours / days
    pub time_progression: String,
}

/// 当前已知实体名（供模型复用名字而不是重复创建）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownEntities {
    pub characters: Vec<String>,
    pub locations: Vec<String>,
    pub items: Vec<String>,
    pub story_beats: Vec<String>,
}

impl KnownEntities {
    pub fn from_view(view: &WorldView) -> Self {
        Self {
            characters: view.characters.iter().map(|c| c.name.clone()).collect(),
            locations: view.locations.iter().map(|l| l.name.clone()).collect(),
            items: view.items.iter().map(|i| i.name.clone()).collect(),
            story_beats: view.story_beats.iter().map(|b| b.title.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationInput {
    pub narrative: String,
    pub user_action: String,
    pub known: KnownEntities,
    pub mode: StoryMode,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("llm error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("failed to parse classification: {0}")]
    Parse(String),
}

/// 分类器契约
#[async_trait]
pub trait WorldStateClassifier: Send + Sync {
    /// 可失败的分类（流水线据此发出非致命错误事件）
    async fn try_classify(
        &self,
        input: &ClassificationInput,
        cancel: &CancellationToken,
    ) -> Result<ClassificationResult, ClassifyError>;

    /// 永不失败：任何错误都降级为空结果
    async fn classify(
        &self,
        input: &ClassificationInput,
        cancel: &CancellationToken,
    ) -> ClassificationResult {
        match self.try_classify(input, cancel).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "classification failed, using empty result");
                ClassificationResult::default()
            }
        }
    }
}
