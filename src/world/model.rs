//! 世界状态数据模型
//!
//! 角色 / 地点 / 物品 / 剧情节点四类实体，外加故事环境（当前地点、时间）、故事条目与章节。
//! 每类实体都有对应的 Patch（部分更新），存储层只通过 Patch 修改实体，回滚也只是把快照转成 Patch 写回。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::world::delta::WorldStateDelta;
use crate::world::time::TimeTracker;

pub type EntityId = String;
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub fn new_id() -> EntityId {
    uuid::Uuid::new_v4().to_string()
}

/// 一个故事的某条分支；branch_id 为 None 表示主线
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryScope {
    pub story_id: String,
    pub branch_id: Option<String>,
}

impl StoryScope {
    pub fn main(story_id: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            branch_id: None,
        }
    }

    pub fn branch(story_id: impl Into<String>, branch_id: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            branch_id: Some(branch_id.into()),
        }
    }

    pub fn branch_ref(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }
}

/// 实体类别（日志、错误与回滚统计用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Location,
    Item,
    StoryBeat,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Character => "character",
            EntityKind::Location => "location",
            EntityKind::Item => "item",
            EntityKind::StoryBeat => "story_beat",
        }
    }
}

/// 存储层对四类实体的统一视图：标识、分支归属、按 Patch 更新
pub trait WorldEntity: Clone + PartialEq + Send + Sync + 'static {
    type Patch: Clone + Send + Sync;
    const KIND: EntityKind;

    fn id(&self) -> &str;
    fn story_id(&self) -> &str;
    /// 名称或标题，用于分类器按名字匹配
    fn label(&self) -> &str;
    fn branch_id(&self) -> Option<&str>;
    fn set_branch_id(&mut self, branch_id: Option<String>);
    fn apply_patch(&mut self, patch: &Self::Patch);

    /// 忽略分支归属后内容是否一致（判断分支覆盖是否已成为空操作）
    fn same_content(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.set_branch_id(None);
        b.set_branch_id(None);
        a == b
    }
}

// ---------------------------------------------------------------------------
// Character
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterStatus {
    #[default]
    Active,
    Inactive,
    Deceased,
}

impl CharacterStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "active" | "alive" | "present" => Some(CharacterStatus::Active),
            "inactive" | "absent" | "missing" => Some(CharacterStatus::Inactive),
            "deceased" | "dead" => Some(CharacterStatus::Deceased),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: EntityId,
    pub story_id: String,
    pub branch_id: Option<String>,
    pub name: String,
    pub description: String,
    pub relationship: Option<String>,
    pub traits: Vec<String>,
    pub visual_descriptors: Vec<String>,
    pub status: CharacterStatus,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Character {
    pub fn new(scope: &StoryScope, name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            story_id: scope.story_id.clone(),
            branch_id: scope.branch_id.clone(),
            name: name.into(),
            description: String::new(),
            relationship: None,
            traits: Vec::new(),
            visual_descriptors: Vec::new(),
            status: CharacterStatus::Active,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterPatch {
    pub status: Option<CharacterStatus>,
    pub relationship: Option<Option<String>>,
    pub traits: Option<Vec<String>>,
    pub visual_descriptors: Option<Vec<String>>,
    pub metadata: Option<Metadata>,
}

impl CharacterPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl WorldEntity for Character {
    type Patch = CharacterPatch;
    const KIND: EntityKind = EntityKind::Character;

    fn id(&self) -> &str {
        &self.id
    }
    fn story_id(&self) -> &str {
        &self.story_id
    }
    fn label(&self) -> &str {
        &self.name
    }
    fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }
    fn set_branch_id(&mut self, branch_id: Option<String>) {
        self.branch_id = branch_id;
    }

    fn apply_patch(&mut self, patch: &CharacterPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(relationship) = &patch.relationship {
            self.relationship = relationship.clone();
        }
        if let Some(traits) = &patch.traits {
            self.traits = traits.clone();
        }
        if let Some(visual) = &patch.visual_descriptors {
            self.visual_descriptors = visual.clone();
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = metadata.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: EntityId,
    pub story_id: String,
    pub branch_id: Option<String>,
    pub name: String,
    pub description: String,
    pub visited: bool,
    pub current: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Location {
    pub fn new(scope: &StoryScope, name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            story_id: scope.story_id.clone(),
            branch_id: scope.branch_id.clone(),
            name: name.into(),
            description: String::new(),
            visited: false,
            current: false,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationPatch {
    pub visited: Option<bool>,
    pub current: Option<bool>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
}

impl LocationPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl WorldEntity for Location {
    type Patch = LocationPatch;
    const KIND: EntityKind = EntityKind::Location;

    fn id(&self) -> &str {
        &self.id
    }
    fn story_id(&self) -> &str {
        &self.story_id
    }
    fn label(&self) -> &str {
        &self.name
    }
    fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }
    fn set_branch_id(&mut self, branch_id: Option<String>) {
        self.branch_id = branch_id;
    }

    fn apply_patch(&mut self, patch: &LocationPatch) {
        if let Some(visited) = patch.visited {
            self.visited = visited;
        }
        if let Some(current) = patch.current {
            self.current = current;
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = metadata.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// 物品默认所在：主角随身
pub const INVENTORY: &str = "inventory";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: EntityId,
    pub story_id: String,
    pub branch_id: Option<String>,
    pub name: String,
    pub description: String,
    pub quantity: u32,
    pub equipped: bool,
    pub location: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Item {
    pub fn new(scope: &StoryScope, name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            story_id: scope.story_id.clone(),
            branch_id: scope.branch_id.clone(),
            name: name.into(),
            description: String::new(),
            quantity: 1,
            equipped: false,
            location: INVENTORY.to_string(),
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub quantity: Option<u32>,
    pub equipped: Option<bool>,
    pub location: Option<String>,
    pub metadata: Option<Metadata>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl WorldEntity for Item {
    type Patch = ItemPatch;
    const KIND: EntityKind = EntityKind::Item;

    fn id(&self) -> &str {
        &self.id
    }
    fn story_id(&self) -> &str {
        &self.story_id
    }
    fn label(&self) -> &str {
        &self.name
    }
    fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }
    fn set_branch_id(&mut self, branch_id: Option<String>) {
        self.branch_id = branch_id;
    }

    fn apply_patch(&mut self, patch: &ItemPatch) {
        if let Some(quantity) = patch.quantity {
            self.quantity = quantity;
        }
        if let Some(equipped) = patch.equipped {
            self.equipped = equipped;
        }
        if let Some(location) = &patch.location {
            self.location = location.clone();
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = metadata.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// StoryBeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatType {
    Milestone,
    Quest,
    Revelation,
    #[default]
    Event,
    PlotPoint,
}

impl BeatType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "milestone" => BeatType::Milestone,
            "quest" => BeatType::Quest,
            "revelation" => BeatType::Revelation,
            "plot_point" | "plot" => BeatType::PlotPoint,
            _ => BeatType::Event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatStatus {
    Pending,
    #[default]
    Active,
    Completed,
    Failed,
}

impl BeatStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Some(BeatStatus::Pending),
            "active" | "in_progress" | "ongoing" => Some(BeatStatus::Active),
            "completed" | "complete" | "resolved" | "done" => Some(BeatStatus::Completed),
            "failed" | "abandoned" => Some(BeatStatus::Failed),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, BeatStatus::Completed | BeatStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryBeat {
    pub id: EntityId,
    pub story_id: String,
    pub branch_id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub beat_type: BeatType,
    pub status: BeatStatus,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl StoryBeat {
    pub fn new(scope: &StoryScope, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            story_id: scope.story_id.clone(),
            branch_id: scope.branch_id.clone(),
            title: title.into(),
            description: String::new(),
            beat_type: BeatType::Event,
            status: BeatStatus::Active,
            triggered_at: now,
            resolved_at: None,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoryBeatPatch {
    pub status: Option<BeatStatus>,
    pub description: Option<String>,
    pub resolved_at: Option<Option<DateTime<Utc>>>,
    pub metadata: Option<Metadata>,
}

impl StoryBeatPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl WorldEntity for StoryBeat {
    type Patch = StoryBeatPatch;
    const KIND: EntityKind = EntityKind::StoryBeat;

    fn id(&self) -> &str {
        &self.id
    }
    fn story_id(&self) -> &str {
        &self.story_id
    }
    fn label(&self) -> &str {
        &self.title
    }
    fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }
    fn set_branch_id(&mut self, branch_id: Option<String>) {
        self.branch_id = branch_id;
    }

    fn apply_patch(&mut self, patch: &StoryBeatPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(resolved_at) = patch.resolved_at {
            self.resolved_at = resolved_at;
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = metadata.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// 故事环境、条目、章节
// ---------------------------------------------------------------------------

/// 每条分支的全局环境：当前所在地点与故事内时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryEnvironment {
    pub story_id: String,
    pub branch_id: Option<String>,
    pub current_location_id: Option<EntityId>,
    pub time_tracker: TimeTracker,
}

impl StoryEnvironment {
    pub fn new(scope: &StoryScope) -> Self {
        Self {
            story_id: scope.story_id.clone(),
            branch_id: scope.branch_id.clone(),
            current_location_id: None,
            time_tracker: TimeTracker::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    UserAction,
    Narration,
    System,
}

/// 故事正文中的一条记录；position 在同一分支内严格递增
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryEntry {
    pub id: EntityId,
    pub story_id: String,
    pub branch_id: Option<String>,
    pub position: u64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub content: String,
    pub translated_content: Option<String>,
    /// 仅经过分类的叙述条目携带增量
    pub world_state_delta: Option<WorldStateDelta>,
    pub created_at: DateTime<Utc>,
}

impl StoryEntry {
    pub fn new(
        scope: &StoryScope,
        position: u64,
        entry_type: EntryType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            story_id: scope.story_id.clone(),
            branch_id: scope.branch_id.clone(),
            position,
            entry_type,
            content: content.into(),
            translated_content: None,
            world_state_delta: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: EntityId,
    pub story_id: String,
    pub branch_id: Option<String>,
    pub number: u32,
    pub title: String,
    pub start_position: u64,
    pub end_position: u64,
    pub summary: Option<String>,
}

/// 某条分支在一次修改之前的完整实体视图（分类器输入与增量构建都基于它）
#[derive(Debug, Clone, PartialEq)]
pub struct WorldView {
    pub environment: StoryEnvironment,
    pub characters: Vec<Character>,
    pub locations: Vec<Location>,
    pub items: Vec<Item>,
    pub story_beats: Vec<StoryBeat>,
}

fn find_by_label<'a, T: WorldEntity>(items: &'a [T], label: &str) -> Option<&'a T> {
    let wanted = label.trim();
    items.iter().find(|e| e.label().eq_ignore_ascii_case(wanted))
}

impl WorldView {
    pub fn character_named(&self, name: &str) -> Option<&Character> {
        find_by_label(&self.characters, name)
    }

    pub fn location_named(&self, name: &str) -> Option<&Location> {
        find_by_label(&self.locations, name)
    }

    pub fn item_named(&self, name: &str) -> Option<&Item> {
        find_by_label(&self.items, name)
    }

    pub fn beat_titled(&self, title: &str) -> Option<&StoryBeat> {
        find_by_label(&self.story_beats, title)
    }

    pub fn current_location(&self) -> Option<&Location> {
        let id = self.environment.current_location_id.as_deref()?;
        self.locations.iter().find(|l| l.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_applies_only_present_fields() {
        let scope = StoryScope::main("s1");
        let mut c = Character::new(&scope, "Mira");
        c.relationship = Some("stranger".into());
        c.apply_patch(&CharacterPatch {
            status: Some(CharacterStatus::Inactive),
            ..Default::default()
        });
        assert_eq!(c.status, CharacterStatus::Inactive);
        assert_eq!(c.relationship.as_deref(), Some("stranger"));

        c.apply_patch(&CharacterPatch {
            relationship: Some(None),
            ..Default::default()
        });
        assert!(c.relationship.is_none());
    }

    #[test]
    fn test_same_content_ignores_branch() {
        let scope = StoryScope::main("s1");
        let original = Location::new(&scope, "Harbor");
        let mut copy = original.clone();
        copy.branch_id = Some("b1".into());
        assert!(original.same_content(&copy));
        copy.visited = true;
        assert!(!original.same_content(&copy));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(CharacterStatus::parse("Dead"), Some(CharacterStatus::Deceased));
        assert_eq!(BeatStatus::parse("resolved"), Some(BeatStatus::Completed));
        assert_eq!(BeatType::parse("Plot Point"), BeatType::PlotPoint);
        assert_eq!(BeatType::parse("whatever"), BeatType::Event);
    }

    #[test]
    fn test_world_view_lookup_is_case_insensitive() {
        let scope = StoryScope::main("s1");
        let view = WorldView {
            environment: StoryEnvironment::new(&scope),
            characters: vec![Character::new(&scope, "Captain Vale")],
            locations: vec![],
            items: vec![],
            story_beats: vec![],
        };
        assert!(view.character_named("captain vale").is_some());
        assert!(view.character_named("Vale").is_none());
    }
}
