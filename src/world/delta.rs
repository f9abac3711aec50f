//! 世界状态增量（WorldStateDelta）与 DeltaBuilder
//!
//! 一次分类对应一个增量：记录本次新建的实体 id，以及每个被更新实体在修改前的可变字段快照。
//! 回滚时删除新建实体、把快照作为 Patch 写回即可精确还原。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::world::apply::ApplyPlan;
use crate::world::model::{
    BeatStatus, Character, CharacterPatch, CharacterStatus, EntityId, Item, ItemPatch, Location,
    LocationPatch, Metadata, StoryBeat, StoryBeatPatch, WorldView,
};
use crate::world::time::TimeTracker;

/// 本次新建实体的完整 id 集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreatedEntities {
    pub character_ids: Vec<EntityId>,
    pub location_ids: Vec<EntityId>,
    pub item_ids: Vec<EntityId>,
    pub story_beat_ids: Vec<EntityId>,
}

impl CreatedEntities {
    pub fn len(&self) -> usize {
        self.character_ids.len()
            + self.location_ids.len()
            + self.item_ids.len()
            + self.story_beat_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterSnapshot {
    pub id: EntityId,
    pub status: CharacterStatus,
    pub relationship: Option<String>,
    pub traits: Vec<String>,
    pub visual_descriptors: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CharacterSnapshot {
    pub fn capture(c: &Character) -> Self {
        Self {
            id: c.id.clone(),
            status: c.status,
            relationship: c.relationship.clone(),
            traits: c.traits.clone(),
            visual_descriptors: c.visual_descriptors.clone(),
            metadata: c.metadata.clone(),
        }
    }

    pub fn to_patch(&self) -> CharacterPatch {
        CharacterPatch {
            status: Some(self.status),
            relationship: Some(self.relationship.clone()),
            traits: Some(self.traits.clone()),
            visual_descriptors: Some(self.visual_descriptors.clone()),
            metadata: Some(self.metadata.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSnapshot {
    pub id: EntityId,
    pub visited: bool,
    pub current: bool,
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl LocationSnapshot {
    pub fn capture(l: &Location) -> Self {
        Self {
            id: l.id.clone(),
            visited: l.visited,
            current: l.current,
            description: l.description.clone(),
            metadata: l.metadata.clone(),
        }
    }

    pub fn to_patch(&self) -> LocationPatch {
        LocationPatch {
            visited: Some(self.visited),
            current: Some(self.current),
            description: Some(self.description.clone()),
            metadata: Some(self.metadata.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSnapshot {
    pub id: EntityId,
    pub quantity: u32,
    pub equipped: bool,
    pub location: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ItemSnapshot {
    pub fn capture(i: &Item) -> Self {
        Self {
            id: i.id.clone(),
            quantity: i.quantity,
            equipped: i.equipped,
            location: i.location.clone(),
            metadata: i.metadata.clone(),
        }
    }

    pub fn to_patch(&self) -> ItemPatch {
        ItemPatch {
            quantity: Some(self.quantity),
            equipped: Some(self.equipped),
            location: Some(self.location.clone()),
            metadata: Some(self.metadata.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryBeatSnapshot {
    pub id: EntityId,
    pub status: BeatStatus,
    pub description: String,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl StoryBeatSnapshot {
    pub fn capture(b: &StoryBeat) -> Self {
        Self {
            id: b.id.clone(),
            status: b.status,
            description: b.description.clone(),
            resolved_at: b.resolved_at,
            metadata: b.metadata.clone(),
        }
    }

    pub fn to_patch(&self) -> StoryBeatPatch {
        StoryBeatPatch {
            status: Some(self.status),
            description: Some(self.description.clone()),
            resolved_at: Some(self.resolved_at),
            metadata: Some(self.metadata.clone()),
        }
    }
}

/// 修改前状态：被更新实体的字段快照 + 环境（当前地点、时间）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviousState {
    pub characters: Vec<CharacterSnapshot>,
    pub locations: Vec<LocationSnapshot>,
    pub items: Vec<ItemSnapshot>,
    pub story_beats: Vec<StoryBeatSnapshot>,
    pub current_location_id: Option<EntityId>,
    pub time_tracker: TimeTracker,
}

impl PreviousState {
    pub fn entity_count(&self) -> usize {
        self.characters.len() + self.locations.len() + self.items.len() + self.story_beats.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldStateDelta {
    pub created_entities: CreatedEntities,
    pub previous_state: PreviousState,
}

impl WorldStateDelta {
    /// 回滚该增量需要执行的实体操作数（删除 + 还原）
    pub fn operation_count(&self) -> usize {
        self.created_entities.len() + self.previous_state.entity_count()
    }
}

/// 由应用计划与修改前视图构建可逆增量
pub struct DeltaBuilder;

impl DeltaBuilder {
    /// 计划中每个被更新的实体都必须存在于 `before` 中；找不到的实体（计划与视图不一致）不会被记录，
    /// 执行阶段对它的更新同样会失败。
    pub fn build(plan: &ApplyPlan, before: &WorldView) -> WorldStateDelta {
        let created_entities = CreatedEntities {
            character_ids: plan.new_characters.iter().map(|c| c.id.clone()).collect(),
            location_ids: plan.new_locations.iter().map(|l| l.id.clone()).collect(),
            item_ids: plan.new_items.iter().map(|i| i.id.clone()).collect(),
            story_beat_ids: plan.new_story_beats.iter().map(|b| b.id.clone()).collect(),
        };

        let characters = plan
            .character_patches
            .iter()
            .filter_map(|(id, _)| before.characters.iter().find(|c| &c.id == id))
            .map(CharacterSnapshot::capture)
            .collect();
        let locations = plan
            .location_patches
            .iter()
            .filter_map(|(id, _)| before.locations.iter().find(|l| &l.id == id))
            .map(LocationSnapshot::capture)
            .collect();
        let items = plan
            .item_patches
            .iter()
            .filter_map(|(id, _)| before.items.iter().find(|i| &i.id == id))
            .map(ItemSnapshot::capture)
            .collect();
        let story_beats = plan
            .story_beat_patches
            .iter()
            .filter_map(|(id, _)| before.story_beats.iter().find(|b| &b.id == id))
            .map(StoryBeatSnapshot::capture)
            .collect();

        WorldStateDelta {
            created_entities,
            previous_state: PreviousState {
                characters,
                locations,
                items,
                story_beats,
                current_location_id: before.environment.current_location_id.clone(),
                time_tracker: before.environment.time_tracker,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::model::{StoryEnvironment, StoryScope, WorldEntity};

    #[test]
    fn test_snapshot_patch_restores_mutable_fields() {
        let scope = StoryScope::main("s1");
        let mut c = Character::new(&scope, "Mira");
        c.traits = vec!["brave".into()];
        let snap = CharacterSnapshot::capture(&c);

        let mut changed = c.clone();
        changed.status = CharacterStatus::Deceased;
        changed.traits.push("wounded".into());
        changed.relationship = Some("enemy".into());
        changed.apply_patch(&snap.to_patch());
        assert_eq!(changed, c);
    }

    #[test]
    fn test_build_records_created_and_previous() {
        let scope = StoryScope::main("s1");
        let inn = Location::new(&scope, "Inn");
        let mut env = StoryEnvironment::new(&scope);
        env.current_location_id = Some(inn.id.clone());
        let view = WorldView {
            environment: env,
            characters: vec![],
            locations: vec![inn.clone()],
            items: vec![],
            story_beats: vec![],
        };
        let new_item = Item::new(&scope, "Lantern");
        let plan = ApplyPlan {
            new_items: vec![new_item.clone()],
            location_patches: vec![(
                inn.id.clone(),
                LocationPatch {
                    current: Some(false),
                    ..Default::default()
                },
            )],
            ..ApplyPlan::empty(scope)
        };

        let delta = DeltaBuilder::build(&plan, &view);
        assert_eq!(delta.created_entities.item_ids, vec![new_item.id]);
        assert_eq!(delta.previous_state.locations.len(), 1);
        assert_eq!(
            delta.previous_state.current_location_id.as_deref(),
            Some(inn.id.as_str())
        );
        assert_eq!(delta.operation_count(), 2);
    }

    #[test]
    fn test_delta_serializes_camel_case() {
        let delta = WorldStateDelta::default();
        let json = serde_json::to_value(&delta).unwrap();
        assert!(json.get("createdEntities").is_some());
        assert!(json["previousState"].get("timeTracker").is_some());
    }
}
