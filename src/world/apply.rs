//! 分类结果的应用：解析为 ApplyPlan → 构建增量 → 执行
//!
//! ApplyPlan 是一组已解析的命令：名字已映射为 id，新实体的 id 已预先分配，更新已折叠为最终字段值。
//! 增量在执行前由计划和修改前视图构建，因此执行中的部分失败不影响增量的完整性。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::classifier::ClassificationResult;
use crate::store::{StoreError, WorldStore};
use crate::world::delta::{DeltaBuilder, WorldStateDelta};
use crate::world::model::{
    BeatStatus, BeatType, Character, CharacterPatch, CharacterStatus, EntityId, EntityKind, Item,
    ItemPatch, Location, LocationPatch, Metadata, StoryBeat, StoryBeatPatch, StoryScope,
    WorldEntity, WorldView,
};
use crate::world::time::{TimeProgression, TimeTracker};

/// 已解析的应用计划
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyPlan {
    pub scope: StoryScope,
    pub new_characters: Vec<Character>,
    pub new_locations: Vec<Location>,
    pub new_items: Vec<Item>,
    pub new_story_beats: Vec<StoryBeat>,
    pub character_patches: Vec<(EntityId, CharacterPatch)>,
    pub location_patches: Vec<(EntityId, LocationPatch)>,
    pub item_patches: Vec<(EntityId, ItemPatch)>,
    pub story_beat_patches: Vec<(EntityId, StoryBeatPatch)>,
    /// 场景切换后的当前地点；None 表示不变
    pub current_location_id: Option<EntityId>,
    /// 推进后的时间；None 表示不变
    pub time_tracker: Option<TimeTracker>,
    /// 场景中在场的已知角色
    pub present_character_ids: Vec<EntityId>,
}

impl ApplyPlan {
    pub fn empty(scope: StoryScope) -> Self {
        Self {
            scope,
            new_characters: Vec::new(),
            new_locations: Vec::new(),
            new_items: Vec::new(),
            new_story_beats: Vec::new(),
            character_patches: Vec::new(),
            location_patches: Vec::new(),
            item_patches: Vec::new(),
            story_beat_patches: Vec::new(),
            current_location_id: None,
            time_tracker: None,
            present_character_ids: Vec::new(),
        }
    }

    /// 计划是否不修改任何东西（在场角色不算修改）
    pub fn is_noop(&self) -> bool {
        self.new_characters.is_empty()
            && self.new_locations.is_empty()
            && self.new_items.is_empty()
            && self.new_story_beats.is_empty()
            && self.character_patches.is_empty()
            && self.location_patches.is_empty()
            && self.item_patches.is_empty()
            && self.story_beat_patches.is_empty()
            && self.current_location_id.is_none()
            && self.time_tracker.is_none()
    }

    /// 将分类结果解析为计划。
    ///
    /// - 与已有实体（或本次已新建实体）同名的新实体被忽略
    /// - 更新目标找不到时跳过；目标是本次新建的实体时直接改写新实体
    /// - 同一实体的多次更新折叠为一个 Patch，只包含真正变化的字段
    pub fn resolve(
        result: &ClassificationResult,
        view: &WorldView,
        scope: &StoryScope,
        now: DateTime<Utc>,
    ) -> Self {
        let mut plan = Self::empty(scope.clone());
        let updates = &result.entry_updates;

        // 新实体
        for new in &updates.new_characters {
            let name = new.name.trim();
            if name.is_empty() || view.character_named(name).is_some() || has_label(&plan.new_characters, name) {
                debug!(name, "skipping duplicate or unnamed new character");
                continue;
            }
            let mut c = Character::new(scope, name);
            c.description = new.description.clone();
            c.relationship = new.relationship.clone().filter(|r| !r.trim().is_empty());
            c.traits = dedupe(new.traits.iter().cloned());
            c.visual_descriptors = dedupe(new.visual_descriptors.iter().cloned());
            plan.new_characters.push(c);
        }
        for new in &updates.new_locations {
            let name = new.name.trim();
            if name.is_empty() || view.location_named(name).is_some() || has_label(&plan.new_locations, name) {
                debug!(name, "skipping duplicate or unnamed new location");
                continue;
            }
            let mut l = Location::new(scope, name);
            l.description = new.description.clone();
            plan.new_locations.push(l);
        }
        for new in &updates.new_items {
            let name = new.name.trim();
            if name.is_empty() || view.item_named(name).is_some() || has_label(&plan.new_items, name) {
                debug!(name, "skipping duplicate or unnamed new item");
                continue;
            }
            let mut i = Item::new(scope, name);
            i.description = new.description.clone();
            if let Some(q) = new.quantity {
                i.quantity = q;
            }
            if let Some(loc) = new.location.as_deref().filter(|s| !s.trim().is_empty()) {
                i.location = loc.to_string();
            }
            plan.new_items.push(i);
        }
        for new in &updates.new_story_beats {
            let title = new.title.trim();
            if title.is_empty() || view.beat_titled(title).is_some() || has_label(&plan.new_story_beats, title) {
                debug!(title, "skipping duplicate or untitled new story beat");
                continue;
            }
            let mut b = StoryBeat::new(scope, title, now);
            b.description = new.description.clone();
            b.beat_type = BeatType::parse(&new.beat_type);
            if let Some(status) = new.status.as_deref().and_then(BeatStatus::parse) {
                b.status = status;
                if status.is_resolved() {
                    b.resolved_at = Some(now);
                }
            }
            plan.new_story_beats.push(b);
        }

        // 更新：在工作副本上折叠，最后与原值比较生成 Patch
        let mut characters = Working::new(&view.characters);
        for update in &updates.character_updates {
            let changes = &update.changes;
            let apply = |c: &mut Character| {
                if let Some(status) = changes.status.as_deref() {
                    match CharacterStatus::parse(status) {
                        Some(s) => c.status = s,
                        None => debug!(status, "unknown character status"),
                    }
                }
                if let Some(rel) = &changes.relationship {
                    c.relationship = Some(rel.clone()).filter(|r| !r.trim().is_empty());
                }
                edit_list(&mut c.traits, &changes.add_traits, &changes.remove_traits);
                edit_list(
                    &mut c.visual_descriptors,
                    &changes.add_visual_descriptors,
                    &changes.remove_visual_descriptors,
                );
                if let Some(meta) = &changes.metadata {
                    merge_metadata(&mut c.metadata, meta);
                }
            };
            if let Some(c) = find_label_mut(&mut plan.new_characters, &update.name) {
                apply(c);
            } else if !characters.update(&update.name, apply) {
                debug!(name = %update.name, "character update target not found");
            }
        }

        let mut locations = Working::new(&view.locations);
        for update in &updates.location_updates {
            let changes = &update.changes;
            let apply = |l: &mut Location| {
                if let Some(visited) = changes.visited {
                    l.visited = visited;
                }
                if let Some(desc) = &changes.description {
                    l.description = desc.clone();
                }
                if let Some(meta) = &changes.metadata {
                    merge_metadata(&mut l.metadata, meta);
                }
            };
            if let Some(l) = find_label_mut(&mut plan.new_locations, &update.name) {
                apply(l);
            } else if !locations.update(&update.name, apply) {
                debug!(name = %update.name, "location update target not found");
            }
        }

        let mut items = Working::new(&view.items);
        for update in &updates.item_updates {
            let changes = &update.changes;
            let apply = |i: &mut Item| {
                if let Some(q) = changes.quantity {
                    i.quantity = q;
                }
                if let Some(eq) = changes.equipped {
                    i.equipped = eq;
                }
                if let Some(loc) = changes.location.as_deref().filter(|s| !s.trim().is_empty()) {
                    i.location = loc.to_string();
                }
                if let Some(meta) = &changes.metadata {
                    merge_metadata(&mut i.metadata, meta);
                }
            };
            if let Some(i) = find_label_mut(&mut plan.new_items, &update.name) {
                apply(i);
            } else if !items.update(&update.name, apply) {
                debug!(name = %update.name, "item update target not found");
            }
        }

        let mut beats = Working::new(&view.story_beats);
        for update in &updates.story_beat_updates {
            let changes = &update.changes;
            let apply = |b: &mut StoryBeat| {
                if let Some(status) = changes.status.as_deref().and_then(BeatStatus::parse) {
                    if status.is_resolved() && !b.status.is_resolved() {
                        b.resolved_at = Some(now);
                    } else if !status.is_resolved() {
                        b.resolved_at = None;
                    }
                    b.status = status;
                }
                if let Some(desc) = &changes.description {
                    b.description = desc.clone();
                }
                if let Some(meta) = &changes.metadata {
                    merge_metadata(&mut b.metadata, meta);
                }
            };
            if let Some(b) = find_label_mut(&mut plan.new_story_beats, &update.title) {
                apply(b);
            } else if !beats.update(&update.title, apply) {
                debug!(title = %update.title, "story beat update target not found");
            }
        }

        // 场景：切换当前地点（不存在则创建），其余地点取消 current
        let scene = &result.scene;
        if let Some(name) = scene
            .current_location_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let target_id = if let Some(l) = find_label_mut(&mut plan.new_locations, name) {
                l.visited = true;
                l.current = true;
                l.id.clone()
            } else if let Some(existing) = view.location_named(name) {
                let id = existing.id.clone();
                locations.update(name, |l| {
                    l.visited = true;
                    l.current = true;
                });
                id
            } else {
                let mut l = Location::new(scope, name);
                l.visited = true;
                l.current = true;
                let id = l.id.clone();
                plan.new_locations.push(l);
                id
            };

            for other in view.locations.iter().filter(|l| l.current && l.id != target_id) {
                locations.update_id(&other.id, |l| l.current = false);
            }
            for other in plan.new_locations.iter_mut().filter(|l| l.id != target_id) {
                other.current = false;
            }
            if view.environment.current_location_id.as_deref() != Some(target_id.as_str()) {
                plan.current_location_id = Some(target_id);
            }
        }

        for name in &scene.present_character_names {
            if let Some(c) = view.character_named(name) {
                plan.present_character_ids.push(c.id.clone());
            } else if let Some(c) = plan.new_characters.iter().find(|c| c.name.eq_ignore_ascii_case(name.trim())) {
                plan.present_character_ids.push(c.id.clone());
            }
        }

        let progression = TimeProgression::parse(&scene.time_progression);
        if progression != TimeProgression::None {
            plan.time_tracker = Some(view.environment.time_tracker.advance(progression));
        }

        plan.character_patches = characters.into_patches(diff_character);
        plan.location_patches = locations.into_patches(diff_location);
        plan.item_patches = items.into_patches(diff_item);
        plan.story_beat_patches = beats.into_patches(diff_story_beat);
        plan
    }
}

/// 单个实体操作失败
#[derive(Debug, Clone)]
pub struct ApplyFailure {
    pub kind: EntityKind,
    pub id: EntityId,
    pub error: String,
}

/// 应用结果：增量总会返回；失败的实体操作单独列出
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub plan: ApplyPlan,
    pub delta: WorldStateDelta,
    pub failures: Vec<ApplyFailure>,
}

/// 将分类结果应用到存储
pub struct ClassificationApplier;

impl ClassificationApplier {
    /// 读取修改前视图失败时返回错误（此时没有任何修改）；执行阶段尽力而为
    pub async fn apply(
        store: &dyn WorldStore,
        scope: &StoryScope,
        result: &ClassificationResult,
    ) -> Result<ApplyOutcome, StoreError> {
        let before = store.world_view(scope).await?;
        let plan = ApplyPlan::resolve(result, &before, scope, Utc::now());
        let delta = DeltaBuilder::build(&plan, &before);
        let failures = Self::execute(store, &plan, &before).await;
        if !failures.is_empty() {
            warn!(failed = failures.len(), "some world state changes could not be applied");
        }
        Ok(ApplyOutcome {
            plan,
            delta,
            failures,
        })
    }

    /// 先把增量写入叙述条目再执行计划：写入失败时返回错误且世界状态未被修改，
    /// 因此每个被修改的回合都带有可逆增量
    pub async fn apply_to_entry(
        store: &dyn WorldStore,
        scope: &StoryScope,
        entry_id: &str,
        result: &ClassificationResult,
    ) -> Result<ApplyOutcome, StoreError> {
        let before = store.world_view(scope).await?;
        let plan = ApplyPlan::resolve(result, &before, scope, Utc::now());
        let delta = DeltaBuilder::build(&plan, &before);
        store.set_entry_delta(scope, entry_id, Some(delta.clone())).await?;

        let failures = Self::execute(store, &plan, &before).await;
        if !failures.is_empty() {
            warn!(failed = failures.len(), "some world state changes could not be applied");
        }
        Ok(ApplyOutcome {
            plan,
            delta,
            failures,
        })
    }

    async fn execute(store: &dyn WorldStore, plan: &ApplyPlan, before: &WorldView) -> Vec<ApplyFailure> {
        let scope = &plan.scope;
        let mut failures = Vec::new();
        let mut record = |kind: EntityKind, id: &str, result: Result<(), StoreError>| {
            if let Err(e) = result {
                warn!(kind = kind.as_str(), id, error = %e, "apply failed");
                failures.push(ApplyFailure {
                    kind,
                    id: id.to_string(),
                    error: e.to_string(),
                });
            }
        };

        for c in &plan.new_characters {
            record(EntityKind::Character, &c.id, store.add_character(scope, c.clone()).await);
        }
        for l in &plan.new_locations {
            record(EntityKind::Location, &l.id, store.add_location(scope, l.clone()).await);
        }
        for i in &plan.new_items {
            record(EntityKind::Item, &i.id, store.add_item(scope, i.clone()).await);
        }
        for b in &plan.new_story_beats {
            record(EntityKind::StoryBeat, &b.id, store.add_story_beat(scope, b.clone()).await);
        }
        for (id, patch) in &plan.character_patches {
            record(EntityKind::Character, id, store.update_character(scope, id, patch).await);
        }
        for (id, patch) in &plan.location_patches {
            record(EntityKind::Location, id, store.update_location(scope, id, patch).await);
        }
        for (id, patch) in &plan.item_patches {
            record(EntityKind::Item, id, store.update_item(scope, id, patch).await);
        }
        for (id, patch) in &plan.story_beat_patches {
            record(EntityKind::StoryBeat, id, store.update_story_beat(scope, id, patch).await);
        }

        if plan.current_location_id.is_some() || plan.time_tracker.is_some() {
            let mut env = before.environment.clone();
            if let Some(id) = &plan.current_location_id {
                env.current_location_id = Some(id.clone());
            }
            if let Some(t) = plan.time_tracker {
                env.time_tracker = t;
            }
            if let Err(e) = store.set_environment(scope, env).await {
                warn!(error = %e, "failed to update story environment");
            }
        }
        failures
    }
}

/// 修改前实体的工作副本，记录首次触达的顺序
struct Working<T: WorldEntity> {
    originals: Vec<T>,
    touched: Vec<EntityId>,
    copies: HashMap<EntityId, T>,
}

impl<T: WorldEntity> Working<T> {
    fn new(originals: &[T]) -> Self {
        Self {
            originals: originals.to_vec(),
            touched: Vec::new(),
            copies: HashMap::new(),
        }
    }

    fn update(&mut self, label: &str, f: impl FnOnce(&mut T)) -> bool {
        let wanted = label.trim();
        let Some(id) = self
            .originals
            .iter()
            .find(|e| e.label().eq_ignore_ascii_case(wanted))
            .map(|e| e.id().to_string())
        else {
            return false;
        };
        self.update_id(&id, f)
    }

    fn update_id(&mut self, id: &str, f: impl FnOnce(&mut T)) -> bool {
        if !self.copies.contains_key(id) {
            let Some(original) = self.originals.iter().find(|e| e.id() == id) else {
                return false;
            };
            self.touched.push(id.to_string());
            self.copies.insert(id.to_string(), original.clone());
        }
        if let Some(copy) = self.copies.get_mut(id) {
            f(copy);
        }
        true
    }

    fn into_patches<P>(self, diff: impl Fn(&T, &T) -> Option<P>) -> Vec<(EntityId, P)> {
        let mut patches = Vec::new();
        for id in self.touched {
            let (Some(before), Some(after)) = (
                self.originals.iter().find(|e| e.id() == id),
                self.copies.get(&id),
            ) else {
                continue;
            };
            if let Some(patch) = diff(before, after) {
                patches.push((id, patch));
            }
        }
        patches
    }
}

fn changed<V: PartialEq + Clone>(before: &V, after: &V) -> Option<V> {
    (before != after).then(|| after.clone())
}

fn diff_character(before: &Character, after: &Character) -> Option<CharacterPatch> {
    let patch = CharacterPatch {
        status: changed(&before.status, &after.status),
        relationship: changed(&before.relationship, &after.relationship),
        traits: changed(&before.traits, &after.traits),
        visual_descriptors: changed(&before.visual_descriptors, &after.visual_descriptors),
        metadata: changed(&before.metadata, &after.metadata),
    };
    (!patch.is_empty()).then_some(patch)
}

fn diff_location(before: &Location, after: &Location) -> Option<LocationPatch> {
    let patch = LocationPatch {
        visited: changed(&before.visited, &after.visited),
        current: changed(&before.current, &after.current),
        description: changed(&before.description, &after.description),
        metadata: changed(&before.metadata, &after.metadata),
    };
    (!patch.is_empty()).then_some(patch)
}

fn diff_item(before: &Item, after: &Item) -> Option<ItemPatch> {
    let patch = ItemPatch {
        quantity: changed(&before.quantity, &after.quantity),
        equipped: changed(&before.equipped, &after.equipped),
        location: changed(&before.location, &after.location),
        metadata: changed(&before.metadata, &after.metadata),
    };
    (!patch.is_empty()).then_some(patch)
}

fn diff_story_beat(before: &StoryBeat, after: &StoryBeat) -> Option<StoryBeatPatch> {
    let patch = StoryBeatPatch {
        status: changed(&before.status, &after.status),
        description: changed(&before.description, &after.description),
        resolved_at: changed(&before.resolved_at, &after.resolved_at),
        metadata: changed(&before.metadata, &after.metadata),
    };
    (!patch.is_empty()).then_some(patch)
}

fn has_label<T: WorldEntity>(items: &[T], label: &str) -> bool {
    items.iter().any(|e| e.label().eq_ignore_ascii_case(label.trim()))
}

fn find_label_mut<'a, T: WorldEntity>(items: &'a mut [T], label: &str) -> Option<&'a mut T> {
    let wanted = label.trim();
    items.iter_mut().find(|e| e.label().eq_ignore_ascii_case(wanted))
}

fn dedupe(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for v in values {
        let v = v.trim().to_string();
        if !v.is_empty() && !out.iter().any(|o| o.eq_ignore_ascii_case(&v)) {
            out.push(v);
        }
    }
    out
}

fn edit_list(list: &mut Vec<String>, add: &[String], remove: &[String]) {
    list.retain(|v| !remove.iter().any(|r| r.trim().eq_ignore_ascii_case(v)));
    for a in add {
        let a = a.trim();
        if !a.is_empty() && !list.iter().any(|v| v.eq_ignore_ascii_case(a)) {
            list.push(a.to_string());
        }
    }
}

fn merge_metadata(target: &mut Metadata, incoming: &Metadata) {
    for (k, v) in incoming {
        target.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{
        CharacterChanges, CharacterUpdate, NewItem, NewLocation, SceneUpdate, StoryBeatChanges,
        StoryBeatUpdate,
    };
    use crate::world::model::StoryEnvironment;

    fn view(scope: &StoryScope) -> WorldView {
        let mut tavern = Location::new(scope, "Tavern");
        tavern.visited = true;
        tavern.current = true;
        let mut env = StoryEnvironment::new(scope);
        env.current_location_id = Some(tavern.id.clone());
        let mut mira = Character::new(scope, "Mira");
        mira.traits = vec!["curious".into()];
        WorldView {
            environment: env,
            characters: vec![mira],
            locations: vec![tavern],
            items: vec![],
            story_beats: vec![StoryBeat::new(scope, "Find the map", Utc::now())],
        }
    }

    #[test]
    fn test_scene_change_creates_location_and_unsets_previous() {
        let scope = StoryScope::main("s1");
        let v = view(&scope);
        let result = ClassificationResult {
            scene: SceneUpdate {
                current_location_name: Some("Docks".into()),
                present_character_names: vec!["mira".into()],
                time_progression: "hours".into(),
            },
            ..Default::default()
        };
        let plan = ApplyPlan::resolve(&result, &v, &scope, Utc::now());

        assert_eq!(plan.new_locations.len(), 1);
        let docks = &plan.new_locations[0];
        assert!(docks.current && docks.visited);
        assert_eq!(plan.current_location_id.as_deref(), Some(docks.id.as_str()));
        assert_eq!(plan.location_patches.len(), 1);
        assert_eq!(plan.location_patches[0].1.current, Some(false));
        assert_eq!(plan.time_tracker, Some(TimeTracker::new(0, 0, 2, 0)));
        assert_eq!(plan.present_character_ids, vec![v.characters[0].id.clone()]);
    }

    #[test]
    fn test_duplicate_new_entities_are_skipped() {
        let scope = StoryScope::main("s1");
        let v = view(&scope);
        let mut result = ClassificationResult::default();
        result.entry_updates.new_locations = vec![
            NewLocation {
                name: "tavern".into(),
                ..Default::default()
            },
            NewLocation {
                name: "Cellar".into(),
                ..Default::default()
            },
            NewLocation {
                name: "CELLAR".into(),
                ..Default::default()
            },
        ];
        let plan = ApplyPlan::resolve(&result, &v, &scope, Utc::now());
        assert_eq!(plan.new_locations.len(), 1);
        assert_eq!(plan.new_locations[0].name, "Cellar");
    }

    #[test]
    fn test_updates_fold_into_single_patch_with_changed_fields_only() {
        let scope = StoryScope::main("s1");
        let v = view(&scope);
        let mut result = ClassificationResult::default();
        result.entry_updates.character_updates = vec![
            CharacterUpdate {
                name: "Mira".into(),
                changes: CharacterChanges {
                    add_traits: vec!["wary".into()],
                    ..Default::default()
                },
            },
            CharacterUpdate {
                name: "MIRA".into(),
                changes: CharacterChanges {
                    status: Some("dead".into()),
                    ..Default::default()
                },
            },
            CharacterUpdate {
                name: "Nobody".into(),
                changes: CharacterChanges::default(),
            },
        ];
        let plan = ApplyPlan::resolve(&result, &v, &scope, Utc::now());
        assert_eq!(plan.character_patches.len(), 1);
        let patch = &plan.character_patches[0].1;
        assert_eq!(patch.status, Some(CharacterStatus::Deceased));
        assert_eq!(
            patch.traits.as_deref(),
            Some(&["curious".to_string(), "wary".to_string()][..])
        );
        assert!(patch.relationship.is_none());
    }

    #[test]
    fn test_beat_resolution_sets_resolved_at() {
        let scope = StoryScope::main("s1");
        let v = view(&scope);
        let now = Utc::now();
        let mut result = ClassificationResult::default();
        result.entry_updates.story_beat_updates = vec![StoryBeatUpdate {
            title: "find the map".into(),
            changes: StoryBeatChanges {
                status: Some("completed".into()),
                ..Default::default()
            },
        }];
        let plan = ApplyPlan::resolve(&result, &v, &scope, now);
        let patch = &plan.story_beat_patches[0].1;
        assert_eq!(patch.status, Some(BeatStatus::Completed));
        assert_eq!(patch.resolved_at, Some(Some(now)));
    }

    #[test]
    fn test_update_targeting_new_entity_rewrites_it() {
        let scope = StoryScope::main("s1");
        let v = view(&scope);
        let mut result = ClassificationResult::default();
        result.entry_updates.new_items = vec![NewItem {
            name: "Coin".into(),
            quantity: Some(1),
            ..Default::default()
        }];
        result.entry_updates.item_updates = vec![crate::classifier::ItemUpdate {
            name: "coin".into(),
            changes: crate::classifier::ItemChanges {
                quantity: Some(3),
                ..Default::default()
            },
        }];
        let plan = ApplyPlan::resolve(&result, &v, &scope, Utc::now());
        assert_eq!(plan.new_items[0].quantity, 3);
        assert!(plan.item_patches.is_empty());
    }

    #[tokio::test]
    async fn test_apply_to_entry_records_delta_before_mutating() {
        use crate::store::InMemoryWorldStore;
        use crate::world::model::{EntryType, StoryEntry};

        let store = InMemoryWorldStore::new();
        let scope = StoryScope::main("s1");
        let result = ClassificationResult {
            entry_updates: crate::classifier::EntryUpdates {
                new_items: vec![NewItem {
                    name: "Lantern".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };

        // 条目不存在：增量无处记录，世界状态保持不变
        let err = ClassificationApplier::apply_to_entry(&store, &scope, "missing", &result).await;
        assert!(err.is_err());
        assert!(store.items(&scope).await.unwrap().is_empty());

        let entry = StoryEntry::new(&scope, 0, EntryType::Narration, "A lantern glints.");
        let id = entry.id.clone();
        store.add_entry(entry).await.unwrap();
        let outcome = ClassificationApplier::apply_to_entry(&store, &scope, &id, &result)
            .await
            .unwrap();
        let items = store.items(&scope).await.unwrap();
        assert_eq!(items.len(), 1);
        let stored = store.entries(&scope).await.unwrap().remove(0);
        assert_eq!(stored.world_state_delta, Some(outcome.delta));
        assert_eq!(
            stored.world_state_delta.unwrap().created_entities.item_ids,
            vec![items[0].id.clone()]
        );
    }

    #[test]
    fn test_empty_result_is_noop() {
        let scope = StoryScope::main("s1");
        let plan = ApplyPlan::resolve(&ClassificationResult::default(), &view(&scope), &scope, Utc::now());
        assert!(plan.is_noop());
    }
}
