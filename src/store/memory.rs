//! 内存参考实现：InMemoryWorldStore
//!
//! 所有集合放在一把 tokio RwLock 之后。实体集合按 (story, branch) 归属存行，
//! 分支对主线实体的修改写入覆盖表。只支持一级分支（分支的父线总是主线）。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::lore::LoreEntry;
use crate::store::{Checkpoint, SnapshotOptions, StoreError, StorySnapshot, WorldStore};
use crate::world::{
    Chapter, Character, CharacterPatch, Item, ItemPatch, Location, LocationPatch, StoryBeat,
    StoryBeatPatch, StoryEntry, StoryEnvironment, StoryScope, WorldEntity, WorldStateDelta,
};

/// 单类实体：自有行 + 分支覆盖（键为 (story, branch, 原 id)）
struct Collection<T: WorldEntity> {
    rows: Vec<T>,
    overrides: HashMap<(String, String, String), T>,
}

impl<T: WorldEntity> Default for Collection<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            overrides: HashMap::new(),
        }
    }
}

fn owned_by<T: WorldEntity>(e: &T, scope: &StoryScope) -> bool {
    e.story_id() == scope.story_id && e.branch_id() == scope.branch_ref()
}

fn is_main<T: WorldEntity>(e: &T, story_id: &str) -> bool {
    e.story_id() == story_id && e.branch_id().is_none()
}

fn override_key(scope: &StoryScope, branch: &str, id: &str) -> (String, String, String) {
    (scope.story_id.clone(), branch.to_string(), id.to_string())
}

impl<T: WorldEntity> Collection<T> {
    fn view(&self, scope: &StoryScope) -> Vec<T> {
        match scope.branch_ref() {
            None => self
                .rows
                .iter()
                .filter(|e| is_main(*e, &scope.story_id))
                .cloned()
                .collect(),
            Some(branch) => self
                .rows
                .iter()
                .filter_map(|e| {
                    if is_main(e, &scope.story_id) {
                        let key = override_key(scope, branch, e.id());
                        Some(self.overrides.get(&key).unwrap_or(e).clone())
                    } else if owned_by(e, scope) {
                        Some(e.clone())
                    } else {
                        None
                    }
                })
                .collect(),
        }
    }

    fn add(&mut self, scope: &StoryScope, mut entity: T) -> Result<(), StoreError> {
        if self.rows.iter().any(|e| e.id() == entity.id()) {
            return Err(StoreError::Duplicate {
                kind: T::KIND.as_str(),
                id: entity.id().to_string(),
            });
        }
        entity.set_branch_id(scope.branch_id.clone());
        self.rows.push(entity);
        Ok(())
    }

    fn update(&mut self, scope: &StoryScope, id: &str, patch: &T::Patch) -> Result<(), StoreError> {
        if let Some(row) = self
            .rows
            .iter_mut()
            .find(|e| e.id() == id && owned_by(*e, scope))
        {
            row.apply_patch(patch);
            return Ok(());
        }

        // 分支内修改主线实体：写时复制
        let Some(branch) = scope.branch_ref() else {
            return Err(StoreError::not_found(T::KIND, id));
        };
        let Some(original) = self
            .rows
            .iter()
            .find(|e| e.id() == id && is_main(*e, &scope.story_id))
        else {
            return Err(StoreError::not_found(T::KIND, id));
        };
        let key = override_key(scope, branch, id);
        let entry = self.overrides.entry(key).or_insert_with(|| {
            let mut copy = original.clone();
            copy.set_branch_id(Some(branch.to_string()));
            copy
        });
        entry.apply_patch(patch);
        Ok(())
    }

    fn delete(&mut self, scope: &StoryScope, id: &str) -> Result<(), StoreError> {
        if let Some(pos) = self
            .rows
            .iter()
            .position(|e| e.id() == id && owned_by(e, scope))
        {
            self.rows.remove(pos);
            if scope.branch_id.is_none() {
                self.overrides
                    .retain(|(story, _, oid), _| !(story == &scope.story_id && oid == id));
            }
            return Ok(());
        }
        if scope.branch_id.is_some()
            && self
                .rows
                .iter()
                .any(|e| e.id() == id && is_main(e, &scope.story_id))
        {
            return Err(StoreError::NotOwnedByBranch {
                kind: T::KIND.as_str(),
                id: id.to_string(),
            });
        }
        Err(StoreError::not_found(T::KIND, id))
    }

    /// 用快照内容替换分支视图
    fn restore(&mut self, scope: &StoryScope, snapshot: &[T]) {
        self.rows.retain(|e| !owned_by(e, scope));
        match scope.branch_ref() {
            None => {
                self.rows.extend(snapshot.iter().cloned().map(|mut e| {
                    e.set_branch_id(None);
                    e
                }));
            }
            Some(branch) => {
                self.overrides
                    .retain(|(story, b, _), _| !(story == &scope.story_id && b == branch));
                for entity in snapshot {
                    let mut copy = entity.clone();
                    copy.set_branch_id(Some(branch.to_string()));
                    let main = self
                        .rows
                        .iter()
                        .find(|e| e.id() == entity.id() && is_main(*e, &scope.story_id));
                    match main {
                        Some(original) if original.same_content(entity) => {}
                        Some(_) => {
                            self.overrides
                                .insert(override_key(scope, branch, entity.id()), copy);
                        }
                        None => self.rows.push(copy),
                    }
                }
            }
        }
    }

    fn prune_overrides(&mut self, scope: &StoryScope) -> usize {
        let Some(branch) = scope.branch_ref() else {
            return 0;
        };
        let before = self.overrides.len();
        let rows = &self.rows;
        self.overrides.retain(|(story, b, id), copy| {
            if story != &scope.story_id || b != branch {
                return true;
            }
            match rows.iter().find(|e| e.id() == id && is_main(*e, story)) {
                Some(original) => !original.same_content(copy),
                None => false,
            }
        });
        before - self.overrides.len()
    }
}

#[derive(Default)]
struct Inner {
    environments: HashMap<StoryScope, StoryEnvironment>,
    characters: Collection<Character>,
    locations: Collection<Location>,
    items: Collection<Item>,
    story_beats: Collection<StoryBeat>,
    lore: Vec<LoreEntry>,
    entries: Vec<StoryEntry>,
    chapters: Vec<Chapter>,
    checkpoints: Vec<Checkpoint>,
}

fn entry_in_scope(e: &StoryEntry, scope: &StoryScope) -> bool {
    e.story_id == scope.story_id && e.branch_id.as_deref() == scope.branch_ref()
}

impl Inner {
    fn environment(&self, scope: &StoryScope) -> StoryEnvironment {
        self.environments
            .get(scope)
            .cloned()
            .unwrap_or_else(|| StoryEnvironment::new(scope))
    }

    fn entries_for(&self, scope: &StoryScope) -> Vec<StoryEntry> {
        let mut list: Vec<StoryEntry> = self
            .entries
            .iter()
            .filter(|e| entry_in_scope(e, scope))
            .cloned()
            .collect();
        list.sort_by_key(|e| e.position);
        list
    }

    fn entry_mut(&mut self, scope: &StoryScope, id: &str) -> Result<&mut StoryEntry, StoreError> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id && entry_in_scope(e, scope))
            .ok_or_else(|| StoreError::NotFound {
                kind: "story_entry",
                id: id.to_string(),
            })
    }

    fn chapters_for(&self, scope: &StoryScope) -> Vec<Chapter> {
        let mut list: Vec<Chapter> = self
            .chapters
            .iter()
            .filter(|c| c.story_id == scope.story_id && c.branch_id.as_deref() == scope.branch_ref())
            .cloned()
            .collect();
        list.sort_by_key(|c| c.number);
        list
    }
}

/// 内存存储（测试与无头运行使用）
#[derive(Default)]
pub struct InMemoryWorldStore {
    inner: RwLock<Inner>,
}

impl InMemoryWorldStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前分支覆盖数量（诊断用）
    pub async fn override_count(&self, scope: &StoryScope) -> usize {
        let inner = self.inner.read().await;
        let Some(branch) = scope.branch_ref() else {
            return 0;
        };
        let count = |keys: Vec<&(String, String, String)>| {
            keys.into_iter()
                .filter(|(s, b, _)| s == &scope.story_id && b == branch)
                .count()
        };
        count(inner.characters.overrides.keys().collect())
            + count(inner.locations.overrides.keys().collect())
            + count(inner.items.overrides.keys().collect())
            + count(inner.story_beats.overrides.keys().collect())
    }
}

#[async_trait]
impl WorldStore for InMemoryWorldStore {
    async fn environment(&self, scope: &StoryScope) -> Result<StoryEnvironment, StoreError> {
        Ok(self.inner.read().await.environment(scope))
    }

    async fn set_environment(&self, scope: &StoryScope, mut env: StoryEnvironment) -> Result<(), StoreError> {
        env.story_id = scope.story_id.clone();
        env.branch_id = scope.branch_id.clone();
        self.inner.write().await.environments.insert(scope.clone(), env);
        Ok(())
    }

    async fn characters(&self, scope: &StoryScope) -> Result<Vec<Character>, StoreError> {
        Ok(self.inner.read().await.characters.view(scope))
    }

    async fn add_character(&self, scope: &StoryScope, character: Character) -> Result<(), StoreError> {
        self.inner.write().await.characters.add(scope, character)
    }

    async fn update_character(&self, scope: &StoryScope, id: &str, patch: &CharacterPatch) -> Result<(), StoreError> {
        self.inner.write().await.characters.update(scope, id, patch)
    }

    async fn delete_character(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError> {
        self.inner.write().await.characters.delete(scope, id)
    }

    async fn locations(&self, scope: &StoryScope) -> Result<Vec<Location>, StoreError> {
        Ok(self.inner.read().await.locations.view(scope))
    }

    async fn add_location(&self, scope: &StoryScope, location: Location) -> Result<(), StoreError> {
        self.inner.write().await.locations.add(scope, location)
    }

    async fn update_location(&self, scope: &StoryScope, id: &str, patch: &LocationPatch) -> Result<(), StoreError> {
        self.inner.write().await.locations.update(scope, id, patch)
    }

    async fn delete_location(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError> {
        self.inner.write().await.locations.delete(scope, id)
    }

    async fn items(&self, scope: &StoryScope) -> Result<Vec<Item>, StoreError> {
        Ok(self.inner.read().await.items.view(scope))
    }

    async fn add_item(&self, scope: &StoryScope, item: Item) -> Result<(), StoreError> {
        self.inner.write().await.items.add(scope, item)
    }

    async fn update_item(&self, scope: &StoryScope, id: &str, patch: &ItemPatch) -> Result<(), StoreError> {
        self.inner.write().await.items.update(scope, id, patch)
    }

    async fn delete_item(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError> {
        self.inner.write().await.items.delete(scope, id)
    }

    async fn story_beats(&self, scope: &StoryScope) -> Result<Vec<StoryBeat>, StoreError> {
        Ok(self.inner.read().await.story_beats.view(scope))
    }

    async fn add_story_beat(&self, scope: &StoryScope, beat: StoryBeat) -> Result<(), StoreError> {
        self.inner.write().await.story_beats.add(scope, beat)
    }

    async fn update_story_beat(&self, scope: &StoryScope, id: &str, patch: &StoryBeatPatch) -> Result<(), StoreError> {
        self.inner.write().await.story_beats.update(scope, id, patch)
    }

    async fn delete_story_beat(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError> {
        self.inner.write().await.story_beats.delete(scope, id)
    }

    async fn lore_entries(&self, story_id: &str) -> Result<Vec<LoreEntry>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .lore
            .iter()
            .filter(|e| e.story_id == story_id)
            .cloned()
            .collect())
    }

    async fn upsert_lore_entry(&self, entry: LoreEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.lore.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => inner.lore.push(entry),
        }
        Ok(())
    }

    async fn delete_lore_entry(&self, story_id: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.lore.len();
        inner.lore.retain(|e| !(e.story_id == story_id && e.id == id));
        if inner.lore.len() == before {
            return Err(StoreError::NotFound {
                kind: "lore_entry",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn add_entry(&self, entry: StoryEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.entries.iter().any(|e| e.id == entry.id) {
            return Err(StoreError::Duplicate {
                kind: "story_entry",
                id: entry.id,
            });
        }
        let scope = StoryScope {
            story_id: entry.story_id.clone(),
            branch_id: entry.branch_id.clone(),
        };
        if let Some(last) = inner
            .entries
            .iter()
            .filter(|e| entry_in_scope(e, &scope))
            .map(|e| e.position)
            .max()
        {
            if entry.position <= last {
                return Err(StoreError::PositionOutOfOrder {
                    position: entry.position,
                    last,
                });
            }
        }
        inner.entries.push(entry);
        Ok(())
    }

    async fn entries(&self, scope: &StoryScope) -> Result<Vec<StoryEntry>, StoreError> {
        Ok(self.inner.read().await.entries_for(scope))
    }

    async fn set_entry_delta(
        &self,
        scope: &StoryScope,
        entry_id: &str,
        delta: Option<WorldStateDelta>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.entry_mut(scope, entry_id)?.world_state_delta = delta;
        Ok(())
    }

    async fn set_entry_translation(&self, scope: &StoryScope, entry_id: &str, translation: String) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.entry_mut(scope, entry_id)?.translated_content = Some(translation);
        Ok(())
    }

    async fn delete_entries_from(&self, scope: &StoryScope, from: u64) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|e| !(entry_in_scope(e, scope) && e.position >= from));
        Ok(before - inner.entries.len())
    }

    async fn next_position(&self, scope: &StoryScope) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .iter()
            .filter(|e| entry_in_scope(e, scope))
            .map(|e| e.position + 1)
            .max()
            .unwrap_or(0))
    }

    async fn add_chapter(&self, chapter: Chapter) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.chapters.iter().any(|c| c.id == chapter.id) {
            return Err(StoreError::Duplicate {
                kind: "chapter",
                id: chapter.id,
            });
        }
        inner.chapters.push(chapter);
        Ok(())
    }

    async fn chapters(&self, scope: &StoryScope) -> Result<Vec<Chapter>, StoreError> {
        Ok(self.inner.read().await.chapters_for(scope))
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.checkpoints.iter().any(|c| c.id == checkpoint.id) {
            return Err(StoreError::Duplicate {
                kind: "checkpoint",
                id: checkpoint.id,
            });
        }
        inner.checkpoints.push(checkpoint);
        Ok(())
    }

    async fn checkpoints(&self, scope: &StoryScope) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .iter()
            .filter(|c| c.story_id == scope.story_id && c.branch_id.as_deref() == scope.branch_ref())
            .cloned()
            .collect())
    }

    async fn delete_checkpoint(&self, scope: &StoryScope, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.checkpoints.len();
        inner.checkpoints.retain(|c| {
            !(c.id == id && c.story_id == scope.story_id && c.branch_id.as_deref() == scope.branch_ref())
        });
        if inner.checkpoints.len() == before {
            return Err(StoreError::NotFound {
                kind: "checkpoint",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_auto_checkpoints_from(&self, scope: &StoryScope, from: u64) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.checkpoints.len();
        inner.checkpoints.retain(|c| {
            let in_scope =
                c.story_id == scope.story_id && c.branch_id.as_deref() == scope.branch_ref();
            !(in_scope && c.auto && c.position >= from)
        });
        Ok(before - inner.checkpoints.len())
    }

    async fn capture_snapshot(&self, scope: &StoryScope, options: SnapshotOptions) -> Result<StorySnapshot, StoreError> {
        let inner = self.inner.read().await;
        Ok(StorySnapshot {
            environment: inner.environment(scope),
            characters: inner.characters.view(scope),
            locations: inner.locations.view(scope),
            items: inner.items.view(scope),
            story_beats: inner.story_beats.view(scope),
            lore_entries: inner
                .lore
                .iter()
                .filter(|e| e.story_id == scope.story_id)
                .cloned()
                .collect(),
            entries: inner.entries_for(scope),
            chapters: options.include_chapters.then(|| inner.chapters_for(scope)),
            captured_at: Utc::now(),
        })
    }

    async fn restore_snapshot(&self, scope: &StoryScope, snapshot: &StorySnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let mut env = snapshot.environment.clone();
        env.story_id = scope.story_id.clone();
        env.branch_id = scope.branch_id.clone();
        inner.environments.insert(scope.clone(), env);

        inner.characters.restore(scope, &snapshot.characters);
        inner.locations.restore(scope, &snapshot.locations);
        inner.items.restore(scope, &snapshot.items);
        inner.story_beats.restore(scope, &snapshot.story_beats);

        inner.lore.retain(|e| e.story_id != scope.story_id);
        inner.lore.extend(snapshot.lore_entries.iter().cloned());

        inner.entries.retain(|e| !entry_in_scope(e, scope));
        inner.entries.extend(snapshot.entries.iter().cloned().map(|mut e| {
            e.story_id = scope.story_id.clone();
            e.branch_id = scope.branch_id.clone();
            e
        }));

        if let Some(chapters) = &snapshot.chapters {
            inner.chapters.retain(|c| {
                !(c.story_id == scope.story_id && c.branch_id.as_deref() == scope.branch_ref())
            });
            inner.chapters.extend(chapters.iter().cloned());
        }
        debug!(story = %scope.story_id, entries = snapshot.entries.len(), "snapshot restored");
        Ok(())
    }

    async fn prune_redundant_overrides(&self, scope: &StoryScope) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.characters.prune_overrides(scope)
            + inner.locations.prune_overrides(scope)
            + inner.items.prune_overrides(scope)
            + inner.story_beats.prune_overrides(scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{CharacterStatus, EntryType};

    #[tokio::test]
    async fn test_branch_update_is_copy_on_write() {
        let store = InMemoryWorldStore::new();
        let main = StoryScope::main("s1");
        let branch = StoryScope::branch("s1", "b1");
        let hero = Character::new(&main, "Hero");
        store.add_character(&main, hero.clone()).await.unwrap();

        let patch = CharacterPatch {
            status: Some(CharacterStatus::Deceased),
            ..Default::default()
        };
        store.update_character(&branch, &hero.id, &patch).await.unwrap();

        let in_branch = store.characters(&branch).await.unwrap();
        assert_eq!(in_branch[0].status, CharacterStatus::Deceased);
        let in_main = store.characters(&main).await.unwrap();
        assert_eq!(in_main[0].status, CharacterStatus::Active);
        assert_eq!(store.override_count(&branch).await, 1);
    }

    #[tokio::test]
    async fn test_prune_removes_overrides_equal_to_original() {
        let store = InMemoryWorldStore::new();
        let main = StoryScope::main("s1");
        let branch = StoryScope::branch("s1", "b1");
        let hero = Character::new(&main, "Hero");
        store.add_character(&main, hero.clone()).await.unwrap();

        store
            .update_character(
                &branch,
                &hero.id,
                &CharacterPatch {
                    status: Some(CharacterStatus::Inactive),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_character(
                &branch,
                &hero.id,
                &CharacterPatch {
                    status: Some(CharacterStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.prune_redundant_overrides(&branch).await.unwrap(), 1);
        assert_eq!(store.override_count(&branch).await, 0);
    }

    #[tokio::test]
    async fn test_branch_cannot_delete_main_entity() {
        let store = InMemoryWorldStore::new();
        let main = StoryScope::main("s1");
        let branch = StoryScope::branch("s1", "b1");
        let inn = Location::new(&main, "Inn");
        store.add_location(&main, inn.clone()).await.unwrap();

        let err = store.delete_location(&branch, &inn.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotOwnedByBranch { .. }));
        assert!(matches!(
            store.delete_location(&main, "missing").await,
            Err(StoreError::NotFound { .. })
        ));
        store.delete_location(&main, &inn.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_entries_positions_are_strictly_increasing() {
        let store = InMemoryWorldStore::new();
        let scope = StoryScope::main("s1");
        assert_eq!(store.next_position(&scope).await.unwrap(), 0);
        store
            .add_entry(StoryEntry::new(&scope, 0, EntryType::UserAction, "look"))
            .await
            .unwrap();
        store
            .add_entry(StoryEntry::new(&scope, 1, EntryType::Narration, "You see a door."))
            .await
            .unwrap();
        let err = store
            .add_entry(StoryEntry::new(&scope, 1, EntryType::System, "dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PositionOutOfOrder { .. }));
        assert_eq!(store.next_position(&scope).await.unwrap(), 2);

        assert_eq!(store.delete_entries_from(&scope, 1).await.unwrap(), 1);
        assert_eq!(store.next_position(&scope).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore_without_chapters_keeps_chapters() {
        let store = InMemoryWorldStore::new();
        let scope = StoryScope::main("s1");
        store.add_item(&scope, Item::new(&scope, "Rope")).await.unwrap();
        let snapshot = store
            .capture_snapshot(&scope, SnapshotOptions { include_chapters: false })
            .await
            .unwrap();
        assert!(snapshot.chapters.is_none());

        store.add_item(&scope, Item::new(&scope, "Torch")).await.unwrap();
        store
            .add_chapter(Chapter {
                id: "c1".into(),
                story_id: "s1".into(),
                branch_id: None,
                number: 1,
                title: "Arrival".into(),
                start_position: 0,
                end_position: 0,
                summary: None,
            })
            .await
            .unwrap();

        store.restore_snapshot(&scope, &snapshot).await.unwrap();
        let items = store.items(&scope).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Rope");
        assert_eq!(store.chapters(&scope).await.unwrap().len(), 1);
    }
}
