//! 回滚引擎：逆转目标位置及之后的全部世界状态增量
//!
//! 分类在游玩中按位置递增应用，精确逆转必须严格按位置递减执行。回滚尽力而为、从不失败：
//! 单个实体的失败记录日志后跳过，最终以「已还原数 / 尝试数」汇报。
//! 部分失败时保留失败条目及其之前条目的增量，重跑同一目标会再次完整逆转这段区间。

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::{StoreError, WorldStore};
use crate::world::{EntityId, EntityKind, StoryScope, WorldStateDelta};

/// 单类实体的尝试 / 成功计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub attempted: usize,
    pub succeeded: usize,
}

impl KindCounts {
    fn track(&mut self, ok: bool) {
        self.attempted += 1;
        if ok {
            self.succeeded += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackSummary {
    pub target_position: u64,
    /// 被逆转的条目数（含部分失败的条目）
    pub entries_reverted: usize,
    /// 增量被完整逆转并清除的条目数
    pub entries_cleared: usize,
    /// 部分逆转失败的条目
    pub failed_entries: Vec<EntityId>,
    pub characters: KindCounts,
    pub locations: KindCounts,
    pub items: KindCounts,
    pub story_beats: KindCounts,
    pub environment_restored: bool,
    pub snapshots_purged: usize,
    pub overrides_pruned: usize,
}

impl RollbackSummary {
    fn counts_mut(&mut self, kind: EntityKind) -> &mut KindCounts {
        match kind {
            EntityKind::Character => &mut self.characters,
            EntityKind::Location => &mut self.locations,
            EntityKind::Item => &mut self.items,
            EntityKind::StoryBeat => &mut self.story_beats,
        }
    }

    pub fn attempted(&self) -> usize {
        self.characters.attempted
            + self.locations.attempted
            + self.items.attempted
            + self.story_beats.attempted
    }

    pub fn succeeded(&self) -> usize {
        self.characters.succeeded
            + self.locations.succeeded
            + self.items.succeeded
            + self.story_beats.succeeded
    }

    pub fn is_complete(&self) -> bool {
        self.attempted() == self.succeeded()
    }

    /// 如 "12 of 14 restored"
    pub fn describe(&self) -> String {
        format!("{} of {} restored", self.succeeded(), self.attempted())
    }
}

pub struct RollbackEngine {
    store: Arc<dyn WorldStore>,
}

impl RollbackEngine {
    pub fn new(store: Arc<dyn WorldStore>) -> Self {
        Self { store }
    }

    /// 逆转 position ≥ target 的所有增量。重复执行同一目标是空操作。
    pub async fn rollback_to(&self, scope: &StoryScope, target: u64) -> RollbackSummary {
        let mut summary = RollbackSummary {
            target_position: target,
            ..Default::default()
        };

        let mut entries = match self.store.entries(scope).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "rollback could not list story entries");
                return summary;
            }
        };
        entries.retain(|e| e.position >= target && e.world_state_delta.is_some());
        entries.sort_by(|a, b| b.position.cmp(&a.position));

        // 一旦某个条目部分失败，它及更早条目的增量都保留，重跑时仍按完整的递减序列逆转
        let mut keep_deltas = false;
        let mut earliest: Option<WorldStateDelta> = None;
        for entry in entries {
            let Some(delta) = entry.world_state_delta else {
                continue;
            };
            debug!(position = entry.position, ops = delta.operation_count(), "reverting delta");
            let complete = self.revert(scope, &delta, &mut summary).await;
            summary.entries_reverted += 1;
            if !complete {
                summary.failed_entries.push(entry.id.clone());
                keep_deltas = true;
            }

            if !keep_deltas {
                match self.store.set_entry_delta(scope, &entry.id, None).await {
                    Ok(()) => summary.entries_cleared += 1,
                    Err(e) => warn!(entry = %entry.id, error = %e, "failed to clear reverted delta"),
                }
            }
            earliest = Some(delta);
        }

        if let Some(delta) = earliest {
            summary.environment_restored = self.restore_environment(scope, &delta).await;
        }

        match self
            .store
            .delete_auto_checkpoints_from(scope, target.saturating_sub(1))
            .await
        {
            Ok(n) => summary.snapshots_purged = n,
            Err(e) => warn!(error = %e, "failed to purge auto checkpoints"),
        }
        match self.store.prune_redundant_overrides(scope).await {
            Ok(n) => summary.overrides_pruned = n,
            Err(e) => warn!(error = %e, "failed to prune branch overrides"),
        }

        if summary.is_complete() {
            info!(target, entries = summary.entries_reverted, "rollback complete: {}", summary.describe());
        } else {
            warn!(target, entries = summary.entries_reverted, "rollback partially failed: {}", summary.describe());
        }
        summary
    }

    /// 逆转单个增量；全部实体操作成功时返回 true
    async fn revert(&self, scope: &StoryScope, delta: &WorldStateDelta, summary: &mut RollbackSummary) -> bool {
        let store = self.store.as_ref();
        let created = &delta.created_entities;
        let mut complete = true;
        let mut track = |kind: EntityKind, id: &str, result: Result<(), StoreError>, summary: &mut RollbackSummary| {
            let ok = match result {
                Ok(()) => true,
                Err(e) => {
                    warn!(kind = kind.as_str(), id, error = %e, "rollback operation failed");
                    false
                }
            };
            summary.counts_mut(kind).track(ok);
            complete &= ok;
        };

        for id in &created.character_ids {
            track(EntityKind::Character, id, delete_ok(store.delete_character(scope, id).await), summary);
        }
        for id in &created.location_ids {
            track(EntityKind::Location, id, delete_ok(store.delete_location(scope, id).await), summary);
        }
        for id in &created.item_ids {
            track(EntityKind::Item, id, delete_ok(store.delete_item(scope, id).await), summary);
        }
        for id in &created.story_beat_ids {
            track(EntityKind::StoryBeat, id, delete_ok(store.delete_story_beat(scope, id).await), summary);
        }

        let previous = &delta.previous_state;
        for snap in &previous.characters {
            track(EntityKind::Character, &snap.id, store.update_character(scope, &snap.id, &snap.to_patch()).await, summary);
        }
        for snap in &previous.locations {
            track(EntityKind::Location, &snap.id, store.update_location(scope, &snap.id, &snap.to_patch()).await, summary);
        }
        for snap in &previous.items {
            track(EntityKind::Item, &snap.id, store.update_item(scope, &snap.id, &snap.to_patch()).await, summary);
        }
        for snap in &previous.story_beats {
            track(EntityKind::StoryBeat, &snap.id, store.update_story_beat(scope, &snap.id, &snap.to_patch()).await, summary);
        }
        complete
    }

    async fn restore_environment(&self, scope: &StoryScope, delta: &WorldStateDelta) -> bool {
        let mut env = match self.store.environment(scope).await {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "failed to read story environment for rollback");
                return false;
            }
        };
        env.current_location_id = delta.previous_state.current_location_id.clone();
        env.time_tracker = delta.previous_state.time_tracker;
        match self.store.set_environment(scope, env).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to restore story environment");
                false
            }
        }
    }
}

/// 删除时实体已不存在，目标状态已达成，视为成功
fn delete_ok(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(StoreError::NotFound { kind, id }) => {
            debug!(kind, id = %id, "entity already absent");
            Ok(())
        }
        other => other,
    }
}
