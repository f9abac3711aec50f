//! 故事服务：检查点、章节、删除回合与设定集导入
//!
//! 检查点是命名的完整快照（含章节），与增量回滚相互独立；删除回合先回滚增量再删除条目。

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::AppContext;
use crate::events::AppEvent;
use crate::lore::classify::{LoreClassifyReport, LoreEntryClassifier};
use crate::lore::{CreatedBy, LoreEntry};
use crate::rollback::{RollbackEngine, RollbackSummary};
use crate::store::{Checkpoint, SnapshotOptions, StoreError};
use crate::world::{new_id, Chapter, StoryScope};

#[derive(Error, Debug)]
pub enum StoryError {
    #[error("checkpoint '{0}' not found")]
    CheckpointNotFound(String),

    #[error("invalid chapter range {start}..={end}")]
    InvalidChapterRange { start: u64, end: u64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub struct StoryService {
    ctx: AppContext,
    scope: StoryScope,
}

impl StoryService {
    pub fn new(ctx: AppContext, scope: StoryScope) -> Self {
        Self { ctx, scope }
    }

    pub fn scope(&self) -> &StoryScope {
        &self.scope
    }

    /// 保存当前分支的完整快照
    pub async fn create_checkpoint(&self, name: &str, auto: bool) -> Result<Checkpoint, StoryError> {
        let store = &self.ctx.store;
        let snapshot = store
            .capture_snapshot(&self.scope, SnapshotOptions::default())
            .await?;
        let checkpoint = Checkpoint {
            id: new_id(),
            story_id: self.scope.story_id.clone(),
            branch_id: self.scope.branch_id.clone(),
            name: name.to_string(),
            position: snapshot.last_position().unwrap_or(0),
            auto,
            created_at: Utc::now(),
            snapshot,
        };
        store.save_checkpoint(checkpoint.clone()).await?;
        info!(name, position = checkpoint.position, auto, "checkpoint created");

        self.ctx.bus.emit(AppEvent::CheckpointCreated {
            story_id: self.scope.story_id.clone(),
            checkpoint_id: checkpoint.id.clone(),
            name: checkpoint.name.clone(),
            auto,
        });
        Ok(checkpoint)
    }

    pub async fn checkpoints(&self) -> Result<Vec<Checkpoint>, StoryError> {
        Ok(self.ctx.store.checkpoints(&self.scope).await?)
    }

    /// 按 id 或名字恢复检查点；同名时取最新的一个
    pub async fn restore_checkpoint(&self, id_or_name: &str) -> Result<Checkpoint, StoryError> {
        let checkpoints = self.ctx.store.checkpoints(&self.scope).await?;
        let checkpoint = checkpoints
            .iter()
            .find(|c| c.id == id_or_name)
            .or_else(|| {
                checkpoints
                    .iter()
                    .filter(|c| c.name == id_or_name)
                    .max_by_key(|c| c.created_at)
            })
            .cloned()
            .ok_or_else(|| StoryError::CheckpointNotFound(id_or_name.to_string()))?;

        self.ctx
            .store
            .restore_snapshot(&self.scope, &checkpoint.snapshot)
            .await?;
        info!(name = %checkpoint.name, position = checkpoint.position, "checkpoint restored");

        self.ctx.bus.emit(AppEvent::CheckpointRestored {
            story_id: self.scope.story_id.clone(),
            checkpoint_id: checkpoint.id.clone(),
            name: checkpoint.name.clone(),
        });
        Ok(checkpoint)
    }

    /// 以 start..=end 的条目创建下一章
    pub async fn create_chapter(&self, title: &str, start: u64, end: u64) -> Result<Chapter, StoryError> {
        if start > end {
            return Err(StoryError::InvalidChapterRange { start, end });
        }
        let existing = self.ctx.store.chapters(&self.scope).await?;
        let number = existing.iter().map(|c| c.number).max().unwrap_or(0) + 1;
        let chapter = Chapter {
            id: new_id(),
            story_id: self.scope.story_id.clone(),
            branch_id: self.scope.branch_id.clone(),
            number,
            title: title.to_string(),
            start_position: start,
            end_position: end,
            summary: None,
        };
        self.ctx.store.add_chapter(chapter.clone()).await?;

        self.ctx.bus.emit(AppEvent::ChapterCreated {
            story_id: self.scope.story_id.clone(),
            chapter_id: chapter.id.clone(),
            number,
            title: chapter.title.clone(),
        });
        Ok(chapter)
    }

    /// 回滚 position 及之后的增量，然后删除这些条目
    pub async fn delete_entries_from(&self, position: u64) -> Result<RollbackSummary, StoryError> {
        let summary = RollbackEngine::new(self.ctx.store.clone())
            .rollback_to(&self.scope, position)
            .await;
        let deleted = self
            .ctx
            .store
            .delete_entries_from(&self.scope, position)
            .await?;
        info!(position, deleted, restored = %summary.describe(), "entries deleted");

        self.ctx.bus.emit(AppEvent::RollbackComplete {
            story_id: self.scope.story_id.clone(),
            target_position: position,
            summary: summary.describe(),
        });
        Ok(summary)
    }

    /// 导入设定集条目：与同名已有条目合并，导入的条目由 LLM 分批判定类型
    pub async fn import_lore(
        &self,
        entries: Vec<LoreEntry>,
        cancel: &CancellationToken,
    ) -> Result<LoreClassifyReport, StoryError> {
        let story_id = &self.scope.story_id;
        let existing = self.ctx.store.lore_entries(story_id).await?;

        let mut incoming: Vec<LoreEntry> = Vec::new();
        for mut entry in entries {
            entry.story_id = story_id.clone();
            match incoming
                .iter_mut()
                .find(|e| e.name.eq_ignore_ascii_case(&entry.name))
            {
                Some(same) => same.merge(&entry),
                None => incoming.push(entry),
            }
        }

        let mut to_classify: Vec<LoreEntry> = incoming
            .iter()
            .filter(|e| e.created_by == CreatedBy::Import)
            .cloned()
            .collect();
        let cfg = &self.ctx.config;
        let report = LoreEntryClassifier::new(self.ctx.llm.clone(), cfg.lore.batch_size)
            .with_model(cfg.llm.models.lore.clone())
            .classify_entries(&mut to_classify, cancel)
            .await;
        for classified in to_classify {
            if let Some(entry) = incoming.iter_mut().find(|e| e.id == classified.id) {
                entry.entry_type = classified.entry_type;
            }
        }

        let count = incoming.len();
        for entry in incoming {
            let merged = match existing
                .iter()
                .find(|e| e.name.eq_ignore_ascii_case(&entry.name))
            {
                Some(current) => {
                    let mut current = current.clone();
                    current.merge(&entry);
                    current
                }
                None => entry,
            };
            self.ctx.store.upsert_lore_entry(merged).await?;
        }

        info!(count, by_llm = report.by_llm, by_heuristic = report.by_heuristic, "lore entries imported");
        self.ctx.bus.emit(AppEvent::LoreEntriesUpdated {
            story_id: story_id.clone(),
            count,
        });
        Ok(report)
    }
}
