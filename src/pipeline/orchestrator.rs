//! 流水线编排器：每回合按固定顺序执行各阶段
//!
//! PreGeneration → Retrieval → Narrative → Classification → Translation → Image → PostGeneration。
//! 每个阶段开始前检查取消令牌：必需阶段（前三个）观察到取消时回合以 Aborted 结束；
//! 可选阶段跳过并记为 aborted；PostGeneration 总会执行（叙述条目此时已写入）。
//! 阶段之间只通过局部变量传递输出，不共享全局状态。

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::{
    ClassificationInput, ClassificationResult, ClassifyError, KnownEntities,
    LlmWorldStateClassifier, WorldStateClassifier,
};
use crate::core::{AppContext, PipelineError, SessionSupervisor};
use crate::events::AppEvent;
use crate::llm::{generate_cancellable, GenerateRequest, ImageGenerator, LlmError};
use crate::pipeline::events::{send_event, Phase, PhaseReport, PipelineEvent, SkipReason};
use crate::pipeline::prompts;
use crate::pipeline::turn::{RetryBackup, TurnResult};
use crate::retrieval::{
    ActivationTracker, EntryRetrievalEngine, LlmRelevanceSelector, RelevanceSelector,
    RetrievalRequest, RetrievalResult,
};
use crate::rollback::RollbackSummary;
use crate::store::{SnapshotOptions, StoreError};
use crate::story::{StoryError, StoryService};
use crate::world::{
    ClassificationApplier, EntityId, EntryType, StoryEntry, StoryScope, WorldStateDelta,
};

/// 可选阶段未产出结果的原因
enum PhaseFailure {
    Aborted,
    Failed(String),
}

impl From<StoreError> for PhaseFailure {
    fn from(e: StoreError) -> Self {
        PhaseFailure::Failed(e.to_string())
    }
}

/// 单回合的事件发送与阶段记录
struct TurnRun<'a> {
    tx: Option<&'a UnboundedSender<PipelineEvent>>,
    phases: Vec<PhaseReport>,
}

impl<'a> TurnRun<'a> {
    fn new(tx: Option<&'a UnboundedSender<PipelineEvent>>) -> Self {
        Self {
            tx,
            phases: Vec::with_capacity(Phase::ORDER.len()),
        }
    }

    fn start(&self, phase: Phase) -> Instant {
        debug!(%phase, "phase start");
        send_event(self.tx, PipelineEvent::PhaseStart { phase });
        Instant::now()
    }

    fn complete(&mut self, phase: Phase, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        send_event(
            self.tx,
            PipelineEvent::PhaseComplete {
                phase,
                skipped_reason: None,
                duration_ms,
            },
        );
        self.phases.push(PhaseReport {
            phase,
            skipped_reason: None,
            duration_ms,
        });
    }

    fn skip(&mut self, phase: Phase, reason: SkipReason) {
        debug!(%phase, ?reason, "phase skipped");
        send_event(
            self.tx,
            PipelineEvent::PhaseComplete {
                phase,
                skipped_reason: Some(reason),
                duration_ms: 0,
            },
        );
        self.phases.push(PhaseReport {
            phase,
            skipped_reason: Some(reason),
            duration_ms: 0,
        });
    }

    fn abort(&self, phase: Phase) {
        info!(%phase, "turn aborted");
        send_event(self.tx, PipelineEvent::Aborted { phase });
    }

    /// 可选阶段观察到取消：发出 aborted 事件并记为跳过
    fn skip_aborted(&mut self, phase: Phase) {
        debug!(%phase, "optional phase aborted");
        send_event(self.tx, PipelineEvent::Aborted { phase });
        self.skip(phase, SkipReason::Aborted);
    }

    fn error(&self, phase: Phase, message: String, fatal: bool) {
        if fatal {
            warn!(%phase, error = %message, "fatal phase error");
        } else {
            warn!(%phase, error = %message, "phase degraded");
        }
        send_event(
            self.tx,
            PipelineEvent::Error {
                phase,
                message,
                fatal,
            },
        );
    }
}

/// 单个故事（分支）的回合流水线
pub struct PipelineOrchestrator {
    ctx: AppContext,
    scope: StoryScope,
    classifier: Arc<dyn WorldStateClassifier>,
    retrieval: EntryRetrievalEngine,
    tracker: Mutex<ActivationTracker>,
    last_backup: Mutex<Option<RetryBackup>>,
    supervisor: SessionSupervisor,
}

impl PipelineOrchestrator {
    pub fn new(ctx: AppContext, scope: StoryScope) -> Self {
        let cfg = ctx.config.clone();
        let classifier = Arc::new(
            LlmWorldStateClassifier::new(ctx.llm.clone())
                .with_model(cfg.llm.models.classification.clone()),
        );
        let selector: Option<Arc<dyn RelevanceSelector>> = if cfg.retrieval.llm_relevance {
            Some(Arc::new(
                LlmRelevanceSelector::new(ctx.llm.clone())
                    .with_model(cfg.llm.models.retrieval.clone()),
            ))
        } else {
            None
        };

        Self {
            retrieval: EntryRetrievalEngine::new(selector, cfg.retrieval.options()),
            tracker: Mutex::new(ActivationTracker::new(cfg.retrieval.sticky_window)),
            last_backup: Mutex::new(None),
            supervisor: SessionSupervisor::new(),
            classifier,
            ctx,
            scope,
        }
    }

    /// 替换分类器（测试或自定义实现）
    pub fn with_classifier(mut self, classifier: Arc<dyn WorldStateClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// 替换 Tier 3 相关性选择器
    pub fn with_relevance_selector(mut self, selector: Arc<dyn RelevanceSelector>) -> Self {
        self.retrieval = EntryRetrievalEngine::new(Some(selector), self.ctx.config.retrieval.options());
        self
    }

    pub fn scope(&self) -> &StoryScope {
        &self.scope
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 同一作用域的故事服务（检查点、章节等）
    pub fn story(&self) -> StoryService {
        StoryService::new(self.ctx.clone(), self.scope.clone())
    }

    /// 取消进行中的回合
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    pub async fn tracker(&self) -> ActivationTracker {
        self.tracker.lock().await.clone()
    }

    pub async fn last_backup(&self) -> Option<RetryBackup> {
        self.last_backup.lock().await.clone()
    }

    /// 执行一个回合；event_tx 接收阶段过程事件
    pub async fn execute(
        &self,
        input: &str,
        event_tx: Option<&UnboundedSender<PipelineEvent>>,
    ) -> Result<TurnResult, PipelineError> {
        let token = self.supervisor.begin_turn();
        self.execute_with_token(input, event_tx, token).await
    }

    /// 在后台任务中执行回合，返回事件接收端与 JoinHandle
    pub fn spawn(
        self: Arc<Self>,
        input: String,
    ) -> (
        UnboundedReceiver<PipelineEvent>,
        JoinHandle<Result<TurnResult, PipelineError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        // 令牌在 spawn 前取得，之后的 cancel() 一定作用于本回合
        let token = self.supervisor.begin_turn();
        let handle = tokio::spawn(async move { self.execute_with_token(&input, Some(&tx), token).await });
        (rx, handle)
    }

    /// 使用外部令牌执行回合
    pub async fn execute_with_token(
        &self,
        input: &str,
        event_tx: Option<&UnboundedSender<PipelineEvent>>,
        token: CancellationToken,
    ) -> Result<TurnResult, PipelineError> {
        let cfg = self.ctx.config.clone();
        let store = self.ctx.store.clone();
        let scope = &self.scope;
        let mut run = TurnRun::new(event_tx);
        let input = input.trim();

        if input.is_empty() {
            run.skip(Phase::PreGeneration, SkipReason::EmptyInput);
            return Err(PipelineError::EmptyInput);
        }

        // PreGeneration
        if token.is_cancelled() {
            run.abort(Phase::PreGeneration);
            return Err(PipelineError::Aborted {
                phase: Phase::PreGeneration,
                backup: None,
            });
        }
        let started = run.start(Phase::PreGeneration);
        let (backup, user_entry) = match self.pre_generation(input).await {
            Ok(v) => v,
            Err(e) => {
                run.error(Phase::PreGeneration, e.to_string(), true);
                return Err(e.into());
            }
        };
        run.complete(Phase::PreGeneration, started);

        // Retrieval
        if token.is_cancelled() {
            run.abort(Phase::Retrieval);
            return Err(PipelineError::Aborted {
                phase: Phase::Retrieval,
                backup: Some(Box::new(backup)),
            });
        }
        let started = run.start(Phase::Retrieval);
        let retrieval = match self.retrieve(input, user_entry.position, &token).await {
            Ok(r) => r,
            Err(e) => {
                run.error(Phase::Retrieval, e.to_string(), false);
                RetrievalResult::default()
            }
        };
        run.complete(Phase::Retrieval, started);

        // Narrative
        if token.is_cancelled() {
            run.abort(Phase::Narrative);
            return Err(PipelineError::Aborted {
                phase: Phase::Narrative,
                backup: Some(Box::new(backup)),
            });
        }
        let started = run.start(Phase::Narrative);
        let content = match self.narrate(input, &user_entry, &retrieval, &token, event_tx).await {
            Ok(text) => text,
            Err(LlmError::Cancelled) => {
                run.abort(Phase::Narrative);
                return Err(PipelineError::Aborted {
                    phase: Phase::Narrative,
                    backup: Some(Box::new(backup)),
                });
            }
            Err(e) => {
                let message = e.to_string();
                run.error(Phase::Narrative, message.clone(), true);
                return Err(PipelineError::NarrativeFailed {
                    message,
                    backup: Box::new(backup),
                });
            }
        };
        let mut narration_entry = match self.persist_narration(content).await {
            Ok(entry) => entry,
            Err(e) => {
                run.error(Phase::Narrative, e.to_string(), true);
                return Err(e.into());
            }
        };
        run.complete(Phase::Narrative, started);

        // Classification
        let (classification, delta) = if !cfg.pipeline.classification_enabled {
            run.skip(Phase::Classification, SkipReason::Disabled);
            (None, None)
        } else if token.is_cancelled() {
            run.skip_aborted(Phase::Classification);
            (None, None)
        } else {
            let started = run.start(Phase::Classification);
            match self.classify(input, &narration_entry, &token, &run).await {
                Ok((result, delta)) => {
                    run.complete(Phase::Classification, started);
                    (Some(result), Some(delta))
                }
                Err(PhaseFailure::Aborted) => {
                    run.skip_aborted(Phase::Classification);
                    (None, None)
                }
                Err(PhaseFailure::Failed(message)) => {
                    run.error(Phase::Classification, message, false);
                    run.complete(Phase::Classification, started);
                    (None, None)
                }
            }
        };
        narration_entry.world_state_delta = delta.clone();

        // Translation
        let target_language = cfg
            .pipeline
            .target_language
            .clone()
            .filter(|l| !l.trim().is_empty());
        let translation = match target_language {
            _ if !cfg.pipeline.translation_enabled => {
                run.skip(Phase::Translation, SkipReason::Disabled);
                None
            }
            None => {
                run.skip(Phase::Translation, SkipReason::NotConfigured);
                None
            }
            Some(_) if token.is_cancelled() => {
                run.skip_aborted(Phase::Translation);
                None
            }
            Some(language) => {
                let started = run.start(Phase::Translation);
                match self.translate(&narration_entry.content, &language, &token).await {
                    Ok(text) => {
                        run.complete(Phase::Translation, started);
                        Some((language, text))
                    }
                    Err(LlmError::Cancelled) => {
                        run.skip_aborted(Phase::Translation);
                        None
                    }
                    Err(e) => {
                        run.error(Phase::Translation, e.to_string(), false);
                        run.complete(Phase::Translation, started);
                        None
                    }
                }
            }
        };

        // Image
        let image_pending = match &self.ctx.image {
            _ if !cfg.pipeline.image_enabled => {
                run.skip(Phase::Image, SkipReason::Disabled);
                false
            }
            None => {
                run.skip(Phase::Image, SkipReason::NotConfigured);
                false
            }
            Some(_) if cfg.pipeline.inline_images => {
                run.skip(Phase::Image, SkipReason::InlineMode);
                false
            }
            Some(_) if token.is_cancelled() => {
                run.skip_aborted(Phase::Image);
                false
            }
            Some(generator) => {
                let started = run.start(Phase::Image);
                self.spawn_image(generator.clone(), &narration_entry, token.child_token(), event_tx);
                run.complete(Phase::Image, started);
                true
            }
        };

        // PostGeneration
        let started = run.start(Phase::PostGeneration);
        if let Some((language, text)) = &translation {
            match store
                .set_entry_translation(scope, &narration_entry.id, text.clone())
                .await
            {
                Ok(()) => {
                    narration_entry.translated_content = Some(text.clone());
                    self.ctx.bus.emit(AppEvent::TranslationComplete {
                        story_id: scope.story_id.clone(),
                        entry_id: narration_entry.id.clone(),
                        language: language.clone(),
                    });
                }
                Err(e) => run.error(Phase::PostGeneration, e.to_string(), false),
            }
        }
        let auto_checkpoint_id = self.auto_checkpoint(&run).await;
        self.ctx.bus.emit(AppEvent::StateUpdated {
            story_id: scope.story_id.clone(),
            branch_id: scope.branch_id.clone(),
            position: narration_entry.position,
        });
        run.complete(Phase::PostGeneration, started);

        let skipped = run.phases.iter().filter(|p| p.skipped()).count();
        info!(
            position = narration_entry.position,
            skipped,
            classified = classification.is_some(),
            "turn complete"
        );

        Ok(TurnResult {
            user_entry,
            narration_entry,
            retrieval,
            classification,
            delta,
            translation: translation.map(|(_, text)| text),
            image_pending,
            auto_checkpoint_id,
            phases: run.phases,
        })
    }

    /// 捕获重试备份（不含章节）并写入用户条目
    async fn pre_generation(&self, input: &str) -> Result<(RetryBackup, StoryEntry), StoreError> {
        let store = &self.ctx.store;
        let snapshot = store
            .capture_snapshot(&self.scope, SnapshotOptions { include_chapters: false })
            .await?;
        let position = store.next_position(&self.scope).await?;
        let backup = RetryBackup {
            user_input: input.to_string(),
            first_position: position,
            snapshot,
            tracker: self.tracker.lock().await.clone(),
        };
        *self.last_backup.lock().await = Some(backup.clone());

        let user_entry = StoryEntry::new(&self.scope, position, EntryType::UserAction, input);
        store.add_entry(user_entry.clone()).await?;
        self.ctx.bus.emit(AppEvent::UserInput {
            story_id: self.scope.story_id.clone(),
            position,
            content: input.to_string(),
        });
        Ok((backup, user_entry))
    }

    /// 位置 before 之前的最近若干条目
    async fn recent_entries(&self, before: u64) -> Result<Vec<StoryEntry>, StoreError> {
        let mut entries = self.ctx.store.entries(&self.scope).await?;
        entries.retain(|e| e.position < before);
        let keep = self.ctx.config.app.recent_entries;
        let skip = entries.len().saturating_sub(keep);
        Ok(entries.split_off(skip))
    }

    async fn retrieve(
        &self,
        input: &str,
        position: u64,
        token: &CancellationToken,
    ) -> Result<RetrievalResult, StoreError> {
        let lore = self.ctx.store.lore_entries(&self.scope.story_id).await?;
        let recent = self.recent_entries(position).await?;
        let mut text = recent
            .iter()
            .rev()
            .find(|e| e.entry_type == EntryType::Narration)
            .map(|e| e.content.clone())
            .unwrap_or_default();
        text.push('\n');
        text.push_str(input);

        let mut tracker = self.tracker.lock().await;
        Ok(self
            .retrieval
            .retrieve(&lore, RetrievalRequest { text: &text, position }, &mut tracker, token)
            .await)
    }

    /// 流式生成叙述；每个片段都与取消令牌赛跑
    async fn narrate(
        &self,
        input: &str,
        user_entry: &StoryEntry,
        retrieval: &RetrievalResult,
        token: &CancellationToken,
        event_tx: Option<&UnboundedSender<PipelineEvent>>,
    ) -> Result<String, LlmError> {
        let cfg = &self.ctx.config;
        let store_failed = |e: StoreError| LlmError::InvalidRequest(e.to_string());
        let view = self.ctx.store.world_view(&self.scope).await.map_err(store_failed)?;
        let recent = self
            .recent_entries(user_entry.position)
            .await
            .map_err(store_failed)?;

        let messages =
            prompts::narrative_messages(cfg.app.mode, &view, &retrieval.context_block, &recent, input);
        let request = GenerateRequest::new(messages)
            .with_temperature(cfg.llm.temperature)
            .with_max_tokens(cfg.llm.max_tokens);

        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(LlmError::Cancelled),
            stream = self.ctx.llm.generate_stream(request) => stream?,
        };

        let mut text = String::new();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(LlmError::Cancelled),
                chunk = stream.next() => match chunk {
                    Some(Ok(piece)) => {
                        send_event(event_tx, PipelineEvent::NarrativeChunk { text: piece.clone() });
                        text.push_str(&piece);
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text.to_string())
    }

    async fn persist_narration(&self, content: String) -> Result<StoryEntry, StoreError> {
        let store = &self.ctx.store;
        let position = store.next_position(&self.scope).await?;
        let entry = StoryEntry::new(&self.scope, position, EntryType::Narration, content);
        store.add_entry(entry.clone()).await?;
        self.ctx.bus.emit(AppEvent::NarrativeResponse {
            story_id: self.scope.story_id.clone(),
            entry_id: entry.id.clone(),
            position,
            content: entry.content.clone(),
        });
        Ok(entry)
    }

    /// 分类 → 构建增量 → 应用 → 增量挂到叙述条目
    async fn classify(
        &self,
        input: &str,
        narration: &StoryEntry,
        token: &CancellationToken,
        run: &TurnRun<'_>,
    ) -> Result<(ClassificationResult, WorldStateDelta), PhaseFailure> {
        let store = self.ctx.store.as_ref();
        let view = store.world_view(&self.scope).await?;
        let request = ClassificationInput {
            narrative: narration.content.clone(),
            user_action: input.to_string(),
            known: KnownEntities::from_view(&view),
            mode: self.ctx.config.app.mode,
        };

        let result = match self.classifier.try_classify(&request, token).await {
            Ok(result) => result,
            Err(ClassifyError::Llm(LlmError::Cancelled)) => return Err(PhaseFailure::Aborted),
            Err(e) => return Err(PhaseFailure::Failed(e.to_string())),
        };

        // 增量先写入叙述条目再修改世界状态；写入失败时世界状态不变
        let outcome =
            ClassificationApplier::apply_to_entry(store, &self.scope, &narration.id, &result).await?;
        if !outcome.failures.is_empty() {
            let ids: Vec<&str> = outcome.failures.iter().map(|f| f.id.as_str()).collect();
            run.error(
                Phase::Classification,
                format!("{} entity changes not applied: {}", ids.len(), ids.join(", ")),
                false,
            );
        }

        let delta = outcome.delta;
        self.ctx.bus.emit(AppEvent::ClassificationComplete {
            story_id: self.scope.story_id.clone(),
            entry_id: narration.id.clone(),
            created: delta.created_entities.len(),
            updated: delta.previous_state.entity_count(),
        });
        Ok((result, delta))
    }

    async fn translate(
        &self,
        text: &str,
        language: &str,
        token: &CancellationToken,
    ) -> Result<String, LlmError> {
        let cfg = &self.ctx.config;
        let mut request = GenerateRequest::new(prompts::translation_messages(text, language))
            .with_temperature(0.3)
            .with_max_tokens(cfg.llm.max_tokens);
        if let Some(model) = &cfg.llm.models.translation {
            request = request.with_model(model.clone());
        }
        let response = generate_cancellable(self.ctx.llm.as_ref(), request, token).await?;
        let translated = response.content.trim();
        if translated.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(translated.to_string())
    }

    /// 后台生成插图，完成后发出 ImageReady；失败只记录日志与非致命错误事件
    fn spawn_image(
        &self,
        generator: Arc<dyn ImageGenerator>,
        narration: &StoryEntry,
        token: CancellationToken,
        event_tx: Option<&UnboundedSender<PipelineEvent>>,
    ) {
        let bus = self.ctx.bus.clone();
        let story_id = self.scope.story_id.clone();
        let entry_id = narration.id.clone();
        let prompt = prompts::image_prompt(&narration.content);
        let tx = event_tx.cloned();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(LlmError::Cancelled),
                result = generator.generate(&prompt) => result,
            };
            match result {
                Ok(image_ref) => bus.emit(AppEvent::ImageReady {
                    story_id,
                    entry_id,
                    image_ref,
                }),
                Err(LlmError::Cancelled) => debug!(entry = %entry_id, "image generation cancelled"),
                Err(e) => {
                    warn!(entry = %entry_id, error = %e, "image generation failed");
                    send_event(
                        tx.as_ref(),
                        PipelineEvent::Error {
                            phase: Phase::Image,
                            message: e.to_string(),
                            fatal: false,
                        },
                    );
                }
            }
        });
    }

    /// 每 N 个叙述回合创建一次自动检查点
    async fn auto_checkpoint(&self, run: &TurnRun<'_>) -> Option<EntityId> {
        let interval = self.ctx.config.pipeline.auto_checkpoint_interval;
        if interval == 0 {
            return None;
        }
        let turns = match self.ctx.store.entries(&self.scope).await {
            Ok(entries) => entries
                .iter()
                .filter(|e| e.entry_type == EntryType::Narration)
                .count() as u64,
            Err(e) => {
                run.error(Phase::PostGeneration, e.to_string(), false);
                return None;
            }
        };
        if turns == 0 || turns % interval != 0 {
            return None;
        }
        match self
            .story()
            .create_checkpoint(&format!("Auto checkpoint (turn {turns})"), true)
            .await
        {
            Ok(checkpoint) => Some(checkpoint.id),
            Err(e) => {
                run.error(Phase::PostGeneration, e.to_string(), false);
                None
            }
        }
    }

    /// 重新应用重试备份：恢复不含章节的快照与激活追踪，清除回合中创建的自动检查点
    pub async fn restore_backup(&self, backup: &RetryBackup) -> Result<(), PipelineError> {
        let store = &self.ctx.store;
        store.restore_snapshot(&self.scope, &backup.snapshot).await?;
        store
            .delete_auto_checkpoints_from(&self.scope, backup.first_position)
            .await?;
        *self.tracker.lock().await = backup.tracker.clone();
        info!(position = backup.first_position, "retry backup restored");
        Ok(())
    }

    /// 撤销最近一回合并以相同输入重新执行
    pub async fn retry(
        &self,
        event_tx: Option<&UnboundedSender<PipelineEvent>>,
    ) -> Result<TurnResult, PipelineError> {
        let backup = self.last_backup().await.ok_or(PipelineError::NoBackup)?;
        self.restore_backup(&backup).await?;
        self.execute(&backup.user_input, event_tx).await
    }

    /// 删除 position 及之后的回合：回滚增量、删除条目、清理激活记录
    pub async fn delete_turns_from(&self, position: u64) -> Result<RollbackSummary, StoryError> {
        let summary = self.story().delete_entries_from(position).await?;
        self.tracker.lock().await.forget_from(position);

        let mut last = self.last_backup.lock().await;
        if last.as_ref().is_some_and(|b| b.first_position >= position) {
            *last = None;
        }
        Ok(summary)
    }
}
