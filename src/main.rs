//! Aventura - 无头回合引擎 REPL
//!
//! 入口：初始化日志、加载配置、构建 AppContext 与流水线，从 stdin 逐行执行回合并打印阶段事件。
//! 以 `/` 开头的行是命令：/undo <pos>、/checkpoint <name>、/restore <name>、/chapter <title>、/retry、/lore、/quit。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use aventura::config::load_config;
use aventura::core::AppContext;
use aventura::observability;
use aventura::pipeline::{PipelineEvent, PipelineOrchestrator, TurnResult};
use aventura::store::{SnapshotFile, SnapshotOptions, WorldStore};
use aventura::PipelineError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let snapshot_file = SnapshotFile::new(cfg.app.data_dir.join(format!("{}.json", cfg.app.story_id)));

    let ctx = AppContext::from_config(cfg);
    let scope = ctx.main_scope();
    if let Some(snapshot) = snapshot_file.load().context("Failed to load saved story")? {
        ctx.store
            .restore_snapshot(&scope, &snapshot)
            .await
            .context("Failed to restore saved story")?;
        tracing::info!(path = %snapshot_file.path().display(), "story loaded");
    }

    let orchestrator = Arc::new(PipelineOrchestrator::new(ctx.clone(), scope.clone()));
    let story = orchestrator.story();

    // Ctrl+C 取消进行中的回合，不退出进程
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                orchestrator.cancel();
            }
        });
    }

    println!("Aventura ready. Type an action, or /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, arg) = match line.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" => break,
            "/undo" => match arg.parse::<u64>() {
                Ok(position) => match orchestrator.delete_turns_from(position).await {
                    Ok(summary) => println!("Rolled back to {position}: {}", summary.describe()),
                    Err(e) => eprintln!("undo failed: {e}"),
                },
                Err(_) => eprintln!("usage: /undo <position>"),
            },
            "/checkpoint" if !arg.is_empty() => match story.create_checkpoint(arg, false).await {
                Ok(c) => println!("Checkpoint '{}' saved at position {}", c.name, c.position),
                Err(e) => eprintln!("checkpoint failed: {e}"),
            },
            "/restore" if !arg.is_empty() => match story.restore_checkpoint(arg).await {
                Ok(c) => println!("Restored checkpoint '{}' (position {})", c.name, c.position),
                Err(e) => eprintln!("restore failed: {e}"),
            },
            "/chapter" if !arg.is_empty() => {
                let chapters = ctx.store.chapters(&scope).await.context("Failed to list chapters")?;
                let start = chapters.iter().map(|c| c.end_position + 1).max().unwrap_or(0);
                let end = ctx
                    .store
                    .next_position(&scope)
                    .await
                    .context("Failed to read story position")?
                    .saturating_sub(1);
                match story.create_chapter(arg, start, end).await {
                    Ok(c) => println!("Chapter {}: {} ({}..={})", c.number, c.title, start, end),
                    Err(e) => eprintln!("chapter failed: {e}"),
                }
            }
            "/retry" => {
                let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                let task = orchestrator.clone();
                let handle = tokio::spawn(async move { task.retry(Some(&tx)).await });
                report_turn(&orchestrator, rx, handle).await?;
            }
            "/lore" => {
                let entries = ctx
                    .store
                    .lore_entries(&scope.story_id)
                    .await
                    .context("Failed to list lore entries")?;
                if entries.is_empty() {
                    println!("(no lore entries)");
                }
                for entry in entries {
                    println!(
                        "[{}] {} ({:?}, priority {})",
                        entry.entry_type.as_str(),
                        entry.name,
                        entry.injection.mode,
                        entry.injection.priority
                    );
                }
            }
            c if c.starts_with('/') => eprintln!("unknown command or missing argument: {c}"),
            _ => {
                let (rx, handle) = orchestrator.clone().spawn(line.to_string());
                report_turn(&orchestrator, rx, handle).await?;
            }
        }
    }

    let snapshot = ctx
        .store
        .capture_snapshot(&scope, SnapshotOptions::default())
        .await
        .context("Failed to capture story")?;
    snapshot_file.save(&snapshot).context("Failed to save story")?;
    tracing::info!(path = %snapshot_file.path().display(), "story saved");
    Ok(())
}

/// 打印阶段事件直到回合结束；致命失败时恢复重试备份
async fn report_turn(
    orchestrator: &PipelineOrchestrator,
    mut rx: UnboundedReceiver<PipelineEvent>,
    handle: JoinHandle<Result<TurnResult, PipelineError>>,
) -> anyhow::Result<()> {
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::NarrativeChunk { text } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            PipelineEvent::PhaseComplete {
                phase,
                skipped_reason: Some(reason),
                ..
            } => tracing::debug!(%phase, ?reason, "phase skipped"),
            PipelineEvent::Error { phase, message, fatal } => {
                eprintln!("\n[{phase}] {}: {message}", if fatal { "error" } else { "warning" });
            }
            PipelineEvent::Aborted { phase } => eprintln!("\n[{phase}] aborted"),
            _ => {}
        }
    }
    println!();

    match handle.await.context("Turn task failed")? {
        Ok(turn) => {
            if let Some(translation) = &turn.translation {
                println!("{translation}");
            }
            let lore = turn.retrieval.total();
            let changes = turn.delta.as_ref().map(|d| d.operation_count()).unwrap_or(0);
            println!("(position {}, {lore} lore entries, {changes} world changes)", turn.narration_entry.position);
        }
        Err(e) => {
            eprintln!("turn failed: {e}");
            if let Some(backup) = e.backup() {
                orchestrator
                    .restore_backup(backup)
                    .await
                    .context("Failed to restore retry backup")?;
                eprintln!("(story restored to before the turn)");
            }
        }
    }
    Ok(())
}
