//! 进程内事件总线
//!
//! 封闭的事件枚举 + 按主题订阅。`emit` 同步调用当前订阅的处理器；每个处理器的错误与 panic
//! 单独捕获并记录日志，不影响其他处理器。异步处理器派发到 tokio 运行时执行。
//! 最近的事件保存在有界环形缓冲中；另提供 broadcast 接收端给基于通道的消费者。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// 事件主题（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTopic {
    UserInput,
    NarrativeResponse,
    ClassificationComplete,
    StateUpdated,
    ChapterCreated,
    ImageReady,
    TranslationComplete,
    RollbackComplete,
    CheckpointCreated,
    CheckpointRestored,
    LoreEntriesUpdated,
}

/// 应用事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    UserInput {
        story_id: String,
        position: u64,
        content: String,
    },
    NarrativeResponse {
        story_id: String,
        entry_id: String,
        position: u64,
        content: String,
    },
    ClassificationComplete {
        story_id: String,
        entry_id: String,
        created: usize,
        updated: usize,
    },
    StateUpdated {
        story_id: String,
        branch_id: Option<String>,
        position: u64,
    },
    ChapterCreated {
        story_id: String,
        chapter_id: String,
        number: u32,
        title: String,
    },
    ImageReady {
        story_id: String,
        entry_id: String,
        image_ref: String,
    },
    TranslationComplete {
        story_id: String,
        entry_id: String,
        language: String,
    },
    RollbackComplete {
        story_id: String,
        target_position: u64,
        summary: String,
    },
    CheckpointCreated {
        story_id: String,
        checkpoint_id: String,
        name: String,
        auto: bool,
    },
    CheckpointRestored {
        story_id: String,
        checkpoint_id: String,
        name: String,
    },
    LoreEntriesUpdated {
        story_id: String,
        count: usize,
    },
}

impl AppEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            AppEvent::UserInput { .. } => EventTopic::UserInput,
            AppEvent::NarrativeResponse { .. } => EventTopic::NarrativeResponse,
            AppEvent::ClassificationComplete { .. } => EventTopic::ClassificationComplete,
            AppEvent::StateUpdated { .. } => EventTopic::StateUpdated,
            AppEvent::ChapterCreated { .. } => EventTopic::ChapterCreated,
            AppEvent::ImageReady { .. } => EventTopic::ImageReady,
            AppEvent::TranslationComplete { .. } => EventTopic::TranslationComplete,
            AppEvent::RollbackComplete { .. } => EventTopic::RollbackComplete,
            AppEvent::CheckpointCreated { .. } => EventTopic::CheckpointCreated,
            AppEvent::CheckpointRestored { .. } => EventTopic::CheckpointRestored,
            AppEvent::LoreEntriesUpdated { .. } => EventTopic::LoreEntriesUpdated,
        }
    }
}

/// 环形缓冲中的一条记录
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub event: AppEvent,
    pub emitted_at: DateTime<Utc>,
}

type SyncHandler = Arc<dyn Fn(&AppEvent) -> anyhow::Result<()> + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(AppEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

struct Inner {
    handlers: Mutex<HashMap<EventTopic, Vec<(u64, Handler)>>>,
    history: Mutex<VecDeque<RecordedEvent>>,
    capacity: usize,
    next_id: AtomicU64,
    tx: broadcast::Sender<AppEvent>,
}

/// 处理器内部 panic 不会在持锁期间发生，锁中毒时直接取回数据
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 事件总线（可廉价克隆，克隆共享同一组订阅）
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// 订阅句柄；调用 `unsubscribe` 解除订阅（丢弃句柄不会解除）
pub struct Subscription {
    id: u64,
    topic: EventTopic,
    bus: Weak<Inner>,
}

impl Subscription {
    pub fn topic(&self) -> EventTopic {
        self.topic
    }

    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut handlers = lock(&inner.handlers);
            if let Some(list) = handlers.get_mut(&self.topic) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(history_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                handlers: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                capacity: history_capacity.max(1),
                next_id: AtomicU64::new(1),
                tx,
            }),
        }
    }

    fn add(&self, topic: EventTopic, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handlers)
            .entry(topic)
            .or_default()
            .push((id, handler));
        Subscription {
            id,
            topic,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// 订阅同步处理器
    pub fn subscribe<F>(&self, topic: EventTopic, handler: F) -> Subscription
    where
        F: Fn(&AppEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(topic, Handler::Sync(Arc::new(handler)))
    }

    /// 订阅异步处理器（在运行时上执行，失败记录日志）
    pub fn subscribe_async<F, Fut>(&self, topic: EventTopic, handler: F) -> Subscription
    where
        F: Fn(AppEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(
            topic,
            Handler::Async(Arc::new(move |event| handler(event).boxed())),
        )
    }

    /// 广播接收端（落后过多时会收到 Lagged）
    pub fn stream(&self) -> broadcast::Receiver<AppEvent> {
        self.inner.tx.subscribe()
    }

    /// 发出事件：写入环形缓冲、广播，然后依次调用当前订阅的处理器
    pub fn emit(&self, event: AppEvent) {
        let topic = event.topic();
        {
            let mut history = lock(&self.inner.history);
            while history.len() >= self.inner.capacity {
                history.pop_front();
            }
            history.push_back(RecordedEvent {
                event: event.clone(),
                emitted_at: Utc::now(),
            });
        }
        let _ = self.inner.tx.send(event.clone());

        // 先复制再调用，处理器内可安全订阅/退订
        let handlers: Vec<Handler> = lock(&self.inner.handlers)
            .get(&topic)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        debug!(?topic, handlers = handlers.len(), "emit");

        for handler in handlers {
            match handler {
                Handler::Sync(h) => match std::panic::catch_unwind(AssertUnwindSafe(|| h(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(?topic, error = %e, "event handler failed"),
                    Err(_) => error!(?topic, "event handler panicked"),
                },
                Handler::Async(h) => {
                    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                        warn!(?topic, "no tokio runtime, async handler skipped");
                        continue;
                    };
                    // 闭包本身在返回 future 之前也可能 panic
                    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| h(event.clone()))) {
                        Ok(fut) => fut,
                        Err(_) => {
                            error!(?topic, "async event handler panicked");
                            continue;
                        }
                    };
                    runtime.spawn(async move {
                        match AssertUnwindSafe(fut).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(?topic, error = %e, "async event handler failed"),
                            Err(_) => error!(?topic, "async event handler panicked"),
                        }
                    });
                }
            }
        }
    }

    /// 最近 n 条事件（旧 → 新）
    pub fn recent(&self, n: usize) -> Vec<RecordedEvent> {
        let history = lock(&self.inner.history);
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self, topic: EventTopic) -> usize {
        lock(&self.inner.handlers)
            .get(&topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn state_updated(position: u64) -> AppEvent {
        AppEvent::StateUpdated {
            story_id: "s1".into(),
            branch_id: None,
            position,
        }
    }

    #[test]
    fn test_handler_isolation() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventTopic::StateUpdated, |_| panic!("boom"));
        bus.subscribe(EventTopic::StateUpdated, |_| anyhow::bail!("handler error"));
        let c = calls.clone();
        bus.subscribe(EventTopic::StateUpdated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(state_updated(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_and_topic_filtering() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = bus.subscribe(EventTopic::StateUpdated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(AppEvent::LoreEntriesUpdated {
            story_id: "s1".into(),
            count: 2,
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        bus.emit(state_updated(1));
        sub.unsubscribe();
        bus.emit(state_updated(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventTopic::StateUpdated), 0);
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let bus = EventBus::new(3);
        for p in 0..5 {
            bus.emit(state_updated(p));
        }
        let recent = bus.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].event, state_updated(2));
        assert_eq!(bus.recent(1)[0].event, state_updated(4));
    }

    #[tokio::test]
    async fn test_async_handler_panicking_before_future_is_isolated() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe_async(EventTopic::StateUpdated, |_: AppEvent| -> futures_util::future::Ready<anyhow::Result<()>> {
            panic!("handler setup failed")
        });
        let c = calls.clone();
        bus.subscribe(EventTopic::StateUpdated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(state_updated(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.recent(1)[0].event, state_updated(1));
    }

    #[tokio::test]
    async fn test_async_handler_and_stream() {
        let bus = EventBus::default();
        let mut rx = bus.stream();
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe_async(EventTopic::CheckpointCreated, move |event| {
            let done_tx = done_tx.clone();
            async move {
                done_tx.send(event.topic())?;
                Ok(())
            }
        });
        bus.subscribe_async(EventTopic::CheckpointCreated, |_| async {
            Err::<(), _>(anyhow::anyhow!("ignored"))
        });

        bus.emit(AppEvent::CheckpointCreated {
            story_id: "s1".into(),
            checkpoint_id: "c1".into(),
            name: "before the duel".into(),
            auto: false,
        });

        let topic = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap();
        assert_eq!(topic, Some(EventTopic::CheckpointCreated));
        assert_eq!(rx.recv().await.unwrap().topic(), EventTopic::CheckpointCreated);
    }
}
