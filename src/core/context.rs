//! 应用上下文：配置、LLM 客户端、存储、事件总线与可选的图片生成器
//!
//! 构造时显式传入各组件，不使用全局单例。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::llm::{ImageGenerator, LlmClient, MockLlmClient, OpenAiClient};
use crate::store::{InMemoryWorldStore, WorldStore};
use crate::world::StoryScope;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub llm: Arc<dyn LlmClient>,
    pub store: Arc<dyn WorldStore>,
    pub bus: EventBus,
    pub image: Option<Arc<dyn ImageGenerator>>,
}

impl AppContext {
    pub fn new(config: AppConfig, llm: Arc<dyn LlmClient>, store: Arc<dyn WorldStore>) -> Self {
        let bus = EventBus::new(config.events.history_capacity);
        Self {
            config: Arc::new(config),
            llm,
            store,
            bus,
            image: None,
        }
    }

    /// 按配置选择 LLM 后端，使用内存存储
    pub fn from_config(config: AppConfig) -> Self {
        let llm = create_llm_from_config(&config);
        Self::new(config, llm, Arc::new(InMemoryWorldStore::new()))
    }

    pub fn with_image_generator(mut self, generator: Arc<dyn ImageGenerator>) -> Self {
        self.image = Some(generator);
        self
    }

    /// 配置中的故事主线
    pub fn main_scope(&self) -> StoryScope {
        StoryScope::main(self.config.app.story_id.clone())
    }
}

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient);
    }

    match cfg.llm.resolved_api_key() {
        Some(key) => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                &key,
            ))
        }
        None => {
            tracing::warn!("No API key set, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}
