//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AVENTURA__*` 覆盖（双下划线表示嵌套，如 `AVENTURA__LLM__MODEL=gpt-4o`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::classifier::StoryMode;
use crate::retrieval::{RetrievalOptions, DEFAULT_STICKY_WINDOW};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub pipeline: PipelineSection,
    pub retrieval: RetrievalSection,
    pub lore: LoreSection,
    pub events: EventsSection,
}

/// [app] 段：数据目录、故事 id、模式、叙述上下文条数
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 快照文件目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_story_id")]
    pub story_id: String,
    #[serde(default)]
    pub mode: StoryMode,
    /// 叙述请求中带上的最近条目数
    #[serde(default = "default_recent_entries")]
    pub recent_entries: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_story_id() -> String {
    "default".to_string()
}

fn default_recent_entries() -> usize {
    6
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            story_id: default_story_id(),
            mode: StoryMode::default(),
            recent_entries: default_recent_entries(),
        }
    }
}

/// [llm] 段：OpenAI 兼容端点、默认模型与各任务专用模型
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai（任意兼容端点）/ mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub models: TaskModels,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            models: TaskModels::default(),
        }
    }
}

impl LlmSection {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// [llm.models] 段：各任务专用模型，未设置时用默认模型
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskModels {
    pub classification: Option<String>,
    pub retrieval: Option<String>,
    pub translation: Option<String>,
    pub lore: Option<String>,
}

/// [pipeline] 段：可选阶段开关与自动检查点
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_true")]
    pub classification_enabled: bool,
    #[serde(default)]
    pub translation_enabled: bool,
    /// 翻译目标语言；未设置时翻译阶段视为未配置
    pub target_language: Option<String>,
    #[serde(default)]
    pub image_enabled: bool,
    /// 内联图片模式：图片由叙述文本内标记驱动，独立 Image 阶段跳过
    #[serde(default)]
    pub inline_images: bool,
    /// 每 N 回合自动创建检查点；0 表示关闭
    #[serde(default = "default_auto_checkpoint_interval")]
    pub auto_checkpoint_interval: u64,
}

fn default_true() -> bool {
    true
}

fn default_auto_checkpoint_interval() -> u64 {
    10
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            classification_enabled: true,
            translation_enabled: false,
            target_language: None,
            image_enabled: false,
            inline_images: false,
            auto_checkpoint_interval: default_auto_checkpoint_interval(),
        }
    }
}

/// [retrieval] 段：粘滞窗口、上下文预算、Tier 3 开关与上限
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSection {
    #[serde(default = "default_sticky_window")]
    pub sticky_window: u64,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_true")]
    pub llm_relevance: bool,
    #[serde(default = "default_max_tier3")]
    pub max_tier3: usize,
}

fn default_sticky_window() -> u64 {
    DEFAULT_STICKY_WINDOW
}

fn default_token_budget() -> usize {
    1500
}

fn default_max_tier3() -> usize {
    5
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            sticky_window: default_sticky_window(),
            token_budget: default_token_budget(),
            llm_relevance: true,
            max_tier3: default_max_tier3(),
        }
    }
}

impl RetrievalSection {
    pub fn options(&self) -> RetrievalOptions {
        RetrievalOptions {
            token_budget: self.token_budget,
            use_llm_relevance: self.llm_relevance,
            max_tier3: self.max_tier3,
        }
    }
}

/// [lore] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LoreSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    crate::lore::classify::DEFAULT_BATCH_SIZE
}

impl Default for LoreSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

/// [events] 段
#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    crate::events::DEFAULT_HISTORY_CAPACITY
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AVENTURA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AVENTURA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AVENTURA")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
