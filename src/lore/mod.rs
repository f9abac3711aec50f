//! 设定集（Lorebook）条目
//!
//! 条目按注入模式分层：always → Tier 1，keyword → Tier 2，relevant → Tier 3（LLM 判定），never 永不注入。
//! 合并两条条目时保留双方字段的并集。

pub mod classify;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::world::{new_id, EntityId};

pub use classify::{heuristic_type, LoreEntryClassifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoreEntryType {
    Character,
    Location,
    Item,
    Faction,
    #[default]
    Concept,
    Event,
}

impl LoreEntryType {
    pub const ALL: [LoreEntryType; 6] = [
        LoreEntryType::Character,
        LoreEntryType::Location,
        LoreEntryType::Item,
        LoreEntryType::Faction,
        LoreEntryType::Concept,
        LoreEntryType::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoreEntryType::Character => "character",
            LoreEntryType::Location => "location",
            LoreEntryType::Item => "item",
            LoreEntryType::Faction => "faction",
            LoreEntryType::Concept => "concept",
            LoreEntryType::Event => "event",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    Always,
    #[default]
    Keyword,
    Relevant,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Injection {
    pub mode: InjectionMode,
    /// 数值越大越靠前
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    #[default]
    User,
    Import,
    Classifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoreEntry {
    pub id: EntityId,
    pub story_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: LoreEntryType,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub injection: Injection,
    #[serde(default)]
    pub mention_count: u32,
    #[serde(default)]
    pub created_by: CreatedBy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoreEntry {
    pub fn new(story_id: impl Into<String>, name: impl Into<String>, entry_type: LoreEntryType) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            story_id: story_id.into(),
            name: name.into(),
            entry_type,
            description: String::new(),
            keywords: Vec::new(),
            aliases: Vec::new(),
            injection: Injection::default(),
            mention_count: 0,
            created_by: CreatedBy::User,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_mode(mut self, mode: InjectionMode, priority: i32) -> Self {
        self.injection = Injection { mode, priority };
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 合并另一条条目：关键词与别名取并集（大小写不敏感去重），描述取较长者，
    /// 注入优先级取较高者，提及次数相加；另一条的名字若不同则作为别名保留。
    pub fn merge(&mut self, other: &LoreEntry) {
        union_into(&mut self.keywords, &other.keywords);
        union_into(&mut self.aliases, &other.aliases);
        if !other.name.eq_ignore_ascii_case(&self.name) {
            union_into(&mut self.aliases, std::slice::from_ref(&other.name));
        }
        if other.description.len() > self.description.len() {
            self.description = other.description.clone();
        }
        self.injection.priority = self.injection.priority.max(other.injection.priority);
        self.mention_count = self.mention_count.saturating_add(other.mention_count);
        self.updated_at = Utc::now();
    }

    /// 检索时参与匹配的全部词：名字、关键词、别名（按此顺序）
    pub fn match_terms(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str())
            .chain(self.keywords.iter().map(String::as_str))
            .chain(self.aliases.iter().map(String::as_str))
            .filter(|t| !t.trim().is_empty())
    }
}

fn union_into(target: &mut Vec<String>, incoming: &[String]) {
    for value in incoming {
        let v = value.trim();
        if !v.is_empty() && !target.iter().any(|t| t.eq_ignore_ascii_case(v)) {
            target.push(v.to_string());
        }
    }
}
