//! 基于 LLM 的世界状态分类器
//!
//! 提示词只约定输出结构；解析逐元素进行，单个格式错误的条目被丢弃，不影响其余更新。

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classifier::{
    ClassificationInput, ClassificationResult, ClassifyError, EntryUpdates, SceneUpdate,
    StoryMode, WorldStateClassifier,
};
use crate::llm::{extract_json, generate_cancellable, GenerateRequest, LlmClient, Message};

const SYSTEM_PROMPT: &str = r#"You track the world state of an interactive story.
Read the latest passage and report what changed. Respond with ONLY a JSON object:
{
  "entryUpdates": {
    "characterUpdates": [{"name": "", "changes": {"status": "active|inactive|deceased", "relationship": "", "addTraits": [], "removeTraits": [], "addVisualDescriptors": [], "removeVisualDescriptors": []}}],
    "locationUpdates": [{"name": "", "changes": {"visited": true, "description": ""}}],
    "itemUpdates": [{"name": "", "changes": {"quantity": 1, "equipped": false, "location": ""}}],
    "storyBeatUpdates": [{"title": "", "changes": {"status": "pending|active|completed|failed", "description": ""}}],
    "newCharacters": [{"name": "", "description": "", "relationship": "", "traits": [], "visualDescriptors": []}],
    "newLocations": [{"name": "", "description": ""}],
    "newItems": [{"name": "", "description": "", "quantity": 1, "location": "inventory"}],
    "newStoryBeats": [{"title": "", "description": "", "type": "milestone|quest|revelation|event|plot_point", "status": "active"}]
  },
  "scene": {"currentLocationName": "", "presentCharacterNames": [], "timeProgression": "none|minutes|hours|days"}
}
Reuse the exact names of known entities. Omit anything that did not change."#;

/// 使用 LLM 的分类器（可配置专用模型）
pub struct LlmWorldStateClassifier {
    llm: Arc<dyn LlmClient>,
    model: Option<String>,
    temperature: f32,
}

impl LlmWorldStateClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            model: None,
            temperature: 0.2,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.is_empty());
        self
    }

    fn build_prompt(input: &ClassificationInput) -> String {
        let perspective = match input.mode {
            StoryMode::Adventure => "second-person adventure (\"you\" is the protagonist)",
            StoryMode::Creative => "third-person creative writing",
        };
        let known = serde_json::to_string(&input.known).unwrap_or_else(|_| "{}".to_string());
        format!(
            "Story mode: {perspective}\n\nKnown entities:\n{known}\n\nPlayer action:\n{}\n\nPassage:\n{}",
            input.user_action, input.narrative
        )
    }
}

#[async_trait]
impl WorldStateClassifier for LlmWorldStateClassifier {
    async fn try_classify(
        &self,
        input: &ClassificationInput,
        cancel: &CancellationToken,
    ) -> Result<ClassificationResult, ClassifyError> {
        let mut request = GenerateRequest::new(vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(Self::build_prompt(input)),
        ])
        .with_temperature(self.temperature);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let response = generate_cancellable(self.llm.as_ref(), request, cancel).await?;
        parse_classification(&response.content)
    }
}

/// 宽松解析分类结果：容忍代码块、前置说明文字、缺失字段与单个格式错误的条目
pub fn parse_classification(text: &str) -> Result<ClassificationResult, ClassifyError> {
    let json = extract_json(text);
    let value: Value =
        serde_json::from_str(json).map_err(|e| ClassifyError::Parse(e.to_string()))?;
    let Value::Object(root) = value else {
        return Err(ClassifyError::Parse("top-level value is not an object".to_string()));
    };

    let updates = root.get("entryUpdates");
    let field = |name: &str| updates.and_then(|u| u.get(name));
    let entry_updates = EntryUpdates {
        character_updates: lenient_list(field("characterUpdates")),
        location_updates: lenient_list(field("locationUpdates")),
        item_updates: lenient_list(field("itemUpdates")),
        story_beat_updates: lenient_list(field("storyBeatUpdates")),
        new_characters: lenient_list(field("newCharacters")),
        new_locations: lenient_list(field("newLocations")),
        new_items: lenient_list(field("newItems")),
        new_story_beats: lenient_list(field("newStoryBeats")),
    };

    let scene = match root.get("scene") {
        Some(v) => serde_json::from_value::<SceneUpdate>(v.clone()).unwrap_or_else(|e| {
            warn!(error = %e, "malformed scene in classification, ignoring");
            SceneUpdate::default()
        }),
        None => SceneUpdate::default(),
    };

    Ok(ClassificationResult {
        entry_updates,
        scene,
    })
}

fn lenient_list<T: DeserializeOwned>(value: Option<&Value>) -> Vec<T> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(error = %e, "dropping malformed classification item");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::KnownEntities;
    use crate::llm::{LlmError, ScriptedLlmClient};

    fn input() -> ClassificationInput {
        ClassificationInput {
            narrative: "You pick up a rusty key.".into(),
            user_action: "search the drawer".into(),
            known: KnownEntities::default(),
            mode: StoryMode::Adventure,
        }
    }

    #[test]
    fn test_parse_fenced_with_prose() {
        let text = "Here you go:\n```json\n{\"entryUpdates\": {\"newItems\": [{\"name\": \"Rusty Key\"}]}, \"scene\": {\"timeProgression\": \"minutes\"}}\n```";
        let result = parse_classification(text).unwrap();
        assert_eq!(result.entry_updates.new_items.len(), 1);
        assert_eq!(result.entry_updates.new_items[0].name, "Rusty Key");
        assert_eq!(result.scene.time_progression, "minutes");
    }

    #[test]
    fn test_parse_drops_only_malformed_items() {
        let text = r#"{"entryUpdates": {"newItems": [{"name": "Key", "quantity": -3}, {"name": "Rope"}]}}"#;
        let result = parse_classification(text).unwrap();
        let names: Vec<_> = result
            .entry_updates
            .new_items
            .iter()
            .map(|i| i.name.as_str())
            .collect();
        assert_eq!(names, vec!["Rope"]);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_classification("I cannot help with that").is_err());
        assert!(parse_classification("[1, 2]").is_err());
    }

    #[tokio::test]
    async fn test_classify_never_fails() {
        let garbage = LlmWorldStateClassifier::new(Arc::new(ScriptedLlmClient::new(|_| {
            Ok("not json at all".to_string())
        })));
        let token = CancellationToken::new();
        assert!(garbage.classify(&input(), &token).await.is_empty());

        let failing = LlmWorldStateClassifier::new(Arc::new(ScriptedLlmClient::new(|_| {
            Err(LlmError::Provider("503".into()))
        })));
        assert!(matches!(
            failing.try_classify(&input(), &token).await,
            Err(ClassifyError::Llm(_))
        ));
        assert!(failing.classify(&input(), &token).await.is_empty());
    }
}
