//! 叙述、翻译与插图的提示词构造

use crate::classifier::StoryMode;
use crate::llm::Message;
use crate::world::{EntryType, StoryEntry, WorldView};

const ADVENTURE_SYSTEM: &str = "You are the narrator of an interactive adventure. \
Write in second person, present tense. Continue the story from the player's action in one to three paragraphs. \
Never act or speak for the player and never list choices.";

const CREATIVE_SYSTEM: &str = "You are a co-author of a piece of fiction. \
Continue the story in third person, following the author's direction. \
Keep established characters, places and tone consistent.";

/// 叙述插图提示词的最大字符数
const IMAGE_PROMPT_CHARS: usize = 400;

/// 叙述请求消息：系统提示 + 世界状态 + 设定集上下文 + 最近条目 + 本回合输入
pub fn narrative_messages(
    mode: StoryMode,
    view: &WorldView,
    lore_context: &str,
    recent: &[StoryEntry],
    user_input: &str,
) -> Vec<Message> {
    let system = match mode {
        StoryMode::Adventure => ADVENTURE_SYSTEM,
        StoryMode::Creative => CREATIVE_SYSTEM,
    };
    let mut messages = vec![Message::system(system)];

    let scene = scene_summary(view);
    if !scene.is_empty() {
        messages.push(Message::system(scene));
    }
    if !lore_context.trim().is_empty() {
        messages.push(Message::system(format!("World knowledge:\n{lore_context}")));
    }

    for entry in recent {
        match entry.entry_type {
            EntryType::UserAction => messages.push(Message::user(entry.content.clone())),
            EntryType::Narration => messages.push(Message::assistant(entry.content.clone())),
            EntryType::System => {}
        }
    }
    messages.push(Message::user(user_input.to_string()));
    messages
}

fn scene_summary(view: &WorldView) -> String {
    let mut lines = Vec::new();
    if let Some(location) = view.current_location() {
        lines.push(format!("Current location: {}", location.name));
    }
    lines.push(format!("Time: {}", view.environment.time_tracker));

    let present: Vec<&str> = view
        .characters
        .iter()
        .filter(|c| c.status == crate::world::CharacterStatus::Active)
        .map(|c| c.name.as_str())
        .collect();
    if !present.is_empty() {
        lines.push(format!("Known characters: {}", present.join(", ")));
    }
    let open: Vec<&str> = view
        .story_beats
        .iter()
        .filter(|b| !b.status.is_resolved())
        .map(|b| b.title.as_str())
        .collect();
    if !open.is_empty() {
        lines.push(format!("Open threads: {}", open.join(", ")));
    }
    lines.join("\n")
}

pub fn translation_messages(text: &str, language: &str) -> Vec<Message> {
    vec![
        Message::system(format!(
            "Translate the user's passage into {language}. Preserve paragraphs, names and tone. Reply with the translation only."
        )),
        Message::user(text.to_string()),
    ]
}

pub fn image_prompt(narration: &str) -> String {
    let excerpt: String = narration.chars().take(IMAGE_PROMPT_CHARS).collect();
    format!("Illustration of the following scene, painterly style: {excerpt}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{Location, StoryEnvironment, StoryScope};

    #[test]
    fn test_narrative_messages_order() {
        let scope = StoryScope::main("s1");
        let harbor = Location::new(&scope, "Harbor");
        let mut environment = StoryEnvironment::new(&scope);
        environment.current_location_id = Some(harbor.id.clone());
        let view = WorldView {
            environment,
            characters: vec![],
            locations: vec![harbor],
            items: vec![],
            story_beats: vec![],
        };
        let recent = vec![
            StoryEntry::new(&scope, 0, EntryType::UserAction, "look around"),
            StoryEntry::new(&scope, 1, EntryType::Narration, "Gulls wheel overhead."),
        ];
        let messages = narrative_messages(StoryMode::Adventure, &view, "[item] Lantern", &recent, "walk on");

        assert_eq!(messages.len(), 6);
        assert!(messages[1].content.contains("Current location: Harbor"));
        assert!(messages[2].content.contains("Lantern"));
        assert_eq!(messages[3].content, "look around");
        assert_eq!(messages[4].content, "Gulls wheel overhead.");
        assert_eq!(messages[5].content, "walk on");
        assert!(!messages[0].content.contains("JSON"));
    }

    #[test]
    fn test_image_prompt_is_truncated() {
        let long = "a".repeat(1000);
        assert!(image_prompt(&long).len() < 500);
    }
}
