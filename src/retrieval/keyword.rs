//! Tier 2 关键词匹配
//!
//! 名字、关键词、别名按顺序逐一检查，返回第一个命中的词。ASCII 词按词边界、大小写不敏感匹配；
//! 含非 ASCII 字符的词（如中文）没有可靠的词边界，退化为子串匹配。

use regex::RegexBuilder;

use crate::lore::LoreEntry;

/// 词是否在文本中以独立词形式出现
pub fn term_matches(term: &str, text: &str) -> bool {
    let term = term.trim();
    if term.is_empty() {
        return false;
    }
    if !term.is_ascii() {
        return text.to_lowercase().contains(&term.to_lowercase());
    }
    let pattern = format!(r"(?:^|[^\w]){}(?:$|[^\w])", regex::escape(term));
    match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(text),
        Err(_) => text.to_lowercase().contains(&term.to_lowercase()),
    }
}

/// 条目第一个命中的词（名字 → 关键词 → 别名）
pub fn first_match(entry: &LoreEntry, text: &str) -> Option<String> {
    entry
        .match_terms()
        .find(|term| term_matches(term, text))
        .map(|t| t.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lore::LoreEntryType;

    #[test]
    fn test_word_boundaries() {
        assert!(term_matches("Ash", "The ash falls."));
        assert!(term_matches("ash", "ASH!"));
        assert!(!term_matches("ash", "You wash your hands."));
        assert!(!term_matches("ash", "ashen skies"));
        assert!(term_matches("Old Tom", "You meet old tom at the gate."));
    }

    #[test]
    fn test_special_characters_are_escaped() {
        assert!(term_matches("C.O.R.E.", "the C.O.R.E. facility"));
        assert!(!term_matches("a+b", "aab"));
    }

    #[test]
    fn test_non_ascii_uses_substring() {
        assert!(term_matches("龙王", "你看见了龙王的宫殿"));
    }

    #[test]
    fn test_first_match_prefers_name_then_keywords() {
        let entry = LoreEntry::new("s1", "Elowen", LoreEntryType::Character)
            .with_keywords(["healer"])
            .with_aliases(["the white witch"]);
        assert_eq!(
            first_match(&entry, "The healer Elowen waves."),
            Some("Elowen".to_string())
        );
        assert_eq!(
            first_match(&entry, "Find the white witch, the healer."),
            Some("healer".to_string())
        );
        assert_eq!(first_match(&entry, "Nobody here."), None);
    }
}
