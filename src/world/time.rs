//! 故事内时间：TimeTracker 与场景时间推进
//!
//! 分类器只给出粗粒度的推进档位（none / minutes / hours / days），此处换算为具体时长并规范化进位。

use std::fmt;

use serde::{Deserialize, Serialize};

const MINUTES_PER_HOUR: u32 = 60;
const HOURS_PER_DAY: u32 = 24;
const DAYS_PER_YEAR: u32 = 365;

/// 场景时间推进档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeProgression {
    #[default]
    None,
    /// 约半小时
    Minutes,
    /// 约两小时
    Hours,
    /// 一整天
    Days,
}

impl TimeProgression {
    /// 宽松解析 LLM 输出（大小写、单复数均可）；无法识别时视为不推进
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "minute" | "minutes" => TimeProgression::Minutes,
            "hour" | "hours" => TimeProgression::Hours,
            "day" | "days" => TimeProgression::Days,
            _ => TimeProgression::None,
        }
    }

    fn as_minutes(self) -> u32 {
        match self {
            TimeProgression::None => 0,
            TimeProgression::Minutes => 30,
            TimeProgression::Hours => 2 * MINUTES_PER_HOUR,
            TimeProgression::Days => HOURS_PER_DAY * MINUTES_PER_HOUR,
        }
    }
}

/// 故事内时钟
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeTracker {
    pub years: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
}

impl TimeTracker {
    pub fn new(years: u32, days: u32, hours: u32, minutes: u32) -> Self {
        Self {
            years,
            days,
            hours,
            minutes,
        }
        .normalized()
    }

    /// 返回推进后的新时钟（原值不变，便于增量记录推进前的状态）
    pub fn advance(&self, progression: TimeProgression) -> Self {
        let mut next = *self;
        next.minutes += progression.as_minutes();
        next.normalized()
    }

    fn normalized(mut self) -> Self {
        self.hours += self.minutes / MINUTES_PER_HOUR;
        self.minutes %= MINUTES_PER_HOUR;
        self.days += self.hours / HOURS_PER_DAY;
        self.hours %= HOURS_PER_DAY;
        self.years += self.days / DAYS_PER_YEAR;
        self.days %= DAYS_PER_YEAR;
        self
    }
}

impl fmt::Display for TimeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Year {}, Day {}, {:02}:{:02}",
            self.years + 1,
            self.days + 1,
            self.hours,
            self.minutes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_carries_into_days_and_years() {
        let t = TimeTracker::new(0, 364, 23, 45);
        let next = t.advance(TimeProgression::Minutes);
        assert_eq!(next, TimeTracker::new(1, 0, 0, 15));
        // 原值保持不变
        assert_eq!(t.minutes, 45);
    }

    #[test]
    fn test_none_progression_is_identity() {
        let t = TimeTracker::new(0, 2, 8, 0);
        assert_eq!(t.advance(TimeProgression::None), t);
    }

    #[test]
    fn test_parse_is_lenient() {
        assert_eq!(TimeProgression::parse("Hours"), TimeProgression::Hours);
        assert_eq!(TimeProgression::parse(" day "), TimeProgression::Days);
        assert_eq!(TimeProgression::parse("weeks"), TimeProgression::None);
    }

    #[test]
    fn test_display() {
        let t = TimeTracker::new(0, 0, 9, 5);
        assert_eq!(t.to_string(), "Year 1, Day 1, 09:05");
    }
}
