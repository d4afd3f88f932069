use common::normalize_emoji;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use storage::ChatSettingsRow;
use thiserror::Error;

use super::settings::EngineSettings;

/// 秒为单位的延迟区间
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: f64,
    pub max: f64,
}

impl DelayRange {
    pub fn new(min: f64, max: f64) -> Self {
        let min = if min.is_finite() { min.max(0.0) } else { 0.0 };
        let max = if max.is_finite() { max.max(0.0) } else { 0.0 };
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        common::random_duration(rng, self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overflow {
    FillRandom,
    FillNone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionCount {
    pub emoji: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReactionPolicy {
    Random {
        emojis: Vec<String>,
    },
    Manual {
        counts: Vec<ReactionCount>,
        overflow: Overflow,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("反应配置为空")]
    Empty,
    #[error("反应配置 JSON 无效: {0}")]
    Json(String),
    #[error("无法识别的反应模式: {0}")]
    UnknownMode(String),
    #[error("反应数量无效: {0}")]
    BadCount(String),
    #[error("无法识别的溢出策略: {0}")]
    BadOverflow(String),
}

fn parse_emoji_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(normalize_emoji)
        .filter(|e| !e.is_empty())
        .collect()
}

impl ReactionPolicy {
    /// 解析存储的反应配置
    ///
    /// 新格式为 JSON；旧格式 `mode=random;👍,❤️`（`mode=` 可省略）、
    /// `mode=manual;👍:2;❤️:1;extra=fill_random` 以及裸列表 `👍,❤️` 仍然兼容。
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PolicyError::Empty);
        }

        let policy = if raw.starts_with('{') {
            serde_json::from_str::<Self>(raw)
                .map_err(|e| PolicyError::Json(e.to_string()))?
                .normalized()
        } else {
            Self::parse_legacy(raw)?
        };

        if policy.emojis().is_empty() {
            return Err(PolicyError::Empty);
        }
        Ok(policy)
    }

    fn parse_legacy(raw: &str) -> Result<Self, PolicyError> {
        // `mode=` 前缀可省略
        let rest = raw.strip_prefix("mode=").unwrap_or(raw);
        let (mode, body) = rest.split_once(';').unwrap_or((rest, ""));
        let mode = mode.trim();
        if !raw.starts_with("mode=") && mode != "random" && mode != "manual" {
            return Ok(ReactionPolicy::Random {
                emojis: parse_emoji_list(raw),
            });
        }

        match mode {
            "random" => Ok(ReactionPolicy::Random {
                emojis: parse_emoji_list(body),
            }),
            "manual" => {
                let mut counts: Vec<ReactionCount> = Vec::new();
                let mut overflow = Overflow::FillNone;
                for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                    if let Some(extra) = part.strip_prefix("extra=") {
                        overflow = match extra.trim() {
                            "fill_random" => Overflow::FillRandom,
                            "fill_none" => Overflow::FillNone,
                            other => return Err(PolicyError::BadOverflow(other.to_string())),
                        };
                        continue;
                    }
                    let (emoji, num) = part
                        .rsplit_once(':')
                        .ok_or_else(|| PolicyError::BadCount(part.to_string()))?;
                    let count = num
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| PolicyError::BadCount(part.to_string()))?;
                    let emoji = normalize_emoji(emoji);
                    if emoji.is_empty() {
                        return Err(PolicyError::BadCount(part.to_string()));
                    }
                    // 同一表情重复出现时以最后一次为准
                    match counts.iter_mut().find(|c| c.emoji == emoji) {
                        Some(existing) => existing.count = count,
                        None => counts.push(ReactionCount { emoji, count }),
                    }
                }
                Ok(ReactionPolicy::Manual { counts, overflow })
            }
            other => Err(PolicyError::UnknownMode(other.to_string())),
        }
    }

    fn normalized(self) -> Self {
        match self {
            ReactionPolicy::Random { emojis } => ReactionPolicy::Random {
                emojis: emojis
                    .iter()
                    .map(|e| normalize_emoji(e))
                    .filter(|e| !e.is_empty())
                    .collect(),
            },
            ReactionPolicy::Manual { counts, overflow } => ReactionPolicy::Manual {
                counts: counts
                    .into_iter()
                    .map(|c| ReactionCount {
                        emoji: normalize_emoji(&c.emoji),
                        count: c.count,
                    })
                    .collect(),
                overflow,
            },
        }
    }

    pub fn to_storage(&self) -> String {
        // 序列化只包含字符串与整数，不会失败
        serde_json::to_string(self).unwrap_or_default()
    }

    /// 配置里出现的全部表情
    pub fn emojis(&self) -> Vec<String> {
        match self {
            ReactionPolicy::Random { emojis } => emojis.clone(),
            ReactionPolicy::Manual { counts, .. } => {
                counts.iter().map(|c| c.emoji.clone()).collect()
            }
        }
    }

    /// 按配置数量展开并打乱的表情序列
    pub fn shuffled_multiset<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        let mut assigned = Vec::new();
        if let ReactionPolicy::Manual { counts, .. } = self {
            for c in counts {
                assigned.extend(std::iter::repeat(c.emoji.clone()).take(c.count));
            }
        }
        assigned.shuffle(rng);
        assigned
    }
}

/// 单个聊天的生效配置，缺省项取全局默认值
#[derive(Debug, Clone, PartialEq)]
pub struct ChatPolicy {
    pub reaction: Option<ReactionPolicy>,
    pub reaction_delay: DelayRange,
    pub comment_delay: DelayRange,
    pub max_accounts: usize,
    pub views: (usize, usize),
}

impl ChatPolicy {
    pub fn defaults(settings: &EngineSettings) -> Self {
        Self {
            reaction: None,
            reaction_delay: settings.reaction_delay,
            comment_delay: settings.comment_delay,
            max_accounts: settings.max_commenting_accounts,
            views: settings.view_accounts,
        }
    }

    pub fn from_row(
        row: Option<&ChatSettingsRow>,
        reaction: Option<ReactionPolicy>,
        settings: &EngineSettings,
    ) -> Self {
        let mut policy = Self::defaults(settings);
        policy.reaction = reaction;

        let Some(row) = row else {
            return policy;
        };

        policy.reaction_delay = DelayRange::new(
            row.reaction_delay_min.unwrap_or(settings.reaction_delay.min),
            row.reaction_delay_max.unwrap_or(settings.reaction_delay.max),
        );
        policy.comment_delay = DelayRange::new(
            row.comment_delay_min.unwrap_or(settings.comment_delay.min),
            row.comment_delay_max.unwrap_or(settings.comment_delay.max),
        );
        if let Some(max) = row.max_accounts {
            policy.max_accounts = max.max(0) as usize;
        }

        let view_min = row
            .view_min
            .map(|v| v.max(0) as usize)
            .unwrap_or(settings.view_accounts.0);
        let view_max = row
            .view_max
            .map(|v| v.max(0) as usize)
            .unwrap_or(settings.view_accounts.1);
        policy.views = (view_min.min(view_max), view_min.max(view_max));

        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse_legacy_random() {
        let policy = ReactionPolicy::parse("mode=random;👍, ❤️ ,").unwrap();
        assert_eq!(
            policy,
            ReactionPolicy::Random {
                emojis: vec!["👍".into(), "❤️".into()]
            }
        );
        assert_eq!(ReactionPolicy::parse("🔥,👍").unwrap().emojis(), vec!["🔥", "👍"]);
        assert_eq!(
            ReactionPolicy::parse("random;👍,❤️").unwrap().emojis(),
            vec!["👍", "❤️"]
        );
    }

    #[test]
    fn test_parse_legacy_manual() {
        let policy = ReactionPolicy::parse("mode=manual;👍:2;❤️:1;extra=fill_random").unwrap();
        assert_eq!(
            policy,
            ReactionPolicy::Manual {
                counts: vec![
                    ReactionCount {
                        emoji: "👍".into(),
                        count: 2
                    },
                    ReactionCount {
                        emoji: "❤️".into(),
                        count: 1
                    },
                ],
                overflow: Overflow::FillRandom,
            }
        );

        let none = ReactionPolicy::parse("mode=manual;👍:1").unwrap();
        assert!(matches!(
            none,
            ReactionPolicy::Manual {
                overflow: Overflow::FillNone,
                ..
            }
        ));
    }

    #[test]
    fn test_equivalent_emoji_encodings_match() {
        let composed = ReactionPolicy::parse("mode=random;\u{e9}").unwrap();
        let decomposed = ReactionPolicy::parse("mode=random;e\u{301}").unwrap();
        assert_eq!(composed.emojis(), decomposed.emojis());

        let manual = ReactionPolicy::parse("mode=manual;e\u{301}:2;\u{e9}:3").unwrap();
        assert_eq!(manual.emojis(), vec!["\u{e9}".to_string()]);

        let json = ReactionPolicy::parse(r#"{"mode":"random","emojis":[" e\u0301 "]}"#).unwrap();
        assert_eq!(json.emojis(), composed.emojis());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(ReactionPolicy::parse("  "), Err(PolicyError::Empty));
        assert_eq!(ReactionPolicy::parse("mode=random;"), Err(PolicyError::Empty));
        assert!(matches!(
            ReactionPolicy::parse("mode=manual;👍:x"),
            Err(PolicyError::BadCount(_))
        ));
        assert!(matches!(
            ReactionPolicy::parse("mode=weird;👍"),
            Err(PolicyError::UnknownMode(_))
        ));
        assert!(matches!(
            ReactionPolicy::parse("mode=manual;👍:1;extra=all"),
            Err(PolicyError::BadOverflow(_))
        ));
    }

    #[test]
    fn test_json_storage_roundtrip() {
        let policy = ReactionPolicy::parse("mode=manual;👍:2;extra=fill_none").unwrap();
        let stored = policy.to_storage();
        assert!(stored.contains("\"mode\":\"manual\""));
        assert_eq!(ReactionPolicy::parse(&stored).unwrap(), policy);
    }

    #[test]
    fn test_shuffled_multiset_keeps_counts() {
        let policy = ReactionPolicy::parse("mode=manual;👍:2;❤️:1").unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut items = policy.shuffled_multiset(&mut rng);
        items.sort();
        let mut expected = vec!["❤️".to_string(), "👍".to_string(), "👍".to_string()];
        expected.sort();
        assert_eq!(items, expected);
    }

    #[test]
    fn test_chat_policy_fills_gaps_from_defaults() {
        let settings = EngineSettings::default();
        let row = ChatSettingsRow {
            max_accounts: Some(3),
            reaction_delay_min: Some(5.0),
            view_min: Some(12),
            ..Default::default()
        };
        let policy = ChatPolicy::from_row(Some(&row), None, &settings);
        assert_eq!(policy.max_accounts, 3);
        // 下限 5.0 大于默认上限 3.1 时交换
        assert_eq!(policy.reaction_delay, DelayRange::new(3.1, 5.0));
        assert_eq!(policy.comment_delay, settings.comment_delay);
        assert_eq!(policy.views, (10, 12));

        assert_eq!(
            ChatPolicy::from_row(None, None, &settings),
            ChatPolicy::defaults(&settings)
        );
    }
}
