use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a topic within the current queue snapshot.
/// `queued → processing → completed|failed`; terminal states are never
/// reverted within a run. A fresh snapshot resets everything to `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TopicState {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Topic {
    pub id: String,
    pub label: String,
    pub volume: i64,
    pub rank: i64,
    pub state: TopicState,
    pub discovered_at: DateTime<Utc>,
}

/// Normalized output of the Topic Source Adapter, before ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedTopic {
    pub label: String,
    pub volume: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    Draft,
    Published,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub hashtag: String,
    pub status: ArticleStatus,
    pub banner_image_url: String,
    pub content_image_url: String,
    pub meta_description: String,
    pub seo_keywords: String,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An article ready to be persisted. Not a FromRow; assembled by the pipeline.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub hashtag: String,
    pub status: ArticleStatus,
    pub banner_image_url: String,
    pub content_image_url: String,
    pub meta_description: String,
    pub seo_keywords: String,
}

/// Structured output of the Content Generation Adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct ArticleDraft {
    pub title: String,
    pub content: String,
    pub excerpt: String,
    #[serde(default)]
    pub meta_description: String,
    #[serde(default)]
    pub seo_keywords: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub message: String,
    pub severity: Severity,
    /// JSON payload with structured details.
    pub details: String,
    pub created_at: DateTime<Utc>,
}

macro_rules! settings_enum {
    ($name:ident, $default:ident, $(($variant:ident, $text:literal)),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown value '{other}'")),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

settings_enum!(ArticleLength, Medium, (Short, "short"), (Medium, "medium"), (Long, "long"));
settings_enum!(
    WritingStyle,
    Informative,
    (Informative, "informative"),
    (Casual, "casual"),
    (Formal, "formal"),
    (Engaging, "engaging")
);
settings_enum!(Language, Pt, (Pt, "pt"), (En, "en"), (Es, "es"));

impl ArticleLength {
    /// Target word-count band requested from the text-generation service.
    pub fn word_band(self) -> (u32, u32) {
        match self {
            ArticleLength::Short => (600, 900),
            ArticleLength::Medium => (1200, 1800),
            ArticleLength::Long => (2500, 3500),
        }
    }
}

/// Style parameters for one generation, copied from settings at run start so a
/// run stays internally consistent even if settings change mid-run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationOptions {
    pub length: ArticleLength,
    pub style: WritingStyle,
    pub language: Language,
}

/// Typed view over the automation settings, parsed once at the
/// settings → orchestrator/scheduler boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub run_time: NaiveTime,
    pub max_topics_per_run: usize,
    pub options: GenerationOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_enums_round_trip() {
        assert_eq!("long".parse::<ArticleLength>().unwrap(), ArticleLength::Long);
        assert_eq!("engaging".parse::<WritingStyle>().unwrap(), WritingStyle::Engaging);
        assert_eq!("es".parse::<Language>().unwrap(), Language::Es);
        assert_eq!(Language::Es.as_str(), "es");
        assert!("verbose".parse::<ArticleLength>().is_err());
    }

    #[test]
    fn defaults_match_reference_behavior() {
        let options = GenerationOptions::default();
        assert_eq!(options.length, ArticleLength::Medium);
        assert_eq!(options.style, WritingStyle::Informative);
        assert_eq!(options.language, Language::Pt);
    }

    #[test]
    fn word_bands_scale_with_length() {
        assert_eq!(ArticleLength::Short.word_band(), (600, 900));
        assert_eq!(ArticleLength::Long.word_band(), (2500, 3500));
    }
}
