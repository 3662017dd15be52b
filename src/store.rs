use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{
    Article, ArticleStatus, AuditLogEntry, GenerationOptions, NewArticle, RankedTopic, ScheduleConfig, Severity,
    Topic, TopicState,
};

const TOPIC_COLUMNS: &str = "id, label, volume, rank, state, discovered_at";
const ARTICLE_COLUMNS: &str = "id, title, content, excerpt, hashtag, status, banner_image_url, content_image_url,
    meta_description, seo_keywords, published_at, created_at";

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── Topic queue ────────────────────────────────────────────────────────

/// Replace the whole topic queue with a fresh snapshot: clear, dedup by label,
/// and bulk-insert with contiguous ranks (highest volume = rank 1). Runs in a
/// single transaction so readers never observe a half-written snapshot.
pub async fn replace_all_topics(pool: &SqlitePool, topics: &[RankedTopic]) -> Result<usize> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique: Vec<&RankedTopic> = Vec::new();
    for topic in topics {
        if seen.insert(topic.label.to_lowercase()) {
            unique.push(topic);
        }
    }
    // Highest volume first; label as tie-break for a stable snapshot
    unique.sort_by(|a, b| b.volume.cmp(&a.volume).then_with(|| a.label.cmp(&b.label)));

    let mut tx = pool.begin().await.context("starting topic snapshot transaction")?;

    sqlx::query("DELETE FROM topics")
        .execute(&mut *tx)
        .await
        .context("clearing topic queue")?;

    let now = timestamp(Utc::now());
    for (index, topic) in unique.iter().enumerate() {
        sqlx::query("INSERT INTO topics (id, label, volume, rank, state, discovered_at) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&topic.label)
            .bind(topic.volume)
            .bind((index + 1) as i64)
            .bind(TopicState::Queued)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("inserting topic")?;
    }

    tx.commit().await.context("committing topic snapshot")?;

    debug!(count = unique.len(), "topic queue replaced");
    Ok(unique.len())
}

/// List the current snapshot in rank order.
pub async fn list_topics(pool: &SqlitePool) -> Result<Vec<Topic>> {
    let topics = sqlx::query_as::<_, Topic>(&format!("SELECT {TOPIC_COLUMNS} FROM topics ORDER BY rank ASC"))
        .fetch_all(pool)
        .await
        .context("querying topics")?;
    Ok(topics)
}

/// Update a topic's lifecycle state by label. Silently ignores unknown labels:
/// the topic may have been replaced mid-run by a concurrent refresh, which is
/// acceptable staleness, not an error.
pub async fn update_topic_state(pool: &SqlitePool, label: &str, state: TopicState) -> Result<()> {
    let result = sqlx::query("UPDATE topics SET state = ? WHERE label = ?")
        .bind(state)
        .bind(label)
        .execute(pool)
        .await
        .context("updating topic state")?;

    if result.rows_affected() == 0 {
        debug!(label = %label, "topic not in current snapshot, state update skipped");
    }
    Ok(())
}

// ── Articles ───────────────────────────────────────────────────────────

/// Persistence seam for generated articles. The live implementation writes to
/// SQLite; tests substitute failing sinks to exercise batch isolation.
#[async_trait]
pub trait ArticleSink: Send + Sync {
    async fn create_article(&self, article: &NewArticle) -> Result<Article>;
}

pub struct SqliteArticleSink {
    pool: SqlitePool,
}

impl SqliteArticleSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArticleSink for SqliteArticleSink {
    async fn create_article(&self, article: &NewArticle) -> Result<Article> {
        create_article(&self.pool, article).await
    }
}

pub async fn create_article(pool: &SqlitePool, article: &NewArticle) -> Result<Article> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let published_at = match article.status {
        ArticleStatus::Published => Some(timestamp(now)),
        ArticleStatus::Draft => None,
    };

    sqlx::query(
        "INSERT INTO articles (id, title, content, excerpt, hashtag, status, banner_image_url, content_image_url,
         meta_description, seo_keywords, published_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&article.title)
    .bind(&article.content)
    .bind(&article.excerpt)
    .bind(&article.hashtag)
    .bind(article.status)
    .bind(&article.banner_image_url)
    .bind(&article.content_image_url)
    .bind(&article.meta_description)
    .bind(&article.seo_keywords)
    .bind(&published_at)
    .bind(timestamp(now))
    .execute(pool)
    .await
    .context("inserting article")?;

    let stored = sqlx::query_as::<_, Article>(&format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?"))
        .bind(&id)
        .fetch_one(pool)
        .await
        .context("reading back inserted article")?;
    Ok(stored)
}

/// Most recent articles, newest first. Timestamps have second granularity,
/// so rowid breaks ties in insertion order.
pub async fn recent_articles(pool: &SqlitePool, limit: i64) -> Result<Vec<Article>> {
    let articles = sqlx::query_as::<_, Article>(&format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles ORDER BY created_at DESC, rowid DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("querying recent articles")?;
    Ok(articles)
}

// ── Audit log ──────────────────────────────────────────────────────────

/// Append an audit log entry. The log is append-only; retention is an
/// external concern.
pub async fn append_audit(
    pool: &SqlitePool,
    severity: Severity,
    message: &str,
    details: serde_json::Value,
) -> Result<()> {
    sqlx::query("INSERT INTO audit_log (id, message, severity, details, created_at) VALUES (?, ?, ?, ?, ?)")
        .bind(Uuid::new_v4().to_string())
        .bind(message)
        .bind(severity)
        .bind(details.to_string())
        .bind(timestamp(Utc::now()))
        .execute(pool)
        .await
        .context("appending audit log entry")?;
    Ok(())
}

/// Most recent audit entries, newest first. Entries written within the same
/// second keep their append order via the rowid tie-break.
pub async fn recent_audit(pool: &SqlitePool, limit: i64) -> Result<Vec<AuditLogEntry>> {
    let entries = sqlx::query_as::<_, AuditLogEntry>(
        "SELECT id, message, severity, details, created_at FROM audit_log
         ORDER BY created_at DESC, rowid DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("querying audit log")?;
    Ok(entries)
}

// ── Settings ───────────────────────────────────────────────────────────

/// Read a setting from the settings table.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("reading setting")?;
    Ok(row.map(|(v,)| v))
}

/// Upsert a setting in the settings table.
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("upserting setting")?;
    Ok(())
}

/// Seed default automation settings for keys that don't exist yet.
pub async fn ensure_default_settings(pool: &SqlitePool) -> Result<()> {
    let defaults = [
        ("automation_enabled", "false"),
        ("run_time", "12:00"),
        ("max_articles", "10"),
        ("article_length", "medium"),
        ("writing_style", "informative"),
        ("language", "pt"),
    ];
    for (key, value) in defaults {
        sqlx::query("INSERT INTO settings (key, value, updated_at) VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now')) ON CONFLICT(key) DO NOTHING")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await
            .context("seeding default setting")?;
    }
    Ok(())
}

fn parse_setting_or_default<T: FromStr + Default>(key: &str, raw: Option<String>) -> T {
    match raw {
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(key = %key, value = %value, "invalid setting value, using default");
            T::default()
        }),
        None => T::default(),
    }
}

/// Parse the string-keyed settings bag into a typed [`ScheduleConfig`].
/// Invalid values degrade to defaults with a warning; a bad settings row must
/// never make a scheduled run impossible.
pub async fn load_schedule_config(pool: &SqlitePool) -> Result<ScheduleConfig> {
    let enabled = get_setting(pool, "automation_enabled")
        .await?
        .is_some_and(|v| v == "true");

    let run_time_raw = get_setting(pool, "run_time").await?.unwrap_or_else(|| "12:00".to_string());
    let run_time = NaiveTime::parse_from_str(&run_time_raw, "%H:%M").unwrap_or_else(|_| {
        warn!(value = %run_time_raw, "invalid run_time setting, using 12:00");
        NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default()
    });

    let max_topics_per_run = get_setting(pool, "max_articles")
        .await?
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n >= 1)
        .unwrap_or(10);

    let options = GenerationOptions {
        length: parse_setting_or_default("article_length", get_setting(pool, "article_length").await?),
        style: parse_setting_or_default("writing_style", get_setting(pool, "writing_style").await?),
        language: parse_setting_or_default("language", get_setting(pool, "language").await?),
    };

    Ok(ScheduleConfig {
        enabled,
        run_time,
        max_topics_per_run,
        options,
    })
}
