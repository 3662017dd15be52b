use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::images::{ImageMaker, ImageSlot};
use crate::models::{Article, ArticleStatus, GenerationOptions, NewArticle, Severity, Topic, TopicState};
use crate::store::{self, ArticleSink};
use crate::trends::TopicSource;
use crate::writer::{self, ArticleWriter};

/// Normalize user-supplied topic input to canonical `#Label` form.
pub fn normalize_hashtag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "#" {
        return None;
    }
    Some(if trimmed.starts_with('#') {
        trimmed.to_string()
    } else {
        format!("#{trimmed}")
    })
}

/// Outcome of one batch run. Successes and failures both count as processed.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub processed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// When true, batch articles are persisted as published; otherwise as
    /// drafts pending review. Manual one-off generation is always draft.
    pub auto_publish: bool,
    /// Fixed delay between consecutive topics in a batch.
    pub topic_delay: Duration,
}

/// RAII guard releasing the single-flight flag on every exit path,
/// including panics.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Drives one end-to-end batch run: refresh the topic queue, then walk the
/// ranked topics sequentially through text generation, image generation and
/// persistence, recording every transition in the audit log.
pub struct Orchestrator {
    pool: SqlitePool,
    topics: Arc<dyn TopicSource>,
    writer: Arc<dyn ArticleWriter>,
    images: Arc<dyn ImageMaker>,
    sink: Arc<dyn ArticleSink>,
    settings: PipelineSettings,
    running: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        topics: Arc<dyn TopicSource>,
        writer: Arc<dyn ArticleWriter>,
        images: Arc<dyn ImageMaker>,
        sink: Arc<dyn ArticleSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            pool,
            topics,
            writer,
            images,
            sink,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Execute exactly one batch run. A second caller arriving while a run is
    /// in flight gets [`PipelineError::AlreadyRunning`] immediately, with no
    /// side effects. There is no run queue.
    pub async fn run_once(&self) -> Result<RunReport, PipelineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::AlreadyRunning);
        }
        let _guard = RunGuard { flag: &self.running };

        match self.run_batch().await {
            Ok(report) => {
                info!(processed = report.processed, "batch run complete");
                Ok(report)
            }
            Err(e) => {
                error!(error = format!("{e:#}"), "batch run failed");
                if let Err(log_err) = store::append_audit(
                    &self.pool,
                    Severity::Error,
                    &format!("Automated generation failed: {e:#}"),
                    json!({ "error": format!("{e:#}") }),
                )
                .await
                {
                    error!(error = %log_err, "failed to record batch failure in audit log");
                }
                Err(PipelineError::Run(e))
            }
        }
    }

    async fn run_batch(&self) -> Result<RunReport> {
        store::append_audit(
            &self.pool,
            Severity::Info,
            "Starting automated article generation",
            json!({}),
        )
        .await?;

        // The topic source never throws; worst case it hands back the local
        // fallback list.
        let ranked = self.topics.fetch_topics().await;
        let discovered = store::replace_all_topics(&self.pool, &ranked).await?;
        store::append_audit(
            &self.pool,
            Severity::Info,
            &format!("Fetched {discovered} trending topics"),
            json!({ "count": discovered }),
        )
        .await?;

        // Settings snapshot: a mid-run settings change does not produce an
        // internally inconsistent run.
        let config = store::load_schedule_config(&self.pool)
            .await
            .context("loading generation settings")?;
        let options = config.options;

        let selected: Vec<Topic> = store::list_topics(&self.pool)
            .await?
            .into_iter()
            .take(config.max_topics_per_run)
            .collect();

        let batch_status = if self.settings.auto_publish {
            ArticleStatus::Published
        } else {
            ArticleStatus::Draft
        };

        let mut processed = 0;
        for (index, topic) in selected.iter().enumerate() {
            store::update_topic_state(&self.pool, &topic.label, TopicState::Processing).await?;

            match self.generate_for_topic(&topic.label, &options, batch_status).await {
                Ok(article) => {
                    store::update_topic_state(&self.pool, &topic.label, TopicState::Completed).await?;
                    store::append_audit(
                        &self.pool,
                        Severity::Success,
                        &format!("Generated article for {}", topic.label),
                        json!({ "hashtag": topic.label, "title": article.title }),
                    )
                    .await?;
                }
                Err(e) => {
                    warn!(hashtag = %topic.label, error = format!("{e:#}"), "topic failed, continuing batch");
                    store::update_topic_state(&self.pool, &topic.label, TopicState::Failed).await?;
                    store::append_audit(
                        &self.pool,
                        Severity::Error,
                        &format!("Failed to generate article for {}: {e:#}", topic.label),
                        json!({ "hashtag": topic.label, "error": format!("{e:#}") }),
                    )
                    .await?;
                }
            }
            processed += 1;

            if index + 1 < selected.len() && !self.settings.topic_delay.is_zero() {
                tokio::time::sleep(self.settings.topic_delay).await;
            }
        }

        store::append_audit(
            &self.pool,
            Severity::Success,
            "Automated article generation completed",
            json!({ "processed": processed }),
        )
        .await?;

        Ok(RunReport { processed })
    }

    /// Manual one-off generation outside the batch scheduler. Always persists
    /// as a draft; adapter failures fall back exactly like in a batch, only
    /// persistence failures propagate.
    pub async fn generate_one(&self, hashtag: &str) -> Result<Article> {
        let config = store::load_schedule_config(&self.pool)
            .await
            .context("loading generation settings")?;

        let article = self
            .generate_for_topic(hashtag, &config.options, ArticleStatus::Draft)
            .await?;

        store::append_audit(
            &self.pool,
            Severity::Success,
            &format!("Manually generated article for {hashtag}"),
            json!({ "hashtag": hashtag, "title": article.title }),
        )
        .await?;

        Ok(article)
    }

    /// One topic's workflow: text (fallback on error), two independent image
    /// slots, then persistence. Only the persistence step may fail.
    async fn generate_for_topic(
        &self,
        hashtag: &str,
        options: &GenerationOptions,
        status: ArticleStatus,
    ) -> Result<Article> {
        let draft = match self.writer.generate(hashtag, options).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!(hashtag = %hashtag, error = %e, "text generation failed, using fallback article");
                store::append_audit(
                    &self.pool,
                    Severity::Warning,
                    &format!("Text generation failed for {hashtag}, using fallback article"),
                    json!({ "hashtag": hashtag, "error": e.to_string() }),
                )
                .await?;
                writer::fallback_article(hashtag, options)
            }
        };

        // Titles are human headlines, not tags
        let title = draft.title.replace('#', "").trim().to_string();

        let image_context = format!("{title}. {}", draft.excerpt);
        let banner_image_url = self.images.generate(&image_context, hashtag, ImageSlot::Banner).await;
        let content_image_url = self.images.generate(&image_context, hashtag, ImageSlot::Content).await;

        let article = NewArticle {
            title,
            content: draft.content,
            excerpt: draft.excerpt,
            hashtag: hashtag.to_string(),
            status,
            banner_image_url,
            content_image_url,
            meta_description: draft.meta_description,
            seo_keywords: draft.seo_keywords,
        };

        self.sink.create_article(&article).await.context("persisting article")
    }
}
