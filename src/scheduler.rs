use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::models::Severity;
use crate::pipeline::Orchestrator;
use crate::store;

/// Daily trigger for the generation pipeline. At most one armed schedule
/// exists at a time; rescheduling always disarms the previous one first.
/// The scheduler only decides WHEN to run, the orchestrator owns the
/// single-flight rule.
pub struct Scheduler {
    pool: SqlitePool,
    orchestrator: Arc<Orchestrator>,
    tz: Tz,
    armed: Option<ArmedSchedule>,
}

struct ArmedSchedule {
    run_time: NaiveTime,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

fn daily_expression(run_time: NaiveTime) -> String {
    format!("0 {} {} * * * *", run_time.minute(), run_time.hour())
}

impl Scheduler {
    pub fn new(pool: SqlitePool, orchestrator: Arc<Orchestrator>, tz: Tz) -> Self {
        Self {
            pool,
            orchestrator,
            tz,
            armed: None,
        }
    }

    /// Arm from stored settings on startup. Disabled automation leaves the
    /// scheduler disarmed without touching the audit log.
    pub async fn initialize(&mut self) -> Result<()> {
        let config = store::load_schedule_config(&self.pool).await?;
        if config.enabled {
            self.arm(config.run_time)?;
            info!(run_time = %config.run_time.format("%H:%M"), timezone = %self.tz, "scheduler armed");
        } else {
            info!("automation disabled, scheduler not armed");
        }
        Ok(())
    }

    /// Apply a settings change: disarm, then re-arm if automation is enabled.
    pub async fn reschedule(&mut self) -> Result<()> {
        let was_armed = self.disarm();
        let config = store::load_schedule_config(&self.pool).await?;

        if config.enabled {
            self.arm(config.run_time)?;
            let run_time = config.run_time.format("%H:%M").to_string();
            info!(run_time = %run_time, timezone = %self.tz, "scheduler rearmed");
            store::append_audit(
                &self.pool,
                Severity::Info,
                &format!("Automation scheduled daily at {run_time}"),
                json!({ "run_time": run_time, "timezone": self.tz.to_string() }),
            )
            .await?;
        } else if was_armed {
            info!("automation disabled, scheduler disarmed");
            store::append_audit(&self.pool, Severity::Info, "Automation stopped", json!({})).await?;
        }
        Ok(())
    }

    /// Disarm for shutdown. Idempotent; audits only an actual stop.
    pub async fn stop(&mut self) -> Result<()> {
        if self.disarm() {
            info!("scheduler stopped");
            store::append_audit(&self.pool, Severity::Info, "Automation stopped", json!({})).await?;
        }
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    #[cfg(test)]
    fn armed_run_time(&self) -> Option<NaiveTime> {
        self.armed.as_ref().map(|a| a.run_time)
    }

    #[cfg(test)]
    fn armed_cancel(&self) -> Option<CancellationToken> {
        self.armed.as_ref().map(|a| a.cancel.clone())
    }

    fn arm(&mut self, run_time: NaiveTime) -> Result<()> {
        let expression = daily_expression(run_time);
        let schedule = Schedule::from_str(&expression)
            .with_context(|| format!("building cron schedule from '{expression}'"))?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            schedule,
            self.tz,
            self.pool.clone(),
            self.orchestrator.clone(),
            cancel.clone(),
        ));

        self.armed = Some(ArmedSchedule {
            run_time,
            cancel,
            handle,
        });
        Ok(())
    }

    fn disarm(&mut self) -> bool {
        match self.armed.take() {
            Some(armed) => {
                armed.cancel.cancel();
                armed.handle.abort();
                true
            }
            None => false,
        }
    }
}

async fn run_loop(
    schedule: Schedule,
    tz: Tz,
    pool: SqlitePool,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
) {
    loop {
        let now = Utc::now().with_timezone(&tz);
        let Some(next) = schedule.after(&now).next() else {
            warn!("cron schedule has no upcoming fire time, scheduler loop exiting");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        debug!(next = %next, "waiting for next scheduled run");

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("scheduler loop cancelled");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        // Spawned, not awaited: the timer stays independent of run duration
        tokio::spawn(handle_fire(orchestrator.clone(), pool.clone()));
    }
}

/// One schedule fire. A collision with an in-flight run is audited as a
/// warning and skipped; the next fire is a day away.
async fn handle_fire(orchestrator: Arc<Orchestrator>, pool: SqlitePool) {
    match orchestrator.run_once().await {
        Ok(report) => {
            info!(processed = report.processed, "scheduled run complete");
        }
        Err(PipelineError::AlreadyRunning) => {
            warn!("scheduled run skipped, a generation run is already in progress");
            if let Err(e) = store::append_audit(
                &pool,
                Severity::Warning,
                "Scheduled run skipped: a generation run is already in progress",
                json!({}),
            )
            .await
            {
                error!(error = %e, "failed to record skipped scheduled run");
            }
        }
        // The orchestrator already audited the failure
        Err(e) => {
            error!(error = format!("{e:#}"), "scheduled run failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Semaphore;
    use uuid::Uuid;

    use super::*;
    use crate::db::test_pool;
    use crate::error::GenerationError;
    use crate::images::{ImageMaker, ImageSlot};
    use crate::models::{Article, ArticleDraft, GenerationOptions, NewArticle, RankedTopic};
    use crate::pipeline::PipelineSettings;
    use crate::store::ArticleSink;
    use crate::trends::TopicSource;
    use crate::writer::ArticleWriter;

    struct NoTopics;

    #[async_trait]
    impl TopicSource for NoTopics {
        async fn fetch_topics(&self) -> Vec<RankedTopic> {
            Vec::new()
        }
    }

    struct NoWriter;

    #[async_trait]
    impl ArticleWriter for NoWriter {
        async fn generate(&self, _: &str, _: &GenerationOptions) -> Result<ArticleDraft, GenerationError> {
            Err(GenerationError::MissingCredential)
        }
    }

    struct NoImages;

    #[async_trait]
    impl ImageMaker for NoImages {
        async fn generate(&self, _: &str, _: &str, _: ImageSlot) -> String {
            String::new()
        }
    }

    struct NoSink;

    #[async_trait]
    impl ArticleSink for NoSink {
        async fn create_article(&self, _: &NewArticle) -> Result<Article> {
            anyhow::bail!("unused in scheduler tests")
        }
    }

    struct OneTopic;

    #[async_trait]
    impl TopicSource for OneTopic {
        async fn fetch_topics(&self) -> Vec<RankedTopic> {
            vec![RankedTopic {
                label: "#A".to_string(),
                volume: 100,
            }]
        }
    }

    /// Writer that signals entry and blocks until released, so a test can
    /// hold a run in flight while the schedule fires.
    struct GateWriter {
        entered: Arc<Semaphore>,
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl ArticleWriter for GateWriter {
        async fn generate(&self, hashtag: &str, _: &GenerationOptions) -> Result<ArticleDraft, GenerationError> {
            self.entered.add_permits(1);
            let permit = self.release.acquire().await.map_err(|_| {
                GenerationError::OutputParse("gate closed".to_string())
            })?;
            permit.forget();
            Ok(ArticleDraft {
                title: format!("About {}", hashtag.trim_start_matches('#')),
                content: "<h1>About</h1><p>Body.</p>".to_string(),
                excerpt: "About.".to_string(),
                meta_description: String::new(),
                seo_keywords: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct CountingSink {
        created: AtomicUsize,
    }

    #[async_trait]
    impl ArticleSink for CountingSink {
        async fn create_article(&self, article: &NewArticle) -> Result<Article> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Article {
                id: Uuid::new_v4().to_string(),
                title: article.title.clone(),
                content: article.content.clone(),
                excerpt: article.excerpt.clone(),
                hashtag: article.hashtag.clone(),
                status: article.status,
                banner_image_url: article.banner_image_url.clone(),
                content_image_url: article.content_image_url.clone(),
                meta_description: article.meta_description.clone(),
                seo_keywords: article.seo_keywords.clone(),
                published_at: None,
                created_at: Utc::now(),
            })
        }
    }

    fn scheduler_for(pool: &SqlitePool) -> Scheduler {
        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            Arc::new(NoTopics),
            Arc::new(NoWriter),
            Arc::new(NoImages),
            Arc::new(NoSink),
            PipelineSettings {
                auto_publish: false,
                topic_delay: std::time::Duration::ZERO,
            },
        ));
        Scheduler::new(pool.clone(), orchestrator, chrono_tz::UTC)
    }

    #[test]
    fn daily_expression_fires_once_a_day_at_the_configured_time() {
        let run_time = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let schedule = Schedule::from_str(&daily_expression(run_time)).unwrap();

        let fires: Vec<_> = schedule.upcoming(chrono_tz::UTC).take(3).collect();
        assert_eq!(fires.len(), 3);
        for fire in &fires {
            assert_eq!(fire.hour(), 9);
            assert_eq!(fire.minute(), 30);
            assert_eq!(fire.second(), 0);
        }
        assert_eq!((fires[1].date_naive() - fires[0].date_naive()).num_days(), 1);
    }

    #[tokio::test]
    async fn initialize_stays_disarmed_when_automation_is_disabled() {
        let pool = test_pool().await;
        store::ensure_default_settings(&pool).await.unwrap();

        let mut scheduler = scheduler_for(&pool);
        scheduler.initialize().await.unwrap();
        assert!(!scheduler.is_armed());
    }

    #[tokio::test]
    async fn reschedule_arms_from_settings_and_audits() {
        let pool = test_pool().await;
        store::set_setting(&pool, "automation_enabled", "true").await.unwrap();
        store::set_setting(&pool, "run_time", "09:30").await.unwrap();

        let mut scheduler = scheduler_for(&pool);
        scheduler.reschedule().await.unwrap();

        assert!(scheduler.is_armed());
        assert_eq!(scheduler.armed_run_time(), NaiveTime::from_hms_opt(9, 30, 0));

        let audit = store::recent_audit(&pool, 10).await.unwrap();
        assert!(audit.iter().any(|e| e.message.contains("09:30")));

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reschedule_cancels_the_previous_trigger() {
        let pool = test_pool().await;
        store::set_setting(&pool, "automation_enabled", "true").await.unwrap();
        store::set_setting(&pool, "run_time", "09:30").await.unwrap();

        let mut scheduler = scheduler_for(&pool);
        scheduler.reschedule().await.unwrap();
        let old_cancel = scheduler.armed_cancel().unwrap();

        store::set_setting(&pool, "run_time", "10:45").await.unwrap();
        scheduler.reschedule().await.unwrap();

        assert!(old_cancel.is_cancelled());
        assert!(scheduler.is_armed());
        assert_eq!(scheduler.armed_run_time(), NaiveTime::from_hms_opt(10, 45, 0));

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn disabling_automation_disarms() {
        let pool = test_pool().await;
        store::set_setting(&pool, "automation_enabled", "true").await.unwrap();

        let mut scheduler = scheduler_for(&pool);
        scheduler.reschedule().await.unwrap();
        assert!(scheduler.is_armed());

        store::set_setting(&pool, "automation_enabled", "false").await.unwrap();
        scheduler.reschedule().await.unwrap();
        assert!(!scheduler.is_armed());

        let audit = store::recent_audit(&pool, 10).await.unwrap();
        assert!(audit.iter().any(|e| e.message == "Automation stopped"));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_audits_once() {
        let pool = test_pool().await;
        store::set_setting(&pool, "automation_enabled", "true").await.unwrap();

        let mut scheduler = scheduler_for(&pool);
        scheduler.reschedule().await.unwrap();

        scheduler.stop().await.unwrap();
        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_armed());

        let stops = store::recent_audit(&pool, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.message == "Automation stopped")
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn fire_colliding_with_an_inflight_run_warns_and_skips() {
        let pool = test_pool().await;
        store::set_setting(&pool, "max_articles", "1").await.unwrap();

        let entered = Arc::new(Semaphore::new(0));
        let release = Arc::new(Semaphore::new(0));
        let sink = Arc::new(CountingSink::default());
        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            Arc::new(OneTopic),
            Arc::new(GateWriter {
                entered: entered.clone(),
                release: release.clone(),
            }),
            Arc::new(NoImages),
            sink.clone(),
            PipelineSettings {
                auto_publish: false,
                topic_delay: std::time::Duration::ZERO,
            },
        ));

        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run_once().await }
        });
        let permit = entered.acquire().await.unwrap();
        permit.forget();

        // The daily schedule fires while the run is still in flight
        handle_fire(orchestrator.clone(), pool.clone()).await;

        let skips = store::recent_audit(&pool, 20)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.severity == Severity::Warning && e.message.contains("Scheduled run skipped"))
            .count();
        assert_eq!(skips, 1);
        assert_eq!(sink.created.load(Ordering::SeqCst), 0);

        // The in-flight run is unaffected by the skipped fire
        release.add_permits(1);
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(sink.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fire_with_no_run_in_flight_executes_exactly_one_batch() {
        let pool = test_pool().await;
        store::set_setting(&pool, "max_articles", "1").await.unwrap();

        let entered = Arc::new(Semaphore::new(0));
        let release = Arc::new(Semaphore::new(1));
        let sink = Arc::new(CountingSink::default());
        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            Arc::new(OneTopic),
            Arc::new(GateWriter {
                entered: entered.clone(),
                release,
            }),
            Arc::new(NoImages),
            sink.clone(),
            PipelineSettings {
                auto_publish: false,
                topic_delay: std::time::Duration::ZERO,
            },
        ));

        handle_fire(orchestrator, pool.clone()).await;

        assert_eq!(sink.created.load(Ordering::SeqCst), 1);
        let warnings = store::recent_audit(&pool, 20)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.severity == Severity::Warning)
            .count();
        assert_eq!(warnings, 0);
    }
}
