use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::NaiveTime;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::PipelineError;
use crate::models::{ArticleLength, Language, WritingStyle};
use crate::pipeline::Orchestrator;
use crate::scheduler::Scheduler;
use crate::store;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<tokio::sync::Mutex<Scheduler>>,
    pub api_token: Arc<String>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/run", post(trigger_run))
        .route("/api/generate", post(generate_article))
        .route("/api/topics", get(list_topics))
        .route("/api/articles", get(list_articles))
        .route("/api/logs", get(list_logs))
        .route("/api/schedule", put(update_schedule))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        warn!(error = format!("{e:#}"), "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{e:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Token check for all /api routes. Accepts a bearer header or a `token`
/// query parameter; comparison is constant-time.
async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = bearer_token(&request).or_else(|| query_token(&request));

    match provided {
        Some(token) if bool::from(token.as_bytes().ct_eq(state.api_token.as_bytes())) => {
            next.run(request).await
        }
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing API token" })),
        )
            .into_response(),
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn query_token(request: &Request) -> Option<&str> {
    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn trigger_run(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    match state.orchestrator.run_once().await {
        Ok(report) => Ok(Json(json!({ "processed": report.processed }))),
        Err(PipelineError::AlreadyRunning) => {
            Err(ApiError::conflict("a generation run is already in progress"))
        }
        Err(PipelineError::Run(e)) => Err(e.into()),
    }
}

#[derive(Deserialize)]
struct GenerateRequest {
    hashtag: String,
}

async fn generate_article(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let hashtag = crate::pipeline::normalize_hashtag(&request.hashtag)
        .ok_or_else(|| ApiError::unprocessable("hashtag must not be empty"))?;

    let article = state.orchestrator.generate_one(&hashtag).await?;
    Ok((StatusCode::CREATED, Json(article)))
}

async fn list_topics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let topics = store::list_topics(&state.pool).await?;
    Ok(Json(topics))
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<i64>,
}

fn clamp_limit(limit: Option<i64>, default: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, 100)
}

async fn list_articles(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, ApiError> {
    let articles = store::recent_articles(&state.pool, clamp_limit(params.limit, 20)).await?;
    Ok(Json(articles))
}

async fn list_logs(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = store::recent_audit(&state.pool, clamp_limit(params.limit, 50)).await?;
    Ok(Json(entries))
}

#[derive(Deserialize)]
struct ScheduleUpdate {
    enabled: bool,
    run_time: Option<String>,
    max_articles: Option<u32>,
    article_length: Option<String>,
    writing_style: Option<String>,
    language: Option<String>,
}

/// Persist schedule settings and re-arm the scheduler. Values are validated
/// here at the API boundary; the settings bag itself stays stringly typed.
async fn update_schedule(
    State(state): State<AppState>,
    Json(update): Json<ScheduleUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(run_time) = &update.run_time {
        NaiveTime::parse_from_str(run_time, "%H:%M")
            .map_err(|_| ApiError::unprocessable(format!("invalid run_time '{run_time}', expected HH:MM")))?;
        store::set_setting(&state.pool, "run_time", run_time).await?;
    }
    if let Some(max_articles) = update.max_articles {
        if max_articles < 1 {
            return Err(ApiError::unprocessable("max_articles must be at least 1"));
        }
        store::set_setting(&state.pool, "max_articles", &max_articles.to_string()).await?;
    }
    if let Some(length) = &update.article_length {
        length
            .parse::<ArticleLength>()
            .map_err(|e| ApiError::unprocessable(format!("article_length: {e}")))?;
        store::set_setting(&state.pool, "article_length", length).await?;
    }
    if let Some(style) = &update.writing_style {
        style
            .parse::<WritingStyle>()
            .map_err(|e| ApiError::unprocessable(format!("writing_style: {e}")))?;
        store::set_setting(&state.pool, "writing_style", style).await?;
    }
    if let Some(language) = &update.language {
        language
            .parse::<Language>()
            .map_err(|e| ApiError::unprocessable(format!("language: {e}")))?;
        store::set_setting(&state.pool, "language", language).await?;
    }
    store::set_setting(&state.pool, "automation_enabled", if update.enabled { "true" } else { "false" }).await?;

    let mut scheduler = state.scheduler.lock().await;
    scheduler.reschedule().await?;
    let armed = scheduler.is_armed();
    drop(scheduler);

    let config = store::load_schedule_config(&state.pool).await?;
    Ok(Json(json!({
        "enabled": config.enabled,
        "armed": armed,
        "run_time": config.run_time.format("%H:%M").to_string(),
        "max_articles": config.max_topics_per_run,
        "article_length": config.options.length.as_str(),
        "writing_style": config.options.style.as_str(),
        "language": config.options.language.as_str(),
    })))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use super::*;
    use crate::db::test_pool;
    use crate::error::GenerationError;
    use crate::images::{ImageMaker, ImageSlot};
    use crate::models::{ArticleDraft, GenerationOptions, RankedTopic, TopicState};
    use crate::pipeline::PipelineSettings;
    use crate::store::{ArticleSink, SqliteArticleSink};
    use crate::trends::TopicSource;
    use crate::writer::ArticleWriter;

    const TOKEN: &str = "test-token";

    struct StaticTopics(Vec<RankedTopic>);

    #[async_trait]
    impl TopicSource for StaticTopics {
        async fn fetch_topics(&self) -> Vec<RankedTopic> {
            self.0.clone()
        }
    }

    struct StubWriter;

    #[async_trait]
    impl ArticleWriter for StubWriter {
        async fn generate(&self, hashtag: &str, _: &GenerationOptions) -> Result<ArticleDraft, GenerationError> {
            let subject = hashtag.trim_start_matches('#');
            Ok(ArticleDraft {
                title: format!("About {subject}"),
                content: format!("<h1>About {subject}</h1>"),
                excerpt: format!("About {subject}."),
                meta_description: String::new(),
                seo_keywords: String::new(),
            })
        }
    }

    struct StubImages;

    #[async_trait]
    impl ImageMaker for StubImages {
        async fn generate(&self, _: &str, _: &str, slot: ImageSlot) -> String {
            format!("https://img.test/{}", slot.as_str())
        }
    }

    async fn app(topics: Vec<RankedTopic>) -> (Router, SqlitePool) {
        let pool = test_pool().await;
        store::ensure_default_settings(&pool).await.unwrap();

        let sink: Arc<dyn ArticleSink> = Arc::new(SqliteArticleSink::new(pool.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            Arc::new(StaticTopics(topics)),
            Arc::new(StubWriter),
            Arc::new(StubImages),
            sink,
            PipelineSettings {
                auto_publish: false,
                topic_delay: Duration::ZERO,
            },
        ));
        let scheduler = Scheduler::new(pool.clone(), orchestrator.clone(), chrono_tz::UTC);

        let state = AppState {
            pool: pool.clone(),
            orchestrator,
            scheduler: Arc::new(tokio::sync::Mutex::new(scheduler)),
            api_token: Arc::new(TOKEN.to_string()),
        };
        (router(state), pool)
    }

    fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> HttpRequest<Body> {
        let builder = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
        match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn api_routes_reject_missing_or_wrong_token() {
        let (app, _pool) = app(Vec::new()).await;

        let bare = HttpRequest::builder().uri("/api/topics").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(bare).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let wrong = HttpRequest::builder()
            .uri("/api/topics")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(wrong).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Health stays open
        let health = HttpRequest::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(health).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn query_token_is_accepted() {
        let (app, _pool) = app(Vec::new()).await;

        let request = HttpRequest::builder()
            .uri(format!("/api/topics?token={TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn run_endpoint_reports_processed_count() {
        let topics = vec![
            RankedTopic {
                label: "#A".to_string(),
                volume: 100,
            },
            RankedTopic {
                label: "#B".to_string(),
                volume: 50,
            },
        ];
        let (app, pool) = app(topics).await;

        let response = app.oneshot(authed("POST", "/api/run", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["processed"], 2);

        let topics = store::list_topics(&pool).await.unwrap();
        assert!(topics.iter().all(|t| t.state == TopicState::Completed));
    }

    #[tokio::test]
    async fn generate_endpoint_normalizes_hashtag_and_creates_draft() {
        let (app, pool) = app(Vec::new()).await;

        let response = app
            .clone()
            .oneshot(authed("POST", "/api/generate", Some(json!({ "hashtag": "Economia" }))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let article = json_body(response).await;
        assert_eq!(article["hashtag"], "#Economia");
        assert_eq!(article["status"], "draft");

        assert_eq!(store::recent_articles(&pool, 10).await.unwrap().len(), 1);

        let empty = app
            .oneshot(authed("POST", "/api/generate", Some(json!({ "hashtag": "  " }))))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn schedule_endpoint_validates_and_persists() {
        let (app, pool) = app(Vec::new()).await;

        let bad = app
            .clone()
            .oneshot(authed(
                "PUT",
                "/api/schedule",
                Some(json!({ "enabled": true, "run_time": "25:99" })),
            ))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let good = app
            .oneshot(authed(
                "PUT",
                "/api/schedule",
                Some(json!({
                    "enabled": true,
                    "run_time": "08:15",
                    "max_articles": 5,
                    "language": "en"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(good.status(), StatusCode::OK);
        let body = json_body(good).await;
        assert_eq!(body["enabled"], true);
        assert_eq!(body["armed"], true);
        assert_eq!(body["run_time"], "08:15");
        assert_eq!(body["max_articles"], 5);
        assert_eq!(body["language"], "en");

        assert_eq!(
            store::get_setting(&pool, "automation_enabled").await.unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn limits_are_clamped() {
        assert_eq!(clamp_limit(None, 20), 20);
        assert_eq!(clamp_limit(Some(0), 20), 1);
        assert_eq!(clamp_limit(Some(5000), 20), 100);
    }
}
