use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use rand::distr::Alphanumeric;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::images::HttpImageMaker;
use crate::pipeline::{Orchestrator, PipelineSettings};
use crate::scheduler::Scheduler;
use crate::server::{self, AppState};
use crate::store::{self, SqliteArticleSink};
use crate::trends::HttpTopicSource;
use crate::writer::HttpArticleWriter;

/// Daemon entrypoint: wire the live adapters to the orchestrator, arm the
/// scheduler from stored settings, and serve the API until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let tz: chrono_tz::Tz = config
        .trendwire
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {e}", config.trendwire.timezone))?;

    let pool = db::create_pool(&config).await?;
    store::ensure_default_settings(&pool).await?;

    let api_token = resolve_api_token(&config, &pool).await?;

    let orchestrator = build_orchestrator(&config, &pool)?;

    let mut scheduler = Scheduler::new(pool.clone(), orchestrator.clone(), tz);
    scheduler.initialize().await?;
    let scheduler = Arc::new(tokio::sync::Mutex::new(scheduler));

    let state = AppState {
        pool: pool.clone(),
        orchestrator,
        scheduler: scheduler.clone(),
        api_token: Arc::new(api_token),
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.trendwire.listen)
        .await
        .with_context(|| format!("binding {}", config.trendwire.listen))?;
    info!(listen = %config.trendwire.listen, timezone = %tz, "daemon started");

    let shutdown = CancellationToken::new();
    tokio::spawn(listen_for_shutdown(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await
        .context("serving HTTP")?;

    scheduler.lock().await.stop().await?;
    pool.close().await;
    info!("daemon stopped");
    Ok(())
}

/// Wire the live adapters into an orchestrator sharing one HTTP client.
fn build_orchestrator(config: &Config, pool: &SqlitePool) -> Result<Arc<Orchestrator>> {
    let timeout = humantime::parse_duration(&config.generation.timeout).context("parsing generation timeout")?;
    let topic_delay =
        humantime::parse_duration(&config.generation.topic_delay).context("parsing generation topic_delay")?;

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building HTTP client")?;

    Ok(Arc::new(Orchestrator::new(
        pool.clone(),
        Arc::new(HttpTopicSource::new(config, client.clone())),
        Arc::new(HttpArticleWriter::new(config, client.clone())),
        Arc::new(HttpImageMaker::new(config, client)),
        Arc::new(SqliteArticleSink::new(pool.clone())),
        PipelineSettings {
            auto_publish: config.generation.auto_publish,
            topic_delay,
        },
    )))
}

/// One-shot batch run for the `run` subcommand.
pub async fn run_batch(config: Config) -> Result<crate::pipeline::RunReport> {
    let pool = db::create_pool(&config).await?;
    store::ensure_default_settings(&pool).await?;
    let orchestrator = build_orchestrator(&config, &pool)?;

    let report = orchestrator.run_once().await.map_err(anyhow::Error::from)?;
    pool.close().await;
    Ok(report)
}

/// One-shot article generation for the `generate` subcommand.
pub async fn generate_single(config: Config, hashtag: &str) -> Result<crate::models::Article> {
    let hashtag = crate::pipeline::normalize_hashtag(hashtag)
        .ok_or_else(|| anyhow::anyhow!("hashtag must not be empty"))?;

    let pool = db::create_pool(&config).await?;
    store::ensure_default_settings(&pool).await?;
    let orchestrator = build_orchestrator(&config, &pool)?;

    let article = orchestrator.generate_one(&hashtag).await?;
    pool.close().await;
    Ok(article)
}

/// Token precedence: config value, then the stored setting, then a freshly
/// generated token persisted for subsequent starts.
async fn resolve_api_token(config: &Config, pool: &SqlitePool) -> Result<String> {
    if let Some(token) = &config.trendwire.api_token
        && !token.is_empty()
    {
        return Ok(token.clone());
    }
    if let Some(token) = store::get_setting(pool, "api_token").await? {
        return Ok(token);
    }

    let token: String = rand::rng().sample_iter(Alphanumeric).take(32).map(char::from).collect();
    store::set_setting(pool, "api_token", &token).await?;
    info!(token = %token, "generated API token, stored in settings");
    Ok(token)
}

async fn listen_for_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn minimal_config() -> Config {
        toml::from_str("[trendwire]\n").unwrap()
    }

    #[tokio::test]
    async fn api_token_is_generated_once_and_reused() {
        let pool = test_pool().await;
        let config = minimal_config();

        let first = resolve_api_token(&config, &pool).await.unwrap();
        let second = resolve_api_token(&config, &pool).await.unwrap();

        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn configured_api_token_wins_over_stored_one() {
        let pool = test_pool().await;
        store::set_setting(&pool, "api_token", "stored").await.unwrap();

        let mut config = minimal_config();
        config.trendwire.api_token = Some("from-config".to_string());

        let token = resolve_api_token(&config, &pool).await.unwrap();
        assert_eq!(token, "from-config");
    }
}
