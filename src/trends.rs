use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Datelike, Local, Timelike};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::TrendsError;
use crate::models::RankedTopic;

/// Maximum number of topics a snapshot may carry.
pub const MAX_TOPICS: usize = 15;

/// Topic Source Adapter. Infallible by contract: implementations must
/// resolve every failure internally and always hand the orchestrator a
/// non-empty, volume-descending list.
#[async_trait]
pub trait TopicSource: Send + Sync {
    async fn fetch_topics(&self) -> Vec<RankedTopic>;
}

/// Live source backed by a recent-posts search API, with the local generator
/// as its fallback for auth failures, network failures, or empty responses.
pub struct HttpTopicSource {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpTopicSource {
    pub fn new(config: &Config, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.trends.base_url.clone(),
            bearer_token: crate::config::resolve_credential(
                &config.trends.bearer_token,
                "TRENDWIRE_TRENDS_BEARER_TOKEN",
            ),
        }
    }

    async fn query_live(&self) -> Result<Vec<RankedTopic>, TrendsError> {
        // A missing credential routes to the fallback exactly like a failed call
        let token = self.bearer_token.as_deref().ok_or(TrendsError::MissingCredential)?;

        let url = format!(
            "{}/2/tweets/search/recent?query=lang:pt -is:retweet&tweet.fields=public_metrics&max_results=100",
            self.base_url
        );
        let response = self.client.get(&url).bearer_auth(token).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrendsError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let payload: serde_json::Value = response.json().await?;
        let posts = payload
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or(TrendsError::Empty)?;

        let trends = rank_hashtags(posts);
        if trends.is_empty() {
            return Err(TrendsError::Empty);
        }
        Ok(trends)
    }
}

#[async_trait]
impl TopicSource for HttpTopicSource {
    async fn fetch_topics(&self) -> Vec<RankedTopic> {
        match self.query_live().await {
            Ok(trends) => {
                debug!(count = trends.len(), "fetched live trending topics");
                trends
            }
            Err(e) => {
                warn!(error = %e, "live trends unavailable, using local generator");
                local_trending_topics()
            }
        }
    }
}

/// Extract hashtags from raw posts and rank them by mention count plus a
/// tenth of their engagement, as the reference scoring does. Volume is the
/// mention count scaled to a posts-like magnitude.
fn rank_hashtags(posts: &[serde_json::Value]) -> Vec<RankedTopic> {
    struct Tally {
        display: String,
        count: i64,
        engagement: i64,
    }

    let mut tallies: HashMap<String, Tally> = HashMap::new();

    for post in posts {
        let text = post.get("text").and_then(|t| t.as_str()).unwrap_or_default();
        let engagement = post
            .get("public_metrics")
            .map(|m| {
                m.get("like_count").and_then(|v| v.as_i64()).unwrap_or(0)
                    + m.get("retweet_count").and_then(|v| v.as_i64()).unwrap_or(0)
            })
            .unwrap_or(0);

        for word in text.split_whitespace() {
            let Some(raw) = word.strip_prefix('#') else { continue };
            let tag: String = raw.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
            if tag.is_empty() {
                continue;
            }
            let display = format!("#{tag}");
            let tally = tallies.entry(display.to_lowercase()).or_insert(Tally {
                display,
                count: 0,
                engagement: 0,
            });
            tally.count += 1;
            tally.engagement += engagement;
        }
    }

    let mut scored: Vec<Tally> = tallies.into_values().collect();
    scored.sort_by(|a, b| {
        let score_a = a.count + a.engagement / 10;
        let score_b = b.count + b.engagement / 10;
        score_b.cmp(&score_a).then_with(|| a.display.cmp(&b.display))
    });

    scored
        .into_iter()
        .take(MAX_TOPICS)
        .map(|t| RankedTopic {
            label: t.display,
            volume: t.count * 100,
        })
        .collect()
}

/// Deterministic local trend generator, seeded by wall-clock hour, weekday
/// and month so repeated calls in the same window return comparable lists.
/// A small multiplicative jitter keeps volumes from looking frozen.
/// Availability over accuracy: the orchestrator always gets topics to act on.
pub fn local_trending_topics() -> Vec<RankedTopic> {
    let now = Local::now();
    local_trending_topics_at(now.hour(), now.weekday().num_days_from_monday(), now.month())
}

fn local_trending_topics_at(hour: u32, weekday_from_monday: u32, month: u32) -> Vec<RankedTopic> {
    let mut base: Vec<(&str, i64)> = vec![
        ("#Brasil", 45300),
        ("#Política", 38200),
        ("#Economia", 32100),
        ("#Tecnologia", 28900),
        ("#IA", 24700),
        ("#Sustentabilidade", 21500),
        ("#FinTech", 18200),
        ("#StartupBrasil", 15800),
        ("#Inovação", 13400),
        ("#Empreendedorismo", 11200),
    ];

    // Daypart bucket
    base.extend(match hour {
        6..=9 => [("#BomDia", 22000), ("#Bolsa", 19500), ("#Notícias", 16800)],
        12..=14 => [("#Almoço", 18000), ("#Novela", 15200), ("#Música", 13500)],
        18..=22 => [("#Futebol", 35000), ("#Entretenimento", 28000), ("#Streaming", 22000)],
        _ => [("#TechBrasil", 17000), ("#Educação", 14500), ("#Saúde", 12800)],
    });

    // Weekend vs weekday bucket
    base.extend(if weekday_from_monday >= 5 {
        [("#FimDeSemana", 20000), ("#Lazer", 17500)]
    } else {
        [("#TrabalhoRemoto", 16000), ("#Produtividade", 14200)]
    });

    // Seasonal bucket (southern hemisphere)
    base.extend(match month {
        12 | 1 | 2 => [("#Verão", 25000), ("#Férias", 22000)],
        3..=5 => [("#VoltaÀsAulas", 21000), ("#Carnaval", 18500)],
        6..=8 => [("#FériasDeJulho", 19000), ("#Inverno", 16500)],
        _ => [("#Primavera", 18000), ("#ENEM", 23000)],
    });

    let mut rng = rand::rng();
    let mut topics: Vec<RankedTopic> = base
        .into_iter()
        .map(|(label, volume)| RankedTopic {
            label: label.to_string(),
            // ±20% jitter so repeated fallback windows look alive but comparable
            volume: (volume as f64 * rng.random_range(0.8..=1.2)) as i64,
        })
        .collect();

    topics.sort_by(|a, b| b.volume.cmp(&a.volume).then_with(|| a.label.cmp(&b.label)));
    topics.truncate(MAX_TOPICS);
    topics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_generator_is_nonempty_capped_and_sorted() {
        let topics = local_trending_topics();
        assert!(!topics.is_empty());
        assert!(topics.len() <= MAX_TOPICS);
        assert!(topics.windows(2).all(|w| w[0].volume >= w[1].volume));
        assert!(topics.iter().all(|t| t.label.starts_with('#')));
    }

    #[test]
    fn local_generator_labels_are_unique() {
        for hour in [7, 13, 20, 2] {
            let topics = local_trending_topics_at(hour, 2, 4);
            let mut labels: Vec<&str> = topics.iter().map(|t| t.label.as_str()).collect();
            labels.sort_unstable();
            labels.dedup();
            assert_eq!(labels.len(), topics.len());
        }
    }

    #[test]
    fn local_generator_varies_by_daypart() {
        let morning = local_trending_topics_at(7, 1, 4);
        let evening = local_trending_topics_at(20, 1, 4);
        assert!(morning.iter().any(|t| t.label == "#BomDia"));
        assert!(evening.iter().any(|t| t.label == "#Futebol"));
        assert!(!evening.iter().any(|t| t.label == "#BomDia"));
    }

    #[test]
    fn ranking_counts_hashtags_and_engagement() {
        let posts = vec![
            serde_json::json!({"text": "big news #IA hoje", "public_metrics": {"like_count": 50, "retweet_count": 10}}),
            serde_json::json!({"text": "#IA e #Economia em alta", "public_metrics": {"like_count": 0, "retweet_count": 0}}),
            serde_json::json!({"text": "sem hashtag nenhuma"}),
        ];
        let trends = rank_hashtags(&posts);
        assert_eq!(trends[0].label, "#IA");
        assert_eq!(trends[0].volume, 200);
        assert_eq!(trends.len(), 2);
    }

    #[test]
    fn ranking_strips_trailing_punctuation() {
        let posts = vec![serde_json::json!({"text": "olha só #Brasil! e #Brasil."})];
        let trends = rank_hashtags(&posts);
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].label, "#Brasil");
        assert_eq!(trends[0].volume, 200);
    }
}
