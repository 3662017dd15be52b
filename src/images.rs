use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::Config;
use crate::error::ImageError;

/// Visual role of a generated image, determining target dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    Banner,
    Content,
}

impl ImageSlot {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            ImageSlot::Banner => (800, 400),
            ImageSlot::Content => (400, 400),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageSlot::Banner => "banner",
            ImageSlot::Content => "content",
        }
    }
}

/// Image Generation Adapter. Total by contract: always returns a usable
/// image reference, falling back to a deterministic placeholder on any
/// upstream failure. The two per-article calls fail independently.
#[async_trait]
pub trait ImageMaker: Send + Sync {
    async fn generate(&self, context: &str, hashtag: &str, slot: ImageSlot) -> String;
}

pub struct HttpImageMaker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpImageMaker {
    pub fn new(config: &Config, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.images.base_url.clone(),
            api_key: crate::config::resolve_credential(&config.images.api_key, "TRENDWIRE_IMAGES_API_KEY"),
        }
    }

    async fn request(&self, context: &str, hashtag: &str, slot: ImageSlot) -> Result<String, ImageError> {
        let api_key = self.api_key.as_deref().ok_or(ImageError::MissingCredential)?;
        let (width, height) = slot.dimensions();

        let body = json!({
            "prompt": format!(
                "Professional editorial illustration for a news article. {context} Topic: {hashtag}. \
                 Clean, modern, no text overlay."
            ),
            "n": 1,
            "size": format!("{width}x{height}"),
        });

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImageError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let payload: serde_json::Value = response.json().await?;
        payload["data"][0]["url"]
            .as_str()
            .map(str::to_string)
            .ok_or(ImageError::NoImage)
    }
}

#[async_trait]
impl ImageMaker for HttpImageMaker {
    async fn generate(&self, context: &str, hashtag: &str, slot: ImageSlot) -> String {
        match self.request(context, hashtag, slot).await {
            Ok(url) => url,
            Err(e) => {
                warn!(hashtag = %hashtag, slot = %slot.as_str(), error = %e, "image generation failed, using placeholder");
                placeholder_image(hashtag, slot)
            }
        }
    }
}

/// Curated stock photo ids that read as generic editorial imagery.
const PLACEHOLDER_IDS: [u32; 10] = [10, 27, 42, 57, 72, 87, 104, 118, 135, 160];

/// Deterministic placeholder reference keyed by a hash of the normalized
/// topic label, so the same topic resolves to a visually consistent
/// placeholder across runs. Slots get distinct images for the same topic.
pub fn placeholder_image(hashtag: &str, slot: ImageSlot) -> String {
    let normalized = hashtag.trim_start_matches('#').to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let seed = u64::from_be_bytes(bytes);

    let base = PLACEHOLDER_IDS[(seed % PLACEHOLDER_IDS.len() as u64) as usize];
    let id = match slot {
        ImageSlot::Banner => base,
        ImageSlot::Content => base + 300,
    };

    let (width, height) = slot.dimensions();
    format!("https://picsum.photos/{width}/{height}?random={id}")
}
