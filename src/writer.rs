use async_trait::async_trait;
use serde_json::json;

use crate::config::Config;
use crate::error::GenerationError;
use crate::models::{ArticleDraft, GenerationOptions, Language};

/// Content Generation Adapter. Failures are caught at the orchestrator
/// boundary and substituted with [`fallback_article`]; the adapter is called
/// at most once per topic per run, never retried.
#[async_trait]
pub trait ArticleWriter: Send + Sync {
    async fn generate(&self, hashtag: &str, options: &GenerationOptions) -> Result<ArticleDraft, GenerationError>;
}

/// Live writer backed by an OpenAI-compatible chat-completion API in JSON mode.
pub struct HttpArticleWriter {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpArticleWriter {
    pub fn new(config: &Config, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.generation.base_url.clone(),
            model: config.generation.model.clone(),
            api_key: crate::config::resolve_credential(&config.generation.api_key, "TRENDWIRE_GENERATION_API_KEY"),
        }
    }
}

#[async_trait]
impl ArticleWriter for HttpArticleWriter {
    async fn generate(&self, hashtag: &str, options: &GenerationOptions) -> Result<ArticleDraft, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or(GenerationError::MissingCredential)?;

        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a senior news journalist. Always respond with a single valid JSON object."
                },
                {
                    "role": "user",
                    "content": build_prompt(hashtag, options)
                }
            ],
            "response_format": { "type": "json_object" },
            "max_tokens": 2000
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let payload: serde_json::Value = response.json().await?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GenerationError::OutputParse("response had no message content".to_string()))?;

        let draft: ArticleDraft = serde_json::from_str(content)
            .map_err(|e| GenerationError::OutputParse(format!("invalid article JSON: {e}")))?;

        if draft.title.trim().is_empty() || draft.content.trim().is_empty() || draft.excerpt.trim().is_empty() {
            return Err(GenerationError::OutputParse(
                "article JSON missing title, content, or excerpt".to_string(),
            ));
        }

        Ok(draft)
    }
}

fn build_prompt(hashtag: &str, options: &GenerationOptions) -> String {
    let (min_words, max_words) = options.length.word_band();
    let language = match options.language {
        Language::Pt => "Brazilian Portuguese",
        Language::En => "English",
        Language::Es => "Spanish",
    };

    format!(
        "Write a professional news-style blog article about the trending topic {hashtag}.\n\
         \n\
         Requirements:\n\
         - Language: {language}. Tone: {style}.\n\
         - {min_words}-{max_words} words of semantically structured HTML: one <h1>, \
         <h2>/<h3> subheadings, short <p> paragraphs, <ul> lists where useful.\n\
         - The title is a human headline: never include the '#' character.\n\
         - End with an engaging question for readers.\n\
         \n\
         Return a JSON object with exactly these keys:\n\
         {{\"title\": \"...\", \"content\": \"...full HTML...\", \
         \"excerpt\": \"150-180 character teaser\", \
         \"meta_description\": \"150-160 character SEO description\", \
         \"seo_keywords\": \"comma-separated keywords\"}}",
        style = options.style.as_str(),
    )
}

/// Deterministic fallback article interpolating the topic label. Guarantees a
/// single bad generation never aborts the batch: same label, same output.
pub fn fallback_article(hashtag: &str, options: &GenerationOptions) -> ArticleDraft {
    let subject = hashtag.trim_start_matches('#');

    let (title, lead, section, closing, excerpt, meta, keywords) = match options.language {
        Language::Pt => (
            format!("{subject}: o que está por trás da tendência"),
            format!("<p>{subject} está entre os assuntos mais comentados do momento. Entenda por que o tema ganhou força e o que ele revela.</p>"),
            format!("<h2>Por que {subject} está em alta</h2><p>O volume de menções a {subject} cresceu de forma expressiva nas últimas horas, refletindo o interesse do público pelo assunto.</p>"),
            format!("<h2>O que esperar</h2><p>O tema deve continuar em evidência nos próximos dias. E você, o que pensa sobre {subject}?</p>"),
            format!("{subject} está entre os assuntos mais comentados do momento. Veja por que o tema ganhou força e o que esperar nos próximos dias."),
            format!("Entenda por que {subject} virou tendência: contexto, repercussão e o que esperar. Leia a análise completa."),
            format!("{subject}, tendências, notícias"),
        ),
        Language::En => (
            format!("{subject}: what is behind the trend"),
            format!("<p>{subject} is among the most talked-about topics right now. Here is why it took off and what it signals.</p>"),
            format!("<h2>Why {subject} is trending</h2><p>Mentions of {subject} have grown sharply over the last hours, reflecting broad public interest in the subject.</p>"),
            format!("<h2>What to expect</h2><p>The topic is likely to stay in the spotlight over the coming days. What is your take on {subject}?</p>"),
            format!("{subject} is among the most talked-about topics right now. See why it took off and what to expect over the coming days."),
            format!("Why {subject} became a trend: context, reach, and what comes next. Read the full analysis."),
            format!("{subject}, trends, news"),
        ),
        Language::Es => (
            format!("{subject}: qué hay detrás de la tendencia"),
            format!("<p>{subject} está entre los temas más comentados del momento. Te explicamos por qué ganó fuerza y qué revela.</p>"),
            format!("<h2>Por qué {subject} es tendencia</h2><p>Las menciones de {subject} crecieron de forma notable en las últimas horas, reflejando el interés del público por el tema.</p>"),
            format!("<h2>Qué esperar</h2><p>El tema seguirá en el centro de la conversación en los próximos días. ¿Qué opinas sobre {subject}?</p>"),
            format!("{subject} está entre los temas más comentados del momento. Mira por qué ganó fuerza y qué esperar en los próximos días."),
            format!("Por qué {subject} se volvió tendencia: contexto, alcance y lo que viene. Lee el análisis completo."),
            format!("{subject}, tendencias, noticias"),
        ),
    };

    ArticleDraft {
        content: format!("<h1>{title}</h1>{lead}{section}{closing}"),
        title,
        excerpt,
        meta_description: meta,
        seo_keywords: keywords,
    }
}
