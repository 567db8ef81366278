//! HTTP client for the dialogue service: buffered dialogue, greeting, media
//! and the remote ConfigStore.

use crate::audio::EncodedAudio;
use crate::config::{ServiceConfig, StoreSettings};
use crate::error::{KioskError, KioskResult};
use crate::events::Routing;
use crate::playback::MediaSource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Body of a buffered dialogue response.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DialogueResponse {
    #[serde(default)]
    pub user_text: String,
    #[serde(default)]
    pub answer_text: String,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub avatar_video_url: Option<String>,
    #[serde(default)]
    pub routing: Option<Routing>,
    #[serde(default)]
    pub subtitles_enabled: Option<bool>,
    /// Some deployments add expression hints to the buffered reply too.
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub gesture: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct GreetingRequest<'a> {
    user_text: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GreetingResponse {
    #[serde(default)]
    pub bot_text: String,
    #[serde(default)]
    pub audio_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DialogueClient {
    http: reqwest::Client,
    service: ServiceConfig,
}

impl DialogueClient {
    pub fn new(service: ServiceConfig) -> KioskResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(service.request_timeout())
            .connect_timeout(service.connect_timeout())
            .build()?;
        Ok(Self { http, service })
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    /// Submit one encoded utterance.
    pub async fn dialogue(&self, audio: &EncodedAudio) -> KioskResult<DialogueResponse> {
        let url = self.service.http_url(&self.service.dialogue_path);
        let part = reqwest::multipart::Part::bytes(audio.bytes.clone())
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new().part("audio", part);
        debug!(bytes = audio.bytes.len(), %url, "submitting utterance");
        let res = self.http.post(&url).multipart(form).send().await?;
        let res = check_status(res).await?;
        Ok(res.json().await?)
    }

    /// Ask the service for a greeting.
    pub async fn greet(&self, text: &str) -> KioskResult<GreetingResponse> {
        let url = self.service.http_url(&self.service.greeting_path);
        let res = self
            .http
            .post(&url)
            .json(&GreetingRequest { user_text: text })
            .send()
            .await?;
        let res = check_status(res).await?;
        Ok(res.json().await?)
    }

    /// Read the ConfigStore.
    pub async fn fetch_settings(&self) -> KioskResult<StoreSettings> {
        let url = self.service.http_url(&self.service.config_path);
        let res = check_status(self.http.get(&url).send().await?).await?;
        let doc: serde_json::Value = res.json().await?;
        let settings = StoreSettings::from_json(doc)
            .map_err(|e| KioskError::Config(format!("ConfigStore document: {e}")))?;
        info!(language = %settings.language, avatar_mode = %settings.avatar_mode, "⚙️ loaded ConfigStore");
        Ok(settings)
    }

    /// Download a media resource referenced by a reply.
    pub async fn fetch_bytes(&self, reference: &str) -> KioskResult<Vec<u8>> {
        let url = self.service.http_url(reference);
        let res = check_status(self.http.get(&url).send().await?).await?;
        Ok(res.bytes().await?.to_vec())
    }
}

#[async_trait::async_trait]
impl MediaSource for DialogueClient {
    async fn fetch(&self, reference: &str) -> KioskResult<Vec<u8>> {
        self.fetch_bytes(reference).await
    }
}

async fn check_status(res: reqwest::Response) -> KioskResult<reqwest::Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(KioskError::Remote(format!("service error {}: {}", status, body)))
}
