use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde_json::Value;

use crate::error::SubmitError;
use crate::models::Play;

const LASTFM_API_URL: &str = "https://ws.audioscrobbler.com/2.0/";

/// Last.fm accepts at most this many scrobbles per `track.scrobble` call.
pub const MAX_BATCH: usize = 50;

/// Per-item verdict of a scrobble call, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Accepted,
    Ignored(IgnoredReason),
}

/// <https://www.last.fm/api/show/track.scrobble#Attributes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredReason {
    ArtistFiltered,
    TrackFiltered,
    TimestampTooOld,
    TimestampTooNew,
    DailyLimitReached,
    Unknown(u64),
}

impl IgnoredReason {
    fn from_code(code: u64) -> Self {
        match code {
            1 => Self::ArtistFiltered,
            2 => Self::TrackFiltered,
            3 => Self::TimestampTooOld,
            4 => Self::TimestampTooNew,
            5 => Self::DailyLimitReached,
            other => Self::Unknown(other),
        }
    }

    /// Resubmitting won't change the verdict.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::DailyLimitReached)
    }
}

#[async_trait]
pub trait ScrobbleApi: Send + Sync {
    /// Submits one batch (at most [`MAX_BATCH`] plays) for the session's user.
    async fn scrobble(&self, session_key: &str, batch: &[Play]) -> Result<Vec<ItemStatus>, SubmitError>;
}

pub struct LastFmClient {
    client: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl LastFmClient {
    /// One client is shared by every worker; its limiter caps the
    /// application-wide call rate.
    pub fn new(api_key: String, api_secret: String, calls_per_sec: u32) -> anyhow::Result<Self> {
        Self::with_base_url(api_key, api_secret, calls_per_sec, LASTFM_API_URL)
    }

    pub fn with_base_url(
        api_key: String,
        api_secret: String,
        calls_per_sec: u32,
        base_url: &str,
    ) -> anyhow::Result<Self> {
        let quota = Quota::per_second(NonZeroU32::new(calls_per_sec).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            api_key,
            api_secret,
            base_url: base_url.to_string(),
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    fn scrobble_params(&self, session_key: &str, batch: &[Play]) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("method".to_string(), "track.scrobble".to_string());
        params.insert("api_key".to_string(), self.api_key.clone());
        params.insert("sk".to_string(), session_key.to_string());

        for (i, play) in batch.iter().enumerate() {
            params.insert(format!("artist[{i}]"), play.artist_name.clone());
            params.insert(format!("track[{i}]"), play.track_title.clone());
            params.insert(
                format!("timestamp[{i}]"),
                play.scrobbled_at.timestamp().to_string(),
            );
        }

        let signature = sign(&params, &self.api_secret);
        params.insert("api_sig".to_string(), signature);
        params.insert("format".to_string(), "json".to_string());
        params
    }
}

#[async_trait]
impl ScrobbleApi for LastFmClient {
    async fn scrobble(&self, session_key: &str, batch: &[Play]) -> Result<Vec<ItemStatus>, SubmitError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let params = self.scrobble_params(session_key, batch);

        self.limiter.until_ready().await;

        let response = self
            .client
            .post(&self.base_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| SubmitError::Unavailable(format!("scrobble request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SubmitError::Unavailable(format!("scrobble body unreadable: {}", e)))?;

        let doc: Value = match serde_json::from_str(&body) {
            Ok(doc) => doc,
            Err(_) => {
                return Err(SubmitError::Unavailable(format!(
                    "scrobble call returned {} with a non-json body",
                    status
                )))
            }
        };

        if !status.is_success() && doc.get("error").is_none() {
            return Err(SubmitError::Unavailable(format!(
                "scrobble call returned {}",
                status
            )));
        }

        parse_scrobble_response(&doc, batch.len())
    }
}

/// `api_sig`: md5 over every parameter as `name + value` in name order,
/// followed by the shared secret. `format` and `callback` are excluded.
pub fn sign(params: &BTreeMap<String, String>, secret: &str) -> String {
    let mut payload = String::new();
    for (name, value) in params {
        if name == "format" || name == "callback" {
            continue;
        }
        payload.push_str(name);
        payload.push_str(value);
    }
    payload.push_str(secret);
    format!("{:x}", md5::compute(payload.as_bytes()))
}

pub fn parse_scrobble_response(doc: &Value, expected: usize) -> Result<Vec<ItemStatus>, SubmitError> {
    if let Some(code) = doc.get("error").and_then(as_code) {
        let message = doc
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message");
        return Err(classify_error(code, message));
    }

    let items: Vec<&Value> = match doc.pointer("/scrobbles/scrobble") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => {
            return Err(SubmitError::Unavailable(
                "scrobble response has no results".to_string(),
            ))
        }
    };

    if items.len() != expected {
        return Err(SubmitError::Unavailable(format!(
            "scrobble response has {} results for {} plays",
            items.len(),
            expected
        )));
    }

    Ok(items
        .into_iter()
        .map(|item| {
            match item.pointer("/ignoredMessage/code").and_then(as_code) {
                Some(0) | None => ItemStatus::Accepted,
                Some(code) => ItemStatus::Ignored(IgnoredReason::from_code(code)),
            }
        })
        .collect())
}

/// Only session-level errors revoke the user; key, signature and service
/// errors concern the whole application and are retried.
fn classify_error(code: u64, message: &str) -> SubmitError {
    match code {
        9 | 14 | 15 | 17 => SubmitError::AuthRevoked(format!("last.fm error {}: {}", code, message)),
        _ => SubmitError::Unavailable(format!("last.fm error {}: {}", code, message)),
    }
}

/// Last.fm sends numeric fields either as numbers or as strings.
fn as_code(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
