use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{AUTHORIZATION, COOKIE, ORIGIN, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};

use crate::error::SourceError;
use crate::models::RawObservation;

const YTMUSIC_ORIGIN: &str = "https://music.youtube.com";
const HISTORY_BROWSE_ID: &str = "FEmusic_history";
const CLIENT_NAME: &str = "WEB_REMIX";
const CLIENT_VERSION: &str = "1.20240522.01.00";
const BROWSER_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:126.0) Gecko/20100101 Firefox/126.0";

/// Guards against a source that keeps handing out continuation tokens.
const MAX_PAGES: usize = 10;

/// A per-user listening history, newest entry first.
pub trait HistorySource: Send + Sync {
    /// Lazily streams the user's history. Pages are only requested as the
    /// consumer polls, so dropping the stream early skips the remaining pages.
    fn fetch_history<'a>(
        &'a self,
        credential: &'a str,
    ) -> BoxStream<'a, Result<RawObservation, SourceError>>;
}

/// Scrapes the YouTube Music "History" page with the user's browser cookie.
pub struct YtMusicClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct HistoryPage {
    pub entries: Vec<ScrapedEntry>,
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedEntry {
    pub title: Option<String>,
    pub artists: Option<String>,
    pub video_id: Option<String>,
}

impl ScrapedEntry {
    fn into_observation(self, observed_order: usize) -> RawObservation {
        RawObservation {
            track_title: self.title,
            artist_name: self.artists,
            source_id: self.video_id,
            observed_order,
        }
    }
}

struct PageCursor {
    continuation: Option<String>,
    next_order: usize,
    page: usize,
}

impl YtMusicClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(YTMUSIC_ORIGIN)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(BROWSER_UA)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_page(
        &self,
        cookie: &str,
        sapisid: &str,
        continuation: Option<&str>,
    ) -> Result<HistoryPage, SourceError> {
        let url = format!("{}/youtubei/v1/browse", self.base_url);
        let mut query = vec![("alt", "json"), ("prettyPrint", "false")];
        if let Some(token) = continuation {
            query.extend([("ctoken", token), ("continuation", token), ("type", "next")]);
        }

        let body = json!({
            "context": {
                "client": {
                    "clientName": CLIENT_NAME,
                    "clientVersion": CLIENT_VERSION,
                    "hl": "en",
                }
            },
            "browseId": HISTORY_BROWSE_ID,
        });

        let response = self
            .client
            .post(&url)
            .query(&query)
            .header(COOKIE, cookie)
            .header(AUTHORIZATION, sapisid_hash(sapisid, YTMUSIC_ORIGIN, unix_now()))
            .header(ORIGIN, YTMUSIC_ORIGIN)
            .header("X-Origin", YTMUSIC_ORIGIN)
            .header("X-Goog-AuthUser", "0")
            .header(USER_AGENT, BROWSER_UA)
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("history request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::AuthRevoked(format!(
                "history request returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "history request returned {}",
                status
            )));
        }

        let doc: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Unavailable(format!("history body unreadable: {}", e)))?;

        parse_history_page(&doc, continuation.is_some())
    }
}

impl HistorySource for YtMusicClient {
    fn fetch_history<'a>(
        &'a self,
        credential: &'a str,
    ) -> BoxStream<'a, Result<RawObservation, SourceError>> {
        let Some(sapisid) = sapisid_from_cookie(credential) else {
            return stream::once(async {
                Err(SourceError::AuthRevoked(
                    "credential has no SAPISID cookie".to_string(),
                ))
            })
            .boxed();
        };

        let start = PageCursor {
            continuation: None,
            next_order: 0,
            page: 0,
        };

        stream::try_unfold(Some(start), move |cursor| async move {
            let Some(cursor) = cursor else {
                return Ok::<_, SourceError>(None);
            };

            let page = self
                .fetch_page(credential, sapisid, cursor.continuation.as_deref())
                .await?;
            tracing::debug!(
                "history page {} returned {} entries",
                cursor.page,
                page.entries.len()
            );

            let observations: Vec<RawObservation> = page
                .entries
                .into_iter()
                .enumerate()
                .map(|(i, entry)| entry.into_observation(cursor.next_order + i))
                .collect();

            let next = match page.continuation {
                Some(token) if cursor.page + 1 < MAX_PAGES => Some(PageCursor {
                    continuation: Some(token),
                    next_order: cursor.next_order + observations.len(),
                    page: cursor.page + 1,
                }),
                _ => None,
            };

            Ok(Some((observations, next)))
        })
        .map_ok(|observations| stream::iter(observations.into_iter().map(Ok::<_, SourceError>)))
        .try_flatten()
        .boxed()
    }
}

/// Extracts history entries and the continuation token from a `browse`
/// response.
pub fn parse_history_page(doc: &Value, is_continuation: bool) -> Result<HistoryPage, SourceError> {
    let section_list = if is_continuation {
        doc.pointer("/continuationContents/sectionListContinuation")
    } else {
        doc.pointer(
            "/contents/singleColumnBrowseResultsRenderer/tabs/0/tabRenderer/content/sectionListRenderer",
        )
    };

    let Some(section_list) = section_list else {
        // A finished continuation chain comes back without contents.
        if is_continuation {
            return Ok(HistoryPage::default());
        }
        return Err(SourceError::Unavailable(
            "history payload has no section list".to_string(),
        ));
    };

    let entries = section_list
        .get("contents")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|section| section.get("musicShelfRenderer"))
        .filter_map(|shelf| shelf.get("contents").and_then(Value::as_array))
        .flatten()
        .filter_map(parse_entry)
        .collect();

    let continuation = section_list
        .pointer("/continuations/0/nextContinuationData/continuation")
        .and_then(Value::as_str)
        .map(String::from);

    Ok(HistoryPage {
        entries,
        continuation,
    })
}

fn parse_entry(item: &Value) -> Option<ScrapedEntry> {
    let renderer = item.get("musicResponsiveListItemRenderer")?;

    let title_run = flex_column_runs(renderer, 0).and_then(|runs| runs.first());
    let title = title_run
        .and_then(|run| run.get("text"))
        .and_then(Value::as_str)
        .map(String::from);

    let artists = flex_column_runs(renderer, 1)
        .map(|runs| artists_from_runs(runs))
        .filter(|artists| !artists.trim().is_empty());

    let video_id = renderer
        .pointer("/playlistItemData/videoId")
        .or_else(|| title_run.and_then(|run| run.pointer("/navigationEndpoint/watchEndpoint/videoId")))
        .and_then(Value::as_str)
        .map(String::from);

    Some(ScrapedEntry {
        title,
        artists,
        video_id,
    })
}

fn flex_column_runs(renderer: &Value, column: usize) -> Option<&Vec<Value>> {
    renderer
        .get("flexColumns")?
        .get(column)?
        .pointer("/musicResponsiveListItemFlexColumnRenderer/text/runs")?
        .as_array()
}

/// The subtitle column reads "Artist A & Artist B • Album • 3:45"; only the
/// part before the first bullet names the artists.
fn artists_from_runs(runs: &[Value]) -> String {
    runs.iter()
        .filter_map(|run| run.get("text").and_then(Value::as_str))
        .take_while(|text| text.trim() != "•")
        .collect()
}

pub fn sapisid_from_cookie(cookie: &str) -> Option<&str> {
    let mut fallback = None;
    for pair in cookie.split(';') {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        match name {
            "SAPISID" if !value.is_empty() => return Some(value),
            "__Secure-3PAPISID" if !value.is_empty() => fallback = Some(value),
            _ => {}
        }
    }
    fallback
}

/// `SAPISIDHASH <ts>_<sha1("<ts> <sapisid> <origin>")>`, the header browsers
/// send for cookie-authenticated innertube calls.
pub fn sapisid_hash(sapisid: &str, origin: &str, timestamp: u64) -> String {
    let digest = Sha1::digest(format!("{} {} {}", timestamp, sapisid, origin).as_bytes());
    format!("SAPISIDHASH {}_{}", timestamp, hex::encode(digest))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
