//! In-memory stand-ins for the store, the history source and Last.fm.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

use crate::db::UserStore;
use crate::error::{SourceError, StoreError, SubmitError};
use crate::lastfm::{ItemStatus, ScrobbleApi};
use crate::models::{ActiveFilter, Play, RawObservation, User, UserQuery};
use crate::normalize::dedup_key;
use crate::watermark::Watermark;
use crate::ytmusic::HistorySource;

pub const ARTIST: &str = "Artist";

pub fn user(id: &str) -> User {
    User {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        name: None,
        picture: None,
        is_active: true,
        youtube_credential: Some(credential(id)),
        lastfm_session_key: Some(format!("sk-{id}")),
        lastfm_username: Some(format!("lfm-{id}")),
        last_successful_scrobble: None,
        watermark: Vec::new(),
        accepted_ahead: Vec::new(),
        created_at: Utc::now(),
    }
}

pub fn credential(id: &str) -> String {
    format!("SAPISID=cookie-{id}")
}

pub fn play(key: &str) -> Play {
    Play {
        track_title: key.to_string(),
        artist_name: ARTIST.to_string(),
        source_id: None,
        dedup_key: key.to_string(),
        scrobbled_at: Utc::now(),
    }
}

/// `n` plays keyed `p0..p{n-1}`, oldest first.
pub fn plays(n: usize) -> Vec<Play> {
    (0..n).map(|i| play(&format!("p{i}"))).collect()
}

/// Key the normalizer derives for a `title` by [`ARTIST`].
pub fn key(title: &str) -> String {
    dedup_key(title, ARTIST, None)
}

/// A newest-first listing of the given titles.
pub fn listing(titles: &[&str]) -> Vec<Result<RawObservation, SourceError>> {
    titles
        .iter()
        .enumerate()
        .map(|(i, title)| {
            Ok(RawObservation {
                track_title: Some(title.to_string()),
                artist_name: Some(ARTIST.to_string()),
                source_id: None,
                observed_order: i,
            })
        })
        .collect()
}

/// Filter and search of the admin listing, applied to one user.
pub fn matches(query: &UserQuery, user: &User) -> bool {
    let filter_ok = match query.filter {
        ActiveFilter::All => true,
        ActiveFilter::Active => user.is_active,
        ActiveFilter::Inactive => !user.is_active,
    };
    if !filter_ok {
        return false;
    }

    match query.search() {
        Some(q) => {
            user.email.to_lowercase().contains(&q)
                || user
                    .lastfm_username
                    .as_ref()
                    .is_some_and(|name| name.to_lowercase().contains(&q))
        }
        None => true,
    }
}

#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<BTreeMap<String, User>>,
    advance_calls: AtomicUsize,
    write_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn with_users(users: Vec<User>) -> Self {
        Self {
            users: Mutex::new(users.into_iter().map(|u| (u.id.clone(), u)).collect()),
            ..Self::default()
        }
    }

    /// Every watermark write takes `delay` before it lands.
    pub fn with_slow_writes(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Watermark writes attempted so far.
    pub fn advance_calls(&self) -> usize {
        self.advance_calls.load(Ordering::SeqCst)
    }

    pub fn user(&self, id: &str) -> User {
        self.users.lock().get(id).cloned().expect("unknown test user")
    }

    pub fn update(&self, id: &str, f: impl FnOnce(&mut User)) {
        if let Some(user) = self.users.lock().get_mut(id) {
            f(user);
        }
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn eligible_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self
            .users
            .lock()
            .values()
            .filter(|u| u.is_eligible())
            .cloned()
            .collect())
    }

    async fn get_user(&self, id: &str) -> Result<User, StoreError> {
        self.users
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn advance_watermark(
        &self,
        id: &str,
        expected: &Watermark,
        next: &Watermark,
        scrobbled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.advance_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        let mut users = self.users.lock();
        let user = users
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if user.watermark != expected.keys() || user.accepted_ahead != expected.ahead() {
            return Err(StoreError::Conflict(id.to_string()));
        }
        user.watermark = next.keys().to_vec();
        user.accepted_ahead = next.ahead().to_vec();
        if scrobbled_at.is_some() {
            user.last_successful_scrobble = scrobbled_at;
        }
        Ok(())
    }

    async fn deactivate(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |u| u.is_active = false);
        Ok(())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<User, StoreError> {
        let mut users = self.users.lock();
        let user = users
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        user.is_active = active;
        Ok(user.clone())
    }

    async fn list_users(&self, query: &UserQuery) -> Result<(Vec<User>, i64), StoreError> {
        let mut matching: Vec<User> = self
            .users
            .lock()
            .values()
            .filter(|u| matches(query, u))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let per_page = query.per_page() as usize;
        let skip = (query.page() as usize - 1) * per_page;
        Ok((matching.into_iter().skip(skip).take(per_page).collect(), total))
    }
}

/// Serves canned listings keyed by credential.
#[derive(Default)]
pub struct ScriptedHistory {
    listings: Mutex<HashMap<String, Vec<Result<RawObservation, SourceError>>>>,
    delay: Option<Duration>,
    pub pulled: Arc<AtomicUsize>,
}

impl ScriptedHistory {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set(&self, credential: &str, items: Vec<Result<RawObservation, SourceError>>) {
        self.listings.lock().insert(credential.to_string(), items);
    }

    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }
}

impl HistorySource for ScriptedHistory {
    fn fetch_history<'a>(
        &'a self,
        credential: &'a str,
    ) -> BoxStream<'a, Result<RawObservation, SourceError>> {
        let items = self
            .listings
            .lock()
            .get(credential)
            .cloned()
            .unwrap_or_default();
        let delay = self.delay;
        let pulled = self.pulled.clone();

        stream::iter(items)
            .then(move |item| {
                let pulled = pulled.clone();
                async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    pulled.fetch_add(1, Ordering::SeqCst);
                    item
                }
            })
            .boxed()
    }
}

/// Records every batch (as dedup keys) and answers from a script, accepting
/// everything once the script runs out.
#[derive(Default)]
pub struct RecordingScrobbler {
    calls: Mutex<Vec<Vec<String>>>,
    sessions: Mutex<Vec<String>>,
    script: Mutex<VecDeque<Result<Vec<ItemStatus>, SubmitError>>>,
}

impl RecordingScrobbler {
    pub fn script(&self, responses: Vec<Result<Vec<ItemStatus>, SubmitError>>) {
        self.script.lock().extend(responses);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn sessions(&self) -> Vec<String> {
        self.sessions.lock().clone()
    }
}

#[async_trait]
impl ScrobbleApi for RecordingScrobbler {
    async fn scrobble(&self, session_key: &str, batch: &[Play]) -> Result<Vec<ItemStatus>, SubmitError> {
        self.sessions.lock().push(session_key.to_string());
        self.calls
            .lock()
            .push(batch.iter().map(|p| p.dedup_key.clone()).collect());

        match self.script.lock().pop_front() {
            Some(response) => response,
            None => Ok(vec![ItemStatus::Accepted; batch.len()]),
        }
    }
}
