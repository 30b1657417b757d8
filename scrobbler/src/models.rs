use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub is_active: bool,
    pub youtube_credential: Option<String>,
    pub lastfm_session_key: Option<String>,
    pub lastfm_username: Option<String>,
    pub last_successful_scrobble: Option<DateTime<Utc>>,
    pub watermark: Vec<String>,
    pub accepted_ahead: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Whether the scheduler may run the pipeline for this user.
    pub fn is_eligible(&self) -> bool {
        self.is_active && self.lastfm_session_key.is_some()
    }
}

/// Admin-facing view of a user. Credentials never leave the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub is_active: bool,
    pub lastfm_username: Option<String>,
    pub lastfm_authorized: bool,
    pub last_successful_scrobble: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            picture: user.picture.clone(),
            is_active: user.is_active,
            lastfm_username: user.lastfm_username.clone(),
            lastfm_authorized: user.lastfm_session_key.is_some(),
            last_successful_scrobble: user.last_successful_scrobble,
            created_at: user.created_at,
        }
    }
}

/// One history entry as scraped, before any cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub track_title: Option<String>,
    pub artist_name: Option<String>,
    pub source_id: Option<String>,
    /// Position in the source listing, 0 being the most recent.
    pub observed_order: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Play {
    pub track_title: String,
    pub artist_name: String,
    pub source_id: Option<String>,
    pub dedup_key: String,
    pub scrobbled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveFilter {
    #[default]
    All,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserQuery {
    #[serde(default)]
    pub filter: ActiveFilter,
    pub q: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl UserQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(10).clamp(1, 100)
    }

    pub fn search(&self) -> Option<String> {
        self.q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPage {
    pub users: Vec<UserSummary>,
    pub count: i64,
    pub page: u32,
    pub per_page: u32,
}
