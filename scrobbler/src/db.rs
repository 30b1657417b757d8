use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::error::StoreError;
use crate::models::{ActiveFilter, User, UserQuery};
use crate::watermark::Watermark;

const USER_COLUMNS: &str = r#"
    id, email, name, picture, is_active, youtube_credential,
    lastfm_session_key, lastfm_username, last_successful_scrobble,
    watermark, accepted_ahead, created_at
"#;

/// Filter and search shared by the admin listing and its count. The search
/// is a literal substring match, so `_` and `%` carry no meaning.
const USER_FILTER: &str = r#"
    WHERE ($1 = 'all'
           OR ($1 = 'active' AND is_active)
           OR ($1 = 'inactive' AND NOT is_active))
      AND ($2::TEXT IS NULL
           OR strpos(LOWER(email), $2) > 0
           OR strpos(LOWER(COALESCE(lastfm_username, '')), $2) > 0)
"#;

/// Persistence boundary of the pipeline.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Active users holding a Last.fm session key, oldest account first.
    async fn eligible_users(&self) -> Result<Vec<User>, StoreError>;

    async fn get_user(&self, id: &str) -> Result<User, StoreError>;

    /// Replaces the watermark (both keys and accepted-ahead list) only if it
    /// still equals `expected`.
    /// `scrobbled_at`, when given, becomes the last successful scrobble time.
    async fn advance_watermark(
        &self,
        id: &str,
        expected: &Watermark,
        next: &Watermark,
        scrobbled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Takes a user out of scheduling after their credential was revoked.
    async fn deactivate(&self, id: &str) -> Result<(), StoreError>;

    async fn set_active(&self, id: &str, active: bool) -> Result<User, StoreError>;

    /// One page of users, newest account first, plus the total match count.
    async fn list_users(&self, query: &UserQuery) -> Result<(Vec<User>, i64), StoreError>;
}

pub async fn init_db(database_url: &str) -> Result<PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

fn filter_name(filter: ActiveFilter) -> &'static str {
    match filter {
        ActiveFilter::All => "all",
        ActiveFilter::Active => "active",
        ActiveFilter::Inactive => "inactive",
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn eligible_users(&self) -> Result<Vec<User>, StoreError> {
        let users = sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE is_active AND lastfm_session_key IS NOT NULL
            ORDER BY created_at
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    async fn get_user(&self, id: &str) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn advance_watermark(
        &self,
        id: &str,
        expected: &Watermark,
        next: &Watermark,
        scrobbled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET watermark = $4,
                accepted_ahead = $5,
                last_successful_scrobble = COALESCE($6, last_successful_scrobble)
            WHERE id = $1 AND watermark = $2 AND accepted_ahead = $3
            "#,
        )
        .bind(id)
        .bind(expected.keys())
        .bind(expected.ahead())
        .bind(next.keys())
        .bind(next.ahead())
        .bind(scrobbled_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        if self.exists(id).await? {
            Err(StoreError::Conflict(id.to_string()))
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    async fn deactivate(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET is_active = $2 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_users(&self, query: &UserQuery) -> Result<(Vec<User>, i64), StoreError> {
        let filter = filter_name(query.filter);
        let search = query.search();
        let limit = i64::from(query.per_page());
        let offset = i64::from(query.page() - 1) * limit;

        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users {USER_FILTER} ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(filter)
        .bind(&search)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM users {USER_FILTER}"))
            .bind(filter)
            .bind(&search)
            .fetch_one(&self.pool)
            .await?;

        Ok((users, count))
    }
}
