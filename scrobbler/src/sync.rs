//! One user's run: fetch, normalize, dedup, submit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::db::UserStore;
use crate::error::SyncError;
use crate::lastfm::ScrobbleApi;
use crate::models::{Play, User};
use crate::normalize::normalize;
use crate::submitter;
use crate::watermark::Watermark;
use crate::ytmusic::HistorySource;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub user_id: String,
    pub observed: usize,
    pub malformed: usize,
    pub unseen: usize,
    pub scrobbled: usize,
    pub skipped: usize,
    pub partial: bool,
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn UserStore>,
    history: Arc<dyn HistorySource>,
    scrobbler: Arc<dyn ScrobbleApi>,
    config: SyncConfig,
}

struct Fetched {
    plays: Vec<Play>,
    observed: usize,
    malformed: usize,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn UserStore>,
        history: Arc<dyn HistorySource>,
        scrobbler: Arc<dyn ScrobbleApi>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            history,
            scrobbler,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs the pipeline under the run timeout and applies the failure
    /// policy: revoked credentials deactivate the user, everything else waits
    /// for the next tick.
    pub async fn execute(&self, user: &User) -> Result<RunReport, SyncError> {
        let result = match tokio::time::timeout(self.config.run_timeout, self.run_user(user)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.config.run_timeout)),
        };

        match &result {
            Ok(report) if report.partial => tracing::warn!(
                "partial submission for user {}: {} scrobbled, remainder deferred",
                user.id,
                report.scrobbled
            ),
            Ok(report) => tracing::info!(
                "run for user {} done: {} observed, {} new, {} scrobbled",
                user.id,
                report.observed,
                report.unseen,
                report.scrobbled
            ),
            Err(e) if e.is_terminal() => {
                tracing::error!("deactivating user {}: {}", user.id, e);
                if let Err(store_err) = self.store.deactivate(&user.id).await {
                    tracing::error!("failed to deactivate user {}: {}", user.id, store_err);
                }
            }
            Err(e) => tracing::warn!("run for user {} failed, retrying next tick: {}", user.id, e),
        }

        result
    }

    /// The pipeline proper. Persisted state only changes inside
    /// [`submitter::submit`], after Last.fm confirmed a batch.
    pub async fn run_user(&self, user: &User) -> Result<RunReport, SyncError> {
        if !user.is_active {
            return Err(SyncError::NotEligible(user.id.clone()));
        }
        let Some(session_key) = user.lastfm_session_key.as_deref() else {
            return Err(SyncError::NotEligible(user.id.clone()));
        };
        let credential = user
            .youtube_credential
            .as_deref()
            .ok_or_else(|| SyncError::AuthRevoked("no YouTube credential stored".to_string()))?;

        let watermark = Watermark::with_ahead(user.watermark.clone(), user.accepted_ahead.clone());
        let fetched = self.fetch_plays(credential, &watermark, Utc::now()).await?;
        if fetched.malformed > 0 {
            tracing::debug!(
                "dropped {} malformed history entries for user {}",
                fetched.malformed,
                user.id
            );
        }

        let unseen = watermark.unseen(&fetched.plays, self.config.backlog_cap);
        let mut report = RunReport {
            user_id: user.id.clone(),
            observed: fetched.observed,
            malformed: fetched.malformed,
            unseen: unseen.len(),
            ..RunReport::default()
        };

        if unseen.is_empty() {
            return Ok(report);
        }

        let submitted = submitter::submit(
            self.scrobbler.clone(),
            self.store.clone(),
            &user.id,
            session_key,
            watermark,
            &unseen,
        )
        .await?;

        report.scrobbled = submitted.accepted;
        report.skipped = submitted.skipped;
        report.partial = submitted.partial;
        Ok(report)
    }

    /// Reads the listing until the watermark region is fully in view, the
    /// first-run cap is filled, or the fetch window is exhausted.
    async fn fetch_plays(
        &self,
        credential: &str,
        watermark: &Watermark,
        ingested_at: DateTime<Utc>,
    ) -> Result<Fetched, SyncError> {
        let mut stream = self.history.fetch_history(credential);
        let mut fetched = Fetched {
            plays: Vec::new(),
            observed: 0,
            malformed: 0,
        };

        while let Some(item) = stream.next().await {
            let raw = item?;
            fetched.observed += 1;

            match normalize(&raw, ingested_at) {
                Ok(play) => fetched.plays.push(play),
                Err(_) => fetched.malformed += 1,
            }

            if fetched.observed >= self.config.fetch_window {
                break;
            }
            if watermark.is_empty() {
                if fetched.plays.len() >= self.config.backlog_cap {
                    break;
                }
            } else if watermark.covers(&fetched.plays) {
                break;
            }
        }

        Ok(fetched)
    }
}
