use std::sync::Arc;

use chrono::Utc;

use crate::db::UserStore;
use crate::error::SyncError;
use crate::lastfm::{ItemStatus, ScrobbleApi, MAX_BATCH};
use crate::models::Play;
use crate::watermark::Watermark;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitReport {
    /// Plays Last.fm accepted.
    pub accepted: usize,
    /// Plays permanently refused or never sendable; the watermark moves past
    /// them.
    pub skipped: usize,
    /// A batch stopped at a retryable rejection; the rest waits for the next
    /// tick.
    pub partial: bool,
    pub watermark: Watermark,
}

enum Verdict {
    Accepted,
    /// Accepted by an earlier, partial batch.
    AlreadyAccepted,
    Skipped,
    Retry,
}

struct BatchOutcome {
    accepted: usize,
    skipped: usize,
    partial: bool,
    watermark: Watermark,
}

/// Submits `plays` (oldest first) in batches and persists the watermark after
/// every acknowledged batch.
///
/// The watermark only ever covers the confirmed prefix of a batch: the first
/// retryable rejection ends the submission, and an error from the API leaves
/// earlier batches committed but the failing one untouched. Plays accepted
/// past a retryable rejection are kept as accepted-ahead keys and never sent
/// again.
///
/// Each batch runs on its own task, so abandoning the submission (a timeout,
/// a dropped request) cannot separate an acknowledged batch from its
/// watermark write.
pub async fn submit(
    api: Arc<dyn ScrobbleApi>,
    store: Arc<dyn UserStore>,
    user_id: &str,
    session_key: &str,
    mut watermark: Watermark,
    plays: &[Play],
) -> Result<SubmitReport, SyncError> {
    let mut report = SubmitReport::default();

    for chunk in plays.chunks(MAX_BATCH) {
        let batch = tokio::spawn(submit_batch(
            api.clone(),
            store.clone(),
            user_id.to_string(),
            session_key.to_string(),
            watermark.clone(),
            chunk.to_vec(),
        ));
        let outcome = batch
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))??;

        report.accepted += outcome.accepted;
        report.skipped += outcome.skipped;
        watermark = outcome.watermark;

        if outcome.partial {
            report.partial = true;
            break;
        }
    }

    report.watermark = watermark;
    Ok(report)
}

async fn submit_batch(
    api: Arc<dyn ScrobbleApi>,
    store: Arc<dyn UserStore>,
    user_id: String,
    session_key: String,
    watermark: Watermark,
    chunk: Vec<Play>,
) -> Result<BatchOutcome, SyncError> {
    let mut pending_ahead = watermark.ahead().to_vec();
    let resumed: Vec<bool> = chunk
        .iter()
        .map(|play| take_key(&mut pending_ahead, &play.dedup_key))
        .collect();

    // Last.fm fails the whole call on a missing artist or title, so those
    // never leave the process.
    let sendable: Vec<Play> = chunk
        .iter()
        .zip(&resumed)
        .filter(|(play, done)| !**done && is_sendable(play))
        .map(|(play, _)| play.clone())
        .collect();
    let statuses = if sendable.is_empty() {
        Vec::new()
    } else {
        api.scrobble(&session_key, &sendable).await?
    };
    let mut statuses = statuses.into_iter();

    let mut outcome = BatchOutcome {
        accepted: 0,
        skipped: 0,
        partial: false,
        watermark: watermark.clone(),
    };
    let mut confirmed = 0;
    let mut accepted_ahead = Vec::new();

    for (play, done) in chunk.iter().zip(&resumed) {
        let verdict = if *done {
            Verdict::AlreadyAccepted
        } else if !is_sendable(play) {
            Verdict::Skipped
        } else {
            match statuses.next() {
                Some(ItemStatus::Accepted) => Verdict::Accepted,
                Some(ItemStatus::Ignored(reason)) if reason.is_permanent() => {
                    tracing::info!(
                        "last.fm ignored '{}' by '{}' for user {}: {:?}",
                        play.track_title,
                        play.artist_name,
                        user_id,
                        reason
                    );
                    Verdict::Skipped
                }
                Some(ItemStatus::Ignored(reason)) => {
                    tracing::warn!(
                        "last.fm deferred '{}' for user {}: {:?}",
                        play.track_title,
                        user_id,
                        reason
                    );
                    Verdict::Retry
                }
                None => Verdict::Retry,
            }
        };

        if outcome.partial {
            // Past the first deferred play only acceptances matter.
            if let Verdict::Accepted = verdict {
                outcome.accepted += 1;
                accepted_ahead.push(play.dedup_key.clone());
            }
            continue;
        }

        match verdict {
            Verdict::Accepted => outcome.accepted += 1,
            Verdict::AlreadyAccepted => {}
            Verdict::Skipped => outcome.skipped += 1,
            Verdict::Retry => {
                outcome.partial = true;
                continue;
            }
        }
        confirmed += 1;
    }

    if confirmed > 0 || !accepted_ahead.is_empty() {
        let next = watermark
            .advance(&chunk[..confirmed])
            .remember_ahead(accepted_ahead);
        let scrobbled_at = (outcome.accepted > 0).then(Utc::now);
        store
            .advance_watermark(&user_id, &watermark, &next, scrobbled_at)
            .await?;
        outcome.watermark = next;
    }

    Ok(outcome)
}

fn is_sendable(play: &Play) -> bool {
    !play.track_title.is_empty() && !play.artist_name.is_empty()
}

fn take_key(keys: &mut Vec<String>, key: &str) -> bool {
    match keys.iter().position(|k| k == key) {
        Some(i) => {
            keys.remove(i);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubmitError;
    use crate::lastfm::IgnoredReason;
    use crate::testing::{play, plays, user, MemoryStore, RecordingScrobbler};
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, Arc<RecordingScrobbler>) {
        (
            Arc::new(MemoryStore::with_users(vec![user("u1")])),
            Arc::new(RecordingScrobbler::default()),
        )
    }

    #[tokio::test]
    async fn batches_respect_the_call_limit_and_order() {
        let (store, api) = setup();
        let unseen = plays(120);

        let report = submit(api.clone(), store.clone(), "u1", "sk", Watermark::default(), &unseen)
            .await
            .unwrap();

        let calls = api.calls();
        assert_eq!(
            calls.iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![50, 50, 20]
        );
        let sent: Vec<String> = calls.concat();
        let expected: Vec<String> = unseen.iter().map(|p| p.dedup_key.clone()).collect();
        assert_eq!(sent, expected);

        assert_eq!(report.accepted, 120);
        assert!(!report.partial);
        assert_eq!(report.watermark.head(), Some(unseen[119].dedup_key.as_str()));

        let stored = store.user("u1");
        assert_eq!(stored.watermark, report.watermark.keys());
        assert!(stored.last_successful_scrobble.is_some());
        // One watermark write per acknowledged batch.
        assert_eq!(store.advance_calls(), 3);
    }

    #[tokio::test]
    async fn retryable_rejection_stops_at_the_last_confirmed_play() {
        let (store, api) = setup();
        api.script(vec![Ok(vec![
            ItemStatus::Accepted,
            ItemStatus::Ignored(IgnoredReason::ArtistFiltered),
            ItemStatus::Ignored(IgnoredReason::DailyLimitReached),
            ItemStatus::Ignored(IgnoredReason::DailyLimitReached),
        ])]);
        let unseen = plays(4);

        let report = submit(api.clone(), store.clone(), "u1", "sk", Watermark::default(), &unseen)
            .await
            .unwrap();

        assert!(report.partial);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.watermark.head(), Some(unseen[1].dedup_key.as_str()));
        assert!(report.watermark.ahead().is_empty());
        assert_eq!(store.user("u1").watermark, report.watermark.keys());
    }

    #[tokio::test]
    async fn plays_accepted_past_a_deferred_one_are_not_sent_again() {
        let (store, api) = setup();
        api.script(vec![Ok(vec![
            ItemStatus::Accepted,
            ItemStatus::Ignored(IgnoredReason::DailyLimitReached),
            ItemStatus::Accepted,
        ])]);
        let unseen = plays(3);

        let first = submit(api.clone(), store.clone(), "u1", "sk", Watermark::default(), &unseen)
            .await
            .unwrap();

        assert!(first.partial);
        assert_eq!(first.accepted, 2);
        assert_eq!(first.watermark.head(), Some("p0"));
        assert_eq!(first.watermark.ahead(), &["p2"]);
        assert_eq!(store.user("u1").accepted_ahead, vec!["p2".to_string()]);

        // The next tick sees p1 and p2 above the boundary again.
        let retry = first.watermark.unseen(&[unseen[2].clone(), unseen[1].clone(), unseen[0].clone()], 50);
        let second = submit(api.clone(), store.clone(), "u1", "sk", first.watermark.clone(), &retry)
            .await
            .unwrap();

        assert_eq!(api.calls(), vec![vec!["p0", "p1", "p2"], vec!["p1"]]);
        assert_eq!(second.accepted, 1);
        assert_eq!(second.watermark.keys(), &["p2", "p1", "p0"]);
        assert!(second.watermark.ahead().is_empty());
        let stored = store.user("u1");
        assert_eq!(stored.watermark, second.watermark.keys());
        assert!(stored.accepted_ahead.is_empty());
    }

    #[tokio::test]
    async fn api_failure_on_a_later_batch_keeps_earlier_batches() {
        let (store, api) = setup();
        api.script(vec![
            Ok(vec![ItemStatus::Accepted; 50]),
            Err(SubmitError::Unavailable("503".into())),
        ]);
        let unseen = plays(60);

        let err = submit(api.clone(), store.clone(), "u1", "sk", Watermark::default(), &unseen)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::ScrobbleUnavailable(_)));
        let stored = store.user("u1");
        assert_eq!(stored.watermark.first(), Some(&unseen[49].dedup_key));
    }

    #[tokio::test]
    async fn unsendable_plays_are_skipped_without_a_call() {
        let (store, api) = setup();
        let mut lonely = play("untitled");
        lonely.artist_name.clear();

        let report = submit(
            api.clone(),
            store.clone(),
            "u1",
            "sk",
            Watermark::default(),
            &[lonely.clone()],
        )
        .await
        .unwrap();

        assert!(api.calls().is_empty());
        assert_eq!(report.skipped, 1);
        assert_eq!(report.watermark.head(), Some(lonely.dedup_key.as_str()));
        assert!(store.user("u1").last_successful_scrobble.is_none());
    }

    #[tokio::test]
    async fn a_watermark_moved_underneath_is_a_conflict() {
        let (store, api) = setup();
        store.update("u1", |u| u.watermark = vec!["elsewhere".to_string()]);

        let err = submit(api.clone(), store.clone(), "u1", "sk", Watermark::default(), &plays(2))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::WatermarkConflict(_)));
        let stored = store.user("u1");
        assert_eq!(stored.watermark, vec!["elsewhere".to_string()]);
        assert!(stored.last_successful_scrobble.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn an_abandoned_submission_still_records_its_batch() {
        let store = Arc::new(
            MemoryStore::with_users(vec![user("u1")]).with_slow_writes(Duration::from_millis(500)),
        );
        let api = Arc::new(RecordingScrobbler::default());
        let unseen = plays(2);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            submit(api.clone(), store.clone(), "u1", "sk", Watermark::default(), &unseen),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(api.calls().len(), 1);
        assert!(store.user("u1").watermark.is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.user("u1").watermark, vec!["p1".to_string(), "p0".to_string()]);
    }
}
