use chrono::{DateTime, Duration, Utc};

use crate::models::{Play, RawObservation};

/// A raw entry carried neither a title nor an artist.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedObservation {
    pub observed_order: usize,
}

/// Turns a scraped observation into a canonical play.
///
/// The source exposes no listen time, so `scrobbled_at` is derived from the
/// ingestion time: the newest entry gets `ingested_at`, each older entry one
/// second earlier, which keeps the listing's relative order on Last.fm.
pub fn normalize(
    raw: &RawObservation,
    ingested_at: DateTime<Utc>,
) -> Result<Play, MalformedObservation> {
    let title = raw.track_title.as_deref().map(clean).unwrap_or_default();
    let artist = raw.artist_name.as_deref().map(clean).unwrap_or_default();

    if title.is_empty() && artist.is_empty() {
        return Err(MalformedObservation {
            observed_order: raw.observed_order,
        });
    }

    let source_id = raw
        .source_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from);

    let dedup_key = dedup_key(&title, &artist, source_id.as_deref());
    let offset = Duration::seconds(raw.observed_order as i64);

    Ok(Play {
        track_title: title,
        artist_name: artist,
        source_id,
        dedup_key,
        scrobbled_at: ingested_at - offset,
    })
}

/// Stable identity of a track: case-folded title and artist plus the source id.
pub fn dedup_key(title: &str, artist: &str, source_id: Option<&str>) -> String {
    let basis = format!(
        "{}\u{1f}{}\u{1f}{}",
        title.to_lowercase(),
        artist.to_lowercase(),
        source_id.unwrap_or("")
    );
    format!("{:x}", md5::compute(basis.as_bytes()))
}

fn clean(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
