//! Per-user high-water mark and the unseen-suffix computation.
//!
//! The history listing is scraped, so its order is only best-effort. Instead of
//! a single "last scrobbled" key the watermark keeps the keys of the last few
//! confirmed plays (newest first). A fresh listing is aligned against that
//! sequence, and keys that moved across the boundary are recognised as
//! already scrobbled.

use std::collections::HashMap;

use crate::models::Play;

/// Number of confirmed keys remembered per user.
pub const WATERMARK_DEPTH: usize = 10;

/// How many leading watermark keys may serve as the alignment anchor.
const ANCHOR_CANDIDATES: usize = 3;

/// Plays right before the boundary that are re-checked against displaced keys.
const OVERLAP_WINDOW: usize = 3;

/// Most accepted-ahead keys kept; one batch never produces more.
const AHEAD_DEPTH: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermark {
    keys: Vec<String>,
    /// Plays Last.fm accepted past a deferred one. They sit above the
    /// boundary until the deferred play is confirmed, and must not be sent
    /// again in the meantime.
    ahead: Vec<String>,
}

impl Watermark {
    pub fn new(keys: Vec<String>) -> Self {
        Self::with_ahead(keys, Vec::new())
    }

    pub fn with_ahead(mut keys: Vec<String>, mut ahead: Vec<String>) -> Self {
        keys.truncate(WATERMARK_DEPTH);
        if ahead.len() > AHEAD_DEPTH {
            ahead.drain(..ahead.len() - AHEAD_DEPTH);
        }
        Self { keys, ahead }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Confirmed keys, newest first.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn head(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    /// Keys already accepted above the boundary, oldest first.
    pub fn ahead(&self) -> &[String] {
        &self.ahead
    }

    /// Watermark after `confirmed` (oldest first) were acknowledged. Confirmed
    /// plays that were accepted ahead earlier leave the ahead list.
    pub fn advance(&self, confirmed: &[Play]) -> Watermark {
        let keys = confirmed
            .iter()
            .rev()
            .map(|play| play.dedup_key.clone())
            .chain(self.keys.iter().cloned())
            .collect();

        let mut ahead = self.ahead.clone();
        for play in confirmed {
            if let Some(i) = ahead.iter().position(|k| *k == play.dedup_key) {
                ahead.remove(i);
            }
        }
        Watermark::with_ahead(keys, ahead)
    }

    /// Adds keys accepted past the confirmed prefix.
    pub fn remember_ahead(&self, accepted: impl IntoIterator<Item = String>) -> Watermark {
        let mut ahead = self.ahead.clone();
        ahead.extend(accepted);
        Watermark::with_ahead(self.keys.clone(), ahead)
    }

    /// True once `plays` (newest first) reaches past the watermark far enough
    /// that reading more of the listing cannot change the outcome. Only an
    /// alignment on the head counts: a fallback anchor could still be
    /// overridden by the head turning up further down.
    pub fn covers(&self, plays: &[Play]) -> bool {
        self.locate(plays)
            .is_some_and(|b| b.anchor_offset == 0 && b.fully_compared)
    }

    /// Splits a newest-first listing and returns the unseen plays oldest first.
    ///
    /// When the watermark is empty or can't be located, only the newest
    /// `backlog_cap` plays are returned.
    pub fn unseen(&self, plays: &[Play], backlog_cap: usize) -> Vec<Play> {
        let mut fresh: Vec<Play> = match self.locate(plays) {
            Some(boundary) => {
                let window_start = boundary
                    .index
                    .saturating_sub(OVERLAP_WINDOW + boundary.anchor_offset);
                let mut displaced = boundary.displaced;

                plays[..boundary.index]
                    .iter()
                    .enumerate()
                    .filter(|(i, play)| {
                        if *i < window_start {
                            return true;
                        }
                        match displaced.get_mut(play.dedup_key.as_str()) {
                            Some(count) if *count > 0 => {
                                *count -= 1;
                                false
                            }
                            _ => true,
                        }
                    })
                    .map(|(_, play)| play.clone())
                    .collect()
            }
            None => plays.iter().take(backlog_cap).cloned().collect(),
        };

        fresh.reverse();
        fresh
    }

    fn locate<'a>(&'a self, plays: &[Play]) -> Option<Boundary<'a>> {
        for anchor_offset in 0..self.keys.len().min(ANCHOR_CANDIDATES) {
            let anchor = &self.keys[anchor_offset];
            let tail = &self.keys[anchor_offset + 1..];

            for (index, play) in plays.iter().enumerate() {
                if play.dedup_key != *anchor {
                    continue;
                }

                let after = &plays[index + 1..];
                let compared = after.len().min(tail.len());
                let mut displaced: HashMap<&str, usize> = HashMap::new();
                let mut agree = 0;
                for j in 0..compared {
                    if after[j].dedup_key == tail[j] {
                        agree += 1;
                    } else {
                        *displaced.entry(tail[j].as_str()).or_default() += 1;
                    }
                }

                if compared > 0 && agree * 2 < compared {
                    continue;
                }

                for key in &self.keys[..anchor_offset] {
                    *displaced.entry(key.as_str()).or_default() += 1;
                }

                return Some(Boundary {
                    index,
                    anchor_offset,
                    displaced,
                    fully_compared: compared == tail.len(),
                });
            }
        }
        None
    }
}

struct Boundary<'a> {
    /// Index of the first already-scrobbled play in the listing.
    index: usize,
    anchor_offset: usize,
    /// Watermark keys not found where the alignment expected them.
    displaced: HashMap<&'a str, usize>,
    fully_compared: bool,
}
