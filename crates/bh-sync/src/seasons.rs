//! Incremental refresh of the season file from the season metadata endpoint.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use bh_api::SeasonSource;
use bh_core::SeasonDescriptor;
use bh_storage::write_json_atomically;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SeasonRefreshOptions {
    /// Upper bound on new ids probed past the highest known season.
    pub max_new: i64,
    pub pause: Duration,
}

impl Default for SeasonRefreshOptions {
    fn default() -> Self {
        Self {
            max_new: 50,
            pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefreshStop {
    /// Reached the season that is still running.
    CurrentSeason,
    FetchFailed,
    MissingEnd,
    LimitReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeasonRefresh {
    pub started_from: i64,
    pub fetched: usize,
    pub total: usize,
    pub latest_id: Option<i64>,
    pub stop: RefreshStop,
    pub written: bool,
}

async fn load_existing(path: &Path) -> Vec<SeasonDescriptor> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot read season file; starting empty");
            return Vec::new();
        }
    };
    serde_json::from_str(&text).unwrap_or_else(|err| {
        warn!(path = %path.display(), error = %err, "season file is not valid JSON; ignoring its contents");
        Vec::new()
    })
}

/// Fetch every season after the highest known id, up to and including the first one
/// that has not ended yet, and rewrite the file sorted by id.
pub async fn refresh_seasons(
    source: &dyn SeasonSource,
    path: &Path,
    now: DateTime<Utc>,
    options: SeasonRefreshOptions,
) -> Result<SeasonRefresh> {
    let mut by_id: BTreeMap<i64, SeasonDescriptor> = load_existing(path)
        .await
        .into_iter()
        .map(|s| (s.id, s))
        .collect();
    let max_known = by_id.keys().next_back().copied().unwrap_or(0).max(0);
    let started_from = max_known + 1;
    info!(from = started_from, known = by_id.len(), "refreshing seasons");

    let mut next_id = started_from;
    let mut fetched = 0usize;
    let stop = loop {
        let document = match source.season(next_id).await {
            Ok(document) => document,
            Err(err) => {
                info!(season_id = next_id, error = %err, "season fetch stopped the refresh");
                break RefreshStop::FetchFailed;
            }
        };
        let season: SeasonDescriptor = match serde_json::from_value(document) {
            Ok(season) => season,
            Err(err) => {
                warn!(season_id = next_id, error = %err, "season has no usable end date");
                break RefreshStop::MissingEnd;
            }
        };

        let still_running = season.ends_at > now;
        by_id.insert(season.id, season);
        fetched += 1;
        if still_running {
            break RefreshStop::CurrentSeason;
        }

        next_id += 1;
        if next_id > max_known + options.max_new {
            warn!(limit = options.max_new, "season refresh limit reached; more seasons may exist");
            break RefreshStop::LimitReached;
        }
        tokio::time::sleep(options.pause).await;
    };

    let seasons: Vec<&SeasonDescriptor> = by_id.values().collect();
    let written = !seasons.is_empty();
    if written {
        write_json_atomically(path, &seasons).await?;
    }
    info!(fetched, total = seasons.len(), ?stop, "season refresh finished");

    Ok(SeasonRefresh {
        started_from,
        fetched,
        total: seasons.len(),
        latest_id: by_id.keys().next_back().copied(),
        stop,
        written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bh_api::ApiError;
    use bh_storage::load_season_index;
    use chrono::TimeZone;
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::tempdir;

    /// Season `n` ends on day `n` of 2024; `ends` is omitted past `last`.
    struct FakeSeasons {
        last: i64,
        calls: AtomicI64,
    }

    #[async_trait]
    impl SeasonSource for FakeSeasons {
        async fn season(&self, season_id: i64) -> Result<JsonValue, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if season_id > self.last {
                return Ok(json!({"id": season_id, "name": "unannounced"}));
            }
            let ends = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::days(season_id);
            Ok(json!({"id": season_id, "ends": ends, "reset_block_num": season_id * 10}))
        }
    }

    fn options() -> SeasonRefreshOptions {
        SeasonRefreshOptions {
            max_new: 50,
            pause: Duration::ZERO,
        }
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(n)
    }

    #[tokio::test]
    async fn refresh_stops_after_first_running_season() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seasons_data.json");
        write_json_atomically(&path, &vec![SeasonDescriptor::new(3, day(3)), SeasonDescriptor::new(2, day(2))])
            .await
            .unwrap();

        let source = FakeSeasons { last: 100, calls: AtomicI64::new(0) };
        let refresh = refresh_seasons(&source, &path, day(5) + chrono::Duration::hours(1), options())
            .await
            .unwrap();
        assert_eq!(refresh.started_from, 4);
        assert_eq!(refresh.fetched, 3);
        assert_eq!(refresh.stop, RefreshStop::CurrentSeason);
        assert_eq!(refresh.latest_id, Some(6));

        let index = load_season_index(&path).await.unwrap();
        let ids: Vec<i64> = index.seasons().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
        assert_eq!(index.seasons()[4].extra.get("reset_block_num"), Some(&json!(60)));
    }

    #[tokio::test]
    async fn refresh_stops_when_end_is_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seasons_data.json");
        let source = FakeSeasons { last: 2, calls: AtomicI64::new(0) };
        let refresh = refresh_seasons(&source, &path, day(400), options()).await.unwrap();
        assert_eq!(refresh.started_from, 1);
        assert_eq!(refresh.stop, RefreshStop::MissingEnd);
        assert_eq!(refresh.total, 2);
        assert!(refresh.written);
    }

    #[tokio::test]
    async fn refresh_is_capped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seasons_data.json");
        let source = FakeSeasons { last: 500, calls: AtomicI64::new(0) };
        let refresh = refresh_seasons(
            &source,
            &path,
            day(1000),
            SeasonRefreshOptions { max_new: 5, pause: Duration::ZERO },
        )
        .await
        .unwrap();
        assert_eq!(refresh.stop, RefreshStop::LimitReached);
        assert_eq!(refresh.fetched, 5);
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn nothing_is_written_without_any_season() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seasons_data.json");
        let source = FakeSeasons { last: 0, calls: AtomicI64::new(0) };
        let refresh = refresh_seasons(&source, &path, day(1), options()).await.unwrap();
        assert!(!refresh.written);
        assert!(!path.exists());
    }
}
