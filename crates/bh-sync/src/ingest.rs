//! Battle-history ingestion: pick a player, fetch, stage unseen battles.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bh_api::BattleSource;
use bh_core::REQUEST_STATUS_READY;
use bh_storage::{load_pending_requests, save_pending_requests, StoreLayout, StoreRegistry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Registered when the player table is empty so the crawl has somewhere to start.
    pub seed_player: Option<String>,
    pub pending_requests_file: PathBuf,
    pub idle: Duration,
    pub player_delay: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub player: String,
    pub priority: bool,
    pub fetched: usize,
    pub staged: usize,
    pub already_indexed: usize,
    pub already_staged: usize,
    pub missing_id: usize,
    pub new_players: usize,
    pub fetch_failed: bool,
    pub request_settled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub enum CycleOutcome {
    /// No registered player to scan.
    Idle,
    Scanned(IngestSummary),
}

pub struct Harvester {
    source: Box<dyn BattleSource>,
    settings: IngestSettings,
}

impl Harvester {
    pub fn new(source: Box<dyn BattleSource>, settings: IngestSettings) -> Self {
        Self { source, settings }
    }

    /// Scan one player. The pending-requests file is loaded once per cycle and only
    /// written back when a request is settled.
    pub async fn run_cycle(&self, stores: &StoreRegistry, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let run_id = Uuid::new_v4();
        self.cycle(stores, now)
            .instrument(info_span!("ingest", %run_id))
            .await
    }

    async fn cycle(&self, stores: &StoreRegistry, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let players = stores.players().await.context("opening player registry")?;
        let raw = stores.raw().await.context("opening raw store")?;
        let index = stores.index().await.context("opening battle index")?;

        if players.count().await? == 0 {
            if let Some(seed) = &self.settings.seed_player {
                players.register_if_absent(seed).await?;
                info!(player = %seed, "player registry empty; seeded");
            }
        }

        let mut requests = load_pending_requests(&self.settings.pending_requests_file).await;
        let priority_names: Vec<String> = requests
            .iter()
            .filter_map(|r| r.detected_target())
            .map(str::to_string)
            .collect();

        let (player, priority) = match players.next_priority(&priority_names).await? {
            Some(player) => {
                info!(player = %player, "scanning player with a pending request");
                (player, true)
            }
            None => match players.next_to_scan().await? {
                Some(player) => (player, false),
                None => return Ok(CycleOutcome::Idle),
            },
        };

        let mut summary = IngestSummary {
            player: player.clone(),
            priority,
            ..IngestSummary::default()
        };

        let battles = match self.source.battle_history(&player).await {
            Ok(battles) => battles,
            Err(err) => {
                error!(player = %player, error = %err, "battle history fetch failed; treating as empty");
                summary.fetch_failed = true;
                Vec::new()
            }
        };
        summary.fetched = battles.len();

        for battle in &battles {
            let Some(battle_id) = battle.get("battle_queue_id_1").and_then(JsonValue::as_str) else {
                summary.missing_id += 1;
                warn!(player = %player, "battle without battle_queue_id_1; skipping");
                continue;
            };
            if index.contains(battle_id).await? {
                summary.already_indexed += 1;
                debug!(battle_id, "already migrated");
                continue;
            }
            if raw.insert_if_absent(battle_id, battle).await? {
                summary.staged += 1;
            } else {
                summary.already_staged += 1;
            }
        }

        for battle in &battles {
            for side in ["player_1", "player_2"] {
                if let Some(name) = battle.get(side).and_then(JsonValue::as_str) {
                    if !name.is_empty() && players.register_if_absent(name).await? {
                        summary.new_players += 1;
                    }
                }
            }
        }

        players.mark_scanned(&player, now).await?;

        if priority {
            if let Some(request) = requests
                .iter_mut()
                .find(|r| r.detected_target() == Some(player.as_str()))
            {
                request.status = Some(REQUEST_STATUS_READY.to_string());
                save_pending_requests(&self.settings.pending_requests_file, &requests)
                    .await
                    .context("saving pending requests")?;
                summary.request_settled = true;
                info!(player = %player, "pending request ready for processing");
            }
        }

        info!(
            player = %player,
            fetched = summary.fetched,
            staged = summary.staged,
            already_indexed = summary.already_indexed,
            new_players = summary.new_players,
            "player scanned"
        );
        Ok(CycleOutcome::Scanned(summary))
    }

    /// Run cycles until `shutdown` resolves. Each cycle gets a fresh [`StoreRegistry`]
    /// whose pools are released before the pause.
    pub async fn run_forever<F>(&self, layout: StoreLayout, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let stores = StoreRegistry::new(layout.clone());
            let outcome = self.run_cycle(&stores, Utc::now()).await;
            stores.close().await;

            let pause = match outcome {
                Ok(CycleOutcome::Idle) => {
                    info!(idle_secs = self.settings.idle.as_secs(), "no players to scan; waiting");
                    self.settings.idle
                }
                Ok(CycleOutcome::Scanned(_)) => self.settings.player_delay,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "ingestion cycle failed");
                    self.settings.idle
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; ingestion stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bh_api::ApiError;
    use bh_core::PendingRequest;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default, Clone)]
    struct FakeSource {
        histories: HashMap<String, Vec<JsonValue>>,
        failing: Vec<String>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl BattleSource for FakeSource {
        async fn battle_history(&self, player: &str) -> Result<Vec<JsonValue>, ApiError> {
            self.calls.lock().unwrap().push(player.to_string());
            if self.failing.iter().any(|p| p == player) {
                return Err(ApiError::HttpStatus {
                    status: 503,
                    url: "http://test/battle/history".into(),
                });
            }
            Ok(self.histories.get(player).cloned().unwrap_or_default())
        }
    }

    fn battle(id: &str, p1: &str, p2: &str) -> JsonValue {
        json!({"battle_queue_id_1": id, "player_1": p1, "player_2": p2, "match_type": "Ranked"})
    }

    fn settings(root: &Path) -> IngestSettings {
        IngestSettings {
            seed_player: Some("seed".into()),
            pending_requests_file: root.join("pending_requests.json"),
            idle: Duration::from_millis(10),
            player_delay: Duration::from_millis(10),
        }
    }

    fn registry(root: &Path) -> StoreRegistry {
        StoreRegistry::new(StoreLayout::new(root.join("data"), root.join("Season")))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn scanned(outcome: CycleOutcome) -> IngestSummary {
        match outcome {
            CycleOutcome::Scanned(summary) => summary,
            CycleOutcome::Idle => panic!("expected a scanned player"),
        }
    }

    #[tokio::test]
    async fn empty_registry_without_seed_is_idle() {
        let dir = tempdir().unwrap();
        let stores = registry(dir.path());
        let mut settings = settings(dir.path());
        settings.seed_player = None;
        let harvester = Harvester::new(Box::new(FakeSource::default()), settings);
        assert!(matches!(
            harvester.run_cycle(&stores, now()).await.unwrap(),
            CycleOutcome::Idle
        ));
        stores.close().await;
    }

    #[tokio::test]
    async fn seed_player_is_scanned_and_opponents_registered() {
        let dir = tempdir().unwrap();
        let stores = registry(dir.path());
        let source = FakeSource {
            histories: HashMap::from([(
                "seed".to_string(),
                vec![
                    battle("b1", "seed", "alice"),
                    battle("b2", "bob", "seed"),
                    json!({"player_1": "carol"}),
                ],
            )]),
            ..FakeSource::default()
        };
        let harvester = Harvester::new(Box::new(source), settings(dir.path()));

        let summary = scanned(harvester.run_cycle(&stores, now()).await.unwrap());
        assert_eq!(summary.player, "seed");
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.staged, 2);
        assert_eq!(summary.missing_id, 1);
        assert_eq!(summary.new_players, 3);

        let players = stores.players().await.unwrap();
        assert_eq!(players.count().await.unwrap(), 4);
        // Fresh players go ahead of the one just scanned.
        assert_eq!(players.next_to_scan().await.unwrap().as_deref(), Some("alice"));
        assert_eq!(stores.raw().await.unwrap().count().await.unwrap(), 2);
        stores.close().await;
    }

    #[tokio::test]
    async fn indexed_and_staged_battles_are_not_restaged() {
        let dir = tempdir().unwrap();
        let stores = registry(dir.path());
        stores.index().await.unwrap().insert_many(&["done".to_string()]).await.unwrap();
        stores
            .raw()
            .await
            .unwrap()
            .insert_if_absent("waiting", &battle("waiting", "seed", "x"))
            .await
            .unwrap();

        let source = FakeSource {
            histories: HashMap::from([(
                "seed".to_string(),
                vec![
                    battle("done", "seed", "x"),
                    battle("waiting", "seed", "x"),
                    battle("new", "seed", "x"),
                ],
            )]),
            ..FakeSource::default()
        };
        let harvester = Harvester::new(Box::new(source), settings(dir.path()));
        let summary = scanned(harvester.run_cycle(&stores, now()).await.unwrap());
        assert_eq!(summary.already_indexed, 1);
        assert_eq!(summary.already_staged, 1);
        assert_eq!(summary.staged, 1);

        let ids: Vec<String> = stores
            .raw()
            .await
            .unwrap()
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.battle_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "waiting".to_string()]);
        stores.close().await;
    }

    #[tokio::test]
    async fn pending_request_target_is_scanned_first_and_settled() {
        let dir = tempdir().unwrap();
        let stores = registry(dir.path());
        let players = stores.players().await.unwrap();
        players.register_if_absent("alice").await.unwrap();
        players.mark_scanned("target", now()).await.unwrap();

        let settings = settings(dir.path());
        let requests = vec![
            PendingRequest {
                target_username: Some("ghost".into()),
                status: Some("DETECTED".into()),
                ..PendingRequest::default()
            },
            PendingRequest {
                target_username: Some("target".into()),
                status: Some("DETECTED".into()),
                ..PendingRequest::default()
            },
        ];
        save_pending_requests(&settings.pending_requests_file, &requests)
            .await
            .unwrap();

        let source = FakeSource::default();
        let calls = source.calls.clone();
        let harvester = Harvester::new(Box::new(source), settings.clone());
        let summary = scanned(harvester.run_cycle(&stores, now()).await.unwrap());
        assert!(summary.priority);
        assert!(summary.request_settled);
        assert_eq!(summary.player, "target");
        assert_eq!(calls.lock().unwrap().as_slice(), ["target".to_string()]);

        let saved = load_pending_requests(&settings.pending_requests_file).await;
        assert_eq!(saved[0].status.as_deref(), Some("DETECTED"));
        assert_eq!(saved[1].status.as_deref(), Some(REQUEST_STATUS_READY));

        // With the request settled the regular queue takes over.
        let summary = scanned(harvester.run_cycle(&stores, now()).await.unwrap());
        assert!(!summary.priority);
        assert_eq!(summary.player, "alice");
        stores.close().await;
    }

    #[tokio::test]
    async fn fetch_failure_yields_empty_cycle_and_still_rotates_player() {
        let dir = tempdir().unwrap();
        let stores = registry(dir.path());
        let source = FakeSource {
            failing: vec!["seed".into()],
            ..FakeSource::default()
        };
        let harvester = Harvester::new(Box::new(source), settings(dir.path()));
        let summary = scanned(harvester.run_cycle(&stores, now()).await.unwrap());
        assert!(summary.fetch_failed);
        assert_eq!(summary.fetched, 0);
        assert_eq!(
            stores.players().await.unwrap().oldest_scan().await.unwrap(),
            Some(now())
        );
        stores.close().await;
    }

    #[tokio::test]
    async fn run_forever_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.seed_player = None;
        let harvester = Harvester::new(Box::new(FakeSource::default()), settings);
        let layout = StoreLayout::new(dir.path().join("data"), dir.path().join("Season"));
        tokio::time::timeout(
            Duration::from_secs(5),
            harvester.run_forever(layout, tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
