//! Raw store → structured stores → dedup index → raw cleanup.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use bh_core::{ClassifiedBattle, SeasonIndex, StructuredStoreKey};
use bh_storage::StoreRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::classify_record;

#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned: usize,
    /// Records confirmed present in their structured store.
    pub migrated: usize,
    pub skipped: usize,
    /// Rows newly written this run; lower than `migrated` when a retry finds rows
    /// that an interrupted run already wrote.
    pub inserted_rows: u64,
    pub indexed: u64,
    pub raw_deleted: u64,
    pub destinations: usize,
    pub failed_destinations: usize,
    pub cleanup_withheld: bool,
}

/// Single-pass classifier/migrator over everything currently staged.
///
/// Writes happen in a fixed order: every structured store, then the dedup index, then
/// the raw-store delete. All writes are insert-if-absent, so re-running after a crash or
/// a partial failure converges on the same state; the raw delete only runs once every
/// surviving record is confirmed in its structured store.
pub struct BattleMigrator<'a> {
    stores: &'a StoreRegistry,
    seasons: &'a SeasonIndex,
}

impl<'a> BattleMigrator<'a> {
    pub fn new(stores: &'a StoreRegistry, seasons: &'a SeasonIndex) -> Self {
        Self { stores, seasons }
    }

    pub async fn migrate_all(&self) -> Result<MigrationSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("migrate", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<MigrationSummary> {
        let started_at = Utc::now();
        let raw = self.stores.raw().await.context("opening raw store")?;
        let index = self.stores.index().await.context("opening battle index")?;

        let records = raw.load_all().await?;
        info!(staged = records.len(), seasons = self.seasons.len(), "classifying staged battles");

        let mut buckets: BTreeMap<StructuredStoreKey, Vec<ClassifiedBattle>> = BTreeMap::new();
        let mut skipped = 0usize;
        for record in &records {
            match classify_record(record, self.seasons) {
                Ok((key, battle)) => buckets.entry(key).or_default().push(battle),
                Err(reason) => {
                    skipped += 1;
                    warn!(battle_id = %record.battle_id, %reason, "skipping staged battle");
                }
            }
        }
        let survivors: usize = buckets.values().map(Vec::len).sum();

        // Open every destination before writing anything so an unopenable store aborts
        // the run with no store touched.
        let mut destinations = Vec::with_capacity(buckets.len());
        for (key, battles) in buckets {
            let store = self
                .stores
                .structured(&key)
                .await
                .with_context(|| format!("opening structured store for {key}"))?;
            destinations.push((store, battles));
        }

        let mut landed: Vec<String> = Vec::with_capacity(survivors);
        let mut inserted_rows = 0u64;
        let mut failed_destinations = 0usize;
        for (store, battles) in &destinations {
            let key = store.key();
            let ids: Vec<String> = battles.iter().map(|b| b.battle_id.clone()).collect();
            let written = match store.insert_if_absent_many(battles).await {
                Ok(inserted) => store.present_ids(&ids).await.map(|present| (inserted, present)),
                Err(err) => Err(err),
            };
            match written {
                Ok((inserted, present)) => {
                    inserted_rows += inserted;
                    debug!(
                        season_id = key.season_id,
                        format = %key.format,
                        bucket = battles.len(),
                        inserted,
                        present = present.len(),
                        "wrote structured store"
                    );
                    landed.extend(ids.into_iter().filter(|id| present.contains(id)));
                }
                Err(err) => {
                    failed_destinations += 1;
                    error!(
                        season_id = key.season_id,
                        format = %key.format,
                        bucket = battles.len(),
                        error = %format!("{err:#}"),
                        "structured store write failed; battles stay staged"
                    );
                }
            }
        }

        // Only ids that provably landed are indexed, so the index never names a battle
        // without a structured row.
        let indexed = index
            .insert_many(&landed)
            .await
            .context("recording migrated battles in the index")?;

        let cleanup_withheld = landed.len() != survivors;
        let raw_deleted = if cleanup_withheld {
            warn!(
                expected = survivors,
                landed = landed.len(),
                failed_destinations,
                "not every battle reached its structured store; raw cleanup withheld until the next run"
            );
            0
        } else {
            raw.delete_many(&landed)
                .await
                .context("deleting migrated battles from the raw store")?
        };

        let summary = MigrationSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scanned: records.len(),
            migrated: landed.len(),
            skipped,
            inserted_rows,
            indexed,
            raw_deleted,
            destinations: destinations.len(),
            failed_destinations,
            cleanup_withheld,
        };
        info!(
            migrated = summary.migrated,
            skipped = summary.skipped,
            inserted = summary.inserted_rows,
            raw_deleted = summary.raw_deleted,
            destinations = summary.destinations,
            "migration finished"
        );
        Ok(summary)
    }
}
