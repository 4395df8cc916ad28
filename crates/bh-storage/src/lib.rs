//! SQLite-backed stores for staged, classified and indexed battles, plus the
//! file-backed snapshots (season index, pending requests) shared with other processes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use bh_core::{ClassifiedBattle, PendingRequest, RawBattleRecord, SeasonIndex, StructuredStoreKey};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bh-storage";

const RAW_DB_FILE: &str = "raw_battles.db";
const INDEX_DB_FILE: &str = "battle_index.db";
const PLAYERS_DB_FILE: &str = "players.db";

/// Rows per multi-row insert; 15 bound columns keeps each statement well under SQLite's
/// bound-parameter limit.
const INSERT_CHUNK_ROWS: usize = 200;
const ID_CHUNK: usize = 500;

const RAW_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS raw_battles (
    battle_id TEXT PRIMARY KEY,
    battle_data TEXT
)
"#;

const INDEX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processed_battles (
    battle_id TEXT PRIMARY KEY
)
"#;

const PLAYERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS players (
    player_name TEXT PRIMARY KEY,
    last_scanned_timestamp INTEGER DEFAULT 0
)
"#;

const STRUCTURED_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS battles (
    battle_id TEXT PRIMARY KEY,
    player_1 TEXT NOT NULL,
    player_2 TEXT NOT NULL,
    winner TEXT,
    loser TEXT,
    match_type TEXT,
    format TEXT NOT NULL,
    mana_cap INTEGER,
    ruleset TEXT,
    created_date TEXT NOT NULL,
    player_1_rating_initial INTEGER,
    player_2_rating_initial INTEGER,
    player_1_rating_final INTEGER,
    player_2_rating_final INTEGER,
    full_battle_json TEXT
)
"#;

/// On-disk placement of every store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub data_dir: PathBuf,
    pub season_root: PathBuf,
}

impl StoreLayout {
    pub fn new(data_dir: impl Into<PathBuf>, season_root: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            season_root: season_root.into(),
        }
    }

    pub fn raw_path(&self) -> PathBuf {
        self.data_dir.join(RAW_DB_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_DB_FILE)
    }

    pub fn players_path(&self) -> PathBuf {
        self.data_dir.join(PLAYERS_DB_FILE)
    }

    /// `<season_root>/<season_id>/<format>.db`
    pub fn structured_path(&self, key: &StructuredStoreKey) -> PathBuf {
        self.season_root
            .join(key.season_id.to_string())
            .join(format!("{}.db", key.file_stem()))
    }

    /// Every `<season_root>/*/*.db` file, sorted for stable processing order.
    pub async fn structured_store_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !fs::try_exists(&self.season_root)
            .await
            .with_context(|| format!("checking {}", self.season_root.display()))?
        {
            return Ok(files);
        }

        let mut seasons = fs::read_dir(&self.season_root)
            .await
            .with_context(|| format!("reading {}", self.season_root.display()))?;
        while let Some(season_dir) = seasons.next_entry().await? {
            if !season_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(season_dir.path())
                .await
                .with_context(|| format!("reading {}", season_dir.path().display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some("db")
                {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Identity of a store inside a [`StoreRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreId {
    Raw,
    Index,
    Players,
    Structured(StructuredStoreKey),
}

/// Open (creating if needed) a SQLite file in WAL mode so readers in other processes
/// never block on or observe a partial write.
pub async fn open_sqlite(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating store directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("opening sqlite store {}", path.display()))
}

async fn open_sqlite_read_only(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("opening sqlite store {} read-only", path.display()))
}

/// Lazily opened pools keyed by store identity, released together by [`StoreRegistry::close`].
#[derive(Debug)]
pub struct StoreRegistry {
    layout: StoreLayout,
    pools: Mutex<HashMap<StoreId, SqlitePool>>,
}

impl StoreRegistry {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            layout,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    async fn pool(&self, id: StoreId) -> anyhow::Result<SqlitePool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&id) {
            return Ok(pool.clone());
        }

        let (path, schema) = match &id {
            StoreId::Raw => (self.layout.raw_path(), RAW_SCHEMA),
            StoreId::Index => (self.layout.index_path(), INDEX_SCHEMA),
            StoreId::Players => (self.layout.players_path(), PLAYERS_SCHEMA),
            StoreId::Structured(key) => (self.layout.structured_path(key), STRUCTURED_SCHEMA),
        };
        let pool = open_sqlite(&path).await?;
        sqlx::query(schema)
            .execute(&pool)
            .await
            .with_context(|| format!("creating schema in {}", path.display()))?;
        debug!(store = ?id, path = %path.display(), "opened store");

        pools.insert(id, pool.clone());
        Ok(pool)
    }

    pub async fn raw(&self) -> anyhow::Result<RawStore> {
        Ok(RawStore {
            pool: self.pool(StoreId::Raw).await?,
        })
    }

    pub async fn index(&self) -> anyhow::Result<DedupIndex> {
        Ok(DedupIndex {
            pool: self.pool(StoreId::Index).await?,
        })
    }

    pub async fn players(&self) -> anyhow::Result<PlayerRegistry> {
        Ok(PlayerRegistry {
            pool: self.pool(StoreId::Players).await?,
        })
    }

    pub async fn structured(&self, key: &StructuredStoreKey) -> anyhow::Result<StructuredStore> {
        Ok(StructuredStore {
            key: key.clone(),
            pool: self.pool(StoreId::Structured(key.clone())).await?,
        })
    }

    /// Close every pool opened so far; returns how many were released.
    pub async fn close(&self) -> usize {
        let pools = std::mem::take(&mut *self.pools.lock().await);
        let released = pools.len();
        for (_, pool) in pools {
            pool.close().await;
        }
        debug!(released, "closed stores");
        released
    }
}

/// Staging table of not-yet-classified battle documents.
#[derive(Debug, Clone)]
pub struct RawStore {
    pool: SqlitePool,
}

impl RawStore {
    /// Returns `false` when the id was already staged.
    pub async fn insert_if_absent(&self, battle_id: &str, battle: &JsonValue) -> anyhow::Result<bool> {
        let payload = serde_json::to_string(battle).context("serializing raw battle")?;
        let result = sqlx::query("INSERT OR IGNORE INTO raw_battles (battle_id, battle_data) VALUES (?, ?)")
            .bind(battle_id)
            .bind(payload)
            .execute(&self.pool)
            .await
            .with_context(|| format!("staging raw battle {battle_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn load_all(&self) -> anyhow::Result<Vec<RawBattleRecord>> {
        let rows = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT battle_id, battle_data FROM raw_battles ORDER BY battle_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("reading raw battles")?;

        Ok(rows
            .into_iter()
            .map(|(battle_id, payload)| RawBattleRecord {
                battle_id,
                payload: payload.unwrap_or_default(),
            })
            .collect())
    }

    /// Delete every id in a single transaction.
    pub async fn delete_many(&self, battle_ids: &[String]) -> anyhow::Result<u64> {
        if battle_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.context("starting raw cleanup")?;
        let mut deleted = 0;
        for chunk in battle_ids.chunks(ID_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM raw_battles WHERE battle_id IN (");
            let mut ids = qb.separated(", ");
            for id in chunk {
                ids.push_bind(id.clone());
            }
            ids.push_unseparated(")");
            deleted += qb
                .build()
                .execute(&mut *tx)
                .await
                .context("deleting migrated raw battles")?
                .rows_affected();
        }
        tx.commit().await.context("committing raw cleanup")?;
        Ok(deleted)
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM raw_battles")
            .fetch_one(&self.pool)
            .await
            .context("counting raw battles")
    }
}

/// Classified battles of one (season, format) pair.
#[derive(Debug, Clone)]
pub struct StructuredStore {
    key: StructuredStoreKey,
    pool: SqlitePool,
}

impl StructuredStore {
    pub fn key(&self) -> &StructuredStoreKey {
        &self.key
    }

    /// Insert every battle whose id is not yet present, in one transaction.
    /// Returns the number of newly inserted rows.
    pub async fn insert_if_absent_many(&self, battles: &[ClassifiedBattle]) -> anyhow::Result<u64> {
        if battles.is_empty() {
            return Ok(0);
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("starting insert into {}", self.key))?;
        let mut inserted = 0;
        for chunk in battles.chunks(INSERT_CHUNK_ROWS) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT OR IGNORE INTO battles (battle_id, player_1, player_2, winner, loser, \
                 match_type, format, mana_cap, ruleset, created_date, player_1_rating_initial, \
                 player_2_rating_initial, player_1_rating_final, player_2_rating_final, full_battle_json) ",
            );
            qb.push_values(chunk, |mut row, battle| {
                row.push_bind(battle.battle_id.clone())
                    .push_bind(battle.player_1.clone())
                    .push_bind(battle.player_2.clone())
                    .push_bind(battle.winner.clone())
                    .push_bind(battle.loser.clone())
                    .push_bind(battle.match_type.clone())
                    .push_bind(battle.format.clone())
                    .push_bind(battle.mana_cap)
                    .push_bind(battle.ruleset.clone())
                    .push_bind(battle.created_date.clone())
                    .push_bind(battle.player_1_rating_initial)
                    .push_bind(battle.player_2_rating_initial)
                    .push_bind(battle.player_1_rating_final)
                    .push_bind(battle.player_2_rating_final)
                    .push_bind(Json(battle.original_payload.clone()));
            });
            inserted += qb
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting battles into {}", self.key))?
                .rows_affected();
        }
        tx.commit()
            .await
            .with_context(|| format!("committing insert into {}", self.key))?;
        Ok(inserted)
    }

    /// Subset of `battle_ids` that has a row in this store.
    pub async fn present_ids(&self, battle_ids: &[String]) -> anyhow::Result<HashSet<String>> {
        let mut present = HashSet::with_capacity(battle_ids.len());
        for chunk in battle_ids.chunks(ID_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT battle_id FROM battles WHERE battle_id IN (");
            let mut ids = qb.separated(", ");
            for id in chunk {
                ids.push_bind(id.clone());
            }
            ids.push_unseparated(")");
            let found: Vec<String> = qb
                .build_query_scalar()
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("verifying battles in {}", self.key))?;
            present.extend(found);
        }
        Ok(present)
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM battles")
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("counting battles in {}", self.key))
    }
}

/// Read every `battle_id` from a structured store file without modifying it.
/// Returns `None` when the file has no `battles` table.
pub async fn battle_ids_in_file(path: &Path) -> anyhow::Result<Option<Vec<String>>> {
    let pool = open_sqlite_read_only(path).await?;
    let has_table: Option<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'battles'")
            .fetch_optional(&pool)
            .await
            .with_context(|| format!("inspecting {}", path.display()))?;

    let ids: Option<Vec<String>> = match has_table {
        Some(_) => Some(
            sqlx::query_scalar("SELECT battle_id FROM battles")
                .fetch_all(&pool)
                .await
                .with_context(|| format!("reading battle ids from {}", path.display()))?,
        ),
        None => None,
    };
    pool.close().await;
    Ok(ids)
}

/// Set of battle ids already migrated into some structured store.
#[derive(Debug, Clone)]
pub struct DedupIndex {
    pool: SqlitePool,
}

impl DedupIndex {
    pub async fn contains(&self, battle_id: &str) -> anyhow::Result<bool> {
        let hit: Option<i64> = sqlx::query_scalar("SELECT 1 FROM processed_battles WHERE battle_id = ?")
            .bind(battle_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("looking up {battle_id} in battle index"))?;
        Ok(hit.is_some())
    }

    /// Insert-if-absent for every id, atomically as one unit. Returns newly added ids.
    pub async fn insert_many(&self, battle_ids: &[String]) -> anyhow::Result<u64> {
        if battle_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.context("starting battle index insert")?;
        let inserted = insert_index_ids(&mut tx, battle_ids).await?;
        tx.commit().await.context("committing battle index insert")?;
        Ok(inserted)
    }

    /// Replace the whole index with `battle_ids` in one transaction; concurrent readers
    /// see either the old or the new contents.
    pub async fn rebuild(&self, battle_ids: &[String]) -> anyhow::Result<i64> {
        let mut tx = self.pool.begin().await.context("starting battle index rebuild")?;
        sqlx::query("DELETE FROM processed_battles")
            .execute(&mut *tx)
            .await
            .context("clearing battle index")?;
        insert_index_ids(&mut tx, battle_ids).await?;
        tx.commit().await.context("committing battle index rebuild")?;
        self.count().await
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_battles")
            .fetch_one(&self.pool)
            .await
            .context("counting battle index")
    }
}

async fn insert_index_ids(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    battle_ids: &[String],
) -> anyhow::Result<u64> {
    let mut inserted = 0;
    for chunk in battle_ids.chunks(ID_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO processed_battles (battle_id) ");
        qb.push_values(chunk, |mut row, id| {
            row.push_bind(id.clone());
        });
        inserted += qb
            .build()
            .execute(&mut **tx)
            .await
            .context("inserting into battle index")?
            .rows_affected();
    }
    Ok(inserted)
}

/// Known players and when each was last scanned (unix seconds).
#[derive(Debug, Clone)]
pub struct PlayerRegistry {
    pool: SqlitePool,
}

impl PlayerRegistry {
    pub async fn count(&self) -> anyhow::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM players")
            .fetch_one(&self.pool)
            .await
            .context("counting players")
    }

    /// New players start at timestamp 0 so they are scanned ahead of known ones;
    /// existing players keep their position.
    pub async fn register_if_absent(&self, player_name: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO players (player_name, last_scanned_timestamp) VALUES (?, 0)",
        )
        .bind(player_name)
        .execute(&self.pool)
        .await
        .with_context(|| format!("registering player {player_name}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_scanned(&self, player_name: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO players (player_name, last_scanned_timestamp) VALUES (?, ?) \
             ON CONFLICT(player_name) DO UPDATE SET last_scanned_timestamp = excluded.last_scanned_timestamp",
        )
        .bind(player_name)
        .bind(at.timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking player {player_name} scanned"))?;
        Ok(())
    }

    /// Least recently scanned player.
    pub async fn next_to_scan(&self) -> anyhow::Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT player_name FROM players ORDER BY last_scanned_timestamp ASC, player_name ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("selecting next player")
    }

    /// First name in `priority` that is a registered player.
    pub async fn next_priority(&self, priority: &[String]) -> anyhow::Result<Option<String>> {
        for name in priority {
            let found: Option<String> =
                sqlx::query_scalar("SELECT player_name FROM players WHERE player_name = ?")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await
                    .with_context(|| format!("looking up priority player {name}"))?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    pub async fn oldest_scan(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        oldest_scan_in(&self.pool).await
    }
}

async fn oldest_scan_in(pool: &SqlitePool) -> anyhow::Result<Option<DateTime<Utc>>> {
    let min: Option<i64> = sqlx::query_scalar("SELECT MIN(last_scanned_timestamp) FROM players")
        .fetch_one(pool)
        .await
        .context("reading oldest scan timestamp")?;
    Ok(min.and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
}

/// Oldest scan time from an existing players file, opened read-only. A missing file is
/// an error rather than an empty registry.
pub async fn read_oldest_scan(path: &Path) -> anyhow::Result<Option<DateTime<Utc>>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        bail!("players database not found at {}", path.display());
    }
    let pool = open_sqlite_read_only(path).await?;
    let oldest = oldest_scan_in(&pool).await;
    pool.close().await;
    oldest
}

/// Load and sort the season index; any failure here is fatal for the caller's run.
pub async fn load_season_index(path: &Path) -> anyhow::Result<SeasonIndex> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading season file {}", path.display()))?;
    let index = SeasonIndex::from_json_str(&text)
        .with_context(|| format!("parsing season file {}", path.display()))?;
    if index.is_empty() {
        bail!("season file {} lists no seasons", path.display());
    }
    Ok(index)
}

/// Missing or unreadable files yield an empty list; the file is owned by another process.
pub async fn load_pending_requests(path: &Path) -> Vec<PendingRequest> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot read pending requests");
            return Vec::new();
        }
    };
    match serde_json::from_str(&text) {
        Ok(requests) => requests,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "pending requests file is not valid JSON");
            Vec::new()
        }
    }
}

pub async fn save_pending_requests(path: &Path, requests: &[PendingRequest]) -> anyhow::Result<()> {
    write_json_atomically(path, requests).await
}

/// Pretty-print `value` to a temp file beside `path`, then rename over it.
pub async fn write_json_atomically<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
