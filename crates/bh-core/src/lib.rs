//! Core domain model for the battle harvester: seasons, battle documents and classified rows.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "bh-core";

/// Destination format used when a battle carries neither a format nor a match type.
pub const UNKNOWN_FORMAT: &str = "unknown";

/// One competitive season as published by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonDescriptor {
    pub id: i64,
    #[serde(rename = "ends")]
    pub ends_at: DateTime<Utc>,
    /// Remaining API fields (`reset_block_num`, `name`, ...) kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl SeasonDescriptor {
    pub fn new(id: i64, ends_at: DateTime<Utc>) -> Self {
        Self {
            id,
            ends_at,
            extra: BTreeMap::new(),
        }
    }
}

/// Seasons ordered by `ends_at`, resolving timestamps to half-open windows.
///
/// Season `i` covers `(ends_at(i-1), ends_at(i)]`; the first season starts at the
/// beginning of time. Anything after the last known `ends_at` is unresolvable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeasonIndex {
    seasons: Vec<SeasonDescriptor>,
}

impl SeasonIndex {
    pub fn new(mut seasons: Vec<SeasonDescriptor>) -> Self {
        seasons.sort_by_key(|s| s.ends_at);
        Self { seasons }
    }

    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        let seasons: Vec<SeasonDescriptor> = serde_json::from_str(text)?;
        Ok(Self::new(seasons))
    }

    pub fn seasons(&self) -> &[SeasonDescriptor] {
        &self.seasons
    }

    pub fn len(&self) -> usize {
        self.seasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seasons.is_empty()
    }

    pub fn latest(&self) -> Option<&SeasonDescriptor> {
        self.seasons.last()
    }

    pub fn resolve(&self, created_at: DateTime<Utc>) -> Option<i64> {
        // First season whose end is not before `created_at`. The previous season's end is
        // then strictly earlier, so the lower window bound needs no separate check.
        let position = self.seasons.partition_point(|s| s.ends_at < created_at);
        self.seasons.get(position).map(|s| s.id)
    }
}

/// Parse an API timestamp such as `2024-05-01T12:00:00.000Z`.
pub fn parse_api_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text.trim()).map(|ts| ts.with_timezone(&Utc))
}

/// Battle document as returned by the battle-history endpoint.
///
/// Every field is optional: the API omits fields freely and the classifier decides
/// which absences are fatal for a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleDocument {
    pub battle_queue_id_1: Option<String>,
    pub player_1: Option<String>,
    pub player_2: Option<String>,
    pub winner: Option<String>,
    pub loser: Option<String>,
    pub match_type: Option<String>,
    pub format: Option<String>,
    pub mana_cap: Option<i64>,
    pub ruleset: Option<String>,
    pub created_date: Option<String>,
    pub player_1_rating_initial: Option<i64>,
    pub player_2_rating_initial: Option<i64>,
    pub player_1_rating_final: Option<i64>,
    pub player_2_rating_final: Option<i64>,
    /// Usually a JSON-encoded string; occasionally already an object.
    pub settings: Option<JsonValue>,
}

/// Staged, unparsed battle awaiting classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBattleRecord {
    pub battle_id: String,
    pub payload: String,
}

/// Identity of one structured store: a (season, format) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StructuredStoreKey {
    pub season_id: i64,
    pub format: String,
}

impl StructuredStoreKey {
    /// Formats are trimmed and lowercased; a blank format becomes [`UNKNOWN_FORMAT`].
    pub fn new(season_id: i64, format: impl Into<String>) -> Self {
        let format = format.into().trim().to_lowercase();
        Self {
            season_id,
            format: if format.is_empty() {
                UNKNOWN_FORMAT.to_string()
            } else {
                format
            },
        }
    }

    /// File-system safe stem for the store file. `[a-z0-9-]` pass through and every other
    /// byte becomes `_xx` (lowercase hex), so distinct formats never share a file, even on
    /// case-insensitive file systems.
    pub fn file_stem(&self) -> String {
        if self.format.is_empty() {
            return "_".to_string();
        }
        let mut stem = String::with_capacity(self.format.len());
        for byte in self.format.bytes() {
            if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' {
                stem.push(char::from(byte));
            } else {
                stem.push_str(&format!("_{byte:02x}"));
            }
        }
        stem
    }
}

impl fmt::Display for StructuredStoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "season {} / {}", self.season_id, self.format)
    }
}

/// Fully classified battle row, ready for a structured store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedBattle {
    pub battle_id: String,
    pub player_1: String,
    pub player_2: String,
    pub winner: Option<String>,
    pub loser: Option<String>,
    pub match_type: Option<String>,
    pub format: String,
    pub mana_cap: Option<i64>,
    pub ruleset: Option<String>,
    pub created_date: String,
    pub player_1_rating_initial: Option<i64>,
    pub player_2_rating_initial: Option<i64>,
    pub player_1_rating_final: Option<i64>,
    pub player_2_rating_final: Option<i64>,
    pub original_payload: JsonValue,
}

pub const REQUEST_STATUS_DETECTED: &str = "DETECTED";
pub const REQUEST_STATUS_READY: &str = "READY_FOR_PROCESSING";

/// Entry of the externally maintained pending-requests file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl PendingRequest {
    pub fn is_detected(&self) -> bool {
        self.status.as_deref() == Some(REQUEST_STATUS_DETECTED)
    }

    pub fn detected_target(&self) -> Option<&str> {
        if self.is_detected() {
            self.target_username.as_deref().filter(|t| !t.is_empty())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 14, 0, 0).single().unwrap()
    }

    fn index() -> SeasonIndex {
        // Deliberately unsorted with non-contiguous ids.
        SeasonIndex::new(vec![
            SeasonDescriptor::new(152, ts(2024, 6, 1)),
            SeasonDescriptor::new(150, ts(2024, 4, 1)),
            SeasonDescriptor::new(151, ts(2024, 5, 1)),
        ])
    }

    #[test]
    fn seasons_are_sorted_by_end() {
        let ids: Vec<i64> = index().seasons().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![150, 151, 152]);
        assert_eq!(index().latest().map(|s| s.id), Some(152));
    }

    #[test]
    fn boundary_belongs_to_the_ending_season() {
        let idx = index();
        assert_eq!(idx.resolve(ts(2024, 5, 1)), Some(151));
        assert_eq!(idx.resolve(ts(2024, 5, 1) + Duration::milliseconds(1)), Some(152));
        assert_eq!(idx.resolve(ts(2024, 4, 1)), Some(150));
        assert_eq!(idx.resolve(ts(2024, 4, 1) + Duration::seconds(1)), Some(151));
    }

    #[test]
    fn first_season_window_is_open_ended_to_the_past() {
        assert_eq!(index().resolve(ts(2019, 1, 1)), Some(150));
    }

    #[test]
    fn timestamps_after_last_season_are_unresolved() {
        let idx = index();
        assert_eq!(idx.resolve(ts(2024, 6, 1) + Duration::seconds(1)), None);
        assert_eq!(SeasonIndex::default().resolve(ts(2024, 1, 1)), None);
    }

    #[test]
    fn duplicate_end_dates_resolve_to_first_listed() {
        let idx = SeasonIndex::new(vec![
            SeasonDescriptor::new(7, ts(2024, 4, 1)),
            SeasonDescriptor::new(8, ts(2024, 4, 1)),
        ]);
        assert_eq!(idx.resolve(ts(2024, 4, 1)), Some(7));
    }

    #[test]
    fn season_file_keeps_extra_fields() {
        let idx = SeasonIndex::from_json_str(
            r#"[{"id": 3, "ends": "2024-05-01T14:00:00.000Z", "reset_block_num": 9001}]"#,
        )
        .unwrap();
        let season = &idx.seasons()[0];
        assert_eq!(season.id, 3);
        assert_eq!(season.ends_at, ts(2024, 5, 1));
        assert_eq!(season.extra.get("reset_block_num"), Some(&JsonValue::from(9001)));
    }

    #[test]
    fn api_timestamps_parse_with_zulu_suffix() {
        let parsed = parse_api_timestamp("2024-05-01T14:00:00.000Z").unwrap();
        assert_eq!(parsed, ts(2024, 5, 1));
        assert!(parse_api_timestamp("yesterday").is_err());
    }

    #[test]
    fn store_key_file_stem_is_path_safe() {
        assert_eq!(StructuredStoreKey::new(1, "modern").file_stem(), "modern");
        assert_eq!(StructuredStoreKey::new(1, "../Wild").file_stem(), "_2e_2e_2fwild");
        assert_eq!(StructuredStoreKey::new(1, "  ").format, UNKNOWN_FORMAT);
        assert_eq!(StructuredStoreKey::new(1, "  ").file_stem(), UNKNOWN_FORMAT);
    }

    #[test]
    fn distinct_formats_get_distinct_store_files() {
        assert_eq!(StructuredStoreKey::new(151, " Modern "), StructuredStoreKey::new(151, "modern"));

        let stems = [
            StructuredStoreKey::new(151, "a b").file_stem(),
            StructuredStoreKey::new(151, "a_b").file_stem(),
            StructuredStoreKey::new(151, "a_20b").file_stem(),
            StructuredStoreKey { season_id: 151, format: "Modern".into() }.file_stem(),
            StructuredStoreKey { season_id: 151, format: "modern".into() }.file_stem(),
        ];
        for (i, a) in stems.iter().enumerate() {
            for b in &stems[i + 1..] {
                assert_ne!(a, b);
            }
            assert!(a.bytes().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'-' || c == b'_'));
        }
    }

    #[test]
    fn battle_document_tolerates_missing_fields() {
        let doc: BattleDocument = serde_json::from_str(
            r#"{"battle_queue_id_1": "sl_1", "match_type": "Ranked", "mana_cap": 27, "extra": true}"#,
        )
        .unwrap();
        assert_eq!(doc.battle_queue_id_1.as_deref(), Some("sl_1"));
        assert_eq!(doc.mana_cap, Some(27));
        assert!(doc.format.is_none());
    }

    #[test]
    fn pending_request_detects_priority_targets() {
        let req: PendingRequest = serde_json::from_str(
            r#"{"target_username": "alice", "status": "DETECTED", "requested_by": "bob"}"#,
        )
        .unwrap();
        assert_eq!(req.detected_target(), Some("alice"));
        assert_eq!(req.extra.get("requested_by"), Some(&JsonValue::from("bob")));

        let ready = PendingRequest {
            status: Some(REQUEST_STATUS_READY.to_string()),
            ..req
        };
        assert_eq!(ready.detected_target(), None);
    }
}
