//! Season and format classification of staged battles.

use bh_core::{
    parse_api_timestamp, BattleDocument, ClassifiedBattle, RawBattleRecord, SeasonIndex,
    StructuredStoreKey, UNKNOWN_FORMAT,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

/// Why a staged record stays in the raw store this run.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("payload is not a valid battle document: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("battle has no created_date")]
    MissingCreatedDate,
    #[error("created_date {0:?} is not a valid timestamp")]
    InvalidCreatedDate(String),
    #[error("no known season covers {0}")]
    NoSeason(String),
    #[error("battle has no {0}")]
    Incomplete(&'static str),
}

/// Derive the destination format of a battle.
///
/// Ranked battles without a real format are wild; tournaments are split into brawls and
/// regular tournaments by the `tournament_id` in their settings; otherwise the declared
/// format wins, falling back to the lowercased match type. `None` means the battle carries
/// neither and belongs to the unknown bucket.
pub fn classify_format(
    match_type: Option<&str>,
    declared_format: Option<&str>,
    settings: Option<&JsonValue>,
) -> Option<String> {
    if match_type == Some("Ranked") && matches!(declared_format, None | Some("Ranked")) {
        return Some("wild".to_string());
    }
    if match_type == Some("Tournament") {
        let is_brawl = tournament_id(settings)
            .map(|id| id.to_ascii_uppercase().contains("BRAWL"))
            .unwrap_or(false);
        return Some(if is_brawl { "brawl" } else { "tournament" }.to_string());
    }
    match (declared_format, match_type) {
        (None, Some(match_type)) => Some(match_type.to_lowercase()),
        (declared, _) => declared.map(str::to_string),
    }
}

/// `tournament_id` from a settings blob that is normally a JSON-encoded string.
fn tournament_id(settings: Option<&JsonValue>) -> Option<String> {
    let parsed;
    let object = match settings {
        None | Some(JsonValue::Null) => return None,
        Some(JsonValue::String(text)) => match serde_json::from_str::<JsonValue>(text) {
            Ok(value) => {
                parsed = value;
                &parsed
            }
            Err(err) => {
                warn!(error = %err, "tournament settings are not valid JSON; assuming tournament");
                return None;
            }
        },
        Some(value) => value,
    };
    object
        .get("tournament_id")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

/// Decode a staged record and place it in its (season, format) destination.
pub fn classify_record(
    record: &RawBattleRecord,
    seasons: &SeasonIndex,
) -> Result<(StructuredStoreKey, ClassifiedBattle), SkipReason> {
    let payload: JsonValue = serde_json::from_str(&record.payload)?;
    let doc: BattleDocument = serde_json::from_value(payload.clone())?;

    let created_date = doc
        .created_date
        .filter(|d| !d.trim().is_empty())
        .ok_or(SkipReason::MissingCreatedDate)?;
    let created_at = parse_api_timestamp(&created_date)
        .map_err(|_| SkipReason::InvalidCreatedDate(created_date.clone()))?;
    let season_id = seasons
        .resolve(created_at)
        .ok_or_else(|| SkipReason::NoSeason(created_date.clone()))?;

    let player_1 = doc.player_1.ok_or(SkipReason::Incomplete("player_1"))?;
    let player_2 = doc.player_2.ok_or(SkipReason::Incomplete("player_2"))?;

    let format = classify_format(
        doc.match_type.as_deref(),
        doc.format.as_deref(),
        doc.settings.as_ref(),
    )
    .unwrap_or_else(|| UNKNOWN_FORMAT.to_string());
    let key = StructuredStoreKey::new(season_id, format);

    let battle = ClassifiedBattle {
        battle_id: record.battle_id.clone(),
        player_1,
        player_2,
        winner: doc.winner,
        loser: doc.loser,
        match_type: doc.match_type,
        format: key.format.clone(),
        mana_cap: doc.mana_cap,
        ruleset: doc.ruleset,
        created_date,
        player_1_rating_initial: doc.player_1_rating_initial,
        player_2_rating_initial: doc.player_2_rating_initial,
        player_1_rating_final: doc.player_1_rating_final,
        player_2_rating_final: doc.player_2_rating_final,
        original_payload: payload,
    };
    Ok((key, battle))
}
