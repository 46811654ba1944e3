//! Core match model and identity keys for the ladder harvester.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ladder-core";

/// Rating sentinel for bots missing from the ratings lookup.
pub const UNKNOWN_RATING: i64 = -1;

/// Outcome of one side of a game. Draws are not modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameResult {
    Win,
    Loss,
}

impl GameResult {
    pub fn as_str(self) -> &'static str {
        match self {
            GameResult::Win => "Win",
            GameResult::Loss => "Loss",
        }
    }
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized game result {0:?}")]
pub struct ParseGameResultError(pub String);

impl FromStr for GameResult {
    type Err = ParseGameResultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("win") {
            Ok(GameResult::Win)
        } else if trimmed.eq_ignore_ascii_case("loss") {
            Ok(GameResult::Loss)
        } else {
            Err(ParseGameResultError(trimmed.to_string()))
        }
    }
}

/// One side of a ladder game as displayed by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    /// Rank label exactly as shown; not necessarily numeric.
    pub rank: String,
    pub rating: i64,
    /// Empty when the source gave no race.
    pub race: String,
    pub result: GameResult,
}

impl Participant {
    pub fn new(
        name: impl Into<String>,
        rank: impl Into<String>,
        race: impl Into<String>,
        result: GameResult,
    ) -> Self {
        Self {
            name: name.into(),
            rank: rank.into(),
            rating: UNKNOWN_RATING,
            race: race.into(),
            result,
        }
    }

    pub fn has_rating(&self) -> bool {
        self.rating != UNKNOWN_RATING
    }
}

/// Scraped match observation, not yet assigned an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDraft {
    pub participants: [Participant; 2],
    pub map_name: String,
    pub game_length: String,
    pub timestamp: String,
    pub date_scraped: String,
    pub replay_link: Option<String>,
}

impl MatchDraft {
    pub fn identity_key(&self, config: &IdentityKeyConfig) -> IdentityKey {
        IdentityKey::build(
            config,
            &self.participants,
            &self.map_name,
            &self.timestamp,
            &self.game_length,
        )
    }
}

/// Persisted match record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// `None` only for rows loaded from a store whose id cell did not parse.
    pub id: Option<u64>,
    pub participants: [Participant; 2],
    pub map_name: String,
    pub game_length: String,
    pub timestamp: String,
    pub date_scraped: String,
    pub replay_link: Option<String>,
    /// Cached "artifact exists" flag; the artifact directory is authoritative.
    pub downloaded: bool,
}

impl MatchRecord {
    pub fn from_draft(id: u64, draft: MatchDraft) -> Self {
        Self {
            id: Some(id),
            participants: draft.participants,
            map_name: draft.map_name,
            game_length: draft.game_length,
            timestamp: draft.timestamp,
            date_scraped: draft.date_scraped,
            replay_link: draft.replay_link,
            downloaded: false,
        }
    }

    pub fn identity_key(&self, config: &IdentityKeyConfig) -> IdentityKey {
        IdentityKey::build(
            config,
            &self.participants,
            &self.map_name,
            &self.timestamp,
            &self.game_length,
        )
    }

    /// File name the replay for this record is stored under, if the record has an id.
    pub fn artifact_file_name(&self, extension: &str) -> Option<String> {
        self.id.map(|id| artifact_file_name(id, extension))
    }

    pub fn is_pending_download(&self) -> bool {
        self.replay_link.is_some() && !self.downloaded
    }
}

pub fn artifact_file_name(id: u64, extension: &str) -> String {
    let ext = extension.trim_start_matches('.').trim();
    let ext = if ext.is_empty() { "bin" } else { ext };
    format!("{id}.{ext}")
}

/// Extra field that separates repeat matchups sharing map, bots and outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discriminator {
    Timestamp,
    GameLength,
}

impl Discriminator {
    pub fn as_str(self) -> &'static str {
        match self {
            Discriminator::Timestamp => "timestamp",
            Discriminator::GameLength => "game_length",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityKeyConfigError {
    #[error("unknown dedup discriminator {0:?} (expected timestamp or game_length)")]
    UnknownDiscriminator(String),
    #[error("dedup key must name at least one discriminator")]
    Empty,
}

impl FromStr for Discriminator {
    type Err = IdentityKeyConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "timestamp" => Ok(Discriminator::Timestamp),
            "game_length" | "length" => Ok(Discriminator::GameLength),
            other => Err(IdentityKeyConfigError::UnknownDiscriminator(other.to_string())),
        }
    }
}

/// Which discriminators join map, names and results in the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyConfig {
    discriminators: Vec<Discriminator>,
}

impl Default for IdentityKeyConfig {
    fn default() -> Self {
        Self::joint()
    }
}

impl IdentityKeyConfig {
    pub fn new(discriminators: Vec<Discriminator>) -> Result<Self, IdentityKeyConfigError> {
        if discriminators.is_empty() {
            return Err(IdentityKeyConfigError::Empty);
        }
        let mut unique = Vec::with_capacity(discriminators.len());
        for d in discriminators {
            if !unique.contains(&d) {
                unique.push(d);
            }
        }
        Ok(Self {
            discriminators: unique,
        })
    }

    /// Timestamp and game length together.
    pub fn joint() -> Self {
        Self {
            discriminators: vec![Discriminator::Timestamp, Discriminator::GameLength],
        }
    }

    pub fn timestamp_only() -> Self {
        Self {
            discriminators: vec![Discriminator::Timestamp],
        }
    }

    pub fn game_length_only() -> Self {
        Self {
            discriminators: vec![Discriminator::GameLength],
        }
    }

    pub fn uses(&self, discriminator: Discriminator) -> bool {
        self.discriminators.contains(&discriminator)
    }

    /// Renders as `timestamp+game_length`, the same form [`FromStr`] accepts.
    pub fn describe(&self) -> String {
        self.discriminators
            .iter()
            .map(|d| d.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }
}

impl FromStr for IdentityKeyConfig {
    type Err = IdentityKeyConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let discriminators = s
            .split(['+', ','])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Discriminator::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(discriminators)
    }
}

/// Fields that decide whether two observations describe the same game.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub map_name: String,
    pub names: [String; 2],
    pub results: [GameResult; 2],
    pub timestamp: Option<String>,
    pub game_length: Option<String>,
}

impl IdentityKey {
    fn build(
        config: &IdentityKeyConfig,
        participants: &[Participant; 2],
        map_name: &str,
        timestamp: &str,
        game_length: &str,
    ) -> Self {
        Self {
            map_name: map_name.to_string(),
            names: [participants[0].name.clone(), participants[1].name.clone()],
            results: [participants[0].result, participants[1].result],
            timestamp: config
                .uses(Discriminator::Timestamp)
                .then(|| timestamp.to_string()),
            game_length: config
                .uses(Discriminator::GameLength)
                .then(|| game_length.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(timestamp: &str, game_length: &str) -> MatchDraft {
        MatchDraft {
            participants: [
                Participant::new("AlphaBot", "A", "protoss", GameResult::Win),
                Participant::new("BetaBot", "B", "zerg", GameResult::Loss),
            ],
            map_name: "Destination".into(),
            game_length: game_length.into(),
            timestamp: timestamp.into(),
            date_scraped: "2024-01-01 12:00:00".into(),
            replay_link: None,
        }
    }

    #[test]
    fn game_result_parses_case_insensitively() {
        assert_eq!("win".parse::<GameResult>(), Ok(GameResult::Win));
        assert_eq!(" LOSS ".parse::<GameResult>(), Ok(GameResult::Loss));
        assert!("draw".parse::<GameResult>().is_err());
    }

    #[test]
    fn new_participant_has_unknown_rating() {
        let p = Participant::new("AlphaBot", "S", "", GameResult::Win);
        assert_eq!(p.rating, UNKNOWN_RATING);
        assert!(!p.has_rating());
    }

    #[test]
    fn joint_key_separates_games_differing_in_either_field() {
        let config = IdentityKeyConfig::joint();
        let base = draft("2024.01.01 10:00 AM", "12:34").identity_key(&config);
        assert_eq!(base, draft("2024.01.01 10:00 AM", "12:34").identity_key(&config));
        assert_ne!(base, draft("2024.01.01 10:01 AM", "12:34").identity_key(&config));
        assert_ne!(base, draft("2024.01.01 10:00 AM", "08:02").identity_key(&config));
    }

    #[test]
    fn single_discriminator_keys_ignore_the_other_field() {
        let by_time = IdentityKeyConfig::timestamp_only();
        assert_eq!(
            draft("2024.01.01 10:00 AM", "12:34").identity_key(&by_time),
            draft("2024.01.01 10:00 AM", "08:02").identity_key(&by_time)
        );

        let by_length = IdentityKeyConfig::game_length_only();
        assert_eq!(
            draft("2024.01.01 10:00 AM", "12:34").identity_key(&by_length),
            draft("2024.01.01 11:45 PM", "12:34").identity_key(&by_length)
        );
    }

    #[test]
    fn key_config_parses_composed_forms() {
        assert_eq!(
            "timestamp+game_length".parse::<IdentityKeyConfig>(),
            Ok(IdentityKeyConfig::joint())
        );
        assert_eq!(
            "game-length".parse::<IdentityKeyConfig>(),
            Ok(IdentityKeyConfig::game_length_only())
        );
        assert_eq!(
            "timestamp, timestamp".parse::<IdentityKeyConfig>(),
            Ok(IdentityKeyConfig::timestamp_only())
        );
        assert_eq!("".parse::<IdentityKeyConfig>(), Err(IdentityKeyConfigError::Empty));
        assert!(matches!(
            "duration".parse::<IdentityKeyConfig>(),
            Err(IdentityKeyConfigError::UnknownDiscriminator(_))
        ));
        assert_eq!(IdentityKeyConfig::joint().describe(), "timestamp+game_length");
    }

    #[test]
    fn artifact_names_follow_id_and_extension() {
        assert_eq!(artifact_file_name(5, "rep"), "5.rep");
        assert_eq!(artifact_file_name(5, ".rep"), "5.rep");
        assert_eq!(artifact_file_name(5, ""), "5.bin");

        let mut record = MatchRecord::from_draft(7, draft("t", "l"));
        assert_eq!(record.artifact_file_name("rep").as_deref(), Some("7.rep"));
        record.id = None;
        assert_eq!(record.artifact_file_name("rep"), None);
    }

    #[test]
    fn pending_download_requires_link_and_missing_artifact() {
        let mut record = MatchRecord::from_draft(1, draft("t", "l"));
        assert!(!record.is_pending_download());
        record.replay_link = Some("https://example.test/1.rep".into());
        assert!(record.is_pending_download());
        record.downloaded = true;
        assert!(!record.is_pending_download());
    }
}
