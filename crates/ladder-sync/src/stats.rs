use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::NaiveDateTime;
use ladder_core::{MatchRecord, UNKNOWN_RATING};
use serde::Serialize;

/// Format of the ladder's displayed game time.
pub const TIMESTAMP_FORMAT: &str = "%Y.%m.%d %I:%M %p";

const IGNORED_RACES: [&str; 3] = ["unknown", "n/a", ""];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingStats {
    pub average: f64,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub total_games: usize,
    pub downloaded: usize,
    pub pending_download: usize,
    pub missing_link: usize,
    pub top_maps: Vec<(String, usize)>,
    pub top_bots: Vec<(String, usize)>,
    pub races: Vec<(String, usize)>,
    pub ratings: Option<RatingStats>,
    pub unknown_ratings: usize,
    pub earliest: Option<NaiveDateTime>,
    pub latest: Option<NaiveDateTime>,
}

/// Count descending, then name ascending.
fn ranked(counts: HashMap<String, usize>, limit: Option<usize>) -> Vec<(String, usize)> {
    let mut ranked = counts.into_iter().collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }
    ranked
}

pub fn summarize(records: &[MatchRecord], top_n: usize) -> StoreStatistics {
    let mut maps: HashMap<String, usize> = HashMap::new();
    let mut bots: HashMap<String, usize> = HashMap::new();
    let mut races: HashMap<String, usize> = HashMap::new();
    let mut rated = Vec::new();
    let mut unknown_ratings = 0;
    let mut times = Vec::new();

    for record in records {
        if !record.map_name.is_empty() {
            *maps.entry(record.map_name.clone()).or_default() += 1;
        }
        for p in &record.participants {
            if !p.name.is_empty() {
                *bots.entry(p.name.clone()).or_default() += 1;
            }
            let race = p.race.trim().to_lowercase();
            if !IGNORED_RACES.contains(&race.as_str()) {
                *races.entry(race).or_default() += 1;
            }
            if p.rating == UNKNOWN_RATING {
                unknown_ratings += 1;
            } else {
                rated.push(p.rating);
            }
        }
        if let Ok(ts) = NaiveDateTime::parse_from_str(record.timestamp.trim(), TIMESTAMP_FORMAT) {
            times.push(ts);
        }
    }

    let ratings = match (rated.iter().min(), rated.iter().max()) {
        (Some(&min), Some(&max)) => Some(RatingStats {
            average: rated.iter().sum::<i64>() as f64 / rated.len() as f64,
            min,
            max,
        }),
        _ => None,
    };

    StoreStatistics {
        total_games: records.len(),
        downloaded: records.iter().filter(|r| r.downloaded).count(),
        pending_download: records.iter().filter(|r| r.is_pending_download()).count(),
        missing_link: records.iter().filter(|r| r.replay_link.is_none()).count(),
        top_maps: ranked(maps, Some(top_n)),
        top_bots: ranked(bots, Some(top_n)),
        races: ranked(races, None),
        ratings,
        unknown_ratings,
        earliest: times.iter().min().copied(),
        latest: times.iter().max().copied(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl StoreStatistics {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Database Statistics ===");
        let _ = writeln!(out, "Total Games Recorded: {}", self.total_games);
        if self.total_games == 0 {
            return out;
        }

        let _ = writeln!(out, "\n--- Replay Status ---");
        let _ = writeln!(out, "  Replays Downloaded: {}", self.downloaded);
        let _ = writeln!(out, "  Replays Pending Download: {}", self.pending_download);
        if self.missing_link > 0 {
            let _ = writeln!(out, "  Games Missing Replay Link: {}", self.missing_link);
        }

        let _ = writeln!(out, "\n--- Map Popularity (Top {}) ---", self.top_maps.len());
        if self.top_maps.is_empty() {
            let _ = writeln!(out, "  No map data available.");
        }
        for (i, (name, count)) in self.top_maps.iter().enumerate() {
            let _ = writeln!(out, "  {}. {name}: {count} games", i + 1);
        }

        let _ = writeln!(out, "\n--- Most Frequent Bots (Top {}) ---", self.top_bots.len());
        if self.top_bots.is_empty() {
            let _ = writeln!(out, "  No bot data available.");
        }
        for (i, (name, count)) in self.top_bots.iter().enumerate() {
            let _ = writeln!(out, "  {}. {name}: {count} games", i + 1);
        }

        let _ = writeln!(out, "\n--- Race Distribution ---");
        if self.races.is_empty() {
            let _ = writeln!(out, "  No valid race data available.");
        }
        for (race, count) in &self.races {
            let _ = writeln!(out, "  {}: {count} games", capitalize(race));
        }

        let _ = writeln!(out, "\n--- Bot Ratings ---");
        match &self.ratings {
            Some(r) => {
                let _ = writeln!(out, "  Average Rating: {:.0}", r.average);
                let _ = writeln!(out, "  Min Rating:     {}", r.min);
                let _ = writeln!(out, "  Max Rating:     {}", r.max);
            }
            None => {
                let _ = writeln!(out, "  No valid numeric rating data found for statistics.");
            }
        }
        let _ = writeln!(out, "  (Entries without rating: {})", self.unknown_ratings);

        let _ = writeln!(out, "\n--- Game Timeframe ---");
        match (self.earliest, self.latest) {
            (Some(first), Some(last)) => {
                let _ = writeln!(out, "  Earliest Game Timestamp: {}", first.format("%Y-%m-%d %H:%M:%S"));
                let _ = writeln!(out, "  Latest Game Timestamp:   {}", last.format("%Y-%m-%d %H:%M:%S"));
            }
            _ => {
                let _ = writeln!(out, "  Could not determine timeframe (no valid timestamps found).");
            }
        }
        out
    }
}
