//! Collaborator contracts for the ladder harvester: games-table scraping,
//! ratings lookup and replay download.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use ladder_core::{GameResult, MatchDraft, Participant};
use ladder_storage::{ArtifactStore, FetchError, HttpFetcher, StoredArtifact};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ladder-adapters";

/// Format of the `date_scraped` column.
pub const SCRAPE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Rows with fewer cells than this cannot carry both bots, map, time and length.
pub const MIN_GAME_CELLS: usize = 5;

pub type RatingsLookup = HashMap<String, i64>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub scraped_at: NaiveDateTime,
}

impl AdapterContext {
    pub fn now(run_id: Uuid) -> Self {
        Self {
            run_id,
            scraped_at: Local::now().naive_local(),
        }
    }

    pub fn scrape_date(&self) -> String {
        self.scraped_at.format(SCRAPE_DATE_FORMAT).to_string()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces candidate games, in page order, without ids.
#[async_trait]
pub trait MatchSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn scrape(&self, ctx: &AdapterContext) -> Result<Vec<MatchDraft>, AdapterError>;
}

/// Bot name to rating.
#[async_trait]
pub trait RatingsSource: Send + Sync {
    async fn fetch_ratings(&self, ctx: &AdapterContext) -> Result<RatingsLookup, AdapterError>;
}

/// Streams the replay at `url` into the artifact named after record `id`.
#[async_trait]
pub trait ArtifactDownloader: Send + Sync {
    async fn download(
        &self,
        ctx: &AdapterContext,
        id: u64,
        url: &str,
    ) -> Result<StoredArtifact, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GamesTableOptions {
    /// Leading rows of the table that are headings or filters, not games.
    pub skip_rows: usize,
    /// Stop after this many games (test mode).
    pub max_games: Option<usize>,
}

impl Default for GamesTableOptions {
    fn default() -> Self {
        Self {
            skip_rows: 2,
            max_games: None,
        }
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("bad selector {css}: {e}")))
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Bot cells read `<rank> <name>`; the name may itself contain spaces.
fn split_rank_and_name(text: &str) -> Option<(String, String)> {
    let (rank, name) = text.trim().split_once(char::is_whitespace)?;
    let name = name.trim();
    if rank.is_empty() || name.is_empty() {
        return None;
    }
    Some((rank.to_string(), name.to_string()))
}

/// Race comes from the cell's second class, e.g. `bot race_protoss`.
fn race_from_class(cell: &ElementRef<'_>) -> String {
    cell.value()
        .attr("class")
        .and_then(|classes| classes.split_whitespace().nth(1))
        .map(|class| {
            class
                .strip_prefix("race_")
                .or_else(|| class.strip_prefix("race-"))
                .unwrap_or(class)
                .to_string()
        })
        .unwrap_or_default()
}

fn replay_link(row: &ElementRef<'_>, links: &Selector, base: Option<&Url>) -> Option<String> {
    row.select(links)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| href.contains(".rep"))
        .map(|href| match base.and_then(|b| b.join(href).ok()) {
            Some(resolved) => resolved.to_string(),
            None => href.to_string(),
        })
}

/// Parse the `#gamesTable` of a rendered ladder page into candidate games.
///
/// The first bot cell is the winner. Rows that are too short or whose bot
/// cells lack a rank/name pair are dropped here so they never reach the merge.
pub fn parse_games_table(
    html: &str,
    scrape_date: &str,
    base: Option<&Url>,
    options: &GamesTableOptions,
) -> Result<Vec<MatchDraft>, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = selector("#gamesTable")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a[href]")?;

    let table = document
        .select(&table_sel)
        .next()
        .ok_or_else(|| AdapterError::Message("games table #gamesTable not found".to_string()))?;

    let rows = table.select(&row_sel).collect::<Vec<_>>();
    let total_rows = rows.len();
    debug!(total_rows, "found game rows");

    let mut drafts = Vec::new();
    for (row_idx, row) in rows.into_iter().enumerate().skip(options.skip_rows) {
        if options.max_games.is_some_and(|max| drafts.len() >= max) {
            break;
        }

        let cells = row.select(&cell_sel).collect::<Vec<_>>();
        if cells.len() < MIN_GAME_CELLS {
            continue;
        }

        let (Some((winner_rank, winner_name)), Some((loser_rank, loser_name))) = (
            split_rank_and_name(&cell_text(&cells[0])),
            split_rank_and_name(&cell_text(&cells[1])),
        ) else {
            warn!(row = row_idx, "skipping game row without rank and name");
            continue;
        };

        drafts.push(MatchDraft {
            participants: [
                Participant::new(winner_name, winner_rank, race_from_class(&cells[0]), GameResult::Win),
                Participant::new(loser_name, loser_rank, race_from_class(&cells[1]), GameResult::Loss),
            ],
            map_name: cell_text(&cells[2]),
            timestamp: cell_text(&cells[3]),
            game_length: cell_text(&cells[4]),
            date_scraped: scrape_date.to_string(),
            replay_link: replay_link(&row, &link_sel, base),
        });

        if (row_idx + 1) % 10 == 0 {
            debug!(row = row_idx + 1, total_rows, "parsing game rows");
        }
    }

    Ok(drafts)
}

#[derive(Debug, Deserialize)]
struct RankingEntry {
    #[serde(rename = "botName")]
    bot_name: Option<String>,
    rating: Option<f64>,
}

/// Parse the ranking feed: a JSON array of `{ "botName": .., "rating": .. }`.
/// Entries lacking either field are skipped with a warning.
pub fn parse_ratings_json(bytes: &[u8]) -> Result<RatingsLookup, AdapterError> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    let entries = value
        .as_array()
        .ok_or_else(|| AdapterError::Message("ranking feed is not a JSON array".to_string()))?;

    let mut lookup = RatingsLookup::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<RankingEntry>(entry.clone()) {
            Ok(RankingEntry {
                bot_name: Some(name),
                rating: Some(rating),
            }) if rating.is_finite() => {
                lookup.insert(name, rating.round() as i64);
            }
            _ => warn!(%entry, "ranking entry missing botName or rating"),
        }
    }
    Ok(lookup)
}

/// Live games page fetched over HTTP.
#[derive(Debug, Clone)]
pub struct HtmlTableMatchSource {
    http: HttpFetcher,
    url: String,
    options: GamesTableOptions,
}

impl HtmlTableMatchSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>, options: GamesTableOptions) -> Self {
        Self {
            http,
            url: url.into(),
            options,
        }
    }
}

#[async_trait]
impl MatchSource for HtmlTableMatchSource {
    fn source_id(&self) -> &'static str {
        "basil-ladder"
    }

    async fn scrape(&self, ctx: &AdapterContext) -> Result<Vec<MatchDraft>, AdapterError> {
        info!(url = %self.url, "fetching latest ladder games");
        let page = self.http.fetch_bytes(ctx.run_id, &self.url).await?;
        let base = Url::parse(&page.final_url).ok();
        let html = String::from_utf8_lossy(&page.body);
        let drafts = parse_games_table(&html, &ctx.scrape_date(), base.as_ref(), &self.options)?;
        info!(games = drafts.len(), "extracted ladder games");
        Ok(drafts)
    }
}

/// Saved snapshot of a rendered games page.
#[derive(Debug, Clone)]
pub struct FixtureMatchSource {
    path: PathBuf,
    base: Option<Url>,
    options: GamesTableOptions,
}

impl FixtureMatchSource {
    pub fn new(path: impl Into<PathBuf>, base: Option<Url>, options: GamesTableOptions) -> Self {
        Self {
            path: path.into(),
            base,
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MatchSource for FixtureMatchSource {
    fn source_id(&self) -> &'static str {
        "basil-ladder-fixture"
    }

    async fn scrape(&self, ctx: &AdapterContext) -> Result<Vec<MatchDraft>, AdapterError> {
        let html = fs::read_to_string(&self.path)
            .with_context(|| format!("reading games snapshot {}", self.path.display()))?;
        let drafts = parse_games_table(&html, &ctx.scrape_date(), self.base.as_ref(), &self.options)?;
        info!(games = drafts.len(), path = %self.path.display(), "extracted ladder games from snapshot");
        Ok(drafts)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRatingsSource {
    http: HttpFetcher,
    url: String,
}

impl HttpRatingsSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RatingsSource for HttpRatingsSource {
    async fn fetch_ratings(&self, ctx: &AdapterContext) -> Result<RatingsLookup, AdapterError> {
        info!(url = %self.url, "fetching master rating list");
        let resp = self.http.fetch_bytes(ctx.run_id, &self.url).await?;
        let lookup = parse_ratings_json(&resp.body)?;
        info!(bots = lookup.len(), "loaded bot ratings");
        Ok(lookup)
    }
}

#[derive(Debug, Clone)]
pub struct HttpArtifactDownloader {
    http: HttpFetcher,
    artifacts: ArtifactStore,
}

impl HttpArtifactDownloader {
    pub fn new(http: HttpFetcher, artifacts: ArtifactStore) -> Self {
        Self { http, artifacts }
    }
}

#[async_trait]
impl ArtifactDownloader for HttpArtifactDownloader {
    async fn download(
        &self,
        ctx: &AdapterContext,
        id: u64,
        url: &str,
    ) -> Result<StoredArtifact, AdapterError> {
        let mut resp = self.http.get(url).await?;
        let expected = resp.content_length();
        let mut writer = self.artifacts.begin_write(id).await?;

        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(err) = writer.write_chunk(&chunk).await {
                        writer.abort().await;
                        return Err(err.into());
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    writer.abort().await;
                    return Err(FetchError::Request(err).into());
                }
            }
        }

        if let Some(expected) = expected.filter(|len| *len != writer.bytes_written()) {
            let got = writer.bytes_written();
            writer.abort().await;
            return Err(AdapterError::Message(format!(
                "truncated replay for game {id}: expected {expected} bytes, got {got}"
            )));
        }

        let stored = writer.commit().await?;
        debug!(
            run_id = %ctx.run_id,
            id,
            bytes = stored.byte_size,
            sha256 = %stored.content_hash,
            "stored replay"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <table id="gamesTable">
          <tr><th>Winner</th><th>Loser</th><th>Map</th><th>Time</th><th>Length</th></tr>
          <tr><td><input placeholder="filter"></td><td></td><td></td><td></td><td></td></tr>
          <tr>
            <td class="bot race_protoss">A AlphaBot</td>
            <td class="bot race_zerg">B Beta Bot</td>
            <td>Destination</td>
            <td>2024.01.01 10:00 AM</td>
            <td>12:34</td>
            <td><a href="/bots/AlphaBot">profile</a><a href="/replays/1234.rep">replay</a></td>
          </tr>
          <tr>
            <td class="bot">S GammaBot</td>
            <td class="bot race_terran">F DeltaBot</td>
            <td>Eclipse</td>
            <td>2024.01.01 10:05 AM</td>
            <td>03:10</td>
          </tr>
          <tr><td>Solo</td><td>F DeltaBot</td><td>Eclipse</td><td>x</td><td>y</td></tr>
          <tr><td>A AlphaBot</td><td>B Beta Bot</td><td>Eclipse</td></tr>
        </table>
        </body></html>
    "#;

    fn parse(options: &GamesTableOptions) -> Vec<MatchDraft> {
        let base = Url::parse("https://ladder.example/").unwrap();
        parse_games_table(PAGE, "2024-01-01 12:00:00", Some(&base), options).unwrap()
    }

    #[test]
    fn game_rows_become_candidates_winner_first() {
        let drafts = parse(&GamesTableOptions::default());
        assert_eq!(drafts.len(), 2);

        let first = &drafts[0];
        assert_eq!(first.participants[0].name, "AlphaBot");
        assert_eq!(first.participants[0].rank, "A");
        assert_eq!(first.participants[0].race, "protoss");
        assert_eq!(first.participants[0].result, GameResult::Win);
        assert_eq!(first.participants[1].name, "Beta Bot");
        assert_eq!(first.participants[1].result, GameResult::Loss);
        assert_eq!(first.map_name, "Destination");
        assert_eq!(first.timestamp, "2024.01.01 10:00 AM");
        assert_eq!(first.game_length, "12:34");
        assert_eq!(first.date_scraped, "2024-01-01 12:00:00");
        assert_eq!(
            first.replay_link.as_deref(),
            Some("https://ladder.example/replays/1234.rep")
        );

        let second = &drafts[1];
        assert_eq!(second.participants[0].race, "");
        assert_eq!(second.participants[1].race, "terran");
        assert_eq!(second.replay_link, None);
    }

    #[test]
    fn max_games_limits_the_batch() {
        let drafts = parse(&GamesTableOptions {
            max_games: Some(1),
            ..GamesTableOptions::default()
        });
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].map_name, "Destination");
    }

    #[test]
    fn missing_table_is_a_scrape_error() {
        let err = parse_games_table(
            "<html><body><p>maintenance</p></body></html>",
            "2024-01-01 12:00:00",
            None,
            &GamesTableOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("gamesTable"));
    }

    #[test]
    fn ratings_skip_incomplete_entries() {
        let body = br#"[
            {"botName": "AlphaBot", "rating": 2100},
            {"botName": "BetaBot", "rating": 1875.6},
            {"botName": "NoRating"},
            {"rating": 1500},
            "garbage"
        ]"#;
        let lookup = parse_ratings_json(body).unwrap();
        assert_eq!(lookup.len(), 2);
        assert_eq!(lookup.get("AlphaBot"), Some(&2100));
        assert_eq!(lookup.get("BetaBot"), Some(&1876));
    }

    #[test]
    fn ratings_feed_must_be_an_array() {
        assert!(parse_ratings_json(br#"{"botName": "AlphaBot"}"#).is_err());
        assert!(parse_ratings_json(b"not json").is_err());
    }

    #[test]
    fn scrape_date_uses_fixed_format() {
        let ctx = AdapterContext {
            run_id: Uuid::nil(),
            scraped_at: NaiveDateTime::parse_from_str("2024-03-05 07:08:09", SCRAPE_DATE_FORMAT)
                .unwrap(),
        };
        assert_eq!(ctx.scrape_date(), "2024-03-05 07:08:09");
    }

    #[tokio::test]
    async fn fixture_source_reads_snapshot_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.html");
        std::fs::write(&path, PAGE).unwrap();

        let source = FixtureMatchSource::new(&path, None, GamesTableOptions::default());
        let ctx = AdapterContext::now(Uuid::new_v4());
        let drafts = source.scrape(&ctx).await.unwrap();

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].replay_link.as_deref(), Some("/replays/1234.rep"));
        assert_eq!(source.path(), path.as_path());
    }

    #[tokio::test]
    async fn fixture_source_reports_missing_snapshot() {
        let source = FixtureMatchSource::new("/nonexistent/games.html", None, GamesTableOptions::default());
        let ctx = AdapterContext::now(Uuid::new_v4());
        assert!(matches!(
            source.scrape(&ctx).await,
            Err(AdapterError::Anyhow(_))
        ));
    }
}
