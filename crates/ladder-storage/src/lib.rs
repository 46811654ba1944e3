//! Match record persistence, replay artifact storage and HTTP fetch utilities.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ladder_core::{artifact_file_name, GameResult, MatchRecord, Participant, UNKNOWN_RATING};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ladder-storage";

/// Column order of the persisted store. Every write emits all of them in this order.
pub const STORE_COLUMNS: [&str; 17] = [
    "game_id",
    "bot1_name",
    "bot1_rank",
    "bot1_rating",
    "bot1_race",
    "bot1_result",
    "bot2_name",
    "bot2_rank",
    "bot2_rating",
    "bot2_race",
    "bot2_result",
    "map_name",
    "game_length",
    "timestamp",
    "date_scraped",
    "replay_link",
    "downloaded",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed store {} at record {record}", .path.display())]
    Malformed {
        path: PathBuf,
        record: usize,
        #[source]
        source: csv::Error,
    },
    #[error("encoding store rows")]
    Encode(#[from] csv::Error),
    #[error("flushing encoded store: {0}")]
    Flush(String),
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Flat on-disk row. Every cell is read as text so damaged cells degrade instead of failing the load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct StoreRow {
    game_id: String,
    bot1_name: String,
    bot1_rank: String,
    bot1_rating: String,
    bot1_race: String,
    bot1_result: String,
    bot2_name: String,
    bot2_rank: String,
    bot2_rating: String,
    bot2_race: String,
    bot2_result: String,
    map_name: String,
    game_length: String,
    timestamp: String,
    date_scraped: String,
    replay_link: String,
    downloaded: String,
}

impl StoreRow {
    fn from_record(record: &MatchRecord) -> Self {
        let [p1, p2] = &record.participants;
        Self {
            game_id: record.id.map(|id| id.to_string()).unwrap_or_default(),
            bot1_name: p1.name.clone(),
            bot1_rank: p1.rank.clone(),
            bot1_rating: p1.rating.to_string(),
            bot1_race: p1.race.clone(),
            bot1_result: p1.result.to_string(),
            bot2_name: p2.name.clone(),
            bot2_rank: p2.rank.clone(),
            bot2_rating: p2.rating.to_string(),
            bot2_race: p2.race.clone(),
            bot2_result: p2.result.to_string(),
            map_name: record.map_name.clone(),
            game_length: record.game_length.clone(),
            timestamp: record.timestamp.clone(),
            date_scraped: record.date_scraped.clone(),
            replay_link: record.replay_link.clone().unwrap_or_default(),
            downloaded: record.downloaded.to_string(),
        }
    }

    fn into_record(self, line: usize) -> MatchRecord {
        let id = parse_id(&self.game_id);
        if id.is_none() {
            warn!(line, game_id = %self.game_id, "store row has no usable id; keeping it unmatched");
        }
        let p1 = Participant {
            rating: parse_rating(&self.bot1_rating, line),
            result: parse_result(&self.bot1_result, GameResult::Win, line),
            name: self.bot1_name,
            rank: self.bot1_rank,
            race: self.bot1_race,
        };
        let p2 = Participant {
            rating: parse_rating(&self.bot2_rating, line),
            result: parse_result(&self.bot2_result, GameResult::Loss, line),
            name: self.bot2_name,
            rank: self.bot2_rank,
            race: self.bot2_race,
        };
        MatchRecord {
            id,
            participants: [p1, p2],
            map_name: self.map_name,
            game_length: self.game_length,
            timestamp: self.timestamp,
            date_scraped: self.date_scraped,
            replay_link: non_empty(self.replay_link),
            downloaded: parse_flag(&self.downloaded),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Accepts `7` and the `7.0` form spreadsheet tools sometimes write back.
fn parse_integral(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return Some(v);
    }
    let v = trimmed.parse::<f64>().ok()?;
    if v.is_finite() && v.fract() == 0.0 {
        Some(v as i64)
    } else {
        None
    }
}

fn parse_id(text: &str) -> Option<u64> {
    parse_integral(text)
        .filter(|v| *v > 0)
        .map(|v| v as u64)
}

fn parse_rating(text: &str, line: usize) -> i64 {
    if text.trim().is_empty() {
        return UNKNOWN_RATING;
    }
    parse_integral(text).unwrap_or_else(|| {
        warn!(line, rating = text, "unparseable rating; treating as unknown");
        UNKNOWN_RATING
    })
}

fn parse_result(text: &str, fallback: GameResult, line: usize) -> GameResult {
    text.parse().unwrap_or_else(|err| {
        warn!(line, %err, %fallback, "unparseable result; using side default");
        fallback
    })
}

fn parse_flag(text: &str) -> bool {
    matches!(text.trim(), "1" | "true" | "TRUE" | "True")
}

/// Authoritative CSV file of match records.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every persisted record. A missing file is a first run: an empty
    /// store with the full header is created and an empty collection returned.
    pub async fn load(&self) -> Result<Vec<MatchRecord>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no existing store; creating an empty one");
                // first run; later persists report the same failure
                if let Err(err) = self.persist(&[]).await {
                    let err = anyhow::Error::from(err);
                    warn!(error = %format!("{err:#}"), "could not create empty store");
                }
                return Ok(Vec::new());
            }
            Err(err) => return Err(StoreError::io("reading store", &self.path, err)),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(bytes.as_slice());

        let mut records = Vec::new();
        for (idx, row) in reader.deserialize::<StoreRow>().enumerate() {
            let row = row.map_err(|source| StoreError::Malformed {
                path: self.path.clone(),
                record: idx + 1,
                source,
            })?;
            // header is line 1
            records.push(row.into_record(idx + 2));
        }
        info!(path = %self.path.display(), records = records.len(), "loaded match store");
        Ok(records)
    }

    /// Rewrite the whole store, ascending by id, through a temp file and rename.
    pub async fn persist(&self, records: &[MatchRecord]) -> Result<(), StoreError> {
        let mut ordered: Vec<&MatchRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.id);
        let encoded = encode_rows(&ordered)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::io("creating store directory", parent, err))?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let temp_path = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        if let Err(err) = fs::write(&temp_path, &encoded).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("writing temp store", &temp_path, err));
        }
        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("replacing store", &self.path, err));
        }
        info!(path = %self.path.display(), records = ordered.len(), "persisted match store");
        Ok(())
    }
}

fn encode_rows(records: &[&MatchRecord]) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(STORE_COLUMNS)?;
    for record in records {
        writer.serialize(StoreRow::from_record(record))?;
    }
    writer
        .into_inner()
        .map_err(|err| StoreError::Flush(err.to_string()))
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: u64,
}

/// Directory of replay files named `<id>.<ext>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    extension: String,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn file_name_for(&self, id: u64) -> String {
        artifact_file_name(id, &self.extension)
    }

    pub fn path_for(&self, id: u64) -> PathBuf {
        self.root.join(self.file_name_for(id))
    }

    /// Names of the regular files in the artifact directory. A missing directory lists as empty.
    pub async fn list(&self) -> anyhow::Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(names),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("listing artifact directory {}", self.root.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading artifact directory {}", self.root.display()))?
        {
            let is_file = entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // in-flight temp files
            if name.starts_with('.') {
                continue;
            }
            names.insert(name);
        }
        Ok(names)
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        let existed = fs::try_exists(&self.root).await.unwrap_or(false);
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating artifact directory {}", self.root.display()))?;
        if !existed {
            info!(dir = %self.root.display(), "created artifact directory");
        }
        Ok(())
    }

    /// Open a streaming writer for the artifact of record `id`.
    pub async fn begin_write(&self, id: u64) -> anyhow::Result<ArtifactWriter> {
        let file_name = self.file_name_for(id);
        let final_path = self.root.join(&file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), file_name));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        Ok(ArtifactWriter {
            file,
            temp_path,
            final_path,
            file_name,
            hasher: Sha256::new(),
            byte_size: 0,
        })
    }

    pub async fn store_bytes(&self, id: u64, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let mut writer = self.begin_write(id).await?;
        if let Err(err) = writer.write_chunk(bytes).await {
            writer.abort().await;
            return Err(err);
        }
        writer.commit().await
    }
}

/// Temp-file writer that only becomes visible under its final name on [`ArtifactWriter::commit`].
pub struct ArtifactWriter {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    file_name: String,
    hasher: Sha256,
    byte_size: u64,
}

impl ArtifactWriter {
    pub fn bytes_written(&self) -> u64 {
        self.byte_size
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.file
            .write_all(chunk)
            .await
            .with_context(|| format!("writing temp artifact file {}", self.temp_path.display()))?;
        self.hasher.update(chunk);
        self.byte_size += chunk.len() as u64;
        Ok(())
    }

    pub async fn commit(mut self) -> anyhow::Result<StoredArtifact> {
        if let Err(err) = self.file.flush().await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err)
                .with_context(|| format!("flushing temp artifact file {}", self.temp_path.display()));
        }
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.final_path).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp artifact {} -> {}",
                    self.temp_path.display(),
                    self.final_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            file_name: self.file_name,
            absolute_path: self.final_path,
            content_hash: hex::encode(self.hasher.finalize()),
            byte_size: self.byte_size,
        })
    }

    pub async fn abort(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Honor `HTTP_PROXY`/`HTTPS_PROXY` from the environment.
    pub system_proxy: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            system_proxy: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential HTTP client with capped exponential backoff on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if !config.system_proxy {
            builder = builder.no_proxy();
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Send a GET and return the successful response with its body still unread.
    pub async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.get(url).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: Option<u64>, map: &str) -> MatchRecord {
        MatchRecord {
            id,
            participants: [
                Participant {
                    name: "AlphaBot".into(),
                    rank: "A".into(),
                    rating: 2100,
                    race: "protoss".into(),
                    result: GameResult::Win,
                },
                Participant::new("Beta, the \"Bot\"", "C", "", GameResult::Loss),
            ],
            map_name: map.into(),
            game_length: "12:34".into(),
            timestamp: "2024.01.01 10:00 AM".into(),
            date_scraped: "2024-01-01 12:00:00".into(),
            replay_link: id.map(|i| format!("https://example.test/{i}.rep")),
            downloaded: id == Some(1),
        }
    }

    #[tokio::test]
    async fn missing_store_is_created_with_full_header() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("games.csv"));

        let records = store.load().await.expect("load");
        assert!(records.is_empty());

        let text = std::fs::read_to_string(store.path()).expect("store created");
        assert_eq!(text.trim_end(), STORE_COLUMNS.join(","));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unwritable_first_run_store_still_loads_empty() {
        let dir = tempdir().expect("tempdir");
        // parent is a dangling symlink: reads see NotFound, directory creation fails
        let parent = dir.path().join("data");
        std::os::unix::fs::symlink(dir.path().join("nowhere"), &parent).expect("symlink");
        let store = RecordStore::new(parent.join("games.csv"));

        let records = store.load().await.expect("missing store is a first run");
        assert!(records.is_empty());
        assert!(!store.path().exists());

        let err = store.persist(&[]).await.expect_err("store directory cannot be created");
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(chain.matches("os error").count(), 1, "{chain}");
    }

    #[tokio::test]
    async fn persist_orders_by_id_and_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("nested").join("games.csv"));
        let records = vec![record(Some(3), "Eclipse"), record(Some(1), "Destination")];

        store.persist(&records).await.expect("persist");
        store.persist(&records).await.expect("persist is repeatable");
        let loaded = store.load().await.expect("load");

        assert_eq!(loaded, vec![records[1].clone(), records[0].clone()]);
        let leftovers = std::fs::read_dir(store.path().parent().expect("parent"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn damaged_cells_fall_back_to_safe_values() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("games.csv");
        let text = format!(
            "{}\n\
             2.0,AlphaBot,A,2100.0,protoss,Win,BetaBot,B,,zerg,Loss,Destination,12:34,2024.01.01 10:00 AM,2024-01-01 12:00:00,,True\n\
             oops,GammaBot,C,n/a,,???,DeltaBot,D,-1,,Loss,Eclipse,08:00,2024.01.01 11:00 AM,2024-01-01 12:00:00,https://example.test/x.rep,maybe\n",
            STORE_COLUMNS.join(",")
        );
        std::fs::write(&path, text).expect("seed store");

        let loaded = RecordStore::new(&path).load().await.expect("load");
        assert_eq!(loaded.len(), 2);

        assert_eq!(loaded[0].id, Some(2));
        assert_eq!(loaded[0].participants[0].rating, 2100);
        assert_eq!(loaded[0].participants[1].rating, UNKNOWN_RATING);
        assert_eq!(loaded[0].replay_link, None);
        assert!(loaded[0].downloaded);

        assert_eq!(loaded[1].id, None);
        assert_eq!(loaded[1].participants[0].rating, UNKNOWN_RATING);
        assert_eq!(loaded[1].participants[0].result, GameResult::Win);
        assert!(!loaded[1].downloaded);
    }

    #[tokio::test]
    async fn unidentified_rows_survive_persistence() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("games.csv"));
        let records = vec![record(Some(4), "Eclipse"), record(None, "Polypoid")];

        store.persist(&records).await.expect("persist");
        let loaded = store.load().await.expect("load");

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, None);
        assert_eq!(loaded[0].map_name, "Polypoid");
        assert_eq!(loaded[1].id, Some(4));
    }

    #[tokio::test]
    async fn missing_artifact_directory_lists_empty() {
        let dir = tempdir().expect("tempdir");
        let artifacts = ArtifactStore::new(dir.path().join("replays"), "rep");
        assert!(artifacts.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn committed_artifacts_are_listed_and_aborted_ones_vanish() {
        let dir = tempdir().expect("tempdir");
        let artifacts = ArtifactStore::new(dir.path().join("replays"), "rep");
        artifacts.ensure_root().await.expect("root");

        let stored = artifacts.store_bytes(5, b"replay bytes").await.expect("store");
        assert_eq!(stored.file_name, "5.rep");
        assert_eq!(stored.byte_size, 12);
        assert_eq!(stored.content_hash, hex::encode(Sha256::digest(b"replay bytes")));
        assert_eq!(
            std::fs::read(artifacts.path_for(5)).expect("read back"),
            b"replay bytes"
        );

        let mut pending = artifacts.begin_write(6).await.expect("begin");
        pending.write_chunk(b"partial").await.expect("chunk");
        assert_eq!(pending.bytes_written(), 7);
        pending.abort().await;

        let listing = artifacts.list().await.expect("list");
        assert_eq!(listing.into_iter().collect::<Vec<_>>(), vec!["5.rep".to_string()]);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
