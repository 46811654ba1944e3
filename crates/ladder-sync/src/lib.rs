//! Ingestion cycle orchestration: dedup and id assignment, artifact
//! reconciliation, replay download and persistence.

pub mod stats;

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ladder_adapters::{
    AdapterContext, ArtifactDownloader, FixtureMatchSource, GamesTableOptions,
    HtmlTableMatchSource, HttpArtifactDownloader, HttpRatingsSource, MatchSource, RatingsLookup,
    RatingsSource,
};
use ladder_core::{IdentityKey, IdentityKeyConfig, MatchDraft, MatchRecord, UNKNOWN_RATING};
use ladder_storage::{ArtifactStore, BackoffPolicy, HttpClientConfig, HttpFetcher, RecordStore};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ladder-sync";

pub const DEFAULT_GAMES_URL: &str = "https://basil.bytekeeper.org/";
pub const DEFAULT_RATINGS_URL: &str = "https://data.basil-ladder.net/stats/ranking.json";

#[derive(Debug, Clone, PartialEq)]
pub struct LadderConfig {
    pub store_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub artifact_ext: String,
    pub games_url: String,
    /// Parse this saved page instead of fetching `games_url`.
    pub games_snapshot: Option<PathBuf>,
    pub ratings_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_games: Option<usize>,
    pub identity_key: IdentityKeyConfig,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("basil_ladder_games.csv"),
            artifacts_dir: PathBuf::from("replays"),
            artifact_ext: "rep".to_string(),
            games_url: DEFAULT_GAMES_URL.to_string(),
            games_snapshot: None,
            ratings_url: DEFAULT_RATINGS_URL.to_string(),
            user_agent: "basil-ladder-harvester/0.1".to_string(),
            http_timeout_secs: 15,
            max_games: None,
            identity_key: IdentityKeyConfig::joint(),
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
        }
    }
}

/// YAML overlay; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LadderConfigFile {
    pub store_path: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub artifact_ext: Option<String>,
    pub games_url: Option<String>,
    pub games_snapshot: Option<PathBuf>,
    pub ratings_url: Option<String>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub max_games: Option<usize>,
    pub dedup_key: Option<String>,
    pub scheduler_enabled: Option<bool>,
    pub sync_cron: Option<String>,
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "1" | "true" | "TRUE" | "True")
}

impl LadderConfig {
    /// Defaults, then the optional YAML file, then `LADDER_*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = config_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: LadderConfigFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.apply_file(file)?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: LadderConfigFile) -> Result<()> {
        if let Some(v) = file.store_path {
            self.store_path = v;
        }
        if let Some(v) = file.artifacts_dir {
            self.artifacts_dir = v;
        }
        if let Some(v) = file.artifact_ext {
            self.artifact_ext = v;
        }
        if let Some(v) = file.games_url {
            self.games_url = v;
        }
        if let Some(v) = file.games_snapshot {
            self.games_snapshot = Some(v);
        }
        if let Some(v) = file.ratings_url {
            self.ratings_url = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.max_games {
            self.max_games = Some(v);
        }
        if let Some(v) = file.dedup_key {
            self.identity_key = v
                .parse()
                .with_context(|| format!("parsing dedup_key {v:?}"))?;
        }
        if let Some(v) = file.scheduler_enabled {
            self.scheduler_enabled = v;
        }
        if let Some(v) = file.sync_cron {
            self.sync_cron = v;
        }
        Ok(())
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("LADDER_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = var("LADDER_ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(v);
        }
        if let Some(v) = var("LADDER_ARTIFACT_EXT") {
            self.artifact_ext = v;
        }
        if let Some(v) = var("LADDER_GAMES_URL") {
            self.games_url = v;
        }
        if let Some(v) = var("LADDER_GAMES_SNAPSHOT") {
            self.games_snapshot = Some(PathBuf::from(v));
        }
        if let Some(v) = var("LADDER_RATINGS_URL") {
            self.ratings_url = v;
        }
        if let Some(v) = var("LADDER_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = var("LADDER_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v
                .parse()
                .with_context(|| format!("parsing LADDER_HTTP_TIMEOUT_SECS={v:?}"))?;
        }
        if let Some(v) = var("LADDER_MAX_GAMES") {
            self.max_games = Some(
                v.parse()
                    .with_context(|| format!("parsing LADDER_MAX_GAMES={v:?}"))?,
            );
        }
        if let Some(v) = var("LADDER_DEDUP_KEY") {
            self.identity_key = v
                .parse()
                .with_context(|| format!("parsing LADDER_DEDUP_KEY={v:?}"))?;
        }
        if let Some(v) = var("LADDER_SCHEDULER_ENABLED") {
            self.scheduler_enabled = parse_bool(&v);
        }
        if let Some(v) = var("LADDER_SYNC_CRON") {
            self.sync_cron = v;
        }
        Ok(())
    }
}

/// Set every participant's rating from the lookup, or the unknown sentinel.
pub fn apply_ratings(drafts: &mut [MatchDraft], ratings: &RatingsLookup) {
    for draft in drafts {
        for participant in &mut draft.participants {
            participant.rating = ratings
                .get(&participant.name)
                .copied()
                .unwrap_or(UNKNOWN_RATING);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub records: Vec<MatchRecord>,
    pub inserted: usize,
    pub duplicates: usize,
}

/// Folds scraped candidates into the store, giving ids only to unseen games.
#[derive(Debug, Clone, Default)]
pub struct IdentityAssigner {
    key: IdentityKeyConfig,
}

impl IdentityAssigner {
    pub fn new(key: IdentityKeyConfig) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &IdentityKeyConfig {
        &self.key
    }

    pub fn next_id(records: &[MatchRecord]) -> u64 {
        records
            .iter()
            .filter_map(|r| r.id)
            .max()
            .map_or(1, |max| max + 1)
    }

    pub fn merge(&self, candidates: Vec<MatchDraft>, mut store: Vec<MatchRecord>) -> MergeOutcome {
        if candidates.is_empty() {
            info!("no new games scraped");
            return MergeOutcome {
                records: store,
                inserted: 0,
                duplicates: 0,
            };
        }

        let before = store.len();
        let scraped = candidates.len();
        let mut next_id = Self::next_id(&store);
        let mut seen: HashSet<IdentityKey> =
            store.iter().map(|r| r.identity_key(&self.key)).collect();

        let mut inserted = 0usize;
        let mut duplicates = 0usize;
        for candidate in candidates {
            if seen.insert(candidate.identity_key(&self.key)) {
                store.push(MatchRecord::from_draft(next_id, candidate));
                next_id += 1;
                inserted += 1;
            } else {
                duplicates += 1;
            }
        }

        store.sort_by_key(|r| r.id);
        info!(
            scraped,
            inserted,
            duplicates,
            before,
            after = store.len(),
            dedup_key = %self.key.describe(),
            "merged scraped games"
        );
        MergeOutcome {
            records: store,
            inserted,
            duplicates,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Flags raised because the artifact exists.
    pub marked_downloaded: usize,
    /// Flags cleared because the artifact is gone.
    pub cleared: usize,
    /// Records without an id, forced to not downloaded.
    pub unidentified: usize,
}

/// Recompute every `downloaded` flag from the artifact directory listing.
pub fn reconcile(
    mut records: Vec<MatchRecord>,
    listing: &BTreeSet<String>,
    extension: &str,
) -> (Vec<MatchRecord>, ReconcileReport) {
    let mut report = ReconcileReport::default();
    for record in &mut records {
        let present = match record.artifact_file_name(extension) {
            Some(name) => listing.contains(&name),
            None => {
                report.unidentified += 1;
                false
            }
        };
        match (record.downloaded, present) {
            (false, true) => report.marked_downloaded += 1,
            (true, false) => report.cleared += 1,
            _ => {}
        }
        record.downloaded = present;
    }
    (records, report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when the phase could not start, e.g. the artifact directory could not be created.
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Full,
    DownloadOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum CycleStatus {
    Completed,
    ScrapeFailed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub kind: CycleKind,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_loaded: usize,
    pub records_total: usize,
    pub ratings_loaded: usize,
    pub ratings_unavailable: bool,
    pub scraped: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub reconcile: ReconcileReport,
    pub downloads: DownloadReport,
    pub persist_failures: usize,
}

impl CycleSummary {
    fn begin(run_id: Uuid, kind: CycleKind) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            kind,
            status: CycleStatus::Completed,
            started_at: now,
            finished_at: now,
            records_loaded: 0,
            records_total: 0,
            ratings_loaded: 0,
            ratings_unavailable: false,
            scraped: 0,
            inserted: 0,
            duplicates: 0,
            reconcile: ReconcileReport::default(),
            downloads: DownloadReport::default(),
            persist_failures: 0,
        }
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Completed without a scrape failure and every persist landed.
    pub fn succeeded(&self) -> bool {
        self.status == CycleStatus::Completed && self.persist_failures == 0
    }
}

pub struct IngestionPipeline {
    store: RecordStore,
    artifacts: ArtifactStore,
    assigner: IdentityAssigner,
    ratings: Box<dyn RatingsSource>,
    matches: Box<dyn MatchSource>,
    downloader: Box<dyn ArtifactDownloader>,
}

impl IngestionPipeline {
    pub fn new(config: &LadderConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::default(),
            ..HttpClientConfig::default()
        })?;
        // a failed replay is retried next cycle, not in a tight loop
        let download_http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs.max(60)),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::none(),
            ..HttpClientConfig::default()
        })?;

        let artifacts = ArtifactStore::new(config.artifacts_dir.clone(), config.artifact_ext.clone());
        let options = GamesTableOptions {
            max_games: config.max_games,
            ..GamesTableOptions::default()
        };
        let matches: Box<dyn MatchSource> = match &config.games_snapshot {
            Some(path) => Box::new(FixtureMatchSource::new(
                path.clone(),
                Url::parse(&config.games_url).ok(),
                options,
            )),
            None => Box::new(HtmlTableMatchSource::new(
                http.clone(),
                config.games_url.clone(),
                options,
            )),
        };

        Ok(Self {
            store: RecordStore::new(config.store_path.clone()),
            assigner: IdentityAssigner::new(config.identity_key.clone()),
            ratings: Box::new(HttpRatingsSource::new(http, config.ratings_url.clone())),
            matches,
            downloader: Box::new(HttpArtifactDownloader::new(download_http, artifacts.clone())),
            artifacts,
        })
    }

    pub fn with_collaborators(
        mut self,
        ratings: Box<dyn RatingsSource>,
        matches: Box<dyn MatchSource>,
        downloader: Box<dyn ArtifactDownloader>,
    ) -> Self {
        self.ratings = ratings;
        self.matches = matches;
        self.downloader = downloader;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// LOAD → RECONCILE → FETCH_RATINGS → SCRAPE → MERGE → PERSIST → DOWNLOAD_PENDING → PERSIST.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        self.run_cycle_inner(run_id)
            .instrument(info_span!("ingestion_cycle", %run_id))
            .await
    }

    async fn run_cycle_inner(&self, run_id: Uuid) -> Result<CycleSummary> {
        let ctx = AdapterContext::now(run_id);
        let mut summary = CycleSummary::begin(run_id, CycleKind::Full);

        let records = self.store.load().await.context("loading match store")?;
        summary.records_loaded = records.len();
        let mut records = self.reconcile_with_disk(records, &mut summary).await;

        let ratings = match self.ratings.fetch_ratings(&ctx).await {
            Ok(lookup) => lookup,
            Err(err) => {
                warn!(error = %err, "ratings unavailable; ratings default to unknown this cycle");
                summary.ratings_unavailable = true;
                RatingsLookup::new()
            }
        };
        summary.ratings_loaded = ratings.len();

        match self.matches.scrape(&ctx).await {
            Ok(mut drafts) => {
                apply_ratings(&mut drafts, &ratings);
                summary.scraped = drafts.len();

                let outcome = self.assigner.merge(drafts, records);
                summary.inserted = outcome.inserted;
                summary.duplicates = outcome.duplicates;
                records = outcome.records;

                self.persist_logged(&records, &mut summary).await;
                summary.downloads = self.download_pending(&ctx, &mut records).await;
            }
            Err(err) => {
                error!(
                    source = self.matches.source_id(),
                    error = %err,
                    "scrape failed; skipping merge and downloads"
                );
                summary.status = CycleStatus::ScrapeFailed(err.to_string());
            }
        }

        self.persist_logged(&records, &mut summary).await;
        Ok(self.finish(summary, records.len()))
    }

    /// LOAD → RECONCILE → DOWNLOAD_PENDING → PERSIST.
    pub async fn download_pending_only(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        async {
            let ctx = AdapterContext::now(run_id);
            let mut summary = CycleSummary::begin(run_id, CycleKind::DownloadOnly);

            let records = self.store.load().await.context("loading match store")?;
            summary.records_loaded = records.len();
            let mut records = self.reconcile_with_disk(records, &mut summary).await;

            summary.downloads = self.download_pending(&ctx, &mut records).await;
            self.persist_logged(&records, &mut summary).await;
            Ok(self.finish(summary, records.len()))
        }
        .instrument(info_span!("download_pending", %run_id))
        .await
    }

    /// Load and reconcile against the artifact directory without writing anything back.
    pub async fn inspect(&self) -> Result<Vec<MatchRecord>> {
        let records = self.store.load().await.context("loading match store")?;
        let listing = self.listing().await;
        let (records, _) = reconcile(records, &listing, self.artifacts.extension());
        Ok(records)
    }

    async fn listing(&self) -> BTreeSet<String> {
        match self.artifacts.list().await {
            Ok(listing) => listing,
            Err(err) => {
                error!(error = %err, "cannot list artifact directory; treating every replay as missing");
                BTreeSet::new()
            }
        }
    }

    async fn reconcile_with_disk(
        &self,
        records: Vec<MatchRecord>,
        summary: &mut CycleSummary,
    ) -> Vec<MatchRecord> {
        let listing = self.listing().await;
        let (records, report) = reconcile(records, &listing, self.artifacts.extension());
        if report.marked_downloaded > 0 || report.cleared > 0 {
            info!(
                marked_downloaded = report.marked_downloaded,
                cleared = report.cleared,
                "reconciled downloaded flags with artifact directory"
            );
        }
        summary.reconcile = report;
        records
    }

    async fn download_pending(
        &self,
        ctx: &AdapterContext,
        records: &mut [MatchRecord],
    ) -> DownloadReport {
        let pending = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.id.is_some() && r.is_pending_download())
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();

        let mut report = DownloadReport {
            pending: pending.len(),
            ..DownloadReport::default()
        };
        if pending.is_empty() {
            info!("no new replays to download");
            return report;
        }

        if let Err(err) = self.artifacts.ensure_root().await {
            error!(error = %err, "artifact directory unavailable; skipping downloads");
            report.aborted = Some(format!("{err:#}"));
            return report;
        }

        info!(pending = pending.len(), "downloading pending replays");
        for (n, idx) in pending.iter().copied().enumerate() {
            let record = &mut records[idx];
            let (Some(id), Some(url)) = (record.id, record.replay_link.clone()) else {
                continue;
            };

            match self.downloader.download(ctx, id, &url).await {
                Ok(_) => {
                    record.downloaded = true;
                    report.succeeded += 1;
                }
                Err(err) => {
                    warn!(id, %url, error = %err, "replay download failed");
                    report.failed += 1;
                }
            }

            let done = n + 1;
            if done % 10 == 0 || done == pending.len() {
                info!(done, total = pending.len(), "replay download progress");
            }
        }
        report
    }

    async fn persist_logged(&self, records: &[MatchRecord], summary: &mut CycleSummary) {
        if let Err(err) = self.store.persist(records).await {
            let err = anyhow::Error::from(err);
            error!(
                path = %self.store.path().display(),
                error = %format!("{err:#}"),
                "failed to persist match store; continuing with in-memory state"
            );
            summary.persist_failures += 1;
        }
    }

    fn finish(&self, mut summary: CycleSummary, records_total: usize) -> CycleSummary {
        summary.finished_at = Utc::now();
        summary.records_total = records_total;
        info!(
            status = ?summary.status,
            inserted = summary.inserted,
            downloaded = summary.downloads.succeeded,
            failed_downloads = summary.downloads.failed,
            persist_failures = summary.persist_failures,
            elapsed_ms = summary.duration().as_millis() as u64,
            "cycle finished"
        );
        summary
    }
}

/// Run one full cycle unless another one holds `gate`. Returns `None` when skipped or aborted.
pub async fn run_guarded(pipeline: &IngestionPipeline, gate: &Mutex<()>) -> Option<CycleSummary> {
    let Ok(_running) = gate.try_lock() else {
        warn!("previous cycle still running; skipping this trigger");
        return None;
    };
    match pipeline.run_cycle().await {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                succeeded = summary.succeeded(),
                "scheduled cycle finished"
            );
            Some(summary)
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "scheduled cycle aborted");
            None
        }
    }
}

/// Run full cycles on `cron` until ctrl-c. Cycles never overlap.
pub async fn run_scheduled(pipeline: Arc<IngestionPipeline>, cron: &str) -> Result<()> {
    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let gate = Arc::clone(&gate);
        Box::pin(async move {
            run_guarded(&pipeline, &gate).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;

    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler started; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
