//! Randomized catalog harvesting with atomic checkpoints, resume, gap analysis and recollection.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use steamset_adapters::{
    CatalogApi, ClientSettings, FetchError, Payload, DEFAULT_API_BASE_URL, DEFAULT_STORE_BASE_URL,
};
use steamset_core::{
    CatalogEntry, CatalogId, CatalogListing, CollectionRun, Corpus, FetchStatus, MergeOutcome,
    RunMetadata, StopReason,
};
use steamset_storage::{credential_fingerprint, CatalogStore, CheckpointStore, SavedCheckpoint};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "steamset-harvest";

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub target_count: usize,
    pub output_path: PathBuf,
    pub checkpoint_every: usize,
    pub rate_limit: Duration,
    /// Identifiers at or below this value are dropped from the pool before drawing.
    pub id_threshold: CatalogId,
    /// `None` accepts every entity type.
    pub wanted_type: Option<String>,
    pub seed: Option<u64>,
    pub api_key: Option<String>,
    pub listing_cache: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: Option<String>,
    pub store_base_url: String,
    pub api_base_url: String,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let rate_limit = Duration::try_from_secs_f64(env_or("STEAMSET_RATE_LIMIT_SECS", 1.5))
            .unwrap_or(Duration::from_millis(1500));
        Self {
            target_count: env_or("STEAMSET_TARGET_COUNT", 100),
            output_path: env_non_empty("STEAMSET_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/collection.json")),
            checkpoint_every: env_or("STEAMSET_CHECKPOINT_EVERY", 25),
            rate_limit,
            id_threshold: env_or("STEAMSET_ID_THRESHOLD", 2000),
            wanted_type: match std::env::var("STEAMSET_WANTED_TYPE") {
                Ok(v) => Some(v.trim().to_string()).filter(|v| !v.is_empty()),
                Err(_) => Some("game".to_string()),
            },
            seed: env_non_empty("STEAMSET_SEED").and_then(|v| v.parse().ok()),
            api_key: env_non_empty("STEAM_API_KEY"),
            listing_cache: env_non_empty("STEAMSET_LISTING_CACHE").map(PathBuf::from),
            http_timeout_secs: env_or("STEAMSET_HTTP_TIMEOUT_SECS", 20),
            user_agent: env_non_empty("STEAMSET_USER_AGENT"),
            store_base_url: env_non_empty("STEAMSET_STORE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_STORE_BASE_URL.to_string()),
            api_base_url: env_non_empty("STEAMSET_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            store_base_url: self.store_base_url.clone(),
            api_base_url: self.api_base_url.clone(),
            min_interval: self.rate_limit,
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn credential_fingerprint(&self) -> Option<String> {
        self.api_key.as_deref().map(credential_fingerprint)
    }
}

/// Identifiers still eligible to be drawn. Draws are uniform and without replacement.
#[derive(Debug)]
pub struct CandidatePool {
    candidates: Vec<CatalogListing>,
    rng: StdRng,
}

impl CandidatePool {
    /// Builds a pool from the bulk listing, keeping the first listing of each identifier.
    pub fn from_listings(
        listings: impl IntoIterator<Item = CatalogListing>,
        seed: Option<u64>,
    ) -> Self {
        let mut seen = HashSet::new();
        let candidates = listings
            .into_iter()
            .filter(|listing| seen.insert(listing.identifier))
            .collect();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { candidates, rng }
    }

    /// Keeps only listings matching `keep`; returns how many were removed.
    pub fn filter(&mut self, mut keep: impl FnMut(&CatalogListing) -> bool) -> usize {
        let before = self.candidates.len();
        self.candidates.retain(|listing| keep(listing));
        before - self.candidates.len()
    }

    pub fn exclude(&mut self, identifiers: &BTreeSet<CatalogId>) -> usize {
        self.filter(|listing| !identifiers.contains(&listing.identifier))
    }

    pub fn draw_random(&mut self) -> Option<CatalogListing> {
        if self.candidates.is_empty() {
            return None;
        }
        let index = self.rng.random_range(0..self.candidates.len());
        Some(self.candidates.swap_remove(index))
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Turns one fetch outcome into the corpus record for that identifier.
pub fn classify_fetch(
    identifier: CatalogId,
    display_name: &str,
    wanted_type: Option<&str>,
    result: Result<Payload, FetchError>,
) -> CatalogEntry {
    let fetched_at = Utc::now();
    match result {
        Ok(payload) => {
            let display_name = if display_name.is_empty() {
                payload
                    .data
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string()
            } else {
                display_name.to_string()
            };
            let wanted = wanted_type
                .map(|wanted| payload.entity_type.as_deref() == Some(wanted))
                .unwrap_or(true);
            if wanted {
                CatalogEntry {
                    identifier,
                    display_name,
                    raw_payload: Some(payload.data),
                    entity_type: payload.entity_type,
                    fetch_status: FetchStatus::Success,
                    fetched_at,
                    error: None,
                }
            } else {
                CatalogEntry {
                    identifier,
                    display_name,
                    raw_payload: None,
                    entity_type: payload.entity_type,
                    fetch_status: FetchStatus::Skipped,
                    fetched_at,
                    error: None,
                }
            }
        }
        Err(err) => CatalogEntry {
            identifier,
            display_name: display_name.to_string(),
            raw_payload: None,
            entity_type: None,
            fetch_status: FetchStatus::Failed,
            fetched_at,
            error: Some(err.to_failure()),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    Running,
    Checkpointing,
    Done(StopReason),
}

/// Everything the harvest loop owns between iterations.
#[derive(Debug)]
pub struct HarvestProgress {
    pub collection: CollectionRun,
    pub pool: CandidatePool,
    pub state: HarvestState,
    pub since_checkpoint: usize,
    started: Instant,
}

impl HarvestProgress {
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            HarvestState::Done(reason) => Some(reason),
            _ => None,
        }
    }

    fn stop_condition(&self) -> Option<StopReason> {
        if self.collection.target_met() {
            Some(StopReason::TargetReached)
        } else if self.pool.is_empty() {
            Some(StopReason::PoolExhausted)
        } else {
            None
        }
    }
}

pub async fn load_checkpoint(path: impl AsRef<Path>) -> Result<CollectionRun> {
    CheckpointStore::new(path.as_ref()).load().await
}

/// Bulk listing cached to a JSON file so repeated runs skip the listing call.
#[derive(Debug, Clone)]
pub struct ListingCache {
    store: CheckpointStore,
}

impl ListingCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: CheckpointStore::new(path),
        }
    }

    pub async fn load_or_fetch(&self, api: &dyn CatalogApi) -> Result<Vec<CatalogListing>> {
        if self.store.exists().await? {
            let listings: Vec<CatalogListing> = self.store.load().await?;
            info!(
                path = %self.store.path().display(),
                count = listings.len(),
                "using cached catalog listing"
            );
            return Ok(listings);
        }
        let listings = api.list_catalog().await?;
        self.store
            .save(&listings)
            .await
            .context("caching catalog listing")?;
        Ok(listings)
    }
}

pub struct Harvester {
    api: Arc<dyn CatalogApi>,
    checkpoints: CheckpointStore,
    config: HarvestConfig,
}

impl Harvester {
    pub fn new(api: Arc<dyn CatalogApi>, config: HarvestConfig) -> Self {
        let checkpoints = CheckpointStore::new(config.output_path.clone());
        Self {
            api,
            checkpoints,
            config,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub async fn fetch_listings(&self) -> Result<Vec<CatalogListing>> {
        match &self.config.listing_cache {
            Some(path) => ListingCache::new(path).load_or_fetch(self.api.as_ref()).await,
            None => self.api.list_catalog().await,
        }
    }

    pub fn build_pool(&self, listings: Vec<CatalogListing>) -> CandidatePool {
        let listed = listings.len();
        let mut pool = CandidatePool::from_listings(listings, self.config.seed);
        let threshold = self.config.id_threshold;
        let filtered = pool.filter(|listing| listing.identifier > threshold);
        info!(
            listed,
            filtered,
            candidates = pool.len(),
            id_threshold = threshold,
            "candidate pool built"
        );
        pool
    }

    fn fresh_metadata(&self) -> RunMetadata {
        RunMetadata {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            target_count: self.config.target_count,
            actual_count: 0,
            attempted_count: 0,
            success_rate: 0.0,
            rate_limit_delay_seconds: self.config.rate_limit.as_secs_f64(),
            checkpoint_every: self.config.checkpoint_every,
            wanted_type: self.config.wanted_type.clone(),
            id_threshold: self.config.id_threshold,
            credential_fingerprint: self.config.credential_fingerprint(),
            output_reference: self.checkpoints.path().display().to_string(),
            recollection_passes: 0,
            stop_reason: None,
        }
    }

    pub fn start(&self, pool: CandidatePool) -> HarvestProgress {
        let collection = CollectionRun::new(self.fresh_metadata());
        info!(
            run_id = %collection.metadata.run_id,
            target = self.config.target_count,
            "harvest started"
        );
        HarvestProgress {
            collection,
            pool,
            state: HarvestState::Running,
            since_checkpoint: 0,
            started: Instant::now(),
        }
    }

    /// Continues a checkpointed run: identifiers already in its corpus are never drawn
    /// again and counters are rebuilt from the corpus.
    pub fn resume(
        &self,
        mut checkpoint: CollectionRun,
        mut pool: CandidatePool,
    ) -> HarvestProgress {
        let excluded = pool.exclude(&checkpoint.entries.identifiers());
        let metadata = &mut checkpoint.metadata;
        metadata.target_count = self.config.target_count;
        metadata.attempted_count = checkpoint.entries.len();
        metadata.finished_at = None;
        metadata.stop_reason = None;
        metadata.rate_limit_delay_seconds = self.config.rate_limit.as_secs_f64();
        metadata.checkpoint_every = self.config.checkpoint_every;
        metadata.output_reference = self.checkpoints.path().display().to_string();
        if metadata.credential_fingerprint.is_none() {
            metadata.credential_fingerprint = self.config.credential_fingerprint();
        }
        checkpoint.refresh_counts();
        info!(
            run_id = %checkpoint.metadata.run_id,
            attempted = checkpoint.metadata.attempted_count,
            succeeded = checkpoint.metadata.actual_count,
            excluded,
            remaining = pool.len(),
            "harvest resumed"
        );
        HarvestProgress {
            collection: checkpoint,
            pool,
            state: HarvestState::Running,
            since_checkpoint: 0,
            started: Instant::now(),
        }
    }

    async fn write_checkpoint(&self, progress: &HarvestProgress) -> Result<SavedCheckpoint> {
        let saved = self
            .checkpoints
            .save(&progress.collection)
            .await
            .context("writing harvest checkpoint")?;
        info!(
            path = %saved.path.display(),
            attempted = progress.collection.metadata.attempted_count,
            succeeded = progress.collection.metadata.actual_count,
            elapsed_secs = progress.started.elapsed().as_secs_f64(),
            "checkpoint saved"
        );
        Ok(saved)
    }

    async fn finish(
        &self,
        mut progress: HarvestProgress,
        reason: StopReason,
    ) -> Result<HarvestProgress> {
        let metadata = &mut progress.collection.metadata;
        metadata.stop_reason = Some(reason);
        metadata.finished_at = Some(Utc::now());
        progress.collection.refresh_counts();
        self.write_checkpoint(&progress).await?;

        let metadata = &progress.collection.metadata;
        match reason {
            StopReason::TargetReached => info!(
                succeeded = metadata.actual_count,
                attempted = metadata.attempted_count,
                success_rate = metadata.success_rate,
                "harvest reached target"
            ),
            StopReason::PoolExhausted => warn!(
                succeeded = metadata.actual_count,
                target = metadata.target_count,
                attempted = metadata.attempted_count,
                "candidate pool exhausted before target"
            ),
        }
        progress.state = HarvestState::Done(reason);
        Ok(progress)
    }

    /// Advances the loop by one transition. Only checkpoint writes can fail.
    pub async fn step(&self, mut progress: HarvestProgress) -> Result<HarvestProgress> {
        match progress.state {
            HarvestState::Done(_) => Ok(progress),
            HarvestState::Checkpointing => {
                self.write_checkpoint(&progress).await?;
                progress.since_checkpoint = 0;
                progress.state = HarvestState::Running;
                Ok(progress)
            }
            HarvestState::Running => {
                if let Some(reason) = progress.stop_condition() {
                    return self.finish(progress, reason).await;
                }
                let Some(listing) = progress.pool.draw_random() else {
                    return self.finish(progress, StopReason::PoolExhausted).await;
                };

                let result = self.api.fetch_detail(listing.identifier).await;
                let entry = classify_fetch(
                    listing.identifier,
                    &listing.display_name,
                    self.config.wanted_type.as_deref(),
                    result,
                );
                let status = entry.fetch_status;
                if !progress.collection.entries.insert(entry) {
                    warn!(
                        identifier = listing.identifier,
                        "identifier already in corpus; ignoring"
                    );
                    return Ok(progress);
                }
                progress.collection.metadata.attempted_count += 1;
                progress.collection.refresh_counts();
                progress.since_checkpoint += 1;

                info!(
                    identifier = listing.identifier,
                    status = status.as_str(),
                    attempted = progress.collection.metadata.attempted_count,
                    succeeded = progress.collection.metadata.actual_count,
                    target = progress.collection.metadata.target_count,
                    elapsed_secs = progress.started.elapsed().as_secs_f64(),
                    "processed candidate"
                );

                if self.config.checkpoint_every > 0
                    && progress.since_checkpoint >= self.config.checkpoint_every
                {
                    progress.state = HarvestState::Checkpointing;
                }
                Ok(progress)
            }
        }
    }

    pub async fn run(&self, mut progress: HarvestProgress) -> Result<HarvestProgress> {
        while !matches!(progress.state, HarvestState::Done(_)) {
            progress = self.step(progress).await?;
        }
        Ok(progress)
    }

    /// Fetches the listing (or its cache), builds the pool and runs to completion,
    /// continuing `resume_from` when given.
    pub async fn harvest(&self, resume_from: Option<CollectionRun>) -> Result<HarvestProgress> {
        let listings = self.fetch_listings().await?;
        let pool = self.build_pool(listings);
        let progress = match resume_from {
            Some(checkpoint) => self.resume(checkpoint, pool),
            None => self.start(pool),
        };
        self.run(progress).await
    }
}

pub struct GapAnalyzer;

impl GapAnalyzer {
    /// Expected identifiers that have no successful entry in `corpus`.
    pub fn missing(expected: &BTreeSet<CatalogId>, corpus: &Corpus) -> BTreeSet<CatalogId> {
        let present = corpus.success_identifiers();
        expected.difference(&present).copied().collect()
    }
}

/// Reads one identifier per line; blank lines and `#` comments are ignored.
pub async fn read_identifier_file(path: impl AsRef<Path>) -> Result<BTreeSet<CatalogId>> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut out = BTreeSet::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let identifier = line
            .parse::<CatalogId>()
            .with_context(|| {
                format!("{}:{}: invalid identifier {line:?}", path.display(), line_no + 1)
            })?;
        out.insert(identifier);
    }
    Ok(out)
}

pub async fn write_identifier_file(
    path: impl AsRef<Path>,
    identifiers: &BTreeSet<CatalogId>,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut body = identifiers
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    body.push('\n');
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecollectionSummary {
    pub requested: usize,
    pub appended: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RecollectionSummary {
    pub fn recovered(&self) -> usize {
        self.appended + self.replaced
    }
}

/// Re-fetches a set of identifiers and merges only the successes into the corpus.
pub struct Recollector {
    api: Arc<dyn CatalogApi>,
    checkpoints: CheckpointStore,
    checkpoint_every: usize,
    wanted_type: Option<String>,
}

impl Recollector {
    pub fn new(
        api: Arc<dyn CatalogApi>,
        checkpoint_path: impl Into<PathBuf>,
        checkpoint_every: usize,
        wanted_type: Option<String>,
    ) -> Self {
        Self {
            api,
            checkpoints: CheckpointStore::new(checkpoint_path),
            checkpoint_every,
            wanted_type,
        }
    }

    async fn save(&self, run: &mut CollectionRun) -> Result<()> {
        run.metadata.attempted_count = run.metadata.attempted_count.max(run.entries.len());
        run.refresh_counts();
        self.checkpoints
            .save(&*run)
            .await
            .context("writing recollection checkpoint")?;
        Ok(())
    }

    pub async fn recollect(
        &self,
        mut run: CollectionRun,
        missing: &BTreeSet<CatalogId>,
    ) -> Result<(CollectionRun, RecollectionSummary)> {
        let mut summary = RecollectionSummary {
            requested: missing.len(),
            ..Default::default()
        };
        run.metadata.recollection_passes += 1;
        info!(
            requested = missing.len(),
            pass = run.metadata.recollection_passes,
            "recollection started"
        );

        for (processed, &identifier) in missing.iter().enumerate() {
            let display_name = run
                .entries
                .get(identifier)
                .map(|e| e.display_name.clone())
                .unwrap_or_default();
            let result = self.api.fetch_detail(identifier).await;
            let entry =
                classify_fetch(identifier, &display_name, self.wanted_type.as_deref(), result);

            match entry.fetch_status {
                FetchStatus::Success => match run.entries.merge_success(entry) {
                    MergeOutcome::Appended => summary.appended += 1,
                    MergeOutcome::Replaced => summary.replaced += 1,
                    MergeOutcome::Unchanged => summary.unchanged += 1,
                },
                FetchStatus::Skipped => summary.skipped += 1,
                FetchStatus::Failed | FetchStatus::Pending => summary.failed += 1,
            }
            debug!(
                identifier,
                processed = processed + 1,
                recovered = summary.recovered(),
                "recollected"
            );

            if self.checkpoint_every > 0 && (processed + 1) % self.checkpoint_every == 0 {
                self.save(&mut run).await?;
            }
        }

        self.save(&mut run).await?;
        info!(
            recovered = summary.recovered(),
            failed = summary.failed,
            skipped = summary.skipped,
            "recollection finished"
        );
        Ok((run, summary))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub entries: usize,
    pub batches: usize,
    pub rows_written: usize,
}

/// Upserts every corpus entry into the store, one transaction per batch.
pub async fn import_corpus(
    store: &dyn CatalogStore,
    run: &CollectionRun,
    batch_size: usize,
) -> Result<ImportSummary> {
    let batch_size = batch_size.max(1);
    let mut summary = ImportSummary::default();
    for chunk in run.entries.entries().chunks(batch_size) {
        summary.batches += 1;
        let written = store
            .upsert_entries(chunk)
            .await
            .with_context(|| format!("importing corpus batch {}", summary.batches))?;
        summary.entries += chunk.len();
        summary.rows_written += written;
        info!(batch = summary.batches, entries = summary.entries, "imported corpus batch");
    }
    Ok(summary)
}
