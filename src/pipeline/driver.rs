//! Batch driver.
//!
//! A run selects its items, brings up one inference server per model, and
//! processes the items strictly one after another: generate, parse, persist,
//! pause. Shutdown requests are honored between items.
//!
//! Two stages are driven from here:
//!
//! - **caption**: claims the pending backlog, then for every requested vision
//!   model writes `captions[model]` and `moderations[model]`.
//! - **age estimation**: backfills `ageEstimations[model]` for curated items
//!   from an existing caption, using a text-only model.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use super::candidates::BackfillSelection;
use super::parse::{main_character_age, parse_age_estimation, parse_moderation_rating};
use super::shutdown::ShutdownSignal;
use crate::error::{LlmError, RegistryError, ServerError, StoreError};
use crate::llm::{CallProfile, Conversation, Generation, LlamaServerClient, RetryingGenerator};
use crate::llm::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_PAUSE};
use crate::metrics::MetricsCollector;
use crate::prompts::PromptSet;
use crate::quality::{RepetitionCheck, RepetitionDetector};
use crate::registry::{ModelFiles, ModelRegistry, ModelSpec};
use crate::scheduler::ClaimCoordinator;
use crate::server::{ServerEndpoint, ServerManager};
use crate::storage::{
    image_data_uri, AssetStore, CandidateQuery, DocumentStore, ItemStatus, LocalAssetStore,
    Mutation, ResultRecord, Slot, WorkItem, WriteBatch,
};

/// Items between progress log lines.
const PROGRESS_EVERY: usize = 10;

/// Errors that end a run.
///
/// Per-item generation failures are not among them: a claimed item is
/// marked `error`, a backfill item is only counted, and the run continues.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Model error: {0}")]
    Registry(#[from] RegistryError),

    #[error("LLM client error: {0}")]
    Llm(#[from] LlmError),
}

/// Per-run knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    /// Select and report, but neither write nor start a server.
    pub dry_run: bool,
    /// Pause after every processed item.
    pub item_pause: Duration,
    /// Upper bound on items processed by a backfill run.
    pub max_items: Option<usize>,
    /// Candidates requested per backfill page.
    pub batch_size: usize,
    /// Ask the caption model to explain its moderation rating.
    pub generate_explanation: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            item_pause: Duration::from_millis(500),
            max_items: None,
            batch_size: 1000,
            generate_explanation: false,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Items selected or claimed.
    pub selected: usize,
    pub succeeded: usize,
    /// Items whose generation failed. Claimed items among them are marked
    /// `error`.
    pub failed: usize,
    /// Items that already had results.
    pub skipped: usize,
    /// Generations kept despite persistent repetition.
    pub degraded: usize,
    /// Replies stored without a parsed value.
    pub parse_failures: usize,
    /// Claimed items left in `processing` because the run stopped early.
    pub unfinished: usize,
    pub interrupted: bool,
}

impl RunStats {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Result of an ingest pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Image keys found under the asset root.
    pub discovered: usize,
    /// Items that did not exist before.
    pub created: u64,
    /// Write chunks committed.
    pub chunks: usize,
}

/// Why a single item failed.
#[derive(Debug, Error)]
enum ItemError {
    #[error("asset unavailable: {0}")]
    Asset(StoreError),

    #[error("generation failed: {0}")]
    Generation(LlmError),

    #[error("store write failed: {0}")]
    Store(StoreError),
}

/// What a successfully processed item produced.
#[derive(Debug, Default)]
struct ItemReport {
    degraded: usize,
    parse_failed: bool,
    written: bool,
}

/// Per-item bookkeeping across the models of a caption run.
#[derive(Debug, Default)]
struct CaptionProgress {
    handled: HashMap<String, usize>,
    failed: HashSet<String>,
    stats: RunStats,
}

/// Drives caption and backfill runs against one store.
pub struct BatchDriver {
    store: Arc<dyn DocumentStore>,
    assets: Arc<dyn AssetStore>,
    server: ServerManager,
    registry: ModelRegistry,
    prompts: PromptSet,
    models_dir: PathBuf,
    claims: ClaimCoordinator,
    detector: Arc<dyn RepetitionCheck>,
    max_attempts: u32,
    retry_pause: Duration,
    shutdown: ShutdownSignal,
    options: DriverOptions,
    metrics: MetricsCollector,
}

impl BatchDriver {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        assets: Arc<dyn AssetStore>,
        server: ServerManager,
        options: DriverOptions,
    ) -> Self {
        Self {
            claims: ClaimCoordinator::new(Arc::clone(&store)),
            store,
            assets,
            server,
            registry: ModelRegistry::builtin(),
            prompts: PromptSet::default(),
            models_dir: PathBuf::from("models"),
            detector: Arc::new(RepetitionDetector::default()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_pause: DEFAULT_RETRY_PAUSE,
            shutdown: ShutdownSignal::new(),
            options,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = dir.into();
        self
    }

    pub fn with_min_backlog(mut self, min_backlog: u64) -> Self {
        self.claims = self.claims.with_min_backlog(min_backlog);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn RepetitionCheck>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_retries(mut self, max_attempts: u32, retry_pause: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_pause = retry_pause;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Claims the pending backlog and captions it with every model in
    /// `model_keys`, one server per model.
    ///
    /// # Errors
    ///
    /// Unknown models or missing model files (checked before claiming),
    /// server startup failures and store failures. If the first server never
    /// becomes ready nothing is claimed.
    pub async fn run_caption(&self, model_keys: &[String]) -> Result<RunStats, DriverError> {
        let span = tracing::info_span!("caption_run", run_id = %Uuid::new_v4());
        self.caption_run(model_keys).instrument(span).await
    }

    async fn caption_run(&self, model_keys: &[String]) -> Result<RunStats, DriverError> {
        let specs = model_keys
            .iter()
            .map(|key| self.registry.get_multimodal(key))
            .collect::<Result<Vec<_>, _>>()?;

        if self.options.dry_run {
            return self.caption_dry_run(&specs).await;
        }

        let mut plans: Vec<(&ModelSpec, ModelFiles)> = Vec::with_capacity(specs.len());
        for spec in specs {
            let files = self.registry.resolve_files(&spec.key, &self.models_dir)?;
            plans.push((spec, files));
        }

        if !self.claims.has_backlog().await? {
            tracing::info!(
                min_backlog = self.claims.min_backlog(),
                "Backlog below threshold, no server started"
            );
            return Ok(RunStats::default());
        }

        // Items are claimed once the first server is ready, so a startup
        // failure of that server leaves the backlog pending.
        let mut claimed: Vec<WorkItem> = Vec::new();
        let mut progress = CaptionProgress::default();

        for (index, (spec, files)) in plans.iter().enumerate() {
            if self.shutdown.is_requested() {
                progress.stats.interrupted = true;
                break;
            }
            tracing::info!(model = %spec.key, "Processing with model");
            let result = {
                let progress = &mut progress;
                let claimed = &mut claimed;
                self.server
                    .with_server(files, move |endpoint| {
                        self.caption_pass(endpoint, spec, index == 0, claimed, progress)
                    })
                    .await
            };
            if let Err(e) = result {
                tracing::error!(model = %spec.key, error = %e, "Caption run aborted");
                if let Err(fe) = self
                    .finalize_caption_statuses(&claimed, plans.len(), true, &mut progress)
                    .await
                {
                    tracing::warn!(error = %fe, "Failed to record statuses of claimed items");
                }
                return Err(e);
            }
            if claimed.is_empty() {
                return Ok(RunStats::default());
            }
        }

        self.finalize_caption_statuses(&claimed, plans.len(), false, &mut progress)
            .await?;
        log_summary("caption", &progress.stats);
        Ok(progress.stats)
    }

    /// One model's pass over the batch. The first pass claims the batch.
    async fn caption_pass(
        &self,
        endpoint: ServerEndpoint,
        spec: &ModelSpec,
        claim: bool,
        claimed: &mut Vec<WorkItem>,
        progress: &mut CaptionProgress,
    ) -> Result<(), DriverError> {
        if claim {
            *claimed = self.claims.claim_pending_batch().await?;
            progress.stats.selected = claimed.len();
            if claimed.is_empty() {
                return Ok(());
            }
            tracing::info!(
                items = claimed.len(),
                explanation = self.options.generate_explanation,
                "Starting caption run"
            );
        }
        self.caption_with_model(endpoint, spec, claimed.as_slice(), progress)
            .await
    }

    async fn caption_dry_run(&self, specs: &[&ModelSpec]) -> Result<RunStats, DriverError> {
        let pending = self.store.count_by_status(ItemStatus::Pending).await?;
        let mut stats = RunStats::default();
        if pending < self.claims.min_backlog() {
            tracing::info!(
                pending,
                min_backlog = self.claims.min_backlog(),
                "[dry-run] Backlog below threshold, nothing would be claimed"
            );
            return Ok(stats);
        }

        let items = self
            .store
            .list_items(&CandidateQuery::new().with_statuses([ItemStatus::Pending]))
            .await?;
        stats.selected = items.len();
        for spec in specs {
            let done = items
                .iter()
                .filter(|item| has_caption_results(item, &spec.key))
                .count();
            tracing::info!(
                model = %spec.key,
                would_process = items.len() - done,
                would_skip = done,
                "[dry-run] Caption plan"
            );
        }
        Ok(stats)
    }

    async fn caption_with_model(
        &self,
        endpoint: ServerEndpoint,
        spec: &ModelSpec,
        items: &[WorkItem],
        progress: &mut CaptionProgress,
    ) -> Result<(), DriverError> {
        let generator = self.generator_for(&endpoint)?;

        for (index, item) in items.iter().enumerate() {
            if self.shutdown.is_requested() {
                tracing::warn!(model = %spec.key, remaining = items.len() - index, "Shutdown requested, stopping");
                progress.stats.interrupted = true;
                break;
            }

            if has_caption_results(item, &spec.key) {
                tracing::debug!(key = %item.key, model = %spec.key, "Already captioned, skipping");
                *progress.handled.entry(item.id.clone()).or_default() += 1;
                progress.stats.skipped += 1;
                self.metrics.record_item("caption", "skipped");
                continue;
            }

            match self.caption_item(&generator, spec, item).await {
                Ok(report) => {
                    progress.stats.degraded += report.degraded;
                    progress.stats.parse_failures += usize::from(report.parse_failed);
                    if !report.written {
                        progress.stats.skipped += 1;
                    }
                    self.metrics.record_item("caption", "success");
                }
                Err(ItemError::Store(e)) => return Err(e.into()),
                Err(ItemError::Generation(LlmError::EmptyResponse)) => {
                    tracing::warn!(key = %item.key, model = %spec.key, "Model returned no text, skipping");
                    progress.stats.skipped += 1;
                    self.metrics.record_item("caption", "skipped");
                }
                Err(e) => {
                    tracing::error!(key = %item.key, model = %spec.key, error = %e, "Caption failed");
                    progress.failed.insert(item.id.clone());
                    self.metrics.record_item("caption", "error");
                }
            }
            *progress.handled.entry(item.id.clone()).or_default() += 1;

            if (index + 1) % PROGRESS_EVERY == 0 {
                tracing::info!(model = %spec.key, done = index + 1, total = items.len(), failed = progress.failed.len(), "Progress");
            }
            self.pause().await;
        }
        Ok(())
    }

    async fn caption_item(
        &self,
        generator: &RetryingGenerator,
        spec: &ModelSpec,
        item: &WorkItem,
    ) -> Result<ItemReport, ItemError> {
        let bytes = self.assets.fetch(&item.key).await.map_err(ItemError::Asset)?;
        let profile = CallProfile::image_chat();
        let mut report = ItemReport::default();

        let conversation = Conversation::new()
            .with_image(image_data_uri(&item.key, &bytes))
            .user(self.prompts.caption.as_str());
        let caption = generate(generator, &conversation, &profile, &mut report).await?;
        tracing::debug!(key = %item.key, chars = caption.chars().count(), "Caption generated");

        let conversation = conversation
            .assistant(caption.as_str())
            .user(self.prompts.moderation.as_str());
        let moderation = generate(generator, &conversation, &profile, &mut report).await?;
        let rating = parse_moderation_rating(&moderation);
        if rating.is_none() {
            tracing::warn!(key = %item.key, "No moderation rating found in reply");
            report.parse_failed = true;
        }

        let caption_record = ResultRecord::new(spec.record_metadata(&self.prompts.caption), caption);
        let moderation_record =
            ResultRecord::new(spec.record_metadata(&self.prompts.moderation), moderation.clone())
                .with_parsed(rating.map(serde_json::Value::from));

        // Writes only the slots that are still empty for this model.
        self.store
            .apply(&[
                Mutation::MergeResult {
                    id: item.id.clone(),
                    slot: Slot::Captions,
                    model_key: spec.key.clone(),
                    record: caption_record,
                },
                Mutation::MergeResult {
                    id: item.id.clone(),
                    slot: Slot::Moderations,
                    model_key: spec.key.clone(),
                    record: moderation_record,
                },
            ])
            .await
            .map_err(ItemError::Store)?;
        report.written = true;

        if self.options.generate_explanation {
            let conversation = conversation
                .assistant(moderation.as_str())
                .user(self.prompts.explanation.as_str());
            match generate(generator, &conversation, &profile, &mut report).await {
                Ok(text) => {
                    self.store
                        .merge_addendum(
                            &item.id,
                            Slot::Moderations,
                            &spec.key,
                            "explanation",
                            &serde_json::Value::String(text),
                        )
                        .await
                        .map_err(ItemError::Store)?;
                }
                Err(e) => {
                    tracing::warn!(key = %item.key, error = %e, "Explanation failed, keeping rating without it");
                }
            }
        }

        tracing::info!(key = %item.key, model = %spec.key, rating = ?rating, "Saved caption and moderation");
        Ok(report)
    }

    /// Records the outcome of every claimed item. Items a failed run never
    /// finished become `error`; after an interruption they stay `processing`.
    async fn finalize_caption_statuses(
        &self,
        claimed: &[WorkItem],
        model_count: usize,
        aborted: bool,
        progress: &mut CaptionProgress,
    ) -> Result<(), DriverError> {
        let mut batch = WriteBatch::new(self.store.as_ref());
        for item in claimed {
            let handled = progress.handled.get(&item.id).copied().unwrap_or(0);
            let status = if progress.failed.contains(&item.id) || (aborted && handled < model_count)
            {
                progress.stats.failed += 1;
                ItemStatus::Error
            } else if handled >= model_count {
                progress.stats.succeeded += 1;
                ItemStatus::Inferred
            } else {
                progress.stats.unfinished += 1;
                continue;
            };
            batch
                .push(Mutation::SetStatus {
                    id: item.id.clone(),
                    status,
                })
                .await?;
        }
        batch.flush().await?;

        if progress.stats.unfinished > 0 {
            tracing::warn!(
                unfinished = progress.stats.unfinished,
                "Run stopped early; unfinished items remain in processing"
            );
        }
        Ok(())
    }

    /// Backfills `ageEstimations[age_model]` from `captions[caption_model]`.
    ///
    /// Pages through curated items until no candidates remain or
    /// `max_items` items have been processed.
    pub async fn run_age_estimation(
        &self,
        caption_model: &str,
        age_model: &str,
    ) -> Result<RunStats, DriverError> {
        let span = tracing::info_span!("age_estimation_run", run_id = %Uuid::new_v4());
        self.age_estimation_run(caption_model, age_model)
            .instrument(span)
            .await
    }

    async fn age_estimation_run(
        &self,
        caption_model: &str,
        age_model: &str,
    ) -> Result<RunStats, DriverError> {
        self.registry.get(caption_model)?;
        let age_spec = self.registry.get(age_model)?;
        let selection = BackfillSelection::age_estimation(caption_model, age_model);

        tracing::info!(
            caption_source = caption_model,
            model = age_model,
            batch_size = self.options.batch_size,
            max_items = ?self.options.max_items,
            dry_run = self.options.dry_run,
            "Starting age estimation backfill"
        );

        if self.options.dry_run {
            return self.backfill_dry_run(&selection).await;
        }

        let files = self.registry.resolve_files(age_model, &self.models_dir)?;
        let selection = &selection;
        let stats = self
            .server
            .with_server(&files, move |endpoint| {
                self.age_estimation_with_server(endpoint, age_spec, selection)
            })
            .await?;

        log_summary("age_estimation", &stats);
        Ok(stats)
    }

    async fn backfill_dry_run(&self, selection: &BackfillSelection) -> Result<RunStats, DriverError> {
        let mut stats = RunStats::default();
        let mut cursor: Option<String> = None;
        loop {
            let Some(limit) = self.page_limit(stats.selected) else {
                break;
            };
            let page = selection
                .next_page(self.store.as_ref(), limit, cursor.as_deref())
                .await?;
            for item in &page.candidates {
                tracing::info!(key = %item.key, "[dry-run] Would estimate age");
            }
            stats.selected += page.candidates.len();
            cursor = page.last_id;
            if page.exhausted {
                break;
            }
        }
        tracing::info!(candidates = stats.selected, "[dry-run] Backfill plan");
        Ok(stats)
    }

    async fn age_estimation_with_server(
        &self,
        endpoint: ServerEndpoint,
        age_spec: &ModelSpec,
        selection: &BackfillSelection,
    ) -> Result<RunStats, DriverError> {
        let generator = self.generator_for(&endpoint)?;
        let (_, caption_model) = &selection.upstream;
        let mut stats = RunStats::default();
        let mut cursor: Option<String> = None;

        'pages: loop {
            if self.shutdown.is_requested() {
                stats.interrupted = true;
                break;
            }
            let Some(limit) = self.page_limit(stats.processed() + stats.skipped) else {
                tracing::info!("Reached max items");
                break;
            };
            let page = selection
                .next_page(self.store.as_ref(), limit, cursor.as_deref())
                .await?;
            stats.selected += page.candidates.len();

            for item in &page.candidates {
                if self.shutdown.is_requested() {
                    tracing::warn!("Shutdown requested, stopping");
                    stats.interrupted = true;
                    break 'pages;
                }

                match self
                    .age_estimation_item(&generator, age_spec, caption_model, item)
                    .await
                {
                    Ok(report) => {
                        stats.degraded += report.degraded;
                        stats.parse_failures += usize::from(report.parse_failed);
                        if report.written {
                            stats.succeeded += 1;
                            self.metrics.record_item("age_estimation", "success");
                        } else {
                            stats.skipped += 1;
                            self.metrics.record_item("age_estimation", "skipped");
                        }
                    }
                    Err(ItemError::Store(e)) => return Err(e.into()),
                    Err(ItemError::Generation(LlmError::EmptyResponse)) => {
                        tracing::warn!(key = %item.key, "Model returned no text, skipping");
                        stats.skipped += 1;
                        self.metrics.record_item("age_estimation", "skipped");
                    }
                    Err(e) => {
                        // Curated items keep their status and stay candidates for later runs.
                        tracing::error!(key = %item.key, error = %e, "Age estimation failed");
                        stats.failed += 1;
                        self.metrics.record_item("age_estimation", "error");
                    }
                }

                let done = stats.processed();
                if done > 0 && done % PROGRESS_EVERY == 0 {
                    tracing::info!(
                        processed = done,
                        succeeded = stats.succeeded,
                        failed = stats.failed,
                        "Progress"
                    );
                }
                self.pause().await;
            }

            cursor = page.last_id;
            if page.exhausted {
                tracing::info!("No more candidates");
                break;
            }
        }
        Ok(stats)
    }

    async fn age_estimation_item(
        &self,
        generator: &RetryingGenerator,
        age_spec: &ModelSpec,
        caption_model: &str,
        item: &WorkItem,
    ) -> Result<ItemReport, ItemError> {
        let mut report = ItemReport::default();
        let Some(caption) = item.result(Slot::Captions, caption_model) else {
            return Ok(report);
        };

        let conversation =
            Conversation::new().user(self.prompts.age_estimation_for_caption(&caption.raw_output));
        let raw = generate(generator, &conversation, &CallProfile::text_only(), &mut report).await?;

        let parsed = match parse_age_estimation(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %item.key, error = %e, "Could not parse age estimation");
                report.parse_failed = true;
                None
            }
        };
        let age = parsed.as_ref().and_then(main_character_age);

        let mut metadata = age_spec.record_metadata(&self.prompts.age_estimation);
        metadata.caption_source = Some(caption_model.to_string());
        let record = ResultRecord::new(metadata, raw)
            .with_parsed(parsed)
            .with_main_character_age(age.clone());

        report.written = self
            .store
            .merge_result(&item.id, Slot::AgeEstimations, &age_spec.key, &record)
            .await
            .map_err(ItemError::Store)?;

        tracing::info!(key = %item.key, main_character_age = ?age, "Saved age estimation");
        Ok(report)
    }

    /// Size of the next page, or `None` once `max_items` is reached.
    fn page_limit(&self, done: usize) -> Option<usize> {
        match self.options.max_items {
            Some(max) if done >= max => None,
            Some(max) => Some(self.options.batch_size.min(max - done).max(1)),
            None => Some(self.options.batch_size.max(1)),
        }
    }

    fn generator_for(&self, endpoint: &ServerEndpoint) -> Result<RetryingGenerator, DriverError> {
        let client = LlamaServerClient::new(endpoint.base_url())?;
        Ok(RetryingGenerator::new(Arc::new(client))
            .with_detector(Arc::clone(&self.detector))
            .with_max_attempts(self.max_attempts)
            .with_retry_pause(self.retry_pause))
    }

    async fn pause(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.options.item_pause) => {}
            _ = self.shutdown.requested() => {}
        }
    }
}

async fn generate(
    generator: &RetryingGenerator,
    conversation: &Conversation,
    profile: &CallProfile,
    report: &mut ItemReport,
) -> Result<String, ItemError> {
    let Generation { text, degraded, .. } = generator
        .generate(conversation, profile)
        .await
        .map_err(ItemError::Generation)?;
    report.degraded += usize::from(degraded);
    Ok(text)
}

fn has_caption_results(item: &WorkItem, model_key: &str) -> bool {
    item.has_result(Slot::Captions, model_key) && item.has_result(Slot::Moderations, model_key)
}

fn log_summary(stage: &str, stats: &RunStats) {
    tracing::info!(
        stage,
        selected = stats.selected,
        succeeded = stats.succeeded,
        failed = stats.failed,
        skipped = stats.skipped,
        degraded = stats.degraded,
        parse_failures = stats.parse_failures,
        unfinished = stats.unfinished,
        interrupted = stats.interrupted,
        "Run complete"
    );
}

/// Registers every image under `assets` (optionally below `prefix`) as a
/// pending work item. Existing items keep their status and results.
pub async fn ingest(
    store: &dyn DocumentStore,
    assets: &LocalAssetStore,
    prefix: Option<&str>,
    dry_run: bool,
) -> Result<IngestStats, StoreError> {
    let keys = assets.list_image_keys(prefix)?;
    let mut stats = IngestStats {
        discovered: keys.len(),
        ..IngestStats::default()
    };
    tracing::info!(root = %assets.root().display(), discovered = keys.len(), "Scanned asset root");
    if dry_run {
        return Ok(stats);
    }

    let before = total_items(store).await?;
    let mut batch = WriteBatch::new(store);
    for key in keys {
        batch.push(Mutation::Upsert(WorkItem::new(key))).await?;
    }
    batch.flush().await?;
    stats.chunks = batch.chunks();
    stats.created = total_items(store).await?.saturating_sub(before);

    tracing::info!(created = stats.created, chunks = stats.chunks, "Ingest complete");
    Ok(stats)
}

async fn total_items(store: &dyn DocumentStore) -> Result<u64, StoreError> {
    Ok(store.status_counts().await?.values().sum())
}

/// Loads prompts from `dir` when given, otherwise the defaults.
pub fn load_prompts(dir: Option<&Path>) -> std::io::Result<PromptSet> {
    match dir {
        Some(dir) => PromptSet::load(dir),
        None => Ok(PromptSet::default()),
    }
}
