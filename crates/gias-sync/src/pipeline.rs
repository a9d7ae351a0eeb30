//! The populate run: a linear stage machine over the loaders, guarded by an advisory lock.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use gias_adapters::{
    reshape, staging_shape_from_csv, EncodingNormalizer, NormalizationError, Normalized,
    ReshapeError,
};
use gias_core::{
    GeoDump, PipelineStage, RunContext, StagingTableDef, DEPRIVATION_PUPIL_PREMIUM_RAW,
    EMAIL_ADDRESSES_RAW, SCHOOLS_RAW,
};
use gias_storage::{
    BlobStore, FetchError, FetchedResponse, LocalBlobStore, SourceFetcher, StoredBlob,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ReplacePolicy;
use crate::db::Database;
use crate::staging::{LoadError, StagingLoader};
use crate::transform::TransformLoader;
use crate::trusts::{ExtractionError, RelationshipExtractor};
use crate::views::{ViewError, ViewManager};

/// Cooperative cancellation, honoured at the next stage boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the signal was already raised, i.e. a repeated request.
    pub fn raise(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("another run holds advisory lock {0}")]
    AlreadyRunning(i64),
    #[error("stage {to} cannot follow {from}")]
    StageOrder {
        from: PipelineStage,
        to: PipelineStage,
    },
    #[error("aborted before entering {0}")]
    Aborted(PipelineStage),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error(transparent)]
    Reshape(#[from] ReshapeError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error("database session: {0}")]
    Session(#[from] sqlx::Error),
    #[error("blob storage: {0:#}")]
    Storage(anyhow::Error),
}

impl PipelineError {
    pub fn classification(&self) -> &'static str {
        match self {
            PipelineError::AlreadyRunning(_) => "AlreadyRunning",
            PipelineError::StageOrder { .. } => "StageOrder",
            PipelineError::Aborted(_) => "Aborted",
            PipelineError::Fetch(err) => err.classification(),
            PipelineError::Normalization(err) => err.classification(),
            PipelineError::Reshape(ReshapeError::UnparsableLine { .. }) => "UnparsableLine",
            PipelineError::Reshape(ReshapeError::MissingLoadTemplate) => "MissingLoadTemplate",
            PipelineError::Reshape(ReshapeError::Csv(_)) => "CsvWriteFailed",
            PipelineError::Load(err) => err.classification(),
            PipelineError::Extraction(_) => "QueryFailed",
            PipelineError::View(err) => err.classification(),
            PipelineError::Session(_) => "SessionFailed",
            PipelineError::Storage(_) => "StorageFailed",
        }
    }

    /// Process exit code for the CLI; never zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Fetch(_) => 2,
            PipelineError::Normalization(_) => 3,
            PipelineError::Reshape(_) | PipelineError::Load(_) => 4,
            PipelineError::Extraction(_) => 5,
            PipelineError::View(_) => 6,
            _ => 1,
        }
    }
}

/// A run that stopped in `stage` because of `error`.
#[derive(Debug)]
pub struct RunFailure {
    pub stage: PipelineStage,
    pub error: PipelineError,
}

impl RunFailure {
    pub fn classification(&self) -> &'static str {
        self.error.classification()
    }

    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed at {} [{}]: {}",
            self.stage,
            self.classification(),
            self.error
        )
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub replace_policy: ReplacePolicy,
    pub outcome: RunOutcome,
    pub stage_reached: PipelineStage,
    pub failed_stage: Option<PipelineStage>,
    pub classification: Option<String>,
    pub error: Option<String>,
    pub source_reused: bool,
    pub source_sha256: Option<String>,
    pub source_encoding: Option<String>,
    pub encoding_substitutions: usize,
    pub staging_rows: BTreeMap<String, u64>,
    pub production_rows: BTreeMap<String, u64>,
    pub dropped_rows: BTreeMap<String, usize>,
    pub trusts: Option<usize>,
    pub stage_millis: BTreeMap<PipelineStage, u64>,
}

impl RunReport {
    fn new(ctx: &RunContext, policy: ReplacePolicy) -> Self {
        Self {
            run_id: ctx.run_id,
            date: ctx.date,
            started_at: Utc::now(),
            finished_at: None,
            replace_policy: policy,
            outcome: RunOutcome::Running,
            stage_reached: PipelineStage::Idle,
            failed_stage: None,
            classification: None,
            error: None,
            source_reused: false,
            source_sha256: None,
            source_encoding: None,
            encoding_substitutions: 0,
            staging_rows: BTreeMap::new(),
            production_rows: BTreeMap::new(),
            dropped_rows: BTreeMap::new(),
            trusts: None,
            stage_millis: BTreeMap::new(),
        }
    }

    pub fn total_dropped_rows(&self) -> usize {
        self.dropped_rows.values().sum()
    }
}

/// Result of fetching and normalizing the day's export.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub blob: StoredBlob,
    pub encoding: &'static str,
    pub substitutions: usize,
    pub attempts: usize,
}

async fn fetch_source(
    ctx: &RunContext,
    fetcher: &dyn SourceFetcher,
) -> Result<FetchedResponse, PipelineError> {
    let url = ctx.source_url();
    let response = fetcher.fetch(&url).await?;
    info!(
        url = %response.final_url,
        bytes = response.body.len(),
        attempts = response.attempts,
        "fetched source export"
    );
    Ok(response)
}

async fn normalize_and_store(
    ctx: &RunContext,
    normalizer: &EncodingNormalizer,
    store: &dyn BlobStore,
    raw: &[u8],
) -> Result<(StoredBlob, Normalized), PipelineError> {
    let normalized = normalizer.normalize(raw)?;
    let blob = store
        .put(&ctx.normalized_key(), normalized.text.as_bytes())
        .await
        .map_err(PipelineError::Storage)?;
    info!(
        key = %blob.key,
        encoding = normalized.encoding,
        substitutions = normalized.substitutions,
        "stored normalized export"
    );
    Ok((blob, normalized))
}

/// Fetch today's export and persist it re-encoded; touches no database.
pub async fn download(
    ctx: &RunContext,
    fetcher: &dyn SourceFetcher,
    normalizer: &EncodingNormalizer,
    store: &dyn BlobStore,
) -> Result<Downloaded, PipelineError> {
    let response = fetch_source(ctx, fetcher).await?;
    let (blob, normalized) = normalize_and_store(ctx, normalizer, store, &response.body).await?;
    Ok(Downloaded {
        blob,
        encoding: normalized.encoding,
        substitutions: normalized.substitutions,
        attempts: response.attempts,
    })
}

/// Staging inputs resolved before any staging table exists.
struct PreparedInputs {
    tables: Vec<StagingTableDef>,
    copies: Vec<(&'static str, PathBuf)>,
    load_commands: Vec<(&'static str, String)>,
}

fn source_file_error(path: &Path, source: io::Error) -> LoadError {
    LoadError::SourceFile {
        path: path.display().to_string(),
        source,
    }
}

async fn read_reference(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path)
        .await
        .map_err(|source| source_file_error(path, source))
}

fn csv_shape(table: &str, path: &Path, bytes: &[u8]) -> Result<StagingTableDef, LoadError> {
    staging_shape_from_csv(table, bytes).map_err(|err| source_file_error(path, io::Error::from(err)))
}

pub struct Pipeline<'a> {
    ctx: RunContext,
    fetcher: &'a dyn SourceFetcher,
    store: &'a dyn BlobStore,
    normalizer: EncodingNormalizer,
    policy: ReplacePolicy,
    lock_key: i64,
    abort: AbortSignal,
    stage: PipelineStage,
    stage_started: Instant,
    lock_held: bool,
    in_transaction: bool,
    report: RunReport,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        ctx: RunContext,
        fetcher: &'a dyn SourceFetcher,
        store: &'a dyn BlobStore,
        normalizer: EncodingNormalizer,
    ) -> Self {
        let policy = ReplacePolicy::default();
        let report = RunReport::new(&ctx, policy);
        Self {
            ctx,
            fetcher,
            store,
            normalizer,
            policy,
            lock_key: crate::config::DEFAULT_LOCK_KEY,
            abort: AbortSignal::new(),
            stage: PipelineStage::Idle,
            stage_started: Instant::now(),
            lock_held: false,
            in_transaction: false,
            report,
        }
    }

    pub fn with_policy(mut self, policy: ReplacePolicy) -> Self {
        self.policy = policy;
        self.report.replace_policy = policy;
        self
    }

    pub fn with_lock_key(mut self, key: i64) -> Self {
        self.lock_key = key;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Drive the run from `Idle` to `Done`. The report is written to the blob store either way.
    pub async fn run(mut self, db: &mut dyn Database) -> Result<RunReport, RunFailure> {
        let span = info_span!("populate", run_id = %self.ctx.run_id, date = %self.ctx.date);
        let outcome = self.run_stages(db).instrument(span.clone()).await;

        let result = match outcome {
            Ok(()) => {
                self.report.outcome = RunOutcome::Succeeded;
                Ok(())
            }
            Err(error) => {
                let stage = self.stage.next().unwrap_or(self.stage);
                error!(
                    parent: &span,
                    %stage,
                    classification = error.classification(),
                    %error,
                    "run failed"
                );
                self.release_after_failure(db).instrument(span.clone()).await;
                self.report.outcome = RunOutcome::Failed;
                self.report.failed_stage = Some(stage);
                self.report.classification = Some(error.classification().to_string());
                self.report.error = Some(error.to_string());
                Err(RunFailure { stage, error })
            }
        };

        self.report.stage_reached = self.stage;
        self.report.finished_at = Some(Utc::now());
        self.write_report().instrument(span).await;

        match result {
            Ok(()) => Ok(self.report),
            Err(failure) => Err(failure),
        }
    }

    async fn run_stages(&mut self, db: &mut dyn Database) -> Result<(), PipelineError> {
        let normalized_key = self.ctx.normalized_key();

        self.enter(PipelineStage::Fetching)?;
        let fetched = if self
            .store
            .exists(&normalized_key)
            .await
            .map_err(PipelineError::Storage)?
        {
            info!(key = %normalized_key, "reusing normalized export");
            self.report.source_reused = true;
            None
        } else {
            Some(fetch_source(&self.ctx, self.fetcher).await?)
        };
        self.complete(PipelineStage::Fetching);

        self.enter(PipelineStage::Normalizing)?;
        let source = match fetched {
            Some(response) => {
                let (blob, normalized) =
                    normalize_and_store(&self.ctx, &self.normalizer, self.store, &response.body)
                        .await?;
                self.report.source_encoding = Some(normalized.encoding.to_string());
                self.report.encoding_substitutions = normalized.substitutions;
                self.report.source_sha256 = Some(blob.content_hash);
                normalized.text.into_bytes()
            }
            None => {
                let bytes = self
                    .store
                    .get(&normalized_key)
                    .await
                    .map_err(PipelineError::Storage)?;
                self.report.source_sha256 = Some(LocalBlobStore::sha256_hex(&bytes));
                bytes
            }
        };
        self.complete(PipelineStage::Normalizing);

        self.enter(PipelineStage::StagingCreated)?;
        self.acquire_lock(db).await?;
        self.clear_leftovers(db).await?;
        let inputs = self.prepare_inputs(&source).await?;
        drop(source);
        StagingLoader::new(db).create_staging(&inputs.tables).await?;
        self.complete(PipelineStage::StagingCreated);

        self.enter(PipelineStage::StagingLoaded)?;
        let mut loader = StagingLoader::new(db);
        for (table, path) in &inputs.copies {
            let rows = loader.bulk_copy(table, path).await?;
            self.report.staging_rows.insert(table.to_string(), rows);
        }
        for (table, command) in &inputs.load_commands {
            let rows = loader.run_load_command(table, command).await?;
            self.report.staging_rows.insert(table.to_string(), rows);
        }
        self.complete(PipelineStage::StagingLoaded);

        self.enter(PipelineStage::ProductionCreated)?;
        if self.policy == ReplacePolicy::DropLate {
            db.begin().await?;
            self.in_transaction = true;
            TransformLoader::new(db).drop_production().await?;
        }
        let mut transform = TransformLoader::new(db);
        transform.ensure_extensions().await?;
        transform.create_production_schema().await?;
        self.complete(PipelineStage::ProductionCreated);

        self.enter(PipelineStage::ProductionPopulated)?;
        self.report.production_rows = TransformLoader::new(db).populate_from_staging().await?;
        self.complete(PipelineStage::ProductionPopulated);

        self.enter(PipelineStage::StagingDropped)?;
        StagingLoader::new(db).drop_staging().await?;
        self.complete(PipelineStage::StagingDropped);

        self.enter(PipelineStage::RelationshipsExtracted)?;
        self.report.trusts = Some(RelationshipExtractor::new(db).extract_trusts().await?);
        self.complete(PipelineStage::RelationshipsExtracted);

        self.enter(PipelineStage::ViewsCreated)?;
        ViewManager::new(db).create_views().await?;
        self.complete(PipelineStage::ViewsCreated);

        self.enter(PipelineStage::ViewsRefreshed)?;
        ViewManager::new(db).refresh_views().await?;
        if self.in_transaction {
            db.commit().await?;
            self.in_transaction = false;
            info!("committed production replacement");
        }
        self.complete(PipelineStage::ViewsRefreshed);

        if self.stage.next() != Some(PipelineStage::Done) {
            return Err(PipelineError::StageOrder {
                from: self.stage,
                to: PipelineStage::Done,
            });
        }
        db.advisory_unlock(self.lock_key).await?;
        self.lock_held = false;
        self.complete(PipelineStage::Done);
        Ok(())
    }

    /// Precondition check for moving to `to`; also the abort point.
    fn enter(&mut self, to: PipelineStage) -> Result<(), PipelineError> {
        if self.stage.next() != Some(to) {
            return Err(PipelineError::StageOrder {
                from: self.stage,
                to,
            });
        }
        if self.abort.is_raised() {
            return Err(PipelineError::Aborted(to));
        }
        self.stage_started = Instant::now();
        Ok(())
    }

    fn complete(&mut self, stage: PipelineStage) {
        let millis = self.stage_started.elapsed().as_millis() as u64;
        self.report.stage_millis.insert(stage, millis);
        self.stage = stage;
        info!(%stage, millis, "stage complete");
    }

    async fn acquire_lock(&mut self, db: &mut dyn Database) -> Result<(), PipelineError> {
        if !db.try_advisory_lock(self.lock_key).await? {
            return Err(PipelineError::AlreadyRunning(self.lock_key));
        }
        self.lock_held = true;
        Ok(())
    }

    /// Remove what a crashed run may have left behind.
    async fn clear_leftovers(&mut self, db: &mut dyn Database) -> Result<(), PipelineError> {
        StagingLoader::new(db).drop_staging().await?;
        if self.policy == ReplacePolicy::DropEarly {
            warn!("dropping production tables before staging is loaded");
            TransformLoader::new(db).drop_production().await?;
        }
        Ok(())
    }

    async fn prepare_inputs(&mut self, source: &[u8]) -> Result<PreparedInputs, PipelineError> {
        let schools_path = self
            .store
            .absolute_path(&self.ctx.normalized_key())
            .map_err(PipelineError::Storage)?;
        let mut tables = vec![csv_shape(SCHOOLS_RAW, &schools_path, source)?];
        let mut copies = vec![(SCHOOLS_RAW, schools_path)];

        let reference = self.ctx.reference.clone();
        for (table, path) in [
            (EMAIL_ADDRESSES_RAW, &reference.email_addresses),
            (DEPRIVATION_PUPIL_PREMIUM_RAW, &reference.pupil_premium),
        ] {
            let bytes = read_reference(path).await?;
            tables.push(csv_shape(table, path, &bytes)?);
            copies.push((table, path.clone()));
        }

        let mut load_commands = Vec::with_capacity(GeoDump::ALL.len());
        for dump in GeoDump::ALL {
            let path = reference.dump_path(dump);
            let raw = String::from_utf8(read_reference(path).await?).map_err(|err| {
                source_file_error(path, io::Error::new(io::ErrorKind::InvalidData, err))
            })?;

            let key = self.ctx.reshaped_key(dump);
            let destination = self
                .store
                .absolute_path(&key)
                .map_err(PipelineError::Storage)?;
            let reshaped = reshape(&raw, dump.header(), &destination)?;
            self.store
                .put(&key, &reshaped.csv)
                .await
                .map_err(PipelineError::Storage)?;

            self.report
                .dropped_rows
                .insert(dump.to_string(), reshaped.dropped_rows());
            tables.push(StagingTableDef::for_geo_dump(dump));
            load_commands.push((dump.staging_table(), reshaped.load_command));
        }

        Ok(PreparedInputs {
            tables,
            copies,
            load_commands,
        })
    }

    /// Best effort: a failure here is logged and the original error is what gets reported.
    async fn release_after_failure(&mut self, db: &mut dyn Database) {
        if self.in_transaction {
            if let Err(err) = db.rollback().await {
                warn!(error = %err, "rollback failed");
            }
            self.in_transaction = false;
        }
        if self.lock_held {
            if let Err(err) = StagingLoader::new(db).drop_staging().await {
                warn!(error = %err, "could not drop staging tables after failure");
            }
            if let Err(err) = db.advisory_unlock(self.lock_key).await {
                warn!(error = %err, "could not release run lock");
            }
            self.lock_held = false;
        }
    }

    async fn write_report(&self) {
        let key = self.ctx.report_key();
        let bytes = match serde_json::to_vec_pretty(&self.report) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "serializing run report");
                return;
            }
        };
        match self.store.put(&key, &bytes).await {
            Ok(blob) => info!(key = %blob.key, "wrote run report"),
            Err(err) => warn!(error = %format!("{err:#}"), "writing run report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use gias_core::{Trust, STAGING_TABLES};
    use gias_storage::StatusCode;
    use tempfile::TempDir;

    use crate::config::ReferenceRegistry;
    use crate::transform::drop_production_sql;

    const SCHOOLS_1252: &[u8] =
        b"URN,LA (code),EstablishmentName,Trusts (code),Trusts (name)\r\n100000,201,St Mary\x92s,5001,Bright Futures\r\n100001,202,Hill Top,,\r\n";

    const REGIONS_DUMP: &str = "COPY electoral_regions_raw (ogc_fid, eer13cd, eer13cdo, eer13nm, wkb_geometry) FROM stdin;\n\
1\tE15000001\t01\tNorth East\t0106000020346C0000\n\
2\tE15000002\t\\N\tNorth West\t0106000020346C0000\n\
3\tE15000003\ttruncated\n";

    const DISTRICTS_DUMP: &str = "COPY local_authority_districts_raw (ogc_fid, id, lad13cd, lad13cdo, lad13nm, lad13nmw, wkb_geometry) FROM stdin;\r\n\
1\t1\tE06000001\t00EB\tHartlepool\t\\N\t0106000020346C0000\r\n";

    struct FixtureFetcher {
        body: Option<Vec<u8>>,
        calls: AtomicUsize,
    }

    impl FixtureFetcher {
        fn serving(body: &[u8]) -> Self {
            Self {
                body: Some(body.to_vec()),
                calls: AtomicUsize::new(0),
            }
        }

        fn not_found() -> Self {
            Self {
                body: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceFetcher for FixtureFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.body {
                Some(body) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: url.to_string(),
                    body: body.clone(),
                    attempts: 1,
                }),
                None => Err(FetchError::ClientError {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingDatabase {
        statements: Vec<String>,
        lock_calls: usize,
        unlock_calls: usize,
        lock_taken_elsewhere: bool,
        fail_when: Option<&'static str>,
        abort_when: Option<(&'static str, AbortSignal)>,
        trust_rows: Vec<(Option<i32>, Option<String>)>,
        inserted: Vec<Trust>,
    }

    impl RecordingDatabase {
        fn position(&self, needle: &str) -> usize {
            self.statements
                .iter()
                .position(|s| s.contains(needle))
                .unwrap_or_else(|| panic!("no statement containing {needle:?}"))
        }

        fn ran(&self, needle: &str) -> bool {
            self.statements.iter().any(|s| s.contains(needle))
        }
    }

    #[async_trait]
    impl Database for RecordingDatabase {
        async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
            self.statements.push(sql.to_string());
            if let Some((needle, signal)) = &self.abort_when {
                if sql.contains(needle) {
                    signal.raise();
                }
            }
            match self.fail_when {
                Some(needle) if sql.contains(needle) => {
                    Err(sqlx::Error::Protocol(format!("injected failure on {needle}")))
                }
                _ => Ok(1),
            }
        }

        async fn try_advisory_lock(&mut self, _key: i64) -> Result<bool, sqlx::Error> {
            self.lock_calls += 1;
            Ok(!self.lock_taken_elsewhere)
        }

        async fn advisory_unlock(&mut self, _key: i64) -> Result<(), sqlx::Error> {
            self.unlock_calls += 1;
            Ok(())
        }

        async fn trust_pairs(
            &mut self,
        ) -> Result<Vec<(Option<i32>, Option<String>)>, sqlx::Error> {
            Ok(self.trust_rows.clone())
        }

        async fn insert_trusts(&mut self, trusts: &[Trust]) -> Result<u64, sqlx::Error> {
            self.inserted.extend_from_slice(trusts);
            Ok(trusts.len() as u64)
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: LocalBlobStore,
        ctx: RunContext,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let reference_dir = dir.path().join("reference");
            std::fs::create_dir_all(reference_dir.join("geo")).expect("reference dirs");
            std::fs::write(
                reference_dir.join("geo/import_electoral_regions.sql"),
                REGIONS_DUMP,
            )
            .expect("regions dump");
            std::fs::write(
                reference_dir.join("geo/import_local_authority_districts.sql"),
                DISTRICTS_DUMP,
            )
            .expect("districts dump");
            std::fs::write(
                reference_dir.join("email-addresses.csv"),
                "URN,Email\n100000,office@stmarys.example\n",
            )
            .expect("email csv");
            std::fs::write(
                reference_dir.join("pupil-premium.csv"),
                "URN,Pupils on roll,FSM6 pupils,Total allocation\n100000,250,40,\"53,000\"\n",
            )
            .expect("pupil premium csv");

            let reference = ReferenceRegistry::default()
                .resolve(&reference_dir)
                .expect("resolve reference");
            let ctx = RunContext::new(
                NaiveDate::from_ymd_opt(2026, 3, 9).expect("date"),
                "gias",
                "https://downloads.example/public",
                "edubasealldata",
                reference,
            );
            let store = LocalBlobStore::new(dir.path().join("storage"));
            Self {
                _dir: dir,
                store,
                ctx,
            }
        }

        fn pipeline<'a>(&'a self, fetcher: &'a FixtureFetcher) -> Pipeline<'a> {
            let ctx = RunContext {
                run_id: Uuid::new_v4(),
                ..self.ctx.clone()
            };
            Pipeline::new(ctx, fetcher, &self.store, EncodingNormalizer::windows_1252())
        }
    }

    fn trust_rows() -> Vec<(Option<i32>, Option<String>)> {
        vec![
            (Some(5001), Some("Bright Futures".to_string())),
            (Some(5001), Some("Bright Futures".to_string())),
        ]
    }

    #[tokio::test]
    async fn full_run_visits_every_stage_in_order() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let mut db = RecordingDatabase {
            trust_rows: trust_rows(),
            ..Default::default()
        };

        let report = fixture.pipeline(&fetcher).run(&mut db).await.expect("run");

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.stage_reached, PipelineStage::Done);
        assert_eq!(report.stage_millis.len(), 11);
        assert_eq!(report.trusts, Some(1));
        assert_eq!(report.dropped_rows.get("electoral_regions"), Some(&1));
        assert_eq!(report.dropped_rows.get("local_authority_districts"), Some(&0));
        assert_eq!(report.total_dropped_rows(), 1);
        assert_eq!(report.staging_rows.len(), STAGING_TABLES.len());
        assert_eq!(db.lock_calls, 1);
        assert_eq!(db.unlock_calls, 1);
        assert_eq!(
            db.inserted,
            vec![Trust {
                code: 5001,
                name: "Bright Futures".to_string()
            }]
        );

        let order = [
            "drop table if exists schools_raw",
            "create unlogged table \"schools_raw\"",
            "copy \"schools_raw\"",
            "COPY electoral_regions_raw",
            "begin",
            "drop table if exists schools, ",
            "create extension if not exists postgis",
            "create type gender",
            "create table schools (",
            "insert into schools ",
            "insert into local_authorities ",
            "create table trusts",
            "foreign key (trust_code, trust_name)",
            "create materialized view open_schools",
            "refresh materialized view open_schools",
            "commit",
        ];
        let positions = order.map(|needle| db.position(needle));
        assert!(
            positions.windows(2).all(|w| w[0] < w[1]),
            "statements out of order: {positions:?}"
        );
        assert_eq!(db.statements.last().map(String::as_str), Some("commit"));
    }

    #[tokio::test]
    async fn staging_columns_follow_the_source_header() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let mut db = RecordingDatabase::default();

        fixture.pipeline(&fetcher).run(&mut db).await.expect("run");

        let ddl = &db.statements[db.position("create unlogged table \"schools_raw\"")];
        assert!(ddl.contains(
            "(\"urn\" text, \"la_code\" text, \"establishment_name\" text, \"trusts_code\" text, \"trusts_name\" text)"
        ));
        let pupil_premium = &db.statements[db.position("create unlogged table \"deprivation_pupil_premium_raw\"")];
        assert!(pupil_premium.contains("\"fsm6_pupils\" text"));
    }

    #[tokio::test]
    async fn normalized_export_and_reshaped_dumps_land_in_the_store() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let mut db = RecordingDatabase::default();

        let report = fixture.pipeline(&fetcher).run(&mut db).await.expect("run");

        let normalized = fixture
            .store
            .get(&fixture.ctx.normalized_key())
            .await
            .expect("normalized export");
        let text = String::from_utf8(normalized).expect("utf-8");
        assert!(text.contains("St Mary\u{2019}s"));
        assert_eq!(report.source_encoding.as_deref(), Some("windows-1252"));
        assert_eq!(report.encoding_substitutions, 0);

        let regions = fixture
            .store
            .get(&fixture.ctx.reshaped_key(GeoDump::ElectoralRegions))
            .await
            .expect("regions csv");
        let rows = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(regions.as_slice())
            .records()
            .map(|r| r.expect("record").iter().map(str::to_string).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(
            rows,
            vec![
                vec!["ogc_fid", "eer13cd", "eer13cdo", "eer13nm", "wkb_geometry"],
                vec!["1", "E15000001", "01", "North East", "0106000020346C0000"],
                vec!["2", "E15000002", "\\N", "North West", "0106000020346C0000"],
            ]
        );

        let destination = fixture
            .store
            .absolute_path(&fixture.ctx.reshaped_key(GeoDump::ElectoralRegions))
            .expect("absolute path");
        let load = &db.statements[db.position("COPY electoral_regions_raw")];
        assert!(load.contains(&destination.display().to_string()));
        assert!(!load.contains("stdin;"));
        assert!(load.ends_with("null '\\N'"));

        let report_json = fixture
            .store
            .get(
                &RunContext {
                    run_id: report.run_id,
                    ..fixture.ctx.clone()
                }
                .report_key(),
            )
            .await
            .expect("run report");
        let value: serde_json::Value = serde_json::from_slice(&report_json).expect("json");
        assert_eq!(value["outcome"], "succeeded");
        assert_eq!(value["stage_reached"], "done");
        assert_eq!(value["replace_policy"], "drop-late");
    }

    #[tokio::test]
    async fn bulk_copy_failure_leaves_production_untouched() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let mut db = RecordingDatabase {
            fail_when: Some("copy \"email_addresses_raw\""),
            ..Default::default()
        };

        let failure = fixture
            .pipeline(&fetcher)
            .run(&mut db)
            .await
            .expect_err("copy failure");

        assert_eq!(failure.stage, PipelineStage::StagingLoaded);
        assert_eq!(failure.classification(), "BulkCopyFailed");
        assert_eq!(failure.exit_code(), 4);
        assert!(!db.ran(&drop_production_sql()));
        assert!(!db.ran("create table schools ("));
        assert!(!db.ran("begin"));
        assert_eq!(
            db.statements.last().map(String::as_str),
            Some(crate::staging::drop_staging_sql().as_str())
        );
        assert_eq!(db.unlock_calls, 1);
    }

    #[tokio::test]
    async fn coercion_failure_rolls_back_the_replacement() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let mut db = RecordingDatabase {
            fail_when: Some("insert into schools "),
            ..Default::default()
        };

        let failure = fixture
            .pipeline(&fetcher)
            .run(&mut db)
            .await
            .expect_err("coercion failure");

        assert_eq!(failure.stage, PipelineStage::ProductionPopulated);
        assert_eq!(failure.classification(), "TypeCoercionFailed");
        assert!(db.position("rollback") > db.position("insert into schools "));
        assert!(!db.ran("commit"));
        assert_eq!(db.unlock_calls, 1);
    }

    #[tokio::test]
    async fn not_found_fails_fetch_without_touching_the_database() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::not_found();
        let mut db = RecordingDatabase::default();

        let failure = fixture
            .pipeline(&fetcher)
            .run(&mut db)
            .await
            .expect_err("404");

        assert_eq!(failure.stage, PipelineStage::Fetching);
        assert_eq!(failure.classification(), "ClientError");
        assert_ne!(failure.exit_code(), 0);
        assert!(db.statements.is_empty());
        assert_eq!(db.lock_calls, 0);
        assert!(!fixture
            .store
            .exists(&fixture.ctx.normalized_key())
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn second_run_is_identical_and_reuses_the_export() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let regions_key = fixture.ctx.reshaped_key(GeoDump::ElectoralRegions);

        let mut first = RecordingDatabase {
            trust_rows: trust_rows(),
            ..Default::default()
        };
        let first_report = fixture.pipeline(&fetcher).run(&mut first).await.expect("first run");
        let first_csv = fixture.store.get(&regions_key).await.expect("regions csv");

        let mut second = RecordingDatabase {
            trust_rows: trust_rows(),
            ..Default::default()
        };
        let second_report = fixture
            .pipeline(&fetcher)
            .run(&mut second)
            .await
            .expect("second run");
        let second_csv = fixture.store.get(&regions_key).await.expect("regions csv");

        assert_eq!(first.statements, second.statements);
        assert_eq!(first.inserted, second.inserted);
        assert_eq!(first_csv, second_csv);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(second_report.source_reused);
        assert_eq!(first_report.source_sha256, second_report.source_sha256);
    }

    #[tokio::test]
    async fn concurrent_run_is_refused() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let mut db = RecordingDatabase {
            lock_taken_elsewhere: true,
            ..Default::default()
        };

        let failure = fixture
            .pipeline(&fetcher)
            .run(&mut db)
            .await
            .expect_err("lock held");

        assert!(matches!(failure.error, PipelineError::AlreadyRunning(_)));
        assert_eq!(failure.stage, PipelineStage::StagingCreated);
        assert!(db.statements.is_empty());
        assert_eq!(db.unlock_calls, 0);
    }

    #[test]
    fn repeated_raise_is_reported_to_every_clone() {
        let abort = AbortSignal::new();
        let handler = abort.clone();
        assert!(!handler.raise());
        assert!(abort.is_raised());
        assert!(handler.raise());
        assert!(abort.raise());
    }

    #[tokio::test]
    async fn abort_before_start_does_nothing() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let abort = AbortSignal::new();
        abort.raise();
        let mut db = RecordingDatabase::default();

        let failure = fixture
            .pipeline(&fetcher)
            .with_abort(abort)
            .run(&mut db)
            .await
            .expect_err("aborted");

        assert!(matches!(
            failure.error,
            PipelineError::Aborted(PipelineStage::Fetching)
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(db.statements.is_empty());
    }

    #[tokio::test]
    async fn abort_is_honoured_at_the_next_stage_boundary() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let abort = AbortSignal::new();
        let mut db = RecordingDatabase {
            abort_when: Some(("copy \"schools_raw\"", abort.clone())),
            ..Default::default()
        };

        let failure = fixture
            .pipeline(&fetcher)
            .with_abort(abort)
            .run(&mut db)
            .await
            .expect_err("aborted");

        assert!(matches!(
            failure.error,
            PipelineError::Aborted(PipelineStage::ProductionCreated)
        ));
        // The copy in flight and the rest of its stage still ran.
        assert!(db.ran("COPY local_authority_districts_raw"));
        assert!(!db.ran("begin"));
        assert!(!db.ran(&drop_production_sql()));
        assert_eq!(db.unlock_calls, 1);
    }

    #[tokio::test]
    async fn drop_early_clears_production_before_staging() {
        let fixture = Fixture::new();
        let fetcher = FixtureFetcher::serving(SCHOOLS_1252);
        let mut db = RecordingDatabase::default();

        fixture
            .pipeline(&fetcher)
            .with_policy(ReplacePolicy::DropEarly)
            .run(&mut db)
            .await
            .expect("run");

        assert!(db.position(&drop_production_sql()) < db.position("create unlogged table"));
        assert!(!db.ran("begin"));
        assert!(!db.ran("commit"));
    }

    #[test]
    fn exit_codes_follow_error_families() {
        let fetch = PipelineError::Fetch(FetchError::Timeout {
            url: "u".into(),
            attempts: 4,
        });
        assert_eq!(fetch.exit_code(), 2);
        assert_eq!(
            PipelineError::Normalization(NormalizationError::UnmappableEncoding {
                encoding: "windows-1252"
            })
            .exit_code(),
            3
        );
        assert_eq!(PipelineError::Reshape(ReshapeError::MissingLoadTemplate).exit_code(), 4);
        assert_eq!(PipelineError::AlreadyRunning(1).exit_code(), 1);

        let failure = RunFailure {
            stage: PipelineStage::Fetching,
            error: fetch,
        };
        assert!(failure.to_string().starts_with("failed at fetching [Timeout]"));
    }
}
