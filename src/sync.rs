//! The sync loop.
//!
//! Each [`FamilySync`] owns one index and the watermarks of the entity kinds
//! that feed it. A cycle moves through
//!
//! ```text
//! Idle → Extracting → Aggregating → Loading → Committing → Idle
//!            │             │            │           │
//!            └─────────────┴────────────┴───────────┴──▶ Error → Idle
//! ```
//!
//! Watermarks are written only in `Committing`, after every document of the
//! cycle was accepted by the index. A failure anywhere earlier leaves them
//! untouched, so the next cycle re-reads the same rows; the load is
//! idempotent, so re-delivery is harmless.
//!
//! [`SyncOrchestrator`] runs one task per family. Tasks never share
//! watermark keys, so a failing family does not hold back the others.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::elastic::ElasticClient;
use crate::error::SyncError;
use crate::extract::ChangeExtractor;
use crate::index::SearchIndex;
use crate::load::IndexLoader;
use crate::migrate;
use crate::models::{ChangeSet, SyncFamily};
use crate::retry::{with_timeout, RetryExecutor, RetryPolicy};
use crate::source::SourceStore;
use crate::source_postgres::PgSourceStore;
use crate::state::{self, format_timestamp, WatermarkStore};
use crate::transform::Aggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Idle,
    Extracting,
    Aggregating,
    Loading,
    Committing,
    Error,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Extracting => "extracting",
            CyclePhase::Aggregating => "aggregating",
            CyclePhase::Loading => "loading",
            CyclePhase::Committing => "committing",
            CyclePhase::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a committed cycle did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub family: SyncFamily,
    pub rows_seen: usize,
    pub affected: usize,
    pub documents: usize,
    pub loaded: usize,
    /// `(key, new watermark)` for every key that moved.
    pub committed: Vec<(String, DateTime<Utc>)>,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing changed since the watermarks; nothing was written.
    Idle,
    Committed(CycleReport),
    Failed { phase: CyclePhase, error: SyncError },
}

impl CycleOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CycleOutcome::Failed { .. })
    }
}

/// One family's extract → aggregate → load → commit pipeline.
pub struct FamilySync {
    family: SyncFamily,
    index_name: String,
    extractor: ChangeExtractor,
    aggregator: Aggregator,
    loader: IndexLoader,
    watermarks: WatermarkStore,
}

impl FamilySync {
    pub fn new(
        family: SyncFamily,
        index_name: impl Into<String>,
        extractor: ChangeExtractor,
        aggregator: Aggregator,
        loader: IndexLoader,
        watermarks: WatermarkStore,
    ) -> Self {
        Self {
            family,
            index_name: index_name.into(),
            extractor,
            aggregator,
            loader,
            watermarks,
        }
    }

    pub fn family(&self) -> SyncFamily {
        self.family
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        match self.try_cycle().await {
            Ok(outcome) => outcome,
            Err((phase, error)) => {
                error!(
                    family = %self.family,
                    phase = %phase,
                    error = %error,
                    "cycle failed, watermarks unchanged"
                );
                CycleOutcome::Failed { phase, error }
            }
        }
    }

    async fn try_cycle(&self) -> Result<CycleOutcome, (CyclePhase, SyncError)> {
        let family = self.family;
        let aggregate = family.aggregate();

        // Extracting
        self.enter(CyclePhase::Extracting);
        let mut change_sets: Vec<(String, ChangeSet)> = Vec::new();
        for &entity in family.tracked() {
            let key = family.watermark_key(entity);
            let since = self
                .watermarks
                .get(&key)
                .await
                .map_err(|e| (CyclePhase::Extracting, e))?;
            let change_set = self
                .extractor
                .detect_changes(aggregate, entity, since)
                .await
                .map_err(|e| (CyclePhase::Extracting, e))?;
            change_sets.push((key, change_set));
        }

        if change_sets.iter().all(|(_, cs)| cs.is_empty()) {
            debug!(family = %family, "no changes");
            self.enter(CyclePhase::Idle);
            return Ok(CycleOutcome::Idle);
        }

        let affected: BTreeSet<Uuid> = change_sets
            .iter()
            .flat_map(|(_, cs)| cs.affected_ids.iter().copied())
            .collect();
        let rows_seen: usize = change_sets.iter().map(|(_, cs)| cs.rows_seen).sum();

        // Aggregating
        self.enter(CyclePhase::Aggregating);
        let ids: Vec<Uuid> = affected.iter().copied().collect();
        let documents = self
            .aggregator
            .build_documents(family, &ids)
            .await
            .map_err(|e| (CyclePhase::Aggregating, e))?;
        let document_count = documents.len();

        // Loading
        self.enter(CyclePhase::Loading);
        let loaded = self
            .loader
            .load(documents, &self.index_name)
            .await
            .map_err(|e| (CyclePhase::Loading, e))?;
        if !loaded.is_clean() {
            let first = &loaded.failures[0];
            return Err((
                CyclePhase::Loading,
                SyncError::IndexRejected {
                    status: first.status,
                    message: format!(
                        "{} of {} documents rejected (first: {}: {})",
                        loaded.failed_count,
                        document_count,
                        first.id,
                        first.reason
                    ),
                },
            ));
        }

        // Committing
        self.enter(CyclePhase::Committing);
        let mut committed = Vec::new();
        for (key, change_set) in &change_sets {
            if change_set.is_empty() {
                continue;
            }
            let Some(ts) = change_set.new_watermark else {
                continue;
            };
            self.watermarks
                .set(key, ts)
                .await
                .map_err(|e| (CyclePhase::Committing, e))?;
            committed.push((key.clone(), ts));
        }

        let report = CycleReport {
            family,
            rows_seen,
            affected: affected.len(),
            documents: document_count,
            loaded: loaded.success_count,
            committed,
        };
        info!(
            family = %family,
            rows = report.rows_seen,
            affected = report.affected,
            loaded = report.loaded,
            watermarks = %report
                .committed
                .iter()
                .map(|(k, ts)| format!("{}={}", k, format_timestamp(*ts)))
                .collect::<Vec<_>>()
                .join(","),
            "cycle committed"
        );
        self.enter(CyclePhase::Idle);
        Ok(CycleOutcome::Committed(report))
    }

    fn enter(&self, phase: CyclePhase) {
        debug!(family = %self.family, phase = %phase, "phase");
    }
}

/// Drives every enabled family.
pub struct SyncOrchestrator {
    families: Vec<Arc<FamilySync>>,
    poll_interval: Duration,
}

impl SyncOrchestrator {
    pub fn new(families: Vec<FamilySync>, poll_interval: Duration) -> Self {
        Self {
            families: families.into_iter().map(Arc::new).collect(),
            poll_interval,
        }
    }

    /// Wire components for `families` from config and the given collaborators.
    pub fn build(
        config: &Config,
        families: &[SyncFamily],
        source: Arc<dyn SourceStore>,
        index: Arc<dyn SearchIndex>,
        watermarks: WatermarkStore,
    ) -> Self {
        let retry = RetryExecutor::new(RetryPolicy::from_config(&config.retry));
        let timeout = config.call_timeout();
        let extractor = ChangeExtractor::new(
            source.clone(),
            retry.clone(),
            config.sync.extract_limit,
            timeout,
        );
        let aggregator = Aggregator::new(source, retry.clone(), timeout);
        let loader = IndexLoader::new(index, retry, config.sync.load_batch_size, timeout);

        let syncs = families
            .iter()
            .map(|&family| {
                FamilySync::new(
                    family,
                    config.index_for(family).name.clone(),
                    extractor.clone(),
                    aggregator.clone(),
                    loader.clone(),
                    watermarks.clone(),
                )
            })
            .collect();
        Self::new(syncs, config.poll_interval())
    }

    /// One cycle of every family, concurrently.
    pub async fn run_once(&self) -> Vec<(SyncFamily, CycleOutcome)> {
        let mut set = JoinSet::new();
        for (slot, fam) in self.families.iter().enumerate() {
            let fam = Arc::clone(fam);
            set.spawn(async move { (slot, fam.family(), fam.run_cycle().await) });
        }

        let mut outcomes = Vec::with_capacity(self.families.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => error!(error = %e, "family task panicked"),
            }
        }
        outcomes.sort_by_key(|(slot, _, _)| *slot);
        outcomes
            .into_iter()
            .map(|(_, family, outcome)| (family, outcome))
            .collect()
    }

    /// Loop every family until `shutdown` turns true (or its sender is
    /// dropped). The flag is observed between cycles and during the pause,
    /// never mid-cycle.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut set = JoinSet::new();
        for fam in &self.families {
            let fam = Arc::clone(fam);
            let mut shutdown = shutdown.clone();
            let pause = self.poll_interval;
            set.spawn(async move {
                info!(family = %fam.family(), "sync loop started");
                let mut cycles = 0u64;
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    fam.run_cycle().await;
                    cycles += 1;

                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                info!(family = %fam.family(), cycles, "sync loop stopped");
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "family task panicked");
            }
        }
    }
}

/// Families selected for this run: the one named on the command line, or
/// every enabled family.
fn select_families(config: &Config, family: Option<&str>) -> Result<Vec<SyncFamily>> {
    match family {
        Some(name) => {
            let family = name
                .parse::<SyncFamily>()
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(vec![family])
        }
        None => config.enabled_families(),
    }
}

/// CLI entry point for `cinesync run`.
pub async fn run_sync(config: &Config, family: Option<&str>, once: bool) -> Result<()> {
    let families = select_families(config, family)?;
    let startup = RetryExecutor::new(
        RetryPolicy::from_config(&config.retry).with_max_attempts(config.retry.startup_attempts),
    );
    let timeout = config.call_timeout();

    let pool = db::connect_source(config)?;
    let source: Arc<dyn SourceStore> = Arc::new(PgSourceStore::new(pool));
    startup
        .run_sync(|| with_timeout(timeout, source.ping()))
        .await
        .context("Source database is unreachable")?;

    let index: Arc<dyn SearchIndex> = Arc::new(ElasticClient::new(&config.elasticsearch)?);
    startup
        .run_sync(|| with_timeout(timeout, index.ping()))
        .await
        .with_context(|| format!("Elasticsearch at {} is unreachable", config.elasticsearch.url))?;
    migrate::ensure_indices(config, &families, index.as_ref(), &startup).await?;

    let watermarks = WatermarkStore::new(state::open_state_store(config).await?);
    // Fail on an unreadable state backend now rather than in every cycle.
    watermarks
        .entries()
        .await
        .context("State store is unreadable")?;

    let orchestrator = SyncOrchestrator::build(config, &families, source, index, watermarks);
    let names: Vec<&str> = families.iter().map(|f| f.as_str()).collect();

    if once {
        info!(families = %names.join(","), "running a single cycle");
        let outcomes = orchestrator.run_once().await;
        let mut failed = 0;
        for (family, outcome) in &outcomes {
            match outcome {
                CycleOutcome::Idle => println!("{}: no changes", family),
                CycleOutcome::Committed(report) => println!(
                    "{}: {} rows, {} documents indexed",
                    family, report.rows_seen, report.loaded
                ),
                CycleOutcome::Failed { phase, error } => {
                    failed += 1;
                    println!("{}: failed while {}: {}", family, phase, error);
                }
            }
        }
        if failed > 0 {
            bail!("{} of {} families failed", failed, outcomes.len());
        }
        println!("ok");
        return Ok(());
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested, finishing current cycles");
        let _ = tx.send(true);
    });

    info!(
        families = %names.join(","),
        poll_interval_ms = config.poll_interval().as_millis() as u64,
        "sync started"
    );
    orchestrator.run(rx).await;
    info!("sync stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, only Ctrl-C will stop the loop");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FilmRecord;
    use crate::state::JsonFileStore;
    use crate::testing::{FlakyIndex, FlakySource};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.retry.initial_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.retry.max_attempts = 2;
        config.sync.poll_interval_secs = 0.01;
        config
    }

    fn setup(dir: &TempDir) -> (Arc<FlakySource>, Arc<FlakyIndex>, WatermarkStore) {
        let store = JsonFileStore::new(dir.path().join("state.json"));
        (
            Arc::new(FlakySource::new()),
            Arc::new(FlakyIndex::new()),
            WatermarkStore::new(Arc::new(store)),
        )
    }

    fn film(modified: DateTime<Utc>) -> FilmRecord {
        FilmRecord {
            title: Some("Solaris".into()),
            description: None,
            rating: Some(8.0),
            film_type: Some("movie".into()),
            modified,
        }
    }

    #[tokio::test]
    async fn empty_source_is_idle() {
        let dir = TempDir::new().unwrap();
        let (source, index, watermarks) = setup(&dir);
        let orch = SyncOrchestrator::build(&config(), &[SyncFamily::Movies], source, index, watermarks.clone());

        let outcomes = orch.run_once().await;
        assert!(matches!(outcomes[0].1, CycleOutcome::Idle));
        assert!(watermarks.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn committed_cycle_advances_watermark() {
        let dir = TempDir::new().unwrap();
        let (source, index, watermarks) = setup(&dir);
        source.upsert_film(Uuid::new_v4(), film(t(3)));
        let orch = SyncOrchestrator::build(&config(), &[SyncFamily::Movies], source, index.clone(), watermarks.clone());

        let outcomes = orch.run_once().await;
        match &outcomes[0].1 {
            CycleOutcome::Committed(report) => {
                assert_eq!(report.loaded, 1);
                assert_eq!(report.committed, vec![("movies.filmwork".to_string(), t(3))]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(watermarks.get("movies.filmwork").await.unwrap(), Some(t(3)));
        assert_eq!(index.count("movies").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejected_document_blocks_commit() {
        let dir = TempDir::new().unwrap();
        let (source, index, watermarks) = setup(&dir);
        let id = Uuid::new_v4();
        source.upsert_film(id, film(t(3)));
        index.reject_id(id.to_string());
        let orch = SyncOrchestrator::build(&config(), &[SyncFamily::Movies], source, index, watermarks.clone());

        let outcomes = orch.run_once().await;
        match &outcomes[0].1 {
            CycleOutcome::Failed { phase, .. } => assert_eq!(*phase, CyclePhase::Loading),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(watermarks.get("movies.filmwork").await.unwrap(), None);
    }

    #[tokio::test]
    async fn source_outage_fails_in_extracting() {
        let dir = TempDir::new().unwrap();
        let (source, index, watermarks) = setup(&dir);
        source.fail_next(100);
        let orch = SyncOrchestrator::build(&config(), &[SyncFamily::Genres], source, index, watermarks);

        let outcomes = orch.run_once().await;
        match &outcomes[0].1 {
            CycleOutcome::Failed { phase, error } => {
                assert_eq!(*phase, CyclePhase::Extracting);
                assert!(error.is_retryable());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (source, index, watermarks) = setup(&dir);
        source.upsert_film(Uuid::new_v4(), film(t(1)));
        let orch = SyncOrchestrator::build(
            &config(),
            &SyncFamily::ALL,
            source,
            index.clone(),
            watermarks,
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { orch.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(index.count("movies").await.unwrap(), 1);
    }

    #[test]
    fn unknown_family_is_rejected() {
        assert!(select_families(&Config::default(), Some("songs")).is_err());
        assert_eq!(
            select_families(&Config::default(), None).unwrap(),
            SyncFamily::ALL.to_vec()
        );
    }
}
