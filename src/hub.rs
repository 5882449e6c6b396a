//! Fan-out of one [`QueryConfig`] over every configured mapper, followed by
//! deterministic aggregation and export under `result/<task>/`.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::checker::ExcludedSource;
use crate::domain::TaskId;
use crate::error::PatpatError;
use crate::mapper::{
    CancelToken, MAX_CALL_TIMEOUT, Mapper, MapperContext, MapperResult, SourceError, panic_detail,
};
use crate::resolver::QueryConfig;
use crate::store::{Store, TaskLock, TaskRecord};

pub const RESULT_FILE: &str = "result.json";
pub const CONFIG_FILE: &str = "config.json";
pub const STATUS_FILE: &str = "status.json";
pub const TSV_FILE: &str = "result.tsv";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Created,
    Mapping,
    Aggregated,
    Exported,
    Failed,
}

impl HubState {
    pub fn as_str(self) -> &'static str {
        match self {
            HubState::Created => "created",
            HubState::Mapping => "mapping",
            HubState::Aggregated => "aggregated",
            HubState::Exported => "exported",
            HubState::Failed => "failed",
        }
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `status.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    /// `succeeded`, `failed:<kind>` or `excluded`.
    pub status: String,
    pub message: Option<String>,
    pub records: usize,
    pub elapsed_ms: u64,
}

impl SourceReport {
    pub fn succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

/// Contents of `result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub task: TaskId,
    pub identifier: String,
    pub all_failed: bool,
    pub records: Vec<MapperResult>,
}

type Outcome = (usize, Result<Vec<MapperResult>, SourceError>, Duration);

pub struct MapperHub {
    store: Store,
    config: Arc<QueryConfig>,
    mappers: Vec<Arc<dyn Mapper>>,
    excluded: Vec<ExcludedSource>,
    timeout: Duration,
    cancel: CancelToken,
    state: HubState,
    prior: Vec<MapperResult>,
    results: Vec<MapperResult>,
    reports: Vec<SourceReport>,
    started_at: String,
    finished_at: Option<String>,
    _lock: TaskLock,
}

impl fmt::Debug for MapperHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapperHub")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("mappers", &self.mappers.len())
            .field("excluded", &self.excluded)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .field("finished_at", &self.finished_at)
            .finish_non_exhaustive()
    }
}

impl MapperHub {
    /// Takes ownership of `result/<task>/` for the hub's lifetime. Records
    /// exported by an earlier run of the same task are carried forward.
    pub fn open(
        store: Store,
        config: QueryConfig,
        mappers: Vec<Arc<dyn Mapper>>,
    ) -> Result<Self, PatpatError> {
        if mappers.is_empty() {
            return Err(PatpatError::NoMappers);
        }
        let mut names = HashSet::new();
        let mappers: Vec<Arc<dyn Mapper>> = mappers
            .into_iter()
            .filter(|mapper| {
                let fresh = names.insert(mapper.name().to_string());
                if !fresh {
                    tracing::warn!(source = mapper.name(), "duplicate mapper dropped");
                }
                fresh
            })
            .collect();

        let task = config.task;
        let lock = store.claim_task(&task)?;

        let result_path = store.result_dir(&task).join(RESULT_FILE);
        let prior = if result_path.as_std_path().is_file() {
            let previous: AggregatedResult = Store::read_json(&result_path)?;
            tracing::info!(%task, records = previous.records.len(), "resuming task with prior results");
            previous.records
        } else {
            Vec::new()
        };

        let hub = Self {
            store,
            config: Arc::new(config),
            mappers,
            excluded: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            cancel: CancelToken::new(),
            state: HubState::Created,
            prior,
            results: Vec::new(),
            reports: Vec::new(),
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            _lock: lock,
        };
        hub.write_task_record()?;
        Ok(hub)
    }

    /// Sources the availability check left out. They are reported as
    /// `excluded` and never queried.
    pub fn with_excluded(mut self, excluded: Vec<ExcludedSource>) -> Self {
        self.excluded = excluded;
        self
    }

    /// Default per-call bound for mappers that do not set their own.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shares an externally owned cancellation flag, e.g. one set by Ctrl-C.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn task(&self) -> TaskId {
        self.config.task
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn state(&self) -> HubState {
        self.state
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn results(&self) -> &[MapperResult] {
        &self.results
    }

    pub fn statuses(&self) -> &[SourceReport] {
        &self.reports
    }

    pub fn mapping(&mut self) -> Result<(), PatpatError> {
        if self.state != HubState::Created {
            return Err(PatpatError::InvalidState {
                expected: HubState::Created.as_str(),
                actual: self.state.as_str(),
            });
        }
        self.state = HubState::Mapping;
        let task = self.task();
        tracing::info!(%task, sources = self.mappers.len(), "phase=Mapping; dispatching");

        let outcomes = self.dispatch()?;

        let mut reports = Vec::with_capacity(self.mappers.len() + self.excluded.len());
        let mut collected = Vec::with_capacity(self.mappers.len());
        for (mapper, (outcome, elapsed)) in self.mappers.iter().zip(outcomes) {
            let elapsed_ms = elapsed.as_millis() as u64;
            match outcome {
                Ok(records) => {
                    tracing::info!(source = mapper.name(), records = records.len(), elapsed_ms, "source succeeded");
                    reports.push(SourceReport {
                        source: mapper.name().to_string(),
                        status: "succeeded".to_string(),
                        message: None,
                        records: records.len(),
                        elapsed_ms,
                    });
                    collected.push(records);
                }
                Err(err) => {
                    tracing::warn!(source = mapper.name(), error = %err, elapsed_ms, "source failed");
                    reports.push(SourceReport {
                        source: mapper.name().to_string(),
                        status: format!("failed:{}", err.kind()),
                        message: Some(err.to_string()),
                        records: 0,
                        elapsed_ms,
                    });
                }
            }
        }
        for excluded in &self.excluded {
            reports.push(SourceReport {
                source: excluded.name.clone(),
                status: "excluded".to_string(),
                message: Some(excluded.reason.clone()),
                records: 0,
                elapsed_ms: 0,
            });
        }
        self.reports = reports;

        if collected.is_empty() {
            self.state = HubState::Failed;
            self.results.clear();
            tracing::error!(%task, "phase=Mapping; every source failed");
            return Err(PatpatError::AllSourcesFailed { task });
        }

        self.results = aggregate(&self.prior, collected);
        self.state = HubState::Aggregated;
        tracing::info!(%task, records = self.results.len(), "phase=Aggregated");
        Ok(())
    }

    /// Runs every mapper on its own thread and waits for all of them, each
    /// bounded by its own deadline. Outcomes come back in registration order.
    fn dispatch(&mut self) -> Result<Vec<(Result<Vec<MapperResult>, SourceError>, Duration)>, PatpatError> {
        let (tx, rx) = mpsc::channel::<Outcome>();
        let start = Instant::now();
        let mut deadlines = Vec::with_capacity(self.mappers.len());

        for (index, mapper) in self.mappers.iter().enumerate() {
            let timeout = mapper.timeout().unwrap_or(self.timeout).min(MAX_CALL_TIMEOUT);
            deadlines.push(start + timeout);
            let ctx = MapperContext::new(timeout, self.cancel.clone());
            let mapper = Arc::clone(mapper);
            let config = Arc::clone(&self.config);
            let tx = tx.clone();
            thread::spawn(move || {
                let began = Instant::now();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| mapper.query(&config, &ctx)))
                    .unwrap_or_else(|payload| {
                        Err(SourceError::Protocol(format!(
                            "mapper panicked: {}",
                            panic_detail(&*payload)
                        )))
                    });
                let _ = tx.send((index, outcome, began.elapsed()));
            });
        }
        drop(tx);

        let mut outcomes: Vec<Option<(Result<Vec<MapperResult>, SourceError>, Duration)>> =
            (0..self.mappers.len()).map(|_| None).collect();
        loop {
            if self.cancel.is_cancelled() {
                let task = self.task();
                tracing::warn!(%task, "phase=Mapping; cancelled");
                return Err(PatpatError::Cancelled { task });
            }

            let now = Instant::now();
            for (slot, deadline) in outcomes.iter_mut().zip(&deadlines) {
                if slot.is_none() && now >= *deadline {
                    *slot = Some((
                        Err(SourceError::Timeout("no answer before the deadline".to_string())),
                        now - start,
                    ));
                }
            }
            if outcomes.iter().all(Option::is_some) {
                break;
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok((index, outcome, elapsed)) => {
                    // A result arriving after its deadline was already recorded as a timeout.
                    if outcomes[index].is_none() {
                        outcomes[index] = Some((outcome, elapsed));
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    for slot in outcomes.iter_mut().filter(|slot| slot.is_none()) {
                        *slot = Some((
                            Err(SourceError::Protocol("mapper exited without a result".to_string())),
                            start.elapsed(),
                        ));
                    }
                }
            }
        }
        Ok(outcomes.into_iter().flatten().collect())
    }

    /// Writes the task directory. Once exported, further calls return the same
    /// path without touching the files.
    pub fn export(&mut self) -> Result<Utf8PathBuf, PatpatError> {
        match self.state {
            HubState::Exported => return Ok(self.store.result_dir(&self.task())),
            HubState::Aggregated | HubState::Failed => {}
            other => {
                return Err(PatpatError::InvalidState {
                    expected: HubState::Aggregated.as_str(),
                    actual: other.as_str(),
                });
            }
        }
        let task = self.task();
        let dir = self.store.result_dir(&task);
        let all_failed = self.state == HubState::Failed;
        // A failed resume keeps what earlier runs of the task found.
        let aggregated = AggregatedResult {
            task,
            identifier: self.config.identifier.to_string(),
            all_failed,
            records: if all_failed {
                self.prior.clone()
            } else {
                self.results.clone()
            },
        };

        Store::write_json_atomic(&dir.join(RESULT_FILE), &aggregated)?;
        Store::write_json_atomic(&dir.join(CONFIG_FILE), self.config.as_ref())?;
        Store::write_json_atomic(&dir.join(STATUS_FILE), &self.reports)?;
        Store::write_bytes_atomic(&dir.join(TSV_FILE), render_tsv(&aggregated.records).as_bytes())?;

        if self.finished_at.is_none() {
            self.finished_at = Some(chrono::Utc::now().to_rfc3339());
        }
        if !all_failed {
            self.state = HubState::Exported;
        }
        self.write_task_record()?;
        tracing::info!(%task, path = %dir, state = %self.state, "phase=Export; results written");
        Ok(dir)
    }

    fn write_task_record(&self) -> Result<(), PatpatError> {
        let record = TaskRecord {
            task: self.task(),
            identifier: self.config.identifier.to_string(),
            state: self.state.as_str().to_string(),
            mappers: self.mappers.iter().map(|m| m.name().to_string()).collect(),
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
        };
        Store::write_json_atomic(&self.store.task_record_path(&self.task()), &record)
    }
}

/// Prior records first, then each source's records in registration order.
/// The first record seen for a `(source, dataset_id)` pair wins.
pub fn aggregate(prior: &[MapperResult], sources: Vec<Vec<MapperResult>>) -> Vec<MapperResult> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut merged = Vec::new();
    let candidates = prior.iter().cloned().chain(sources.into_iter().flatten());
    for record in candidates {
        if seen.insert((record.source.clone(), record.dataset_id.clone())) {
            merged.push(record);
        }
    }
    merged
}

pub fn render_tsv(records: &[MapperResult]) -> String {
    let mut out = String::from("title\tsummary\twebsite\n");
    for record in records {
        out.push_str(&format!(
            "{}\t{}\t{}\n",
            tsv_field(record.title.as_deref()),
            tsv_field(record.summary.as_deref()),
            tsv_field(Some(&record.website)),
        ));
    }
    out
}

fn tsv_field(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .chars()
        .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
        .collect()
}
