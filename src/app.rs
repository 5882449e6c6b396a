use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::cache::{Confirm, SequenceCache};
use crate::catalog::{OrganismKey, ProteomeCatalog, ProteomeEntry};
use crate::checker::{AvailabilityChecker, ExcludedSource};
use crate::config::Settings;
use crate::domain::{Identifier, TaskId};
use crate::error::PatpatError;
use crate::hub::{AggregatedResult, MapperHub, RESULT_FILE, STATUS_FILE, SourceReport};
use crate::mapper::{CancelToken, Mapper, MapperResult};
use crate::resolver::{QueryConfig, QueryResolver};
use crate::store::{Store, TaskRecord};
use crate::uniprot::UniprotClient;

#[derive(Debug, Clone, Serialize)]
pub struct InitResult {
    pub root: String,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogResult {
    pub proteomes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrganismResult {
    pub entry: ProteomeEntry,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub available: Vec<String>,
    pub excluded: Vec<ExcludedSource>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapResult {
    pub task: TaskId,
    pub identifier: String,
    pub organism: String,
    pub proteome: String,
    pub peptides: usize,
    pub state: String,
    pub result_dir: String,
    pub records: Vec<MapperResult>,
    pub statuses: Vec<SourceReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TasksResult {
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShowResult {
    pub task: TaskRecord,
    pub result: Option<AggregatedResult>,
    pub statuses: Vec<SourceReport>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MapOptions {
    pub skip_check: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn report(sink: &dyn ProgressSink, message: impl Into<String>) {
    sink.event(ProgressEvent {
        message: message.into(),
        elapsed: None,
    });
}

/// Composition root for the command line: one store, one UniProt client and
/// the catalog and cache built on top of them.
pub struct App {
    store: Store,
    settings: Settings,
    catalog: Arc<ProteomeCatalog>,
    resolver: QueryResolver,
    cancel: CancelToken,
}

impl App {
    pub fn new(store: Store, settings: Settings, uniprot: Arc<dyn UniprotClient>) -> Self {
        let catalog = Arc::new(ProteomeCatalog::new(store.clone(), Arc::clone(&uniprot)));
        let cache = Arc::new(SequenceCache::new(store.clone(), Arc::clone(&uniprot)));
        let resolver = QueryResolver::new(uniprot, Arc::clone(&catalog), cache, &settings);
        Self {
            store,
            settings,
            catalog,
            resolver,
            cancel: CancelToken::default(),
        }
    }

    /// Mapping runs observe `cancel`, so a signal handler holding a clone
    /// can stop them.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn init(&self, sink: &dyn ProgressSink) -> Result<InitResult, PatpatError> {
        let created = !self.store.is_initialized();
        self.store.init()?;
        report(sink, format!("phase=Init; environment ready at {}", self.store.root()));
        Ok(InitResult {
            root: self.store.root().to_string(),
            created,
        })
    }

    pub fn refresh_catalog(&self, sink: &dyn ProgressSink) -> Result<CatalogResult, PatpatError> {
        self.store.init()?;
        report(sink, "phase=Catalog; downloading reference proteome index");
        self.catalog.refresh_catalog()?;
        let proteomes = self.catalog.rows()?.len();
        report(sink, format!("phase=Catalog; {proteomes} reference proteomes indexed"));
        Ok(CatalogResult { proteomes })
    }

    pub fn show_organism(
        &self,
        key: &OrganismKey,
        sink: &dyn ProgressSink,
    ) -> Result<OrganismResult, PatpatError> {
        report(sink, "phase=Catalog; looking up organism");
        let entry = self.catalog.resolve(key)?;
        let cached = entry.local_path.is_some();
        Ok(OrganismResult { entry, cached })
    }

    pub fn resolve(
        &self,
        identifier: &Identifier,
        task: Option<TaskId>,
        confirm: &dyn Confirm,
        sink: &dyn ProgressSink,
    ) -> Result<QueryConfig, PatpatError> {
        self.store.init()?;
        report(sink, format!("phase=Resolve; {identifier}"));
        let config = self.resolver.resolve(identifier, task, confirm)?;
        report(
            sink,
            format!(
                "phase=Resolve; {} in {} ({}), {} unique peptides",
                config.identifier,
                config.organism.name,
                config.proteome,
                config.peptides.len()
            ),
        );
        Ok(config)
    }

    pub fn check(&self, mappers: &[Arc<dyn Mapper>], sink: &dyn ProgressSink) -> CheckResult {
        report(sink, "phase=Check; probing sources");
        let availability = AvailabilityChecker::from_settings(&self.settings).probe(mappers);
        CheckResult {
            available: availability.available_names(),
            excluded: availability.excluded,
        }
    }

    /// Resolves `identifier`, queries every reachable source and exports the
    /// task. A run where every source failed is still exported before the
    /// error is returned.
    pub fn map(
        &self,
        identifier: &Identifier,
        task: Option<TaskId>,
        mappers: Vec<Arc<dyn Mapper>>,
        confirm: &dyn Confirm,
        options: MapOptions,
        sink: &dyn ProgressSink,
    ) -> Result<MapResult, PatpatError> {
        if mappers.is_empty() {
            return Err(PatpatError::NoMappers);
        }
        let config = self.resolve(identifier, task, confirm, sink)?;
        let task = config.task;

        let (available, excluded) = if options.skip_check {
            (mappers, Vec::new())
        } else {
            report(sink, "phase=Check; probing sources");
            let availability = AvailabilityChecker::from_settings(&self.settings).probe(&mappers);
            (availability.available, availability.excluded)
        };
        if available.is_empty() {
            tracing::error!(%task, "no source passed the availability check");
            return Err(PatpatError::AllSourcesFailed { task });
        }

        let mut hub = MapperHub::open(self.store.clone(), config, available)?
            .with_excluded(excluded)
            .with_timeout(self.settings.mapper_timeout)
            .with_cancel_token(self.cancel.clone());

        report(sink, format!("phase=Mapping; task {task}"));
        let outcome = hub.mapping();
        if let Err(PatpatError::AllSourcesFailed { .. }) = &outcome {
            hub.export()?;
        }
        outcome?;

        let result_dir = hub.export()?;
        report(
            sink,
            format!("phase=Export; {} records written to {result_dir}", hub.results().len()),
        );
        let config = hub.config();
        Ok(MapResult {
            task,
            identifier: config.identifier.to_string(),
            organism: config.organism.name.clone(),
            proteome: config.proteome.to_string(),
            peptides: config.peptides.len(),
            state: hub.state().as_str().to_string(),
            result_dir: result_dir.to_string(),
            records: hub.results().to_vec(),
            statuses: hub.statuses().to_vec(),
        })
    }

    pub fn tasks(&self) -> Result<TasksResult, PatpatError> {
        Ok(TasksResult {
            tasks: self.store.list_tasks()?,
        })
    }

    pub fn show(&self, task: &TaskId) -> Result<ShowResult, PatpatError> {
        let record_path = self.store.task_record_path(task);
        if !record_path.as_std_path().is_file() {
            return Err(PatpatError::TaskNotFound(task.to_string()));
        }
        let record: TaskRecord = Store::read_json(&record_path)?;
        let dir = self.store.result_dir(task);
        let result = read_optional::<AggregatedResult>(dir.join(RESULT_FILE))?;
        let statuses = read_optional::<Vec<SourceReport>>(dir.join(STATUS_FILE))?.unwrap_or_default();
        Ok(ShowResult {
            task: record,
            result,
            statuses,
        })
    }
}

fn read_optional<T: serde::de::DeserializeOwned>(
    path: Utf8PathBuf,
) -> Result<Option<T>, PatpatError> {
    if path.as_std_path().is_file() {
        Store::read_json(&path).map(Some)
    } else {
        Ok(None)
    }
}
