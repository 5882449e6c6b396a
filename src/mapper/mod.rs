//! Dataset repository mappers.
//!
//! A [`Mapper`] turns a [`QueryConfig`] into dataset matches from one external
//! repository. Mappers are stateless per call, report failures as
//! [`SourceError`] values and honor the deadline and cancellation carried by
//! their [`MapperContext`]; the hub never needs to know which repository it is
//! talking to.

pub mod pride;
pub mod proxi;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::Settings;
use crate::domain::MapperKind;
use crate::error::PatpatError;
use crate::http;
use crate::resolver::QueryConfig;
use crate::usi::Usi;

pub use pride::PrideMapper;
pub use proxi::ProxiMapper;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source timed out: {0}")]
    Timeout(String),
    #[error("source protocol error: {0}")]
    Protocol(String),
    #[error("cancelled")]
    Cancelled,
}

impl SourceError {
    /// Timeouts and cancellation end the whole query; anything else only
    /// loses the request that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Timeout(_) | SourceError::Cancelled)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Unavailable(_) => "unavailable",
            SourceError::Timeout(_) => "timeout",
            SourceError::Protocol(_) => "protocol",
            SourceError::Cancelled => "cancelled",
        }
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Upper bound for any single mapper call or probe budget.
pub const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-call budget handed to [`Mapper::query`].
#[derive(Debug, Clone)]
pub struct MapperContext {
    deadline: Instant,
    cancel: CancelToken,
}

impl MapperContext {
    pub fn new(timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            deadline: Instant::now() + timeout.min(MAX_CALL_TIMEOUT),
            cancel,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails once the call was cancelled or ran out of time.
    pub fn check(&self) -> Result<(), SourceError> {
        if self.cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        if self.remaining().is_zero() {
            return Err(SourceError::Timeout("deadline exceeded".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchBasis {
    #[serde(rename = "protein")]
    Protein,
    #[serde(rename = "peptide")]
    Peptide,
    #[serde(rename = "protein+peptide")]
    ProteinAndPeptide,
}

/// One dataset matched by one source, normalized across repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperResult {
    pub source: String,
    pub dataset_id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub website: String,
    pub species: Vec<String>,
    pub match_basis: MatchBasis,
    pub protein_usis: Vec<String>,
    pub peptide_usis: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MapperResult {
    pub fn key(&self) -> (&str, &str) {
        (&self.source, &self.dataset_id)
    }
}

pub trait Mapper: Send + Sync {
    /// Stable source name, also used as the status summary key.
    fn name(&self) -> &str;

    /// Overrides the hub's default per-call timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Lightweight reachability check bounded by `timeout`.
    fn probe(&self, _timeout: Duration) -> Result<(), SourceError> {
        Ok(())
    }

    fn query(
        &self,
        config: &QueryConfig,
        ctx: &MapperContext,
    ) -> Result<Vec<MapperResult>, SourceError>;
}

/// Builds the mappers for `kinds` in order, skipping repeated kinds.
pub fn build_mappers(
    kinds: &[MapperKind],
    settings: &Settings,
) -> Result<Vec<Arc<dyn Mapper>>, PatpatError> {
    let mut seen = Vec::new();
    let mut mappers: Vec<Arc<dyn Mapper>> = Vec::new();
    for kind in kinds {
        if seen.contains(kind) {
            continue;
        }
        seen.push(*kind);
        let mapper: Arc<dyn Mapper> = match kind {
            MapperKind::Pride => Arc::new(PrideMapper::new(settings.max_pages)?),
            MapperKind::Iprox => Arc::new(ProxiMapper::iprox(settings.max_pages)?),
            MapperKind::Massive => Arc::new(ProxiMapper::massive(settings.max_pages)?),
        };
        mappers.push(mapper);
    }
    Ok(mappers)
}

pub fn dataset_website(dataset: &str) -> String {
    format!("http://proteomecentral.proteomexchange.org/cgi/GetDataset?ID={dataset}")
}

/// USIs of one dataset, split by the level at which they were found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetEvidence {
    pub protein: Vec<String>,
    pub peptides: Vec<String>,
}

impl DatasetEvidence {
    pub fn match_basis(&self) -> MatchBasis {
        match (self.protein.is_empty(), self.peptides.is_empty()) {
            (false, false) => MatchBasis::ProteinAndPeptide,
            (false, true) => MatchBasis::Protein,
            _ => MatchBasis::Peptide,
        }
    }
}

/// Groups USIs by dataset collection. The map is ordered by dataset id so
/// repeated runs produce the same sequence.
pub fn group_by_dataset(
    protein_level: Vec<Usi>,
    peptide_level: Vec<Usi>,
) -> BTreeMap<String, DatasetEvidence> {
    let mut grouped: BTreeMap<String, DatasetEvidence> = BTreeMap::new();
    for usi in protein_level {
        let evidence = grouped.entry(usi.collection().to_string()).or_default();
        if !evidence.protein.iter().any(|known| known == usi.as_str()) {
            evidence.protein.push(usi.to_string());
        }
    }
    for usi in peptide_level {
        let evidence = grouped.entry(usi.collection().to_string()).or_default();
        if !evidence.peptides.iter().any(|known| known == usi.as_str()) {
            evidence.peptides.push(usi.to_string());
        }
    }
    grouped
}

/// Well-known tryptic peptide used for reachability probes.
pub const PROBE_PEPTIDE: &str = "TCVADESAENCDK";

pub(crate) fn build_source_client() -> Result<Client, PatpatError> {
    http::build_client(Duration::from_secs(60))
        .map_err(|err| PatpatError::HttpClient(err.to_string()))
}

/// Single request, no retries; the checker decides how often to ask.
pub(crate) fn probe_endpoint(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
    timeout: Duration,
) -> Result<(), SourceError> {
    let response = client
        .get(url)
        .query(query)
        .timeout(timeout)
        .send()
        .map_err(classify_error)?;
    let status = response.status().as_u16();
    if response.status().is_success() || status == 404 {
        Ok(())
    } else {
        Err(classify_status(status, url))
    }
}

/// GETs a JSON document within the context's budget. `Ok(None)` means the
/// source answered 404, which repositories use for "no match".
pub(crate) fn get_json(
    client: &Client,
    url: &str,
    query: &[(&str, String)],
    ctx: &MapperContext,
) -> Result<Option<Value>, SourceError> {
    ctx.check()?;
    tracing::debug!(%url, ?query, "source request");
    let response = http::send_with_retries(
        || client.get(url).query(query).timeout(ctx.remaining()),
        || ctx.check().is_ok(),
    )
    .map_err(classify_error)?;

    let status = response.status().as_u16();
    if status == 404 {
        return Ok(None);
    }
    if !response.status().is_success() {
        return Err(classify_status(status, url));
    }
    response
        .json::<Value>()
        .map(Some)
        .map_err(|err| SourceError::Protocol(format!("{url}: {err}")))
}

pub(crate) fn classify_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        SourceError::Unavailable(err.to_string())
    } else {
        SourceError::Protocol(err.to_string())
    }
}

pub(crate) fn classify_status(status: u16, url: &str) -> SourceError {
    if http::is_retryable_status(status) || status >= 500 {
        SourceError::Unavailable(format!("{url} returned status {status}"))
    } else {
        SourceError::Protocol(format!("{url} returned status {status}"))
    }
}

pub(crate) fn panic_detail(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

pub(crate) fn json_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
