use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::catalog::ProteomeEntry;
use crate::domain::ProteomeAccession;
use crate::error::PatpatError;
use crate::store::Store;
use crate::uniprot::UniprotClient;

const FILE_PREFIX: &str = "uniprot-proteome_";
const FILE_SUFFIX: &str = ".fasta";

/// Decision point consulted before a proteome download. The cache never talks
/// to a terminal itself.
pub trait Confirm: Send + Sync {
    fn confirm(&self, entry: &ProteomeEntry) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&ProteomeEntry) -> bool + Send + Sync,
{
    fn confirm(&self, entry: &ProteomeEntry) -> bool {
        self(entry)
    }
}

/// Non-interactive answers, typically from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmPolicy {
    Accept,
    Reject,
}

impl Confirm for ConfirmPolicy {
    fn confirm(&self, _entry: &ProteomeEntry) -> bool {
        matches!(self, ConfirmPolicy::Accept)
    }
}

/// On-disk store of reference proteome FASTA files, one file per accession.
pub struct SequenceCache {
    store: Store,
    client: Arc<dyn UniprotClient>,
    inflight: Mutex<HashMap<ProteomeAccession, Arc<Mutex<()>>>>,
}

impl SequenceCache {
    pub fn new(store: Store, client: Arc<dyn UniprotClient>) -> Self {
        Self {
            store,
            client,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn has(&self, proteome: &ProteomeAccession) -> Result<bool, PatpatError> {
        Ok(self.path(proteome)?.is_some())
    }

    pub fn path(&self, proteome: &ProteomeAccession) -> Result<Option<Utf8PathBuf>, PatpatError> {
        find_cached(&self.store.proteome_dir(), proteome)
    }

    /// Returns the cached FASTA for `entry`, downloading it first if absent and
    /// `confirm` agrees. Concurrent callers for the same accession share one
    /// download.
    pub fn fetch(
        &self,
        entry: &ProteomeEntry,
        confirm: &dyn Confirm,
    ) -> Result<Utf8PathBuf, PatpatError> {
        if let Some(path) = self.path(&entry.proteome)? {
            return Ok(path);
        }
        let slot = self.slot(&entry.proteome)?;
        let _guard = slot
            .lock()
            .map_err(|_| PatpatError::Filesystem("proteome download lock poisoned".to_string()))?;

        if let Some(path) = self.path(&entry.proteome)? {
            tracing::debug!(proteome = %entry.proteome, "reusing proteome fetched by a concurrent caller");
            return Ok(path);
        }
        if !confirm.confirm(entry) {
            tracing::info!(proteome = %entry.proteome, "proteome download declined");
            return Err(PatpatError::Declined(entry.proteome.to_string()));
        }
        self.download(entry)
    }

    /// Downloads a fresh copy even when one is cached, then drops the old one.
    pub fn refresh(
        &self,
        entry: &ProteomeEntry,
        confirm: &dyn Confirm,
    ) -> Result<Utf8PathBuf, PatpatError> {
        let slot = self.slot(&entry.proteome)?;
        let _guard = slot
            .lock()
            .map_err(|_| PatpatError::Filesystem("proteome download lock poisoned".to_string()))?;
        if !confirm.confirm(entry) {
            return Err(PatpatError::Declined(entry.proteome.to_string()));
        }
        self.download(entry)
    }

    fn slot(&self, proteome: &ProteomeAccession) -> Result<Arc<Mutex<()>>, PatpatError> {
        let mut map = self
            .inflight
            .lock()
            .map_err(|_| PatpatError::Filesystem("proteome cache lock poisoned".to_string()))?;
        Ok(Arc::clone(
            map.entry(proteome.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    fn download(&self, entry: &ProteomeEntry) -> Result<Utf8PathBuf, PatpatError> {
        let download_error = |message: String| PatpatError::DownloadError {
            accession: entry.proteome.to_string(),
            message,
        };
        let tmp_dir = self.store.tmp_dir();
        let proteome_dir = self.store.proteome_dir();
        fs::create_dir_all(tmp_dir.as_std_path()).map_err(|err| download_error(err.to_string()))?;
        fs::create_dir_all(proteome_dir.as_std_path())
            .map_err(|err| download_error(err.to_string()))?;

        let temp = Builder::new()
            .prefix(&format!("{}-", entry.proteome))
            .suffix(".fasta.part")
            .tempfile_in(tmp_dir.as_std_path())
            .map_err(|err| download_error(err.to_string()))?;

        tracing::info!(
            proteome = %entry.proteome,
            organism = %entry.organism.name,
            "downloading reference proteome"
        );
        let start = std::time::Instant::now();
        let written = self.client.download_proteome(&entry.proteome, temp.path())?;
        validate_fasta(temp.path(), written).map_err(download_error)?;

        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let target = proteome_dir.join(cache_file_name(&entry.proteome, &date));
        temp.persist(target.as_std_path())
            .map_err(|err| download_error(err.to_string()))?;
        self.remove_stale(&entry.proteome, &target)?;
        tracing::info!(
            proteome = %entry.proteome,
            bytes = written,
            latency_ms = start.elapsed().as_millis() as u64,
            path = %target,
            "proteome cached"
        );
        Ok(target)
    }

    fn remove_stale(&self, proteome: &ProteomeAccession, keep: &Utf8Path) -> Result<(), PatpatError> {
        for (_, path) in cached_files(&self.store.proteome_dir(), proteome)? {
            if path != keep {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| PatpatError::Filesystem(err.to_string()))?;
            }
        }
        Ok(())
    }
}

pub fn cache_file_name(proteome: &ProteomeAccession, date: &str) -> String {
    format!("{FILE_PREFIX}{proteome}_{date}{FILE_SUFFIX}")
}

/// Newest cached FASTA for `proteome` inside `dir`, if any.
pub fn find_cached(
    dir: &Utf8Path,
    proteome: &ProteomeAccession,
) -> Result<Option<Utf8PathBuf>, PatpatError> {
    Ok(cached_files(dir, proteome)?
        .into_iter()
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path))
}

fn cached_files(
    dir: &Utf8Path,
    proteome: &ProteomeAccession,
) -> Result<Vec<(String, Utf8PathBuf)>, PatpatError> {
    if !dir.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let prefix = format!("{FILE_PREFIX}{proteome}_");
    let entries =
        fs::read_dir(dir.as_std_path()).map_err(|err| PatpatError::Filesystem(err.to_string()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(date) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
        else {
            continue;
        };
        if chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok() {
            files.push((date.to_string(), dir.join(&name)));
        }
    }
    Ok(files)
}

fn validate_fasta(path: &std::path::Path, written: u64) -> Result<(), String> {
    if written == 0 {
        return Err("downloaded proteome is empty".to_string());
    }
    let file = File::open(path).map_err(|err| err.to_string())?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    while reader.read_line(&mut line).map_err(|err| err.to_string())? > 0 {
        if !line.trim().is_empty() {
            return if line.starts_with('>') {
                Ok(())
            } else {
                Err("downloaded proteome is not FASTA".to_string())
            };
        }
        line.clear();
    }
    Err("downloaded proteome is empty".to_string())
}
