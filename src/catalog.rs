use std::collections::HashMap;
use std::fs;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cache::find_cached;
use crate::domain::{Organism, ProteomeAccession, TaxonId};
use crate::error::PatpatError;
use crate::store::Store;
use crate::uniprot::{UniprotClient, UniprotHttpClient};

const README_PREFIX: &str = "UP_README_";
const TABLE_HEADER: &str = "Proteome_ID\tTax_ID\tOSCODE\tSUPERREGNUM";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub proteome: ProteomeAccession,
    pub taxon_id: TaxonId,
    pub oscode: String,
    pub superregnum: String,
    pub species_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProteomeEntry {
    pub organism: Organism,
    pub proteome: ProteomeAccession,
    pub superregnum: String,
    pub release_date: String,
    pub source_url: String,
    pub local_path: Option<Utf8PathBuf>,
}

/// What a caller may hand to [`ProteomeCatalog::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrganismKey {
    Taxon(TaxonId),
    Proteome(ProteomeAccession),
    Name(String),
}

impl FromStr for OrganismKey {
    type Err = PatpatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(PatpatError::UnknownIdentifier(value.to_string()));
        }
        if trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            return Ok(OrganismKey::Taxon(trimmed.parse()?));
        }
        if let Ok(proteome) = trimmed.parse::<ProteomeAccession>() {
            return Ok(OrganismKey::Proteome(proteome));
        }
        Ok(OrganismKey::Name(trimmed.to_string()))
    }
}

#[derive(Debug, Default)]
struct CatalogIndex {
    release_date: String,
    rows: Vec<CatalogRow>,
    by_taxon: HashMap<TaxonId, usize>,
    by_proteome: HashMap<ProteomeAccession, usize>,
    by_name: HashMap<String, usize>,
}

impl CatalogIndex {
    fn build(release_date: String, rows: Vec<CatalogRow>) -> Self {
        let mut index = Self {
            release_date,
            ..Self::default()
        };
        for (i, row) in rows.iter().enumerate() {
            index.by_taxon.entry(row.taxon_id).or_insert(i);
            index.by_proteome.entry(row.proteome.clone()).or_insert(i);
            index
                .by_name
                .entry(row.species_name.to_lowercase())
                .or_insert(i);
        }
        index.rows = rows;
        index
    }

    fn find(&self, key: &OrganismKey) -> Option<&CatalogRow> {
        let position = match key {
            OrganismKey::Taxon(taxon) => self.by_taxon.get(taxon),
            OrganismKey::Proteome(proteome) => self.by_proteome.get(proteome),
            OrganismKey::Name(name) => self.by_name.get(&name.to_lowercase()),
        }?;
        self.rows.get(*position)
    }
}

/// Maps organisms to UniProt reference proteomes. The index is read-mostly:
/// it is loaded once and only replaced by an explicit [`refresh_catalog`].
///
/// [`refresh_catalog`]: ProteomeCatalog::refresh_catalog
pub struct ProteomeCatalog {
    store: Store,
    client: Arc<dyn UniprotClient>,
    index: RwLock<Option<Arc<CatalogIndex>>>,
}

impl ProteomeCatalog {
    pub fn new(store: Store, client: Arc<dyn UniprotClient>) -> Self {
        Self {
            store,
            client,
            index: RwLock::new(None),
        }
    }

    pub fn resolve(&self, key: &OrganismKey) -> Result<ProteomeEntry, PatpatError> {
        let index = self.index()?;
        let row = index.find(key).ok_or_else(|| {
            PatpatError::UnknownIdentifier(match key {
                OrganismKey::Taxon(taxon) => format!("taxonomy {taxon}"),
                OrganismKey::Proteome(proteome) => proteome.to_string(),
                OrganismKey::Name(name) => name.clone(),
            })
        })?;
        let local_path = find_cached(&self.store.proteome_dir(), &row.proteome)?;
        Ok(ProteomeEntry {
            organism: Organism {
                name: row.species_name.clone(),
                taxon_id: row.taxon_id,
            },
            proteome: row.proteome.clone(),
            superregnum: row.superregnum.clone(),
            release_date: index.release_date.clone(),
            source_url: UniprotHttpClient::proteome_url(&row.proteome),
            local_path,
        })
    }

    pub fn is_cached(&self, proteome: &ProteomeAccession) -> Result<bool, PatpatError> {
        Ok(find_cached(&self.store.proteome_dir(), proteome)?.is_some())
    }

    /// Re-fetches the reference proteome index and publishes it under today's
    /// date, replacing older local copies.
    pub fn refresh_catalog(&self) -> Result<(), PatpatError> {
        tracing::info!("refreshing reference proteome catalog");
        let text = self.client.fetch_catalog()?;
        let rows = parse_catalog(&text);
        if rows.is_empty() {
            return Err(PatpatError::CatalogUnavailable(
                "catalog index contains no proteomes".to_string(),
            ));
        }
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let path = self.store.catalog_path(&date);
        Store::write_bytes_atomic(&path, text.as_bytes())?;
        for (older_date, older_path) in self.local_copies()? {
            if older_date != date {
                if let Err(err) = fs::remove_file(older_path.as_std_path()) {
                    tracing::warn!(path = %older_path, "failed to remove stale catalog copy: {err}");
                }
            }
        }
        tracing::info!(proteomes = rows.len(), %path, "catalog published");
        let index = Arc::new(CatalogIndex::build(date, rows));
        let mut guard = self
            .index
            .write()
            .map_err(|_| PatpatError::CatalogUnavailable("catalog lock poisoned".to_string()))?;
        *guard = Some(index);
        Ok(())
    }

    pub fn rows(&self) -> Result<Vec<CatalogRow>, PatpatError> {
        Ok(self.index()?.rows.clone())
    }

    fn index(&self) -> Result<Arc<CatalogIndex>, PatpatError> {
        {
            let guard = self
                .index
                .read()
                .map_err(|_| PatpatError::CatalogUnavailable("catalog lock poisoned".to_string()))?;
            if let Some(index) = guard.as_ref() {
                return Ok(Arc::clone(index));
            }
        }

        if let Some(index) = self.load_local()? {
            let index = Arc::new(index);
            let mut guard = self
                .index
                .write()
                .map_err(|_| PatpatError::CatalogUnavailable("catalog lock poisoned".to_string()))?;
            let current = guard.get_or_insert_with(|| Arc::clone(&index));
            return Ok(Arc::clone(current));
        }

        tracing::info!("no local catalog copy, fetching from UniProt");
        self.refresh_catalog()?;
        let guard = self
            .index
            .read()
            .map_err(|_| PatpatError::CatalogUnavailable("catalog lock poisoned".to_string()))?;
        guard
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| PatpatError::CatalogUnavailable("catalog not loaded".to_string()))
    }

    fn load_local(&self) -> Result<Option<CatalogIndex>, PatpatError> {
        let Some((date, path)) = self.local_copies()?.into_iter().max_by(|a, b| a.0.cmp(&b.0))
        else {
            return Ok(None);
        };
        let text = fs::read_to_string(path.as_std_path())
            .map_err(|err| PatpatError::CatalogUnavailable(format!("read {path}: {err}")))?;
        let rows = parse_catalog(&text);
        if rows.is_empty() {
            tracing::warn!(%path, "local catalog copy is empty, ignoring it");
            return Ok(None);
        }
        tracing::debug!(%path, proteomes = rows.len(), "loaded local catalog");
        Ok(Some(CatalogIndex::build(date, rows)))
    }

    fn local_copies(&self) -> Result<Vec<(String, Utf8PathBuf)>, PatpatError> {
        let dir = self.store.proteome_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(dir.as_std_path()).map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        let mut copies = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PatpatError::Filesystem(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(date) = name.strip_prefix(README_PREFIX) {
                if chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok() {
                    copies.push((date.to_string(), dir.join(&name)));
                }
            }
        }
        Ok(copies)
    }
}

/// Parses the tab-separated proteome table of UniProt's reference proteome README.
pub fn parse_catalog(text: &str) -> Vec<CatalogRow> {
    let mut lines = text.lines();
    if !lines.any(|line| line.starts_with(TABLE_HEADER)) {
        return Vec::new();
    }
    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            continue;
        }
        let (Ok(proteome), Ok(taxon_id)) = (
            fields[0].parse::<ProteomeAccession>(),
            fields[1].parse::<TaxonId>(),
        ) else {
            continue;
        };
        rows.push(CatalogRow {
            proteome,
            taxon_id,
            oscode: fields[2].trim().to_string(),
            superregnum: fields[3].trim().to_string(),
            species_name: fields[7..].join("\t").trim().to_string(),
        });
    }
    rows
}
