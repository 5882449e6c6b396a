use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;

use crate::error::PatpatError;
use crate::mapper::{
    Mapper, MapperContext, MapperResult, PROBE_PEPTIDE, SourceError, build_source_client,
    dataset_website, get_json, group_by_dataset, json_str, probe_endpoint,
};
use crate::resolver::QueryConfig;
use crate::usi::{Usi, usi_from_link};

const PRIDE_API: &str = "https://www.ebi.ac.uk/pride/ws/archive/v2";
const PAGE_SIZE: u32 = 200;

/// EBI PRIDE Archive v2.
pub struct PrideMapper {
    client: Client,
    base_url: String,
    max_pages: u32,
}

impl PrideMapper {
    pub fn new(max_pages: u32) -> Result<Self, PatpatError> {
        Self::with_base_url(PRIDE_API, max_pages)
    }

    /// Same API served from another root, such as a mirror.
    pub fn with_base_url(base_url: impl Into<String>, max_pages: u32) -> Result<Self, PatpatError> {
        Ok(Self {
            client: build_source_client()?,
            base_url: base_url.into(),
            max_pages,
        })
    }

    /// Walks a paged `_embedded.<key>` collection until a page comes back
    /// without `_embedded` or the page cap is reached.
    fn paged(
        &self,
        endpoint: &str,
        param: (&str, &str),
        key: &str,
        ctx: &MapperContext,
    ) -> Result<Vec<Value>, SourceError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut items = Vec::new();
        for page in 0..self.max_pages {
            let query = [
                (param.0, param.1.to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            let Some(body) = get_json(&self.client, &url, &query, ctx)? else {
                break;
            };
            let Some(batch) = embedded(&body, key) else {
                break;
            };
            tracing::debug!(source = "pride", endpoint, page, items = batch.len(), "page completed");
            let done = batch.len() < PAGE_SIZE as usize;
            items.extend(batch.iter().cloned());
            if done {
                break;
            }
        }
        Ok(items)
    }

    fn protein_level(&self, accession: &str, ctx: &MapperContext) -> Result<Vec<Usi>, SourceError> {
        let evidences = self.paged(
            "peptideevidences",
            ("proteinAccession", accession),
            "peptideevidences",
            ctx,
        )?;
        Ok(parse_peptide_evidences(&evidences))
    }

    fn peptide_level(&self, peptide: &str, ctx: &MapperContext) -> Result<Vec<Usi>, SourceError> {
        let spectra = self.paged(
            "spectra",
            ("peptideSequence", peptide),
            "spectraevidences",
            ctx,
        )?;
        Ok(parse_spectra(&spectra))
    }
}

impl Mapper for PrideMapper {
    fn name(&self) -> &str {
        "pride"
    }

    fn probe(&self, timeout: Duration) -> Result<(), SourceError> {
        let url = format!("{}/spectra", self.base_url);
        probe_endpoint(
            &self.client,
            &url,
            &[("peptideSequence", PROBE_PEPTIDE), ("pageSize", "1")],
            timeout,
        )
    }

    fn query(
        &self,
        config: &QueryConfig,
        ctx: &MapperContext,
    ) -> Result<Vec<MapperResult>, SourceError> {
        let protein = self.protein_level(config.identifier.as_str(), ctx)?;
        let mut peptides = Vec::new();
        let mut skipped = 0usize;
        for peptide in config.peptide_sequences() {
            match self.peptide_level(peptide, ctx) {
                Ok(found) => peptides.extend(found),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    skipped += 1;
                    tracing::warn!(source = "pride", peptide, error = %err, "peptide search skipped");
                }
            }
        }
        tracing::info!(
            source = "pride",
            protein_usis = protein.len(),
            peptide_usis = peptides.len(),
            "evidence collected"
        );

        let taxon = config.organism.taxon_id.to_string();
        let mut results = Vec::new();
        let mut skipped_datasets = 0usize;
        for (dataset, evidence) in group_by_dataset(protein, peptides) {
            let url = format!("{}/projects/{dataset}", self.base_url);
            let project = match get_json(&self.client, &url, &[], ctx) {
                Ok(Some(project)) => project,
                Ok(None) => {
                    tracing::debug!(source = "pride", %dataset, "project not found");
                    continue;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    skipped_datasets += 1;
                    tracing::warn!(source = "pride", %dataset, error = %err, "project lookup skipped");
                    continue;
                }
            };
            let organisms = project_organisms(&project);
            if !organisms.iter().any(|(accession, _)| *accession == taxon) {
                tracing::debug!(source = "pride", %dataset, "dropped, species mismatch");
                continue;
            }

            let mut metadata = BTreeMap::new();
            for key in ["submissionDate", "publicationDate", "submissionType"] {
                if let Some(value) = json_str(&project, key) {
                    metadata.insert(key.to_string(), value);
                }
            }
            if skipped > 0 {
                metadata.insert("skipped_peptides".to_string(), skipped.to_string());
            }
            results.push(MapperResult {
                source: self.name().to_string(),
                website: dataset_website(&dataset),
                title: json_str(&project, "title"),
                summary: json_str(&project, "projectDescription"),
                species: organisms.into_iter().map(|(_, name)| name).collect(),
                match_basis: evidence.match_basis(),
                protein_usis: evidence.protein,
                peptide_usis: evidence.peptides,
                dataset_id: dataset,
                metadata,
            });
        }
        if skipped_datasets > 0 {
            for result in &mut results {
                result
                    .metadata
                    .insert("skipped_datasets".to_string(), skipped_datasets.to_string());
            }
        }
        Ok(results)
    }
}

fn embedded<'a>(body: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    body.get("_embedded")?.get(key)?.as_array()
}

/// Protein-level evidences carry their USI inside the `psms` link.
pub fn parse_peptide_evidences(items: &[Value]) -> Vec<Usi> {
    items
        .iter()
        .filter_map(|item| item.pointer("/_links/psms/href")?.as_str())
        .filter_map(usi_from_link)
        .filter_map(|usi| usi.parse().ok())
        .collect()
}

pub fn parse_spectra(items: &[Value]) -> Vec<Usi> {
    items
        .iter()
        .filter_map(|item| item.get("usi")?.as_str())
        .filter_map(|usi| usi.parse().ok())
        .collect()
}

/// `(taxonomy accession, display name)` pairs of a project.
pub fn project_organisms(project: &Value) -> Vec<(String, String)> {
    project
        .get("organisms")
        .and_then(Value::as_array)
        .map(|organisms| {
            organisms
                .iter()
                .filter_map(|organism| {
                    let accession = json_str(organism, "accession")?;
                    let name = json_str(organism, "name").unwrap_or_else(|| accession.clone());
                    Some((accession, name))
                })
                .collect()
        })
        .unwrap_or_default()
}
