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
use crate::usi::Usi;

pub const IPROX_PROXI: &str = "https://www.iprox.cn/proxi";
pub const MASSIVE_PROXI: &str = "https://massive.ucsd.edu/ProteoSAFe/proxi/v0.1";

const PAGE_SIZE: u32 = 200;
/// PSI-MS term for "taxonomy: NCBI TaxID".
const NCBI_TAXID_TERM: &str = "MS:1001467";

/// Any ProteomeXchange PROXI endpoint. iProX and MassIVE only differ by
/// their base URL.
pub struct ProxiMapper {
    name: &'static str,
    base_url: String,
    client: Client,
    max_pages: u32,
}

impl ProxiMapper {
    pub fn iprox(max_pages: u32) -> Result<Self, PatpatError> {
        Self::new("iprox", IPROX_PROXI, max_pages)
    }

    pub fn massive(max_pages: u32) -> Result<Self, PatpatError> {
        Self::new("massive", MASSIVE_PROXI, max_pages)
    }

    /// A PROXI endpoint registered under `name`, such as a mirror or a
    /// repository without a dedicated constructor.
    pub fn new(
        name: &'static str,
        base_url: impl Into<String>,
        max_pages: u32,
    ) -> Result<Self, PatpatError> {
        Ok(Self {
            name,
            base_url: base_url.into(),
            client: build_source_client()?,
            max_pages,
        })
    }

    /// PROXI pages are plain JSON arrays; an empty (or missing) page ends the walk.
    fn paged(
        &self,
        endpoint: &str,
        param: (&str, &str),
        ctx: &MapperContext,
    ) -> Result<Vec<Value>, SourceError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut items = Vec::new();
        for page in 1..=self.max_pages {
            let query = [
                (param.0, param.1.to_string()),
                ("pageNumber", page.to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
                ("resultType", "compact".to_string()),
            ];
            let Some(body) = get_json(&self.client, &url, &query, ctx)? else {
                break;
            };
            let batch = match body {
                Value::Array(batch) => batch,
                Value::Null => break,
                other => {
                    return Err(SourceError::Protocol(format!(
                        "{url}: expected a JSON array, got {}",
                        json_kind(&other)
                    )));
                }
            };
            if batch.is_empty() {
                break;
            }
            tracing::debug!(source = self.name, endpoint, page, items = batch.len(), "page completed");
            let done = batch.len() < PAGE_SIZE as usize;
            items.extend(batch);
            if done {
                break;
            }
        }
        Ok(items)
    }
}

impl Mapper for ProxiMapper {
    fn name(&self) -> &str {
        self.name
    }

    fn probe(&self, timeout: Duration) -> Result<(), SourceError> {
        let url = format!("{}/spectra", self.base_url);
        probe_endpoint(
            &self.client,
            &url,
            &[
                ("peptideSequence", PROBE_PEPTIDE),
                ("pageNumber", "1"),
                ("pageSize", "1"),
                ("resultType", "compact"),
            ],
            timeout,
        )
    }

    fn query(
        &self,
        config: &QueryConfig,
        ctx: &MapperContext,
    ) -> Result<Vec<MapperResult>, SourceError> {
        let psms = self.paged("psms", ("proteinAccession", config.identifier.as_str()), ctx)?;
        let protein = parse_psms(&psms, None);

        let mut peptides = Vec::new();
        let mut skipped = 0usize;
        for peptide in config.peptide_sequences() {
            match self.paged("spectra", ("peptideSequence", peptide), ctx) {
                Ok(spectra) => peptides.extend(parse_psms(&spectra, Some(peptide))),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    skipped += 1;
                    tracing::warn!(source = self.name, peptide, error = %err, "peptide search skipped");
                }
            }
        }
        tracing::info!(
            source = self.name,
            protein_usis = protein.len(),
            peptide_usis = peptides.len(),
            "evidence collected"
        );

        let taxon = config.organism.taxon_id.to_string();
        let mut results = Vec::new();
        let mut skipped_datasets = 0usize;
        for (dataset, evidence) in group_by_dataset(protein, peptides) {
            let url = format!("{}/datasets/{dataset}", self.base_url);
            let body = match get_json(&self.client, &url, &[], ctx) {
                Ok(Some(body)) => body,
                Ok(None) => {
                    tracing::debug!(source = self.name, %dataset, "dataset not found");
                    continue;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    skipped_datasets += 1;
                    tracing::warn!(source = self.name, %dataset, error = %err, "dataset lookup skipped");
                    continue;
                }
            };
            if !dataset_taxa(&body).contains(&taxon) {
                tracing::debug!(source = self.name, %dataset, "dropped, species mismatch");
                continue;
            }

            let mut metadata = BTreeMap::new();
            if let Some(value) = body.pointer("/accession/value").and_then(Value::as_str) {
                metadata.insert("accession".to_string(), value.to_string());
            }
            if skipped > 0 {
                metadata.insert("skipped_peptides".to_string(), skipped.to_string());
            }
            results.push(MapperResult {
                source: self.name.to_string(),
                website: dataset_website(&dataset),
                title: json_str(&body, "title"),
                summary: json_str(&body, "summary"),
                species: dataset_species_names(&body),
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

/// USIs of PSM records. With `peptide` set, only PSMs whose interpretation
/// is that exact peptide (ignoring modifications and charge) are kept.
pub fn parse_psms(items: &[Value], peptide: Option<&str>) -> Vec<Usi> {
    items
        .iter()
        .filter_map(|item| item.get("usi")?.as_str())
        .filter_map(|usi| usi.parse::<Usi>().ok())
        .filter(|usi| peptide.is_none_or(|wanted| usi.peptide() == wanted))
        .collect()
}

/// Species CV terms. PROXI nests them one level deep (`[[term, ..], ..]`);
/// flat lists are accepted too.
fn species_terms(dataset: &Value) -> Vec<&Value> {
    let Some(species) = dataset.get("species").and_then(Value::as_array) else {
        return Vec::new();
    };
    species
        .iter()
        .flat_map(|entry| match entry {
            Value::Array(terms) => terms.iter().collect::<Vec<_>>(),
            term => vec![term],
        })
        .collect()
}

pub fn dataset_taxa(dataset: &Value) -> Vec<String> {
    species_terms(dataset)
        .into_iter()
        .filter(|term| term.get("accession").and_then(Value::as_str) == Some(NCBI_TAXID_TERM))
        .filter_map(|term| json_str(term, "value").or_else(|| json_str(term, "name")))
        .collect()
}

fn dataset_species_names(dataset: &Value) -> Vec<String> {
    species_terms(dataset)
        .into_iter()
        .filter(|term| term.get("accession").and_then(Value::as_str) != Some(NCBI_TAXID_TERM))
        .filter_map(|term| json_str(term, "value"))
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
