use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use flate2::read::GzDecoder;
use regex::Regex;
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::domain::{Identifier, Organism, ProteomeAccession, TaxonId};
use crate::error::PatpatError;
use crate::http;

const REST_BASE: &str = "https://rest.uniprot.org/uniprotkb";
const CATALOG_URL: &str = "https://ftp.uniprot.org/pub/databases/uniprot/current_release/knowledgebase/reference_proteomes/README";

static ORGANISM_FIELDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"OS=(.+?) OX=(\d+)").unwrap());

/// One UniProtKB entry as returned in FASTA form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProteinEntry {
    pub accession: String,
    pub description: String,
    pub sequence: String,
    pub organism: Organism,
}

pub trait UniprotClient: Send + Sync {
    fn fetch_entry(&self, id: &Identifier) -> Result<ProteinEntry, PatpatError>;
    fn fetch_catalog(&self) -> Result<String, PatpatError>;
    /// Writes the decompressed proteome FASTA to `destination`, returning the
    /// number of bytes written.
    fn download_proteome(
        &self,
        accession: &ProteomeAccession,
        destination: &Path,
    ) -> Result<u64, PatpatError>;
}

#[derive(Clone)]
pub struct UniprotHttpClient {
    client: Client,
    download_client: Client,
}

impl UniprotHttpClient {
    pub fn new() -> Result<Self, PatpatError> {
        let client = http::build_client(Duration::from_secs(30))
            .map_err(|err| PatpatError::HttpClient(err.to_string()))?;
        let download_client = http::build_client(Duration::from_secs(1800))
            .map_err(|err| PatpatError::HttpClient(err.to_string()))?;
        Ok(Self {
            client,
            download_client,
        })
    }

    pub fn entry_url(id: &Identifier) -> String {
        format!("{REST_BASE}/{}.fasta", id.as_str())
    }

    pub fn proteome_url(accession: &ProteomeAccession) -> String {
        format!(
            "{REST_BASE}/stream?compressed=true&format=fasta&query=%28proteome%3A{}%29",
            accession.as_str()
        )
    }

    fn get(&self, client: &Client, url: &str) -> Result<Response, reqwest::Error> {
        http::send_with_retries(|| client.get(url), || true)
    }
}

impl UniprotClient for UniprotHttpClient {
    fn fetch_entry(&self, id: &Identifier) -> Result<ProteinEntry, PatpatError> {
        let url = Self::entry_url(id);
        tracing::debug!(%url, "uniprot entry request");
        let response = self
            .get(&self.client, &url)
            .map_err(|err| PatpatError::CatalogUnavailable(err.to_string()))?;
        let status = response.status().as_u16();
        if matches!(status, 400 | 404) {
            return Err(PatpatError::UnknownIdentifier(id.to_string()));
        }
        if !response.status().is_success() {
            return Err(PatpatError::CatalogUnavailable(format!(
                "UniProt returned status {status} for {id}"
            )));
        }
        let text = response
            .text()
            .map_err(|err| PatpatError::CatalogUnavailable(err.to_string()))?;
        parse_entry(&text).ok_or_else(|| PatpatError::UnknownIdentifier(id.to_string()))
    }

    fn fetch_catalog(&self) -> Result<String, PatpatError> {
        let response = self
            .get(&self.client, CATALOG_URL)
            .map_err(|err| PatpatError::CatalogUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PatpatError::CatalogUnavailable(format!(
                "catalog request returned status {}",
                response.status().as_u16()
            )));
        }
        response
            .text()
            .map_err(|err| PatpatError::CatalogUnavailable(err.to_string()))
    }

    fn download_proteome(
        &self,
        accession: &ProteomeAccession,
        destination: &Path,
    ) -> Result<u64, PatpatError> {
        let download_error = |message: String| PatpatError::DownloadError {
            accession: accession.to_string(),
            message,
        };
        let url = Self::proteome_url(accession);
        let response = self
            .get(&self.download_client, &url)
            .map_err(|err| download_error(err.to_string()))?;
        if !response.status().is_success() {
            return Err(download_error(format!(
                "UniProt returned status {}",
                response.status().as_u16()
            )));
        }
        let file = File::create(destination).map_err(|err| download_error(err.to_string()))?;
        let mut writer = BufWriter::new(file);
        let mut decoder = GzDecoder::new(response);
        let written =
            io::copy(&mut decoder, &mut writer).map_err(|err| download_error(err.to_string()))?;
        writer.flush().map_err(|err| download_error(err.to_string()))?;
        Ok(written)
    }
}

/// Parses a single-record UniProt FASTA response.
pub fn parse_entry(text: &str) -> Option<ProteinEntry> {
    let mut lines = text.lines();
    let header = lines.next()?.strip_prefix('>')?.trim().to_string();
    let sequence: String = lines
        .take_while(|line| !line.starts_with('>'))
        .map(str::trim)
        .collect();
    if sequence.is_empty() {
        return None;
    }
    let accession = header_accession(&header)?.to_string();
    let organism = parse_organism(&header)?;
    Some(ProteinEntry {
        accession,
        description: header,
        sequence,
        organism,
    })
}

/// Extracts `OS=` and `OX=` from a UniProt FASTA header.
pub fn parse_organism(header: &str) -> Option<Organism> {
    let captures = ORGANISM_FIELDS.captures(header)?;
    let name = captures.get(1)?.as_str().trim().to_string();
    let taxon_id = captures.get(2)?.as_str().parse::<u32>().ok()?;
    Some(Organism {
        name,
        taxon_id: TaxonId::new(taxon_id),
    })
}

/// Accession field of a `db|ACCESSION|NAME ...` header.
pub fn header_accession(header: &str) -> Option<&str> {
    let header = header.strip_prefix('>').unwrap_or(header);
    let mut fields = header.split('|');
    let first = fields.next()?;
    match fields.next() {
        Some(accession) if !accession.is_empty() => Some(accession),
        _ => first.split_whitespace().next(),
    }
}
