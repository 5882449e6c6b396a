use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{Confirm, SequenceCache};
use crate::catalog::{OrganismKey, ProteomeCatalog};
use crate::config::{DigestionParams, Settings};
use crate::domain::{Identifier, Organism, ProteomeAccession, TaskId};
use crate::error::PatpatError;
use crate::fasta::{PeptideWindow, digest, search_proteome, unique_peptides};
use crate::uniprot::UniprotClient;

/// Resolved query context shared read-only by the hub and every mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub task: TaskId,
    pub identifier: Identifier,
    pub description: String,
    pub sequence: String,
    pub organism: Organism,
    pub proteome: ProteomeAccession,
    pub proteome_release: String,
    pub proteome_source: String,
    pub digestion: DigestionParams,
    pub peptide_threshold: usize,
    /// Peptides of the protein that are unique within the reference proteome.
    pub peptides: Vec<PeptideWindow>,
    pub created_at: String,
}

impl QueryConfig {
    pub fn peptide_sequences(&self) -> impl Iterator<Item = &str> {
        self.peptides.iter().map(|window| window.sequence.as_str())
    }
}

pub struct QueryResolver {
    client: Arc<dyn UniprotClient>,
    catalog: Arc<ProteomeCatalog>,
    cache: Arc<SequenceCache>,
    digestion: DigestionParams,
    peptide_threshold: usize,
}

impl QueryResolver {
    pub fn new(
        client: Arc<dyn UniprotClient>,
        catalog: Arc<ProteomeCatalog>,
        cache: Arc<SequenceCache>,
        settings: &Settings,
    ) -> Self {
        Self {
            client,
            catalog,
            cache,
            digestion: settings.digestion,
            peptide_threshold: settings.peptide_threshold,
        }
    }

    /// Turns an identifier into a [`QueryConfig`]. Talks to UniProt and the
    /// local proteome cache only; no dataset repository is contacted here.
    pub fn resolve(
        &self,
        identifier: &Identifier,
        task: Option<TaskId>,
        confirm: &dyn Confirm,
    ) -> Result<QueryConfig, PatpatError> {
        tracing::info!(%identifier, "phase=Resolve; looking up protein");
        let entry = self.client.fetch_entry(identifier)?;

        let proteome = self
            .catalog
            .resolve(&OrganismKey::Taxon(entry.organism.taxon_id))
            .map_err(|err| match err {
                PatpatError::UnknownIdentifier(_) => PatpatError::UnknownIdentifier(format!(
                    "{identifier} ({}, taxonomy {})",
                    entry.organism.name, entry.organism.taxon_id
                )),
                other => other,
            })?;
        tracing::info!(
            organism = %entry.organism.name,
            proteome = %proteome.proteome,
            "phase=Resolve; reference proteome selected"
        );

        let path = self.cache.fetch(&proteome, confirm)?;

        let windows = digest(&entry.sequence, &self.digestion);
        let file = File::open(path.as_std_path())
            .map_err(|err| PatpatError::Filesystem(format!("open {path}: {err}")))?;
        let matched = search_proteome(
            BufReader::new(file),
            identifier.base_accession(),
            &entry.sequence,
            &windows,
            &self.digestion,
        )
        .map_err(|err| PatpatError::Filesystem(format!("read {path}: {err}")))?;

        if !matched.entry_found {
            return Err(PatpatError::SequenceNotFound {
                identifier: identifier.to_string(),
                proteome: proteome.proteome.to_string(),
            });
        }

        let peptides = unique_peptides(&windows, &matched.counts, self.peptide_threshold);
        let missing = windows
            .iter()
            .filter(|window| matched.counts.get(&window.sequence) == Some(&0))
            .count();
        if missing > 0 {
            tracing::warn!(missing, "some peptides are absent from the reference proteome");
        }
        tracing::info!(
            candidates = windows.len(),
            unique = peptides.len(),
            proteins = matched.proteins_scanned,
            "phase=Resolve; local peptide search complete"
        );

        Ok(QueryConfig {
            task: task.unwrap_or_else(TaskId::generate),
            identifier: identifier.clone(),
            description: entry.description,
            sequence: entry.sequence,
            organism: entry.organism,
            proteome: proteome.proteome,
            proteome_release: proteome.release_date,
            proteome_source: path.to_string(),
            digestion: self.digestion,
            peptide_threshold: self.peptide_threshold,
            peptides,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}
