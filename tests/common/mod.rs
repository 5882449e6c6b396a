#![allow(dead_code)]

pub mod stub;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;

use patpat::config::DigestionParams;
use patpat::domain::{Identifier, Organism, ProteomeAccession, TaskId, TaxonId};
use patpat::error::PatpatError;
use patpat::fasta::PeptideWindow;
use patpat::mapper::{Mapper, MapperContext, MapperResult, MatchBasis, SourceError};
use patpat::resolver::QueryConfig;
use patpat::store::Store;
use patpat::uniprot::{ProteinEntry, UniprotClient};

pub const MOUSE_PROTEOME: &str = "UP000000589";

pub const P23950_SEQUENCE: &str = concat!(
    "MSTTLLSAFYDVDFLCK",
    "TEPSLAWGEHR",
    "GSLAASPVDMNQR",
    "LLNEAMSSPAGK",
    "GASSLYVGGLEK"
);

pub const CATALOG_README: &str = "Reference Proteomes 2024_01\n\
\n\
Some introductory text.\n\
\n\
Proteome_ID\tTax_ID\tOSCODE\tSUPERREGNUM\t#(1)\t#(2)\t#(3)\tSpecies Name\n\
UP000000589\t10090\tMOUSE\teukaryota\t21709\t33000\t0\tMus musculus\n\
UP000005640\t9606\tHUMAN\teukaryota\t20597\t82000\t0\tHomo sapiens\n\
\n\
Trailing notes.\n";

pub fn mouse_proteome_fasta() -> String {
    format!(
        ">sp|P23950|TISD_MOUSE mRNA decay activator protein ZFP36L1 OS=Mus musculus OX=10090 GN=Zfp36l1 PE=1 SV=2\n\
{P23950_SEQUENCE}\n\
>sp|Q00001|OTHER_MOUSE Shares one peptide OS=Mus musculus OX=10090 PE=1 SV=1\n\
MAAAAAAARGASSLYVGGLEK\n"
    )
}

pub fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("patpat_env")).unwrap();
    let store = Store::new(root);
    store.init().unwrap();
    (temp, store)
}

/// In-memory UniProt: knows P23950 only and serves a small mouse proteome.
pub struct MockUniprot {
    pub proteome: String,
    pub catalog: Option<String>,
    pub download_delay: Duration,
    pub downloads: AtomicUsize,
    pub catalog_fetches: AtomicUsize,
}

impl Default for MockUniprot {
    fn default() -> Self {
        Self {
            proteome: mouse_proteome_fasta(),
            catalog: Some(CATALOG_README.to_string()),
            download_delay: Duration::ZERO,
            downloads: AtomicUsize::new(0),
            catalog_fetches: AtomicUsize::new(0),
        }
    }
}

impl MockUniprot {
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn catalog_fetches(&self) -> usize {
        self.catalog_fetches.load(Ordering::SeqCst)
    }
}

impl UniprotClient for MockUniprot {
    fn fetch_entry(&self, id: &Identifier) -> Result<ProteinEntry, PatpatError> {
        if id.base_accession() != "P23950" {
            return Err(PatpatError::UnknownIdentifier(id.to_string()));
        }
        Ok(ProteinEntry {
            accession: "P23950".to_string(),
            description: "sp|P23950|TISD_MOUSE mRNA decay activator protein ZFP36L1".to_string(),
            sequence: P23950_SEQUENCE.to_string(),
            organism: Organism {
                name: "Mus musculus".to_string(),
                taxon_id: TaxonId::new(10090),
            },
        })
    }

    fn fetch_catalog(&self) -> Result<String, PatpatError> {
        self.catalog_fetches.fetch_add(1, Ordering::SeqCst);
        self.catalog
            .clone()
            .ok_or_else(|| PatpatError::CatalogUnavailable("offline".to_string()))
    }

    fn download_proteome(
        &self,
        _accession: &ProteomeAccession,
        destination: &Path,
    ) -> Result<u64, PatpatError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.download_delay);
        fs::write(destination, self.proteome.as_bytes()).unwrap();
        Ok(self.proteome.len() as u64)
    }
}

pub enum Behavior {
    Records(Vec<MapperResult>),
    Fail(SourceError),
    /// Sleeps in small steps and honours the context deadline.
    Slow(Duration),
    /// Sleeps without looking at the context.
    Hang(Duration),
    Panic,
}

pub struct MockMapper {
    pub name: String,
    pub behavior: Behavior,
    pub probe_ok: bool,
    pub calls: AtomicUsize,
}

impl MockMapper {
    pub fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            probe_ok: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable(name: &str) -> Self {
        Self {
            probe_ok: false,
            ..Self::new(name, Behavior::Records(Vec::new()))
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Mapper for MockMapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self, _timeout: Duration) -> Result<(), SourceError> {
        if self.probe_ok {
            Ok(())
        } else {
            Err(SourceError::Unavailable("connection refused".to_string()))
        }
    }

    fn query(
        &self,
        _config: &QueryConfig,
        ctx: &MapperContext,
    ) -> Result<Vec<MapperResult>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Records(records) => Ok(records.clone()),
            Behavior::Fail(err) => Err(err.clone()),
            Behavior::Slow(duration) => {
                let mut waited = Duration::ZERO;
                while waited < *duration {
                    ctx.check()?;
                    thread::sleep(Duration::from_millis(10));
                    waited += Duration::from_millis(10);
                }
                Ok(Vec::new())
            }
            Behavior::Hang(duration) => {
                thread::sleep(*duration);
                Ok(Vec::new())
            }
            Behavior::Panic => panic!("mock mapper exploded"),
        }
    }
}

pub fn record(source: &str, dataset: &str) -> MapperResult {
    MapperResult {
        source: source.to_string(),
        dataset_id: dataset.to_string(),
        title: Some(format!("{dataset} title")),
        summary: Some(format!("{dataset} summary")),
        website: format!(
            "http://proteomecentral.proteomexchange.org/cgi/GetDataset?ID={dataset}"
        ),
        species: vec!["Mus musculus".to_string()],
        match_basis: MatchBasis::Peptide,
        protein_usis: Vec::new(),
        peptide_usis: vec![format!("mzspec:{dataset}:run:scan:1:TEPSLAWGEHR/2")],
        metadata: BTreeMap::new(),
    }
}

pub fn sample_config(task: TaskId) -> QueryConfig {
    QueryConfig {
        task,
        identifier: "P23950".parse().unwrap(),
        description: "sp|P23950|TISD_MOUSE".to_string(),
        sequence: P23950_SEQUENCE.to_string(),
        organism: Organism {
            name: "Mus musculus".to_string(),
            taxon_id: TaxonId::new(10090),
        },
        proteome: MOUSE_PROTEOME.parse().unwrap(),
        proteome_release: "2024-01-01".to_string(),
        proteome_source: "proteome/uniprot-proteome_UP000000589_2024-01-01.fasta".to_string(),
        digestion: DigestionParams::default(),
        peptide_threshold: 1,
        peptides: vec![PeptideWindow {
            sequence: "TEPSLAWGEHR".to_string(),
            start: 18,
            end: 28,
        }],
        created_at: "2024-01-01T00:00:00+00:00".to_string(),
    }
}
