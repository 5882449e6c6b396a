use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead};

use serde::{Deserialize, Serialize};

use crate::config::DigestionParams;
use crate::uniprot::header_accession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaRecord {
    pub header: String,
    pub sequence: String,
}

/// Streaming reader over a (possibly very large) FASTA file.
pub struct FastaReader<R> {
    reader: R,
    pending_header: Option<String>,
    line: String,
}

impl<R: BufRead> FastaReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending_header: None,
            line: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for FastaReader<R> {
    type Item = io::Result<FastaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut header = self.pending_header.take();
        let mut sequence = String::new();
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    return header.map(|header| Ok(FastaRecord { header, sequence }));
                }
                Ok(_) => {
                    let line = self.line.trim_end();
                    if let Some(next_header) = line.strip_prefix('>') {
                        if header.is_some() {
                            self.pending_header = Some(next_header.to_string());
                            return header.map(|header| Ok(FastaRecord { header, sequence }));
                        }
                        header = Some(next_header.to_string());
                    } else if header.is_some() {
                        sequence.push_str(line.trim());
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// A peptide and its 1-based inclusive position in the parent protein.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeptideWindow {
    pub sequence: String,
    pub start: usize,
    pub end: usize,
}

/// Trypsin: cut after K or R unless the next residue is P.
fn cleavage_bounds(sequence: &[u8]) -> Vec<usize> {
    let mut bounds = vec![0];
    for i in 0..sequence.len().saturating_sub(1) {
        if matches!(sequence[i], b'K' | b'R') && sequence[i + 1] != b'P' {
            bounds.push(i + 1);
        }
    }
    if !sequence.is_empty() {
        bounds.push(sequence.len());
    }
    bounds
}

pub fn digest(sequence: &str, params: &DigestionParams) -> Vec<PeptideWindow> {
    let sequence = sequence.to_ascii_uppercase();
    let bytes = sequence.as_bytes();
    let bounds = cleavage_bounds(bytes);
    let mut seen = HashSet::new();
    let mut windows = Vec::new();
    for i in 0..bounds.len().saturating_sub(1) {
        for missed in 0..=params.missed_cleavages {
            let j = i + missed + 1;
            if j >= bounds.len() {
                break;
            }
            let (start, end) = (bounds[i], bounds[j]);
            let length = end - start;
            if length < params.min_length || length > params.max_length {
                continue;
            }
            let peptide = &sequence[start..end];
            if seen.insert(peptide.to_string()) {
                windows.push(PeptideWindow {
                    sequence: peptide.to_string(),
                    start: start + 1,
                    end,
                });
            }
        }
    }
    windows.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
    windows
}

#[derive(Debug, Clone, Default)]
pub struct ProteomeMatch {
    /// Whether the queried protein itself is present in the proteome.
    pub entry_found: bool,
    pub proteins_scanned: usize,
    /// Number of proteome proteins whose digest contains each query peptide.
    pub counts: HashMap<String, usize>,
}

/// Scans a proteome FASTA once, counting how many proteins share each query
/// peptide and checking whether the query protein has an entry of its own.
pub fn search_proteome<R: BufRead>(
    reader: R,
    accession: &str,
    sequence: &str,
    peptides: &[PeptideWindow],
    params: &DigestionParams,
) -> io::Result<ProteomeMatch> {
    let mut result = ProteomeMatch {
        counts: peptides
            .iter()
            .map(|window| (window.sequence.clone(), 0))
            .collect(),
        ..ProteomeMatch::default()
    };
    let target_sequence = sequence.to_ascii_uppercase();

    for record in FastaReader::new(reader) {
        let record = record?;
        result.proteins_scanned += 1;
        if !result.entry_found
            && (header_accession(&record.header) == Some(accession)
                || record.sequence.eq_ignore_ascii_case(&target_sequence))
        {
            result.entry_found = true;
        }
        for window in digest(&record.sequence, params) {
            if let Some(count) = result.counts.get_mut(&window.sequence) {
                *count += 1;
            }
        }
    }
    Ok(result)
}

/// Keeps peptides found in at least one and at most `threshold` proteins.
pub fn unique_peptides(
    windows: &[PeptideWindow],
    counts: &HashMap<String, usize>,
    threshold: usize,
) -> Vec<PeptideWindow> {
    windows
        .iter()
        .filter(|window| {
            let count = counts.get(&window.sequence).copied().unwrap_or(0);
            count != 0 && count <= threshold
        })
        .cloned()
        .collect()
}
