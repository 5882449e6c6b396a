use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

static SPECTRUM_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(index|scan|trace|nativeId):\d*").unwrap());
static DATASET_COLLECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(PXD|MSV|IPX|PXL)\d+$").unwrap());
static MODIFICATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[.*?\]").unwrap());

/// Universal Spectrum Identifier, e.g.
/// `mzspec:PXD000561:run_f09:scan:17555:VLHPLEGAVVIIFK/2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Usi {
    raw: String,
    collection: String,
    ms_run_index: String,
    interpretation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a dataset USI: {0}")]
pub struct UsiParseError(pub String);

impl Usi {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn ms_run_index(&self) -> &str {
        &self.ms_run_index
    }

    pub fn interpretation(&self) -> &str {
        &self.interpretation
    }

    /// Bare peptide sequence of the interpretation: modifications and charge removed.
    pub fn peptide(&self) -> String {
        let stripped = MODIFICATION.replace_all(&self.interpretation, "");
        let sequence = stripped.split('/').next().unwrap_or_default();
        sequence.trim_matches('-').to_string()
    }
}

impl fmt::Display for Usi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for Usi {
    type Err = UsiParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || UsiParseError(value.to_string());
        let body = value.trim().strip_prefix("mzspec:").ok_or_else(invalid)?;
        let (collection, rest) = body.split_once(':').ok_or_else(invalid)?;
        let index = SPECTRUM_INDEX.find(rest).ok_or_else(invalid)?;
        let ms_run_index = &rest[..index.end()];
        let interpretation = rest[index.end()..].strip_prefix(':').unwrap_or_default();

        if !DATASET_COLLECTION.is_match(collection)
            || ms_run_index.is_empty()
            || interpretation.is_empty()
        {
            return Err(invalid());
        }
        Ok(Self {
            raw: value.trim().to_string(),
            collection: collection.to_uppercase(),
            ms_run_index: ms_run_index.to_string(),
            interpretation: interpretation.to_string(),
        })
    }
}

/// Pulls the `usi` query parameter out of a link such as PRIDE's `psms` href.
pub fn usi_from_link(link: &str) -> Option<String> {
    let url = reqwest::Url::parse(link).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "usi")
        .map(|(_, value)| value.into_owned())
}
