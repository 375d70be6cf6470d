use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Region class token as shown by RepeatsDB (`3.1`, `4.4`, `5.5`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegionClass(String);

impl RegionClass {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name form, `3.1` -> `3_1`.
    pub fn file_stem(&self) -> String {
        self.0.replace('.', "_")
    }
}

impl fmt::Display for RegionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RegionClass {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized
                .split('.')
                .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()));
        if !is_valid {
            return Err(KiraError::InvalidRegionClass(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for RegionClass {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RegionClass> for String {
    fn from(value: RegionClass) -> Self {
        value.0
    }
}

pub fn default_regions() -> Vec<RegionClass> {
    [
        "3.1", "3.2", "3.3", "3.4", "4.1", "4.2", "4.3", "4.4", "4.5", "4.6", "4.7", "4.8", "5.1",
        "5.2", "5.3", "5.4", "5.5",
    ]
    .into_iter()
    .map(|value| RegionClass(value.to_string()))
    .collect()
}

/// `(structure_id, chain_id)`; unique within one region's artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub structure_id: String,
    pub chain_id: String,
}

impl IdentityKey {
    pub fn new(structure_id: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self {
            structure_id: structure_id.into(),
            chain_id: chain_id.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.structure_id, self.chain_id)
    }
}

impl FromStr for IdentityKey {
    type Err = KiraError;

    // Model ids can contain underscores themselves, the chain never does.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (structure_id, chain_id) = trimmed
            .rsplit_once('_')
            .ok_or_else(|| KiraError::InvalidIdentityKey(value.to_string()))?;
        if structure_id.is_empty() || chain_id.is_empty() {
            return Err(KiraError::InvalidIdentityKey(value.to_string()));
        }
        Ok(Self::new(structure_id, chain_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Chain of a deposited PDB structure.
    Structure,
    /// Predicted model keyed by UniProt accession (AlphaFoldDB).
    Model,
}

impl SourceKind {
    /// Classifies the listing's source column (`RCSB`, `PDB`, `AlphaFoldDB`).
    pub fn from_label(label: &str) -> Option<Self> {
        let lowered = label.trim().to_lowercase();
        if lowered.is_empty() {
            None
        } else if lowered.contains("alphafold") || lowered.contains("model") {
            Some(SourceKind::Model)
        } else if lowered.contains("rcsb") || lowered.contains("pdb") {
            Some(SourceKind::Structure)
        } else {
            None
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Structure => write!(f, "structure"),
            SourceKind::Model => write!(f, "model"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub index: String,
    pub structure_id: String,
    pub chain_id: String,
    pub source_kind: Option<SourceKind>,
    pub source_label: String,
    pub region_values: Vec<String>,
    pub region_units: Vec<String>,
    pub uniprot: Option<String>,
    pub pfam: Vec<String>,
    pub status: String,
}

impl AnnotationRecord {
    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.structure_id, &self.chain_id)
    }

    pub fn secondary_id(&self) -> Option<&str> {
        self.uniprot
            .as_deref()
            .or_else(|| self.pfam.first().map(String::as_str))
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Network,
    NotFound,
    Empty,
    Timeout,
    Unroutable,
    Malformed,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Network => "network",
            FailureReason::NotFound => "not_found",
            FailureReason::Empty => "empty",
            FailureReason::Timeout => "timeout",
            FailureReason::Unroutable => "unroutable",
            FailureReason::Malformed => "malformed",
            FailureReason::Cancelled => "cancelled",
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(self, FailureReason::Network | FailureReason::Timeout)
    }

    pub fn from_error(err: &KiraError) -> Self {
        if err.is_not_found() {
            return FailureReason::NotFound;
        }
        match err {
            KiraError::UnroutableIdentifier { .. } => FailureReason::Unroutable,
            KiraError::Malformed(_) => FailureReason::Malformed,
            _ => FailureReason::Network,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Success(T),
    Failure {
        key: IdentityKey,
        reason: FailureReason,
        detail: String,
    },
}

impl<T> FetchOutcome<T> {
    pub fn failure(key: IdentityKey, reason: FailureReason, detail: impl Into<String>) -> Self {
        FetchOutcome::Failure {
            key,
            reason,
            detail: detail.into(),
        }
    }

    pub fn from_error(key: IdentityKey, err: &KiraError) -> Self {
        Self::failure(key, FailureReason::from_error(err), err.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            FetchOutcome::Success(_) => None,
            FetchOutcome::Failure { reason, .. } => Some(*reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub key: IdentityKey,
    pub sequence: String,
    pub description: String,
}

impl SequenceRecord {
    pub fn from_annotation(record: &AnnotationRecord, sequence: String) -> Self {
        let list = |values: &[String]| {
            values
                .iter()
                .map(|value| header_token(value))
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut parts = Vec::new();
        if !record.region_values.is_empty() {
            parts.push(format!("region_values={}", list(&record.region_values)));
        }
        if !record.region_units.is_empty() {
            let units = record
                .region_units
                .iter()
                .map(|unit| unit.split_whitespace().collect::<String>())
                .collect::<Vec<_>>();
            parts.push(format!("region_units={}", list(&units)));
        }
        if !record.pfam.is_empty() {
            parts.push(format!("pfam={}", list(&record.pfam)));
        }
        let source = header_token(&record.source_label);
        if !source.is_empty() {
            parts.push(format!("source={source}"));
        }
        if let Some(uniprot) = record.uniprot.as_deref() {
            parts.push(format!("uniprot={}", header_token(uniprot)));
        }
        parts.push(format!("length={}", sequence.len()));
        Self {
            key: record.key(),
            sequence,
            description: parts.join(" "),
        }
    }
}

/// A single header token: whitespace runs (line breaks included) become `_`.
fn header_token(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join("_")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentPayload {
    pub key: IdentityKey,
    pub bytes: Vec<u8>,
}
