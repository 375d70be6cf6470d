use crate::domain::{AnnotationRecord, FailureReason, FetchOutcome, SequenceRecord};
use crate::error::KiraError;
use crate::router::{FetchStrategy, route};

pub trait StructureSequenceSource: Send + Sync {
    fn fetch_sequence_by_structure(
        &self,
        structure_id: &str,
        chain_id: &str,
    ) -> Result<String, KiraError>;
}

pub trait ProteinSequenceSource: Send + Sync {
    fn fetch_sequence_by_accession(&self, accession: &str) -> Result<String, KiraError>;
}

pub struct SequenceFetcher<S, P> {
    structure: S,
    protein: P,
}

impl<S: StructureSequenceSource, P: ProteinSequenceSource> SequenceFetcher<S, P> {
    pub fn new(structure: S, protein: P) -> Self {
        Self { structure, protein }
    }

    /// Single attempt; retries belong to the caller.
    pub fn fetch(&self, record: &AnnotationRecord) -> FetchOutcome<SequenceRecord> {
        let key = record.key();
        let strategy = match route(record) {
            Ok(strategy) => strategy,
            Err(err) => return FetchOutcome::from_error(key, &err),
        };
        let raw = match &strategy {
            FetchStrategy::Structure {
                structure_id,
                chain_id,
            } => self
                .structure
                .fetch_sequence_by_structure(structure_id, chain_id),
            FetchStrategy::ProteinDb { accession } => {
                self.protein.fetch_sequence_by_accession(accession)
            }
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => return FetchOutcome::from_error(key, &err),
        };
        let sequence = normalize_sequence(&raw);
        if sequence.is_empty() {
            return FetchOutcome::failure(
                key,
                FailureReason::Empty,
                format!("empty sequence from {}", strategy.label()),
            );
        }
        FetchOutcome::Success(SequenceRecord::from_annotation(record, sequence))
    }
}

/// Keeps residue letters only, upper-cased.
pub fn normalize_sequence(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_ascii_alphabetic())
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}
