use crate::domain::{AnnotationRecord, SourceKind};
use crate::error::KiraError;

/// Where the full-chain sequence of a record comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStrategy {
    Structure {
        structure_id: String,
        chain_id: String,
    },
    ProteinDb {
        accession: String,
    },
}

impl FetchStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            FetchStrategy::Structure { .. } => "rcsb",
            FetchStrategy::ProteinDb { .. } => "uniprot",
        }
    }
}

pub fn route(record: &AnnotationRecord) -> Result<FetchStrategy, KiraError> {
    match record.source_kind {
        Some(SourceKind::Structure) => Ok(FetchStrategy::Structure {
            structure_id: record.structure_id.clone(),
            chain_id: record.chain_id.clone(),
        }),
        // Model entries are listed under their UniProt accession.
        Some(SourceKind::Model) => {
            let accession = record
                .uniprot
                .as_deref()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(&record.structure_id);
            Ok(FetchStrategy::ProteinDb {
                accession: clean_accession(accession),
            })
        }
        None => match record.secondary_id() {
            Some(secondary) => Ok(FetchStrategy::ProteinDb {
                accession: clean_accession(secondary),
            }),
            None => Err(KiraError::UnroutableIdentifier {
                key: record.key().to_string(),
            }),
        },
    }
}

/// Drops a chain or isoform suffix: `P12345_A` and `P12345-2` become `P12345`.
pub fn clean_accession(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.find(['_', '-']) {
        Some(pos) if pos > 0 => trimmed[..pos].to_string(),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_accession_strips_suffixes() {
        assert_eq!(clean_accession("P12345_A"), "P12345");
        assert_eq!(clean_accession("Q9XYZ1-2"), "Q9XYZ1");
        assert_eq!(clean_accession(" O00000 "), "O00000");
    }
}
