use std::sync::Arc;

use crate::domain::{
    AlignmentPayload, AnnotationRecord, FailureReason, FetchOutcome, IdentityKey, SourceKind,
};
use crate::error::KiraError;
use crate::store::AlignmentStore;

pub trait AlignmentSource: Send + Sync {
    fn fetch_alignment(
        &self,
        kind: SourceKind,
        structure_id: &str,
        chain_id: &str,
    ) -> Result<Vec<u8>, KiraError>;
}

impl<T: AlignmentSource + ?Sized> AlignmentSource for Arc<T> {
    fn fetch_alignment(
        &self,
        kind: SourceKind,
        structure_id: &str,
        chain_id: &str,
    ) -> Result<Vec<u8>, KiraError> {
        (**self).fetch_alignment(kind, structure_id, chain_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlignmentFetch {
    AlreadyPresent(IdentityKey),
    Downloaded(AlignmentPayload),
}

/// Fetches one repeat-unit alignment per record. The artifact file doubles as
/// the "already fetched" marker, so a present file short-circuits the request.
pub struct AlignmentFetcher<A> {
    source: A,
    store: AlignmentStore,
}

impl<A: AlignmentSource> AlignmentFetcher<A> {
    pub fn new(source: A, store: AlignmentStore) -> Self {
        Self { source, store }
    }

    pub fn fetch(&self, record: &AnnotationRecord) -> FetchOutcome<AlignmentFetch> {
        let key = record.key();
        if self.store.contains(&key) {
            return FetchOutcome::Success(AlignmentFetch::AlreadyPresent(key));
        }
        // Unlabelled rows are treated as deposited structures, the common case.
        let kind = record.source_kind.unwrap_or(SourceKind::Structure);
        let bytes = match self
            .source
            .fetch_alignment(kind, &record.structure_id, &record.chain_id)
        {
            Ok(bytes) => bytes,
            Err(err) => return FetchOutcome::from_error(key, &err),
        };
        match validate_alignment(&bytes) {
            Ok(()) => FetchOutcome::Success(AlignmentFetch::Downloaded(AlignmentPayload {
                key,
                bytes,
            })),
            Err(reason) => {
                let detail = match reason {
                    FailureReason::Empty => "empty alignment payload".to_string(),
                    _ => "alignment payload is not FASTA".to_string(),
                };
                FetchOutcome::failure(key, reason, detail)
            }
        }
    }
}

pub fn validate_alignment(bytes: &[u8]) -> Result<(), FailureReason> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Err(FailureReason::Empty);
    }
    if !trimmed.starts_with('>') {
        return Err(FailureReason::Malformed);
    }
    Ok(())
}
