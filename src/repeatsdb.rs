use std::time::Duration;

use reqwest::blocking::Client;

use crate::alignment::AlignmentSource;
use crate::domain::SourceKind;
use crate::error::KiraError;
use crate::http;

/// RepeatsDB public production API, alignment endpoints only.
#[derive(Clone)]
pub struct RepeatsDbHttpClient {
    client: Client,
    base_url: String,
}

impl RepeatsDbHttpClient {
    pub fn new() -> Result<Self, KiraError> {
        Self::with_timeout(http::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, KiraError> {
        let client = http::build_client(timeout).map_err(KiraError::RepeatsDbHttp)?;
        Ok(Self {
            client,
            base_url: "https://repeatsdb.org/api/public/production".to_string(),
        })
    }

    pub fn alignment_url(&self, kind: SourceKind, structure_id: &str, chain_id: &str) -> String {
        alignment_url(&self.base_url, kind, structure_id, chain_id)
    }
}

/// Structures are sharded by the middle two characters of the PDB id
/// (`1a17` -> `a1`); models live under `adb`.
pub fn alignment_url(base_url: &str, kind: SourceKind, structure_id: &str, chain_id: &str) -> String {
    match kind {
        SourceKind::Structure => {
            let shard = structure_id.get(1..3).unwrap_or(structure_id);
            format!(
                "{base_url}/pdb/{shard}/{structure_id}.{chain_id}/region.0/sequence_alignment.fasta"
            )
        }
        SourceKind::Model => format!(
            "{base_url}/adb/{structure_id}.{chain_id}/region.0/sequence_alignment.fasta"
        ),
    }
}

impl AlignmentSource for RepeatsDbHttpClient {
    fn fetch_alignment(
        &self,
        kind: SourceKind,
        structure_id: &str,
        chain_id: &str,
    ) -> Result<Vec<u8>, KiraError> {
        let url = self.alignment_url(kind, structure_id, chain_id);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| KiraError::RepeatsDbHttp(err.to_string()))?;
        let response = http::check_status(response, "RepeatsDB request failed")
            .map_err(|(status, message)| KiraError::RepeatsDbStatus { status, message })?;
        let bytes = response
            .bytes()
            .map_err(|err| KiraError::RepeatsDbHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}
