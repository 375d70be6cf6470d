use std::time::Duration;

use reqwest::blocking::Client;

use crate::error::KiraError;
use crate::fasta::parse_fasta;
use crate::http;
use crate::sequence::ProteinSequenceSource;

#[derive(Clone)]
pub struct UniprotHttpClient {
    client: Client,
    base_url: String,
}

impl UniprotHttpClient {
    pub fn new() -> Result<Self, KiraError> {
        Self::with_timeout(http::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, KiraError> {
        let client = http::build_client(timeout).map_err(KiraError::UniprotHttp)?;
        Ok(Self {
            client,
            base_url: "https://rest.uniprot.org/uniprotkb".to_string(),
        })
    }

    /// The search endpoint tolerates accessions that are not primary (merged
    /// or demerged entries), unlike the direct `{acc}.fasta` route.
    pub fn search_url(&self, accession: &str) -> String {
        format!(
            "{}/search?query=({})&format=fasta",
            self.base_url,
            accession.trim()
        )
    }
}

impl ProteinSequenceSource for UniprotHttpClient {
    fn fetch_sequence_by_accession(&self, accession: &str) -> Result<String, KiraError> {
        let url = self.search_url(accession);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| KiraError::UniprotHttp(err.to_string()))?;
        let response = http::check_status(response, "UniProt request failed")
            .map_err(|(status, message)| KiraError::UniprotStatus { status, message })?;
        let text = response
            .text()
            .map_err(|err| KiraError::UniprotHttp(err.to_string()))?;
        if !text.trim().is_empty() && !text.trim_start().starts_with('>') {
            return Err(KiraError::Malformed(format!(
                "UniProt search for {accession} did not return FASTA"
            )));
        }
        // An empty result set comes back as an empty body.
        first_sequence(&text).ok_or_else(|| KiraError::NotFound(format!("uniprot {accession}")))
    }
}

/// Sequence of the first entry of a FASTA search result.
pub fn first_sequence(text: &str) -> Option<String> {
    parse_fasta(text)
        .into_iter()
        .next()
        .map(|entry| entry.sequence)
}
