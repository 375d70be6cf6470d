use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;

use crate::error::KiraError;
use crate::fasta::{FastaEntry, parse_fasta};
use crate::http;
use crate::sequence::StructureSequenceSource;

#[derive(Clone)]
pub struct RcsbHttpClient {
    client: Client,
    base_url: String,
}

impl RcsbHttpClient {
    pub fn new() -> Result<Self, KiraError> {
        Self::with_timeout(http::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, KiraError> {
        let client = http::build_client(timeout).map_err(KiraError::RcsbHttp)?;
        Ok(Self {
            client,
            base_url: "https://www.rcsb.org".to_string(),
        })
    }

    pub fn entry_fasta_url(&self, pdb_id: &str) -> String {
        format!("{}/fasta/entry/{}", self.base_url, pdb_id.trim())
    }
}

impl StructureSequenceSource for RcsbHttpClient {
    fn fetch_sequence_by_structure(
        &self,
        structure_id: &str,
        chain_id: &str,
    ) -> Result<String, KiraError> {
        let url = self.entry_fasta_url(structure_id);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| KiraError::RcsbHttp(err.to_string()))?;
        let response = http::check_status(response, "RCSB request failed")
            .map_err(|(status, message)| KiraError::RcsbStatus { status, message })?;
        let text = response
            .text()
            .map_err(|err| KiraError::RcsbHttp(err.to_string()))?;
        let entries = parse_fasta(&text);
        if entries.is_empty() && !text.trim().is_empty() {
            return Err(KiraError::Malformed(format!(
                "RCSB entry {structure_id} is not FASTA"
            )));
        }
        select_chain(&entries, chain_id)
            .map(|entry| entry.sequence.clone())
            .ok_or_else(|| KiraError::NotFound(format!("{structure_id} chain {chain_id}")))
    }
}

pub fn select_chain<'a>(entries: &'a [FastaEntry], chain_id: &str) -> Option<&'a FastaEntry> {
    entries
        .iter()
        .find(|entry| header_matches_chain(&entry.header, chain_id))
}

/// Chain ids listed in an RCSB entry header, e.g. `Chains A, B[auth C]`.
/// Both label and author ids are returned.
pub fn header_chains(header: &str) -> Vec<String> {
    let mut chains = Vec::new();
    for segment in header.split('|') {
        let segment = segment.trim();
        let Some(list) = segment
            .strip_prefix("Chains ")
            .or_else(|| segment.strip_prefix("Chain "))
        else {
            continue;
        };
        for item in list.split(',') {
            let item = item.trim();
            match item.split_once("[auth ") {
                Some((label, auth)) => {
                    chains.push(label.trim().to_string());
                    chains.push(auth.trim_end_matches(']').trim().to_string());
                }
                None if !item.is_empty() => chains.push(item.to_string()),
                None => {}
            }
        }
    }
    chains
}

pub fn header_matches_chain(header: &str, chain_id: &str) -> bool {
    let chain_id = chain_id.trim();
    if chain_id.is_empty() {
        return false;
    }
    let listed = header_chains(header);
    if !listed.is_empty() {
        return listed.iter().any(|chain| chain == chain_id);
    }

    // Headers from other mirrors: `1ABC:A`, `1abc_A`, `...|A|...`, `chain A`.
    let lowered = header.to_lowercase();
    if lowered.contains(&format!("chain {}", chain_id.to_lowercase())) {
        return true;
    }
    if header.contains(&format!("|{chain_id}|")) {
        return true;
    }
    Regex::new(&format!(r"(?:^|[^A-Za-z0-9]){}(?:$|[^A-Za-z0-9])", regex::escape(chain_id)))
        .map(|re| re.is_match(header))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_chains_with_auth() {
        let chains = header_chains("1ABC_1|Chains A[auth B], C|Some protein|Homo sapiens (9606)");
        assert_eq!(chains, vec!["A", "B", "C"]);
    }
}
