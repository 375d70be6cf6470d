use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid region class: {0}")]
    InvalidRegionClass(String),

    #[error("invalid identity key: {0}")]
    InvalidIdentityKey(String),

    #[error("unroutable identifier {key}: no source kind and no secondary id")]
    UnroutableIdentifier { key: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("page {page} of region {region} failed: {message}")]
    PageError {
        region: String,
        page: usize,
        message: String,
    },

    #[error("listing for region {region} is unreachable: {message}")]
    HarvestUnreachable { region: String, message: String },

    #[error("annotation table not found: {0}")]
    AnnotationsNotFound(String),

    #[error("not found upstream: {0}")]
    NotFound(String),

    #[error("RCSB request failed: {0}")]
    RcsbHttp(String),

    #[error("RCSB returned status {status}: {message}")]
    RcsbStatus { status: u16, message: String },

    #[error("uniprot request failed: {0}")]
    UniprotHttp(String),

    #[error("uniprot returned status {status}: {message}")]
    UniprotStatus { status: u16, message: String },

    #[error("RepeatsDB request failed: {0}")]
    RepeatsDbHttp(String),

    #[error("RepeatsDB returned status {status}: {message}")]
    RepeatsDbStatus { status: u16, message: String },

    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    #[error("failed to write {path}: {message}")]
    WriteError { path: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl KiraError {
    pub fn write(path: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        KiraError::WriteError {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            KiraError::NotFound(_)
                | KiraError::RcsbStatus { status: 404, .. }
                | KiraError::UniprotStatus { status: 404, .. }
                | KiraError::RepeatsDbStatus { status: 404, .. }
        )
    }
}
