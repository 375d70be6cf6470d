pub mod alignment;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod fasta;
pub mod harvest;
pub mod html;
pub mod http;
pub mod output;
pub mod page;
pub mod pipeline;
pub mod rcsb;
pub mod repeatsdb;
pub mod retry;
pub mod router;
pub mod sequence;
pub mod store;
pub mod uniprot;
