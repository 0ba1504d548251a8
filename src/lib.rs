pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod output;
pub mod pubchem;
pub mod sdf;
pub mod search;
pub mod store;
pub mod structure;
pub mod transfer;
