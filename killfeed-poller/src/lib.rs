pub mod config;
pub mod enrichment;
pub mod feed;
pub mod ingest;
