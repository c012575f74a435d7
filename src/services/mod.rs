pub mod converter;
pub mod dataset;
pub mod identity;
pub mod ingest;
pub mod scratch;
pub mod secrets;
pub mod storage;
