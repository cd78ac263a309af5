//! Podcast feed ingestion: conditional fetching, parsing, duplicate
//! resolution, adaptive polling and episode storage.

pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
