//! Podcast feed ingestion pipeline.
//!
//! - **Fetching**: conditional HTTP GET with outcome classification
//! - **Parsing**: RSS/Atom bytes into validated [`Feed`]/[`Item`] values
//! - **Resolution**: duplicate and redirected feed detection
//! - **Scheduling**: adaptive poll intervals
//! - **Updating**: the per-podcast state machine and the worker pool that runs it
//!
//! # Example
//!
//! ```ignore
//! use podfeed::feed::{run_batch, UpdateContext};
//!
//! let due = db.find_due(360, Utc::now()).await?;
//! let summary = run_batch(&db, due, Arc::new(ctx), 8, None).await;
//! ```

mod extensions;
mod fetcher;
mod models;
mod parser;
mod pool;
mod resolver;
pub mod scheduler;
mod updater;
pub mod validators;

pub use fetcher::{
    build_client, content_hash, fetch, FetchError, FetchOptions, FetchedFeed, UnavailableReason,
};
pub use models::{EpisodeType, Feed, Item, PodcastType};
pub use parser::{parse_feed, parse_feed_at, ParseError};
pub use pool::{run_batch, BatchSummary};
pub use resolver::{resolve_content_hash, resolve_url, ResolveError, MAX_CHAIN_DEPTH};
pub use updater::{update_podcast, UpdateContext, UpdateResult, MAX_RETRIES};
