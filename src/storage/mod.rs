mod categories;
mod episodes;
mod podcasts;
mod schema;
mod session;
mod types;

pub use categories::CategoryCache;
pub use schema::Database;
pub use session::Session;
pub use types::{
    CacheValidators, Category, DatabaseError, Episode, FeedStatus, OutcomeUpdate, Podcast,
    UpsertStats,
};
