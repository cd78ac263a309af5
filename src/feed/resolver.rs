use std::collections::HashSet;
use thiserror::Error;

use crate::storage::{DatabaseError, Session};

/// Hard cap on `canonical` hops, on top of the visited set.
pub const MAX_CHAIN_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Another podcast already owns this feed; carries the root of its chain.
    #[error("Duplicate of podcast {0}")]
    Duplicate(i64),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Check whether `candidate` can become the feed URL of `podcast_id`.
///
/// `current` is the URL the podcast would otherwise keep. Returns
/// `Some(candidate)` when the podcast should move to the new URL, `None`
/// when `current` stays.
///
/// # Errors
///
/// [`ResolveError::Duplicate`] when a different podcast holds `candidate`
/// and its canonical chain does not lead back to `podcast_id`.
pub async fn resolve_url(
    session: &mut Session,
    podcast_id: i64,
    current: &str,
    candidate: &str,
) -> Result<Option<String>, ResolveError> {
    if candidate.is_empty() || candidate == current {
        return Ok(None);
    }

    match session.find_other_by_rss(candidate, podcast_id).await? {
        // The alias row keeps the URL; it already points back here.
        Some(other) => check_root(session, podcast_id, other).await.map(|()| None),
        None => Ok(Some(candidate.to_owned())),
    }
}

/// Treat another podcast whose last body hashed to `hash` like a URL match.
pub async fn resolve_content_hash(
    session: &mut Session,
    podcast_id: i64,
    hash: &str,
) -> Result<(), ResolveError> {
    match session.find_other_by_content_hash(hash, podcast_id).await? {
        Some(other) => check_root(session, podcast_id, other).await,
        None => Ok(()),
    }
}

async fn check_root(session: &mut Session, podcast_id: i64, other: i64) -> Result<(), ResolveError> {
    let root = root_of(session, other, podcast_id).await?;
    if root == podcast_id {
        Ok(())
    } else {
        Err(ResolveError::Duplicate(root))
    }
}

/// Follow `canonical` pointers from `start` to the end of the chain.
///
/// Stops early on reaching `self_id`, on a cycle, or after
/// [`MAX_CHAIN_DEPTH`] hops, returning the last podcast visited.
pub(crate) async fn root_of(
    session: &mut Session,
    start: i64,
    self_id: i64,
) -> Result<i64, DatabaseError> {
    let mut current = start;
    let mut visited = HashSet::from([start]);

    for _ in 0..MAX_CHAIN_DEPTH {
        if current == self_id {
            break;
        }
        match session.canonical_of(current).await? {
            Some(next) if visited.insert(next) => current = next,
            Some(next) => {
                tracing::warn!(podcast_id = current, canonical = next, "Cyclic canonical chain");
                break;
            }
            None => break,
        }
    }

    Ok(current)
}
