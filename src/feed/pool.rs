use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use super::updater::{record_failure, update_podcast, Failure, UpdateContext, UpdateResult};
use crate::storage::{Database, FeedStatus, Podcast};

/// Per-status counts for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    counts: BTreeMap<FeedStatus, usize>,
}

impl BatchSummary {
    fn record(&mut self, status: FeedStatus) {
        *self.counts.entry(status).or_default() += 1;
    }

    pub fn count(&self, status: FeedStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Statuses with a non-zero count, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (FeedStatus, usize)> + '_ {
        self.counts.iter().map(|(status, count)| (*status, *count))
    }
}

/// Update every podcast in `podcasts` with at most `concurrency` runs in flight.
///
/// Each worker checks out one [`Session`](crate::storage::Session) and keeps
/// it until the queue is drained. A failing or panicking run is recorded
/// against its own podcast and never stops the batch. When `results` is set,
/// every [`UpdateResult`] is also sent there as it completes. The channel is
/// unbounded so a slow or absent reader never stalls the workers.
pub async fn run_batch(
    db: &Database,
    podcasts: Vec<Podcast>,
    ctx: Arc<UpdateContext>,
    concurrency: usize,
    results: Option<mpsc::UnboundedSender<UpdateResult>>,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    if podcasts.is_empty() {
        return summary;
    }

    let workers = concurrency.clamp(1, podcasts.len());
    let total = podcasts.len();
    let queue = Arc::new(Mutex::new(VecDeque::from(podcasts)));

    tracing::info!(podcasts = total, workers, "Starting update batch");

    let mut join_set = JoinSet::new();
    for worker in 0..workers {
        let db = db.clone();
        let ctx = Arc::clone(&ctx);
        let queue = Arc::clone(&queue);
        let results = results.clone();

        join_set.spawn(async move { run_worker(worker, db, ctx, queue, results).await });
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(statuses) => statuses.into_iter().for_each(|s| summary.record(s)),
            Err(e) => tracing::error!(error = %e, "Update worker task failed"),
        }
    }

    let leftover = queue.lock().await.len();
    if leftover > 0 {
        tracing::warn!(leftover, "Batch ended with podcasts left unprocessed");
    }

    tracing::info!(
        processed = summary.total(),
        success = summary.count(FeedStatus::Success),
        not_modified = summary.count(FeedStatus::NotModified),
        "Update batch complete"
    );
    summary
}

async fn run_worker(
    worker: usize,
    db: Database,
    ctx: Arc<UpdateContext>,
    queue: Arc<Mutex<VecDeque<Podcast>>>,
    results: Option<mpsc::UnboundedSender<UpdateResult>>,
) -> Vec<FeedStatus> {
    let mut statuses = Vec::new();

    let mut session = match db.session().await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(worker, error = %e, "Worker could not acquire a database connection");
            return statuses;
        }
    };

    loop {
        // Hold the lock only long enough to pop
        let Some(podcast) = queue.lock().await.pop_front() else {
            break;
        };

        let run = update_podcast(&ctx, &mut session, &podcast, Utc::now());
        let result = match catch_task_panic(run).await {
            Ok(result) => result,
            Err(panic_msg) => {
                tracing::error!(podcast_id = podcast.id, error = %panic_msg, "Update run panicked");
                session.rollback().await;
                let failure = Failure::Database(format!("panic: {}", panic_msg));
                record_failure(&mut session, &podcast, failure, Utc::now()).await
            }
        };

        statuses.push(result.status);
        if let Some(tx) = &results {
            if let Err(e) = tx.send(result) {
                tracing::warn!(podcast_id = podcast.id, error = %e, "Result channel send failed (receiver dropped)");
            }
        }
    }

    tracing::debug!(worker, processed = statuses.len(), "Worker finished");
    statuses
}

/// Wraps a future to catch panics and convert them to the panic message.
async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| {
            if let Some(s) = panic.downcast_ref::<&'static str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                format!("Unknown panic: {:?}", (*panic).type_id())
            }
        })
}
