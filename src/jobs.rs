//! Job queue and worker pool.
//!
//! The scheduler enqueues sync jobs; a small pool of workers drains them and
//! runs the ingester. A job is marked in flight from enqueue until the worker
//! finishes, so overlapping scheduler ticks cannot double-sync a league.
//! Retries happen inside the worker with a backoff matched to the failure
//! class: rate limits wait long, transient faults wait short, fatal errors
//! are logged and dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::ingest::OddsIngester;
use crate::provider::OddsApiError;

const RATE_LIMIT_MAX_ATTEMPTS: u32 = 5;
const TRANSIENT_MAX_ATTEMPTS: u32 = 3;
const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(30);
const TRANSIENT_BASE_DELAY: Duration = Duration::from_secs(2);
const MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncJob {
    Odds { league_id: i64, league_key: String },
    Scores { league_id: i64, league_key: String },
}

impl SyncJob {
    pub fn league_key(&self) -> &str {
        match self {
            SyncJob::Odds { league_key, .. } | SyncJob::Scores { league_key, .. } => league_key,
        }
    }

    fn dedupe_key(&self) -> String {
        match self {
            SyncJob::Odds { league_key, .. } => format!("odds:{league_key}"),
            SyncJob::Scores { league_key, .. } => format!("scores:{league_key}"),
        }
    }
}

/// Sending half of the queue plus the shared in-flight set.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<SyncJob>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SyncJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            tx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        };
        (queue, rx)
    }

    /// Enqueue unless the same job is already queued or running. Returns
    /// whether the job was accepted.
    pub fn enqueue(&self, job: SyncJob) -> bool {
        let key = job.dedupe_key();
        {
            let mut set = self.in_flight.lock().unwrap();
            if !set.insert(key.clone()) {
                return false;
            }
        }
        if self.tx.try_send(job).is_err() {
            warn!(%key, "job queue full, dropping");
            self.in_flight.lock().unwrap().remove(&key);
            return false;
        }
        true
    }

    fn finish(&self, job: &SyncJob) {
        self.in_flight.lock().unwrap().remove(&job.dedupe_key());
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

/// How long to wait before attempt `attempt + 1`, or None to give up.
/// Exponential per class, capped, with up to 25% added jitter so a burst of
/// rate-limited leagues does not retry in lockstep.
pub fn retry_delay(err: &OddsApiError, attempt: u32) -> Option<Duration> {
    let (base, max_attempts) = match err {
        OddsApiError::RateLimited => (RATE_LIMIT_BASE_DELAY, RATE_LIMIT_MAX_ATTEMPTS),
        OddsApiError::Transient(_) => (TRANSIENT_BASE_DELAY, TRANSIENT_MAX_ATTEMPTS),
        OddsApiError::Fatal(_) => return None,
    };
    if attempt + 1 >= max_attempts {
        return None;
    }
    let backoff = base.saturating_mul(1u32 << attempt.min(8)).min(MAX_DELAY);
    let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
    Some(backoff + Duration::from_millis(jitter_ms))
}

/// Spawn `worker_count` workers draining `rx` until shutdown. Each worker
/// runs one job at a time; overall provider concurrency equals the pool size.
pub fn spawn_workers(
    tasks: &mut JoinSet<()>,
    worker_count: usize,
    rx: mpsc::Receiver<SyncJob>,
    queue: JobQueue,
    ingester: Arc<OddsIngester>,
    shutdown: &broadcast::Sender<()>,
) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker_id in 0..worker_count {
        let rx = rx.clone();
        let queue = queue.clone();
        let ingester = ingester.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tasks.spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    job = async { rx.lock().await.recv().await } => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                run_job(&ingester, &job, worker_id).await;
                queue.finish(&job);
            }
            info!(worker_id, "worker stopped");
        });
    }
}

async fn run_job(ingester: &OddsIngester, job: &SyncJob, worker_id: usize) {
    let mut attempt = 0u32;
    loop {
        let result = match job {
            SyncJob::Odds { league_id, league_key } => {
                ingester.sync_league_odds(*league_id, league_key).await
            }
            SyncJob::Scores { league_id, league_key } => {
                ingester.sync_league_scores(*league_id, league_key).await
            }
        };
        let err = match result {
            Ok(()) => return,
            Err(e) => e,
        };

        let delay = err
            .downcast_ref::<OddsApiError>()
            .and_then(|api_err| retry_delay(api_err, attempt));
        match delay {
            Some(delay) => {
                warn!(
                    worker_id,
                    league = job.league_key(),
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "sync failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                error!(worker_id, league = job.league_key(), error = %err, "sync failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn odds_job(key: &str) -> SyncJob {
        SyncJob::Odds { league_id: 1, league_key: key.into() }
    }

    #[test]
    fn enqueue_dedupes_in_flight_jobs() {
        let (queue, mut rx) = JobQueue::new(8);
        assert!(queue.enqueue(odds_job("basketball_nba")));
        assert!(!queue.enqueue(odds_job("basketball_nba")));
        // Scores for the same league is a distinct unit of work.
        assert!(queue.enqueue(SyncJob::Scores { league_id: 1, league_key: "basketball_nba".into() }));
        assert_eq!(queue.in_flight_len(), 2);

        let job = rx.try_recv().unwrap();
        queue.finish(&job);
        assert!(queue.enqueue(odds_job("basketball_nba")));
    }

    #[test]
    fn full_queue_rejects_and_clears_marker() {
        let (queue, _rx) = JobQueue::new(1);
        assert!(queue.enqueue(odds_job("a")));
        assert!(!queue.enqueue(odds_job("b")));
        // Rejection must not leave "b" marked, or it could never be enqueued.
        assert_eq!(queue.in_flight_len(), 1);
    }

    #[test]
    fn fatal_errors_never_retry() {
        let err = OddsApiError::Fatal("bad request".into());
        assert!(retry_delay(&err, 0).is_none());
    }

    #[test]
    fn transient_retries_are_short_and_bounded() {
        let err = OddsApiError::Transient("timeout".into());
        let first = retry_delay(&err, 0).unwrap();
        assert!(first >= TRANSIENT_BASE_DELAY);
        assert!(first <= TRANSIENT_BASE_DELAY * 2);
        assert!(retry_delay(&err, TRANSIENT_MAX_ATTEMPTS - 1).is_none());
    }

    #[test]
    fn rate_limit_retries_back_off_longer() {
        let err = OddsApiError::RateLimited;
        let first = retry_delay(&err, 0).unwrap();
        assert!(first >= RATE_LIMIT_BASE_DELAY);
        let later = retry_delay(&err, 3).unwrap();
        assert!(later > first);
        assert!(later <= MAX_DELAY + MAX_DELAY / 4);
        assert!(retry_delay(&err, RATE_LIMIT_MAX_ATTEMPTS - 1).is_none());
    }
}
