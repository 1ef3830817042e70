//! Bounded worker pool that serializes outbound upstream traffic.
//!
//! Every queued request is handed to exactly one worker, which acquires both
//! rate limiters before invoking the upstream client. At most `workers`
//! upstream POSTs are outstanding at any instant.

use crate::apicache::{synthesize_error, ApiClient, ApiError, ApiRequest, ApiResponse};
use crate::apicache::{PANIC_STATUS, PROXY_ERROR_STATUS};
use crate::ratelimit::RateLimiter;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const LIMITER_WAIT: Duration = Duration::from_secs(30);
const OVERLOAD_TTL: Duration = Duration::from_secs(5 * 60);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct WorkerReply {
    pub response: ApiResponse,
    pub worker: usize,
}

struct Job {
    request: ApiRequest,
    reply: oneshot::Sender<WorkerReply>,
}

struct WorkerStats {
    online: AtomicUsize,
    active: AtomicUsize,
    counts: Vec<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct WorkerStatsSnapshot {
    pub online: usize,
    pub active: usize,
    pub counts: Vec<u64>,
}

struct Shared {
    client: Arc<ApiClient>,
    rps: RateLimiter,
    errors: RateLimiter,
    stats: WorkerStats,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub requests_per_second: usize,
    pub max_errors: usize,
    pub error_period: Duration,
}

/// Response used when the proxy itself cannot take the request in time.
fn overload_response() -> ApiResponse {
    ApiResponse {
        body: synthesize_error(
            500,
            "APIProxy Error: proxy overloaded, request timed out.",
            OVERLOAD_TTL,
        ),
        from_cache: false,
        expires: Utc::now()
            + chrono::Duration::from_std(OVERLOAD_TTL).unwrap_or_else(|_| chrono::Duration::zero()),
        invalidate: false,
        error: ApiError::default(),
        status: PROXY_ERROR_STATUS,
    }
}

impl WorkerPool {
    pub fn start(client: Arc<ApiClient>, config: WorkerPoolConfig) -> Self {
        let workers = config.workers.max(1);
        tracing::info!(workers, "starting workers");

        let shared = Arc::new(Shared {
            client,
            rps: RateLimiter::new(
                config.requests_per_second.max(1),
                Duration::from_secs(1),
            ),
            errors: RateLimiter::new(config.max_errors.max(1), config.error_period),
            stats: WorkerStats {
                online: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                counts: (0..workers).map(|_| AtomicU64::new(0)).collect(),
            },
        });

        let (tx, rx) = mpsc::channel::<Job>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            handles.push(tokio::spawn(worker_loop(shared.clone(), rx.clone(), id)));
        }
        let watchdog = tokio::spawn(watchdog_loop(shared.clone()));

        Self {
            shared,
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            watchdog: Mutex::new(Some(watchdog)),
        }
    }

    /// Hand a request to the pool and wait for its response.
    pub async fn submit(&self, request: ApiRequest) -> WorkerReply {
        let sender = { self.tx.lock().unwrap_or_else(|p| p.into_inner()).clone() };
        let Some(sender) = sender else {
            return WorkerReply {
                response: overload_response(),
                worker: 0,
            };
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            request,
            reply: reply_tx,
        };
        if sender.send(job).await.is_err() {
            return WorkerReply {
                response: overload_response(),
                worker: 0,
            };
        }
        match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => WorkerReply {
                response: overload_response(),
                worker: 0,
            },
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            online: self.shared.stats.online.load(Ordering::Relaxed),
            active: self.shared.stats.active.load(Ordering::Relaxed),
            counts: self
                .shared
                .stats
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Live counted completions in (requests-per-second, errors) limiters.
    pub async fn limiter_counts(&self) -> (usize, usize) {
        let rps = self.shared.rps.count().await.unwrap_or(0);
        let errors = self.shared.errors.count().await.unwrap_or(0);
        (rps, errors)
    }

    /// Stop accepting work, drain the queue, then shut both limiters down.
    pub async fn close(&self) {
        let sender = self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(sender);

        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(watchdog) = self
            .watchdog
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            watchdog.abort();
        }

        if let Err(err) = self.shared.rps.close().await {
            tracing::warn!("request limiter close failed: {err}");
        }
        if let Err(err) = self.shared.errors.close().await {
            tracing::warn!("error limiter close failed: {err}");
        }
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    id: usize,
) {
    shared.stats.online.fetch_add(1, Ordering::Relaxed);
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };

        shared.stats.active.fetch_add(1, Ordering::Relaxed);
        let response = handle_one(&shared, &job.request).await;
        let _ = job.reply.send(WorkerReply {
            response,
            worker: id,
        });
        shared.stats.counts[id].fetch_add(1, Ordering::Relaxed);
        shared.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
    shared.stats.online.fetch_sub(1, Ordering::Relaxed);
}

async fn handle_one(shared: &Shared, request: &ApiRequest) -> ApiResponse {
    let (rps, errors) = tokio::join!(
        shared.rps.start(LIMITER_WAIT),
        shared.errors.start(LIMITER_WAIT)
    );

    match (rps, errors) {
        (Ok(()), Ok(())) => {}
        (Ok(()), Err(err)) => {
            let _ = shared.rps.finish(true).await;
            tracing::warn!("error limiter admission failed: {err}");
            return overload_response();
        }
        (Err(err), Ok(())) => {
            let _ = shared.errors.finish(true).await;
            tracing::warn!("request limiter admission failed: {err}");
            return overload_response();
        }
        (Err(err), Err(_)) => {
            tracing::warn!("limiter admission failed on both limiters: {err}");
            return overload_response();
        }
    }

    let response = shared.client.execute(request).await;

    let _ = shared.rps.finish(false).await;
    // Outcomes that never reached the upstream, or that the upstream has
    // already throttled us for, do not count toward the error window.
    let uncounted = response.error.code == 0
        || matches!(response.status, PANIC_STATUS | PROXY_ERROR_STATUS);
    let _ = shared.errors.finish(uncounted).await;

    response
}

async fn watchdog_loop(shared: Arc<Shared>) {
    let mut last: Vec<u64> = vec![0; shared.stats.counts.len()];
    let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for (id, counter) in shared.stats.counts.iter().enumerate() {
            let current = counter.load(Ordering::Relaxed);
            if current != 0 && current == last[id] {
                tracing::warn!(worker = id, count = current, "worker appears stalled");
            }
            last[id] = current;
        }
    }
}
