//! Generic sliding-window rate limiter.
//!
//! Limits how many tasks may *complete* inside any window of `period`, and
//! refuses to admit new tasks whose completion could break that limit. Every
//! admitted task must call [`RateLimiter::finish`] exactly once; completions
//! finished with `skip = true` do not count toward the cap.
//!
//! All state lives in a single owner task. Callers talk to it over channels,
//! so admission is FIFO in the order the owner receives start requests.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("timeout waiting for clearance to continue")]
    Timeout,
    #[error("rate limiter already closed")]
    Closed,
    #[error("events still outstanding at close")]
    Outstanding,
}

enum Query {
    Count(oneshot::Sender<usize>),
    Outstanding(oneshot::Sender<usize>),
}

pub struct RateLimiter {
    start_tx: mpsc::Sender<oneshot::Sender<()>>,
    finish_tx: mpsc::Sender<bool>,
    query_tx: mpsc::Sender<Query>,
    close_tx: mpsc::Sender<oneshot::Sender<Result<(), RateLimitError>>>,
}

impl RateLimiter {
    pub fn new(max_events: usize, period: Duration) -> Self {
        let (start_tx, start_rx) = mpsc::channel(max_events.max(1));
        let (finish_tx, finish_rx) = mpsc::channel((max_events * 2).max(2));
        let (query_tx, query_rx) = mpsc::channel(8);
        let (close_tx, close_rx) = mpsc::channel(1);

        let state = LimiterLoop {
            max_events,
            period,
            outstanding: 0,
            live: 0,
            events: BTreeMap::new(),
        };
        tokio::spawn(state.run(start_rx, finish_rx, query_rx, close_rx));

        Self {
            start_tx,
            finish_tx,
            query_tx,
            close_tx,
        }
    }

    /// Block until the task may begin. A zero timeout waits forever.
    pub async fn start(&self, timeout: Duration) -> Result<(), RateLimitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.start_tx
            .send(reply_tx)
            .await
            .map_err(|_| RateLimitError::Closed)?;

        if timeout.is_zero() {
            return reply_rx.await.map_err(|_| RateLimitError::Closed);
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RateLimitError::Closed),
            Err(_) => Err(RateLimitError::Timeout),
        }
    }

    /// Signal completion. With `skip` the completion is not counted toward
    /// the cap (the work never actually reached the upstream).
    pub async fn finish(&self, skip: bool) -> Result<(), RateLimitError> {
        self.finish_tx
            .send(skip)
            .await
            .map_err(|_| RateLimitError::Closed)
    }

    /// Number of unexpired counted completions.
    pub async fn count(&self) -> Result<usize, RateLimitError> {
        let (tx, rx) = oneshot::channel();
        self.query_tx
            .send(Query::Count(tx))
            .await
            .map_err(|_| RateLimitError::Closed)?;
        rx.await.map_err(|_| RateLimitError::Closed)
    }

    /// Number of admitted tasks that have not yet finished.
    pub async fn outstanding(&self) -> Result<usize, RateLimitError> {
        let (tx, rx) = oneshot::channel();
        self.query_tx
            .send(Query::Outstanding(tx))
            .await
            .map_err(|_| RateLimitError::Closed)?;
        rx.await.map_err(|_| RateLimitError::Closed)
    }

    /// Shut the limiter down. Errors when tasks are still outstanding; a
    /// second close (and any later start/finish) reports `Closed`.
    pub async fn close(&self) -> Result<(), RateLimitError> {
        let (tx, rx) = oneshot::channel();
        self.close_tx
            .send(tx)
            .await
            .map_err(|_| RateLimitError::Closed)?;
        rx.await.map_err(|_| RateLimitError::Closed)?
    }
}

struct LimiterLoop {
    max_events: usize,
    period: Duration,
    outstanding: usize,
    live: usize,
    events: BTreeMap<Instant, usize>,
}

impl LimiterLoop {
    fn admitting(&self) -> bool {
        self.outstanding + self.live < self.max_events
    }

    fn prune(&mut self, now: Instant) {
        while let Some((&at, &count)) = self.events.first_key_value() {
            if at > now {
                break;
            }
            self.events.remove(&at);
            self.live = self.live.saturating_sub(count);
        }
    }

    fn on_finish(&mut self, skip: bool) {
        self.prune(Instant::now());
        if !skip {
            *self.events.entry(Instant::now() + self.period).or_insert(0) += 1;
            self.live += 1;
        }
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    async fn run(
        mut self,
        mut start_rx: mpsc::Receiver<oneshot::Sender<()>>,
        mut finish_rx: mpsc::Receiver<bool>,
        mut query_rx: mpsc::Receiver<Query>,
        mut close_rx: mpsc::Receiver<oneshot::Sender<Result<(), RateLimitError>>>,
    ) {
        loop {
            let next_expire = self.events.keys().next().copied();

            tokio::select! {
                biased;

                // Single timer armed at the earliest remaining expiry.
                _ = async { tokio::time::sleep_until(next_expire.unwrap()).await },
                        if next_expire.is_some() => {
                    self.prune(Instant::now());
                }

                finish = finish_rx.recv() => match finish {
                    Some(skip) => self.on_finish(skip),
                    None => break,
                },

                query = query_rx.recv() => {
                    if let Some(query) = query {
                        match query {
                            Query::Count(reply) => {
                                self.prune(Instant::now());
                                let _ = reply.send(self.live);
                            }
                            Query::Outstanding(reply) => {
                                let _ = reply.send(self.outstanding);
                            }
                        }
                    }
                }

                close = close_rx.recv() => {
                    if let Some(reply) = close {
                        let result = if self.outstanding > 0 {
                            Err(RateLimitError::Outstanding)
                        } else {
                            Ok(())
                        };
                        let _ = reply.send(result);
                    }
                    break;
                }

                // Only attended while admission cannot break the cap.
                grant = start_rx.recv(), if self.admitting() => match grant {
                    Some(reply) => {
                        // A caller that timed out between enqueue and grant
                        // must not consume an in-flight slot.
                        if reply.send(()).is_ok() {
                            self.outstanding += 1;
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("rate limiter loop shut down");
    }
}
