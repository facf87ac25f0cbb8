//! Rate-limited schedulers: two reusable families behind a common
//! `Scheduler` trait. A single accumulating queue drained one job at a
//! time (`KoreanSerializer`, for Upbit/Bithumb, which 429 aggressively)
//! and a chunked-concurrency queue (`GlobalChunkedScheduler`, for
//! Binance/OKX, which tolerate a handful of concurrent calls).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Processing,
    Paused,
}

/// A unit of rate-limited work: an opaque async closure plus a channel
/// to report back its outcome.
pub struct Job {
    pub task: Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<(), AppError>> + Send>,
    pub reply: oneshot::Sender<Result<(), AppError>>,
}

#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    /// Enqueues one job; await its `oneshot` to learn the outcome.
    async fn submit(&self, task: Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<(), AppError>> + Send>) -> Result<(), AppError>;

    /// Fails every queued (not yet started) job with `AppError::Cancelled`.
    async fn clear_queue(&self);

    fn state(&self) -> SchedulerState;
}

struct Inner {
    queue: VecDeque<Job>,
    state: SchedulerState,
}

/// Single-concurrency queue with fixed inter-call spacing and a pause
/// window on rate-limit, used for Upbit and Bithumb: 150ms spacing,
/// pause 3s on 429.
pub struct KoreanSerializer {
    inner: Arc<Mutex<Inner>>,
    notify: mpsc::UnboundedSender<()>,
}

impl KoreanSerializer {
    const SPACING: Duration = Duration::from_millis(150);
    const PAUSE_ON_RATE_LIMIT: Duration = Duration::from_secs(3);

    pub fn new() -> Arc<Self> {
        let inner = Arc::new(Mutex::new(Inner {
            queue: VecDeque::new(),
            state: SchedulerState::Idle,
        }));
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let worker_inner = inner.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    let job = {
                        let mut guard = worker_inner.lock().await;
                        match guard.queue.pop_front() {
                            Some(job) => {
                                guard.state = SchedulerState::Processing;
                                Some(job)
                            }
                            None => {
                                guard.state = SchedulerState::Idle;
                                None
                            }
                        }
                    };
                    let Some(job) = job else { break };
                    let result = (job.task)().await;
                    let rate_limited = matches!(result, Err(AppError::RateLimited { .. }));
                    let _ = job.reply.send(result);

                    if rate_limited {
                        let mut guard = worker_inner.lock().await;
                        guard.state = SchedulerState::Paused;
                        drop(guard);
                        warn!("rate limited, pausing queue for {:?}", Self::PAUSE_ON_RATE_LIMIT);
                        tokio::time::sleep(Self::PAUSE_ON_RATE_LIMIT).await;
                    } else {
                        tokio::time::sleep(Self::SPACING).await;
                    }
                }
            }
        });

        Arc::new(KoreanSerializer { inner, notify: tx })
    }
}

#[async_trait::async_trait]
impl Scheduler for KoreanSerializer {
    async fn submit(&self, task: Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<(), AppError>> + Send>) -> Result<(), AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut guard = self.inner.lock().await;
            guard.queue.push_back(Job { task, reply: reply_tx });
        }
        let _ = self.notify.send(());
        reply_rx.await.unwrap_or(Err(AppError::Cancelled))
    }

    async fn clear_queue(&self) {
        let mut guard = self.inner.lock().await;
        let drained: Vec<Job> = guard.queue.drain(..).collect();
        guard.state = SchedulerState::Idle;
        drop(guard);
        for job in drained {
            let _ = job.reply.send(Err(AppError::Cancelled));
        }
    }

    fn state(&self) -> SchedulerState {
        // best-effort snapshot; exact lock-free read isn't needed since
        // this is only used for diagnostics/admin endpoints.
        self.inner.try_lock().map(|g| g.state).unwrap_or(SchedulerState::Processing)
    }
}

/// Chunked-concurrency queue: drains `chunk_size` jobs concurrently, then
/// waits `delay` before draining the next chunk. Used for Binance
/// (chunk_size=3, delay=500ms) and OKX (chunk_size=5, delay=1000ms).
pub struct GlobalChunkedScheduler {
    inner: Arc<Mutex<Inner>>,
    notify: mpsc::UnboundedSender<()>,
}

impl GlobalChunkedScheduler {
    pub fn new(chunk_size: usize, delay: Duration) -> Arc<Self> {
        let inner = Arc::new(Mutex::new(Inner {
            queue: VecDeque::new(),
            state: SchedulerState::Idle,
        }));
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let worker_inner = inner.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    let mut chunk = Vec::new();
                    {
                        let mut guard = worker_inner.lock().await;
                        for _ in 0..chunk_size {
                            match guard.queue.pop_front() {
                                Some(job) => chunk.push(job),
                                None => break,
                            }
                        }
                        guard.state = if chunk.is_empty() { SchedulerState::Idle } else { SchedulerState::Processing };
                    }
                    if chunk.is_empty() {
                        break;
                    }

                    let mut rate_limited_any = false;
                    let futs: Vec<_> = chunk
                        .into_iter()
                        .map(|job| async move {
                            let result = (job.task)().await;
                            let hit_limit = matches!(result, Err(AppError::RateLimited { .. }));
                            let _ = job.reply.send(result);
                            hit_limit
                        })
                        .collect();
                    for hit in futures::future::join_all(futs).await {
                        rate_limited_any |= hit;
                    }

                    if rate_limited_any {
                        let mut guard = worker_inner.lock().await;
                        guard.state = SchedulerState::Paused;
                        drop(guard);
                        warn!("chunked scheduler hit a rate limit, pausing for {:?}", delay * 6);
                        tokio::time::sleep(delay * 6).await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        info!(chunk_size, ?delay, "started chunked scheduler");
        Arc::new(GlobalChunkedScheduler { inner, notify: tx })
    }
}

#[async_trait::async_trait]
impl Scheduler for GlobalChunkedScheduler {
    async fn submit(&self, task: Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<(), AppError>> + Send>) -> Result<(), AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut guard = self.inner.lock().await;
            guard.queue.push_back(Job { task, reply: reply_tx });
        }
        let _ = self.notify.send(());
        reply_rx.await.unwrap_or(Err(AppError::Cancelled))
    }

    async fn clear_queue(&self) {
        let mut guard = self.inner.lock().await;
        let drained: Vec<Job> = guard.queue.drain(..).collect();
        guard.state = SchedulerState::Idle;
        drop(guard);
        for job in drained {
            let _ = job.reply.send(Err(AppError::Cancelled));
        }
    }

    fn state(&self) -> SchedulerState {
        self.inner.try_lock().map(|g| g.state).unwrap_or(SchedulerState::Processing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn korean_serializer_runs_jobs_and_reports_success() {
        let scheduler = KoreanSerializer::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let result = scheduler
            .submit(Box::new(move || {
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await;
        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_queue_cancels_pending_jobs() {
        let scheduler = KoreanSerializer::new();
        // Submit a slow job to occupy the worker, then clear the queue
        // before it drains the second job.
        let slow = scheduler.submit(Box::new(|| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let inner = scheduler.inner.clone();
        {
            let mut guard = inner.lock().await;
            let (tx, rx) = oneshot::channel();
            guard.queue.push_back(Job {
                task: Box::new(|| Box::pin(async move { Ok(()) })),
                reply: tx,
            });
            drop(guard);
            scheduler.clear_queue().await;
            let outcome = rx.await.unwrap();
            assert!(matches!(outcome, Err(AppError::Cancelled)));
        }
        let _ = slow.await;
    }

    #[tokio::test]
    async fn chunked_scheduler_runs_concurrent_jobs() {
        let scheduler = GlobalChunkedScheduler::new(3, Duration::from_millis(10));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let c = counter.clone();
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .submit(Box::new(move || {
                        Box::pin(async move {
                            c.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                    }))
                    .await
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }
}
