// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Pool
//!
//! A bounded pool of transport handles with eager growth up to capacity and
//! fallback waiting:
//!
//! 1. an idle handle that is still open is handed out immediately,
//! 2. otherwise, if fewer than `max_connections` handles exist, a slot is
//!    reserved atomically and a new handle is created through the resilience
//!    pipeline,
//! 3. otherwise the caller polls until a handle is returned.
//!
//! Handles are handed out as [`Lease`]s. A lease goes back to the pool exactly
//! once, either through [`Lease::release`] or when it is dropped, so every exit
//! path of a caller returns it.
//!
//! The idle set is a lock-free queue and the created-count only moves through
//! compare-and-swap, so the pool never holds more than its maximum.

use crate::{
    errors::{BrokerError, BrokerResult},
    metrics::BrokerMetrics,
    resilience::ResiliencePipeline,
    settings::BrokerSettings,
    transport::{Channel, HandleFactory, TransportHandle},
};
use crossbeam_queue::SegQueue;
use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

/// Bounded pool of handles created by `F`. Clones share the same pool.
pub struct Pool<F: HandleFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: HandleFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<F: HandleFactory> {
    factory: F,
    idle: SegQueue<F::Handle>,
    created: AtomicUsize,
    max_size: usize,
    poll_interval: Duration,
    acquire_timeout: Option<Duration>,
    closed: AtomicBool,
    pipeline: ResiliencePipeline,
    metrics: Arc<BrokerMetrics>,
}

impl<F: HandleFactory> Pool<F> {
    /// Creates an empty pool. No handle is opened until the first acquire.
    ///
    /// # Parameters
    /// * `factory` - Opens new handles for the pool
    /// * `settings` - Capacity, poll interval, acquire timeout and retry policy
    /// * `metrics` - Receives lease and link counters
    ///
    /// # Returns
    /// A pool that can be cloned and shared between producers and consumers
    pub fn new(factory: F, settings: &BrokerSettings, metrics: Arc<BrokerMetrics>) -> Self {
        let pipeline =
            ResiliencePipeline::from_settings(format!("{}.connect", factory.transport()), settings);

        Pool {
            inner: Arc::new(PoolInner {
                factory,
                idle: SegQueue::new(),
                created: AtomicUsize::new(0),
                max_size: settings.max_connections.max(1),
                poll_interval: settings.acquire_poll_interval(),
                acquire_timeout: settings.acquire_timeout(),
                closed: AtomicBool::new(false),
                pipeline,
                metrics,
            }),
        }
    }

    /// Leases a handle, waiting while the pool is at capacity.
    ///
    /// # Returns
    /// A lease on an open handle, `AcquireTimeout` when the configured wait
    /// ran out, or `PoolClosed` once [`Pool::close`] was called
    pub async fn acquire(&self) -> BrokerResult<Lease<F>> {
        let handle = match self.inner.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.acquire_handle())
                .await
                .map_err(|_| {
                    warn!(
                        transport = self.inner.factory.transport(),
                        timeout_ms = limit.as_millis() as u64,
                        "no channel became available"
                    );
                    BrokerError::AcquireTimeout(limit)
                })??,
            None => self.inner.acquire_handle().await?,
        };

        self.inner.metrics.connection_opened();
        Ok(Lease {
            handle: Some(handle),
            pool: self.inner.clone(),
        })
    }

    /// Stops handing out leases and closes every idle handle. Leases still in
    /// flight are closed when they come back.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut closed = 0usize;
        while let Some(handle) = self.inner.idle.pop() {
            self.inner.forget();
            if handle.is_open() {
                if let Err(err) = handle.close().await {
                    warn!(error = err.to_string(), "failure to close idle channel");
                }
            }
            closed += 1;
        }

        info!(
            transport = self.inner.factory.transport(),
            closed, "channel pool closed"
        );
    }

    /// True once [`Pool::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Handles currently alive, leased or idle.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Handles waiting in the idle set.
    pub fn idle(&self) -> usize {
        self.inner.idle.len()
    }

    /// Upper bound on [`Pool::created`].
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Lease and link counters of this pool.
    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.inner.metrics
    }

    /// The factory new handles come from.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

/// Created-count slot taken before a handle exists. Dropping it without
/// committing gives the slot back.
struct Reservation<'a> {
    created: &'a AtomicUsize,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) -> usize {
        self.armed = false;
        self.created.load(Ordering::SeqCst)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.created.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<F: HandleFactory> PoolInner<F> {
    async fn acquire_handle(&self) -> BrokerResult<F::Handle> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::PoolClosed);
            }

            if let Some(handle) = self.take_open() {
                return Ok(handle);
            }

            if let Some(reservation) = self.reserve() {
                let factory = &self.factory;
                let handle = self.pipeline.execute(move || factory.create()).await?;
                let created = reservation.commit();
                self.metrics.link_opened();
                debug!(
                    transport = self.factory.transport(),
                    created,
                    max = self.max_size,
                    "channel created"
                );
                return Ok(handle);
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn take_open(&self) -> Option<F::Handle> {
        while let Some(handle) = self.idle.pop() {
            if handle.is_open() {
                return Some(handle);
            }
            self.forget();
            debug!(transport = self.factory.transport(), "discarded closed idle channel");
        }
        None
    }

    fn reserve(&self) -> Option<Reservation<'_>> {
        self.created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.max_size).then_some(count + 1)
            })
            .ok()
            .map(|_| Reservation {
                created: &self.created,
                armed: true,
            })
    }

    fn give_back(&self, handle: F::Handle) {
        self.metrics.connection_closed();

        if !handle.is_open() {
            self.forget();
            debug!(transport = self.factory.transport(), "discarded closed channel");
            return;
        }

        if self.closed.load(Ordering::SeqCst) {
            self.retire(handle);
            return;
        }

        self.idle.push(handle);

        // close() may have drained the idle set between the check and the push
        if self.closed.load(Ordering::SeqCst) {
            while let Some(handle) = self.idle.pop() {
                self.retire(handle);
            }
        }
    }

    fn forget(&self) {
        self.created.fetch_sub(1, Ordering::SeqCst);
        self.metrics.link_closed();
    }

    fn retire(&self, handle: F::Handle) {
        self.forget();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = handle.close().await {
                    warn!(error = err.to_string(), "failure to close returned channel");
                }
            });
        }
    }
}

/// Exclusive use of one pooled handle until released or dropped.
pub struct Lease<F: HandleFactory> {
    handle: Option<F::Handle>,
    pool: Arc<PoolInner<F>>,
}

impl<F: HandleFactory> Lease<F> {
    /// Returns the handle to its pool.
    pub fn release(mut self) {
        self.return_to_pool();
    }

    fn return_to_pool(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.give_back(handle);
        }
    }
}

impl<F: HandleFactory> Deref for Lease<F> {
    type Target = F::Handle;

    fn deref(&self) -> &F::Handle {
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<F: HandleFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("transport", &self.pool.factory.transport())
            .field("held", &self.handle.is_some())
            .finish()
    }
}

impl<F: HandleFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        self.return_to_pool();
    }
}
