//! Blocking, retrying pool front end.
//!
//! [`BufPool`] owns one [`MemPool`] and hands out [`SurfaceWrapperPtr`]s.
//! Requests refused for a transient reason (pool empty, hardware busy) are
//! retried with exponential backoff until the caller's timeout elapses.
//!
//! Stopping the pool with [`BufPool::destroy_pool`] makes every later
//! request fail at once; it is the only way to cancel a waiting caller.

use crate::config::RetryConfig;
use crate::context::BufSurfaceContext;
use crate::error::{Error, Result};
use crate::params::CreateParams;
use crate::pool::MemPool;
use crate::wrapper::{SurfaceWrapper, SurfaceWrapperPtr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Doubling sleep bounded by a deadline.
#[derive(Debug)]
struct Backoff {
    next: Duration,
    max: Duration,
    deadline: Instant,
}

impl Backoff {
    fn new(retry: &RetryConfig, timeout: Duration) -> Self {
        Self {
            next: retry.initial_backoff,
            max: retry.max_backoff,
            deadline: Instant::now() + timeout,
        }
    }

    /// Sleep before the next attempt, or return `false` once the deadline
    /// has passed.
    fn wait(&mut self) -> bool {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        std::thread::sleep(self.next.min(remaining));
        self.next = (self.next * 2).min(self.max);
        true
    }
}

#[derive(Debug, Default)]
struct State {
    pool: Option<Arc<MemPool>>,
    stopped: bool,
}

/// Convenience owner of one memory pool.
///
/// # Teardown
///
/// Dropping a `BufPool` destroys its pool, and destroying a pool waits
/// for every surface it handed out. Drop all wrappers before dropping the
/// `BufPool` on the same thread.
#[derive(Debug)]
pub struct BufPool {
    ctx: BufSurfaceContext,
    retry: RetryConfig,
    state: Mutex<State>,
}

impl BufPool {
    /// Create an empty front end using the context's retry policy.
    pub fn new(ctx: &BufSurfaceContext) -> Self {
        Self {
            ctx: ctx.clone(),
            retry: ctx.config().retry,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the pool.
    ///
    /// # Errors
    ///
    /// Fails if a pool is already running or the pool cannot be created.
    pub fn create_pool(&self, params: &CreateParams, block_count: u32) -> Result<()> {
        let mut state = self.lock();
        if state.pool.is_some() && !state.stopped {
            return Err(Error::InvalidArgument("pool is already created".into()));
        }
        let pool = self
            .ctx
            .pool_create(params, block_count)
            .inspect_err(|e| error!(error = %e, "create surface pool failed"))?;
        state.pool = Some(pool);
        state.stopped = false;
        debug!(block_count, "buffer pool created");
        Ok(())
    }

    /// The underlying pool, while one exists.
    pub fn pool(&self) -> Option<Arc<MemPool>> {
        self.lock().pool.clone()
    }

    /// Whether the pool has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Stop the pool and destroy it.
    ///
    /// Stopping is immediate. Destruction waits for outstanding surfaces to
    /// come back without a time limit; `timeout` bounds only the retries of
    /// a destroy that the backend refused as busy. A second call is a
    /// no-op.
    pub fn destroy_pool(&self, timeout: Duration) -> Result<()> {
        let pool = {
            let mut state = self.lock();
            if state.stopped {
                info!("buffer pool already stopped");
                return Ok(());
            }
            state.stopped = true;
            match state.pool.clone() {
                Some(pool) => pool,
                None => return Ok(()),
            }
        };

        let mut backoff = Backoff::new(&self.retry, timeout);
        let result = loop {
            match pool.destroy() {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retryable() => {
                    trace!(error = %e, "pool destroy refused, retrying");
                    if !backoff.wait() {
                        error!(?timeout, "gave up destroying buffer pool");
                        return Err(Error::Timeout(timeout));
                    }
                }
                Err(e) => {
                    error!(error = %e, "buffer pool destroy failed");
                    break Err(e);
                }
            }
        };
        self.lock().pool = None;
        result
    }

    /// Take one surface, retrying while the pool is empty.
    ///
    /// # Errors
    ///
    /// [`Error::NotCreated`] if the pool was never created or has been
    /// stopped, [`Error::Timeout`] if no surface came free in time.
    pub fn get_surface_wrapper(&self, timeout: Duration) -> Result<SurfaceWrapperPtr> {
        let mut backoff = Backoff::new(&self.retry, timeout);
        loop {
            let pool = {
                let state = self.lock();
                if state.stopped {
                    error!("buffer pool is stopped");
                    return Err(Error::NotCreated);
                }
                state.pool.clone().ok_or_else(|| {
                    error!("buffer pool is not created");
                    Error::NotCreated
                })?
            };

            match self.ctx.create_from_pool(&pool) {
                Ok(surface) => return Ok(SurfaceWrapper::new(&self.ctx, surface)),
                Err(e) if e.is_retryable() => {
                    trace!(error = %e, "no surface available, retrying");
                    if !backoff.wait() {
                        debug!(?timeout, "timed out waiting for a surface");
                        return Err(Error::Timeout(timeout));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for BufPool {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_pool(self.retry.drop_timeout) {
            error!(error = %e, "buffer pool teardown on drop failed");
        }
    }
}
