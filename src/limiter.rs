//! Tools for limiting the number of concurrent expensive tasks.
//!
//! A [`Limiter`] is a named counting semaphore. The OCR limiter is created
//! once at startup and handed to every [`crate::pipeline::Pipeline`], so the
//! bound applies to the whole process, not to a single submission. Clones
//! share the same permits.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::prelude::*;

/// A bounded pool of permits shared by every task that clones it.
#[derive(Clone, Debug)]
pub struct Limiter {
    /// Used in logs and errors.
    name: &'static str,
    /// Fixed at construction.
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

/// A permit drawn from a [`Limiter`]. Dropping it returns the permit, which
/// also happens during panic unwinding and when the owning task is aborted.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Limiter {
    /// Create a new limiter with `capacity` permits.
    pub fn new(name: &'static str, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("{} limiter needs at least one permit", name));
        }
        Ok(Self {
            name,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        })
    }

    /// A limiter sized to the number of CPUs, for external processes that
    /// each want a whole core.
    pub fn for_cpus(name: &'static str) -> Self {
        let capacity = num_cpus::get().max(1);
        Self {
            name,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// How many permits this limiter was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many permits are free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a permit.
    #[instrument(level = "trace", skip_all, fields(limiter = self.name))]
    pub async fn acquire(&self) -> Result<Permit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .with_context(|| format!("could not acquire {} permit", self.name))?;
        Ok(Permit { _permit: permit })
    }

    /// Call an async function while holding a permit.
    ///
    /// We do this to limit the number of external processes that are each
    /// trying to use 100% of a CPU core.
    pub async fn run<Func, Fut, R>(&self, f: Func) -> Result<R>
    where
        Func: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let permit = self.acquire().await?;
        let result = f().await;
        drop(permit);
        result
    }
}
