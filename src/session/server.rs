//! Reference-counted shared provider server.
//!
//! Some providers run a single out-of-process HTTP/SSE server shared by all
//! sessions. The pool starts it lazily on first acquire, keeps it alive
//! while at least one session holds a lease, and stops it when the last
//! lease is released. Acquire tolerates concurrent callers and starts
//! exactly one server.

use anyhow::Result;
use tokio::sync::Mutex;

type StartFn<S> = Box<dyn Fn() -> Result<S> + Send + Sync>;
type StopFn<S> = Box<dyn Fn(&mut S) + Send + Sync>;

struct PoolState<S> {
    server: Option<S>,
    refcount: usize,
    starts: u64,
}

/// Refcounted lazy server lifecycle.
pub struct ServerPool<S: Send> {
    start: StartFn<S>,
    stop: StopFn<S>,
    state: Mutex<PoolState<S>>,
}

impl<S: Send> ServerPool<S> {
    /// Build a pool with the given start/stop hooks. Nothing runs until the
    /// first [`Self::acquire`].
    #[must_use]
    pub fn new(
        start: impl Fn() -> Result<S> + Send + Sync + 'static,
        stop: impl Fn(&mut S) + Send + Sync + 'static,
    ) -> Self {
        Self {
            start: Box::new(start),
            stop: Box::new(stop),
            state: Mutex::new(PoolState {
                server: None,
                refcount: 0,
                starts: 0,
            }),
        }
    }

    /// Take a lease, starting the server if this is the first holder.
    ///
    /// # Errors
    /// Propagates the start hook's failure; the refcount is untouched on
    /// error.
    pub async fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.server.is_none() {
            state.server = Some((self.start)()?);
            state.starts += 1;
            tracing::debug!("started shared provider server");
        }
        state.refcount += 1;
        Ok(())
    }

    /// Release a lease, stopping the server when the last one goes.
    /// Releasing without a matching acquire is a no-op.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if state.refcount == 0 {
            return;
        }
        state.refcount -= 1;
        if state.refcount == 0
            && let Some(mut server) = state.server.take()
        {
            (self.stop)(&mut server);
            tracing::debug!("stopped shared provider server");
        }
    }

    /// Current lease count.
    pub async fn refcount(&self) -> usize {
        self.state.lock().await.refcount
    }

    /// How many times the server has been started over the pool's lifetime.
    pub async fn start_count(&self) -> u64 {
        self.state.lock().await.starts
    }
}
