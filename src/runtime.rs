use crate::dispatch::Dispatcher;
use crate::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// How long [Runtime::shutdown] keeps draining callbacks before giving up
/// on stragglers and tearing the executors down anyway.
const DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// A dedicated thread driving a single-threaded tokio reactor.
///
/// Work submitted through [ExecutionContext::spawn] runs on that thread and
/// nowhere else, which is what gives each context its ordering guarantee.
pub(crate) struct ExecutionContext {
    name: &'static str,
    handle: tokio::runtime::Handle,
    stop: Arc<Notify>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ExecutionContext {
    fn start(name: &'static str) -> Result<Self, Error> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(format!("{name} reactor: {e}")))?;
        let handle = rt.handle().clone();
        let stop = Arc::new(Notify::new());
        let stopped = stop.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                rt.block_on(async move { stopped.notified().await });
            })
            .map_err(|e| Error::Runtime(format!("{name} thread: {e}")))?;
        Ok(ExecutionContext {
            name,
            handle,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    fn stop(&self) {
        self.stop.notify_waiters();
        self.stop.notify_one();
        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                log::warn!("{} executor thread panicked during shutdown", self.name);
            }
        }
    }
}

/// Process-wide execution environment for coordinators.
///
/// Owns the three executor threads and the callback [Dispatcher]. Nothing
/// here is implicit global state: a coordinator runs on exactly the runtime
/// it was created with, and dropping the last [Runtime] handle after
/// [Runtime::shutdown] releases every thread.
///
/// The three contexts split responsibilities the same way the engine does
/// internally: `network` hosts engine construction and teardown, `worker`
/// carries media readers, `signaling` runs negotiation operations so that
/// description and candidate handling is serialized by construction.
pub struct Runtime {
    dispatcher: Dispatcher,
    network: ExecutionContext,
    worker: ExecutionContext,
    signaling: ExecutionContext,
    closed: AtomicBool,
}

impl Runtime {
    pub fn new() -> Result<Arc<Self>, Error> {
        Ok(Arc::new(Runtime {
            dispatcher: Dispatcher::new(),
            network: ExecutionContext::start("network")?,
            worker: ExecutionContext::start("worker")?,
            signaling: ExecutionContext::start("signaling")?,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Runs queued callbacks on the calling thread. See
    /// [Dispatcher::dispatch] for the blocking semantics.
    pub fn dispatch_events(&self, blocking: bool) -> bool {
        self.dispatcher.dispatch(blocking)
    }

    /// Count of outstanding async operations and open resources.
    pub fn pending_events(&self) -> i64 {
        self.dispatcher.pending()
    }

    /// Posts a closure onto the dispatch queue, runnable no earlier than
    /// `delay`. Fails with [Error::NotReady] after shutdown.
    pub fn schedule<F>(&self, f: F, delay: Duration) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.schedule(f, delay)
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn network(&self) -> &ExecutionContext {
        &self.network
    }

    pub(crate) fn worker(&self) -> &ExecutionContext {
        &self.worker
    }

    pub(crate) fn signaling(&self) -> &ExecutionContext {
        &self.signaling
    }

    /// Tears the runtime down. Idempotent.
    ///
    /// Pending callbacks are drained on the calling thread for a bounded
    /// period first, so work already promised to the consumer still gets
    /// delivered; anything queued after that is dropped.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = Instant::now() + DRAIN_BUDGET;
        while self.dispatcher.pending() > 0 && Instant::now() < deadline {
            if !self.dispatcher.dispatch(false) {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        if self.dispatcher.pending() > 0 {
            log::warn!(
                "runtime shutdown with {} events still pending",
                self.dispatcher.pending()
            );
        }
        self.dispatcher.shutdown();
        self.signaling.stop();
        self.worker.stop();
        self.network.stop();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pending_events", &self.pending_events())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
