use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::event::EventToken;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};

type Settled<T> = Result<T, Error>;
type Continuation<T> = Box<dyn FnOnce(Settled<T>) + Send + 'static>;

struct Inner<T> {
    done: Option<Settled<T>>,
    continuations: Vec<Continuation<T>>,
    wakers: Vec<Waker>,
    dispatcher: Option<Dispatcher>,
    // Keeps the host loop alive until the operation settles.
    token: Option<EventToken>,
}

struct Shared<T> {
    state: Mutex<Inner<T>>,
    cvar: Condvar,
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn settle(&self, result: Settled<T>) {
        let (continuations, wakers, dispatcher, token) = {
            let mut inner = self.state.lock().unwrap();
            if inner.done.is_some() {
                return;
            }
            inner.done = Some(result.clone());
            (
                std::mem::take(&mut inner.continuations),
                std::mem::take(&mut inner.wakers),
                inner.dispatcher.take(),
                inner.token.take(),
            )
        };
        self.cvar.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for k in continuations {
            Self::deliver(dispatcher.as_ref(), k, result.clone());
        }
        // Scheduled continuations carry their own tokens; this one can go.
        drop(token);
    }

    fn deliver(dispatcher: Option<&Dispatcher>, k: Continuation<T>, result: Settled<T>) {
        match dispatcher {
            Some(d) => {
                if d.schedule(move || k(result), std::time::Duration::ZERO).is_err() {
                    log::warn!("promise continuation dropped, dispatcher is shut down");
                }
            }
            None => k(result),
        }
    }

    fn register(&self, k: Continuation<T>) {
        let already = {
            let mut inner = self.state.lock().unwrap();
            match &inner.done {
                Some(result) => Some((result.clone(), inner.dispatcher.clone())),
                None => {
                    inner.continuations.push(k);
                    return;
                }
            }
        };
        if let Some((result, dispatcher)) = already {
            Self::deliver(dispatcher.as_ref(), k, result);
        }
    }
}

/// One-shot result of an asynchronous coordinator operation.
///
/// A promise can be consumed three ways, matching how callers actually sit
/// relative to the dispatch loop:
///
/// * callback style with [Promise::on_resolve] / [Promise::on_reject] /
///   [Promise::finally], delivered through the dispatcher so they fire from
///   `dispatch_events` like every other event;
/// * blocking with [Promise::wait] from a thread that is not the dispatch
///   thread (or one that pumps `dispatch_events` itself);
/// * `await`, since the promise is a [Future].
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Creates a settled, already-resolved promise. Used for fail-fast paths
    /// where validation short-circuits before any async work starts.
    pub fn resolved(value: T) -> Self {
        let (promise, completer) = Self::channel(None);
        completer.resolve(value);
        promise
    }

    /// Creates a settled, already-rejected promise.
    pub fn rejected(error: Error) -> Self {
        let (promise, completer) = Self::channel(None);
        completer.reject(error);
        promise
    }

    /// Creates a pending promise plus its write end. When a dispatcher is
    /// given, continuations run on it and the promise counts as a pending
    /// event until settled.
    pub(crate) fn channel(dispatcher: Option<&Dispatcher>) -> (Self, Completer<T>) {
        let token = dispatcher.map(|d| d.token());
        let shared = Arc::new(Shared {
            state: Mutex::new(Inner {
                done: None,
                continuations: Vec::new(),
                wakers: Vec::new(),
                dispatcher: dispatcher.cloned(),
                token,
            }),
            cvar: Condvar::new(),
        });
        (
            Promise {
                shared: shared.clone(),
            },
            Completer {
                shared: Some(shared),
            },
        )
    }

    /// Registers a callback for successful settlement. Returns `self` so
    /// registrations chain.
    pub fn on_resolve<F>(self, f: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.shared.register(Box::new(move |result| {
            if let Ok(value) = result {
                f(value);
            }
        }));
        self
    }

    /// Registers a callback for rejection. Returns `self` so registrations
    /// chain.
    pub fn on_reject<F>(self, f: F) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.shared.register(Box::new(move |result| {
            if let Err(error) = result {
                f(error);
            }
        }));
        self
    }

    /// Registers a callback that runs on settlement regardless of outcome.
    pub fn finally<F>(self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.register(Box::new(move |_| f()));
        self
    }

    /// Blocks the calling thread until the promise settles.
    ///
    /// Settlement is recorded before continuations are dispatched, so waiting
    /// never depends on the dispatch loop making progress.
    pub fn wait(&self) -> Result<T, Error> {
        let mut inner = self.shared.state.lock().unwrap();
        loop {
            if let Some(result) = &inner.done {
                return result.clone();
            }
            inner = self.shared.cvar.wait(inner).unwrap();
        }
    }

    /// Non-blocking settlement check.
    pub fn try_result(&self) -> Option<Result<T, Error>> {
        self.shared.state.lock().unwrap().done.clone()
    }
}

impl<T: Clone + Send + 'static> Future for Promise<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.state.lock().unwrap();
        if let Some(result) = &inner.done {
            return Poll::Ready(result.clone());
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settled = self.shared.state.lock().unwrap().done.is_some();
        f.debug_struct("Promise").field("settled", &settled).finish()
    }
}

/// Write end of a [Promise]. Settles at most once; dropping it unsettled
/// rejects the promise so waiters are never stranded.
pub(crate) struct Completer<T: Clone + Send + 'static> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T: Clone + Send + 'static> Completer<T> {
    pub(crate) fn resolve(mut self, value: T) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Ok(value));
        }
    }

    pub(crate) fn reject(mut self, error: Error) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Err(error));
        }
    }

    pub(crate) fn settle(mut self, result: Result<T, Error>) {
        if let Some(shared) = self.shared.take() {
            shared.settle(result);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Err(Error::NotReady(
                "operation abandoned before completion",
            )));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn resolve_wakes_blocking_waiter() {
        let (promise, completer) = Promise::<u32>::channel(None);
        let handle = std::thread::spawn(move || promise.wait());
        std::thread::sleep(Duration::from_millis(20));
        completer.resolve(7);
        assert_eq!(handle.join().unwrap().unwrap(), 7);
    }

    #[test]
    fn continuations_ride_the_dispatcher() {
        let dispatcher = Dispatcher::new();
        let (promise, completer) = Promise::<u32>::channel(Some(&dispatcher));
        let hit = Arc::new(AtomicBool::new(false));
        let flag = hit.clone();
        let _promise = promise.on_resolve(move |v| flag.store(v == 7, Ordering::SeqCst));
        completer.resolve(7);
        // Not yet: settlement queues the callback, dispatch delivers it.
        assert!(!hit.load(Ordering::SeqCst));
        assert!(dispatcher.dispatch(false));
        assert!(hit.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn reject_skips_resolve_callbacks() {
        let (promise, completer) = Promise::<u32>::channel(None);
        let resolved = Arc::new(AtomicBool::new(false));
        let rejected = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let r1 = resolved.clone();
        let r2 = rejected.clone();
        let r3 = finished.clone();
        let promise = promise
            .on_resolve(move |_| r1.store(true, Ordering::SeqCst))
            .on_reject(move |_| r2.store(true, Ordering::SeqCst))
            .finally(move || r3.store(true, Ordering::SeqCst));
        completer.reject(Error::Closed);
        assert!(!resolved.load(Ordering::SeqCst));
        assert!(rejected.load(Ordering::SeqCst));
        assert!(finished.load(Ordering::SeqCst));
        assert!(promise.wait().unwrap_err().is_closed());
    }

    #[test]
    fn callbacks_registered_after_settlement_still_fire() {
        let promise = Promise::resolved(3u32);
        let hit = Arc::new(AtomicBool::new(false));
        let flag = hit.clone();
        let _promise = promise.on_resolve(move |v| flag.store(v == 3, Ordering::SeqCst));
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn dropped_completer_rejects_instead_of_hanging() {
        let (promise, completer) = Promise::<u32>::channel(None);
        drop(completer);
        assert!(matches!(promise.wait(), Err(Error::NotReady(_))));
    }

    #[tokio::test]
    async fn promise_is_awaitable() {
        let (promise, completer) = Promise::<&'static str>::channel(None);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer.resolve("done");
        });
        assert_eq!(promise.await.unwrap(), "done");
    }
}
