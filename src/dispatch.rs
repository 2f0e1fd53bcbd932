use crate::error::Error;
use crate::event::EventToken;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Upper bound on a single blocking wait, so a missed wakeup never parks the
/// host loop for good.
const WAIT_SLICE: Duration = Duration::from_millis(1000);

type Work = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    run: Work,
    _token: EventToken,
}

struct TimedJob {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimedJob {}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct DispatchState {
    ready: VecDeque<Job>,
    timed: BinaryHeap<Reverse<TimedJob>>,
    live_tokens: i64,
    seq: u64,
    shutdown: bool,
}

impl DispatchState {
    /// Moves every due timed job onto the ready queue, preserving deadline
    /// order and, within one deadline, submission order.
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(head)) = self.timed.peek() {
            if head.due > now {
                break;
            }
            if let Some(Reverse(timed)) = self.timed.pop() {
                self.ready.push_back(timed.job);
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.timed.peek().map(|Reverse(t)| t.due)
    }
}

/// Shared queue/counter pair between the dispatcher and every [EventToken].
pub(crate) struct DispatchShared {
    state: Mutex<DispatchState>,
    cvar: Condvar,
}

impl DispatchShared {
    pub(crate) fn token_acquired(&self) {
        let mut state = self.state.lock().unwrap();
        state.live_tokens += 1;
    }

    pub(crate) fn token_released(&self) {
        let mut state = self.state.lock().unwrap();
        state.live_tokens -= 1;
        drop(state);
        self.cvar.notify_all();
    }

    pub(crate) fn pending(&self) -> i64 {
        self.state.lock().unwrap().live_tokens
    }
}

/// Bridges engine-thread callbacks onto a queue the host application drains
/// from its own thread. Engine callbacks never call into consumer code
/// directly; they post closures here and the consumer runs them through
/// [Dispatcher::dispatch].
pub struct Dispatcher {
    shared: Arc<DispatchShared>,
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        Dispatcher {
            shared: self.shared.clone(),
        }
    }
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Dispatcher {
            shared: Arc::new(DispatchShared {
                state: Mutex::new(DispatchState::default()),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Acquires a liveness token keeping the loop alive until dropped.
    pub(crate) fn token(&self) -> EventToken {
        EventToken::new(self.shared.clone())
    }

    /// Posts `f` to run on the dispatch thread no earlier than `delay` from
    /// now. After [Dispatcher::shutdown] this is a no-op failure, never a
    /// crash.
    pub fn schedule<F>(&self, f: F, delay: Duration) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        // Token construction locks the state mutex, keep it outside.
        let token = self.token();
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            drop(state);
            // `token` drops here and re-locks; fine, the lock is released.
            return Err(Error::NotReady("dispatcher is shut down"));
        }
        let job = Job {
            run: Box::new(f),
            _token: token,
        };
        if delay.is_zero() {
            state.ready.push_back(job);
        } else {
            state.seq += 1;
            let seq = state.seq;
            state.timed.push(Reverse(TimedJob {
                due: Instant::now() + delay,
                seq,
                job,
            }));
        }
        drop(state);
        self.cvar_notify();
        Ok(())
    }

    /// Runs queued work on the calling thread.
    ///
    /// Non-blocking mode processes whatever is currently due, once, and
    /// returns whether anything ran; with nothing pending it returns `false`
    /// immediately. Blocking mode keeps processing, waiting in bounded
    /// slices, until the pending-work count drains to zero.
    pub fn dispatch(&self, blocking: bool) -> bool {
        let mut ran_any = false;
        loop {
            let batch = {
                let mut state = self.shared.state.lock().unwrap();
                state.promote_due(Instant::now());
                std::mem::take(&mut state.ready)
            };
            for job in batch {
                (job.run)();
                ran_any = true;
                // job._token drops here, outside the state lock
            }
            if !blocking {
                return ran_any;
            }

            let mut state = self.shared.state.lock().unwrap();
            state.promote_due(Instant::now());
            if !state.ready.is_empty() {
                continue;
            }
            if state.shutdown || state.live_tokens <= 0 {
                return ran_any;
            }
            let wait = state
                .next_due()
                .map(|due| due.saturating_duration_since(Instant::now()).min(WAIT_SLICE))
                .unwrap_or(WAIT_SLICE);
            let _unused = self.cvar_wait(state, wait);
        }
    }

    /// Count of live event tokens, i.e. outstanding async work.
    pub fn pending(&self) -> i64 {
        self.shared.pending()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shared.state.lock().unwrap().shutdown
    }

    /// Marks the dispatcher torn down and discards queued jobs. Idempotent.
    pub(crate) fn shutdown(&self) {
        let (ready, timed) = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            (
                std::mem::take(&mut state.ready),
                std::mem::take(&mut state.timed),
            )
        };
        // Dropped outside the lock: every job token re-locks on release.
        drop(ready);
        drop(timed);
        self.cvar_notify();
    }

    fn cvar_notify(&self) {
        self.shared.cvar.notify_all();
    }

    fn cvar_wait<'a>(
        &'a self,
        guard: std::sync::MutexGuard<'a, DispatchState>,
        wait: Duration,
    ) -> std::sync::MutexGuard<'a, DispatchState> {
        let (guard, _timeout) = self.shared.cvar.wait_timeout(guard, wait).unwrap();
        guard
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn empty_non_blocking_dispatch_returns_false() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.dispatch(false));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn scheduled_work_runs_in_submission_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            dispatcher
                .schedule(
                    move || order.lock().unwrap().push(i),
                    Duration::ZERO,
                )
                .unwrap();
        }
        assert!(dispatcher.dispatch(false));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn delayed_work_is_not_due_immediately() {
        let dispatcher = Dispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        dispatcher
            .schedule(
                move || {
                    flag.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(50),
            )
            .unwrap();
        assert!(!dispatcher.dispatch(false));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        // Still counted as pending work while queued.
        assert_eq!(dispatcher.pending(), 1);
        std::thread::sleep(Duration::from_millis(70));
        assert!(dispatcher.dispatch(false));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_dispatch_drains_until_idle() {
        let dispatcher = Dispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        dispatcher
            .schedule(
                move || {
                    flag.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(20),
            )
            .unwrap();
        assert!(dispatcher.dispatch(true));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn schedule_after_shutdown_is_a_noop_failure() {
        let dispatcher = Dispatcher::new();
        dispatcher.shutdown();
        let result = dispatcher.schedule(|| panic!("must not run"), Duration::ZERO);
        assert!(matches!(result, Err(Error::NotReady(_))));
        assert!(!dispatcher.dispatch(false));
    }

    #[test]
    fn shutdown_discards_queued_jobs_and_their_tokens() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .schedule(|| panic!("must not run"), Duration::ZERO)
            .unwrap();
        assert_eq!(dispatcher.pending(), 1);
        dispatcher.shutdown();
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn jobs_scheduled_from_a_job_run_on_a_later_pass() {
        let dispatcher = Arc::new(Dispatcher::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(Mutex::new(Some(dispatcher.clone())));
        let flag = ran.clone();
        dispatcher
            .schedule(
                move || {
                    let d = shared.lock().unwrap().take().unwrap();
                    let flag = flag.clone();
                    d.schedule(
                        move || {
                            flag.fetch_add(1, Ordering::SeqCst);
                        },
                        Duration::ZERO,
                    )
                    .unwrap();
                },
                Duration::ZERO,
            )
            .unwrap();
        assert!(dispatcher.dispatch(false));
        // The nested job was posted during the pass and runs on the next one.
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(dispatcher.dispatch(false));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
