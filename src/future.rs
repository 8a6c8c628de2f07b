//! Single-assignment operation results

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Error;

enum State<T> {
    Waiting,
    // a completer won the race and is running the result handler
    Completing,
    Succeeded(T),
    Failed(Error),
    Cancelled(Error),
}

struct Inner<T> {
    state: State<T>,
    cancelable: bool,
    handler: Option<Box<dyn FnOnce(&Result<T, Error>) + Send>>,
    wakers: Vec<Waker>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

/// A result slot assigned exactly once.
///
/// Any number of clones may race to [`complete`], [`fail`] or [`cancel`] it;
/// exactly one transition wins and the rest report `false`. Waiters block on
/// [`get`], bound their wait with [`get_timeout`], or `.await` the future
/// itself. An optional handler attached at construction observes the outcome
/// strictly before any waiter is released.
///
/// [`complete`]: Self::complete
/// [`fail`]: Self::fail
/// [`cancel`]: Self::cancel
/// [`get`]: Self::get
/// [`get_timeout`]: Self::get_timeout
pub struct ResultFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ResultFuture<T> {
    fn clone(&self) -> Self {
        ResultFuture {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for ResultFuture<T> {
    fn default() -> Self {
        ResultFuture::new()
    }
}

impl<T> ResultFuture<T> {
    pub fn new() -> Self {
        ResultFuture {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: State::Waiting,
                    cancelable: true,
                    handler: None,
                    wakers: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// A future whose outcome is fed to `handler` before waiters wake up.
    ///
    /// The handler must not wait on this future itself, that deadlocks.
    pub fn with_handler(handler: impl FnOnce(&Result<T, Error>) + Send + 'static) -> Self {
        let future = ResultFuture::new();
        future.shared.inner.lock().handler = Some(Box::new(handler));
        future
    }

    /// Turns [`cancel`](Self::cancel) into a no-op that reports failure to
    /// cancel. Completion and failure are unaffected. Meant to be called
    /// before the future is shared.
    pub fn cancelable(self, cancelable: bool) -> Self {
        self.shared.inner.lock().cancelable = cancelable;
        self
    }

    /// Whether the outcome has been assigned and published.
    pub fn is_done(&self) -> bool {
        matches!(
            self.shared.inner.lock().state,
            State::Succeeded(_) | State::Failed(_) | State::Cancelled(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.inner.lock().state, State::Cancelled(_))
    }
}

impl<T: Clone> ResultFuture<T> {
    /// Assigns a successful outcome. Returns whether this call won.
    pub fn complete(&self, value: T) -> bool {
        self.finish(Ok(value), false)
    }

    /// Assigns a failed outcome. Returns whether this call won.
    pub fn fail(&self, error: Error) -> bool {
        self.finish(Err(error), false)
    }

    /// Cancels the operation, failing waiters with
    /// [`Error::OperationCancelled`]. Returns whether this call won.
    pub fn cancel(&self) -> bool {
        if !self.shared.inner.lock().cancelable {
            return false;
        }
        self.finish(Err(Error::OperationCancelled), true)
    }

    /// Blocks until the outcome is assigned.
    pub fn get(&self) -> Result<T, Error> {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(result) = Self::outcome(&inner.state) {
                return result;
            }
            self.shared.cond.wait(&mut inner);
        }
    }

    /// Blocks until the outcome is assigned or `timeout` elapses.
    ///
    /// An elapsed wait reports [`Error::WaitTimeout`] and leaves the
    /// operation pending; it can still complete and be awaited again.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(result) = Self::outcome(&inner.state) {
                return result;
            }
            if self.shared.cond.wait_until(&mut inner, deadline).timed_out() {
                return match Self::outcome(&inner.state) {
                    Some(result) => result,
                    None => Err(Error::WaitTimeout),
                };
            }
        }
    }

    fn outcome(state: &State<T>) -> Option<Result<T, Error>> {
        match state {
            State::Succeeded(value) => Some(Ok(value.clone())),
            State::Failed(error) | State::Cancelled(error) => Some(Err(error.clone())),
            State::Waiting | State::Completing => None,
        }
    }

    fn finish(&self, result: Result<T, Error>, cancelled: bool) -> bool {
        let mut inner = self.shared.inner.lock();
        if !matches!(inner.state, State::Waiting) {
            return false;
        }
        inner.state = State::Completing;
        let handler = inner.handler.take();
        drop(inner);

        // late completers already see Completing, so running the handler
        // without the lock cannot lose the race
        if let Some(handler) = handler {
            handler(&result);
        }

        let mut inner = self.shared.inner.lock();
        inner.state = match result {
            Ok(value) => State::Succeeded(value),
            Err(error) if cancelled => State::Cancelled(error),
            Err(error) => State::Failed(error),
        };
        let wakers = mem::take(&mut inner.wakers);
        drop(inner);

        self.shared.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<T: Clone> Future for ResultFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.inner.lock();
        if let Some(result) = Self::outcome(&inner.state) {
            return Poll::Ready(result);
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn complete_then_get() {
        let future = ResultFuture::new();
        assert!(!future.is_done());
        assert!(future.complete(42));
        assert!(future.is_done());
        assert_eq!(future.get().unwrap(), 42);
        // repeat reads observe the same outcome
        assert_eq!(future.get().unwrap(), 42);
    }

    #[test]
    fn exactly_one_completer_wins() {
        let future: ResultFuture<usize> = ResultFuture::new();
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let future = future.clone();
                let wins = wins.clone();
                thread::spawn(move || {
                    if future.complete(i) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        let value = future.get().unwrap();
        assert!(value < 8);
        // every reader sees the same winner
        for _ in 0..4 {
            assert_eq!(future.get().unwrap(), value);
        }
    }

    #[test]
    fn later_transitions_are_ignored() {
        let future = ResultFuture::new();
        assert!(future.complete(1));
        assert!(!future.fail(Error::ConnectionClosed));
        assert!(!future.cancel());
        assert!(!future.complete(2));
        assert_eq!(future.get().unwrap(), 1);
        assert!(!future.is_cancelled());
    }

    #[test]
    fn cancel_fails_waiters() {
        let future: ResultFuture<u8> = ResultFuture::new();
        assert!(future.cancel());
        assert!(future.is_cancelled());
        assert!(matches!(future.get(), Err(Error::OperationCancelled)));
        assert!(!future.complete(1));
    }

    #[test]
    fn non_cancelable_futures_ignore_cancel() {
        let future: ResultFuture<u8> = ResultFuture::new().cancelable(false);
        assert!(!future.cancel());
        assert!(!future.is_done());
        assert!(future.complete(3));
        assert_eq!(future.get().unwrap(), 3);
    }

    #[test]
    fn handler_runs_before_waiters_wake() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        let future = ResultFuture::with_handler(move |result: &Result<u32, Error>| {
            assert_eq!(*result.as_ref().unwrap(), 7);
            // give the waiter a chance to race ahead if the ordering is wrong
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });

        let waiter = {
            let future = future.clone();
            let observed = observed.clone();
            thread::spawn(move || {
                let value = future.get().unwrap();
                assert!(observed.load(Ordering::SeqCst), "waiter released before handler");
                value
            })
        };
        thread::sleep(Duration::from_millis(10));
        assert!(future.complete(7));
        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn bounded_wait_leaves_operation_pending() {
        let future: ResultFuture<u8> = ResultFuture::new();
        let start = Instant::now();
        assert!(matches!(
            future.get_timeout(Duration::from_millis(30)),
            Err(Error::WaitTimeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!future.is_done());

        assert!(future.complete(9));
        assert_eq!(future.get_timeout(Duration::from_millis(30)).unwrap(), 9);
    }

    #[test]
    fn blocking_waiter_is_released_by_another_thread() {
        let future: ResultFuture<String> = ResultFuture::new();
        let completer = {
            let future = future.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                future.complete("done".to_owned())
            })
        };
        assert_eq!(future.get().unwrap(), "done");
        assert!(completer.join().unwrap());
    }

    #[tokio::test]
    async fn awaiting_the_future_directly() {
        let future: ResultFuture<u32> = ResultFuture::new();
        let awaited = tokio::spawn(future.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(future.complete(11));
        assert_eq!(awaited.await.unwrap().unwrap(), 11);

        // already-complete futures resolve immediately
        assert_eq!(future.clone().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn failed_outcome_is_shared_with_async_waiters() {
        let future: ResultFuture<u32> = ResultFuture::new();
        let first = tokio::spawn(future.clone());
        let second = tokio::spawn(future.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(future.fail(Error::OperationTimeout));
        assert!(matches!(first.await.unwrap(), Err(Error::OperationTimeout)));
        assert!(matches!(second.await.unwrap(), Err(Error::OperationTimeout)));
    }
}
