//! Deadline-bounded waiting.
//!
//! Every asynchronous step in the crate is raced against an explicit
//! deadline: either through [`create_timeout`], which hands out a slot an
//! external event can resolve, or through [`expire`], which bounds an
//! existing future. Exactly one of {resolution, deadline} decides the
//! outcome; whichever comes second is a no-op.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::Error;

/// Resolver half of a deadline-bounded wait.
///
/// The first call to [`resolve`](TimeoutHandle::resolve) or
/// [`fail`](TimeoutHandle::fail) wins; later calls (including calls after
/// the deadline already fired) have no effect.
pub struct TimeoutHandle<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<Result<T, Error>>>>>,
}

impl<T> Clone for TimeoutHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> TimeoutHandle<T> {
    pub fn resolve(&self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(&self, error: Error) {
        self.complete(Err(error));
    }

    fn complete(&self, outcome: Result<T, Error>) {
        let sender = self.slot.lock().expect("timeout slot poisoned").take();
        if let Some(sender) = sender {
            // the receiver is gone once the deadline path already won
            let _ = sender.send(outcome);
        }
    }
}

/// Create a wait that auto-fails with a `Timeout` error after `wait`.
///
/// Returns the resolver handle and the single awaitable outcome. The
/// deadline timer is owned by the returned future and is released as soon
/// as the future completes or is dropped.
pub fn create_timeout<T>(
    wait: Duration,
    message: impl Into<String>,
) -> (TimeoutHandle<T>, impl Future<Output = Result<T, Error>>) {
    create_timeout_with(wait, message, || {})
}

/// Like [`create_timeout`], with a side effect that runs only when the
/// deadline path wins. Used to tear down a resource that nobody else is
/// driving, such as a session still waiting for a channel.
pub fn create_timeout_with<T>(
    wait: Duration,
    message: impl Into<String>,
    on_timeout: impl FnOnce(),
) -> (TimeoutHandle<T>, impl Future<Output = Result<T, Error>>) {
    let (sender, mut receiver) = oneshot::channel::<Result<T, Error>>();
    let handle = TimeoutHandle {
        slot: Arc::new(Mutex::new(Some(sender))),
    };
    let message = message.into();

    let outcome = async move {
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        tokio::select! {
            resolution = &mut receiver => match resolution {
                Ok(outcome) => outcome,
                Err(_) => {
                    // every handle was dropped unresolved; only the
                    // deadline can finish this wait now
                    deadline.await;
                    on_timeout();
                    Err(Error::timeout(message, wait))
                }
            },
            _ = &mut deadline => {
                on_timeout();
                Err(Error::timeout(message, wait))
            }
        }
    };

    (handle, outcome)
}

/// Race `operation` against a deadline. If the deadline elapses first the
/// operation is dropped, which cancels whatever it had in flight.
pub async fn expire<T>(
    wait: Duration,
    message: &str,
    operation: impl Future<Output = T>,
) -> Result<T, Error> {
    tokio::select! {
        value = operation => Ok(value),
        _ = tokio::time::sleep(wait) => Err(Error::timeout(message, wait)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn external_resolution_beats_a_long_deadline() {
        let (handle, outcome) = create_timeout::<u32>(Duration::from_secs(60), "too slow");
        handle.resolve(7);
        assert_eq!(outcome.await, Ok(7));
    }

    #[tokio::test]
    async fn a_short_deadline_beats_a_silent_resolver() {
        let (_handle, outcome) = create_timeout::<u32>(Duration::from_millis(10), "too slow");
        let error = outcome.await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.message, "too slow (time given: 10ms)");
    }

    #[tokio::test]
    async fn the_second_resolution_is_a_no_op() {
        let (handle, outcome) = create_timeout::<u32>(Duration::from_secs(60), "too slow");
        handle.resolve(1);
        handle.resolve(2);
        handle.fail(Error::connection("ignored"));
        assert_eq!(outcome.await, Ok(1));
    }

    #[tokio::test]
    async fn handles_can_fail_the_wait() {
        let (handle, outcome) = create_timeout::<u32>(Duration::from_secs(60), "too slow");
        handle.fail(Error::deserialize("bad frame"));
        assert_eq!(outcome.await.unwrap_err().kind, ErrorKind::Deserialize);
    }

    #[tokio::test]
    async fn on_timeout_runs_only_on_the_deadline_path() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let fired = Arc::new(AtomicU32::new(0));

        let counter = fired.clone();
        let (handle, outcome) = create_timeout_with::<u32>(Duration::from_secs(60), "slow", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.resolve(1);
        assert_eq!(outcome.await, Ok(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let counter = fired.clone();
        let (handle, outcome) = create_timeout_with::<u32>(Duration::from_millis(5), "slow", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(outcome.await.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // resolving after the deadline changes nothing
        handle.resolve(9);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expire_passes_fast_operations_through() {
        let value = expire(Duration::from_secs(60), "too slow", async { 41 + 1 }).await;
        assert_eq!(value, Ok(42));
    }

    #[tokio::test]
    async fn expire_cuts_off_slow_operations() {
        let outcome = expire(Duration::from_millis(10), "too slow", std::future::pending::<()>()).await;
        assert_eq!(outcome.unwrap_err().kind, ErrorKind::Timeout);
    }
}
