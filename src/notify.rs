//! One-shot rendezvous between a waiting session and the authority.
//!
//! The authority holds the [`Notifier`] and the session holds the
//! [`Completion`]. `notify` consumes the notifier, so a request can be answered
//! at most once; a notifier dropped without answering wakes the waiter with
//! [`WaitError::Abandoned`] instead of leaving it blocked.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("no answer within {0:?}")]
    TimedOut(Duration),
    #[error("wait cancelled")]
    Cancelled,
    #[error("request abandoned without an answer")]
    Abandoned,
}

/// Create a connected notifier/completion pair.
#[must_use]
pub fn channel<T>() -> (Notifier<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Notifier { tx }, Completion { rx })
}

/// Producer half, owned by whoever computes the answer.
#[derive(Debug)]
pub struct Notifier<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Notifier<T> {
    /// Deliver the answer.
    ///
    /// # Errors
    /// Hands the value back if the waiting side is already gone.
    pub fn notify(self, value: T) -> Result<(), T> {
        self.tx.send(value)
    }

    /// True once the waiting side has dropped its [`Completion`].
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the waiting session.
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    /// Wait for the answer for at most `timeout`.
    ///
    /// # Errors
    /// [`WaitError::TimedOut`] on expiry, [`WaitError::Abandoned`] if the notifier
    /// was dropped without answering.
    pub async fn wait(self, timeout: Duration) -> Result<T, WaitError> {
        self.wait_or_cancel(timeout, std::future::pending::<()>())
            .await
    }

    /// Wait for the answer, giving up on expiry or as soon as `cancelled` resolves.
    ///
    /// # Errors
    /// [`WaitError::Cancelled`] when `cancelled` wins, otherwise as [`Completion::wait`].
    pub async fn wait_or_cancel<F>(self, timeout: Duration, cancelled: F) -> Result<T, WaitError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            answer = tokio::time::timeout(timeout, self.rx) => match answer {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(WaitError::Abandoned),
                Err(_) => Err(WaitError::TimedOut(timeout)),
            },
            () = cancelled => Err(WaitError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_exactly_one_value() {
        let (notifier, completion) = channel();
        assert!(notifier.notify(7_u32).is_ok());
        assert_eq!(completion.wait(Duration::from_secs(1)).await, Ok(7));
    }

    #[tokio::test]
    async fn dropped_notifier_wakes_waiter() {
        let (notifier, completion) = channel::<u32>();
        drop(notifier);
        assert_eq!(
            completion.wait(Duration::from_secs(1)).await,
            Err(WaitError::Abandoned)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_bounded() {
        let (_notifier, completion) = channel::<u32>();
        assert_eq!(
            completion.wait(Duration::from_millis(50)).await,
            Err(WaitError::TimedOut(Duration::from_millis(50)))
        );
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiter() {
        let (notifier, completion) = channel::<u32>();
        let result = completion
            .wait_or_cancel(Duration::from_secs(60), async {})
            .await;
        assert_eq!(result, Err(WaitError::Cancelled));
        assert!(notifier.is_abandoned());
        assert_eq!(notifier.notify(1), Err(1));
    }

    #[tokio::test]
    async fn answer_from_another_task() {
        let (notifier, completion) = channel();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = notifier.notify("done");
        });
        assert_eq!(completion.wait(Duration::from_secs(5)).await, Ok("done"));
    }
}
