use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::EmbedError;

const DEFAULT_REASON: &str = "connect cancelled";

/// Caller-owned signal that aborts an in-progress `connect()`.
///
/// Clones share state: cancelling any clone cancels all of them. The first
/// reason given wins.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut guard = self.reason.lock();
            if guard.is_none() {
                *guard = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> String {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| DEFAULT_REASON.to_string())
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn to_error(&self) -> EmbedError {
        EmbedError::Cancelled(self.reason())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn first_reason_wins_across_clones() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        let waiter = tokio::spawn(async move { clone.cancelled().await });

        signal.cancel("user navigated away");
        signal.cancel("second reason");

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("cancel wakes waiters")
            .expect("waiter task");
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), "user navigated away");
        assert_eq!(
            signal.to_error(),
            EmbedError::Cancelled("user navigated away".into())
        );
    }
}
