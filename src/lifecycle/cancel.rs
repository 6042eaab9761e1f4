//! Cooperative cancellation for in-flight calls.

/// Signal that tells suspended calls to stop waiting.
///
/// Clones share the same signal. Once cancelled, a token stays cancelled.
/// `child_token()` scopes cancellation to one run without affecting the parent.
pub use tokio_util::sync::CancellationToken as CancelToken;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        assert!(!token.is_cancelled());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent_only() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child_token();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_before_wait_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(10), token.cancelled())
            .await
            .expect("already-cancelled token resolves at once");
    }
}
