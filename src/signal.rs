//! `CancelToken` and `SignalSource` (§3, §6, §9).
//!
//! `CancelToken` wraps `tokio_util::sync::CancellationToken`, which already
//! provides the one-shot broadcast and child-composition semantics §3
//! requires (parent firing fires all children). `SignalSource` centralises
//! OS signal handling to a single observer per process, per §9's note that
//! the original installs process-wide handlers that can accumulate.

use tokio_util::sync::CancellationToken;

/// One-shot broadcast signal for cooperative shutdown (§3).
///
/// Fires at most once; firing a parent fires every child derived via
/// [`CancelToken::child`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: CancellationToken::new(),
        }
    }

    /// Derive a child token: firing `self` also fires the child, but firing
    /// the child alone never propagates back up.
    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}

/// Yields one [`CancelToken`] per process, firing on SIGINT/SIGTERM (or the
/// platform equivalent). At most one OS-signal observer is ever spawned.
pub struct SignalSource;

impl SignalSource {
    /// Spawn the single OS-signal observer and return the token it fires.
    pub fn install() -> CancelToken {
        let token = CancelToken::new();
        let fired = token.clone();

        #[cfg(unix)]
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(_) => return,
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            fired.cancel();
        });

        #[cfg(not(unix))]
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                fired.cancel();
            }
        });

        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn child_fires_when_parent_fires() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn child_cancel_does_not_propagate_up() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_once_fired() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("did not fire in time")
            .expect("task panicked");
    }
}
