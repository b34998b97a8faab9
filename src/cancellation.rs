use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative abort flag for one long-running task.
///
/// Clones share the same flag; identity (for registry removal) is the shared
/// allocation, not the value.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that flipped the flag.
    pub fn cancel(&self) -> bool {
        let was = self.inner.cancelled.swap(true, Ordering::SeqCst);
        if !was {
            self.inner.notify.notify_waiters();
        }
        !was
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Set of live tokens owned by one guild session.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<Vec<CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, token: CancellationToken) -> CancellationToken {
        if let Ok(mut tokens) = self.tokens.lock()
            && !tokens.iter().any(|t| t.same_as(&token))
        {
            tokens.push(token.clone());
        }
        token
    }

    pub fn unbind(&self, token: &CancellationToken) -> bool {
        let Ok(mut tokens) = self.tokens.lock() else {
            return false;
        };
        match tokens.iter().position(|t| t.same_as(token)) {
            Some(idx) => {
                tokens.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Cancels every bound token; true if at least one was still live.
    pub fn cancel_all(&self) -> bool {
        let tokens = match self.tokens.lock() {
            Ok(tokens) => tokens.clone(),
            Err(_) => return false,
        };
        // no short-circuit: every token must see the cancel
        tokens.iter().map(|t| t.cancel()).fold(false, |acc, r| acc | r)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }
}

/// Binds a token for the lifetime of the guard and unbinds it exactly once on drop,
/// whichever way the owning task exits.
pub struct BoundCancellation<'a> {
    registry: &'a CancellationRegistry,
    token: CancellationToken,
}

impl<'a> BoundCancellation<'a> {
    pub fn new(registry: &'a CancellationRegistry) -> Self {
        let token = registry.bind(CancellationToken::new());
        Self { registry, token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for BoundCancellation<'_> {
    fn drop(&mut self) {
        self.registry.unbind(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn bind_unbind_by_identity() {
        let registry = CancellationRegistry::new();
        let token = registry.bind(CancellationToken::new());
        registry.bind(token.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.unbind(&token));
        assert!(!registry.unbind(&token));

        let never_bound = CancellationToken::new();
        assert!(!registry.unbind(&never_bound));
    }

    #[test]
    fn cancel_all_reports_transitions() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel_all());

        let a = registry.bind(CancellationToken::new());
        let b = registry.bind(CancellationToken::new());
        a.cancel();
        assert!(registry.cancel_all());
        assert!(b.is_cancelled());
        assert!(!registry.cancel_all());
    }

    #[test]
    fn guard_unbinds_on_drop() {
        let registry = CancellationRegistry::new();
        {
            let guard = BoundCancellation::new(&registry);
            assert_eq!(registry.len(), 1);
            assert!(!guard.token().is_cancelled());
        }
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn cancelled_future_wakes() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .expect("join");
    }
}
