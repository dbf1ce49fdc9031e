//! Single-assignment completion shared by any number of waiters.
//!
//! Open and close operations hand out the same [`Promise`] to every caller
//! that arrives while the operation is in flight; the first completion wins
//! and later ones are ignored.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Result, RpcError};

/// A cloneable, completable future value.
pub struct Promise<T> {
    tx: Arc<watch::Sender<Option<Result<T>>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// An incomplete promise.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// A promise already completed with `value`.
    pub fn completed(value: Result<T>) -> Self {
        let (tx, _) = watch::channel(Some(value));
        Self { tx: Arc::new(tx) }
    }

    /// Complete the promise. Returns `false` if it was already complete.
    pub fn complete(&self, value: Result<T>) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = value.take();
                true
            } else {
                false
            }
        })
    }

    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The outcome, if already complete.
    pub fn peek(&self) -> Option<Result<T>> {
        self.tx.borrow().clone()
    }

    /// Wait for completion.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.tx.subscribe();
        let outcome = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| RpcError::IllegalState("promise dropped".into()))?;
        match &*outcome {
            Some(value) => value.clone(),
            None => Err(RpcError::IllegalState("promise not completed".into())),
        }
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.tx.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_completion_wins() {
        let p: Promise<u32> = Promise::new();
        assert!(!p.is_done());
        assert!(p.complete(Ok(1)));
        assert!(!p.complete(Ok(2)));
        assert_eq!(p.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waiters_see_error() {
        let p: Promise<()> = Promise::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.wait().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        p.complete(Err(RpcError::Connection("refused".into())));
        for w in waiters {
            assert!(matches!(w.await.unwrap(), Err(RpcError::Connection(_))));
        }
    }

    #[tokio::test]
    async fn test_completed_and_ptr_eq() {
        let p: Promise<()> = Promise::completed(Ok(()));
        let q = p.clone();
        assert!(p.ptr_eq(&q));
        assert!(!p.ptr_eq(&Promise::completed(Ok(()))));
        assert!(q.wait().await.is_ok());
        assert!(matches!(p.peek(), Some(Ok(()))));
    }
}
