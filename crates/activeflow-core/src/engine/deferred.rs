use super::error::TaskError;
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, TaskError>>>;

/// A cloneable handle to a value that may not have been computed yet.
///
/// Every clone observes the same underlying node, so the computation behind it
/// runs at most once. Combinators build new nodes without forcing resolution;
/// a node is polled only when something awaits it (or a node depending on it).
pub struct Deferred<T> {
    inner: SharedResult<T>,
}

impl<T: Clone> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.peek() {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn ready(value: T) -> Self {
        Self::from_future(future::ready(Ok(value)))
    }

    pub fn failed(error: TaskError) -> Self {
        Self::from_future(future::ready(Err(error)))
    }

    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// Waits for the value, driving the computation if nobody else is.
    pub async fn resolve(&self) -> Result<T, TaskError> {
        self.inner.clone().await
    }

    /// Returns the result if it is already available.
    pub fn peek(&self) -> Option<Result<T, TaskError>> {
        self.inner.peek().cloned()
    }

    /// Whether both handles refer to the same computation.
    pub fn same_node(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }

    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let inner = self.inner.clone();
        Deferred::from_future(async move { inner.await.map(f) })
    }

    pub fn try_map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, TaskError> + Send + 'static,
    {
        let inner = self.inner.clone();
        Deferred::from_future(async move { inner.await.and_then(f) })
    }

    pub fn and_then<U, F, Fut>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, TaskError>> + Send + 'static,
    {
        let inner = self.inner.clone();
        Deferred::from_future(async move { f(inner.await?).await })
    }

    /// Replaces a failure with a value computed from the error.
    pub fn recover<F>(&self, f: F) -> Deferred<T>
    where
        F: FnOnce(TaskError) -> T + Send + 'static,
    {
        let inner = self.inner.clone();
        Deferred::from_future(async move { Ok(inner.await.unwrap_or_else(f)) })
    }

    pub fn join<U>(&self, other: &Deferred<U>) -> Deferred<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let (a, b) = (self.inner.clone(), other.inner.clone());
        Deferred::from_future(async move { future::try_join(a, b).await })
    }

    pub fn join3<U, V>(&self, second: &Deferred<U>, third: &Deferred<V>) -> Deferred<(T, U, V)>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let (a, b, c) = (self.inner.clone(), second.inner.clone(), third.inner.clone());
        Deferred::from_future(async move { future::try_join3(a, b, c).await })
    }

    /// Collects many handles into one, preserving order. Fails on the first failure.
    pub fn gather(items: &[Deferred<T>]) -> Deferred<Vec<T>> {
        let futures: Vec<_> = items.iter().map(|d| d.inner.clone()).collect();
        Deferred::from_future(async move { future::try_join_all(futures).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn ready_value_resolves_immediately() {
        let d = Deferred::ready(3);
        assert_eq!(d.resolve().await, Ok(3));
        assert_eq!(d.peek(), Some(Ok(3)));
    }

    #[tokio::test]
    async fn map_is_lazy_and_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let d = Deferred::ready(2).map(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x * 10
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let copy = d.clone();
        assert_eq!(d.resolve().await, Ok(20));
        assert_eq!(copy.resolve().await, Ok(20));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(d.same_node(&copy));
    }

    #[tokio::test]
    async fn failures_propagate_through_combinators() {
        let bad: Deferred<i32> = Deferred::failed(TaskError::new("parse", "boom"));
        let joined = Deferred::ready(1).join(&bad);
        assert_eq!(joined.resolve().await.unwrap_err().task, "parse");
        assert_eq!(bad.map(|x| x + 1).recover(|_| -1).resolve().await, Ok(-1));
    }

    #[tokio::test]
    async fn gather_preserves_order() {
        let items: Vec<_> = (0..5)
            .map(|i| Deferred::ready(i).and_then(|x| async move { Ok(x * x) }))
            .collect();
        assert_eq!(Deferred::gather(&items).resolve().await, Ok(vec![0, 1, 4, 9, 16]));
    }

    #[tokio::test]
    async fn distinct_nodes_are_not_the_same() {
        let a = Deferred::ready(1);
        let b = Deferred::ready(1);
        assert!(!a.same_node(&b));
        let (x, y, z) = a.join3(&b, &Deferred::ready("z")).resolve().await.unwrap();
        assert_eq!((x, y, z), (1, 1, "z"));
    }
}
