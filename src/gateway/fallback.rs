//! Ordered fallback over async strategies.
//!
//! Strategies run in sequence; the first success wins. If every strategy
//! fails the last error is returned.

use std::future::Future;
use std::pin::Pin;

pub type StrategyFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// A named attempt. The name only shows up in logs.
pub struct Strategy<'a, T, E> {
    pub name: &'static str,
    run: Box<dyn FnOnce() -> StrategyFuture<'a, T, E> + Send + 'a>,
}

impl<'a, T, E> Strategy<'a, T, E> {
    pub fn new<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
        T: 'a,
        E: 'a,
    {
        Self {
            name,
            run: Box::new(move || -> StrategyFuture<'a, T, E> { Box::pin(run()) }),
        }
    }
}

/// Run `strategies` in order. Returns `None` only for an empty list.
pub async fn first_success<'a, T, E>(strategies: Vec<Strategy<'a, T, E>>) -> Option<Result<T, E>>
where
    E: std::fmt::Display,
{
    let mut last = None;
    let total = strategies.len();
    for (idx, strategy) in strategies.into_iter().enumerate() {
        match (strategy.run)().await {
            Ok(value) => return Some(Ok(value)),
            Err(err) => {
                if idx + 1 < total {
                    tracing::debug!(
                        target: "gateway",
                        strategy = strategy.name,
                        error = %err,
                        "strategy failed, trying next"
                    );
                }
                last = Some(Err(err));
            }
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = first_success(vec![
            Strategy::new("a", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(1)
            }),
            Strategy::new("b", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            }),
        ])
        .await;
        assert_eq!(result, Some(Ok(1)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falls_through_to_later_strategy() {
        let result = first_success(vec![
            Strategy::new("a", || async { Err::<u32, _>("first".to_string()) }),
            Strategy::new("b", || async { Ok(2) }),
        ])
        .await;
        assert_eq!(result, Some(Ok(2)));
    }

    #[tokio::test]
    async fn test_last_error_returned() {
        let result = first_success(vec![
            Strategy::new("a", || async { Err::<u32, _>("first".to_string()) }),
            Strategy::new("b", || async { Err("second".to_string()) }),
        ])
        .await;
        assert_eq!(result, Some(Err("second".to_string())));
    }

    #[tokio::test]
    async fn test_empty_list() {
        let result = first_success::<u32, String>(Vec::new()).await;
        assert!(result.is_none());
    }
}
