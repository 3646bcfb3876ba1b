//! Running many remote operations at once
//!
//! Three policies, used for different workflows:
//! - [`drain_all`]: every dispatched operation runs to completion, then the
//!   first failure is reported (uploads, save deletion)
//! - [`abort_on_error`]: the first failure cancels the remaining siblings
//!   (downloads, where a partial destination is useless)
//! - [`settle_all`]: failures are logged and counted, never returned
//!   (backup pruning)

use std::fmt::Display;
use std::future::Future;

use futures::future::{join_all, try_join_all};
use tokio::task::JoinHandle;

use crate::error::{CloudSyncError, Result};

/// Await all futures; fail with the first error (in dispatch order) once
/// every one of them has finished.
///
/// A single failure is returned unchanged; several are wrapped in
/// [`CloudSyncError::Batch`].
pub async fn drain_all<I, F, T>(operations: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    let results = join_all(operations).await;
    let total = results.len();

    let mut values = Vec::with_capacity(total);
    let mut first = None;
    let mut failed = 0;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                failed += 1;
                if first.is_none() {
                    first = Some(e);
                } else {
                    tracing::debug!("Additional batch failure: {}", e);
                }
            }
        }
    }

    match first {
        None => Ok(values),
        Some(e) if failed == 1 => Err(e),
        Some(e) => Err(CloudSyncError::Batch {
            failed,
            total,
            first: Box::new(e),
        }),
    }
}

/// Await all futures, dropping the rest as soon as one fails
pub async fn abort_on_error<I, F, T>(operations: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    try_join_all(operations).await
}

/// Outcome of a best-effort batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settled<K> {
    pub succeeded: Vec<K>,
    pub failed: Vec<(K, String)>,
}

/// Await all keyed futures; log each failure and keep going
pub async fn settle_all<I, K, F>(operations: I) -> Settled<K>
where
    I: IntoIterator<Item = (K, F)>,
    K: Display,
    F: Future<Output = Result<()>>,
{
    let (keys, futures): (Vec<K>, Vec<F>) = operations.into_iter().unzip();
    let results = join_all(futures).await;

    let mut settled = Settled {
        succeeded: Vec::new(),
        failed: Vec::new(),
    };
    for (key, result) in keys.into_iter().zip(results) {
        match result {
            Ok(()) => settled.succeeded.push(key),
            Err(e) => {
                tracing::error!("Operation on \"{}\" failed: {}", key, e);
                settled.failed.push((key, e.to_string()));
            }
        }
    }
    settled
}

/// Run a future in the background, routing its failure (or panic) to
/// `on_error` instead of dropping it.
pub fn spawn_detached<F, E>(task: &'static str, future: F, on_error: E) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
    E: FnOnce(CloudSyncError) + Send + 'static,
{
    let inner = tokio::spawn(future);
    tokio::spawn(async move {
        match inner.await {
            Ok(Ok(())) => tracing::debug!(task, "Background task finished"),
            Ok(Err(e)) => on_error(e),
            Err(e) => on_error(e.into()),
        }
    })
}

/// Error sink that logs through tracing
pub fn log_error(task: &'static str) -> impl FnOnce(CloudSyncError) + Send + 'static {
    move |e| tracing::error!(task, "Background task failed: {}", e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_all_waits_for_every_operation() {
        let finished = Arc::new(AtomicUsize::new(0));
        let ops = (0..5).map(|i| {
            let finished = finished.clone();
            async move {
                if i == 0 {
                    return Err(CloudSyncError::Internal("first".into()));
                }
                tokio::time::sleep(Duration::from_millis(5 * i)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            }
        });

        let err = drain_all(ops).await.unwrap_err();
        assert!(matches!(err, CloudSyncError::Internal(ref m) if m == "first"));
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_drain_all_wraps_multiple_failures() {
        let ops = (0..4).map(|i| async move {
            if i % 2 == 0 {
                Err(CloudSyncError::NotFound(format!("item {}", i)))
            } else {
                Ok(())
            }
        });

        match drain_all(ops).await {
            Err(CloudSyncError::Batch {
                failed,
                total,
                first,
            }) => {
                assert_eq!((failed, total), (2, 4));
                assert!(matches!(*first, CloudSyncError::NotFound(ref m) if m == "item 0"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_on_error_cancels_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let ops = (0..3).map(|i| {
            let finished = finished.clone();
            async move {
                if i == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    return Err(CloudSyncError::Internal("boom".into()));
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let result = tokio::time::timeout(Duration::from_secs(5), abort_on_error(ops)).await;
        assert!(result.expect("siblings were not cancelled").is_err());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_settle_all_reports_each_outcome() {
        let ops = vec![
            ("a".to_string(), futures::future::ready(Ok(()))),
            (
                "b".to_string(),
                futures::future::ready(Err(CloudSyncError::Internal("no".into()))),
            ),
            ("c".to_string(), futures::future::ready(Ok(()))),
        ];
        let settled = settle_all(ops).await;
        assert_eq!(settled.succeeded, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(settled.failed.len(), 1);
        assert_eq!(settled.failed[0].0, "b");
    }

    #[tokio::test]
    async fn test_spawn_detached_routes_errors_and_panics() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let tx1 = tx.clone();
        spawn_detached(
            "fails",
            async { Err::<(), _>(CloudSyncError::Internal("bad".into())) },
            move |e| {
                let _ = tx1.send(e.to_string());
            },
        )
        .await
        .unwrap();

        spawn_detached(
            "panics",
            async {
                let missing: Option<()> = None;
                missing.expect("exploded");
                Ok(())
            },
            move |e| {
                let _ = tx.send(e.to_string());
            },
        )
        .await
        .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.contains("bad"));
        assert!(second.starts_with("Task error"));
    }
}
