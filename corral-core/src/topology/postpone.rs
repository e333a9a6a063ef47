//! Deferred-work container for postponed replica operations.
//!
//! Bulk operations register work here instead of executing it when a
//! replica would hold everyone else back (deep lag, slow discovery). The
//! caller drains the container once the main operation has completed. The
//! container is passed through the call graph, never global.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::Result;

type PostponedFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type PostponedFn = Box<dyn FnOnce() -> PostponedFuture + Send>;

/// Append-only bag of deferred closures with human-readable descriptors.
#[derive(Default)]
pub struct PostponedFunctionsContainer {
    functions: Mutex<Vec<(String, PostponedFn)>>,
}

impl PostponedFunctionsContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register deferred work. The closure runs when the consumer drains
    /// the container.
    pub fn add<F, Fut>(&self, description: impl Into<String>, function: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let description = description.into();
        debug!("postponing: {description}");
        self.functions
            .lock()
            .push((description, Box::new(move || Box::pin(function()))));
    }

    pub fn len(&self) -> usize {
        self.functions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.lock().is_empty()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.functions
            .lock()
            .iter()
            .map(|(description, _)| description.clone())
            .collect()
    }

    /// Drain the container and run everything concurrently, waiting for all
    /// of it to finish. Failures are logged and returned; they never abort
    /// the other postponed functions.
    pub async fn invoke_all(&self) -> Vec<(String, Result<()>)> {
        let functions = std::mem::take(&mut *self.functions.lock());
        if functions.is_empty() {
            return Vec::new();
        }
        debug!("invoking {} postponed functions", functions.len());
        let mut tasks = JoinSet::new();
        for (description, function) in functions {
            tasks.spawn(async move {
                let result = function().await;
                (description, result)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((description, result)) => {
                    if let Err(err) = &result {
                        warn!("postponed function failed: {description}: {err}");
                    }
                    results.push((description, result));
                }
                Err(err) => warn!("postponed function panicked: {err}"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_and_invoke_all() {
        let container = PostponedFunctionsContainer::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let counter = Arc::clone(&counter);
            container.add(format!("bump {i}"), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(container.len(), 3);
        assert_eq!(container.descriptions().len(), 3);

        let results = container.invoke_all().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(container.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_fatal() {
        let container = PostponedFunctionsContainer::new();
        container.add("fails", || async {
            Err(crate::Error::precondition("deliberate"))
        });
        container.add("succeeds", || async { Ok(()) });

        let results = container.invoke_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|(_, r)| r.is_err()).count(), 1);
    }
}
