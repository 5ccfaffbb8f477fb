//! Composite handler for combining multiple record handlers.
//!
//! This module provides [`MultiHandler`], a handler that fans each record out to an arbitrary
//! number of [`RecordHandler`] implementations. All handlers run concurrently.
//!
//! # Example
//!
//! ```rust
//! use peephole::{Emitter, LoggingHandler, MultiHandler};
//!
//! // Log every record, and hand it to whatever else is interested
//! let multi_handler = MultiHandler::new()
//!     .with(LoggingHandler);
//!
//! let emitter = Emitter::handler(multi_handler);
//! ```

use crate::{ObservationRecord, RecordHandler};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for boxed futures used in the dyn-compatible wrapper.
pub(crate) type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Internal trait that is dyn-compatible for type erasure.
/// This wraps RecordHandler implementations to allow storing them as trait objects.
pub(crate) trait DynHandler: Send + Sync + 'static {
    fn handle_record_boxed(&self, record: ObservationRecord) -> BoxFuture<'_>;
}

/// Wrapper that implements DynHandler for any RecordHandler.
pub(crate) struct HandlerWrapper<H: RecordHandler> {
    pub(crate) inner: H,
}

impl<H: RecordHandler> DynHandler for HandlerWrapper<H> {
    fn handle_record_boxed(&self, record: ObservationRecord) -> BoxFuture<'_> {
        Box::pin(self.inner.handle_record(record))
    }
}

/// A handler that delegates to multiple inner handlers.
///
/// Handlers are executed concurrently, each with its own copy of the record.
///
/// # Thread Safety
///
/// `MultiHandler` is `Send + Sync` and can be safely shared across threads.
/// Each inner handler is wrapped in an `Arc` for efficient cloning.
#[derive(Clone)]
pub struct MultiHandler {
    handlers: Vec<Arc<dyn DynHandler>>,
}

impl MultiHandler {
    /// Create a new empty MultiHandler.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain. Returns self for builder pattern.
    ///
    /// # Example
    ///
    /// ```rust
    /// use peephole::{MultiHandler, LoggingHandler};
    ///
    /// let handler = MultiHandler::new()
    ///     .with(LoggingHandler);
    /// ```
    pub fn with<H: RecordHandler>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(HandlerWrapper { inner: handler }));
        self
    }

    /// Returns true if no handlers have been added.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Returns the number of handlers in the chain.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for MultiHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordHandler for MultiHandler {
    async fn handle_record(&self, record: ObservationRecord) {
        let futures: Vec<_> = self
            .handlers
            .iter()
            .map(|h| {
                let record = record.clone();
                let handler = h.clone();
                async move { handler.handle_record_boxed(record).await }
            })
            .collect();
        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Test handler that counts calls
    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    impl RecordHandler for CountingHandler {
        async fn handle_record(&self, _record: ObservationRecord) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn create_test_record() -> ObservationRecord {
        ObservationRecord {
            method: "GET".to_string(),
            path: "/test".to_string(),
            status_code: 200,
            latency: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_multi_handler_empty() {
        let handler = MultiHandler::new();
        assert!(handler.is_empty());
        assert_eq!(handler.len(), 0);

        // Should not panic with no handlers
        handler.handle_record(create_test_record()).await;
    }

    #[tokio::test]
    async fn test_multi_handler_multiple() {
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        let handler = MultiHandler::new()
            .with(CountingHandler {
                count: count1.clone(),
            })
            .with(CountingHandler {
                count: count2.clone(),
            });

        assert!(!handler.is_empty());
        assert_eq!(handler.len(), 2);

        handler.handle_record(create_test_record()).await;
        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    /// Handler that captures the record it receives for verification
    struct CapturingHandler {
        captured: Arc<std::sync::Mutex<Option<ObservationRecord>>>,
    }

    impl RecordHandler for CapturingHandler {
        async fn handle_record(&self, record: ObservationRecord) {
            *self.captured.lock().unwrap() = Some(record);
        }
    }

    #[tokio::test]
    async fn test_handlers_receive_correct_data() {
        let captured = Arc::new(std::sync::Mutex::new(None));

        let handler = MultiHandler::new().with(CapturingHandler {
            captured: captured.clone(),
        });

        let mut record = create_test_record();
        record.status_code = 201;

        handler.handle_record(record.clone()).await;
        assert_eq!(*captured.lock().unwrap(), Some(record));
    }

    /// Handler that waits at a barrier - proves concurrent execution
    struct BarrierHandler {
        barrier: Arc<tokio::sync::Barrier>,
        completed: Arc<AtomicUsize>,
    }

    impl RecordHandler for BarrierHandler {
        async fn handle_record(&self, _record: ObservationRecord) {
            self.barrier.wait().await;
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently() {
        // Barrier requires 2 waiters before any can proceed
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let completed = Arc::new(AtomicUsize::new(0));

        let handler = MultiHandler::new()
            .with(BarrierHandler {
                barrier: barrier.clone(),
                completed: completed.clone(),
            })
            .with(BarrierHandler {
                barrier: barrier.clone(),
                completed: completed.clone(),
            });

        // If sequential: deadlock at barrier. If concurrent: both proceed.
        let result = tokio::time::timeout(
            tokio::time::Duration::from_secs(1),
            handler.handle_record(create_test_record()),
        )
        .await;

        assert!(
            result.is_ok(),
            "Handlers must run concurrently - barrier would deadlock if sequential"
        );
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }
}
