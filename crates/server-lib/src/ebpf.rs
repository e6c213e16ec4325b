//! eBPF instrumentation extension point
//!
//! The server does not load eBPF programs itself. A loader can register
//! [`EbpfHooks`] to attach instrumentation when a new process connects;
//! the returned [`UnloadHandle`] detaches it when the connection ends.

use crate::models::ResourceAttribute;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

type UnloadFn = Box<dyn FnOnce() -> Result<()> + Send>;

#[async_trait]
pub trait EbpfHooks: Send + Sync {
    /// Attach instrumentation to a newly connected process.
    ///
    /// Must not return until instrumentation is attached or has failed.
    /// An error rejects the connection.
    async fn on_new_instrumented_process(
        &self,
        language: &str,
        pid: i64,
        service_name: &str,
        resource_attributes: &[ResourceAttribute],
    ) -> Result<UnloadHandle>;
}

/// Detaches instrumentation. Runs its callback at most once no matter how
/// many clones of the handle exist.
#[derive(Clone)]
pub struct UnloadHandle {
    inner: Arc<Mutex<Option<UnloadFn>>>,
}

impl UnloadHandle {
    pub fn new(f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// Handle with nothing to undo
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the callback if it has not run yet. Errors are logged, not returned.
    pub fn unload(&self, pid: i64) {
        let callback = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(callback) = callback else {
            return;
        };

        match callback() {
            Ok(()) => debug!(pid = pid, "Unloaded eBPF instrumentation"),
            Err(e) => error!(pid = pid, error = %e, "Failed to unload eBPF instrumentation"),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }
}

impl fmt::Debug for UnloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnloadHandle")
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unload_runs_once_across_clones() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = UnloadHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let clone = handle.clone();
        assert!(handle.is_pending());
        handle.unload(42);
        clone.unload(42);
        handle.unload(42);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!clone.is_pending());
    }

    #[test]
    fn test_unload_error_is_swallowed() {
        let handle = UnloadHandle::new(|| Err(anyhow::anyhow!("detach failed")));
        handle.unload(7);
        assert!(!handle.is_pending());
    }

    #[test]
    fn test_noop_handle() {
        let handle = UnloadHandle::noop();
        assert!(!handle.is_pending());
        handle.unload(1);
    }
}
