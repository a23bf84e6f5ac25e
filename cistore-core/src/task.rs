//! Progress reporting and cooperative cancellation
//!
//! Long-running filesystem work (manifest generation, copying, extraction)
//! runs synchronously on the calling thread; these types only exist so an
//! outer layer can observe progress and request cancellation at the
//! well-defined check points.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Callback surface for long-running store operations.
///
/// Progress is reported in bytes. Cancellation is polled cooperatively;
/// a cancelled operation fails with a distinct `Cancelled` outcome, never
/// with an IO error.
pub trait TaskHandler: Sync {
    /// Announces the total number of bytes the operation will process.
    fn begin_total(&self, _total_bytes: u64) {}

    /// Reports that another chunk of bytes has been processed.
    fn report(&self, _bytes: u64) {}

    /// Polled at the cancellation check points.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A handler that ignores progress and never cancels.
pub struct SilentTaskHandler;

impl TaskHandler for SilentTaskHandler {}

/// Cloneable cancellation signal shared between a controller and the
/// operations it drives.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Running operations stop at their next check point.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A handler wired to a `CancellationToken`, ignoring progress.
pub struct CancellableHandler {
    token: CancellationToken,
}

impl CancellableHandler {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl TaskHandler for CancellableHandler {
    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
