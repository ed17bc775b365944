use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::QueueError;
use crate::key::RequestKey;

/// Type-erased value produced by a dispatched call. Wrapped in an `Arc` once
/// so a deduplicated result is shared, never cloned.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// What every waiter on a request receives.
pub(crate) type Outcome = std::result::Result<ErasedValue, QueueError>;

/// Result slot for one request. Broadcast so the original submitter and all
/// deduplicated followers resolve from the same dispatch. Capacity 1 —
/// exactly one value is ever sent.
pub(crate) type SlotSender = broadcast::Sender<Outcome>;
pub(crate) type SlotReceiver = broadcast::Receiver<Outcome>;

/// The unit of work the worker executes.
pub(crate) enum Call {
    /// Natively async call, awaited directly on the worker.
    Async(BoxFuture<'static, anyhow::Result<ErasedValue>>),
    /// Plain blocking call, off-loaded to the blocking pool so a hung
    /// upstream call cannot distort the rate gate's timing.
    Blocking(Box<dyn FnOnce() -> anyhow::Result<ErasedValue> + Send + 'static>),
}

/// One pending request: created at submission, consumed exactly once by the
/// worker, gone once its result slot resolves.
pub(crate) struct QueuedRequest {
    pub(crate) key: RequestKey,
    pub(crate) call: Call,
    pub(crate) enqueued_at: Instant,
    pub(crate) slot: SlotSender,
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("key", &self.key)
            .field("queued_for", &self.enqueued_at.elapsed())
            .finish()
    }
}
