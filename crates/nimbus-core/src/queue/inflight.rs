use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::error::QueueError;
use crate::key::RequestKey;

use super::request::{SlotReceiver, SlotSender};

/// Mapping from request key to the shared result slot of the request
/// currently queued or executing under that key. At most one entry per key.
///
/// A std mutex is deliberate: hold times are HashMap-operation sized and the
/// lock is never held across an await point.
pub(crate) struct InFlightIndex {
    slots: Mutex<HashMap<String, SlotSender>>,
}

/// Result of registering a submission.
pub(crate) enum Registration {
    /// First submission for this key — the caller owns the dispatch.
    New {
        slot: SlotSender,
        waiter: SlotReceiver,
    },
    /// An identical request is already queued or executing; ride its slot.
    Joined(SlotReceiver),
}

impl InFlightIndex {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SlotSender>> {
        // A poisoning panic can only have happened between map operations;
        // the map itself is still structurally sound.
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join the in-flight request for `key`, or register a fresh slot.
    ///
    /// Joiners subscribe under the same lock that [`remove`](Self::remove)
    /// takes, so a subscription can never land on an already-resolved slot.
    pub(crate) fn register(&self, key: &RequestKey) -> Registration {
        let mut slots = self.lock();
        if let Some(existing) = slots.get(key.as_str()) {
            return Registration::Joined(existing.subscribe());
        }
        let (slot, waiter) = broadcast::channel(1);
        slots.insert(key.as_str().to_string(), slot.clone());
        Registration::New { slot, waiter }
    }

    /// Drop the entry for `key`. The worker calls this right before it
    /// broadcasts the outcome; the submission path calls it to roll back a
    /// registration whose handoff to the worker failed.
    pub(crate) fn remove(&self, key: &RequestKey) {
        self.lock().remove(key.as_str());
    }

    /// Resolve every remaining slot with [`QueueError::ShutDown`] so no
    /// waiter hangs after a forced worker stop. Returns how many slots were
    /// resolved this way.
    pub(crate) fn drain_with_shutdown(&self) -> usize {
        let drained: Vec<SlotSender> = self.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            let _ = slot.send(Err(QueueError::ShutDown));
        }
        drained.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(op: &str) -> RequestKey {
        RequestKey::bare(op)
    }

    #[test]
    fn second_registration_joins_the_first() {
        let index = InFlightIndex::new();

        let first = index.register(&key("observations"));
        assert!(matches!(first, Registration::New { .. }));

        let second = index.register(&key("observations"));
        assert!(matches!(second, Registration::Joined(_)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn joiner_receives_the_broadcast_outcome() {
        let index = InFlightIndex::new();

        let Registration::New { slot, .. } = index.register(&key("observations")) else {
            panic!("expected a fresh registration");
        };
        let Registration::Joined(mut waiter) = index.register(&key("observations")) else {
            panic!("expected to join the in-flight request");
        };

        index.remove(&key("observations"));
        slot.send(Err(QueueError::NotRunning)).unwrap();

        assert!(matches!(waiter.try_recv(), Ok(Err(QueueError::NotRunning))));
    }

    #[test]
    fn removed_key_registers_fresh() {
        let index = InFlightIndex::new();

        let _first = index.register(&key("observations"));
        index.remove(&key("observations"));

        let again = index.register(&key("observations"));
        assert!(matches!(again, Registration::New { .. }));
    }

    #[test]
    fn distinct_keys_do_not_join() {
        let index = InFlightIndex::new();

        let a = index.register(&key("observations"));
        let b = index.register(&key("forecast"));
        assert!(matches!(a, Registration::New { .. }));
        assert!(matches!(b, Registration::New { .. }));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn drain_resolves_waiters_with_shutdown() {
        let index = InFlightIndex::new();

        let Registration::New { mut waiter, .. } = index.register(&key("observations")) else {
            panic!("expected a fresh registration");
        };

        assert_eq!(index.drain_with_shutdown(), 1);
        assert!(matches!(waiter.try_recv(), Ok(Err(QueueError::ShutDown))));
        assert_eq!(index.len(), 0);
    }
}
