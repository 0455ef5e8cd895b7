use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::variant::Variant;

/// Receiver of native event emissions. Implementations may be invoked from
/// any thread.
pub trait EventSink: Send + Sync {
    fn deliver(&self, args: &[Variant]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Registration table of one native event source.
#[derive(Default)]
pub struct NativeSignal {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(ConnectionId, Arc<dyn EventSink>)>>,
}

impl NativeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, sink: Arc<dyn EventSink>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.lock().push((id, sink));
        id
    }

    /// Returns false when `id` was not connected.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let mut sinks = self.sinks.lock();
        let before = sinks.len();
        sinks.retain(|(existing, _)| *existing != id);
        sinks.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Delivers to every sink in connection order. The table is copied
    /// first, so sinks may connect or disconnect while being delivered to.
    pub fn emit(&self, args: &[Variant]) {
        let sinks = self
            .sinks
            .lock()
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect::<Vec<_>>();
        for sink in sinks {
            sink.deliver(args);
        }
    }
}

impl std::fmt::Debug for NativeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeSignal")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
