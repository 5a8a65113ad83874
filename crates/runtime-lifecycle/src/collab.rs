//! Collaboration cleanup signal.
//!
//! Emitted during teardown before the runtime's sockets are closed, so a
//! collaborative-editing provider bound to the runtime can detach first.

use log::debug;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaborationCleanup {
    pub runtime_id: String,
}

pub struct CollaborationSignal {
    sender: broadcast::Sender<CollaborationCleanup>,
}

impl CollaborationSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollaborationCleanup> {
        self.sender.subscribe()
    }

    /// Notify subscribers. Returns how many received it.
    pub fn emit(&self, runtime_id: &str) -> usize {
        let delivered = self
            .sender
            .send(CollaborationCleanup {
                runtime_id: runtime_id.to_string(),
            })
            .unwrap_or(0);
        debug!(
            "[runtime-lifecycle] Collaboration cleanup for {} reached {} subscriber(s)",
            runtime_id, delivered
        );
        delivered
    }
}

impl Default for CollaborationSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        assert_eq!(CollaborationSignal::new().emit("rt-1"), 0);
    }

    #[test]
    fn test_subscribers_receive_runtime_id() {
        let signal = CollaborationSignal::new();
        let mut rx = signal.subscribe();
        assert_eq!(signal.emit("rt-1"), 1);
        assert_eq!(rx.try_recv().unwrap().runtime_id, "rt-1");
    }
}
