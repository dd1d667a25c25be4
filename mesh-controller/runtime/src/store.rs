//! The published configuration snapshot.
//!
//! The reconciler is the only writer; HTTP handlers read whole immutable
//! snapshots. A watch channel carries `Arc`s, so a publish is one pointer
//! swap and readers never block the writer.

use mesh_controller_core::{config::DynamicConfiguration, topology::Topology};
use std::sync::Arc;
use tokio::sync::watch;

/// One successfully published reconcile outcome.
#[derive(Clone, Debug)]
pub(crate) struct Published {
    pub configuration: Arc<DynamicConfiguration>,
    pub topology: Arc<Topology>,
}

#[derive(Clone, Debug, Default)]
struct State {
    published: Option<Published>,
    last_ok: bool,
}

/// Writer half, owned by the reconciler.
#[derive(Debug)]
pub(crate) struct Store {
    tx: watch::Sender<State>,
}

/// Reader half, cloned into every HTTP handler.
#[derive(Clone, Debug)]
pub(crate) struct Reader {
    rx: watch::Receiver<State>,
}

// === impl Store ===

impl Store {
    pub fn new() -> (Self, Reader) {
        let (tx, rx) = watch::channel(State::default());
        (Self { tx }, Reader { rx })
    }

    pub fn publish(&self, configuration: DynamicConfiguration, topology: Topology) {
        self.tx.send_replace(State {
            published: Some(Published {
                configuration: Arc::new(configuration),
                topology: Arc::new(topology),
            }),
            last_ok: true,
        });
    }

    /// Marks the last reconcile as failed. The previous snapshot stays
    /// published, but readiness drops until the next success.
    pub fn fail(&self) {
        self.tx.send_modify(|state| state.last_ok = false);
    }
}

// === impl Reader ===

impl Reader {
    /// Ready means: at least one publish happened, and the most recent
    /// reconcile succeeded.
    pub fn ready(&self) -> bool {
        let state = self.rx.borrow();
        state.last_ok && state.published.is_some()
    }

    pub fn published(&self) -> Option<Published> {
        self.rx.borrow().published.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_requires_a_publish() {
        let (store, reader) = Store::new();
        assert!(!reader.ready());
        assert!(reader.published().is_none());

        store.publish(Default::default(), Default::default());
        assert!(reader.ready());
        assert!(reader.published().is_some());
    }

    #[test]
    fn a_failed_reconcile_drops_readiness_but_keeps_the_snapshot() {
        let (store, reader) = Store::new();
        store.publish(Default::default(), Default::default());
        assert!(reader.ready());

        store.fail();
        assert!(!reader.ready());
        assert!(reader.published().is_some(), "stale snapshot stays served");

        store.publish(Default::default(), Default::default());
        assert!(reader.ready());
    }

    #[test]
    fn failing_before_any_publish_stays_unready() {
        let (store, reader) = Store::new();
        store.fail();
        assert!(!reader.ready());
    }
}
