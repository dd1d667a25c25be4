use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use mesh_controller_core::ResourceKey;
use mesh_controller_k8s_api as k8s;

/// Publishes Kubernetes events on the objects a reconcile stumbled over.
#[derive(Clone)]
pub(crate) struct EventSink {
    client: k8s::Client,
    reporter: Reporter,
}

// === impl EventSink ===

impl EventSink {
    pub fn new(client: k8s::Client) -> Self {
        let reporter = Reporter {
            controller: "mesh-controller".to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self { client, reporter }
    }

    /// Emits a warning event. Events are best-effort: a publish failure is
    /// logged, never propagated.
    pub async fn warn(
        &self,
        kind: &str,
        object: &ResourceKey,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let reference = k8s::ObjectReference {
            kind: Some(kind.to_string()),
            namespace: Some(object.namespace.clone()),
            name: Some(object.name.clone()),
            ..Default::default()
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(error) = recorder.publish(event).await {
            tracing::warn!(%error, object = %object, "failed to publish event");
        }
    }
}
