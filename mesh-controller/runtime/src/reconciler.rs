//! The reconcile loop.
//!
//! All controller mutation happens on this single task: the port book, the
//! shadow-service set and the published snapshot have exactly one writer,
//! so none of them needs locking. Watch tasks only feed the cache index and
//! ping the work channel; a cycle drains the channel, rebuilds the world
//! from a snapshot and publishes the result.

use crate::{
    events::EventSink, metrics::Metrics, provider::Provider, shadow::ShadowManager, store::Store,
};
use anyhow::Context;
use futures::FutureExt;
use mesh_controller_core::{
    annotations::{self, ServiceAnnotations},
    ports::{PortTable, SourcePort},
    ResourceKey,
};
use mesh_controller_k8s_index::{topology, SharedIndex, Snapshot};
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use tokio::{sync::mpsc, time, time::Duration};

/// How long the first informer event may take before startup is declared
/// failed.
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-service attempts before a failing work item is dropped.
const MAX_ATTEMPTS: u32 = 3;

pub(crate) struct Reconciler {
    index: SharedIndex,
    work: mpsc::UnboundedReceiver<()>,
    waker: mpsc::UnboundedSender<()>,
    ports: PortTable,
    shadows: ShadowManager,
    provider: Provider,
    store: Store,
    events: EventSink,
    metrics: Metrics,
    throttle: Duration,
    attempts: HashMap<ResourceKey, u32>,
    seeded: bool,
}

enum CycleError {
    /// The process must exit; the cluster state cannot be reconciled.
    Fatal(anyhow::Error),
}

// === impl Reconciler ===

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: SharedIndex,
        work: mpsc::UnboundedReceiver<()>,
        ports: PortTable,
        shadows: ShadowManager,
        provider: Provider,
        store: Store,
        events: EventSink,
        metrics: Metrics,
        throttle: Duration,
    ) -> Self {
        let waker = index.read().waker();
        Self {
            index,
            work,
            waker,
            ports,
            shadows,
            provider,
            store,
            events,
            metrics,
            throttle,
            attempts: HashMap::new(),
            seeded: false,
        }
    }

    pub async fn run(mut self, drain: drain::Watch) -> anyhow::Result<()> {
        // The first informer signal doubles as the cache-sync barrier: if
        // nothing arrives, the watches never delivered their initial lists.
        tokio::select! {
            first = time::timeout(CACHE_SYNC_TIMEOUT, self.work.recv()) => match first {
                Ok(Some(())) => {}
                Ok(None) => return Ok(()),
                Err(_) => anyhow::bail!(
                    "informer caches did not sync within {:?}",
                    CACHE_SYNC_TIMEOUT
                ),
            },
            _ = drain.clone().signaled() => return Ok(()),
        }

        loop {
            self.coalesce().await;

            match AssertUnwindSafe(self.cycle()).catch_unwind().await {
                Ok(Ok(())) => self.metrics.reconcile_ok(),
                Ok(Err(CycleError::Fatal(error))) => return Err(error),
                Err(panic) => {
                    self.metrics.reconcile_failed();
                    self.store.fail();
                    tracing::error!(panic = panic_message(&*panic), "reconcile panicked");
                }
            }

            tokio::select! {
                _ = drain.clone().signaled() => return Ok(()),
                item = self.work.recv() => {
                    if item.is_none() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Collapses an event burst into one cycle: waits out the debounce
    /// window, then drains everything queued meanwhile.
    async fn coalesce(&mut self) {
        time::sleep(self.throttle).await;
        while self.work.try_recv().is_ok() {}
    }

    async fn cycle(&mut self) -> Result<(), CycleError> {
        let snapshot = self.index.read().snapshot();

        if !self.seeded {
            self.seed(&snapshot).map_err(CycleError::Fatal)?;
            self.seeded = true;
        }

        self.reconcile_shadows(&snapshot).await;

        let (topology, warnings) = topology::build(&snapshot);
        for warning in &warnings {
            self.events
                .warn(
                    warning.object_kind,
                    &warning.object,
                    warning.reason,
                    "Reconcile",
                    warning.message.clone(),
                )
                .await;
        }

        let configuration = self.provider.build(&topology, &self.ports);
        self.store.publish(configuration, topology);
        Ok(())
    }

    /// Rebuilds the port book from the shadow services that survived a
    /// restart. Two shadows claiming one mesh port is unrecoverable.
    fn seed(&mut self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let mut entries = Vec::new();
        for shadow in snapshot.shadows.values() {
            let source = match &shadow.source {
                Some(source) => source,
                None => {
                    tracing::warn!(
                        shadow = %shadow.name,
                        "shadow service has no source annotations; not recovering its ports"
                    );
                    continue;
                }
            };
            for port in &shadow.ports {
                let mesh_port = match port.mesh_port {
                    Some(mesh_port) => mesh_port,
                    None => continue,
                };
                if self.ports.classify(mesh_port).is_none() {
                    tracing::warn!(
                        shadow = %shadow.name,
                        mesh_port,
                        "target port is outside every mesh pool; not recovering it"
                    );
                    continue;
                }
                entries.push((SourcePort::new(source.clone(), port.port), mesh_port));
            }
        }
        let recovered = entries.len();
        self.ports
            .load(entries)
            .context("rebuilding the port book from shadow services")?;
        tracing::info!(ports = recovered, "port book recovered");
        Ok(())
    }

    /// Diffs the shadow-service set against the user services and applies
    /// creations, updates and deletions in sorted order. Failures are
    /// per-service: they are reported and retried without aborting the
    /// cycle.
    async fn reconcile_shadows(&mut self, snapshot: &Snapshot) {
        let cluster = &snapshot.cluster;

        // Shadows to keep, by name. Rejected services keep their current
        // shadow untouched rather than having it torn down under them.
        let mut keep = BTreeSet::<String>::new();

        for (key, service) in &snapshot.services {
            let name = cluster.shadow_service_name(key);
            let (parsed, _) = ServiceAnnotations::parse(&service.annotations);
            let protocols: Vec<_> = service.ports.iter().map(|p| (p.protocol, p.port)).collect();
            let classes =
                match annotations::port_classes(&protocols, &parsed, cluster.default_mode) {
                    Ok(classes) => classes,
                    Err(error) => {
                        self.metrics.service_skipped();
                        self.events
                            .warn("Service", key, "InvalidTrafficType", "Reconcile", error.to_string())
                            .await;
                        keep.insert(name);
                        continue;
                    }
                };
            keep.insert(name.clone());

            let mut mesh_ports = Vec::with_capacity(service.ports.len());
            let mut exhausted = false;
            for (port, class) in service.ports.iter().zip(&classes) {
                match self
                    .ports
                    .acquire(SourcePort::new(key.clone(), port.port), *class)
                {
                    Ok(mesh_port) => mesh_ports.push(mesh_port),
                    Err(error) => {
                        self.metrics.service_skipped();
                        self.events
                            .warn("Service", key, "PortPoolExhausted", "Reconcile", error.to_string())
                            .await;
                        exhausted = true;
                        break;
                    }
                }
            }
            if exhausted {
                continue;
            }

            if let Some(existing) = snapshot.shadows.get(&name) {
                if ShadowManager::up_to_date(existing, service, &mesh_ports) {
                    self.attempts.remove(key);
                    continue;
                }
            }

            let desired = ShadowManager::desired(cluster, service, &mesh_ports);
            match self.shadows.apply(desired).await {
                Ok(()) => {
                    tracing::info!(service = %key, shadow = %name, "applied shadow service");
                    self.attempts.remove(key);
                }
                Err(error) => {
                    self.note_failure(key.clone(), "ShadowApplyFailed", error.to_string())
                        .await;
                }
            }
        }

        // Shadows whose source service is gone.
        for (name, shadow) in &snapshot.shadows {
            if keep.contains(name) {
                continue;
            }
            match self.shadows.delete(name).await {
                Ok(()) => {
                    tracing::info!(shadow = %name, "deleted shadow service");
                    if let Some(source) = &shadow.source {
                        for port in &shadow.ports {
                            self.ports
                                .release(&SourcePort::new(source.clone(), port.port));
                        }
                        self.attempts.remove(source);
                    }
                }
                Err(error) => {
                    let key = shadow
                        .source
                        .clone()
                        .unwrap_or_else(|| ResourceKey::new(&cluster.mesh_namespace, name));
                    self.note_failure(key, "ShadowDeleteFailed", error.to_string())
                        .await;
                }
            }
        }
    }

    /// Retry bookkeeping for a failed work item: exponential backoff up to
    /// `MAX_ATTEMPTS`, then a warning event and the item is dropped.
    async fn note_failure(&mut self, key: ResourceKey, reason: &'static str, message: String) {
        let attempt = {
            let attempts = self.attempts.entry(key.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if attempt >= MAX_ATTEMPTS {
            self.attempts.remove(&key);
            tracing::warn!(service = %key, %message, "giving up after {} attempts", MAX_ATTEMPTS);
            self.events
                .warn(
                    "Service",
                    &key,
                    reason,
                    "Reconcile",
                    format!("{} (giving up after {} attempts)", message, MAX_ATTEMPTS),
                )
                .await;
            return;
        }

        let delay = backoff(attempt);
        tracing::warn!(service = %key, %message, attempt, ?delay, "reconcile attempt failed; retrying");
        let waker = self.waker.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = waker.send(());
        });
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(100 * (1u64 << attempt.min(6)))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("panic")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(200));
        assert_eq!(backoff(2), Duration::from_millis(400));
        assert_eq!(backoff(100), backoff(6));
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(17_u32);
        assert_eq!(panic_message(&*boxed), "panic");
    }
}
