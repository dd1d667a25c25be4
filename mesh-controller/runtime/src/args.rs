use crate::{
    api,
    dns::{DnsClient, DnsProvider},
    events::EventSink,
    metrics::Metrics,
    provider::Provider,
    reconciler::Reconciler,
    shadow::ShadowManager,
    store::Store,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use mesh_controller_core::ports::{PortClass, PortTable};
use mesh_controller_k8s_api::{self as k8s, Resource, ResourceExt};
use mesh_controller_k8s_index::{ClusterConfig, Index};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "mesh-controller", about = "A service mesh controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "mesh_controller=info,warn",
        env = "MESH_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace the mesh itself runs in.
    #[clap(long, default_value = "mesh")]
    namespace: String,

    /// Traffic class of TCP ports without a traffic-type annotation.
    #[clap(long, default_value = "http")]
    default_mode: PortClass,

    /// Enforce TrafficTarget access control.
    #[clap(long)]
    acl: bool,

    /// Namespaces whose services are never meshed. kube-system and the
    /// mesh namespace are always ignored.
    #[clap(long)]
    ignore_namespaces: Vec<String>,

    /// Sizes of the three mesh port pools.
    #[clap(long, default_value = "10")]
    limit_http_port: u16,

    #[clap(long, default_value = "25")]
    limit_tcp_port: u16,

    #[clap(long, default_value = "25")]
    limit_udp_port: u16,

    /// Bind address of the configuration API.
    #[clap(long, default_value = "0.0.0.0:9000")]
    api_addr: SocketAddr,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    /// The pseudo-domain user traffic addresses.
    #[clap(long, default_value = "mesh")]
    mesh_suffix: String,

    /// Debounce window for coalescing informer bursts, in milliseconds.
    #[clap(long, default_value = "200")]
    throttle_duration_ms: u64,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Copy, Clone, Debug, clap::Subcommand)]
enum Command {
    /// Run the controller and the configuration API (the default).
    Run,
    /// Verify the mesh resource kinds and patch the cluster DNS; exit.
    Prepare,
    /// Delete all shadow services and restore the cluster DNS.
    Cleanup,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        match self.command.unwrap_or(Command::Run) {
            Command::Run => self.run_controller().await,
            Command::Prepare => self.prepare().await,
            Command::Cleanup => self.cleanup().await,
        }
    }

    fn cluster_config(&self) -> Arc<ClusterConfig> {
        Arc::new(ClusterConfig {
            mesh_namespace: self.namespace.clone(),
            cluster_domain: self.cluster_domain.clone(),
            mesh_suffix: self.mesh_suffix.clone(),
            default_mode: self.default_mode,
            acl_enabled: self.acl,
            ignored_namespaces: self
                .ignore_namespaces
                .iter()
                .cloned()
                .chain(Some("kube-system".to_string()))
                .collect(),
        })
    }

    async fn run_controller(self) -> Result<()> {
        let cluster = self.cluster_config();

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("mesh_controller"));

        let admin = self.admin.into_builder().with_prometheus(prom);

        let mut runtime = kubert::Runtime::builder()
            .with_log(self.log_level, self.log_format)
            .with_admin(admin)
            .with_client(self.client)
            .build()
            .await?;

        let (index, work) = Index::shared(cluster.clone());

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
        );

        let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), endpoints).instrument(info_span!("endpoints")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        if api_resource_exists::<k8s::access::TrafficTarget>(&runtime.client()).await {
            let targets = runtime.watch_all::<k8s::access::TrafficTarget>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(index.clone(), targets)
                    .instrument(info_span!("traffictargets")),
            );
        } else {
            tracing::warn!("traffictargets.access.smi-spec.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<k8s::specs::HTTPRouteGroup>(&runtime.client()).await {
            let groups = runtime.watch_all::<k8s::specs::HTTPRouteGroup>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(index.clone(), groups)
                    .instrument(info_span!("httproutegroups")),
            );
        } else {
            tracing::warn!("httproutegroups.specs.smi-spec.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<k8s::specs::TCPRoute>(&runtime.client()).await {
            let routes = runtime.watch_all::<k8s::specs::TCPRoute>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(index.clone(), routes).instrument(info_span!("tcproutes")),
            );
        } else {
            tracing::warn!("tcproutes.specs.smi-spec.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<k8s::split::TrafficSplit>(&runtime.client()).await {
            let splits = runtime.watch_all::<k8s::split::TrafficSplit>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(index.clone(), splits)
                    .instrument(info_span!("trafficsplits")),
            );
        } else {
            tracing::warn!("trafficsplits.split.smi-spec.io resource kind not found, skipping watches");
        }

        let (store, reader) = Store::new();
        tokio::spawn(serve_api(
            self.api_addr,
            reader,
            index.clone(),
            runtime.shutdown_handle(),
        ));

        let client = runtime.client();
        let reconciler = Reconciler::new(
            index,
            work,
            PortTable::new(self.limit_http_port, self.limit_tcp_port, self.limit_udp_port),
            ShadowManager::new(client.clone(), &cluster.mesh_namespace),
            Provider::new(&cluster.mesh_suffix, cluster.default_mode, cluster.acl_enabled),
            store,
            EventSink::new(client),
            metrics,
            Duration::from_millis(self.throttle_duration_ms),
        );
        let reconciler = tokio::spawn(
            reconciler
                .run(runtime.shutdown_handle())
                .instrument(info_span!("reconciler")),
        );

        // Block on the shutdown signal; a failed reconciler startup (cache
        // sync, port-book recovery) aborts the process instead.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("aborted");
                }
            }
            res = reconciler => match res {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(error),
                Err(error) => bail!("reconciler task failed: {}", error),
            },
        }

        Ok(())
    }

    async fn prepare(self) -> Result<()> {
        let cluster = self.cluster_config();
        let runtime = kubert::Runtime::builder()
            .with_log(self.log_level.clone(), self.log_format.clone())
            .with_client(self.client.clone())
            .build()
            .await?;
        let client = runtime.client();

        // The watches in `run` degrade gracefully; prepare is the strict
        // gate that the mesh resource kinds are actually served.
        if !api_resource_exists::<k8s::access::TrafficTarget>(&client).await {
            bail!("traffictargets.access.smi-spec.io is not installed");
        }
        if !api_resource_exists::<k8s::specs::HTTPRouteGroup>(&client).await {
            bail!("httproutegroups.specs.smi-spec.io is not installed");
        }
        if !api_resource_exists::<k8s::specs::TCPRoute>(&client).await {
            bail!("tcproutes.specs.smi-spec.io is not installed");
        }
        if !api_resource_exists::<k8s::split::TrafficSplit>(&client).await {
            bail!("trafficsplits.split.smi-spec.io is not installed");
        }

        let dns = DnsClient::new(client, &cluster);
        match dns.detect().await? {
            DnsProvider::CoreDns => dns.configure_core_dns().await?,
            DnsProvider::KubeDns => dns.configure_kube_dns().await?,
        }
        info!("cluster prepared");
        Ok(())
    }

    async fn cleanup(self) -> Result<()> {
        let cluster = self.cluster_config();
        let runtime = kubert::Runtime::builder()
            .with_log(self.log_level.clone(), self.log_format.clone())
            .with_client(self.client.clone())
            .build()
            .await?;
        let client = runtime.client();

        let shadows = k8s::Api::<k8s::Service>::namespaced(client.clone(), &self.namespace);
        let owned = k8s::ListParams::default().labels("app=mesh,component=mesh-svc");
        for service in shadows
            .list(&owned)
            .await
            .context("listing shadow services")?
        {
            let name = service.name_unchecked();
            match shadows.delete(&name, &Default::default()).await {
                Ok(_) => info!(shadow = %name, "deleted shadow service"),
                Err(k8s::Error::Api(response)) if response.code == 404 => {}
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("deleting shadow service {}", name))
                }
            }
        }

        let dns = DnsClient::new(client, &cluster);
        dns.restore().await?;
        info!("cluster cleaned up");
        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn serve_api(
    addr: SocketAddr,
    store: crate::store::Reader,
    index: mesh_controller_k8s_index::SharedIndex,
    drain: drain::Watch,
) {
    if let Err(error) = api::serve(addr, store, index, drain).await {
        tracing::error!(%error, "configuration API server failed");
    }
}

async fn api_resource_exists<T>(client: &k8s::Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    let resources = client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .expect("Failed to list API group resources");
    resources.resources.iter().any(|r| r.kind == T::kind(&dt))
}
