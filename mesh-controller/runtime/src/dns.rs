//! Cluster DNS bootstrap.
//!
//! `prepare` patches the cluster DNS server so `<svc>.<ns>.<suffix>` names
//! resolve into the mesh; `cleanup` restores the configuration from a
//! backup taken before the first patch. Nothing here runs during steady
//! state.

use anyhow::{anyhow, Context, Result};
use mesh_controller_core::keys;
use mesh_controller_k8s_api::{self as k8s, ResourceExt};
use serde_json::json;

const SYSTEM_NAMESPACE: &str = "kube-system";

const COREDNS: &str = "coredns";
const COREDNS_BACKUP: &str = "coredns-backup";
const COREFILE_KEY: &str = "Corefile";

const KUBEDNS: &str = "kube-dns";
const KUBEDNS_BACKUP: &str = "kube-dns-backup";
const STUB_DOMAINS_KEY: &str = "stubDomains";

/// The service fronting the mesh's own DNS server, used in kube-dns
/// stub-domain mode.
const MESH_DNS_SERVICE: &str = "mesh-dns";

/// Marks a live DNS configmap whose pre-patch state has been backed up.
const BACKUP_LABEL: &str = "mesh-backed-up";

const RESTART_ANNOTATION: &str = "mesh.io/restarted-at";

const BLOCK_BEGIN: &str = "#### Begin Mesh Block";
const BLOCK_END: &str = "#### End Mesh Block";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DnsProvider {
    CoreDns,
    KubeDns,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DetectError {
    #[error("unable to detect the cluster DNS provider")]
    UnknownProvider,

    #[error(transparent)]
    Api(#[from] k8s::Error),
}

pub(crate) struct DnsClient {
    client: k8s::Client,
    mesh_namespace: String,
    cluster_domain: String,
    mesh_suffix: String,
}

// === impl DnsClient ===

impl DnsClient {
    pub fn new(client: k8s::Client, cluster: &mesh_controller_k8s_index::ClusterConfig) -> Self {
        Self {
            client,
            mesh_namespace: cluster.mesh_namespace.clone(),
            cluster_domain: cluster.cluster_domain.clone(),
            mesh_suffix: cluster.mesh_suffix.clone(),
        }
    }

    pub async fn detect(&self) -> Result<DnsProvider, DetectError> {
        let deployments =
            k8s::Api::<k8s::Deployment>::namespaced(self.client.clone(), SYSTEM_NAMESPACE);
        if deployments.get_opt(COREDNS).await?.is_some() {
            return Ok(DnsProvider::CoreDns);
        }
        if deployments.get_opt(KUBEDNS).await?.is_some() {
            return Ok(DnsProvider::KubeDns);
        }
        Err(DetectError::UnknownProvider)
    }

    pub async fn configure_core_dns(&self) -> Result<()> {
        let system = self.system_config_maps();
        let live = system
            .get(COREDNS)
            .await
            .context("fetching the coredns configmap")?;

        self.backup(&live, COREDNS_BACKUP).await?;

        let corefile = live
            .data
            .as_ref()
            .and_then(|data| data.get(COREFILE_KEY))
            .cloned()
            .ok_or_else(|| anyhow!("the coredns configmap has no Corefile"))?;

        let block = mesh_block(&self.mesh_suffix, &self.mesh_namespace, &self.cluster_domain);
        let patched = append_mesh_block(&corefile, &block);
        if patched == corefile && is_backed_up(&live) {
            tracing::info!("coredns is already configured for the mesh");
            return Ok(());
        }

        let patch = json!({
            "metadata": { "labels": { BACKUP_LABEL: "true" } },
            "data": { COREFILE_KEY: patched },
        });
        system
            .patch(COREDNS, &k8s::PatchParams::default(), &k8s::Patch::Merge(&patch))
            .await
            .context("patching the coredns configmap")?;

        self.restart(COREDNS).await?;
        tracing::info!(suffix = %self.mesh_suffix, "coredns configured");
        Ok(())
    }

    pub async fn configure_kube_dns(&self) -> Result<()> {
        // kube-dns cannot rewrite names, so the mesh suffix is delegated to
        // the mesh's own DNS service instead.
        let services =
            k8s::Api::<k8s::Service>::namespaced(self.client.clone(), &self.mesh_namespace);
        let cluster_ip = services
            .get(MESH_DNS_SERVICE)
            .await
            .context("fetching the mesh DNS service")?
            .spec
            .and_then(|spec| spec.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None")
            .ok_or_else(|| anyhow!("the mesh DNS service has no cluster IP"))?;

        let system = self.system_config_maps();
        let live = system
            .get(KUBEDNS)
            .await
            .context("fetching the kube-dns configmap")?;

        self.backup(&live, KUBEDNS_BACKUP).await?;

        let mut stub_domains = serde_json::Map::new();
        stub_domains.insert(self.mesh_suffix.clone(), json!([cluster_ip]));
        let patch = json!({
            "metadata": { "labels": { BACKUP_LABEL: "true" } },
            "data": { STUB_DOMAINS_KEY: serde_json::Value::Object(stub_domains).to_string() },
        });
        system
            .patch(KUBEDNS, &k8s::PatchParams::default(), &k8s::Patch::Merge(&patch))
            .await
            .context("patching the kube-dns configmap")?;

        self.restart(KUBEDNS).await?;
        tracing::info!(suffix = %self.mesh_suffix, "kube-dns configured");
        Ok(())
    }

    /// Restores the DNS configuration from the backup taken by configure.
    /// Tolerates partial state: a missing provider, a missing backup or an
    /// unlabeled configmap each degrade with a warning rather than failing.
    pub async fn restore(&self) -> Result<()> {
        match self.detect().await {
            Ok(DnsProvider::CoreDns) => self.restore_config_map(COREDNS, COREDNS_BACKUP).await,
            Ok(DnsProvider::KubeDns) => self.restore_config_map(KUBEDNS, KUBEDNS_BACKUP).await,
            Err(error) => {
                tracing::warn!(%error, "skipping DNS restore");
                Ok(())
            }
        }
    }

    async fn restore_config_map(&self, live_name: &str, backup_name: &str) -> Result<()> {
        let system = self.system_config_maps();
        let mut live = system
            .get(live_name)
            .await
            .with_context(|| format!("fetching the {} configmap", live_name))?;

        if !is_backed_up(&live) {
            // A third party may have replaced the configmap since the
            // patch; restoring over their changes would clobber them.
            tracing::warn!(
                config_map = %live_name,
                "configmap is not marked as mesh-backed-up; leaving it untouched"
            );
            return Ok(());
        }

        let mesh =
            k8s::Api::<k8s::ConfigMap>::namespaced(self.client.clone(), &self.mesh_namespace);
        let data = match mesh.get_opt(backup_name).await? {
            Some(backup) => backup.data.unwrap_or_default(),
            None => {
                tracing::warn!(
                    backup = %backup_name,
                    "backup configmap is missing; stripping the mesh block instead"
                );
                live.data
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, value)| (key, strip_mesh_block(&value)))
                    .collect()
            }
        };

        live.data = Some(data);
        if let Some(labels) = live.metadata.labels.as_mut() {
            labels.remove(BACKUP_LABEL);
        }
        system
            .replace(live_name, &k8s::PostParams::default(), &live)
            .await
            .with_context(|| format!("restoring the {} configmap", live_name))?;

        self.restart(live_name).await?;
        tracing::info!(config_map = %live_name, "DNS configuration restored");
        Ok(())
    }

    /// Creates the backup configmap in the mesh namespace unless the live
    /// map is already marked as backed up. An existing backup wins.
    async fn backup(&self, live: &k8s::ConfigMap, backup_name: &str) -> Result<()> {
        if is_backed_up(live) {
            return Ok(());
        }
        let backup = k8s::ConfigMap {
            metadata: k8s::ObjectMeta {
                name: Some(backup_name.to_string()),
                namespace: Some(self.mesh_namespace.clone()),
                ..Default::default()
            },
            data: live.data.clone(),
            ..Default::default()
        };
        let mesh =
            k8s::Api::<k8s::ConfigMap>::namespaced(self.client.clone(), &self.mesh_namespace);
        match mesh.create(&k8s::PostParams::default(), &backup).await {
            Ok(created) => {
                tracing::info!(backup = %created.name_unchecked(), "backed up the DNS configmap");
                Ok(())
            }
            Err(k8s::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(error) => Err(error).context("creating the DNS backup configmap"),
        }
    }

    /// Rolls a DNS deployment by stamping its pod template.
    async fn restart(&self, name: &str) -> Result<()> {
        let deployments =
            k8s::Api::<k8s::Deployment>::namespaced(self.client.clone(), SYSTEM_NAMESPACE);
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { RESTART_ANNOTATION: chrono::Utc::now().to_rfc3339() }
                    }
                }
            }
        });
        deployments
            .patch(name, &k8s::PatchParams::default(), &k8s::Patch::Merge(&patch))
            .await
            .with_context(|| format!("restarting the {} deployment", name))?;
        Ok(())
    }

    fn system_config_maps(&self) -> k8s::Api<k8s::ConfigMap> {
        k8s::Api::namespaced(self.client.clone(), SYSTEM_NAMESPACE)
    }
}

fn is_backed_up(config_map: &k8s::ConfigMap) -> bool {
    config_map
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(BACKUP_LABEL))
        .map(String::as_str)
        == Some("true")
}

/// Renders the fenced server block appended to the Corefile.
///
/// The suffix may contain dots, so it rides inside the rewritten name as a
/// hex label; the answer rewrite uses the same label to restore the
/// original question name.
fn mesh_block(suffix: &str, mesh_namespace: &str, cluster_domain: &str) -> String {
    let hex = keys::hex_label(suffix);
    let suffix_re = suffix.replace('.', "\\.");
    let domain_re = cluster_domain.replace('.', "\\.");
    let lines = [
        BLOCK_BEGIN.to_string(),
        format!("{}:53 {{", suffix),
        "    errors".to_string(),
        "    rewrite continue {".to_string(),
        format!(
            "        name regex ([a-zA-Z0-9-_]*)\\.([a-zA-Z0-9-_]*)\\.{} {}-{{1}}-{}-{{2}}.{}.svc.{}",
            suffix_re, mesh_namespace, hex, mesh_namespace, cluster_domain
        ),
        format!(
            "        answer name {}-([a-zA-Z0-9-_]*)-{}-([a-zA-Z0-9-_]*)\\.{}\\.svc\\.{} {{1}}.{{2}}.{}",
            mesh_namespace, hex, mesh_namespace, domain_re, suffix
        ),
        "    }".to_string(),
        format!("    kubernetes {} in-addr.arpa ip6.arpa", cluster_domain),
        "    forward . /etc/resolv.conf".to_string(),
        "}".to_string(),
        BLOCK_END.to_string(),
    ];
    lines.join("\n")
}

/// Appends the mesh block to a Corefile, once.
fn append_mesh_block(corefile: &str, block: &str) -> String {
    if corefile.contains(BLOCK_BEGIN) {
        return corefile.to_string();
    }
    let mut patched = corefile.to_string();
    if !patched.ends_with('\n') {
        patched.push('\n');
    }
    patched.push_str(block);
    patched.push('\n');
    patched
}

/// Removes the mesh block, tolerating a missing or truncated fence.
fn strip_mesh_block(corefile: &str) -> String {
    let begin = match corefile.find(BLOCK_BEGIN) {
        Some(i) => i,
        None => return corefile.to_string(),
    };
    let end = corefile[begin..]
        .find(BLOCK_END)
        .map(|i| begin + i + BLOCK_END.len())
        .unwrap_or(corefile.len());
    let mut stripped = corefile[..begin].to_string();
    stripped.push_str(corefile[end..].trim_start_matches('\n'));
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;

    const COREFILE: &str = ".:53 {\n    errors\n    health\n    kubernetes cluster.local in-addr.arpa ip6.arpa\n    forward . /etc/resolv.conf\n}\n";

    #[test]
    fn the_block_rewrites_through_the_hex_label() {
        let block = mesh_block("mesh", "mesh", "cluster.local");
        assert!(block.starts_with(BLOCK_BEGIN));
        assert!(block.ends_with(BLOCK_END));
        assert!(block.contains("mesh:53 {"));
        assert!(block.contains(
            "name regex ([a-zA-Z0-9-_]*)\\.([a-zA-Z0-9-_]*)\\.mesh mesh-{1}-6d657368-{2}.mesh.svc.cluster.local"
        ));
        assert!(block.contains(
            "answer name mesh-([a-zA-Z0-9-_]*)-6d657368-([a-zA-Z0-9-_]*)\\.mesh\\.svc\\.cluster\\.local {1}.{2}.mesh"
        ));
    }

    #[test]
    fn dotted_suffixes_are_escaped() {
        let block = mesh_block("traefik.mesh", "mesh", "cluster.local");
        assert!(block.contains("traefik.mesh:53 {"));
        assert!(block.contains("\\.traefik\\.mesh "));
    }

    #[test]
    fn append_is_idempotent() {
        let block = mesh_block("mesh", "mesh", "cluster.local");
        let once = append_mesh_block(COREFILE, &block);
        let twice = append_mesh_block(&once, &block);
        assert_ne!(once, COREFILE);
        assert_eq!(once, twice);
    }

    #[test]
    fn strip_returns_the_original_bytes() {
        let block = mesh_block("mesh", "mesh", "cluster.local");
        let patched = append_mesh_block(COREFILE, &block);
        assert_eq!(strip_mesh_block(&patched), COREFILE);
        assert_eq!(strip_mesh_block(COREFILE), COREFILE);
    }
}
