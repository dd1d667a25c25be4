use crate::{topology, ClusterConfig, Index, SharedIndex};
use kubert::index::IndexNamespacedResource;
use maplit::{btreemap, btreeset};
use mesh_controller_core::{
    ports::PortClass,
    topology::{PodId, TrafficSpec},
    ResourceKey,
};
use mesh_controller_k8s_api::{self as k8s, IntOrString, ObjectMeta};
use std::sync::Arc;
use tokio::sync::mpsc;

struct TestIndex {
    index: SharedIndex,
    work: mpsc::UnboundedReceiver<()>,
}

impl TestIndex {
    fn new() -> Self {
        let cluster = Arc::new(ClusterConfig {
            mesh_namespace: "mesh".to_string(),
            cluster_domain: "cluster.local".to_string(),
            mesh_suffix: "mesh".to_string(),
            default_mode: PortClass::Http,
            acl_enabled: false,
            ignored_namespaces: btreeset! { "kube-system".to_string() },
        });
        let (index, work) = Index::shared(cluster);
        Self { index, work }
    }

    fn signals(&mut self) -> usize {
        let mut n = 0;
        while self.work.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

fn mk_service(ns: &str, name: &str, ports: Vec<k8s::ServicePort>) -> k8s::Service {
    k8s::Service {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            cluster_ip: Some("10.96.0.10".to_string()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_port(name: &str, port: u16, target_port: u16) -> k8s::ServicePort {
    k8s::ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port: port.into(),
        target_port: Some(IntOrString::Int(target_port.into())),
        ..Default::default()
    }
}

fn mk_pod(ns: &str, name: &str, ip: &str, service_account: &str, ready: bool) -> k8s::Pod {
    k8s::Pod {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            service_account_name: Some(service_account.to_string()),
            ..Default::default()
        }),
        status: Some(k8s::PodStatus {
            pod_ip: Some(ip.to_string()),
            container_statuses: Some(vec![k8s::api::core::v1::ContainerStatus {
                ready,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn mk_endpoints(
    ns: &str,
    name: &str,
    ready: Vec<(&str, &str)>,
    not_ready: Vec<(&str, &str)>,
    ports: Vec<(&str, u16)>,
) -> k8s::Endpoints {
    let address = |(ip, pod): &(&str, &str)| k8s::api::core::v1::EndpointAddress {
        ip: ip.to_string(),
        target_ref: Some(k8s::ObjectReference {
            kind: Some("Pod".to_string()),
            namespace: Some(ns.to_string()),
            name: Some(pod.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    k8s::Endpoints {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![k8s::api::core::v1::EndpointSubset {
            addresses: Some(ready.iter().map(address).collect()),
            not_ready_addresses: Some(not_ready.iter().map(address).collect()),
            ports: Some(
                ports
                    .into_iter()
                    .map(|(name, port)| k8s::api::core::v1::EndpointPort {
                        name: Some(name.to_string()),
                        port: port.into(),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }]),
    }
}

fn mk_traffic_target(
    ns: &str,
    name: &str,
    destination_account: &str,
    sources: Vec<(&str, &str)>,
    rules: Vec<k8s::access::TrafficTargetRule>,
) -> k8s::access::TrafficTarget {
    k8s::access::TrafficTarget {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: k8s::access::TrafficTargetSpec {
            destination: k8s::access::IdentityBindingSubject {
                kind: "ServiceAccount".to_string(),
                name: destination_account.to_string(),
                namespace: Some(ns.to_string()),
                port: None,
            },
            sources: Some(
                sources
                    .into_iter()
                    .map(|(ns, name)| k8s::access::IdentityBindingSubject {
                        kind: "ServiceAccount".to_string(),
                        name: name.to_string(),
                        namespace: Some(ns.to_string()),
                        port: None,
                    })
                    .collect(),
            ),
            rules: Some(rules),
        },
    }
}

fn mk_route_group(ns: &str, name: &str, matches: Vec<k8s::specs::HTTPMatch>) -> k8s::specs::HTTPRouteGroup {
    k8s::specs::HTTPRouteGroup {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: k8s::specs::HTTPRouteGroupSpec {
            matches: Some(matches),
        },
    }
}

fn mk_split(ns: &str, name: &str, root: &str, backends: Vec<(&str, u32)>) -> k8s::split::TrafficSplit {
    k8s::split::TrafficSplit {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: k8s::split::TrafficSplitSpec {
            service: root.to_string(),
            backends: Some(
                backends
                    .into_iter()
                    .map(|(service, weight)| k8s::split::TrafficSplitBackend {
                        service: service.to_string(),
                        weight,
                    })
                    .collect(),
            ),
        },
    }
}

#[test]
fn shadow_services_are_not_user_services() {
    let test = TestIndex::new();
    test.index
        .write()
        .apply(mk_service("app", "foo", vec![mk_port("http", 80, 8080)]));

    let mut shadow = mk_service("mesh", "mesh-foo-app", vec![mk_port("http", 80, 5000)]);
    shadow.metadata.labels = Some(btreemap! {
        "app".to_string() => "mesh".to_string(),
        "component".to_string() => "mesh-svc".to_string(),
    });
    shadow.metadata.annotations = Some(btreemap! {
        "mesh.io/source-service-namespace".to_string() => "app".to_string(),
        "mesh.io/source-service-name".to_string() => "foo".to_string(),
    });
    test.index.write().apply(shadow);

    let snapshot = test.index.read().snapshot();
    assert_eq!(snapshot.services.len(), 1);
    assert!(snapshot.services.contains_key(&ResourceKey::new("app", "foo")));
    let shadow = &snapshot.shadows["mesh-foo-app"];
    assert_eq!(shadow.source, Some(ResourceKey::new("app", "foo")));
    assert_eq!(shadow.ports[0].mesh_port, Some(5000));
}

#[test]
fn ignored_namespaces_are_skipped() {
    let test = TestIndex::new();
    test.index.write().apply(mk_service(
        "kube-system",
        "kube-dns",
        vec![mk_port("dns", 53, 53)],
    ));
    // An unlabeled service in the mesh namespace is not a user service.
    test.index
        .write()
        .apply(mk_service("mesh", "controller", vec![mk_port("api", 9000, 9000)]));

    let snapshot = test.index.read().snapshot();
    assert!(snapshot.services.is_empty());
    assert!(snapshot.shadows.is_empty());
}

#[test]
fn pods_attach_through_endpoints() {
    let test = TestIndex::new();
    {
        let mut index = test.index.write();
        index.apply(mk_service("app", "foo", vec![mk_port("http", 80, 8080)]));
        index.apply(mk_pod("app", "foo-1", "10.0.0.1", "foo", true));
        index.apply(mk_pod("app", "foo-2", "10.0.0.2", "foo", false));
        // A pod that is not an endpoint member must not be attached.
        index.apply(mk_pod("app", "stray", "10.0.0.9", "foo", true));
        index.apply(mk_endpoints(
            "app",
            "foo",
            vec![("10.0.0.1", "foo-1")],
            vec![("10.0.0.2", "foo-2")],
            vec![("http", 8080)],
        ));
    }

    let snapshot = test.index.read().snapshot();
    let (built, warnings) = topology::build(&snapshot);
    assert!(warnings.is_empty());

    let (_, service) = built
        .service_by_key(&ResourceKey::new("app", "foo"))
        .expect("service must be in the topology");
    assert_eq!(service.ports.len(), 1);
    assert_eq!(service.ports[0].target_port, 8080);

    let members: Vec<(&str, bool)> = service
        .pods
        .iter()
        .map(|id| (built.pod(*id).key.name.as_str(), built.pod(*id).ready))
        .collect();
    assert_eq!(members, vec![("foo-1", true), ("foo-2", false)]);
}

#[test]
fn traffic_targets_resolve_per_service() {
    let test = TestIndex::new();
    {
        let mut index = test.index.write();
        index.apply(mk_service("app", "b", vec![mk_port("http", 80, 8080)]));
        index.apply(mk_pod("app", "b-1", "10.0.0.1", "server", true));
        index.apply(mk_pod("client", "c-1", "10.0.1.1", "frontend", true));
        index.apply(mk_endpoints(
            "app",
            "b",
            vec![("10.0.0.1", "b-1")],
            vec![],
            vec![("http", 8080)],
        ));
        index.apply(mk_route_group(
            "app",
            "routes",
            vec![k8s::specs::HTTPMatch {
                name: "metrics".to_string(),
                path_regex: Some("/metrics".to_string()),
                methods: Some(vec!["GET".to_string()]),
                headers: None,
            }],
        ));
        index.apply(mk_traffic_target(
            "app",
            "allow-frontend",
            "server",
            vec![("client", "frontend")],
            vec![k8s::access::TrafficTargetRule {
                kind: "HTTPRouteGroup".to_string(),
                name: "routes".to_string(),
                matches: Some(vec!["metrics".to_string()]),
            }],
        ));
    }

    let snapshot = test.index.read().snapshot();
    let (built, warnings) = topology::build(&snapshot);
    assert!(warnings.is_empty());
    assert_eq!(built.traffic_targets.len(), 1);

    let target = &built.traffic_targets[0];
    assert_eq!(target.key, ResourceKey::new("app", "allow-frontend"));
    assert_eq!(built.service(target.service).key, ResourceKey::new("app", "b"));
    assert_eq!(
        target
            .sources
            .iter()
            .map(|id| built.pod(*id).key.name.as_str())
            .collect::<Vec<_>>(),
        vec!["c-1"]
    );
    assert_eq!(
        target
            .destination
            .pods
            .iter()
            .map(|id| built.pod(*id).key.name.as_str())
            .collect::<Vec<_>>(),
        vec!["b-1"]
    );
    match &target.rules {
        TrafficSpec::Http(matches) => {
            assert_eq!(matches.len(), 1);
            assert_eq!(matches[0].path_regex.as_deref(), Some("/metrics"));
        }
        other => panic!("expected HTTP rules, got {:?}", other),
    }

    // Edges are mirrored onto the pods.
    let source: Vec<PodId> = target.sources.clone();
    assert_eq!(built.pod(source[0]).outgoing.len(), 1);
    assert_eq!(built.pod(target.destination.pods[0]).incoming.len(), 1);
}

#[test]
fn unresolvable_rules_drop_the_target() {
    let test = TestIndex::new();
    {
        let mut index = test.index.write();
        index.apply(mk_service("app", "b", vec![mk_port("http", 80, 8080)]));
        index.apply(mk_pod("app", "b-1", "10.0.0.1", "server", true));
        index.apply(mk_pod("client", "c-1", "10.0.1.1", "frontend", true));
        index.apply(mk_endpoints(
            "app",
            "b",
            vec![("10.0.0.1", "b-1")],
            vec![],
            vec![("http", 8080)],
        ));
        index.apply(mk_traffic_target(
            "app",
            "allow-frontend",
            "server",
            vec![("client", "frontend")],
            vec![k8s::access::TrafficTargetRule {
                kind: "HTTPRouteGroup".to_string(),
                name: "missing".to_string(),
                matches: None,
            }],
        ));
    }

    let snapshot = test.index.read().snapshot();
    let (built, warnings) = topology::build(&snapshot);
    assert!(built.traffic_targets.is_empty());
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].reason, "UnknownRouteGroup");
}

#[test]
fn targets_without_rules_admit_everything() {
    let test = TestIndex::new();
    {
        let mut index = test.index.write();
        index.apply(mk_service("app", "b", vec![mk_port("http", 80, 8080)]));
        index.apply(mk_pod("app", "b-1", "10.0.0.1", "server", true));
        index.apply(mk_pod("client", "c-1", "10.0.1.1", "frontend", true));
        index.apply(mk_endpoints(
            "app",
            "b",
            vec![("10.0.0.1", "b-1")],
            vec![],
            vec![("http", 8080)],
        ));
        index.apply(mk_traffic_target(
            "app",
            "allow-frontend",
            "server",
            vec![("client", "frontend")],
            vec![],
        ));
    }

    let (built, warnings) = topology::build(&test.index.read().snapshot());
    assert!(warnings.is_empty());
    assert_eq!(built.traffic_targets.len(), 1);
    assert_eq!(built.traffic_targets[0].rules, TrafficSpec::Http(vec![]));
}

#[test]
fn split_backends_are_filtered() {
    let test = TestIndex::new();
    {
        let mut index = test.index.write();
        index.apply(mk_service("app", "b", vec![mk_port("http", 80, 8080)]));
        index.apply(mk_service("app", "b1", vec![mk_port("http", 80, 8080)]));
        index.apply(mk_split(
            "app",
            "b-split",
            "b",
            vec![("b1", 50), ("missing", 50)],
        ));
        // A split whose root does not exist is dropped outright.
        index.apply(mk_split("app", "orphan", "nope", vec![("b1", 1)]));
        // Zero total weight is skipped.
        index.apply(mk_split("app", "zero", "b", vec![("b1", 0)]));
    }

    let (built, warnings) = topology::build(&test.index.read().snapshot());
    assert_eq!(built.traffic_splits.len(), 1);
    let split = &built.traffic_splits[0];
    assert_eq!(split.key, ResourceKey::new("app", "b-split"));
    assert_eq!(split.backends.len(), 1);
    assert_eq!(built.service(split.backends[0].service).key.name, "b1");

    let reasons: Vec<&str> = warnings.iter().map(|w| w.reason).collect();
    assert_eq!(reasons, vec!["UnknownService", "UnknownService"]);

    let (_, root) = built.service_by_key(&ResourceKey::new("app", "b")).unwrap();
    assert_eq!(root.traffic_splits.len(), 1);
}

#[test]
fn builds_are_deterministic() {
    let test = TestIndex::new();
    {
        let mut index = test.index.write();
        for i in 0..5 {
            let name = format!("svc-{}", i);
            index.apply(mk_service("app", &name, vec![mk_port("http", 80, 8080)]));
            let pod = format!("pod-{}", i);
            let ip = format!("10.0.0.{}", i + 1);
            index.apply(mk_pod("app", &pod, &ip, "workload", i % 2 == 0));
            index.apply(mk_endpoints(
                "app",
                &name,
                vec![(ip.as_str(), pod.as_str())],
                vec![],
                vec![("http", 8080)],
            ));
        }
        index.apply(mk_traffic_target(
            "app",
            "allow",
            "workload",
            vec![("app", "workload")],
            vec![],
        ));
        index.apply(mk_split("app", "split", "svc-0", vec![("svc-1", 50), ("svc-2", 50)]));
    }

    let snapshot = test.index.read().snapshot();
    let (first, _) = topology::build(&snapshot);
    let (second, _) = topology::build(&snapshot);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[test]
fn unchanged_updates_do_not_signal() {
    let mut test = TestIndex::new();
    let service = mk_service("app", "foo", vec![mk_port("http", 80, 8080)]);
    test.index.write().apply(service.clone());
    assert_eq!(test.signals(), 1);

    test.index.write().apply(service);
    assert_eq!(test.signals(), 0);

    test.index
        .write()
        .apply(mk_service("app", "foo", vec![mk_port("http", 81, 8080)]));
    assert_eq!(test.signals(), 1);
}
