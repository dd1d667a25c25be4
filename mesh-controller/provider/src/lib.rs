//! Compiles a topology into the dynamic configuration served to mesh nodes.
//!
//! The compiler is a pure function of the topology and the port book: no
//! I/O, no clocks, deterministic output. It runs once per reconcile.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod rules;


use mesh_controller_core::{
    annotations,
    config::{
        AddressServer, CircuitBreaker, DynamicConfiguration, HttpService, Middleware, RateLimit,
        Retry, Router, Server, ServersLoadBalancer, TcpRouter, TcpServersLoadBalancer, TcpService,
        UdpRouter, UdpService, WeightedRoundRobin, WeightedServiceItem, READINESS_ENTRY_POINT,
    },
    ports::{PortClass, PortTable, SourcePort},
    topology::{ServiceNode, ServicePort, Topology},
    ResourceKey,
};
use self::rules::RuleClass;

const BLOCK_ALL_MIDDLEWARE: &str = "block-all";
const READINESS_ROUTER: &str = "readiness";
const TCP_ANY_RULE: &str = "HostSNI(`*`)";
const INDIRECT_CLAUSE: &str = "HeadersRegexp(`X-Forwarded-For`, `.+`)";

/// Builds dynamic configurations for the mesh nodes.
#[derive(Clone, Debug)]
pub struct Provider {
    mesh_suffix: String,
    default_mode: PortClass,
    acl_enabled: bool,
}

// === impl Provider ===

impl Provider {
    pub fn new(mesh_suffix: impl ToString, default_mode: PortClass, acl_enabled: bool) -> Self {
        Self {
            mesh_suffix: mesh_suffix.to_string(),
            default_mode,
            acl_enabled,
        }
    }

    pub fn build(&self, topology: &Topology, ports: &PortTable) -> DynamicConfiguration {
        let mut config = DynamicConfiguration::default();

        // Node health checks ride a reserved entry point; the router exists
        // even when no user service does.
        config
            .http
            .routers
            .insert(READINESS_ROUTER.to_string(), readiness_router());

        for service in &topology.services {
            let protocols: Vec<_> = service.ports.iter().map(|p| (p.protocol, p.port)).collect();
            let classes = match annotations::port_classes(
                &protocols,
                &service.annotations,
                self.default_mode,
            ) {
                Ok(classes) => classes,
                Err(error) => {
                    // Already reported during shadow reconciliation; the
                    // service simply gets no routes.
                    tracing::debug!(service = %service.key, %error, "skipping service");
                    continue;
                }
            };

            for (port, class) in service.ports.iter().zip(classes) {
                let source = SourcePort::new(service.key.clone(), port.port);
                let mesh_port = match ports.lookup(&source) {
                    Some((_, mesh_port)) => mesh_port,
                    None => {
                        tracing::debug!(source = %source, "no mesh port assigned");
                        continue;
                    }
                };
                match class {
                    PortClass::Http => {
                        self.build_http(&mut config, topology, service, port, mesh_port)
                    }
                    PortClass::Tcp => {
                        self.build_tcp(&mut config, topology, service, port, mesh_port)
                    }
                    PortClass::Udp => {
                        self.build_udp(&mut config, topology, service, port, mesh_port)
                    }
                }
            }
        }

        config
    }

    fn build_http(
        &self,
        config: &mut DynamicConfiguration,
        topology: &Topology,
        service: &ServiceNode,
        port: &ServicePort,
        mesh_port: u16,
    ) {
        let key = service_key(&service.key, port.port);
        let entry_points = vec![PortClass::Http.entry_point(mesh_port)];
        let base_rule = self.base_rule(service);
        let annotation_middlewares = annotation_middlewares(config, service);

        let scheme = service.annotations.scheme;
        config.http.services.insert(
            key.clone(),
            HttpService::LoadBalancer(ServersLoadBalancer {
                pass_host_header: Some(true),
                servers: ready_pod_ips(topology, service)
                    .map(|ip| Server {
                        url: format!("{}://{}:{}", scheme, ip, port.target_port),
                    })
                    .collect(),
            }),
        );

        // Splits become weighted services over the backends' load balancers.
        // When a split exists, routers send traffic through it rather than
        // straight to the root service's pods.
        for id in &service.traffic_splits {
            let split = topology.traffic_split(*id);
            config.http.services.insert(
                split_key(&key, &split.key),
                HttpService::Weighted(WeightedRoundRobin {
                    services: split
                        .backends
                        .iter()
                        .map(|b| WeightedServiceItem {
                            name: service_key(&topology.service(b.service).key, port.port),
                            weight: b.weight,
                        })
                        .collect(),
                }),
            );
        }
        let target_service = match service.traffic_splits.first() {
            Some(id) => split_key(&key, &topology.traffic_split(*id).key),
            None => key.clone(),
        };

        if !self.acl_enabled {
            config.http.routers.insert(
                key.clone(),
                Router {
                    entry_points,
                    middlewares: annotation_middlewares,
                    rule: base_rule.clone(),
                    priority: rules::priority(RuleClass::ServiceBase, &base_rule),
                    service: target_service,
                },
            );
            return;
        }

        // ACL: services without a traffic target deny everything.
        if service.traffic_targets.is_empty() {
            config
                .http
                .middlewares
                .entry(BLOCK_ALL_MIDDLEWARE.to_string())
                .or_insert_with(Middleware::block_all);
            config.http.routers.insert(
                key.clone(),
                Router {
                    entry_points,
                    middlewares: vec![BLOCK_ALL_MIDDLEWARE.to_string()],
                    rule: base_rule.clone(),
                    priority: rules::priority(RuleClass::ServiceBase, &base_rule),
                    service: key,
                },
            );
            return;
        }

        for id in &service.traffic_targets {
            let target = topology.traffic_target(*id);
            let target_key = format!("{}-{}-{}", key, target.key.namespace, target.key.name);
            let clause = rules::traffic_target_rule(&target.rules);

            let direct_rule = match &clause {
                Some(clause) => format!("({}) && ({})", base_rule, clause),
                None => base_rule.clone(),
            };
            let indirect_rule = match &clause {
                Some(clause) => format!(
                    "({}) && ({}) && {}",
                    base_rule, clause, INDIRECT_CLAUSE
                ),
                None => format!("({}) && {}", base_rule, INDIRECT_CLAUSE),
            };

            // The direct router admits only the target's source pods.
            let mut source_ips: Vec<String> = target
                .sources
                .iter()
                .filter_map(|id| topology.pod(*id).ip.clone())
                .collect();
            source_ips.sort();
            source_ips.dedup();
            let whitelist_key = format!("{}-whitelist", target_key);
            config
                .http
                .middlewares
                .insert(whitelist_key.clone(), Middleware::whitelist(source_ips));

            let mut direct_middlewares = vec![whitelist_key];
            direct_middlewares.extend(annotation_middlewares.iter().cloned());
            config.http.routers.insert(
                target_key.clone(),
                Router {
                    entry_points: entry_points.clone(),
                    middlewares: direct_middlewares,
                    priority: rules::priority(RuleClass::TrafficTargetDirect, &direct_rule),
                    rule: direct_rule,
                    service: target_service.clone(),
                },
            );

            // The indirect router admits traffic forwarded by another mesh
            // node, e.g. after a split hop.
            config.http.routers.insert(
                format!("{}-indirect", target_key),
                Router {
                    entry_points: entry_points.clone(),
                    middlewares: annotation_middlewares.clone(),
                    priority: rules::priority(RuleClass::TrafficTargetIndirect, &indirect_rule),
                    rule: indirect_rule,
                    service: target_service.clone(),
                },
            );
        }

        for id in &service.traffic_splits {
            let split = topology.traffic_split(*id);
            let split_service = split_key(&key, &split.key);
            let rule = format!("({}) && {}", base_rule, INDIRECT_CLAUSE);
            config.http.routers.insert(
                format!("{}-indirect", split_service),
                Router {
                    entry_points: entry_points.clone(),
                    middlewares: annotation_middlewares.clone(),
                    priority: rules::priority(RuleClass::TrafficSplitIndirect, &rule),
                    rule,
                    service: split_service,
                },
            );
        }
    }

    fn build_tcp(
        &self,
        config: &mut DynamicConfiguration,
        topology: &Topology,
        service: &ServiceNode,
        port: &ServicePort,
        mesh_port: u16,
    ) {
        // ACL enforcement for raw TCP is deny-by-absence: without a traffic
        // target the port gets no router at all.
        if self.acl_enabled && service.traffic_targets.is_empty() {
            return;
        }

        let key = service_key(&service.key, port.port);
        config.tcp.routers.insert(
            key.clone(),
            TcpRouter {
                entry_points: vec![PortClass::Tcp.entry_point(mesh_port)],
                rule: TCP_ANY_RULE.to_string(),
                service: key.clone(),
            },
        );
        config.tcp.services.insert(
            key,
            TcpService::LoadBalancer(TcpServersLoadBalancer {
                servers: ready_pod_ips(topology, service)
                    .map(|ip| AddressServer {
                        address: format!("{}:{}", ip, port.target_port),
                    })
                    .collect(),
            }),
        );
    }

    fn build_udp(
        &self,
        config: &mut DynamicConfiguration,
        topology: &Topology,
        service: &ServiceNode,
        port: &ServicePort,
        mesh_port: u16,
    ) {
        let key = service_key(&service.key, port.port);
        config.udp.routers.insert(
            key.clone(),
            UdpRouter {
                entry_points: vec![PortClass::Udp.entry_point(mesh_port)],
                service: key.clone(),
            },
        );
        config.udp.services.insert(
            key,
            UdpService::LoadBalancer(TcpServersLoadBalancer {
                servers: ready_pod_ips(topology, service)
                    .map(|ip| AddressServer {
                        address: format!("{}:{}", ip, port.target_port),
                    })
                    .collect(),
            }),
        );
    }

    /// The host rule every router of a service starts from: the mesh
    /// pseudo-domain name and, when present, the service's cluster IP.
    fn base_rule(&self, service: &ServiceNode) -> String {
        let host = format!(
            "{}.{}.{}",
            service.key.name, service.key.namespace, self.mesh_suffix
        );
        match &service.cluster_ip {
            Some(ip) => format!("Host(`{}`) || Host(`{}`)", host, ip),
            None => format!("Host(`{}`)", host),
        }
    }
}

fn service_key(service: &ResourceKey, port: u16) -> String {
    format!("{}-{}-{}", service.namespace, service.name, port)
}

fn split_key(service_key: &str, split: &ResourceKey) -> String {
    format!("{}-{}-split", service_key, split.name)
}

fn readiness_router() -> Router {
    let rule = "Path(`/ping`)".to_string();
    Router {
        entry_points: vec![READINESS_ENTRY_POINT.to_string()],
        middlewares: Vec::new(),
        priority: rules::priority(RuleClass::ServiceBase, &rule),
        rule,
        service: "ping@internal".to_string(),
    }
}

fn ready_pod_ips<'t>(
    topology: &'t Topology,
    service: &'t ServiceNode,
) -> impl Iterator<Item = &'t str> {
    service.pods.iter().filter_map(move |id| {
        let pod = topology.pod(*id);
        if pod.ready {
            pod.ip.as_deref()
        } else {
            None
        }
    })
}

fn annotation_middlewares(
    config: &mut DynamicConfiguration,
    service: &ServiceNode,
) -> Vec<String> {
    let prefix = format!("{}-{}", service.key.namespace, service.key.name);
    let mut names = Vec::new();

    if let Some(attempts) = service.annotations.retry_attempts {
        let name = format!("{}-retry", prefix);
        config
            .http
            .middlewares
            .insert(name.clone(), Middleware::Retry(Retry { attempts }));
        names.push(name);
    }
    if let Some(limit) = service.annotations.rate_limit {
        let name = format!("{}-rate-limit", prefix);
        config.http.middlewares.insert(
            name.clone(),
            Middleware::RateLimit(RateLimit {
                average: limit.average,
                burst: limit.burst,
            }),
        );
        names.push(name);
    }
    if let Some(expression) = &service.annotations.circuit_breaker_expression {
        let name = format!("{}-circuit-breaker", prefix);
        config.http.middlewares.insert(
            name.clone(),
            Middleware::CircuitBreaker(CircuitBreaker {
                expression: expression.clone(),
            }),
        );
        names.push(name);
    }

    names
}
