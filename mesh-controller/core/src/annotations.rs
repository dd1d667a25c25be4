//! Per-service mesh annotations.

use crate::ports::{InvalidPortClass, PortClass};
use crate::topology::Protocol;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

pub const TRAFFIC_TYPE: &str = "mesh.io/traffic-type";
pub const SCHEME: &str = "mesh.io/scheme";
pub const RETRY_ATTEMPTS: &str = "mesh.io/retry-attempts";
pub const RATE_LIMIT_AVERAGE: &str = "mesh.io/rate-limit-average";
pub const RATE_LIMIT_BURST: &str = "mesh.io/rate-limit-burst";
pub const CIRCUIT_BREAKER_EXPRESSION: &str = "mesh.io/circuit-breaker-expression";

/// The URL scheme used for load-balancer servers of an HTTP service.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    H2c,
}

/// Parsed mesh annotations of a user service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServiceAnnotations {
    pub traffic_type: Option<PortClass>,
    pub scheme: Scheme,
    pub retry_attempts: Option<u32>,
    pub rate_limit: Option<RateLimit>,
    pub circuit_breaker_expression: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    pub average: u64,
    pub burst: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid {TRAFFIC_TYPE} annotation: {0}")]
    InvalidTrafficType(#[from] InvalidPortClass),

    #[error("invalid {SCHEME} annotation: expected http or h2c, got {0:?}")]
    InvalidScheme(String),

    #[error("invalid {key} annotation: {value:?} is not a number")]
    InvalidNumber { key: &'static str, value: String },
}

// === impl Scheme ===

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => "http".fmt(f),
            Self::H2c => "h2c".fmt(f),
        }
    }
}

// === impl ServiceAnnotations ===

impl ServiceAnnotations {
    /// Reads the mesh annotations off a service's metadata.
    ///
    /// Parsing is per-field: an invalid value is reported and the field
    /// falls back to its default, so one bad annotation does not take the
    /// whole service out of the mesh.
    pub fn parse(annotations: &BTreeMap<String, String>) -> (Self, Vec<Error>) {
        let mut parsed = Self::default();
        let mut errors = Vec::new();

        if let Some(v) = annotations.get(TRAFFIC_TYPE) {
            match v.parse() {
                Ok(class) => parsed.traffic_type = Some(class),
                Err(e) => errors.push(Error::InvalidTrafficType(e)),
            }
        }

        if let Some(v) = annotations.get(SCHEME) {
            match v.as_str() {
                "http" => parsed.scheme = Scheme::Http,
                "h2c" => parsed.scheme = Scheme::H2c,
                other => errors.push(Error::InvalidScheme(other.to_string())),
            }
        }

        if let Some(attempts) = parse_number::<u32>(annotations, RETRY_ATTEMPTS, &mut errors) {
            if attempts > 0 {
                parsed.retry_attempts = Some(attempts);
            }
        }

        let average = parse_number::<u64>(annotations, RATE_LIMIT_AVERAGE, &mut errors);
        let burst = parse_number::<u64>(annotations, RATE_LIMIT_BURST, &mut errors);
        if let Some(average) = average.filter(|a| *a > 0) {
            // Traefik treats a zero burst as "no burst"; a rate limit with
            // no average is meaningless and is omitted outright.
            let burst = burst.filter(|b| *b > 0).unwrap_or(1);
            parsed.rate_limit = Some(RateLimit { average, burst });
        }

        if let Some(expr) = annotations.get(CIRCUIT_BREAKER_EXPRESSION) {
            if !expr.is_empty() {
                parsed.circuit_breaker_expression = Some(expr.clone());
            }
        }

        (parsed, errors)
    }
}

fn parse_number<T: std::str::FromStr>(
    annotations: &BTreeMap<String, String>,
    key: &'static str,
    errors: &mut Vec<Error>,
) -> Option<T> {
    let value = annotations.get(key)?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            errors.push(Error::InvalidNumber {
                key,
                value: value.clone(),
            });
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClassError {
    #[error("ports mix TCP and UDP protocols while {TRAFFIC_TYPE} is set to {0}")]
    MixedProtocols(PortClass),

    #[error("{TRAFFIC_TYPE} is udp but port {0} is TCP")]
    UdpAnnotationOnTcpPort(u16),
}

/// Chooses the port-book class for each of a service's ports.
///
/// UDP ports always draw from the UDP pool. TCP ports draw from the HTTP or
/// TCP pool according to the `traffic-type` annotation, falling back to the
/// controller default. A service whose ports span both protocol families
/// while carrying an explicit annotation is rejected, as is a `udp`
/// annotation on a TCP port: coercing either silently would misroute
/// traffic.
pub fn port_classes(
    ports: &[(Protocol, u16)],
    annotations: &ServiceAnnotations,
    default_mode: PortClass,
) -> Result<Vec<PortClass>, ClassError> {
    let tcp_mode = annotations.traffic_type.unwrap_or(default_mode);

    if let Some(explicit) = annotations.traffic_type {
        let has_tcp = ports.iter().any(|(p, _)| *p == Protocol::Tcp);
        let has_udp = ports.iter().any(|(p, _)| *p == Protocol::Udp);
        if has_tcp && has_udp {
            return Err(ClassError::MixedProtocols(explicit));
        }
        if explicit == PortClass::Udp {
            if let Some((_, port)) = ports.iter().find(|(p, _)| *p == Protocol::Tcp) {
                return Err(ClassError::UdpAnnotationOnTcpPort(*port));
            }
        }
    }

    Ok(ports
        .iter()
        .map(|(protocol, _)| match protocol {
            Protocol::Udp => PortClass::Udp,
            Protocol::Tcp => tcp_mode,
        })
        .collect())
}
