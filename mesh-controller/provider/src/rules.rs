//! Routing-rule construction and prioritization.

use mesh_controller_core::topology::{HttpMatch, TrafficSpec};

/// Orders router rules: the most specific class wins, then the rule with
/// more operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RuleClass {
    ServiceBase,
    TrafficTargetDirect,
    TrafficTargetIndirect,
    TrafficSplitIndirect,
}

pub(crate) fn priority(class: RuleClass, rule: &str) -> i64 {
    let class = match class {
        RuleClass::ServiceBase => 1,
        RuleClass::TrafficTargetDirect => 2,
        RuleClass::TrafficTargetIndirect => 3,
        RuleClass::TrafficSplitIndirect => 4,
    };
    let operators = rule.matches("&&").count() + rule.matches("||").count();
    1000 * class + operators as i64
}

/// Renders a traffic target's rules as a router-rule clause.
///
/// Matches OR together; a match with no filters matches everything, so a
/// target without any effective filter yields no clause at all.
pub(crate) fn traffic_target_rule(spec: &TrafficSpec) -> Option<String> {
    let matches = match spec {
        TrafficSpec::Http(matches) => matches,
        TrafficSpec::Tcp => return None,
    };
    let clauses: Vec<String> = matches.iter().filter_map(http_match_rule).collect();
    match clauses.len() {
        0 => None,
        1 => Some(clauses.into_iter().next().unwrap()),
        _ => Some(
            clauses
                .into_iter()
                .map(|c| format!("({})", c))
                .collect::<Vec<_>>()
                .join(" || "),
        ),
    }
}

/// Renders one HTTP match; present fields AND together.
fn http_match_rule(m: &HttpMatch) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(regex) = m.path_regex.as_deref().filter(|r| !r.is_empty()) {
        parts.push(format!("PathPrefix(`{}`)", regex));
    }
    if let Some(methods) = m.methods.as_ref().filter(|m| !m.is_empty()) {
        parts.push(format!("Method(`{}`)", methods.join("`,`")));
    }
    if let Some(headers) = m.headers.as_ref().filter(|h| !h.is_empty()) {
        for (name, value) in headers {
            parts.push(format!("Headers(`{}`, `{}`)", name, value));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" && "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn match_fields_and_together() {
        let m = HttpMatch {
            name: "metrics".to_string(),
            path_regex: Some("/metrics".to_string()),
            methods: Some(vec!["GET".to_string(), "POST".to_string()]),
            headers: Some(btreemap! { "x-kind".to_string() => "probe".to_string() }),
        };
        assert_eq!(
            http_match_rule(&m).unwrap(),
            "PathPrefix(`/metrics`) && Method(`GET`,`POST`) && Headers(`x-kind`, `probe`)"
        );
    }

    #[test]
    fn matches_or_together() {
        let spec = TrafficSpec::Http(vec![
            HttpMatch {
                name: "a".to_string(),
                path_regex: Some("/a".to_string()),
                ..Default::default()
            },
            HttpMatch {
                name: "b".to_string(),
                methods: Some(vec!["GET".to_string()]),
                ..Default::default()
            },
        ]);
        assert_eq!(
            traffic_target_rule(&spec).unwrap(),
            "(PathPrefix(`/a`)) || (Method(`GET`))"
        );
    }

    #[test]
    fn empty_matches_yield_no_clause() {
        assert_eq!(traffic_target_rule(&TrafficSpec::Http(vec![])), None);
        assert_eq!(
            traffic_target_rule(&TrafficSpec::Http(vec![HttpMatch {
                name: "all".to_string(),
                ..Default::default()
            }])),
            None
        );
        assert_eq!(traffic_target_rule(&TrafficSpec::Tcp), None);
    }

    #[test]
    fn priorities_order_by_class_then_operators() {
        let base = priority(RuleClass::ServiceBase, "Host(`a`) || Host(`b`)");
        assert_eq!(base, 1001);

        let direct = priority(
            RuleClass::TrafficTargetDirect,
            "(Host(`a`) || Host(`b`)) && (PathPrefix(`/x`))",
        );
        assert_eq!(direct, 2002);
        assert!(direct > base);

        let indirect = priority(RuleClass::TrafficTargetIndirect, "a && b && c");
        let split = priority(RuleClass::TrafficSplitIndirect, "a && b");
        assert!(split > indirect);
    }
}
