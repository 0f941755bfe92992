use super::*;
use crate::build::{build_policy_model, local_policy_targets};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use maplit::btreemap;
use netguard_core::{PolicyKind, Protocol};
use netguard_k8s_api::{
    self as k8s, Container, ContainerPort, IntOrString, LabelSelector, ObjectMeta, PodSpec,
    PodStatus,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

const NODE_IP: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 10);

fn mk_pod(
    ns: impl ToString,
    name: impl ToString,
    pod_ip: &str,
    host_ip: &str,
    labels: BTreeMap<String, String>,
) -> k8s::Pod {
    k8s::Pod {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        status: Some(PodStatus {
            pod_ip: Some(pod_ip.to_string()).filter(|ip| !ip.is_empty()),
            host_ip: Some(host_ip.to_string()),
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

fn with_ports(
    mut pod: k8s::Pod,
    ports: impl IntoIterator<Item = (&'static str, &'static str, i32)>,
) -> k8s::Pod {
    let ports = ports
        .into_iter()
        .map(|(name, protocol, number)| ContainerPort {
            name: Some(name.to_string()),
            protocol: Some(protocol.to_string()),
            container_port: number,
            ..Default::default()
        })
        .collect();
    pod.spec = Some(PodSpec {
        containers: vec![Container {
            name: "main".to_string(),
            ports: Some(ports),
            ..Default::default()
        }],
        ..Default::default()
    });
    pod
}

fn mk_namespace(name: impl ToString, labels: BTreeMap<String, String>) -> k8s::Namespace {
    k8s::Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn mk_policy(
    ns: impl ToString,
    name: impl ToString,
    selector: BTreeMap<String, String>,
    types: &[&str],
) -> k8s::NetworkPolicy {
    k8s::NetworkPolicy {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(selector),
                match_expressions: None,
            },
            policy_types: Some(types.iter().map(|t| t.to_string()).collect()),
            ..Default::default()
        }),
    }
}

fn snapshot(
    pods: Vec<k8s::Pod>,
    namespaces: Vec<k8s::Namespace>,
    policies: Vec<k8s::NetworkPolicy>,
) -> ClusterSnapshot {
    ClusterSnapshot {
        pods,
        namespaces,
        policies,
        legacy_policies: Vec::new(),
    }
}

#[test]
fn schema_mode_from_server_version() {
    assert_eq!(
        SchemaMode::from_server_version("1", "6"),
        SchemaMode::Legacy
    );
    assert_eq!(
        SchemaMode::from_server_version("1", "7"),
        SchemaMode::Current
    );
    assert_eq!(
        SchemaMode::from_server_version("1", "28+"),
        SchemaMode::Current
    );
    assert_eq!(
        SchemaMode::from_server_version("2", "0"),
        SchemaMode::Current
    );
    // An unparseable minor is treated conservatively as pre-GA.
    assert_eq!(SchemaMode::from_server_version("1", ""), SchemaMode::Legacy);
}

#[test]
fn resolves_targets_and_kind() {
    let snap = snapshot(
        vec![
            mk_pod("ns-a", "web-0", "10.0.0.5", "172.16.0.10", btreemap! {
                "app".to_string() => "web".to_string(),
            }),
            // No primary address yet; must not be a target.
            mk_pod("ns-a", "web-1", "", "172.16.0.10", btreemap! {
                "app".to_string() => "web".to_string(),
            }),
            mk_pod("ns-a", "db-0", "10.0.0.7", "172.16.0.10", btreemap! {
                "app".to_string() => "db".to_string(),
            }),
        ],
        vec![],
        vec![mk_policy(
            "ns-a",
            "allow-web",
            btreemap! { "app".to_string() => "web".to_string() },
            &["Ingress", "Egress"],
        )],
    );

    let model = build_policy_model(&snap, SchemaMode::Current).unwrap();
    assert_eq!(model.len(), 1);
    assert_eq!(model[0].kind, PolicyKind::Both);
    assert_eq!(
        model[0].target_pods.keys().copied().collect::<Vec<_>>(),
        vec!["10.0.0.5".parse::<Ipv4Addr>().unwrap()],
    );
}

#[test]
fn policy_types_resolve_to_kinds() {
    for (types, kind) in [
        (&["Ingress"][..], PolicyKind::Ingress),
        (&["Egress"][..], PolicyKind::Egress),
        (&["Ingress", "Egress"][..], PolicyKind::Both),
        (&[][..], PolicyKind::Ingress),
    ] {
        let snap = snapshot(
            vec![],
            vec![],
            vec![mk_policy("ns-a", "p", btreemap! {}, types)],
        );
        let model = build_policy_model(&snap, SchemaMode::Current).unwrap();
        assert_eq!(model[0].kind, kind, "types {types:?}");
    }
}

#[test]
fn empty_peer_and_port_lists_match_all() {
    let mut policy = mk_policy("ns-a", "p", btreemap! {}, &["Ingress"]);
    policy.spec.as_mut().unwrap().ingress =
        Some(vec![k8s::NetworkPolicyIngressRule::default()]);

    let snap = snapshot(vec![], vec![], vec![policy]);
    let model = build_policy_model(&snap, SchemaMode::Current).unwrap();
    let rule = &model[0].ingress[0];
    assert!(rule.match_all_sources);
    assert!(rule.match_all_ports);
    assert!(rule.src_pods.is_empty());
}

#[test]
fn pod_selector_peer_is_scoped_to_policy_namespace() {
    let peer_selector = LabelSelector {
        match_labels: Some(btreemap! { "app".to_string() => "web".to_string() }),
        match_expressions: None,
    };
    let mut policy = mk_policy("ns-a", "p", btreemap! {}, &["Ingress"]);
    policy.spec.as_mut().unwrap().ingress = Some(vec![k8s::NetworkPolicyIngressRule {
        from: Some(vec![k8s::NetworkPolicyPeer {
            pod_selector: Some(peer_selector),
            ..Default::default()
        }]),
        ..Default::default()
    }]);

    let labels = btreemap! { "app".to_string() => "web".to_string() };
    let snap = snapshot(
        vec![
            mk_pod("ns-a", "web-0", "10.0.0.5", "172.16.0.10", labels.clone()),
            mk_pod("ns-b", "web-0", "10.0.1.5", "172.16.0.10", labels),
        ],
        vec![],
        vec![policy],
    );

    let model = build_policy_model(&snap, SchemaMode::Current).unwrap();
    let rule = &model[0].ingress[0];
    assert!(!rule.match_all_sources);
    assert_eq!(rule.src_pods.len(), 1);
    assert_eq!(rule.src_pods[0].namespace, "ns-a");
}

#[test]
fn namespace_selector_peer_spans_matching_namespaces() {
    let mut policy = mk_policy("ns-a", "p", btreemap! {}, &["Ingress"]);
    policy.spec.as_mut().unwrap().ingress = Some(vec![k8s::NetworkPolicyIngressRule {
        from: Some(vec![k8s::NetworkPolicyPeer {
            namespace_selector: Some(LabelSelector {
                match_labels: Some(btreemap! { "team".to_string() => "core".to_string() }),
                match_expressions: None,
            }),
            pod_selector: Some(LabelSelector {
                match_labels: Some(btreemap! { "app".to_string() => "web".to_string() }),
                match_expressions: None,
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }]);

    let web = btreemap! { "app".to_string() => "web".to_string() };
    let snap = snapshot(
        vec![
            mk_pod("ns-b", "web-0", "10.0.1.5", "172.16.0.10", web.clone()),
            mk_pod("ns-b", "db-0", "10.0.1.6", "172.16.0.10", btreemap! {}),
            mk_pod("ns-c", "web-0", "10.0.2.5", "172.16.0.10", web),
        ],
        vec![
            mk_namespace("ns-b", btreemap! { "team".to_string() => "core".to_string() }),
            mk_namespace("ns-c", btreemap! {}),
        ],
        vec![policy],
    );

    let model = build_policy_model(&snap, SchemaMode::Current).unwrap();
    let rule = &model[0].ingress[0];
    assert_eq!(rule.src_pods.len(), 1);
    assert_eq!(rule.src_pods[0].namespace, "ns-b");
    assert_eq!(rule.src_pods[0].ip, "10.0.1.5".parse::<Ipv4Addr>().unwrap());
}

#[test]
fn cidr_peer_expands_with_exclusions() {
    let mut policy = mk_policy("ns-a", "p", btreemap! {}, &["Ingress"]);
    policy.spec.as_mut().unwrap().ingress = Some(vec![k8s::NetworkPolicyIngressRule {
        from: Some(vec![k8s::NetworkPolicyPeer {
            ip_block: Some(k8s::IPBlock {
                cidr: "0.0.0.0/0".to_string(),
                except: Some(vec!["10.0.0.0/8".to_string()]),
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }]);

    let snap = snapshot(vec![], vec![], vec![policy]);
    let model = build_policy_model(&snap, SchemaMode::Current).unwrap();
    let blocks = &model[0].ingress[0].src_blocks;
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].net, "0.0.0.0/1".parse().unwrap());
    assert!(!blocks[0].nomatch);
    assert_eq!(blocks[1].net, "128.0.0.0/1".parse().unwrap());
    assert!(!blocks[1].nomatch);
    assert_eq!(blocks[2].net, "10.0.0.0/8".parse().unwrap());
    assert!(blocks[2].nomatch);
}

#[test]
fn named_port_expands_per_distinct_numeric_port() {
    let selector = btreemap! { "app".to_string() => "web".to_string() };
    let mut policy = mk_policy("ns-a", "p", selector.clone(), &["Ingress"]);
    policy.spec.as_mut().unwrap().ingress = Some(vec![k8s::NetworkPolicyIngressRule {
        ports: Some(vec![k8s::NetworkPolicyPort {
            port: Some(IntOrString::String("http".to_string())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }]);

    let snap = snapshot(
        vec![
            with_ports(
                mk_pod("ns-a", "web-0", "10.0.0.5", "172.16.0.10", selector.clone()),
                [("http", "TCP", 8080)],
            ),
            with_ports(
                mk_pod("ns-a", "web-1", "10.0.0.6", "172.16.0.10", selector),
                [("http", "TCP", 8081)],
            ),
        ],
        vec![],
        vec![policy],
    );

    let model = build_policy_model(&snap, SchemaMode::Current).unwrap();
    let rule = &model[0].ingress[0];
    assert!(rule.ports.is_empty());
    assert_eq!(rule.named_ports.len(), 2);
    assert_eq!(rule.named_ports[0].port.get(), 8080);
    assert_eq!(
        rule.named_ports[0].ips,
        vec!["10.0.0.5".parse::<Ipv4Addr>().unwrap()],
    );
    assert_eq!(rule.named_ports[1].port.get(), 8081);
    assert_eq!(
        rule.named_ports[1].ips,
        vec!["10.0.0.6".parse::<Ipv4Addr>().unwrap()],
    );
    assert_eq!(rule.named_ports[0].protocol, Protocol::Tcp);
}

#[test]
fn egress_named_ports_resolve_from_destinations() {
    let mut policy = mk_policy("ns-a", "p", btreemap! {}, &["Egress"]);
    policy.spec.as_mut().unwrap().egress = Some(vec![k8s::NetworkPolicyEgressRule {
        to: Some(vec![k8s::NetworkPolicyPeer {
            pod_selector: Some(LabelSelector {
                match_labels: Some(btreemap! { "app".to_string() => "db".to_string() }),
                match_expressions: None,
            }),
            ..Default::default()
        }]),
        ports: Some(vec![k8s::NetworkPolicyPort {
            port: Some(IntOrString::String("pg".to_string())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
    }]);

    let snap = snapshot(
        vec![with_ports(
            mk_pod("ns-a", "db-0", "10.0.0.9", "172.16.0.10", btreemap! {
                "app".to_string() => "db".to_string(),
            }),
            [("pg", "TCP", 5432)],
        )],
        vec![],
        vec![policy],
    );

    let model = build_policy_model(&snap, SchemaMode::Current).unwrap();
    let rule = &model[0].egress[0];
    assert_eq!(rule.dst_pods.len(), 1);
    assert_eq!(rule.named_ports.len(), 1);
    assert_eq!(rule.named_ports[0].port.get(), 5432);
}

#[test]
fn legacy_builder_keeps_its_narrow_coverage() {
    let selector_labels = btreemap! { "app".to_string() => "db".to_string() };
    let legacy = k8s::legacy::NetworkPolicy {
        metadata: ObjectMeta {
            namespace: Some("ns-a".to_string()),
            name: Some("p".to_string()),
            ..Default::default()
        },
        spec: k8s::legacy::NetworkPolicySpec {
            pod_selector: k8s::Selector::from_labels(selector_labels.clone()),
            ingress: Some(vec![k8s::legacy::IngressRule {
                ports: Some(vec![k8s::legacy::NetworkPolicyPort {
                    protocol: Some("TCP".to_string()),
                    port: Some(k8s::legacy::PortValue::Number(5432)),
                }]),
                from: Some(vec![k8s::legacy::NetworkPolicyPeer {
                    pod_selector: Some(k8s::Selector::from_labels([("app", "web")])),
                }]),
            }]),
        },
    };

    let snap = ClusterSnapshot {
        pods: vec![
            mk_pod("ns-a", "db-0", "10.0.0.9", "172.16.0.10", selector_labels),
            mk_pod("ns-a", "web-0", "10.0.0.5", "172.16.0.10", btreemap! {
                "app".to_string() => "web".to_string(),
            }),
        ],
        namespaces: vec![],
        policies: vec![],
        legacy_policies: vec![legacy],
    };

    let model = build_policy_model(&snap, SchemaMode::Legacy).unwrap();
    assert_eq!(model.len(), 1);
    assert_eq!(model[0].kind, PolicyKind::Ingress);
    let rule = &model[0].ingress[0];
    // The legacy schema never sets the match-all flags or CIDR entries.
    assert!(!rule.match_all_sources);
    assert!(!rule.match_all_ports);
    assert!(rule.src_blocks.is_empty());
    assert_eq!(rule.src_pods.len(), 1);
    assert_eq!(rule.ports.len(), 1);
}

#[test]
fn local_targets_partition_by_direction() {
    let web = btreemap! { "app".to_string() => "web".to_string() };
    let snap = snapshot(
        vec![
            mk_pod("ns-a", "web-0", "10.0.0.5", &NODE_IP.to_string(), web.clone()),
            // Scheduled elsewhere; never local.
            mk_pod("ns-a", "web-1", "10.0.9.5", "172.16.0.99", web.clone()),
        ],
        vec![],
        vec![
            mk_policy("ns-a", "in", web.clone(), &["Ingress"]),
            mk_policy("ns-a", "out", web, &["Egress"]),
        ],
    );

    let model = build_policy_model(&snap, SchemaMode::Current).unwrap();
    let local = local_policy_targets(&snap, &model, NODE_IP);

    let ip = "10.0.0.5".parse::<Ipv4Addr>().unwrap();
    assert_eq!(local.ingress.keys().copied().collect::<Vec<_>>(), vec![ip]);
    assert_eq!(local.egress.keys().copied().collect::<Vec<_>>(), vec![ip]);
}

#[test]
fn uninteresting_pod_updates_are_dropped() {
    let (notifier, mut nudges) = Notifier::pair();
    notifier.set_ready();
    let index = Index::shared(SchemaMode::Current, notifier);

    let pod = mk_pod("ns-a", "web-0", "10.0.0.5", "172.16.0.10", btreemap! {});
    IndexNamespacedResource::apply(&mut *index.write(), pod.clone());
    assert!(nudges.try_recv().is_ok(), "new pod must nudge");

    // Same phase and address: cached, but no reconcile.
    let mut relabeled = pod.clone();
    relabeled.metadata.labels =
        Some(btreemap! { "extra".to_string() => "label".to_string() });
    IndexNamespacedResource::apply(&mut *index.write(), relabeled);
    assert!(nudges.try_recv().is_err(), "label-only update must not nudge");

    let mut moved = pod;
    moved.status.as_mut().unwrap().pod_ip = Some("10.0.0.6".to_string());
    IndexNamespacedResource::apply(&mut *index.write(), moved);
    assert!(nudges.try_recv().is_ok(), "address change must nudge");
}

#[test]
fn nudges_are_gated_until_ready_and_coalesced() {
    let (notifier, mut nudges) = Notifier::pair();
    let index = Index::shared(SchemaMode::Current, notifier.clone());

    IndexNamespacedResource::apply(
        &mut *index.write(),
        mk_policy("ns-a", "p", btreemap! {}, &["Ingress"]),
    );
    assert!(
        nudges.try_recv().is_err(),
        "events before the initial sync are dropped"
    );

    notifier.set_ready();
    IndexNamespacedResource::apply(
        &mut *index.write(),
        mk_policy("ns-a", "p2", btreemap! {}, &["Ingress"]),
    );
    IndexNamespacedResource::apply(
        &mut *index.write(),
        mk_policy("ns-a", "p3", btreemap! {}, &["Ingress"]),
    );
    assert!(nudges.try_recv().is_ok());
    assert!(
        nudges.try_recv().is_err(),
        "back-to-back events coalesce into one wake-up"
    );
}

#[test]
fn namespace_events_only_matter_to_the_legacy_schema() {
    let (notifier, mut nudges) = Notifier::pair();
    notifier.set_ready();
    let index = Index::shared(SchemaMode::Current, notifier);
    IndexClusterResource::apply(&mut *index.write(), mk_namespace("ns-a", btreemap! {}));
    assert!(nudges.try_recv().is_err());

    let (notifier, mut nudges) = Notifier::pair();
    notifier.set_ready();
    let index = Index::shared(SchemaMode::Legacy, notifier);
    IndexClusterResource::apply(&mut *index.write(), mk_namespace("ns-a", btreemap! {}));
    assert!(nudges.try_recv().is_ok());
}
