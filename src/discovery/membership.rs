//! Cluster membership detection and endpoint grouping
//!
//! Administrators often register every node of the same physical cluster as
//! its own endpoint; without grouping, nodes and guests would be counted
//! once per registered endpoint. Each endpoint's classification is cached
//! for 5 minutes; probes that fail classify the endpoint as standalone with
//! an error flag and never block the rest of discovery.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::config::PveEndpointConfig;
use crate::proxmox::PveClient;

/// How one endpoint relates to a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub kind: String,              // "standalone" or "cluster"
    pub cluster_id: Option<String>,
    pub node_count: u64,
    pub quorate: bool,
    /// The probe failed; classification defaulted to standalone
    pub error: bool,
}

/// Endpoints collapsed into one fetch target with failover order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointGroup {
    pub kind: String,              // "standalone" or "cluster"
    pub cluster_id: Option<String>,
    pub primary: String,           // endpoint id tried first
    pub backups: Vec<String>,      // remaining endpoints, in order
}

/// Classify every configured endpoint and group those sharing a cluster
pub async fn detect(
    configs: &[PveEndpointConfig],
    cache: &TtlCache<String, ClusterMembership>,
) -> Vec<EndpointGroup> {
    let probes = configs.iter().map(|config| async {
        let membership = match cache.get(&config.id) {
            Some(m) => m,
            None => {
                let m = probe_endpoint(config).await;
                cache.insert(config.id.clone(), m.clone());
                m
            }
        };
        (config.id.clone(), membership)
    });
    let memberships: Vec<(String, ClusterMembership)> = join_all(probes).await;
    group_endpoints(&memberships)
}

/// Probe one endpoint's /cluster/status. Fail-open: any error yields a
/// standalone classification with the error flag set.
async fn probe_endpoint(config: &PveEndpointConfig) -> ClusterMembership {
    let client = PveClient::new(config);
    match client.get_cluster_status().await {
        Ok(entries) => {
            let cluster = entries.iter()
                .find(|e| e.entry_type == "cluster" && e.nodes > 1);
            match cluster {
                Some(c) => {
                    debug!("Endpoint {} is a member of cluster '{}' ({} nodes)",
                        config.id, c.name, c.nodes);
                    ClusterMembership {
                        kind: "cluster".to_string(),
                        cluster_id: Some(c.name.clone()),
                        node_count: c.nodes,
                        quorate: c.quorate,
                        error: false,
                    }
                }
                None => ClusterMembership {
                    kind: "standalone".to_string(),
                    cluster_id: None,
                    node_count: 1,
                    quorate: false,
                    error: false,
                },
            }
        }
        Err(e) => {
            warn!("Cluster probe failed for {}: {}", config.id, e);
            ClusterMembership {
                kind: "standalone".to_string(),
                cluster_id: None,
                node_count: 1,
                quorate: false,
                error: true,
            }
        }
    }
}

/// Group endpoints by cluster id and elect a primary per group.
/// Order within a group: error-free endpoints first, then id ascending —
/// the same inputs always elect the same primary.
pub fn group_endpoints(memberships: &[(String, ClusterMembership)]) -> Vec<EndpointGroup> {
    let mut clusters: HashMap<String, Vec<(String, bool)>> = HashMap::new();
    let mut groups: Vec<EndpointGroup> = Vec::new();

    for (id, membership) in memberships {
        match &membership.cluster_id {
            Some(cluster_id) if membership.kind == "cluster" => {
                clusters.entry(cluster_id.clone()).or_default()
                    .push((id.clone(), membership.error));
            }
            _ => groups.push(EndpointGroup {
                kind: "standalone".to_string(),
                cluster_id: None,
                primary: id.clone(),
                backups: Vec::new(),
            }),
        }
    }

    for (cluster_id, mut members) in clusters {
        members.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        let mut ids = members.into_iter().map(|(id, _)| id);
        let primary = ids.next().unwrap_or_default();
        groups.push(EndpointGroup {
            kind: "cluster".to_string(),
            cluster_id: Some(cluster_id),
            primary,
            backups: ids.collect(),
        });
    }

    groups.sort_by(|a, b| a.primary.cmp(&b.primary));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(cluster: Option<&str>, error: bool) -> ClusterMembership {
        ClusterMembership {
            kind: if cluster.is_some() { "cluster".to_string() } else { "standalone".to_string() },
            cluster_id: cluster.map(|s| s.to_string()),
            node_count: if cluster.is_some() { 3 } else { 1 },
            quorate: cluster.is_some(),
            error,
        }
    }

    #[test]
    fn test_same_cluster_endpoints_form_one_group() {
        let memberships = vec![
            ("pve-a".to_string(), member(Some("prod"), false)),
            ("pve-b".to_string(), member(Some("prod"), false)),
        ];
        let groups = group_endpoints(&memberships);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].primary, "pve-a");
        assert_eq!(groups[0].backups, vec!["pve-b".to_string()]);
    }

    #[test]
    fn test_errored_endpoint_never_elected_primary() {
        let memberships = vec![
            ("pve-a".to_string(), member(Some("prod"), true)),
            ("pve-b".to_string(), member(Some("prod"), false)),
        ];
        let groups = group_endpoints(&memberships);
        assert_eq!(groups[0].primary, "pve-b");
        assert_eq!(groups[0].backups, vec!["pve-a".to_string()]);
    }

    #[test]
    fn test_standalone_endpoints_form_singleton_groups() {
        let memberships = vec![
            ("solo-1".to_string(), member(None, false)),
            ("solo-2".to_string(), member(None, false)),
        ];
        let groups = group_endpoints(&memberships);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.backups.is_empty()));
        assert!(groups.iter().all(|g| g.kind == "standalone"));
    }

    #[test]
    fn test_mixed_clusters_and_standalone() {
        let memberships = vec![
            ("pve-c".to_string(), member(Some("lab"), false)),
            ("pve-a".to_string(), member(Some("prod"), false)),
            ("solo".to_string(), member(None, true)),
            ("pve-b".to_string(), member(Some("prod"), false)),
        ];
        let groups = group_endpoints(&memberships);
        assert_eq!(groups.len(), 3);
        let prod = groups.iter().find(|g| g.cluster_id.as_deref() == Some("prod")).unwrap();
        assert_eq!(prod.primary, "pve-a");
        assert_eq!(prod.backups, vec!["pve-b".to_string()]);
    }

    #[test]
    fn test_grouping_deterministic() {
        let memberships = vec![
            ("b".to_string(), member(Some("prod"), false)),
            ("a".to_string(), member(Some("prod"), false)),
        ];
        let first = group_endpoints(&memberships);
        let reversed: Vec<_> = memberships.into_iter().rev().collect();
        let second = group_endpoints(&reversed);
        assert_eq!(first[0].primary, second[0].primary);
        assert_eq!(first[0].backups, second[0].backups);
    }
}
