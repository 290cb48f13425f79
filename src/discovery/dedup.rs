//! Node and guest deduplication
//!
//! Redundant endpoints and retried requests return slightly divergent views
//! of the same physical object. Merge rules are deterministic and bias
//! toward the operationally relevant state: online beats offline, running
//! beats stopped, fresher and more complete data beats stale and partial.

use std::collections::HashMap;

use crate::cache::TtlCache;
use crate::proxmox::{Guest, Node};

/// Cache key for the last-known-good node cache
fn node_key(node: &Node) -> String {
    format!("{}:{}", node.cluster_identifier, node.name)
}

/// Collapse nodes observed via multiple routes to one per
/// (cluster identifier, node name).
pub fn merge_nodes(all_nodes: Vec<Node>) -> Vec<Node> {
    let mut merged: HashMap<String, Node> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for incoming in all_nodes {
        let key = node_key(&incoming);
        match merged.get_mut(&key) {
            None => {
                order.push(key.clone());
                merged.insert(key, incoming);
            }
            Some(kept) => {
                let kept_online = kept.status == "online";
                let incoming_online = incoming.status == "online";
                if incoming_online && !kept_online {
                    *kept = incoming;
                } else if kept_online && incoming.status == "offline" {
                    // Probably a transient glitch (endpoint failover mid-cycle);
                    // keep the known-good metrics but mark the suspicion
                    kept.possible_transition = true;
                } else if (incoming.status == kept.status && incoming.uptime > kept.uptime)
                    || (incoming.cpu.is_some() && kept.cpu.is_none())
                {
                    *kept = incoming;
                }
            }
        }
    }

    order.into_iter().filter_map(|key| merged.remove(&key)).collect()
}

/// Record online nodes into the last-known-good cache, and backfill from it
/// when an entire cycle saw no online node (transient full outage).
pub fn backfill_nodes(merged: &mut Vec<Node>, cache: &TtlCache<String, Node>) {
    for node in merged.iter() {
        if node.status == "online" {
            cache.insert(node_key(node), node.clone());
        }
    }

    if merged.iter().any(|n| n.status == "online") {
        return;
    }

    for (key, cached) in cache.live_entries() {
        if merged.iter().any(|n| node_key(n) == key) {
            continue;
        }
        let mut node = cached;
        node.status = "offline".to_string();
        node.from_cache = true;
        merged.push(node);
    }
}

/// Collapse guests to one per (node, vmid). A "running" observation always
/// wins; otherwise the first-seen entry is kept.
pub fn merge_guests(all_guests: Vec<Guest>) -> Vec<Guest> {
    let mut merged: HashMap<(String, u64), Guest> = HashMap::new();
    let mut order: Vec<(String, u64)> = Vec::new();

    for incoming in all_guests {
        let key = (incoming.node.clone(), incoming.vmid);
        match merged.get_mut(&key) {
            None => {
                order.push(key.clone());
                merged.insert(key, incoming);
            }
            Some(kept) => {
                if incoming.status == "running" && kept.status != "running" {
                    *kept = incoming;
                }
            }
        }
    }

    order.into_iter().filter_map(|key| merged.remove(&key)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node(name: &str, status: &str, uptime: u64, cpu: Option<f32>) -> Node {
        Node {
            name: name.to_string(),
            display_name: name.to_string(),
            cluster_identifier: "prod".to_string(),
            status: status.to_string(),
            cpu,
            maxcpu: 8,
            mem: 1024,
            maxmem: 4096,
            disk: 100,
            maxdisk: 1000,
            uptime,
            loadavg: Vec::new(),
            storage: Vec::new(),
            source_ip: None,
            possible_transition: false,
            from_cache: false,
        }
    }

    fn guest(node: &str, vmid: u64, status: &str) -> Guest {
        Guest {
            id: format!("ep-{}-{}", node, vmid),
            vmid,
            name: format!("guest{}", vmid),
            node: node.to_string(),
            endpoint_id: "ep".to_string(),
            guest_type: "qemu".to_string(),
            status: status.to_string(),
            cpus: 2,
            cpu: 0.1,
            maxmem: 2048,
            mem: 512,
            maxdisk: 100,
            disk: 10,
            uptime: 100,
        }
    }

    #[test]
    fn test_online_replaces_offline() {
        let merged = merge_nodes(vec![
            node("n1", "offline", 0, None),
            node("n1", "online", 500, Some(0.2)),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, "online");
        assert_eq!(merged[0].uptime, 500);
    }

    #[test]
    fn test_same_status_higher_uptime_wins() {
        let merged = merge_nodes(vec![
            node("n1", "online", 100, Some(0.1)),
            node("n1", "online", 900, Some(0.3)),
        ]);
        assert_eq!(merged[0].uptime, 900);
    }

    #[test]
    fn test_non_null_cpu_beats_null() {
        let merged = merge_nodes(vec![
            node("n1", "online", 900, None),
            node("n1", "online", 100, Some(0.5)),
        ]);
        assert_eq!(merged[0].cpu, Some(0.5));
    }

    #[test]
    fn test_offline_report_flags_transition() {
        // online data survives, but the flip is flagged
        let merged = merge_nodes(vec![
            node("n1", "online", 900, Some(0.1)),
            node("n1", "offline", 0, None),
        ]);
        assert_eq!(merged[0].status, "online");
        assert!(merged[0].possible_transition);
    }

    #[test]
    fn test_nodes_in_different_clusters_not_merged() {
        let mut a = node("n1", "online", 100, Some(0.1));
        let mut b = node("n1", "online", 200, Some(0.2));
        a.cluster_identifier = "prod".to_string();
        b.cluster_identifier = "lab".to_string();
        assert_eq!(merge_nodes(vec![a, b]).len(), 2);
    }

    #[test]
    fn test_running_guest_wins() {
        let merged = merge_guests(vec![
            guest("n1", 100, "stopped"),
            guest("n1", 100, "running"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, "running");

        // and in the other arrival order
        let merged = merge_guests(vec![
            guest("n1", 100, "running"),
            guest("n1", 100, "stopped"),
        ]);
        assert_eq!(merged[0].status, "running");
    }

    #[test]
    fn test_first_seen_wins_without_running() {
        let mut first = guest("n1", 100, "stopped");
        first.name = "first".to_string();
        let mut second = guest("n1", 100, "stopped");
        second.name = "second".to_string();
        let merged = merge_guests(vec![first, second]);
        assert_eq!(merged[0].name, "first");
    }

    #[test]
    fn test_merge_guests_idempotent() {
        let input = vec![
            guest("n1", 100, "stopped"),
            guest("n1", 100, "running"),
            guest("n2", 100, "stopped"),
            guest("n1", 101, "running"),
        ];
        let once = merge_guests(input);
        let twice = merge_guests(once.clone());
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.status, b.status);
        }
    }

    #[test]
    fn test_backfill_only_when_everything_offline() {
        let cache: TtlCache<String, Node> = TtlCache::new(Duration::from_secs(60));
        cache.insert("prod:n1".to_string(), node("n1", "online", 500, Some(0.2)));

        // one node still online: no backfill
        let mut merged = vec![node("n2", "online", 100, Some(0.1))];
        backfill_nodes(&mut merged, &cache);
        assert_eq!(merged.len(), 1);

        // full outage: n1 comes back from the cache, flagged
        let mut merged = vec![node("n2", "offline", 0, None)];
        backfill_nodes(&mut merged, &cache);
        assert_eq!(merged.len(), 2);
        let cached = merged.iter().find(|n| n.name == "n1").unwrap();
        assert_eq!(cached.status, "offline");
        assert!(cached.from_cache);
    }

    #[test]
    fn test_backfill_skips_nodes_already_present() {
        let cache: TtlCache<String, Node> = TtlCache::new(Duration::from_secs(60));
        cache.insert("prod:n1".to_string(), node("n1", "online", 500, Some(0.2)));

        let mut merged = vec![node("n1", "offline", 0, None)];
        backfill_nodes(&mut merged, &cache);
        assert_eq!(merged.len(), 1);
        assert!(!merged[0].from_cache);
    }
}
