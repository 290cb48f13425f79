// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! PVE endpoint discovery — nodes, guests, and storage for one endpoint
//!
//! Topology calls run concurrently and fail independently. Per-node
//! resource fetches fan out under a process-wide limiter so one large
//! cluster cannot starve the others; any single resource failure leaves a
//! gap in that node's data, never a missing node.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::config::PveEndpointConfig;
use crate::proxmox::{Guest, Node, PveClient};

use super::direct;
use super::membership::EndpointGroup;

/// Everything one endpoint yielded in one discovery cycle
#[derive(Debug, Default)]
pub struct EndpointData {
    pub nodes: Vec<Node>,
    pub vms: Vec<Guest>,
    pub containers: Vec<Guest>,
    pub source_endpoint: String,
}

impl EndpointData {
    fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.vms.is_empty() && self.containers.is_empty()
    }
}

/// Fetch a group with sequential failover: primary first, then each backup
/// in order, stopping at the first endpoint that yields any data. Sequential
/// on purpose — racing the backups would hammer a cluster that is already
/// degraded.
pub async fn fetch_group(
    group: &EndpointGroup,
    configs: &[PveEndpointConfig],
    limiter: &Arc<Semaphore>,
    direct_cache: &TtlCache<String, Arc<PveClient>>,
) -> Option<EndpointData> {
    let order = std::iter::once(&group.primary).chain(group.backups.iter());
    for endpoint_id in order {
        let Some(config) = configs.iter().find(|c| &c.id == endpoint_id) else {
            warn!("Endpoint {} in group has no configuration", endpoint_id);
            continue;
        };
        let data = fetch_endpoint(config, limiter, direct_cache).await;
        if !data.is_empty() {
            return Some(data);
        }
        warn!("Endpoint {} returned no data, trying next in group", endpoint_id);
    }
    warn!(
        "No endpoint in group '{}' yielded data this cycle",
        group.cluster_id.as_deref().unwrap_or(&group.primary)
    );
    None
}

/// Discover one endpoint: cluster status and node list concurrently, then
/// per-node resources for every online node.
pub async fn fetch_endpoint(
    config: &PveEndpointConfig,
    limiter: &Arc<Semaphore>,
    direct_cache: &TtlCache<String, Arc<PveClient>>,
) -> EndpointData {
    let client = Arc::new(PveClient::new(config));

    let (status_result, nodes_result) = tokio::join!(
        client.get_cluster_status(),
        client.list_nodes(),
    );

    // Both results are inspected independently: cluster status failing
    // costs us IPs and online flags, not the node list, and vice versa
    let status_entries = match status_result {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cluster status unavailable for {}: {}", config.id, e);
            Vec::new()
        }
    };
    let node_names = match nodes_result {
        Ok(names) => names,
        Err(e) => {
            warn!("Node listing failed for {}: {}", config.id, e);
            return EndpointData { source_endpoint: config.id.clone(), ..Default::default() };
        }
    };

    let mut ip_map: HashMap<String, String> = HashMap::new();
    let mut online_map: HashMap<String, bool> = HashMap::new();
    let mut cluster_name: Option<String> = None;
    for entry in &status_entries {
        match entry.entry_type.as_str() {
            "cluster" if entry.nodes > 1 => cluster_name = Some(entry.name.clone()),
            "node" => {
                if let Some(ip) = &entry.ip {
                    ip_map.insert(entry.name.clone(), ip.clone());
                }
                online_map.insert(entry.name.clone(), entry.online);
            }
            _ => {}
        }
    }

    let endpoint_name = if config.name.is_empty() { config.id.clone() } else { config.name.clone() };
    let cluster_identifier = cluster_name.clone().unwrap_or_else(|| config.id.clone());

    let fetches = node_names.iter().map(|name| {
        let client = client.clone();
        let online = *online_map.get(name).unwrap_or(&true);
        let ip = ip_map.get(name).cloned();
        let display_name = match &cluster_name {
            Some(cluster) => format!("{} - {}", cluster, name),
            None => endpoint_name.clone(),
        };
        let cluster_identifier = cluster_identifier.clone();
        async move {
            if !online {
                // Known offline: don't waste a request slot on it
                return (offline_stub(name, &display_name, &cluster_identifier, ip), Vec::new(), Vec::new());
            }
            fetch_node(&client, config, name, &display_name, &cluster_identifier, ip, limiter, direct_cache).await
        }
    });

    let mut data = EndpointData { source_endpoint: config.id.clone(), ..Default::default() };
    for (node, vms, containers) in join_all(fetches).await {
        data.nodes.push(node);
        data.vms.extend(vms);
        data.containers.extend(containers);
    }
    data
}

/// Stub for a node that cluster status already reports offline
fn offline_stub(name: &str, display_name: &str, cluster_identifier: &str, ip: Option<String>) -> Node {
    Node {
        name: name.to_string(),
        display_name: display_name.to_string(),
        cluster_identifier: cluster_identifier.to_string(),
        status: "offline".to_string(),
        cpu: None,
        maxcpu: 0,
        mem: 0,
        maxmem: 0,
        disk: 0,
        maxdisk: 0,
        uptime: 0,
        loadavg: Vec::new(),
        storage: Vec::new(),
        source_ip: ip,
        possible_transition: false,
        from_cache: false,
    }
}

/// Fetch one online node's status, storage, and guest lists concurrently,
/// holding one permit of the shared limiter for the duration.
#[allow(clippy::too_many_arguments)]
async fn fetch_node(
    client: &PveClient,
    config: &PveEndpointConfig,
    name: &str,
    display_name: &str,
    cluster_identifier: &str,
    ip: Option<String>,
    limiter: &Arc<Semaphore>,
    direct_cache: &TtlCache<String, Arc<PveClient>>,
) -> (Node, Vec<Guest>, Vec<Guest>) {
    let _permit = limiter.acquire().await.ok();

    let (status_result, storage_result, vms_result, cts_result) = tokio::join!(
        client.node_status(name),
        client.node_storage(name),
        client.list_vms(name),
        client.list_containers(name),
    );

    let mut node = offline_stub(name, display_name, cluster_identifier, ip);
    node.status = "online".to_string();

    match status_result {
        Ok(data) => {
            node.cpu = data.get("cpu").and_then(|v| v.as_f64()).map(|v| v as f32);
            node.maxcpu = data.get("cpuinfo").and_then(|v| v.get("cpus")).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            node.mem = data.get("memory").and_then(|v| v.get("used")).and_then(|v| v.as_u64()).unwrap_or(0);
            node.maxmem = data.get("memory").and_then(|v| v.get("total")).and_then(|v| v.as_u64()).unwrap_or(0);
            node.disk = data.get("rootfs").and_then(|v| v.get("used")).and_then(|v| v.as_u64()).unwrap_or(0);
            node.maxdisk = data.get("rootfs").and_then(|v| v.get("total")).and_then(|v| v.as_u64()).unwrap_or(0);
            node.uptime = data.get("uptime").and_then(|v| v.as_u64()).unwrap_or(0);
            node.loadavg = data.get("loadavg").and_then(|v| v.as_array()).map(|arr| {
                arr.iter().map(|l| match l.as_str() {
                    Some(s) => s.to_string(),
                    None => l.as_f64().map(|f| format!("{:.2}", f)).unwrap_or_default(),
                }).collect()
            }).unwrap_or_default();
        }
        Err(e) => debug!("Node status unavailable for {}/{}: {}", config.id, name, e),
    }

    match storage_result {
        Ok(mut storage) => {
            // Non-shared storage is only visible through the node itself;
            // refresh those rows over a direct connection when we can
            if storage.iter().any(|s| s.shared == 0) && node.source_ip.is_some() {
                if let Some(direct_client) = direct::get_direct_connection(&node, config, direct_cache).await {
                    match direct::direct_node_storage(&direct_client, name).await {
                        Ok(fresh) => direct::merge_direct_storage(&mut storage, fresh),
                        Err(e) => debug!("Direct storage read failed for {}: {}", name, e),
                    }
                }
            }
            node.storage = storage;
        }
        Err(e) => debug!("Storage listing unavailable for {}/{}: {}", config.id, name, e),
    }

    let vms = vms_result.unwrap_or_else(|e| {
        debug!("VM listing unavailable for {}/{}: {}", config.id, name, e);
        Vec::new()
    });
    let containers = cts_result.unwrap_or_else(|e| {
        debug!("Container listing unavailable for {}/{}: {}", config.id, name, e);
        Vec::new()
    });

    (node, vms, containers)
}
