// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Discovery orchestration
//!
//! One discovery cycle runs: PVE discovery, then PBS discovery and PVE
//! backup-data discovery concurrently (backup data needs the node/guest
//! list, PBS does not), then merges everything into one aggregate snapshot.
//! Cycles are independent — a failed cycle produces a partial aggregate and
//! the next cycle starts clean. A separate, more frequent metrics cycle
//! polls live usage for running guests.

pub mod dedup;
pub mod direct;
pub mod membership;
pub mod pve;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::config::PulseConfig;
use crate::pbs::{self, PbsInstance, PbsTask, PbsTaskSummary};
use crate::proxmox::{Guest, Node, PveClient};

use membership::ClusterMembership;
use pve::EndpointData;

/// Process-wide cap on simultaneous per-node fetches
const NODE_FETCH_LIMIT: usize = 5;

const MEMBERSHIP_TTL: Duration = Duration::from_secs(300);
const NAMESPACE_TTL: Duration = Duration::from_secs(300);
const NODE_CACHE_TTL: Duration = Duration::from_secs(60);
const DIRECT_CONNECTION_TTL: Duration = Duration::from_secs(300);

/// The mutable shared state of the collector: four TTL caches and the
/// node-fetch limiter. Instantiated once per process and injected into
/// every cycle — each cache carries its own lock.
pub struct DiscoveryState {
    pub membership_cache: TtlCache<String, ClusterMembership>,
    pub node_cache: TtlCache<String, Node>,
    pub namespace_cache: TtlCache<String, Vec<String>>,
    pub direct_cache: TtlCache<String, Arc<PveClient>>,
    pub node_limiter: Arc<Semaphore>,
}

impl DiscoveryState {
    pub fn new() -> Self {
        Self {
            membership_cache: TtlCache::new(MEMBERSHIP_TTL),
            node_cache: TtlCache::new(NODE_CACHE_TTL),
            namespace_cache: TtlCache::new(NAMESPACE_TTL),
            direct_cache: TtlCache::new(DIRECT_CONNECTION_TTL),
            node_limiter: Arc::new(Semaphore::new(NODE_FETCH_LIMIT)),
        }
    }
}

impl Default for DiscoveryState {
    fn default() -> Self {
        Self::new()
    }
}

/// One vzdump task from a PVE node's task log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PveBackupTask {
    pub upid: String,
    pub node: String,
    pub vmid: Option<u64>,
    pub starttime: i64,
    pub endtime: Option<i64>,
    pub status: String,
}

/// One backup volume found on a PVE storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageBackup {
    pub volid: String,
    pub storage: String,
    pub node: String,
    pub vmid: Option<u64>,
    pub ctime: i64,
    pub size: u64,
    #[serde(default)]
    pub notes: String,
}

/// One configuration snapshot of a guest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestSnapshot {
    pub name: String,
    pub node: String,
    pub vmid: u64,
    pub guest_type: String,
    pub snaptime: Option<i64>,
    #[serde(default)]
    pub description: String,
    pub vmstate: bool,
}

/// PVE-side backup data: vzdump history, volumes on storage, guest snapshots
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PveBackups {
    pub backup_tasks: Vec<PveBackupTask>,
    pub storage_backups: Vec<StorageBackup>,
    pub guest_snapshots: Vec<GuestSnapshot>,
}

/// The aggregate produced by one discovery cycle — the collector's sole
/// externally visible output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub timestamp: i64,
    pub nodes: Vec<Node>,
    pub vms: Vec<Guest>,
    pub containers: Vec<Guest>,
    pub pbs: Vec<PbsInstance>,
    pub pve_backups: PveBackups,
    pub all_pbs_tasks: Vec<PbsTask>,
    pub pbs_task_summary: PbsTaskSummary,
}

/// One RRD data point for a guest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrdPoint {
    pub time: i64,
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub netin: f64,
    pub netout: f64,
    pub diskread: f64,
    pub diskwrite: f64,
}

/// Live metrics for one running guest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestMetrics {
    pub id: String,
    pub node: String,
    pub vmid: u64,
    pub guest_type: String,
    pub timestamp: i64,
    pub cpu: f64,
    pub mem: u64,
    pub maxmem: u64,
    pub disk: u64,
    pub netin: u64,
    pub netout: u64,
    pub diskread: u64,
    pub diskwrite: u64,
    pub history: Vec<RrdPoint>,
}

/// Run one full discovery cycle. Never fails — every error shrinks the
/// aggregate instead of aborting it.
pub async fn fetch_discovery_data(config: &PulseConfig, state: &DiscoveryState) -> AggregateSnapshot {
    let started = std::time::Instant::now();

    // ── Phase 1: group endpoints and fetch PVE inventory ──
    let groups = membership::detect(&config.pve, &state.membership_cache).await;
    debug!("Discovery: {} endpoint group(s) from {} configured endpoint(s)",
        groups.len(), config.pve.len());

    let group_fetches = groups.iter()
        .map(|g| pve::fetch_group(g, &config.pve, &state.node_limiter, &state.direct_cache));
    let endpoint_data: Vec<EndpointData> = join_all(group_fetches).await
        .into_iter()
        .flatten()
        .collect();

    let mut all_nodes = Vec::new();
    let mut all_vms = Vec::new();
    let mut all_containers = Vec::new();
    for data in &endpoint_data {
        all_nodes.extend(data.nodes.iter().cloned());
        all_vms.extend(data.vms.iter().cloned());
        all_containers.extend(data.containers.iter().cloned());
    }

    let mut nodes = dedup::merge_nodes(all_nodes);
    dedup::backfill_nodes(&mut nodes, &state.node_cache);
    let vms = dedup::merge_guests(all_vms);
    let containers = dedup::merge_guests(all_containers);

    // ── Phase 2: PBS discovery and PVE backup data, concurrently ──
    let now = chrono::Utc::now().timestamp();
    let cutoff = config.history_cutoff(now);
    let (pbs_instances, pve_backups) = tokio::join!(
        discover_all_pbs(config, state, cutoff),
        discover_pve_backups(config, state, &endpoint_data, cutoff),
    );

    // ── Phase 3: aggregate ──
    let mut all_pbs_tasks = Vec::new();
    let mut pbs_task_summary = PbsTaskSummary::default();
    for instance in &pbs_instances {
        all_pbs_tasks.extend(instance.tasks.iter().cloned());
        pbs_task_summary.add(&instance.task_summary);
    }

    info!(
        "Discovery cycle: {} nodes, {} VMs, {} containers, {} PBS instance(s) in {:.1}s",
        nodes.len(), vms.len(), containers.len(), pbs_instances.len(),
        started.elapsed().as_secs_f32()
    );

    AggregateSnapshot {
        timestamp: now,
        nodes,
        vms,
        containers,
        pbs: pbs_instances,
        pve_backups,
        all_pbs_tasks,
        pbs_task_summary,
    }
}

/// Discover every configured PBS instance concurrently
async fn discover_all_pbs(config: &PulseConfig, state: &DiscoveryState, cutoff: i64) -> Vec<PbsInstance> {
    let fetches = config.pbs.iter()
        .map(|c| pbs::discover_instance(c, &state.namespace_cache, cutoff));
    join_all(fetches).await
}

/// Collect vzdump history, storage backup volumes, and guest configuration
/// snapshots across all fetched endpoints. Requires the completed PVE
/// inventory as input.
async fn discover_pve_backups(
    config: &PulseConfig,
    state: &DiscoveryState,
    endpoint_data: &[EndpointData],
    cutoff: i64,
) -> PveBackups {
    let mut backups = PveBackups::default();

    for data in endpoint_data {
        let Some(endpoint) = config.pve.iter().find(|c| c.id == data.source_endpoint) else {
            continue;
        };
        let client = Arc::new(PveClient::new(endpoint));

        let node_fetches = data.nodes.iter()
            .filter(|n| n.status == "online")
            .map(|node| {
                let client = client.clone();
                let guests: Vec<&Guest> = data.vms.iter().chain(data.containers.iter())
                    .filter(|g| g.node == node.name)
                    .collect();
                fetch_node_backup_data(client, node, guests, &state.node_limiter, cutoff)
            });

        for partial in join_all(node_fetches).await {
            backups.backup_tasks.extend(partial.backup_tasks);
            backups.storage_backups.extend(partial.storage_backups);
            backups.guest_snapshots.extend(partial.guest_snapshots);
        }
    }

    // Shared storages are listed by every node of a cluster; volumes are
    // counted once
    let mut seen = std::collections::HashSet::new();
    backups.storage_backups.retain(|b| seen.insert(b.volid.clone()));

    backups
}

/// Backup data for one node, fetched while holding one limiter permit
async fn fetch_node_backup_data(
    client: Arc<PveClient>,
    node: &Node,
    guests: Vec<&Guest>,
    limiter: &Arc<Semaphore>,
    cutoff: i64,
) -> PveBackups {
    let _permit = limiter.acquire().await.ok();
    let mut backups = PveBackups::default();

    match client.node_tasks(&node.name, Some("vzdump")).await {
        Ok(tasks) => {
            for t in tasks {
                let starttime = t.get("starttime").and_then(|v| v.as_i64()).unwrap_or(0);
                if starttime < cutoff {
                    continue;
                }
                backups.backup_tasks.push(PveBackupTask {
                    upid: t.get("upid").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    node: node.name.clone(),
                    vmid: t.get("id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
                    starttime,
                    endtime: t.get("endtime").and_then(|v| v.as_i64()),
                    status: t.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                });
            }
        }
        Err(e) => debug!("vzdump task listing failed for {}: {}", node.name, e),
    }

    for storage in node.storage.iter().filter(|s| s.active && s.content.contains("backup")) {
        match client.storage_content(&node.name, &storage.storage, "backup").await {
            Ok(volumes) => {
                for v in volumes {
                    let ctime = v.get("ctime").and_then(|c| c.as_i64()).unwrap_or(0);
                    if ctime < cutoff {
                        continue;
                    }
                    backups.storage_backups.push(StorageBackup {
                        volid: v.get("volid").and_then(|s| s.as_str()).unwrap_or("").to_string(),
                        storage: storage.storage.clone(),
                        node: node.name.clone(),
                        vmid: v.get("vmid").and_then(|s| s.as_u64()),
                        ctime,
                        size: v.get("size").and_then(|s| s.as_u64()).unwrap_or(0),
                        notes: v.get("notes").and_then(|s| s.as_str()).unwrap_or("").to_string(),
                    });
                }
            }
            Err(e) => debug!("Backup content listing failed for {}/{}: {}", node.name, storage.storage, e),
        }
    }

    for guest in guests {
        match client.guest_snapshots(&guest.node, &guest.guest_type, guest.vmid).await {
            Ok(snaps) => {
                for s in snaps {
                    let name = s.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    // "current" is the running state, not a snapshot
                    if name.is_empty() || name == "current" {
                        continue;
                    }
                    backups.guest_snapshots.push(GuestSnapshot {
                        name,
                        node: guest.node.clone(),
                        vmid: guest.vmid,
                        guest_type: guest.guest_type.clone(),
                        snaptime: s.get("snaptime").and_then(|v| v.as_i64()),
                        description: s.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        vmstate: s.get("vmstate").and_then(|v| v.as_u64()).unwrap_or(0) == 1,
                    });
                }
            }
            Err(e) => debug!("Snapshot listing failed for {}/{}: {}", guest.node, guest.vmid, e),
        }
    }

    backups
}

/// Poll live metrics for every running guest. A 400 response means the
/// guest stopped between discovery and now — logged and omitted, never
/// treated as fatal.
pub async fn fetch_metrics_data(
    config: &PulseConfig,
    vms: &[Guest],
    containers: &[Guest],
    state: &DiscoveryState,
) -> Vec<GuestMetrics> {
    let clients: std::collections::HashMap<String, Arc<PveClient>> = config.pve.iter()
        .map(|c| (c.id.clone(), Arc::new(PveClient::new(c))))
        .collect();
    let now = chrono::Utc::now().timestamp();

    let fetches = vms.iter().chain(containers.iter())
        .filter(|g| g.status == "running")
        .filter_map(|guest| clients.get(&guest.endpoint_id).map(|c| (guest, c.clone())))
        .map(|(guest, client)| {
            let limiter = state.node_limiter.clone();
            async move {
                let _permit = limiter.acquire().await.ok();
                let (rrd_result, current_result) = tokio::join!(
                    client.guest_rrddata(&guest.node, &guest.guest_type, guest.vmid, "hour"),
                    client.guest_current_status(&guest.node, &guest.guest_type, guest.vmid),
                );

                let current = match current_result {
                    Ok(data) => data,
                    Err(e) if e.contains("PVE API 400") => {
                        warn!("Guest {} appears to have just stopped, skipping metrics", guest.id);
                        return None;
                    }
                    Err(e) => {
                        debug!("Metrics unavailable for {}: {}", guest.id, e);
                        return None;
                    }
                };

                let history = match rrd_result {
                    Ok(points) => points.iter().filter_map(parse_rrd_point).collect(),
                    Err(e) => {
                        debug!("RRD history unavailable for {}: {}", guest.id, e);
                        Vec::new()
                    }
                };

                Some(GuestMetrics {
                    id: guest.id.clone(),
                    node: guest.node.clone(),
                    vmid: guest.vmid,
                    guest_type: guest.guest_type.clone(),
                    timestamp: now,
                    cpu: current.get("cpu").and_then(|v| v.as_f64()).unwrap_or(0.0),
                    mem: current.get("mem").and_then(|v| v.as_u64()).unwrap_or(0),
                    maxmem: current.get("maxmem").and_then(|v| v.as_u64()).unwrap_or(0),
                    disk: current.get("disk").and_then(|v| v.as_u64()).unwrap_or(0),
                    netin: current.get("netin").and_then(|v| v.as_u64()).unwrap_or(0),
                    netout: current.get("netout").and_then(|v| v.as_u64()).unwrap_or(0),
                    diskread: current.get("diskread").and_then(|v| v.as_u64()).unwrap_or(0),
                    diskwrite: current.get("diskwrite").and_then(|v| v.as_u64()).unwrap_or(0),
                    history,
                })
            }
        });

    join_all(fetches).await.into_iter().flatten().collect()
}

fn parse_rrd_point(v: &serde_json::Value) -> Option<RrdPoint> {
    let time = v.get("time").and_then(|t| t.as_i64())?;
    Some(RrdPoint {
        time,
        cpu: v.get("cpu").and_then(|x| x.as_f64()).unwrap_or(0.0),
        mem: v.get("mem").and_then(|x| x.as_f64()).unwrap_or(0.0),
        disk: v.get("disk").and_then(|x| x.as_f64()).unwrap_or(0.0),
        netin: v.get("netin").and_then(|x| x.as_f64()).unwrap_or(0.0),
        netout: v.get("netout").and_then(|x| x.as_f64()).unwrap_or(0.0),
        diskread: v.get("diskread").and_then(|x| x.as_f64()).unwrap_or(0.0),
        diskwrite: v.get("diskwrite").and_then(|x| x.as_f64()).unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rrd_point() {
        let v = serde_json::json!({
            "time": 1700000000,
            "cpu": 0.25,
            "mem": 1024.0,
            "netin": 10.0
        });
        let p = parse_rrd_point(&v).unwrap();
        assert_eq!(p.time, 1_700_000_000);
        assert_eq!(p.cpu, 0.25);
        assert_eq!(p.netout, 0.0);
    }

    #[test]
    fn test_parse_rrd_point_requires_time() {
        let v = serde_json::json!({ "cpu": 0.25 });
        assert!(parse_rrd_point(&v).is_none());
    }

    #[test]
    fn test_task_summary_aggregation() {
        let mut total = PbsTaskSummary::default();
        total.add(&PbsTaskSummary { total: 5, ok: 4, failed: 1, running: 0 });
        total.add(&PbsTaskSummary { total: 3, ok: 2, failed: 0, running: 1 });
        assert_eq!(total.total, 8);
        assert_eq!(total.ok, 6);
        assert_eq!(total.failed, 1);
        assert_eq!(total.running, 1);
    }
}
