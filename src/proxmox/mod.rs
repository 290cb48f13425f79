// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Proxmox VE API client — read-only inventory access to a PVE endpoint
//!
//! One client per configured endpoint. Every call carries an explicit
//! timeout; a timed-out or failed call reports only its own resource as
//! unavailable and never aborts sibling requests.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::{base_url, PveEndpointConfig};

/// Timeout for topology discovery calls (/cluster/status, /nodes)
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for per-node resource fetches (status, storage, guest lists)
pub const RESOURCE_TIMEOUT: Duration = Duration::from_secs(8);

const PVE_DEFAULT_PORT: u16 = 8006;

/// A VM or container on a Proxmox node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guest {
    /// Composite id: {endpoint}-{node}-{vmid}
    pub id: String,
    pub vmid: u64,
    pub name: String,
    pub node: String,
    pub endpoint_id: String,
    pub guest_type: String,    // "qemu" or "lxc"
    pub status: String,        // "running", "stopped", "unknown"
    pub cpus: u32,
    pub cpu: f32,              // 0.0–1.0 fraction of allocated CPUs
    pub maxmem: u64,           // bytes
    pub mem: u64,              // current usage bytes
    pub maxdisk: u64,          // bytes
    pub disk: u64,             // current usage bytes
    pub uptime: u64,           // seconds
}

/// One storage row from /nodes/{node}/storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStorage {
    pub storage: String,
    pub storage_type: String,
    pub content: String,
    pub total: u64,
    pub used: u64,
    pub avail: u64,
    /// 0 = node-local, only visible through that node
    pub shared: u64,
    pub active: bool,
}

/// A PVE node as seen by one discovery cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// "{cluster} - {node}" for cluster members, endpoint name otherwise
    pub display_name: String,
    /// Cluster name, or the endpoint id for standalone nodes
    pub cluster_identifier: String,
    pub status: String,        // "online", "offline", "unknown"
    pub cpu: Option<f32>,      // 0.0 - 1.0, None when the status fetch failed
    pub maxcpu: u32,
    pub mem: u64,
    pub maxmem: u64,
    pub disk: u64,
    pub maxdisk: u64,
    pub uptime: u64,
    #[serde(default)]
    pub loadavg: Vec<String>,
    #[serde(default)]
    pub storage: Vec<NodeStorage>,
    /// Node IP from cluster status, used for direct connections
    pub source_ip: Option<String>,
    /// Set when a previously online node reports offline mid-merge
    #[serde(default)]
    pub possible_transition: bool,
    /// Set when the node was backfilled from the last-known-good cache
    #[serde(default)]
    pub from_cache: bool,
}

/// One entry from /cluster/status
#[derive(Debug, Clone)]
pub struct ClusterStatusEntry {
    pub entry_type: String,    // "cluster" or "node"
    pub name: String,
    pub nodes: u64,            // cluster entries: member count
    pub quorate: bool,
    pub online: bool,          // node entries
    pub ip: Option<String>,
}

/// Proxmox VE API client for one configured endpoint
pub struct PveClient {
    endpoint_id: String,
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl PveClient {
    /// Create a client for a configured endpoint
    pub fn new(config: &PveEndpointConfig) -> Self {
        Self::with_base_url(
            &config.id,
            &base_url(&config.host, PVE_DEFAULT_PORT),
            &config.token_id,
            &config.token_secret,
            config.allow_self_signed_certs,
            None,
        )
    }

    /// Create a client against an explicit base URL — used for direct
    /// node connections where cluster-wide routing must be bypassed.
    pub fn with_base_url(
        endpoint_id: &str,
        base: &str,
        token_id: &str,
        token_secret: &str,
        allow_self_signed: bool,
        request_timeout: Option<Duration>,
    ) -> Self {
        let mut builder = reqwest::Client::builder();
        if allow_self_signed {
            // PVE ships with self-signed certs by default
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(t) = request_timeout {
            builder = builder.timeout(t);
        }
        let client = builder.build().unwrap_or_else(|_| reqwest::Client::new());

        Self {
            endpoint_id: endpoint_id.to_string(),
            base_url: base.to_string(),
            token: format!("PVEAPIToken={}={}", token_id, token_secret),
            client,
        }
    }

    /// GET request to the PVE API with an explicit timeout
    async fn get(&self, path: &str, timeout: Duration) -> Result<serde_json::Value, String> {
        let url = format!("{}/api2/json{}", self.base_url, path);
        debug!("PVE GET {}", url);

        let resp = self.client.get(&url)
            .header("Authorization", &self.token)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("PVE request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("PVE API {} {}: {}", status.as_u16(), path, body));
        }

        let json: serde_json::Value = resp.json().await
            .map_err(|e| format!("PVE JSON parse: {}", e))?;

        Ok(json.get("data").cloned().unwrap_or(json))
    }

    /// Test connectivity — returns the PVE version string
    pub async fn test_connection(&self, timeout: Duration) -> Result<String, String> {
        let data = self.get("/version", timeout).await?;
        let version = data.get("version").and_then(|v| v.as_str()).unwrap_or("unknown");
        let release = data.get("release").and_then(|v| v.as_str()).unwrap_or("");
        Ok(format!("Proxmox VE {} ({})", version, release))
    }

    /// Get /cluster/status entries (cluster header + one entry per node)
    pub async fn get_cluster_status(&self) -> Result<Vec<ClusterStatusEntry>, String> {
        let data = self.get("/cluster/status", DISCOVERY_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /cluster/status")?;
        Ok(arr.iter().map(|item| ClusterStatusEntry {
            entry_type: item.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            name: item.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            nodes: item.get("nodes").and_then(|v| v.as_u64()).unwrap_or(0),
            quorate: item.get("quorate").and_then(|v| v.as_u64()).unwrap_or(0) == 1,
            online: item.get("online").and_then(|v| v.as_u64()).unwrap_or(0) == 1,
            ip: item.get("ip").and_then(|v| v.as_str()).map(|s| s.to_string()),
        }).collect())
    }

    /// Discover node names via /nodes
    pub async fn list_nodes(&self) -> Result<Vec<String>, String> {
        let data = self.get("/nodes", DISCOVERY_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /nodes")?;
        Ok(arr.iter()
            .filter_map(|v| v.get("node").and_then(|n| n.as_str()).map(|s| s.to_string()))
            .collect())
    }

    /// Get one node's status (CPU, RAM, rootfs, uptime, load)
    pub async fn node_status(&self, node: &str) -> Result<serde_json::Value, String> {
        self.get(&format!("/nodes/{}/status", node), RESOURCE_TIMEOUT).await
    }

    /// List one node's storage volumes
    pub async fn node_storage(&self, node: &str) -> Result<Vec<NodeStorage>, String> {
        let data = self.get(&format!("/nodes/{}/storage", node), RESOURCE_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /storage")?;
        Ok(arr.iter().map(|v| NodeStorage {
            storage: v.get("storage").and_then(|s| s.as_str()).unwrap_or("").to_string(),
            storage_type: v.get("type").and_then(|s| s.as_str()).unwrap_or("").to_string(),
            content: v.get("content").and_then(|s| s.as_str()).unwrap_or("").to_string(),
            total: v.get("total").and_then(|s| s.as_u64()).unwrap_or(0),
            used: v.get("used").and_then(|s| s.as_u64()).unwrap_or(0),
            avail: v.get("avail").and_then(|s| s.as_u64()).unwrap_or(0),
            shared: v.get("shared").and_then(|s| s.as_u64()).unwrap_or(0),
            active: v.get("active").and_then(|s| s.as_u64()).unwrap_or(0) == 1,
        }).collect())
    }

    /// List QEMU VMs on a node
    pub async fn list_vms(&self, node: &str) -> Result<Vec<Guest>, String> {
        let data = self.get(&format!("/nodes/{}/qemu", node), RESOURCE_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /qemu")?;
        Ok(arr.iter().map(|v| self.parse_guest(v, node, "qemu")).collect())
    }

    /// List LXC containers on a node
    pub async fn list_containers(&self, node: &str) -> Result<Vec<Guest>, String> {
        let data = self.get(&format!("/nodes/{}/lxc", node), RESOURCE_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /lxc")?;
        Ok(arr.iter().map(|v| self.parse_guest(v, node, "lxc")).collect())
    }

    fn parse_guest(&self, v: &serde_json::Value, node: &str, guest_type: &str) -> Guest {
        let vmid = v.get("vmid").and_then(|v| v.as_u64()).unwrap_or(0);
        // Name fallback: name -> hostname -> empty
        let name = v.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
            .or_else(|| v.get("hostname").and_then(|v| v.as_str()).filter(|s| !s.is_empty()))
            .unwrap_or("").to_string();
        Guest {
            id: format!("{}-{}-{}", self.endpoint_id, node, vmid),
            vmid,
            name,
            node: node.to_string(),
            endpoint_id: self.endpoint_id.clone(),
            guest_type: guest_type.to_string(),
            status: v.get("status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
            cpus: v.get("cpus").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
            cpu: v.get("cpu").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
            maxmem: v.get("maxmem").and_then(|v| v.as_u64()).unwrap_or(0),
            mem: v.get("mem").and_then(|v| v.as_u64()).unwrap_or(0),
            maxdisk: v.get("maxdisk").and_then(|v| v.as_u64()).unwrap_or(0),
            disk: v.get("disk").and_then(|v| v.as_u64()).unwrap_or(0),
            uptime: v.get("uptime").and_then(|v| v.as_u64()).unwrap_or(0),
        }
    }

    /// Recent tasks on a node, optionally filtered by task type
    pub async fn node_tasks(&self, node: &str, typefilter: Option<&str>) -> Result<Vec<serde_json::Value>, String> {
        let path = match typefilter {
            Some(t) => format!("/nodes/{}/tasks?typefilter={}&limit=500", node, t),
            None => format!("/nodes/{}/tasks?limit=500", node),
        };
        let data = self.get(&path, RESOURCE_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /tasks")?;
        Ok(arr.clone())
    }

    /// List storage content of a given type (e.g. "backup")
    pub async fn storage_content(&self, node: &str, storage: &str, content: &str) -> Result<Vec<serde_json::Value>, String> {
        let path = format!("/nodes/{}/storage/{}/content?content={}", node, storage, content);
        let data = self.get(&path, RESOURCE_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /content")?;
        Ok(arr.clone())
    }

    /// Configuration snapshots of a guest (includes the synthetic "current")
    pub async fn guest_snapshots(&self, node: &str, guest_type: &str, vmid: u64) -> Result<Vec<serde_json::Value>, String> {
        let path = format!("/nodes/{}/{}/{}/snapshot", node, guest_type, vmid);
        let data = self.get(&path, RESOURCE_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /snapshot")?;
        Ok(arr.clone())
    }

    /// RRD history for a guest
    pub async fn guest_rrddata(&self, node: &str, guest_type: &str, vmid: u64, timeframe: &str) -> Result<Vec<serde_json::Value>, String> {
        let path = format!("/nodes/{}/{}/{}/rrddata?timeframe={}", node, guest_type, vmid, timeframe);
        let data = self.get(&path, RESOURCE_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /rrddata")?;
        Ok(arr.clone())
    }

    /// Current live status of a guest
    pub async fn guest_current_status(&self, node: &str, guest_type: &str, vmid: u64) -> Result<serde_json::Value, String> {
        let path = format!("/nodes/{}/{}/{}/status/current", node, guest_type, vmid);
        self.get(&path, RESOURCE_TIMEOUT).await
    }
}
