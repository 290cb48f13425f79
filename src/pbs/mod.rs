// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Proxmox Backup Server API client and per-instance discovery
//!
//! Collects datastores, snapshot listings across namespaces, admin tasks,
//! and verification job configuration from one PBS endpoint, then derives
//! synthetic backup runs and verification diagnostics. An unreachable
//! instance is reported with status "offline" rather than omitted.

pub mod backup_runs;
pub mod namespaces;
pub mod verify;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::config::{base_url, PbsEndpointConfig};

pub use backup_runs::BackupRun;
pub use verify::VerificationDiagnostics;

const PBS_DEFAULT_PORT: u16 = 8007;
const PBS_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
const PBS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Verification record attached to a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationInfo {
    pub state: String,     // "ok", "failed", ...
    pub upid: String,      // UPID of the verification task that produced it
}

/// One backup snapshot in a datastore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub backup_type: String,   // "vm", "ct", "host"
    pub backup_id: String,
    pub backup_time: i64,      // epoch seconds
    /// Namespace the snapshot lives in; "root" for the root namespace
    pub namespace: String,
    pub verification: Option<VerificationInfo>,
    pub size: u64,
    pub protected: bool,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub owner: String,
}

/// A PBS datastore with its snapshot inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datastore {
    pub name: String,
    pub total: u64,
    pub used: u64,
    pub available: u64,
    /// Status of the most recent garbage collection task, "unknown" if none seen
    pub gc_status: String,
    /// Logical backup bytes / physical used bytes
    pub dedup_factor: f64,
    pub snapshots: Vec<SnapshotEntry>,
}

/// One admin task from /nodes/{node}/tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbsTask {
    pub upid: String,
    pub node: String,
    pub worker_type: String,   // "backup", "verify", "garbage_collection", ...
    pub worker_id: String,     // e.g. "datastore:vm/100"
    pub starttime: i64,
    pub endtime: Option<i64>,
    pub status: String,        // "OK", error text, or "" while running
    pub user: String,
}

impl PbsTask {
    pub fn is_running(&self) -> bool {
        self.endtime.is_none() && self.status.is_empty()
    }

    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

/// Task counts for one instance within the history window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PbsTaskSummary {
    pub total: u64,
    pub ok: u64,
    pub failed: u64,
    pub running: u64,
}

impl PbsTaskSummary {
    pub fn add(&mut self, other: &PbsTaskSummary) {
        self.total += other.total;
        self.ok += other.ok;
        self.failed += other.failed;
        self.running += other.running;
    }
}

/// A configured verification job from /config/verify
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyJobConfig {
    pub id: String,
    pub store: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub disabled: bool,
}

/// Everything discovered from one PBS endpoint in one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbsInstance {
    pub id: String,
    pub name: String,
    pub host: String,
    pub status: String,        // "online" or "offline"
    /// Explanation when offline, so downstream can tell "unreachable"
    /// apart from "not configured"
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub subscription_status: String,
    #[serde(default)]
    pub datastores: Vec<Datastore>,
    #[serde(default)]
    pub tasks: Vec<PbsTask>,
    #[serde(default)]
    pub task_summary: PbsTaskSummary,
    #[serde(default)]
    pub backup_runs: Vec<BackupRun>,
    #[serde(default)]
    pub diagnostics: Vec<VerificationDiagnostics>,
}

/// Proxmox Backup Server API client
pub struct PbsClient {
    endpoint_id: String,
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl PbsClient {
    pub fn new(config: &PbsEndpointConfig) -> Self {
        let mut builder = reqwest::Client::builder();
        if config.allow_self_signed_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().unwrap_or_else(|_| reqwest::Client::new());

        Self {
            endpoint_id: config.id.clone(),
            base_url: base_url(&config.host, PBS_DEFAULT_PORT),
            token: format!("PBSAPIToken={}:{}", config.token_id, config.token_secret),
            client,
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// GET request to the PBS API
    pub async fn get(&self, path: &str, timeout: Duration) -> Result<serde_json::Value, String> {
        let url = format!("{}/api2/json{}", self.base_url, path);
        debug!("PBS GET {}", url);

        let resp = self.client.get(&url)
            .header("Authorization", &self.token)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("PBS request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("PBS API {} {}: {}", status.as_u16(), path, body));
        }

        let json: serde_json::Value = resp.json().await
            .map_err(|e| format!("PBS JSON parse: {}", e))?;

        Ok(json.get("data").cloned().unwrap_or(json))
    }

    /// Version probe, also used as the reachability test
    pub async fn version(&self) -> Result<String, String> {
        let data = self.get("/version", PBS_PROBE_TIMEOUT).await?;
        Ok(data.get("version").and_then(|v| v.as_str()).unwrap_or("unknown").to_string())
    }

    /// Subscription status ("active", "notfound", ...)
    pub async fn subscription_status(&self) -> Result<String, String> {
        let data = self.get("/subscription", PBS_PROBE_TIMEOUT).await?;
        Ok(data.get("status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string())
    }

    /// Name of the PBS node itself, needed for task queries
    pub async fn node_name(&self) -> Result<String, String> {
        let data = self.get("/nodes", PBS_PROBE_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /nodes")?;
        Ok(arr.first()
            .and_then(|v| v.get("node").and_then(|n| n.as_str()))
            .unwrap_or("localhost")
            .to_string())
    }

    /// Datastore capacity from /status/datastore-usage
    pub async fn datastore_usage(&self) -> Result<Vec<serde_json::Value>, String> {
        let data = self.get("/status/datastore-usage", PBS_REQUEST_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /status/datastore-usage")?;
        Ok(arr.clone())
    }

    /// Datastore configuration from /config/datastore
    pub async fn datastore_config(&self) -> Result<Vec<serde_json::Value>, String> {
        let data = self.get("/config/datastore", PBS_REQUEST_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /config/datastore")?;
        Ok(arr.clone())
    }

    /// Backup groups in a datastore namespace ("root" or "" = root)
    pub async fn list_groups(&self, datastore: &str, namespace: &str) -> Result<Vec<serde_json::Value>, String> {
        let path = match namespace_param(namespace) {
            Some(ns) => format!("/admin/datastore/{}/groups?ns={}", datastore, urlencoding::encode(&ns)),
            None => format!("/admin/datastore/{}/groups", datastore),
        };
        let data = self.get(&path, PBS_REQUEST_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /groups")?;
        Ok(arr.clone())
    }

    /// All snapshots in a datastore namespace
    pub async fn list_snapshots(&self, datastore: &str, namespace: &str) -> Result<Vec<SnapshotEntry>, String> {
        let path = match namespace_param(namespace) {
            Some(ns) => format!("/admin/datastore/{}/snapshots?ns={}", datastore, urlencoding::encode(&ns)),
            None => format!("/admin/datastore/{}/snapshots", datastore),
        };
        let data = self.get(&path, PBS_REQUEST_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /snapshots")?;
        Ok(arr.iter().map(|v| parse_snapshot(v, namespace)).collect())
    }

    /// Recent tasks on the PBS node
    pub async fn node_tasks(&self, node: &str, since: i64) -> Result<Vec<PbsTask>, String> {
        let path = format!("/nodes/{}/tasks?since={}&limit=1000", node, since);
        let data = self.get(&path, PBS_REQUEST_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /tasks")?;
        Ok(arr.iter().map(parse_task).collect())
    }

    /// Configured verification jobs
    pub async fn verify_jobs(&self) -> Result<Vec<VerifyJobConfig>, String> {
        let data = self.get("/config/verify", PBS_REQUEST_TIMEOUT).await?;
        let arr = data.as_array().ok_or("Expected array from /config/verify")?;
        Ok(arr.iter().map(|v| VerifyJobConfig {
            id: v.get("id").and_then(|s| s.as_str()).unwrap_or("").to_string(),
            store: v.get("store").and_then(|s| s.as_str()).unwrap_or("").to_string(),
            schedule: v.get("schedule").and_then(|s| s.as_str()).unwrap_or("").to_string(),
            disabled: v.get("disable").and_then(|s| s.as_bool()).unwrap_or(false),
        }).collect())
    }
}

/// Map the canonical namespace name to the API's ns parameter.
/// Root ("root" or empty) means no parameter at all.
fn namespace_param(namespace: &str) -> Option<String> {
    if namespace.is_empty() || namespace == "root" {
        None
    } else {
        Some(namespace.to_string())
    }
}

fn parse_snapshot(v: &serde_json::Value, namespace: &str) -> SnapshotEntry {
    let ns = match v.get("ns").and_then(|s| s.as_str()).filter(|s| !s.is_empty()) {
        Some(ns) => ns.to_string(),
        None if namespace.is_empty() => "root".to_string(),
        None => namespace.to_string(),
    };
    SnapshotEntry {
        backup_type: v.get("backup-type").and_then(|s| s.as_str()).unwrap_or("").to_string(),
        backup_id: v.get("backup-id").and_then(|s| s.as_str()).unwrap_or("").to_string(),
        backup_time: v.get("backup-time").and_then(|s| s.as_i64()).unwrap_or(0),
        namespace: ns,
        verification: v.get("verification").and_then(|ver| {
            let state = ver.get("state").and_then(|s| s.as_str())?;
            Some(VerificationInfo {
                state: state.to_string(),
                upid: ver.get("upid").and_then(|s| s.as_str()).unwrap_or("").to_string(),
            })
        }),
        size: v.get("size").and_then(|s| s.as_u64()).unwrap_or(0),
        protected: v.get("protected").and_then(|s| s.as_bool()).unwrap_or(false),
        comment: v.get("comment").and_then(|s| s.as_str()).unwrap_or("").to_string(),
        owner: v.get("owner").and_then(|s| s.as_str()).unwrap_or("").to_string(),
    }
}

fn parse_task(v: &serde_json::Value) -> PbsTask {
    PbsTask {
        upid: v.get("upid").and_then(|s| s.as_str()).unwrap_or("").to_string(),
        node: v.get("node").and_then(|s| s.as_str()).unwrap_or("").to_string(),
        worker_type: v.get("worker_type").and_then(|s| s.as_str())
            .or_else(|| v.get("type").and_then(|s| s.as_str()))
            .unwrap_or("").to_string(),
        worker_id: v.get("worker_id").and_then(|s| s.as_str())
            .or_else(|| v.get("id").and_then(|s| s.as_str()))
            .unwrap_or("").to_string(),
        starttime: v.get("starttime").and_then(|s| s.as_i64()).unwrap_or(0),
        endtime: v.get("endtime").and_then(|s| s.as_i64()),
        status: v.get("status").and_then(|s| s.as_str()).unwrap_or("").to_string(),
        user: v.get("user").and_then(|s| s.as_str()).unwrap_or("").to_string(),
    }
}

/// Summarize backup/verify task outcomes within the history window
pub fn summarize_tasks(tasks: &[PbsTask]) -> PbsTaskSummary {
    let mut summary = PbsTaskSummary::default();
    for task in tasks {
        summary.total += 1;
        if task.is_running() {
            summary.running += 1;
        } else if task.is_ok() {
            summary.ok += 1;
        } else {
            summary.failed += 1;
        }
    }
    summary
}

/// Discover everything from one PBS endpoint. Never fails: an unreachable
/// instance is returned with status "offline" and an explanatory message.
pub async fn discover_instance(
    config: &PbsEndpointConfig,
    namespace_cache: &TtlCache<String, Vec<String>>,
    cutoff: i64,
) -> PbsInstance {
    let client = PbsClient::new(config);
    let display_name = if config.name.is_empty() { config.id.clone() } else { config.name.clone() };

    let version = match client.version().await {
        Ok(v) => v,
        Err(e) => {
            warn!("PBS {} unreachable: {}", config.id, e);
            return PbsInstance {
                id: config.id.clone(),
                name: display_name,
                host: config.host.clone(),
                status: "offline".to_string(),
                message: format!("PBS endpoint unreachable: {}", e),
                version: String::new(),
                node_name: String::new(),
                subscription_status: String::new(),
                datastores: Vec::new(),
                tasks: Vec::new(),
                task_summary: PbsTaskSummary::default(),
                backup_runs: Vec::new(),
                diagnostics: Vec::new(),
            };
        }
    };

    let node_name = client.node_name().await.unwrap_or_else(|_| "localhost".to_string());
    let subscription_status = client.subscription_status().await.unwrap_or_default();

    // Tasks and datastore inventory are independent fetches
    let (tasks_result, usage_result, config_result, verify_result) = tokio::join!(
        client.node_tasks(&node_name, cutoff),
        client.datastore_usage(),
        client.datastore_config(),
        client.verify_jobs(),
    );

    let tasks: Vec<PbsTask> = tasks_result.unwrap_or_else(|e| {
        warn!("PBS {}: task listing failed: {}", config.id, e);
        Vec::new()
    });
    let usage = usage_result.unwrap_or_else(|e| {
        warn!("PBS {}: datastore usage failed: {}", config.id, e);
        Vec::new()
    });
    let ds_config = config_result.unwrap_or_default();
    let verify_jobs = verify_result.unwrap_or_else(|e| {
        debug!("PBS {}: verify job listing failed: {}", config.id, e);
        Vec::new()
    });

    // Usage is authoritative for the datastore list; config only adds names
    // that have no usage row yet (freshly created stores)
    let mut store_names: Vec<String> = usage.iter()
        .filter_map(|v| v.get("store").and_then(|s| s.as_str()).map(|s| s.to_string()))
        .collect();
    for v in &ds_config {
        if let Some(name) = v.get("name").and_then(|s| s.as_str()) {
            if !store_names.iter().any(|s| s == name) {
                store_names.push(name.to_string());
            }
        }
    }

    let mut datastores = Vec::new();
    let mut all_runs = Vec::new();
    let mut diagnostics = Vec::new();

    for store in &store_names {
        let ns_list = namespaces::get_namespaces_to_query(&client, store, config, namespace_cache).await;

        let mut snapshots: Vec<SnapshotEntry> = Vec::new();
        for ns in &ns_list {
            match client.list_snapshots(store, ns).await {
                Ok(mut list) => {
                    list.retain(|s| s.backup_time >= cutoff);
                    snapshots.extend(list);
                }
                Err(e) => warn!("PBS {}: snapshot listing failed for {}:{}: {}", config.id, store, ns, e),
            }
        }

        let usage_row = usage.iter().find(|v| {
            v.get("store").and_then(|s| s.as_str()) == Some(store.as_str())
        });
        let total = usage_row.and_then(|v| v.get("total")).and_then(|s| s.as_u64()).unwrap_or(0);
        let used = usage_row.and_then(|v| v.get("used")).and_then(|s| s.as_u64()).unwrap_or(0);
        let available = usage_row.and_then(|v| v.get("avail")).and_then(|s| s.as_u64()).unwrap_or(0);

        // Logical-vs-physical ratio stands in for the dedup factor; PBS does
        // not expose one through the read-only surface we use
        let logical: u64 = snapshots.iter().map(|s| s.size).sum();
        let dedup_factor = if used > 0 { logical as f64 / used as f64 } else { 0.0 };

        let gc_status = tasks.iter()
            .filter(|t| t.worker_type == "garbage_collection" && t.worker_id == *store)
            .max_by_key(|t| t.starttime)
            .map(|t| if t.is_running() { "running".to_string() } else { t.status.clone() })
            .unwrap_or_else(|| "unknown".to_string());

        let store_jobs: Vec<&VerifyJobConfig> = verify_jobs.iter().filter(|j| j.store == *store).collect();
        diagnostics.push(verify::analyze(store, &snapshots, &store_jobs));

        all_runs.extend(backup_runs::synthesize(store, &snapshots, &tasks, cutoff));

        datastores.push(Datastore {
            name: store.clone(),
            total,
            used,
            available,
            gc_status,
            dedup_factor,
            snapshots,
        });
    }

    // Only backup/verify outcomes count toward the health summary
    let counted: Vec<PbsTask> = tasks.iter()
        .filter(|t| t.worker_type == "backup" || t.worker_type == "verify" || t.worker_type == "verificationjob")
        .cloned()
        .collect();
    let task_summary = summarize_tasks(&counted);

    PbsInstance {
        id: config.id.clone(),
        name: display_name,
        host: config.host.clone(),
        status: "online".to_string(),
        message: String::new(),
        version,
        node_name,
        subscription_status,
        datastores,
        tasks,
        task_summary,
        backup_runs: all_runs,
        diagnostics,
    }
}
