//! REST API — read-only hand-off surface for the display layer
//!
//! Serves the latest aggregate snapshot and metrics. Contains no discovery
//! or merge logic; everything here is a view over state the background
//! cycles produced.

use actix_web::{web, HttpResponse};
use std::sync::{Arc, RwLock};

use crate::config::PulseConfig;
use crate::discovery::{AggregateSnapshot, DiscoveryState, GuestMetrics};

/// Shared application state
pub struct AppState {
    pub config: Arc<PulseConfig>,
    pub discovery: Arc<DiscoveryState>,
    /// Latest completed discovery cycle, None until the first one finishes
    pub snapshot: RwLock<Option<AggregateSnapshot>>,
    /// Latest metrics cycle output
    pub metrics: RwLock<Vec<GuestMetrics>>,
    /// Duration of the last discovery cycle in seconds
    pub last_cycle_secs: RwLock<Option<f32>>,
}

impl AppState {
    pub fn new(config: Arc<PulseConfig>, discovery: Arc<DiscoveryState>) -> Self {
        Self {
            config,
            discovery,
            snapshot: RwLock::new(None),
            metrics: RwLock::new(Vec::new()),
            last_cycle_secs: RwLock::new(None),
        }
    }
}

/// GET /api/state — the full aggregate snapshot
pub async fn get_state(state: web::Data<AppState>) -> HttpResponse {
    match &*state.snapshot.read().unwrap() {
        Some(snapshot) => HttpResponse::Ok().json(snapshot),
        None => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "error": "No discovery cycle has completed yet"
        })),
    }
}

/// GET /api/nodes — merged node list
pub async fn get_nodes(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.snapshot.read().unwrap();
    let nodes = snapshot.as_ref().map(|s| s.nodes.clone()).unwrap_or_default();
    HttpResponse::Ok().json(nodes)
}

/// GET /api/guests — merged VMs and containers
pub async fn get_guests(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.snapshot.read().unwrap();
    let (vms, containers) = snapshot.as_ref()
        .map(|s| (s.vms.clone(), s.containers.clone()))
        .unwrap_or_default();
    HttpResponse::Ok().json(serde_json::json!({
        "vms": vms,
        "containers": containers,
    }))
}

/// GET /api/pbs — PBS instances with datastores, runs, and diagnostics
pub async fn get_pbs(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.snapshot.read().unwrap();
    let pbs = snapshot.as_ref().map(|s| s.pbs.clone()).unwrap_or_default();
    HttpResponse::Ok().json(pbs)
}

/// GET /api/backups — PVE-side backup data plus the cross-instance task view
pub async fn get_backups(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.snapshot.read().unwrap();
    match snapshot.as_ref() {
        Some(s) => HttpResponse::Ok().json(serde_json::json!({
            "pve_backups": s.pve_backups,
            "all_pbs_tasks": s.all_pbs_tasks,
            "pbs_task_summary": s.pbs_task_summary,
        })),
        None => HttpResponse::Ok().json(serde_json::json!({
            "pve_backups": crate::discovery::PveBackups::default(),
            "all_pbs_tasks": [],
            "pbs_task_summary": crate::pbs::PbsTaskSummary::default(),
        })),
    }
}

/// GET /api/metrics — latest per-guest metrics
pub async fn get_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.read().unwrap().clone();
    HttpResponse::Ok().json(metrics)
}

/// GET /api/health — liveness plus last-cycle timing
pub async fn get_health(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.snapshot.read().unwrap();
    let last_cycle = *state.last_cycle_secs.read().unwrap();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "last_discovery": snapshot.as_ref().map(|s| s.timestamp),
        "last_cycle_secs": last_cycle,
    }))
}

/// GET /api/config — configured endpoints with secrets masked
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.config.to_masked_json())
}

/// Register all API routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/state", web::get().to(get_state))
        .route("/api/nodes", web::get().to(get_nodes))
        .route("/api/guests", web::get().to(get_guests))
        .route("/api/pbs", web::get().to(get_pbs))
        .route("/api/backups", web::get().to(get_backups))
        .route("/api/metrics", web::get().to(get_metrics))
        .route("/api/health", web::get().to(get_health))
        .route("/api/config", web::get().to(get_config));
}
