//! Endpoint configuration — Proxmox VE and Proxmox Backup Server endpoints
//!
//! Loaded from /etc/wolfpulse/endpoints.json. Each endpoint carries its own
//! API token and TLS policy; PBS endpoints additionally carry namespace
//! selection settings.

use serde::{Deserialize, Serialize};
use tracing::warn;

const ENDPOINTS_CONFIG_FILE: &str = "/etc/wolfpulse/endpoints.json";

/// Days of backup/task history to scan. Overridable via BACKUP_HISTORY_DAYS.
const DEFAULT_BACKUP_HISTORY_DAYS: u64 = 365;

/// A configured Proxmox VE endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PveEndpointConfig {
    pub id: String,
    /// Display name shown for standalone nodes
    #[serde(default)]
    pub name: String,
    /// Host or host:port — https:// and :8006 are assumed when absent
    pub host: String,
    /// Token id, e.g. "monitor@pam!wolfpulse"
    pub token_id: String,
    pub token_secret: String,
    #[serde(default = "default_true")]
    pub allow_self_signed_certs: bool,
}

/// A configured Proxmox Backup Server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbsEndpointConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Host or host:port — https:// and :8007 are assumed when absent
    pub host: String,
    pub token_id: String,
    pub token_secret: String,
    #[serde(default = "default_true")]
    pub allow_self_signed_certs: bool,
    /// Discover namespaces automatically (BFS + common-name probes)
    #[serde(default = "default_true")]
    pub namespace_auto: bool,
    /// Explicit namespace to query when namespace_auto is false ("" = root)
    #[serde(default)]
    pub namespace: String,
    /// Glob patterns; empty list means "include everything not excluded"
    #[serde(default)]
    pub namespace_include: Vec<String>,
    /// Glob patterns; exclude wins over include
    #[serde(default)]
    pub namespace_exclude: Vec<String>,
}

fn default_true() -> bool { true }

/// Top-level configuration for the collector
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PulseConfig {
    #[serde(default)]
    pub pve: Vec<PveEndpointConfig>,
    #[serde(default)]
    pub pbs: Vec<PbsEndpointConfig>,
    /// Cutoff window for snapshot and task history scans
    #[serde(default = "default_history_days")]
    pub backup_history_days: u64,
}

fn default_history_days() -> u64 { DEFAULT_BACKUP_HISTORY_DAYS }

impl PulseConfig {
    /// Load config from disk, or return an empty config if missing/invalid.
    /// BACKUP_HISTORY_DAYS env var overrides the file value.
    pub fn load(path: Option<&str>) -> Self {
        let path = path.unwrap_or(ENDPOINTS_CONFIG_FILE);
        let mut config = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<PulseConfig>(&data) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Invalid endpoints config {}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        if config.backup_history_days == 0 {
            config.backup_history_days = DEFAULT_BACKUP_HISTORY_DAYS;
        }
        if let Ok(days) = std::env::var("BACKUP_HISTORY_DAYS") {
            match days.parse::<u64>() {
                Ok(d) if d > 0 => config.backup_history_days = d,
                _ => warn!("Ignoring invalid BACKUP_HISTORY_DAYS '{}'", days),
            }
        }
        config
    }

    /// Unix timestamp before which snapshots/tasks are ignored
    pub fn history_cutoff(&self, now: i64) -> i64 {
        now - (self.backup_history_days as i64) * 86_400
    }

    /// JSON representation with token secrets masked, for the config API
    pub fn to_masked_json(&self) -> serde_json::Value {
        let pve: Vec<serde_json::Value> = self.pve.iter().map(|e| {
            serde_json::json!({
                "id": e.id,
                "name": e.name,
                "host": e.host,
                "token_id": e.token_id,
                "token_secret": mask_secret(&e.token_secret),
                "allow_self_signed_certs": e.allow_self_signed_certs,
            })
        }).collect();
        let pbs: Vec<serde_json::Value> = self.pbs.iter().map(|e| {
            serde_json::json!({
                "id": e.id,
                "name": e.name,
                "host": e.host,
                "token_id": e.token_id,
                "token_secret": mask_secret(&e.token_secret),
                "allow_self_signed_certs": e.allow_self_signed_certs,
                "namespace_auto": e.namespace_auto,
                "namespace": e.namespace,
                "namespace_include": e.namespace_include,
                "namespace_exclude": e.namespace_exclude,
            })
        }).collect();
        serde_json::json!({
            "pve": pve,
            "pbs": pbs,
            "backup_history_days": self.backup_history_days,
        })
    }
}

fn mask_secret(s: &str) -> String {
    if s.is_empty() { return String::new(); }
    if s.len() <= 8 { return "********".to_string(); }
    format!("{}…{}", &s[..4], &s[s.len()-4..])
}

/// Normalize a configured host into a base URL with scheme and port
pub fn base_url(host: &str, default_port: u16) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    if trimmed.contains(':') {
        format!("https://{}", trimmed)
    } else {
        format!("https://{}:{}", trimmed, default_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_bare_host() {
        assert_eq!(base_url("pve1.lan", 8006), "https://pve1.lan:8006");
        assert_eq!(base_url("backup.lan", 8007), "https://backup.lan:8007");
    }

    #[test]
    fn test_base_url_preserves_explicit_port_and_scheme() {
        assert_eq!(base_url("pve1.lan:443", 8006), "https://pve1.lan:443");
        assert_eq!(base_url("https://pve1.lan:8006/", 8006), "https://pve1.lan:8006");
        assert_eq!(base_url("http://10.0.0.5:8006", 8006), "http://10.0.0.5:8006");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "");
        assert_eq!(mask_secret("short"), "********");
        assert_eq!(mask_secret("0123456789abcdef"), "0123…cdef");
    }

    #[test]
    fn test_history_cutoff() {
        let config = PulseConfig { backup_history_days: 30, ..Default::default() };
        assert_eq!(config.history_cutoff(1_000_000_000), 1_000_000_000 - 30 * 86_400);
    }
}
