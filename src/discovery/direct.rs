// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Direct node connections
//!
//! Node-local (non-shared) storage is invisible through cluster-wide
//! routing, so a short-timeout connection is opened straight to the node's
//! IP. Connections are probed before caching; a failed probe is discarded,
//! never cached.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::TtlCache;
use crate::config::PveEndpointConfig;
use crate::proxmox::{Node, NodeStorage, PveClient};

const DIRECT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const DIRECT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
const DIRECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Get (or open) a direct connection to a node. Returns None when the node
/// IP is unknown or the connectivity probe fails.
pub async fn get_direct_connection(
    node: &Node,
    config: &PveEndpointConfig,
    cache: &TtlCache<String, Arc<PveClient>>,
) -> Option<Arc<PveClient>> {
    let ip = node.source_ip.as_deref()?;
    let key = format!("{}:{}", node.name, config.id);

    if let Some(client) = cache.get(&key) {
        return Some(client);
    }

    let client = Arc::new(PveClient::with_base_url(
        &config.id,
        &format!("https://{}:8006", ip),
        &config.token_id,
        &config.token_secret,
        config.allow_self_signed_certs,
        Some(DIRECT_REQUEST_TIMEOUT),
    ));

    // Probe before caching — racing the version call against a short
    // deadline keeps a dead node from stalling the storage pass
    match tokio::time::timeout(DIRECT_PROBE_TIMEOUT, client.test_connection(DIRECT_PROBE_TIMEOUT)).await {
        Ok(Ok(_)) => {
            cache.insert(key, client.clone());
            Some(client)
        }
        Ok(Err(e)) => {
            debug!("Direct connection to {} ({}) failed probe: {}", node.name, ip, e);
            None
        }
        Err(_) => {
            debug!("Direct connection to {} ({}) probe timed out", node.name, ip);
            None
        }
    }
}

/// Read a node's storage through a direct connection, with a single retry.
/// Direct connections are the one place transient failures are retried:
/// the target is a single host, not a cluster that can fail over for us.
pub async fn direct_node_storage(client: &PveClient, node: &str) -> Result<Vec<NodeStorage>, String> {
    match client.node_storage(node).await {
        Ok(list) => Ok(list),
        Err(first) => {
            tokio::time::sleep(DIRECT_RETRY_DELAY).await;
            client.node_storage(node).await
                .map_err(|second| format!("{} (retry: {})", first, second))
        }
    }
}

/// Refresh the non-shared rows of a node's storage list via a direct
/// connection. Rows the direct view doesn't report are left untouched.
pub fn merge_direct_storage(storage: &mut [NodeStorage], direct: Vec<NodeStorage>) {
    for row in storage.iter_mut() {
        if row.shared != 0 {
            continue;
        }
        if let Some(fresh) = direct.iter().find(|d| d.storage == row.storage) {
            row.total = fresh.total;
            row.used = fresh.used;
            row.avail = fresh.avail;
            row.active = fresh.active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(name: &str, shared: u64, used: u64) -> NodeStorage {
        NodeStorage {
            storage: name.to_string(),
            storage_type: "dir".to_string(),
            content: "backup,images".to_string(),
            total: 1000,
            used,
            avail: 1000 - used,
            shared,
            active: true,
        }
    }

    #[test]
    fn test_merge_refreshes_only_non_shared_rows() {
        let mut rows = vec![storage("local", 0, 10), storage("ceph", 1, 10)];
        let direct = vec![storage("local", 0, 700), storage("ceph", 1, 900)];
        merge_direct_storage(&mut rows, direct);
        assert_eq!(rows[0].used, 700);
        // shared storage keeps the cluster-routed value
        assert_eq!(rows[1].used, 10);
    }

    #[test]
    fn test_merge_leaves_unreported_rows_alone() {
        let mut rows = vec![storage("local", 0, 10)];
        merge_direct_storage(&mut rows, vec![storage("other", 0, 500)]);
        assert_eq!(rows[0].used, 10);
    }
}
