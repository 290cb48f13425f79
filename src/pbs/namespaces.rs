//! PBS namespace discovery — breadth-first probing of a datastore's namespace tree
//!
//! PBS has no "list namespaces" call, so the tree is walked by listing
//! backup groups and following any namespace values they carry, plus a
//! speculative probe of common namespace names from the root. Results are
//! cached for 5 minutes per (endpoint, datastore).

use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::config::PbsEndpointConfig;

use super::PbsClient;

/// Hard bound on discovery — a datastore with more namespaces than this
/// gets a truncated (but still useful) view
const MAX_NAMESPACES: usize = 1000;

/// Namespace names worth probing blindly from the root. Best-effort only:
/// namespaces matching none of these and never referenced by a group
/// listing are missed.
const COMMON_NAMESPACES: [&str; 8] = [
    "archive", "backup", "daily", "weekly", "monthly", "prod", "dev", "test",
];

/// Resolve which namespaces to query for a datastore. Explicit configuration
/// short-circuits discovery entirely; otherwise the discovered set is
/// filtered through the endpoint's include/exclude globs.
pub async fn get_namespaces_to_query(
    client: &PbsClient,
    datastore: &str,
    config: &PbsEndpointConfig,
    cache: &TtlCache<String, Vec<String>>,
) -> Vec<String> {
    if !config.namespace_auto {
        let ns = if config.namespace.is_empty() { "root".to_string() } else { config.namespace.clone() };
        return vec![ns];
    }

    let cache_key = format!("{}:{}", client.endpoint_id(), datastore);
    let discovered = match cache.get(&cache_key) {
        Some(list) => list,
        None => {
            let list = discover_namespaces(client, datastore).await;
            cache.insert(cache_key, list.clone());
            list
        }
    };

    filter_namespaces(&discovered, &config.namespace_include, &config.namespace_exclude)
}

/// Walk the namespace tree breadth-first starting at root
async fn discover_namespaces(client: &PbsClient, datastore: &str) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut frontier: VecDeque<String> = VecDeque::new();
    seen.insert(String::new());
    frontier.push_back(String::new());

    // Speculative probes: a 403/404 means the namespace doesn't exist,
    // anything else means it does
    for name in COMMON_NAMESPACES {
        match client.list_groups(datastore, name).await {
            Ok(_) => {
                if seen.insert(name.to_string()) {
                    frontier.push_back(name.to_string());
                }
            }
            Err(e) if e.contains("PBS API 403") || e.contains("PBS API 404") => {
                debug!("PBS namespace probe {}:{} — not present", datastore, name);
            }
            Err(e) => debug!("PBS namespace probe {}:{} failed: {}", datastore, name, e),
        }
    }

    while let Some(ns) = frontier.pop_front() {
        if seen.len() >= MAX_NAMESPACES {
            warn!("PBS namespace discovery for {} hit the {}-namespace bound", datastore, MAX_NAMESPACES);
            break;
        }
        let groups = match client.list_groups(datastore, &ns).await {
            Ok(g) => g,
            Err(e) => {
                debug!("PBS group listing failed for {}:{}: {}", datastore, ns, e);
                continue;
            }
        };
        for group in &groups {
            if let Some(group_ns) = group.get("ns").and_then(|v| v.as_str()) {
                if !group_ns.is_empty() && seen.insert(group_ns.to_string()) {
                    frontier.push_back(group_ns.to_string());
                }
            }
        }
    }

    // Root is presented as "root" everywhere outside the query layer
    let mut result: Vec<String> = seen.into_iter()
        .map(|ns| if ns.is_empty() { "root".to_string() } else { ns })
        .collect();
    result.sort();
    result
}

/// Apply include/exclude glob patterns. Exclude wins over include; an empty
/// include list means "include everything not excluded". Patterns that fail
/// to parse are ignored.
pub fn filter_namespaces(namespaces: &[String], include: &[String], exclude: &[String]) -> Vec<String> {
    let include_patterns: Vec<glob::Pattern> = include.iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();
    let exclude_patterns: Vec<glob::Pattern> = exclude.iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    namespaces.iter()
        .filter(|ns| !exclude_patterns.iter().any(|p| p.matches(ns)))
        .filter(|ns| include_patterns.is_empty() || include_patterns.iter().any(|p| p.matches(ns)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_include_filter() {
        let all = names(&["root", "archive", "prod-archive"]);
        let out = filter_namespaces(&all, &names(&["archive"]), &[]);
        assert_eq!(out, names(&["archive"]));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let all = names(&["root", "archive", "prod-archive"]);
        let out = filter_namespaces(&all, &[], &names(&["prod-*"]));
        assert_eq!(out, names(&["root", "archive"]));

        // even an explicit include can't rescue an excluded namespace
        let out = filter_namespaces(&all, &names(&["prod-archive"]), &names(&["prod-*"]));
        assert!(out.is_empty());
    }

    #[test]
    fn test_empty_filters_include_everything() {
        let all = names(&["root", "daily", "weekly"]);
        assert_eq!(filter_namespaces(&all, &[], &[]), all);
    }

    #[test]
    fn test_invalid_pattern_ignored() {
        let all = names(&["root", "archive"]);
        // "[" is not a valid glob; the filter falls back to including all
        assert_eq!(filter_namespaces(&all, &names(&["["]), &[]), all);
    }
}
