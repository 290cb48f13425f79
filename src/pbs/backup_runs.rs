// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Synthetic backup-run reconstruction
//!
//! PBS's task log is an incomplete backup history: it retains a limited
//! window and doesn't reliably attribute namespaces. Snapshots are ground
//! truth for "a backup of this guest exists for this day"; admin tasks are
//! ground truth for exact timing and outcome. One run record is built per
//! (day, datastore, namespace, guest) from snapshots, enhanced with a
//! matching real task when one exists, and failed tasks that produced no
//! snapshot at all are folded in as explicit failure records.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::{PbsTask, SnapshotEntry};

/// One backup job run for one guest on one calendar day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    /// Unique key: "day:datastore:namespace:type:id"
    pub id: String,
    pub datastore: String,
    pub namespace: String,
    pub backup_type: String,   // "vm", "ct", "host"
    pub backup_id: String,
    /// UTC calendar day of the run, "YYYY-MM-DD"
    pub day: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: String,
    pub exitcode: Option<i64>,
    /// UPID of the real admin task backing this run, when one was matched
    pub upid: Option<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub node: String,
    /// Snapshots observed for this guest on this day
    pub snapshot_count: u32,
    /// True when timing/outcome were taken from a real admin task
    pub enhanced_with_real_task: bool,
    /// True for runs synthesized from a failed task with no snapshot
    pub failed_attempt: bool,
}

/// UTC calendar date of an epoch timestamp
pub fn utc_day(epoch: i64) -> String {
    match Utc.timestamp_opt(epoch, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => "1970-01-01".to_string(),
    }
}

/// Reconstruct backup runs for one datastore from its snapshots and the
/// instance's admin task list. Idempotent: repeated snapshot listings and
/// overlapping task windows collapse to the same run set.
pub fn synthesize(
    datastore: &str,
    snapshots: &[SnapshotEntry],
    tasks: &[PbsTask],
    cutoff: i64,
) -> Vec<BackupRun> {
    // ── Pass 1: one run per (day, namespace, type, id), latest snapshot wins ──
    let mut day_groups: HashMap<String, (SnapshotEntry, u32)> = HashMap::new();
    for snap in snapshots {
        if snap.backup_time < cutoff || snap.backup_type.is_empty() || snap.backup_id.is_empty() {
            continue;
        }
        let key = format!(
            "{}:{}:{}:{}:{}",
            utc_day(snap.backup_time), datastore, snap.namespace, snap.backup_type, snap.backup_id
        );
        match day_groups.get_mut(&key) {
            Some((best, count)) => {
                *count += 1;
                if snap.backup_time > best.backup_time {
                    *best = snap.clone();
                }
            }
            None => {
                day_groups.insert(key, (snap.clone(), 1));
            }
        }
    }

    let mut runs: Vec<BackupRun> = day_groups.into_iter()
        .map(|(key, (snap, count))| BackupRun {
            id: key,
            datastore: datastore.to_string(),
            namespace: snap.namespace.clone(),
            backup_type: snap.backup_type.clone(),
            backup_id: snap.backup_id.clone(),
            day: utc_day(snap.backup_time),
            start_time: snap.backup_time,
            end_time: None,
            status: "OK".to_string(),
            exitcode: Some(0),
            upid: None,
            user: snap.owner.clone(),
            node: String::new(),
            snapshot_count: count,
            enhanced_with_real_task: false,
            failed_attempt: false,
        })
        .collect();
    // Deterministic order regardless of map iteration
    runs.sort_by(|a, b| a.id.cmp(&b.id));

    // ── Pass 2: enhance with real backup tasks ──
    // Task key omits the namespace — the task log doesn't attribute it
    let mut task_index: HashMap<String, Vec<&PbsTask>> = HashMap::new();
    for task in tasks {
        if task.worker_type != "backup" || task.starttime < cutoff {
            continue;
        }
        if let Some((store, backup_type, backup_id)) = parse_worker_id(&task.worker_id) {
            if store != datastore {
                continue;
            }
            let key = format!("{}:{}:{}:{}", utc_day(task.starttime), store, backup_type, backup_id);
            task_index.entry(key).or_default().push(task);
        }
    }
    // Successful tasks first, then newest — so the task that actually
    // produced the snapshot is preferred over an earlier failed attempt
    for candidates in task_index.values_mut() {
        candidates.sort_by(|a, b| b.is_ok().cmp(&a.is_ok())
            .then(b.starttime.cmp(&a.starttime)));
    }

    let mut used_upids: HashSet<String> = HashSet::new();
    for run in runs.iter_mut() {
        let task_key = format!("{}:{}:{}:{}", run.day, run.datastore, run.backup_type, run.backup_id);
        let Some(candidates) = task_index.get(&task_key) else { continue };
        let Some(task) = candidates.iter().find(|t| !used_upids.contains(&t.upid)) else { continue };

        run.start_time = task.starttime;
        run.end_time = task.endtime;
        run.status = if task.is_running() { "running".to_string() } else { task.status.clone() };
        run.exitcode = task_exitcode(task);
        run.user = task.user.clone();
        run.node = task.node.clone();
        run.upid = Some(task.upid.clone());
        run.enhanced_with_real_task = true;
        used_upids.insert(task.upid.clone());
    }

    // ── Pass 3: residual failed tasks that produced no snapshot ──
    let existing_keys: HashSet<String> = runs.iter().map(|r| r.id.clone()).collect();
    for task in tasks {
        if task.worker_type != "backup" || task.starttime < cutoff {
            continue;
        }
        if used_upids.contains(&task.upid) || task.is_running() || task.is_ok() {
            continue;
        }
        let Some((store, backup_type, backup_id)) = parse_worker_id(&task.worker_id) else { continue };
        if store != datastore {
            continue;
        }
        let day = utc_day(task.starttime);
        // The task log gives no namespace; failed attempts land in root
        let key = format!("{}:{}:root:{}:{}", day, store, backup_type, backup_id);
        if existing_keys.contains(&key) {
            continue;
        }
        runs.push(BackupRun {
            id: key,
            datastore: store.to_string(),
            namespace: "root".to_string(),
            backup_type: backup_type.to_string(),
            backup_id: backup_id.to_string(),
            day,
            start_time: task.starttime,
            end_time: task.endtime,
            status: task.status.clone(),
            exitcode: task_exitcode(task),
            upid: Some(task.upid.clone()),
            user: task.user.clone(),
            node: task.node.clone(),
            snapshot_count: 0,
            enhanced_with_real_task: false,
            failed_attempt: true,
        });
    }

    // ── Final dedup by UPID (synthetic runs fall back to a composite key) ──
    let mut seen: HashSet<String> = HashSet::new();
    runs.retain(|run| {
        let key = match &run.upid {
            Some(upid) => upid.clone(),
            None => format!("{}-{}-{}-{}/{}",
                run.backup_type, run.node, run.start_time, run.backup_type, run.backup_id),
        };
        seen.insert(key)
    });

    runs
}

/// Split a backup task's worker_id, format "datastore:type/id"
fn parse_worker_id(worker_id: &str) -> Option<(&str, &str, &str)> {
    let (store, group) = worker_id.split_once(':')?;
    let (backup_type, backup_id) = group.split_once('/')?;
    if store.is_empty() || backup_type.is_empty() || backup_id.is_empty() {
        return None;
    }
    Some((store, backup_type, backup_id))
}

fn task_exitcode(task: &PbsTask) -> Option<i64> {
    if task.is_running() {
        None
    } else if task.is_ok() {
        Some(0)
    } else {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(backup_id: &str, namespace: &str, backup_time: i64) -> SnapshotEntry {
        SnapshotEntry {
            backup_type: "vm".to_string(),
            backup_id: backup_id.to_string(),
            backup_time,
            namespace: namespace.to_string(),
            verification: None,
            size: 1024,
            protected: false,
            comment: String::new(),
            owner: "backup@pbs".to_string(),
        }
    }

    fn backup_task(upid: &str, worker_id: &str, starttime: i64, status: &str) -> PbsTask {
        PbsTask {
            upid: upid.to_string(),
            node: "pbs1".to_string(),
            worker_type: "backup".to_string(),
            worker_id: worker_id.to_string(),
            starttime,
            endtime: if status.is_empty() { None } else { Some(starttime + 120) },
            status: status.to_string(),
            user: "root@pam".to_string(),
        }
    }

    const DAY: i64 = 86_400;

    #[test]
    fn test_one_run_per_day() {
        // 9 daily snapshots over 9 distinct days yields exactly 9 runs
        let snapshots: Vec<SnapshotEntry> = (0..9)
            .map(|i| snapshot("100", "root", 1_700_000_000 + i * DAY))
            .collect();
        let runs = synthesize("main", &snapshots, &[], 0);
        assert_eq!(runs.len(), 9);
        let days: HashSet<&str> = runs.iter().map(|r| r.day.as_str()).collect();
        assert_eq!(days.len(), 9);
        assert!(runs.iter().all(|r| !r.enhanced_with_real_task));
    }

    #[test]
    fn test_latest_snapshot_represents_the_day() {
        // two snapshots on the same UTC day: the later one is the representative
        let base = 1_700_000_000 - (1_700_000_000 % DAY); // midnight
        let snapshots = vec![
            snapshot("100", "root", base + 3600),
            snapshot("100", "root", base + 7200),
        ];
        let runs = synthesize("main", &snapshots, &[], 0);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_time, base + 7200);
        assert_eq!(runs[0].snapshot_count, 2);
    }

    #[test]
    fn test_run_keys_unique() {
        let base = 1_700_000_000;
        let snapshots = vec![
            snapshot("100", "root", base),
            snapshot("100", "root", base + 60),
            snapshot("100", "prod", base),
            snapshot("101", "root", base),
        ];
        let runs = synthesize("main", &snapshots, &[], 0);
        let keys: HashSet<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(keys.len(), runs.len());
    }

    #[test]
    fn test_enhancement_with_matching_task() {
        let base = 1_700_000_000 - (1_700_000_000 % DAY);
        let snapshots: Vec<SnapshotEntry> = (0..9)
            .map(|i| snapshot("100", "root", base + i * DAY))
            .collect();
        // real task matching day 5's snapshot
        let task = backup_task("UPID:pbs1:000001:0:1:aa:backup:main\\x3avm/100:root@pam:",
            "main:vm/100", base + 5 * DAY + 30, "OK");
        let runs = synthesize("main", &snapshots, &[task], 0);
        assert_eq!(runs.len(), 9);
        let enhanced: Vec<&BackupRun> = runs.iter().filter(|r| r.enhanced_with_real_task).collect();
        assert_eq!(enhanced.len(), 1);
        assert_eq!(enhanced[0].day, utc_day(base + 5 * DAY));
        assert_eq!(enhanced[0].status, "OK");
        assert_eq!(enhanced[0].exitcode, Some(0));
        assert!(enhanced[0].upid.is_some());
    }

    #[test]
    fn test_task_upid_consumed_at_most_once() {
        // two namespaces produce two synthetic runs with the same task key;
        // the single real task may enhance only one of them
        let base = 1_700_000_000;
        let snapshots = vec![
            snapshot("100", "root", base),
            snapshot("100", "prod", base),
        ];
        let task = backup_task("UPID:pbs1:000002:0:1:bb:backup:x:root@pam:",
            "main:vm/100", base, "OK");
        let runs = synthesize("main", &snapshots, &[task], 0);
        let enhanced: Vec<&BackupRun> = runs.iter().filter(|r| r.enhanced_with_real_task).collect();
        assert_eq!(enhanced.len(), 1);
        let upids: Vec<&String> = runs.iter().filter_map(|r| r.upid.as_ref()).collect();
        assert_eq!(upids.len(), 1);
    }

    #[test]
    fn test_residual_failed_task_becomes_failure_run() {
        // a failed task with no snapshot at all surfaces as its own record
        let base = 1_700_000_000;
        let task = backup_task("UPID:pbs1:000003:0:1:cc:backup:y:root@pam:",
            "main:vm/200", base, "TASK ERROR: connection refused");
        let runs = synthesize("main", &[], &[task], 0);
        assert_eq!(runs.len(), 1);
        assert!(runs[0].failed_attempt);
        assert_eq!(runs[0].backup_id, "200");
        assert_eq!(runs[0].status, "TASK ERROR: connection refused");
        assert_eq!(runs[0].exitcode, Some(1));
    }

    #[test]
    fn test_successful_unused_task_is_not_residual() {
        // an OK task with no snapshot (e.g. pruned moments later) is dropped,
        // not reported as a failure
        let base = 1_700_000_000;
        let task = backup_task("UPID:pbs1:000004:0:1:dd:backup:z:root@pam:",
            "main:vm/300", base, "OK");
        let runs = synthesize("main", &[], &[task], 0);
        assert!(runs.is_empty());
    }

    #[test]
    fn test_synthesis_idempotent_under_repeated_listings() {
        let base = 1_700_000_000;
        let mut snapshots = vec![snapshot("100", "root", base)];
        snapshots.extend(snapshots.clone()); // duplicated listing
        let task = backup_task("UPID:pbs1:000005:0:1:ee:backup:w:root@pam:",
            "main:vm/100", base, "OK");
        let once = synthesize("main", &snapshots, &[task.clone()], 0);
        assert_eq!(once.len(), 1);
        // same inputs again produce the identical run set
        let twice = synthesize("main", &snapshots, &[task], 0);
        assert_eq!(once.len(), twice.len());
        assert_eq!(once[0].id, twice[0].id);
        assert_eq!(once[0].upid, twice[0].upid);
    }

    #[test]
    fn test_cutoff_excludes_old_snapshots_and_tasks() {
        let cutoff = 1_700_000_000;
        let snapshots = vec![
            snapshot("100", "root", cutoff - DAY),
            snapshot("100", "root", cutoff + DAY),
        ];
        let old_task = backup_task("UPID:pbs1:000006:0:1:ff:backup:v:root@pam:",
            "main:vm/400", cutoff - DAY, "TASK ERROR: disk full");
        let runs = synthesize("main", &snapshots, &[old_task], cutoff);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].day, utc_day(cutoff + DAY));
    }

    #[test]
    fn test_parse_worker_id() {
        assert_eq!(parse_worker_id("main:vm/100"), Some(("main", "vm", "100")));
        assert_eq!(parse_worker_id("store:ct/42"), Some(("store", "ct", "42")));
        assert_eq!(parse_worker_id("garbage"), None);
        assert_eq!(parse_worker_id("store:novm"), None);
        assert_eq!(parse_worker_id(":vm/100"), None);
    }

    #[test]
    fn test_utc_day_bucketing() {
        assert_eq!(utc_day(0), "1970-01-01");
        assert_eq!(utc_day(86_399), "1970-01-01");
        assert_eq!(utc_day(86_400), "1970-01-02");
    }
}
