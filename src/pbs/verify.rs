// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Backup verification diagnostics
//!
//! Scores each datastore's verification coverage, spots references to
//! verification jobs that no longer exist in configuration (benign after a
//! job is deleted), and turns recent failures into actionable
//! recommendations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{SnapshotEntry, VerifyJobConfig};

const RECENT_FAILURE_WINDOW_SECS: i64 = 7 * 86_400;

/// Datastore verification health, from coverage and failure rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthScore {
    Excellent,
    Good,
    Fair,
    Poor,
    Error,
}

/// A verification failure within the recent window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentFailure {
    pub backup_type: String,
    pub backup_id: String,
    pub namespace: String,
    pub backup_time: i64,
    pub state: String,
    /// Coarse failure class matched from the state string
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: String,      // "high" or "info"
    pub message: String,
}

/// Verification health report for one datastore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationDiagnostics {
    pub datastore: String,
    pub health_score: HealthScore,
    pub total_snapshots: u64,
    pub verified_count: u64,
    pub failed_count: u64,
    /// Verification job ids referenced by snapshot metadata
    pub referenced_job_ids: Vec<String>,
    /// Referenced job ids with no matching configured job
    pub stale_references: Vec<String>,
    pub recent_failures: Vec<RecentFailure>,
    pub recommendations: Vec<Recommendation>,
}

/// Analyze a datastore's snapshots against its configured verification jobs
pub fn analyze(
    datastore: &str,
    snapshots: &[SnapshotEntry],
    configured_jobs: &[&VerifyJobConfig],
) -> VerificationDiagnostics {
    analyze_at(chrono::Utc::now().timestamp(), datastore, snapshots, configured_jobs)
}

fn analyze_at(
    now: i64,
    datastore: &str,
    snapshots: &[SnapshotEntry],
    configured_jobs: &[&VerifyJobConfig],
) -> VerificationDiagnostics {
    let total = snapshots.len() as u64;
    let verified = snapshots.iter().filter(|s| s.verification.is_some()).count() as u64;
    let failed = snapshots.iter()
        .filter(|s| s.verification.as_ref().is_some_and(|v| v.state != "ok"))
        .count() as u64;

    let health_score = score(total, verified, failed);

    // Job ids referenced inside snapshot verification UPIDs
    let referenced: BTreeSet<String> = snapshots.iter()
        .filter_map(|s| s.verification.as_ref())
        .filter_map(|v| parse_verification_job_id(&v.upid))
        .collect();
    let configured: BTreeSet<&str> = configured_jobs.iter().map(|j| j.id.as_str()).collect();
    let stale: Vec<String> = referenced.iter()
        .filter(|id| !configured.contains(id.as_str()))
        .cloned()
        .collect();

    let mut recent_failures: Vec<RecentFailure> = snapshots.iter()
        .filter(|s| s.backup_time >= now - RECENT_FAILURE_WINDOW_SECS)
        .filter_map(|s| {
            let v = s.verification.as_ref()?;
            if v.state == "ok" { return None; }
            Some(RecentFailure {
                backup_type: s.backup_type.clone(),
                backup_id: s.backup_id.clone(),
                namespace: s.namespace.clone(),
                backup_time: s.backup_time,
                state: v.state.clone(),
                category: categorize_failure(&v.state).to_string(),
            })
        })
        .collect();
    recent_failures.sort_by(|a, b| b.backup_time.cmp(&a.backup_time));

    let mut recommendations = Vec::new();

    // A job that snapshots reference but which is now disabled means
    // verification silently stopped for backups it used to cover
    let disabled_with_history: Vec<&str> = configured_jobs.iter()
        .filter(|j| j.disabled && referenced.contains(&j.id))
        .map(|j| j.id.as_str())
        .collect();
    if !disabled_with_history.is_empty() {
        recommendations.push(Recommendation {
            priority: "high".to_string(),
            message: format!(
                "Verification job(s) {} are disabled but have verification history on '{}' — re-enable them or snapshots will age out unverified",
                disabled_with_history.join(", "), datastore
            ),
        });
    }
    if health_score == HealthScore::Poor {
        recommendations.push(Recommendation {
            priority: "high".to_string(),
            message: format!(
                "Verification coverage on '{}' is poor ({}/{} snapshots verified) — check that a verification job covers this datastore",
                datastore, verified, total
            ),
        });
    }
    if recent_failures.len() > 5 {
        recommendations.push(Recommendation {
            priority: "high".to_string(),
            message: format!(
                "{} verification failures on '{}' in the last 7 days — inspect the datastore for corruption or connectivity problems",
                recent_failures.len(), datastore
            ),
        });
    }
    if !stale.is_empty() {
        // Expected after a job is deleted; harmless
        recommendations.push(Recommendation {
            priority: "info".to_string(),
            message: format!(
                "Snapshots on '{}' reference verification job(s) {} that no longer exist — these references disappear as old snapshots are pruned",
                datastore, stale.join(", ")
            ),
        });
    }
    if total > 0 && verified < total && health_score != HealthScore::Poor {
        recommendations.push(Recommendation {
            priority: "info".to_string(),
            message: format!(
                "{} of {} snapshots on '{}' have not been verified yet",
                total - verified, total, datastore
            ),
        });
    }

    VerificationDiagnostics {
        datastore: datastore.to_string(),
        health_score,
        total_snapshots: total,
        verified_count: verified,
        failed_count: failed,
        referenced_job_ids: referenced.into_iter().collect(),
        stale_references: stale,
        recent_failures,
        recommendations,
    }
}

/// Fixed thresholds on verification rate and failure rate
fn score(total: u64, verified: u64, failed: u64) -> HealthScore {
    if total == 0 {
        return HealthScore::Error;
    }
    let rate = verified as f64 / total as f64;
    let failure = if verified > 0 { failed as f64 / verified as f64 } else { 0.0 };
    if rate >= 0.95 && failure <= 0.01 {
        HealthScore::Excellent
    } else if rate >= 0.8 && failure <= 0.05 {
        HealthScore::Good
    } else if rate >= 0.6 && failure <= 0.1 {
        HealthScore::Fair
    } else {
        HealthScore::Poor
    }
}

/// Extract the verification job id embedded in a task UPID.
///
/// Grammar: `UPID:node:pid:pstart:starttime:hex:type:encoded-id:user:`
/// The id segment hex-escapes separator characters (`\x3a` for ':'); the
/// job id is whatever follows the last colon after decoding. Malformed
/// input yields None, never an error.
pub fn parse_verification_job_id(upid: &str) -> Option<String> {
    let parts: Vec<&str> = upid.split(':').collect();
    if parts.len() < 9 || parts[0] != "UPID" {
        return None;
    }
    let decoded = decode_hex_escapes(parts[7]);
    let job_id = decoded.rsplit(':').next().unwrap_or("").to_string();
    if job_id.is_empty() {
        None
    } else {
        Some(job_id)
    }
}

/// Decode `\xNN` escapes; invalid escapes are kept verbatim
fn decode_hex_escapes(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x'
            && bytes[i + 2].is_ascii_hexdigit() && bytes[i + 3].is_ascii_hexdigit()
        {
            if let Ok(decoded) = hex::decode(&s[i + 2..i + 4]) {
                out.extend_from_slice(&decoded);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Match a verification failure state against known patterns
fn categorize_failure(state: &str) -> &'static str {
    let lower = state.to_lowercase();
    if lower.contains("missing") || lower.contains("not found") {
        "missing"
    } else if lower.contains("corrupt") || lower.contains("checksum") {
        "corruption"
    } else if lower.contains("timeout") || lower.contains("connection") {
        "connectivity"
    } else if lower.contains("permission") || lower.contains("access") {
        "permission"
    } else if lower.contains("space") || lower.contains("disk") {
        "storage"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pbs::VerificationInfo;

    const NOW: i64 = 1_700_000_000;

    fn snapshot(backup_id: &str, backup_time: i64, verification: Option<(&str, &str)>) -> SnapshotEntry {
        SnapshotEntry {
            backup_type: "vm".to_string(),
            backup_id: backup_id.to_string(),
            backup_time,
            namespace: "root".to_string(),
            verification: verification.map(|(state, upid)| VerificationInfo {
                state: state.to_string(),
                upid: upid.to_string(),
            }),
            size: 1024,
            protected: false,
            comment: String::new(),
            owner: String::new(),
        }
    }

    const VERIFY_UPID: &str = "UPID:pbs1:00001234:00000001:00000002:65a1b2c3:verificationjob:main\\x3av\\x2d4fa9c1:root@pam:";

    #[test]
    fn test_score_thresholds() {
        // 96/100 verified, 0 failed -> excellent
        assert_eq!(score(100, 96, 0), HealthScore::Excellent);
        // 70/100 verified, 5 failed -> fair
        assert_eq!(score(100, 70, 5), HealthScore::Fair);
        assert_eq!(score(100, 85, 2), HealthScore::Good);
        assert_eq!(score(100, 50, 0), HealthScore::Poor);
        assert_eq!(score(100, 96, 5), HealthScore::Poor);
        assert_eq!(score(0, 0, 0), HealthScore::Error);
    }

    #[test]
    fn test_parse_verification_job_id() {
        // encoded id "main\x3av\x2d4fa9c1" decodes to "main:v-4fa9c1"
        assert_eq!(parse_verification_job_id(VERIFY_UPID), Some("v-4fa9c1".to_string()));
    }

    #[test]
    fn test_parse_job_id_malformed_inputs() {
        assert_eq!(parse_verification_job_id(""), None);
        assert_eq!(parse_verification_job_id("not-a-upid"), None);
        assert_eq!(parse_verification_job_id("UPID:short:1:2"), None);
        // invalid hex escape is kept verbatim rather than failing
        let weird = "UPID:n:1:2:3:4:verificationjob:job\\xZZid:user:";
        assert_eq!(parse_verification_job_id(weird), Some("job\\xZZid".to_string()));
    }

    #[test]
    fn test_stale_reference_is_info_not_error() {
        let snapshots = vec![snapshot("100", NOW - 3600, Some(("ok", VERIFY_UPID)))];
        let diag = analyze_at(NOW, "main", &snapshots, &[]);
        assert_eq!(diag.stale_references, vec!["v-4fa9c1".to_string()]);
        // stale references must surface as informational, never high priority
        let stale_recs: Vec<&Recommendation> = diag.recommendations.iter()
            .filter(|r| r.message.contains("no longer exist"))
            .collect();
        assert_eq!(stale_recs.len(), 1);
        assert_eq!(stale_recs[0].priority, "info");
    }

    #[test]
    fn test_configured_job_is_not_stale() {
        let job = VerifyJobConfig {
            id: "v-4fa9c1".to_string(),
            store: "main".to_string(),
            schedule: "daily".to_string(),
            disabled: false,
        };
        let snapshots = vec![snapshot("100", NOW - 3600, Some(("ok", VERIFY_UPID)))];
        let diag = analyze_at(NOW, "main", &snapshots, &[&job]);
        assert!(diag.stale_references.is_empty());
        assert_eq!(diag.referenced_job_ids, vec!["v-4fa9c1".to_string()]);
    }

    #[test]
    fn test_disabled_job_with_history_is_high_priority() {
        let job = VerifyJobConfig {
            id: "v-4fa9c1".to_string(),
            store: "main".to_string(),
            schedule: "daily".to_string(),
            disabled: true,
        };
        let snapshots = vec![snapshot("100", NOW - 3600, Some(("ok", VERIFY_UPID)))];
        let diag = analyze_at(NOW, "main", &snapshots, &[&job]);
        assert!(diag.recommendations.iter().any(|r| r.priority == "high" && r.message.contains("disabled")));
    }

    #[test]
    fn test_recent_failures_categorized_and_windowed() {
        let snapshots = vec![
            snapshot("100", NOW - 3600, Some(("failed: chunk missing", VERIFY_UPID))),
            snapshot("101", NOW - 3600, Some(("failed: checksum mismatch", VERIFY_UPID))),
            snapshot("102", NOW - 3600, Some(("failed: connection timeout", VERIFY_UPID))),
            // outside the 7-day window
            snapshot("103", NOW - 8 * 86_400, Some(("failed: checksum mismatch", VERIFY_UPID))),
        ];
        let diag = analyze_at(NOW, "main", &snapshots, &[]);
        assert_eq!(diag.recent_failures.len(), 3);
        let categories: Vec<&str> = diag.recent_failures.iter().map(|f| f.category.as_str()).collect();
        assert!(categories.contains(&"missing"));
        assert!(categories.contains(&"corruption"));
        assert!(categories.contains(&"connectivity"));
    }

    #[test]
    fn test_categorize_failure() {
        assert_eq!(categorize_failure("chunk not found"), "missing");
        assert_eq!(categorize_failure("permission denied"), "permission");
        assert_eq!(categorize_failure("no space left on device"), "storage");
        assert_eq!(categorize_failure("something else entirely"), "unknown");
    }

    #[test]
    fn test_many_recent_failures_is_high_priority() {
        let snapshots: Vec<SnapshotEntry> = (0..10)
            .map(|i| snapshot(&format!("{}", 100 + i), NOW - 3600, Some(("failed: checksum", VERIFY_UPID))))
            .collect();
        let diag = analyze_at(NOW, "main", &snapshots, &[]);
        assert!(diag.recommendations.iter().any(|r| r.priority == "high" && r.message.contains("last 7 days")));
    }

    #[test]
    fn test_decode_hex_escapes() {
        assert_eq!(decode_hex_escapes("main\\x3avm\\x2f100"), "main:vm/100");
        assert_eq!(decode_hex_escapes("plain"), "plain");
        assert_eq!(decode_hex_escapes("trailing\\x"), "trailing\\x");
    }
}
