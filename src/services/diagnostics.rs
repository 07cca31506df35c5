//! Reliability analysis of agent pipeline runs.
//!
//! Pure aggregation over the per-record execution metadata a pipeline run
//! produced. The report tells schema authors which agents need attention
//! before the next run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::extraction::{AgentExecutionMetadata, AgentRunStatus};

/// Failure share above which an agent is flagged critical.
const FAILURE_RATE_THRESHOLD: f64 = 0.2;

/// Share of errors mentioning "json" above which the agent's prompt needs
/// stricter output instructions.
const JSON_ERROR_SHARE_THRESHOLD: f64 = 0.5;

/// Cap on ranked recommendations.
const MAX_RECOMMENDATIONS: usize = 5;

/// Per-agent reliability figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDiagnostics {
    pub agent_name: String,
    pub agent_order: u32,
    pub total_executions: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub timeout_count: usize,
    /// Percentage of successful executions for this agent, 0-100.
    pub success_rate: f64,
    /// True when timeouts occurred, failures exceeded 20% of records, or
    /// most errors point at malformed JSON output.
    pub is_critical: bool,
    pub issues: Vec<String>,
}

/// The full report for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub agents: Vec<AgentDiagnostics>,
    /// Success entries across all agents and records over (records x
    /// agents), as a percentage capped at 100.
    pub overall_success_rate: f64,
    /// At most 5 ranked, human-readable recommendations.
    pub recommendations: Vec<String>,
}

/// Analyze the metadata histories collected from one pipeline run.
///
/// `metadata` is indexed per result, then per agent stage.
pub fn analyze(metadata: &[Vec<AgentExecutionMetadata>]) -> DiagnosticsReport {
    let record_count = metadata.len();

    // Group by (agent_name, order); BTreeMap keeps report order stable.
    let mut groups: BTreeMap<(u32, String), Vec<&AgentExecutionMetadata>> = BTreeMap::new();
    for history in metadata {
        for entry in history {
            groups
                .entry((entry.agent_order, entry.agent_name.clone()))
                .or_default()
                .push(entry);
        }
    }

    let mut agents = Vec::new();
    let mut total_success = 0usize;

    for ((order, name), entries) in &groups {
        let total = entries.len();
        let success = entries
            .iter()
            .filter(|e| e.status == AgentRunStatus::Success)
            .count();
        let timeout = entries
            .iter()
            .filter(|e| e.status == AgentRunStatus::Timeout)
            .count();
        let failed = total - success - timeout;
        total_success += success;

        let mut issues = Vec::new();

        if timeout > 0 {
            issues.push(format!("{timeout} execution(s) timed out"));
        }

        let non_success = failed + timeout;
        if record_count > 0 && non_success as f64 > FAILURE_RATE_THRESHOLD * record_count as f64 {
            issues.push(format!(
                "failures exceed {:.0}% of records ({non_success}/{record_count})",
                FAILURE_RATE_THRESHOLD * 100.0
            ));
        }

        let error_count = entries.iter().filter(|e| e.error.is_some()).count();
        // Shape errors mention "array" ("got an object"); classify them
        // before the generic JSON bucket so they do not collapse into it.
        let shape_errors = entries
            .iter()
            .filter_map(|e| e.error.as_deref())
            .filter(|e| e.to_lowercase().contains("array"))
            .count();
        let json_errors = entries
            .iter()
            .filter_map(|e| e.error.as_deref())
            .map(|e| e.to_lowercase())
            .filter(|e| e.contains("json") && !e.contains("array"))
            .count();
        if error_count > 0 && shape_errors as f64 > JSON_ERROR_SHARE_THRESHOLD * error_count as f64
        {
            issues.push(format!(
                "most errors are wrong output shape ({shape_errors}/{error_count})"
            ));
        }
        if error_count > 0 && json_errors as f64 > JSON_ERROR_SHARE_THRESHOLD * error_count as f64 {
            issues.push(format!(
                "most errors are JSON parse failures ({json_errors}/{error_count})"
            ));
        }

        agents.push(AgentDiagnostics {
            agent_name: name.clone(),
            agent_order: *order,
            total_executions: total,
            success_count: success,
            failed_count: failed,
            timeout_count: timeout,
            success_rate: if total > 0 {
                success as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            is_critical: !issues.is_empty(),
            issues,
        });
    }

    let agent_count = agents.len();
    let overall_success_rate = if record_count > 0 && agent_count > 0 {
        // Capped at 100: partial runs can have more entries than the
        // records x agents denominator accounts for.
        (total_success as f64 / (record_count * agent_count) as f64 * 100.0).min(100.0)
    } else {
        0.0
    };

    let recommendations = build_recommendations(&agents, overall_success_rate);

    DiagnosticsReport {
        agents,
        overall_success_rate,
        recommendations,
    }
}

/// Ranked recommendations: overall-rate warnings first, then per-agent
/// specifics, capped at `MAX_RECOMMENDATIONS`.
fn build_recommendations(agents: &[AgentDiagnostics], overall_rate: f64) -> Vec<String> {
    let mut recs = Vec::new();

    if overall_rate < 50.0 {
        recs.push(format!(
            "Overall agent success rate is {overall_rate:.0}%. Review the agent \
             configuration before relying on pipeline output."
        ));
    } else if overall_rate < 80.0 {
        recs.push(format!(
            "Overall agent success rate is {overall_rate:.0}%. Some stages are \
             degrading results."
        ));
    }

    for agent in agents {
        if recs.len() >= MAX_RECOMMENDATIONS {
            break;
        }

        // Most specific advice first, one recommendation per agent.
        if agent
            .issues
            .iter()
            .any(|i| i.contains("wrong output shape"))
        {
            recs.push(format!(
                "Agent '{}' returns the wrong output shape. Remind it to respond \
                 with the full JSON array of records.",
                agent.agent_name
            ));
            continue;
        }
        if agent.timeout_count > 0 {
            recs.push(format!(
                "Agent '{}' timed out {} time(s). Consider raising its timeout or \
                 shortening its prompt.",
                agent.agent_name, agent.timeout_count
            ));
            continue;
        }
        if agent
            .issues
            .iter()
            .any(|i| i.contains("JSON parse failures"))
        {
            recs.push(format!(
                "Agent '{}' frequently returns malformed JSON. Add stricter output \
                 instructions (e.g. 'respond with ONLY a JSON array').",
                agent.agent_name
            ));
            continue;
        }
        if agent.success_rate < 50.0 && agent.failed_count > 0 {
            recs.push(format!(
                "Agent '{}' succeeds on only {:.0}% of records. Its prompt may be \
                 unclear or too broad for this schema.",
                agent.agent_name, agent.success_rate
            ));
        }
    }

    recs.truncate(MAX_RECOMMENDATIONS);
    recs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(
        name: &str,
        order: u32,
        status: AgentRunStatus,
        error: Option<&str>,
    ) -> AgentExecutionMetadata {
        AgentExecutionMetadata {
            agent_name: name.to_string(),
            agent_order: order,
            agent_prompt: "p".to_string(),
            executed_at: Utc::now(),
            duration_ms: 100,
            status,
            error: error.map(str::to_string),
            fallback: None,
        }
    }

    #[test]
    fn test_all_success() {
        let metadata: Vec<Vec<_>> = (0..4)
            .map(|_| {
                vec![
                    entry("normalize", 1, AgentRunStatus::Success, None),
                    entry("dedupe", 2, AgentRunStatus::Success, None),
                ]
            })
            .collect();

        let report = analyze(&metadata);
        assert_eq!(report.overall_success_rate, 100.0);
        assert!(report.agents.iter().all(|a| !a.is_critical));
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_all_failure_rate_in_bounds() {
        let metadata: Vec<Vec<_>> = (0..3)
            .map(|_| vec![entry("broken", 1, AgentRunStatus::Failed, Some("boom"))])
            .collect();

        let report = analyze(&metadata);
        assert_eq!(report.overall_success_rate, 0.0);
        assert!(report.agents[0].is_critical);
        assert!(!report.recommendations.is_empty());
    }

    #[test]
    fn test_rate_capped_at_100() {
        // Partial run artifact: more entries for an agent than records.
        let metadata = vec![
            vec![
                entry("a", 1, AgentRunStatus::Success, None),
                entry("a", 1, AgentRunStatus::Success, None),
                entry("a", 1, AgentRunStatus::Success, None),
            ],
        ];

        let report = analyze(&metadata);
        assert!(report.overall_success_rate <= 100.0);
        assert!(report.overall_success_rate >= 0.0);
    }

    #[test]
    fn test_timeout_flags_critical() {
        let metadata = vec![
            vec![entry("slow", 1, AgentRunStatus::Timeout, Some("timed out"))],
            vec![entry("slow", 1, AgentRunStatus::Success, None)],
            vec![entry("slow", 1, AgentRunStatus::Success, None)],
            vec![entry("slow", 1, AgentRunStatus::Success, None)],
            vec![entry("slow", 1, AgentRunStatus::Success, None)],
            vec![entry("slow", 1, AgentRunStatus::Success, None)],
        ];

        let report = analyze(&metadata);
        let slow = &report.agents[0];
        assert!(slow.is_critical);
        assert_eq!(slow.timeout_count, 1);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("timed out")));
    }

    #[test]
    fn test_json_errors_drive_prompt_recommendation() {
        let metadata: Vec<Vec<_>> = (0..4)
            .map(|i| {
                if i < 3 {
                    vec![entry(
                        "messy",
                        1,
                        AgentRunStatus::Failed,
                        Some("invalid JSON: expected value"),
                    )]
                } else {
                    vec![entry("messy", 1, AgentRunStatus::Success, None)]
                }
            })
            .collect();

        let report = analyze(&metadata);
        assert!(report.agents[0].is_critical);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("JSON") || r.contains("unclear")));
    }

    #[test]
    fn test_shape_errors_get_their_own_recommendation() {
        // The exact error text a non-array stage output produces.
        let metadata: Vec<Vec<_>> = (0..4)
            .map(|_| {
                vec![entry(
                    "reshape",
                    1,
                    AgentRunStatus::Failed,
                    Some("agent output was not a JSON array: expected a JSON array, got an object"),
                )]
            })
            .collect();

        let report = analyze(&metadata);
        let agent = &report.agents[0];
        assert!(agent.is_critical);
        assert!(agent.issues.iter().any(|i| i.contains("wrong output shape")));
        // Shape errors do not double-count into the JSON parse bucket.
        assert!(!agent
            .issues
            .iter()
            .any(|i| i.contains("JSON parse failures")));
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("wrong output shape")));
    }

    #[test]
    fn test_recommendations_capped_at_five() {
        // Eight independently broken agents.
        let metadata: Vec<Vec<_>> = (0..5)
            .map(|_| {
                (1..=8)
                    .map(|order| {
                        entry(
                            &format!("agent{order}"),
                            order,
                            AgentRunStatus::Failed,
                            Some("boom"),
                        )
                    })
                    .collect()
            })
            .collect();

        let report = analyze(&metadata);
        assert!(report.recommendations.len() <= 5);
    }

    #[test]
    fn test_failure_share_threshold() {
        // 1 failure out of 10 records: 10% < 20%, not critical by share.
        let mut metadata: Vec<Vec<_>> = (0..9)
            .map(|_| vec![entry("mostly-ok", 1, AgentRunStatus::Success, None)])
            .collect();
        metadata.push(vec![entry(
            "mostly-ok",
            1,
            AgentRunStatus::Failed,
            Some("boom"),
        )]);

        let report = analyze(&metadata);
        assert!(!report.agents[0].is_critical);

        // 3 failures out of 10: 30% > 20%, critical.
        let mut metadata: Vec<Vec<_>> = (0..7)
            .map(|_| vec![entry("shaky", 1, AgentRunStatus::Success, None)])
            .collect();
        for _ in 0..3 {
            metadata.push(vec![entry("shaky", 1, AgentRunStatus::Failed, Some("boom"))]);
        }

        let report = analyze(&metadata);
        assert!(report.agents[0].is_critical);
    }
}
