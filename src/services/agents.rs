//! Sequential post-processing ("agent") pipeline.
//!
//! Each configured agent is one model call over the whole record batch.
//! A stage that fails after its retry budget forwards its input unchanged
//! to the next stage; the pipeline never aborts, it only accumulates
//! failure metadata.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::models::extraction::{AgentExecutionMetadata, AgentRunStatus, FallbackMode};
use crate::models::schema::{AgentDefinition, Criticality};
use crate::services::model::ModelClient;
use crate::services::repair::strip_code_fences;

/// Timeout for the simpler one-call-per-record fallback path.
const SINGLE_RECORD_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of running the full agent pipeline over a batch of records.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// The final record array after all stages.
    pub records: Vec<serde_json::Value>,
    /// Per-record, per-stage execution history, aligned with `records`.
    pub metadata: Vec<Vec<AgentExecutionMetadata>>,
    /// True if any stage exhausted its retries, even though the pipeline
    /// completed.
    pub has_errors: bool,
}

#[derive(Debug, thiserror::Error)]
enum StageError {
    #[error("agent call timed out after {0}ms")]
    Timeout(u64),

    #[error("model call failed: {0}")]
    Call(String),

    #[error("agent output was not a JSON array: {0}")]
    Parse(String),
}

impl StageError {
    fn run_status(&self) -> AgentRunStatus {
        match self {
            StageError::Timeout(_) => AgentRunStatus::Timeout,
            _ => AgentRunStatus::Failed,
        }
    }
}

/// Runs an ordered list of post-processing agents over extracted records.
pub struct AgentPipeline {
    model: Arc<dyn ModelClient>,
}

impl AgentPipeline {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    /// Batch mode: one model call per agent covering all records.
    ///
    /// `agents` must already be filtered to enabled agents and sorted by
    /// order (see `CompiledSchema::active_agents`).
    pub async fn run_batch(
        &self,
        agents: &[AgentDefinition],
        json_schema: &serde_json::Value,
        records: Vec<serde_json::Value>,
    ) -> PipelineOutcome {
        let mut records = records;
        // Stages apply uniformly to the whole batch, so the history is one
        // shared stage log materialized per record at the end.
        let mut stage_log: Vec<AgentExecutionMetadata> = Vec::new();
        let mut has_errors = false;

        for agent in agents {
            let started = std::time::Instant::now();
            let executed_at = Utc::now();

            let outcome = self.run_stage_with_retries(agent, json_schema, &records).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(new_records) => {
                    tracing::info!(
                        agent = %agent.name,
                        duration_ms = duration_ms,
                        records_in = records.len(),
                        records_out = new_records.len(),
                        "Agent stage succeeded"
                    );
                    stage_log.push(AgentExecutionMetadata {
                        agent_name: agent.name.clone(),
                        agent_order: agent.order,
                        agent_prompt: agent.prompt.clone(),
                        executed_at,
                        duration_ms,
                        status: AgentRunStatus::Success,
                        error: None,
                        fallback: None,
                    });
                    records = new_records;
                }
                Err(e) => {
                    has_errors = true;
                    // Both fallback paths leave the records untouched; the
                    // label only tells diagnostics which policy applied.
                    let fallback = if agent.skip_on_validation_error {
                        FallbackMode::SkipOnError
                    } else {
                        FallbackMode::IndividualFallback
                    };
                    tracing::warn!(
                        agent = %agent.name,
                        duration_ms = duration_ms,
                        error = %e,
                        fallback = %fallback,
                        "Agent stage failed after retries, forwarding input unchanged"
                    );
                    stage_log.push(AgentExecutionMetadata {
                        agent_name: agent.name.clone(),
                        agent_order: agent.order,
                        agent_prompt: agent.prompt.clone(),
                        executed_at,
                        duration_ms,
                        status: e.run_status(),
                        error: Some(e.to_string()),
                        fallback: Some(fallback),
                    });
                }
            }
        }

        let metadata = vec![stage_log; records.len()];
        PipelineOutcome {
            records,
            metadata,
            has_errors,
        }
    }

    /// Single-record mode: the simpler fallback path with one model call
    /// per record at fixed low criticality. Same never-abort contract as
    /// batch mode, at per-record granularity.
    pub async fn run_single(
        &self,
        agents: &[AgentDefinition],
        json_schema: &serde_json::Value,
        record: serde_json::Value,
    ) -> (serde_json::Value, Vec<AgentExecutionMetadata>, bool) {
        let mut record = record;
        let mut history = Vec::new();
        let mut has_errors = false;

        for agent in agents {
            let started = std::time::Instant::now();
            let executed_at = Utc::now();

            let prompt = single_record_prompt(agent, json_schema, &record);
            let call = self
                .model
                .ask(&agent.prompt, &prompt, Criticality::Low, None);

            let outcome = match tokio::time::timeout(SINGLE_RECORD_TIMEOUT, call).await {
                Ok(Ok(raw)) => parse_single_output(&raw).map_err(StageError::Parse),
                Ok(Err(e)) => Err(StageError::Call(e.to_string())),
                Err(_) => Err(StageError::Timeout(SINGLE_RECORD_TIMEOUT.as_millis() as u64)),
            };

            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(updated) => {
                    history.push(AgentExecutionMetadata {
                        agent_name: agent.name.clone(),
                        agent_order: agent.order,
                        agent_prompt: agent.prompt.clone(),
                        executed_at,
                        duration_ms,
                        status: AgentRunStatus::Success,
                        error: None,
                        fallback: None,
                    });
                    record = updated;
                }
                Err(e) => {
                    has_errors = true;
                    tracing::warn!(
                        agent = %agent.name,
                        error = %e,
                        "Single-record agent failed, keeping record unchanged"
                    );
                    history.push(AgentExecutionMetadata {
                        agent_name: agent.name.clone(),
                        agent_order: agent.order,
                        agent_prompt: agent.prompt.clone(),
                        executed_at,
                        duration_ms,
                        status: e.run_status(),
                        error: Some(e.to_string()),
                        fallback: Some(FallbackMode::IndividualFallback),
                    });
                }
            }
        }

        (record, history, has_errors)
    }

    /// One stage with its retry budget. No backoff between attempts; the
    /// model provider applies its own pacing.
    async fn run_stage_with_retries(
        &self,
        agent: &AgentDefinition,
        json_schema: &serde_json::Value,
        records: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, StageError> {
        let attempts = agent.retry_count + 1;
        let mut last_error = StageError::Call("no attempt made".to_string());

        for attempt in 0..attempts {
            if attempt > 0 {
                tracing::debug!(
                    agent = %agent.name,
                    attempt = attempt + 1,
                    attempts = attempts,
                    "Retrying agent stage"
                );
            }
            match self.run_stage_once(agent, json_schema, records).await {
                Ok(out) => return Ok(out),
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    async fn run_stage_once(
        &self,
        agent: &AgentDefinition,
        json_schema: &serde_json::Value,
        records: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, StageError> {
        let prompt = batch_prompt(agent, json_schema, records);
        let call = self
            .model
            .ask(&agent.prompt, &prompt, agent.criticality, None);

        // Race the call against a timer. A fired timer abandons the
        // in-flight call; it does not try to kill it at the transport level.
        let raw = match tokio::time::timeout(Duration::from_millis(agent.timeout_ms), call).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(StageError::Call(e.to_string())),
            Err(_) => return Err(StageError::Timeout(agent.timeout_ms)),
        };

        parse_stage_output(&raw).map_err(StageError::Parse)
    }
}

/// Build the one prompt that batches all records through an agent,
/// replacing what would otherwise be N separate model calls.
fn batch_prompt(
    agent: &AgentDefinition,
    json_schema: &serde_json::Value,
    records: &[serde_json::Value],
) -> String {
    format!(
        "{}\n\nEach record conforms to this JSON schema:\n{}\n\n\
         Current records ({} total):\n{}\n\n\
         Apply your instruction to every record. Respond with ONLY the full \
         updated JSON array. You may remove or merge records if your \
         instruction calls for it.",
        agent.prompt,
        json_schema,
        records.len(),
        serde_json::Value::Array(records.to_vec())
    )
}

fn single_record_prompt(
    agent: &AgentDefinition,
    json_schema: &serde_json::Value,
    record: &serde_json::Value,
) -> String {
    format!(
        "{}\n\nThe record conforms to this JSON schema:\n{}\n\nRecord:\n{}\n\n\
         Respond with ONLY the updated JSON object.",
        agent.prompt, json_schema, record
    )
}

/// Agent output parsing: strip markdown fences, then plain JSON parse.
/// The result must be an array; shrinking or growing is legal (filtering
/// and deduplication agents do both), anything non-array is a parse error.
fn parse_stage_output(raw: &str) -> Result<Vec<serde_json::Value>, String> {
    let stripped = strip_code_fences(raw);
    let value: serde_json::Value =
        serde_json::from_str(&stripped).map_err(|e| format!("invalid JSON: {e}"))?;
    match value {
        serde_json::Value::Array(records) => Ok(records),
        other => Err(format!(
            "expected a JSON array, got {}",
            json_type_name(&other)
        )),
    }
}

fn parse_single_output(raw: &str) -> Result<serde_json::Value, String> {
    let stripped = strip_code_fences(raw);
    let value: serde_json::Value =
        serde_json::from_str(&stripped).map_err(|e| format!("invalid JSON: {e}"))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(format!(
            "expected a JSON object, got {}",
            json_type_name(&value)
        ))
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::model::{GenerateOptions, ModelError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedModel {
        responses: Mutex<Vec<Result<String, ModelError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String, ModelError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn ask(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _criticality: Criticality,
            _max_output_tokens: Option<u32>,
        ) -> Result<String, ModelError> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ModelError::Provider("script exhausted".to_string()));
            }
            responses.remove(0)
        }

        async fn generate_with_buffers(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _file_bytes: &[u8],
            _mime_type: &str,
            _criticality: Criticality,
            _options: GenerateOptions,
            _correlation_id: Option<&str>,
        ) -> Result<String, ModelError> {
            unreachable!("pipeline uses ask")
        }
    }

    fn agent(name: &str, order: u32, retry_count: u32, skip: bool) -> AgentDefinition {
        AgentDefinition {
            name: name.to_string(),
            prompt: format!("{name} instruction"),
            order,
            enabled: true,
            criticality: Criticality::Medium,
            timeout_ms: 5_000,
            retry_count,
            skip_on_validation_error: skip,
        }
    }

    fn sample_records() -> Vec<serde_json::Value> {
        vec![
            serde_json::json!({"item": "bolt", "qty": 10}),
            serde_json::json!({"item": "nut", "qty": 20}),
        ]
    }

    #[tokio::test]
    async fn test_success_carries_output_forward() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(r#"[{"item": "BOLT", "qty": 10}, {"item": "NUT", "qty": 20}]"#.to_string()),
            Ok(r#"[{"item": "BOLT", "qty": 10}]"#.to_string()),
        ]));
        let pipeline = AgentPipeline::new(model);
        let agents = [agent("upcase", 1, 0, false), agent("dedupe", 2, 0, false)];

        let outcome = pipeline
            .run_batch(&agents, &serde_json::json!({}), sample_records())
            .await;

        // Second agent legally shrank the array.
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0]["item"], "BOLT");
        assert!(!outcome.has_errors);
        assert_eq!(outcome.metadata.len(), 1);
        assert_eq!(outcome.metadata[0].len(), 2);
        assert!(outcome.metadata[0]
            .iter()
            .all(|m| m.status == AgentRunStatus::Success));
    }

    #[tokio::test]
    async fn test_failed_stage_forwards_input_unchanged() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModelError::Provider("boom".to_string())),
            Ok(r#"[{"item": "bolt", "qty": 10}, {"item": "nut", "qty": 20}]"#.to_string()),
        ]));
        let pipeline = AgentPipeline::new(model);
        let agents = [agent("broken", 1, 0, true), agent("passthrough", 2, 0, false)];

        let input = sample_records();
        let outcome = pipeline
            .run_batch(&agents, &serde_json::json!({}), input.clone())
            .await;

        // Stage 2 received stage 1's input byte-identical; its own echo
        // output equals it too.
        assert_eq!(outcome.records, input);
        assert!(outcome.has_errors);

        let history = &outcome.metadata[0];
        assert_eq!(history[0].status, AgentRunStatus::Failed);
        assert_eq!(history[0].fallback, Some(FallbackMode::SkipOnError));
        assert_eq!(history[1].status, AgentRunStatus::Success);
    }

    #[tokio::test]
    async fn test_retry_budget_consumed_then_fallback() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModelError::Provider("flaky".to_string())),
            Err(ModelError::Provider("flaky".to_string())),
            Ok(r#"[{"item": "bolt"}]"#.to_string()),
        ]));
        let pipeline = AgentPipeline::new(model.clone());
        let agents = [agent("flaky", 1, 2, false)];

        let outcome = pipeline
            .run_batch(&agents, &serde_json::json!({}), sample_records())
            .await;

        // Third attempt succeeded within the retry budget of 2.
        assert_eq!(model.call_count(), 3);
        assert!(!outcome.has_errors);
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_labels_individual_fallback() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModelError::Provider("down".to_string())),
            Err(ModelError::Provider("down".to_string())),
        ]));
        let pipeline = AgentPipeline::new(model.clone());
        let agents = [agent("down", 1, 1, false)];

        let input = sample_records();
        let outcome = pipeline
            .run_batch(&agents, &serde_json::json!({}), input.clone())
            .await;

        assert_eq!(model.call_count(), 2);
        assert!(outcome.has_errors);
        assert_eq!(outcome.records, input);
        assert_eq!(
            outcome.metadata[0][0].fallback,
            Some(FallbackMode::IndividualFallback)
        );
    }

    #[tokio::test]
    async fn test_non_array_output_is_parse_error() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            r#"{"item": "bolt"}"#.to_string()
        )]));
        let pipeline = AgentPipeline::new(model);
        let agents = [agent("shape", 1, 0, false)];

        let input = sample_records();
        let outcome = pipeline
            .run_batch(&agents, &serde_json::json!({}), input.clone())
            .await;

        assert!(outcome.has_errors);
        assert_eq!(outcome.records, input);
        let err = outcome.metadata[0][0].error.as_deref().unwrap();
        assert!(err.contains("array"));
    }

    #[tokio::test]
    async fn test_fenced_output_is_accepted() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            "```json\n[{\"item\": \"bolt\"}]\n```".to_string(),
        )]));
        let pipeline = AgentPipeline::new(model);
        let agents = [agent("fenced", 1, 0, false)];

        let outcome = pipeline
            .run_batch(&agents, &serde_json::json!({}), sample_records())
            .await;

        assert!(!outcome.has_errors);
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn test_single_record_mode_keeps_record_on_failure() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModelError::Provider("down".to_string())),
            Ok(r#"{"item": "bolt", "qty": 99}"#.to_string()),
        ]));
        let pipeline = AgentPipeline::new(model);
        let agents = [agent("fix-qty", 1, 0, false), agent("fix-qty-2", 2, 0, false)];

        let record = serde_json::json!({"item": "bolt", "qty": 10});
        let (updated, history, has_errors) = pipeline
            .run_single(&agents, &serde_json::json!({}), record)
            .await;

        assert!(has_errors);
        // First agent failed and left the record alone; second succeeded.
        assert_eq!(history[0].status, AgentRunStatus::Failed);
        assert_eq!(history[0].fallback, Some(FallbackMode::IndividualFallback));
        assert_eq!(history[1].status, AgentRunStatus::Success);
        assert_eq!(updated["qty"], 99);
    }
}
