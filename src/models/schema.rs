use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Model tier hint passed through to the model collaborator, which maps it
/// to a concrete provider/model. Higher criticality selects a stronger tier.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Criticality {
    Low,
    Medium,
    High,
}

/// One configured post-processing stage. Owned by the schema, read-only to
/// the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub prompt: String,
    /// Positive processing order; the pipeline runs enabled agents sorted
    /// ascending by this value.
    pub order: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_criticality")]
    pub criticality: Criticality,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional attempts after the first failure, clamped to 0-3 when
    /// the schema is compiled.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub skip_on_validation_error: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_criticality() -> Criticality {
    Criticality::Medium
}

fn default_timeout_ms() -> u64 {
    120_000
}

/// A schema resolved and compiled for extraction: the target structure, the
/// extraction prompt, few-shot examples, and the ordered agent pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledSchema {
    pub id: Uuid,
    pub name: String,
    pub json_schema: serde_json::Value,
    pub prompt: String,
    #[serde(default)]
    pub examples: Vec<serde_json::Value>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

impl CompiledSchema {
    /// Enabled agents in processing order, with retry counts clamped to the
    /// allowed 0-3 range.
    pub fn active_agents(&self) -> Vec<AgentDefinition> {
        let mut agents: Vec<AgentDefinition> = self
            .agents
            .iter()
            .filter(|a| a.enabled)
            .cloned()
            .map(|mut a| {
                a.retry_count = a.retry_count.min(3);
                a
            })
            .collect();
        agents.sort_by_key(|a| a.order);
        agents
    }
}
