//! LLM-driven supplier matching over approved extraction results.
//!
//! Results are matched against the supplier catalogue in fixed-size chunks
//! to bound prompt size. Suppliers are addressed by small integer keys in
//! the prompt (UUIDs waste tokens) and mapped back after parsing. A chunk
//! failing in any way yields empty matches for its records only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use uuid::Uuid;

use crate::models::extraction::ExtractionResult;
use crate::models::supplier::{Supplier, SupplierMatch};
use crate::services::model::{ModelClient, ModelError};
use crate::services::repair;

/// Results per model call.
pub const CHUNK_SIZE: usize = 15;

/// Matches retained per result from one pass.
const TOP_MATCHES: usize = 3;

/// Per-chunk model call timeout.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(180);

/// Cap on the materials summary per supplier in the prompt.
const MATERIALS_SUMMARY_MAX: usize = 200;

/// Record fields never sent to the model: positional/internal data that
/// adds tokens without adding matching signal.
const EXCLUDED_RECORD_FIELDS: [&str; 5] = [
    "bounding_box",
    "boundingBox",
    "source_text",
    "location",
    "agent_execution_metadata",
];

/// Expected response shape, per chunk.
#[derive(Debug, Deserialize)]
struct ChunkResponse {
    results: Vec<RecordMatches>,
}

#[derive(Debug, Deserialize)]
struct RecordMatches {
    #[serde(rename = "extractionResultId")]
    extraction_result_id: Uuid,
    matches: Vec<RawMatch>,
}

#[derive(Debug, Deserialize)]
struct RawMatch {
    #[serde(rename = "supplierId")]
    supplier_key: i64,
    #[serde(rename = "confidenceScore")]
    confidence_score: f64,
    #[serde(rename = "matchReason", default)]
    match_reason: String,
}

/// Outcome of one matching pass.
#[derive(Debug)]
pub struct MatchingOutcome {
    pub matches: Vec<SupplierMatch>,
    /// Chunk indexes that failed entirely (their records got no matches).
    pub failed_chunks: Vec<usize>,
}

/// Matches extraction results against the supplier catalogue in chunks.
pub struct SupplierMatcher {
    model: Arc<dyn ModelClient>,
}

impl SupplierMatcher {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    /// Split results into fixed-size chunks. 37 results yield chunks of
    /// 15, 15 and 7.
    pub fn chunk_sizes(total: usize) -> Vec<usize> {
        let mut sizes = Vec::new();
        let mut remaining = total;
        while remaining > 0 {
            let take = remaining.min(CHUNK_SIZE);
            sizes.push(take);
            remaining -= take;
        }
        sizes
    }

    /// Run one matching pass over all given results.
    pub async fn match_results(
        &self,
        results: &[ExtractionResult],
        suppliers: &[Supplier],
    ) -> MatchingOutcome {
        // Integer keys per supplier; the reverse map restores real ids.
        let key_map: HashMap<i64, Uuid> = suppliers
            .iter()
            .enumerate()
            .map(|(i, s)| (i as i64 + 1, s.id))
            .collect();
        let supplier_block = compact_supplier_list(suppliers);

        let mut matches = Vec::new();
        let mut failed_chunks = Vec::new();

        for (chunk_idx, chunk) in results.chunks(CHUNK_SIZE).enumerate() {
            match self.match_chunk(chunk, &supplier_block, &key_map).await {
                Ok(mut chunk_matches) => {
                    tracing::debug!(
                        chunk = chunk_idx,
                        records = chunk.len(),
                        matches = chunk_matches.len(),
                        "Supplier matching chunk complete"
                    );
                    matches.append(&mut chunk_matches);
                }
                Err(e) => {
                    // Chunk isolation: its records get empty matches;
                    // other chunks are unaffected.
                    metrics::counter!("matching_chunks_failed").increment(1);
                    tracing::warn!(
                        chunk = chunk_idx,
                        records = chunk.len(),
                        error = %e,
                        "Supplier matching chunk failed, continuing"
                    );
                    failed_chunks.push(chunk_idx);
                }
            }
        }

        MatchingOutcome {
            matches,
            failed_chunks,
        }
    }

    async fn match_chunk(
        &self,
        chunk: &[ExtractionResult],
        supplier_block: &str,
        key_map: &HashMap<i64, Uuid>,
    ) -> Result<Vec<SupplierMatch>, String> {
        let prompt = chunk_prompt(chunk, supplier_block);

        let call = self.model.ask(
            "You match extracted material records to suppliers from a catalogue. \
             Respond with ONLY JSON of the form \
             {\"results\": [{\"extractionResultId\": \"...\", \"matches\": \
             [{\"supplierId\": 1, \"confidenceScore\": 0.9, \"matchReason\": \"...\"}]}]}. \
             Use the integer supplier keys from the catalogue. At most 3 matches per record.",
            &prompt,
            crate::models::schema::Criticality::Medium,
            None,
        );

        let raw = match tokio::time::timeout(CHUNK_TIMEOUT, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(ModelError::Provider(msg))) => return Err(format!("provider error: {msg}")),
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("timeout after {}s", CHUNK_TIMEOUT.as_secs())),
        };

        let record_matches = parse_chunk_response(&raw)?;

        Ok(resolve_matches(record_matches, chunk, key_map))
    }
}

/// Parse a chunk response, falling back to regex-based partial recovery of
/// complete per-record sub-objects when the full document is unparseable.
fn parse_chunk_response(raw: &str) -> Result<Vec<RecordMatches>, String> {
    let repaired = repair::repair(raw);

    if let Ok(parsed) = serde_json::from_str::<ChunkResponse>(&repaired) {
        return Ok(parsed.results);
    }

    let recovered = recover_partial_results(&repaired);
    if recovered.is_empty() {
        Err("response was not valid match JSON and partial recovery found nothing".to_string())
    } else {
        tracing::warn!(
            recovered = recovered.len(),
            "Chunk response malformed; recovered complete sub-objects"
        );
        Ok(recovered)
    }
}

/// Extract any complete `{"extractionResultId": ..., "matches": [...]}`
/// sub-objects from truncated response text.
fn recover_partial_results(text: &str) -> Vec<RecordMatches> {
    // Matches one complete per-record object with a closed matches array.
    // String literals are consumed as a unit so a bracket inside a
    // matchReason does not end the array early.
    let pattern = Regex::new(
        r#"\{\s*"extractionResultId"\s*:\s*"[0-9a-fA-F-]{36}"\s*,\s*"matches"\s*:\s*\[(?:[^"\[\]]|"(?:[^"\\]|\\.)*")*\]\s*\}"#,
    )
    .expect("static regex");

    pattern
        .find_iter(text)
        .filter_map(|m| serde_json::from_str::<RecordMatches>(m.as_str()).ok())
        .collect()
}

/// Map integer supplier keys back to catalogue ids, drop matches with
/// unmapped keys or ids outside the chunk, and keep the top 3 matches per
/// result by confidence.
fn resolve_matches(
    record_matches: Vec<RecordMatches>,
    chunk: &[ExtractionResult],
    key_map: &HashMap<i64, Uuid>,
) -> Vec<SupplierMatch> {
    let chunk_ids: std::collections::HashSet<Uuid> = chunk.iter().map(|r| r.id).collect();
    let mut out = Vec::new();

    for rm in record_matches {
        if !chunk_ids.contains(&rm.extraction_result_id) {
            tracing::debug!(
                extraction_result_id = %rm.extraction_result_id,
                "Dropping matches for a result id not in this chunk"
            );
            continue;
        }

        let mut resolved: Vec<SupplierMatch> = rm
            .matches
            .into_iter()
            .filter_map(|m| {
                let supplier_id = key_map.get(&m.supplier_key)?;
                Some(SupplierMatch {
                    extraction_result_id: rm.extraction_result_id,
                    supplier_id: *supplier_id,
                    confidence_score: m.confidence_score.clamp(0.0, 1.0),
                    match_reason: m.match_reason,
                    is_selected: false,
                })
            })
            .collect();

        resolved.sort_by(|a, b| {
            b.confidence_score
                .partial_cmp(&a.confidence_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        resolved.truncate(TOP_MATCHES);
        out.extend(resolved);
    }

    out
}

/// Record summaries with positional/internal fields filtered out.
fn chunk_prompt(chunk: &[ExtractionResult], supplier_block: &str) -> String {
    let mut prompt = String::from("Records to match:\n");
    for result in chunk {
        let summary = filtered_record(result);
        prompt.push_str(&format!("- id {}: {}\n", result.id, summary));
    }
    prompt.push_str("\nSupplier catalogue (address suppliers by integer key):\n");
    prompt.push_str(supplier_block);
    prompt
}

/// The record data sent to the model: verified data layered over the raw
/// extraction, minus excluded fields.
fn filtered_record(result: &ExtractionResult) -> String {
    let mut merged = result.raw_extraction.clone();
    if let (Some(obj), Some(overrides)) = (
        merged.as_object_mut(),
        result.verified_data.as_ref().and_then(|v| v.as_object()),
    ) {
        for (k, v) in overrides {
            obj.insert(k.clone(), v.clone());
        }
    }
    if let Some(obj) = merged.as_object_mut() {
        for field in EXCLUDED_RECORD_FIELDS {
            obj.remove(field);
        }
    }
    merged.to_string()
}

/// Compact integer-keyed supplier list with materials summaries truncated
/// to keep the prompt bounded.
fn compact_supplier_list(suppliers: &[Supplier]) -> String {
    let mut block = String::new();
    for (i, supplier) in suppliers.iter().enumerate() {
        let materials = supplier
            .materials_offered
            .as_deref()
            .map(|m| truncate_chars(m, MATERIALS_SUMMARY_MAX))
            .unwrap_or_default();
        block.push_str(&format!("{}: {} | {}\n", i as i64 + 1, supplier.name, materials));
    }
    block
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::extraction::Evidence;
    use crate::models::schema::Criticality;
    use crate::services::model::{GenerateOptions, ModelError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn test_chunk_sizes() {
        assert_eq!(SupplierMatcher::chunk_sizes(37), vec![15, 15, 7]);
        assert_eq!(SupplierMatcher::chunk_sizes(15), vec![15]);
        assert_eq!(SupplierMatcher::chunk_sizes(14), vec![14]);
        assert_eq!(SupplierMatcher::chunk_sizes(0), Vec::<usize>::new());
    }

    fn result(job_id: Uuid) -> ExtractionResult {
        ExtractionResult::from_raw(
            job_id,
            serde_json::json!({"material": "steel bolts", "source_text": "internal"}),
            Evidence::default(),
        )
    }

    fn supplier(name: &str, materials: &str) -> Supplier {
        Supplier {
            id: Uuid::new_v4(),
            name: name.to_string(),
            materials_offered: Some(materials.to_string()),
            contact_email: None,
            city: None,
        }
    }

    #[test]
    fn test_filtered_record_excludes_internal_fields() {
        let r = result(Uuid::new_v4());
        let summary = filtered_record(&r);
        assert!(summary.contains("steel bolts"));
        assert!(!summary.contains("internal"));
    }

    #[test]
    fn test_materials_truncated_in_prompt() {
        let long = "m".repeat(500);
        let block = compact_supplier_list(&[supplier("Acme", &long)]);
        assert!(block.len() < 300);
        assert!(block.starts_with("1: Acme | "));
    }

    #[test]
    fn test_partial_recovery_extracts_complete_objects() {
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        // Second record object is cut off mid-array: only the first is
        // recoverable.
        let text = format!(
            r#"{{"results": [{{"extractionResultId": "{id_a}", "matches": [{{"supplierId": 1, "confidenceScore": 0.9, "matchReason": "same material"}}]}}, {{"extractionResultId": "{id_b}", "matches": [{{"supplierId": 2, "confi"#
        );

        let recovered = recover_partial_results(&text);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].extraction_result_id, id_a);
        assert_eq!(recovered[0].matches.len(), 1);
    }

    #[test]
    fn test_partial_recovery_tolerates_brackets_in_match_reason() {
        let id = Uuid::new_v4();
        let text = format!(
            r#"{{"results": [{{"extractionResultId": "{id}", "matches": [{{"supplierId": 3, "confidenceScore": 0.8, "matchReason": "fits bracket [M8] spec"}}]}}, garbage"#
        );

        let recovered = recover_partial_results(&text);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].extraction_result_id, id);
        assert_eq!(recovered[0].matches[0].match_reason, "fits bracket [M8] spec");
    }

    #[test]
    fn test_resolve_drops_unmapped_keys_and_keeps_top3() {
        let job_id = Uuid::new_v4();
        let r = result(job_id);
        let suppliers: Vec<Supplier> = (0..4).map(|i| supplier(&format!("S{i}"), "steel")).collect();
        let key_map: HashMap<i64, Uuid> = suppliers
            .iter()
            .enumerate()
            .map(|(i, s)| (i as i64 + 1, s.id))
            .collect();

        let record_matches = vec![RecordMatches {
            extraction_result_id: r.id,
            matches: vec![
                RawMatch { supplier_key: 1, confidence_score: 0.5, match_reason: String::new() },
                RawMatch { supplier_key: 99, confidence_score: 0.99, match_reason: String::new() },
                RawMatch { supplier_key: 2, confidence_score: 0.8, match_reason: String::new() },
                RawMatch { supplier_key: 3, confidence_score: 0.7, match_reason: String::new() },
                RawMatch { supplier_key: 4, confidence_score: 0.6, match_reason: String::new() },
            ],
        }];

        let chunk = vec![r];
        let resolved = resolve_matches(record_matches, &chunk, &key_map);

        // Unmapped key 99 dropped; top 3 of the remaining 4 kept.
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].confidence_score, 0.8);
        assert_eq!(resolved[1].confidence_score, 0.7);
        assert_eq!(resolved[2].confidence_score, 0.6);
    }

    struct ScriptedModel {
        responses: Mutex<Vec<Result<String, ModelError>>>,
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
            self.responses.lock().unwrap().remove(0)
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
            unreachable!("matcher uses ask")
        }
    }

    #[tokio::test]
    async fn test_chunk_failure_is_isolated() {
        let job_id = Uuid::new_v4();
        let results: Vec<ExtractionResult> = (0..37).map(|_| result(job_id)).collect();
        let suppliers = vec![supplier("Acme Steel", "bolts, plates")];

        let ok_response = |chunk: &[ExtractionResult]| {
            let entries: Vec<String> = chunk
                .iter()
                .map(|r| {
                    format!(
                        r#"{{"extractionResultId": "{}", "matches": [{{"supplierId": 1, "confidenceScore": 0.9, "matchReason": "steel"}}]}}"#,
                        r.id
                    )
                })
                .collect();
            format!(r#"{{"results": [{}]}}"#, entries.join(", "))
        };

        // Chunk 2 of 3 errors; 1 and 3 succeed.
        let model = Arc::new(ScriptedModel {
            responses: Mutex::new(vec![
                Ok(ok_response(&results[0..15])),
                Err(ModelError::Provider("rate limit".to_string())),
                Ok(ok_response(&results[30..37])),
            ]),
        });

        let matcher = SupplierMatcher::new(model);
        let outcome = matcher.match_results(&results, &suppliers).await;

        assert_eq!(outcome.failed_chunks, vec![1]);
        // 15 + 7 records matched; chunk 2's 15 records have none.
        assert_eq!(outcome.matches.len(), 22);
        let chunk2_ids: Vec<Uuid> = results[15..30].iter().map(|r| r.id).collect();
        assert!(outcome
            .matches
            .iter()
            .all(|m| !chunk2_ids.contains(&m.extraction_result_id)));
    }
}
