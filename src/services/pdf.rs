//! Page-batched PDF extraction.
//!
//! A document is split into fixed-size page batches and each batch is sent
//! to the model as an independent sub-document. One bad batch never
//! discards the rest of the document: failures are recorded per page range
//! and the loop continues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lopdf::Document;
use uuid::Uuid;

use crate::models::extraction::{Evidence, ExtractionResult};
use crate::models::schema::{CompiledSchema, Criticality};
use crate::services::model::{GenerateOptions, ModelClient, ModelError};
use crate::services::repair;

/// Pages per model call.
pub const BATCH_SIZE: u32 = 5;

/// Per-batch model call timeout.
const BATCH_TIMEOUT: Duration = Duration::from_secs(240);

/// Output bound per batch, to keep truncation recoverable.
const BATCH_MAX_OUTPUT_TOKENS: u32 = 8192;

/// Receives batch-completion ticks so the caller can advance job progress
/// proportionally to batches completed.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn batch_completed(&self, batches_done: u32, total_batches: u32);
}

/// Sink for callers that do not track progress.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn batch_completed(&self, _batches_done: u32, _total_batches: u32) {}
}

/// A batch the model failed on, with its page range preserved for the job
/// log and diagnostics.
#[derive(Debug, Clone)]
pub struct FailedBatch {
    pub start_page: u32,
    pub end_page: u32,
    pub error: String,
}

/// Outcome of extracting one document.
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub results: Vec<ExtractionResult>,
    pub failed_batches: Vec<FailedBatch>,
    pub total_pages: u32,
    pub num_batches: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Not a PDF document: {0}")]
    InvalidPdf(String),

    #[error("Failed to parse PDF structure: {0}")]
    Pdf(#[from] lopdf::Error),
}

/// Splits a PDF into page batches and drives the model over them.
pub struct PdfBatchExtractor {
    model: Arc<dyn ModelClient>,
}

impl PdfBatchExtractor {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    /// Partition `[1, total_pages]` into contiguous batch ranges of at most
    /// `BATCH_SIZE` pages, with no gaps or overlaps.
    pub fn batch_ranges(total_pages: u32) -> Vec<(u32, u32)> {
        (1..=total_pages)
            .step_by(BATCH_SIZE as usize)
            .map(|start| (start, (start + BATCH_SIZE - 1).min(total_pages)))
            .collect()
    }

    /// Extract structured records from a PDF, batch by batch.
    pub async fn extract(
        &self,
        pdf_bytes: &[u8],
        job_id: Uuid,
        schema: &CompiledSchema,
        progress: &dyn ProgressSink,
    ) -> Result<ExtractionOutcome, ExtractError> {
        let doc = Self::probe(pdf_bytes)?;
        let total_pages = doc.get_pages().len() as u32;

        let ranges = Self::batch_ranges(total_pages);
        let num_batches = ranges.len() as u32;

        tracing::info!(
            job_id = %job_id,
            total_pages = total_pages,
            num_batches = num_batches,
            "Starting batched PDF extraction"
        );

        let mut results = Vec::new();
        let mut failed_batches = Vec::new();

        for (i, &(start, end)) in ranges.iter().enumerate() {
            match self
                .extract_batch(&doc, job_id, schema, start, end, total_pages)
                .await
            {
                Ok(mut batch_results) => {
                    tracing::debug!(
                        job_id = %job_id,
                        start_page = start,
                        end_page = end,
                        records = batch_results.len(),
                        "Batch extracted"
                    );
                    results.append(&mut batch_results);
                }
                Err(e) => {
                    metrics::counter!("extraction_batches_failed").increment(1);
                    tracing::warn!(
                        job_id = %job_id,
                        start_page = start,
                        end_page = end,
                        error = %e,
                        "Batch extraction failed, continuing with next batch"
                    );
                    failed_batches.push(FailedBatch {
                        start_page: start,
                        end_page: end,
                        error: e,
                    });
                }
            }

            progress.batch_completed(i as u32 + 1, num_batches).await;
        }

        Ok(ExtractionOutcome {
            results,
            failed_batches,
            total_pages,
            num_batches,
        })
    }

    /// Lightweight signature + structure probe. Fails fast on non-PDF bytes
    /// before any model call is made.
    fn probe(pdf_bytes: &[u8]) -> Result<Document, ExtractError> {
        if !pdf_bytes.starts_with(b"%PDF") {
            return Err(ExtractError::InvalidPdf(
                "missing %PDF signature".to_string(),
            ));
        }
        let doc = Document::load_mem(pdf_bytes)?;
        if doc.get_pages().is_empty() {
            return Err(ExtractError::InvalidPdf("document has no pages".to_string()));
        }
        Ok(doc)
    }

    /// Run the model over one page range. Errors are stringified because
    /// they end up in the `failed_batches` record, not propagated.
    async fn extract_batch(
        &self,
        doc: &Document,
        job_id: Uuid,
        schema: &CompiledSchema,
        start: u32,
        end: u32,
        total_pages: u32,
    ) -> Result<Vec<ExtractionResult>, String> {
        let sub_pdf = Self::extract_page_range(doc, start, end).map_err(|e| e.to_string())?;
        let user_prompt = Self::batch_prompt(schema, start, end, total_pages);
        let correlation_id = format!("{job_id}:{start}-{end}");

        let call = self.model.generate_with_buffers(
            &schema.prompt,
            &user_prompt,
            &sub_pdf,
            "application/pdf",
            Criticality::High,
            GenerateOptions {
                temperature: Some(0.0),
                max_output_tokens: Some(BATCH_MAX_OUTPUT_TOKENS),
            },
            Some(&correlation_id),
        );

        let raw = match tokio::time::timeout(BATCH_TIMEOUT, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(ModelError::Provider(msg))) => return Err(format!("provider error: {msg}")),
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("timeout after {}s", BATCH_TIMEOUT.as_secs())),
        };

        let records = parse_batch_records(&raw)?;

        Ok(records
            .into_iter()
            .map(|record| {
                let evidence = evidence_from_record(&record, start, end);
                ExtractionResult::from_raw(job_id, record, evidence)
            })
            .collect())
    }

    /// Copy a page range into an independent sub-document. Pure byte-level
    /// work via lopdf; no system dependency.
    fn extract_page_range(doc: &Document, start: u32, end: u32) -> Result<Vec<u8>, lopdf::Error> {
        let mut sub = doc.clone();
        let drop_pages: Vec<u32> = sub
            .get_pages()
            .keys()
            .filter(|&&p| p < start || p > end)
            .copied()
            .collect();
        if !drop_pages.is_empty() {
            sub.delete_pages(&drop_pages);
        }
        sub.prune_objects();
        let mut out = Vec::new();
        sub.save_to(&mut out)?;
        Ok(out)
    }

    /// The per-batch user prompt. Embeds the page positions so the model
    /// has context for items spanning the batch boundary.
    fn batch_prompt(schema: &CompiledSchema, start: u32, end: u32, total_pages: u32) -> String {
        let mut prompt = format!(
            "You are looking at pages {start} to {end} of a {total_pages}-page document. \
             Page numbers in your output must be absolute document page numbers. \
             An item starting near page {end} may continue past this excerpt; extract what is visible.\n\n\
             Extract every record matching this JSON schema:\n{}\n\n\
             Respond with a JSON array of records. Each record should include a \"page\" field \
             with the absolute page number it was found on, and may include \"source_text\" and \
             \"location\" fields describing where on the page it came from.",
            schema.json_schema
        );
        if !schema.examples.is_empty() {
            prompt.push_str("\n\nExamples of well-formed records:\n");
            for example in &schema.examples {
                prompt.push_str(&format!("{example}\n"));
            }
        }
        prompt
    }
}

/// Parse a raw batch response into a list of record values, applying JSON
/// repair first. Accepts a bare array or an object wrapping one under
/// `records`.
pub fn parse_batch_records(raw: &str) -> Result<Vec<serde_json::Value>, String> {
    let repaired = repair::repair(raw);
    let value: serde_json::Value = serde_json::from_str(&repaired)
        .map_err(|e| format!("response was not valid JSON after repair: {e}"))?;

    match value {
        serde_json::Value::Array(records) => Ok(records),
        serde_json::Value::Object(mut map) => match map.remove("records") {
            Some(serde_json::Value::Array(records)) => Ok(records),
            _ => Err("response JSON was not an array of records".to_string()),
        },
        _ => Err("response JSON was not an array of records".to_string()),
    }
}

/// Pull provenance fields out of a record, defaulting the page to the start
/// of the batch range when the model omitted or mislabeled it.
fn evidence_from_record(record: &serde_json::Value, start: u32, end: u32) -> Evidence {
    let page = record
        .get("page")
        .or_else(|| record.get("page_number"))
        .and_then(|v| v.as_u64())
        .map(|p| p as u32)
        .filter(|&p| p >= start && p <= end)
        .unwrap_or(start);

    Evidence {
        source_text: record
            .get("source_text")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        page_number: Some(page),
        location: record
            .get("location")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema::CompiledSchema;
    use std::sync::Mutex;

    #[test]
    fn test_batch_ranges_partition_exactly() {
        for total_pages in 1..=23u32 {
            let ranges = PdfBatchExtractor::batch_ranges(total_pages);
            let expected = (total_pages as usize).div_ceil(BATCH_SIZE as usize);
            assert_eq!(ranges.len(), expected);

            // Ranges cover [1, total] exactly once, no gaps, no overlaps.
            let mut next = 1;
            for &(start, end) in &ranges {
                assert_eq!(start, next);
                assert!(end >= start);
                assert!(end - start + 1 <= BATCH_SIZE);
                next = end + 1;
            }
            assert_eq!(next, total_pages + 1);
        }
    }

    #[test]
    fn test_probe_rejects_non_pdf() {
        let err = PdfBatchExtractor::probe(b"GIF89a not a pdf").unwrap_err();
        assert!(matches!(err, ExtractError::InvalidPdf(_)));
    }

    #[test]
    fn test_parse_batch_records_array() {
        let records = parse_batch_records(r#"[{"name": "bolt"}, {"name": "nut"}]"#).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_parse_batch_records_wrapped_and_fenced() {
        let raw = "```json\n{\"records\": [{\"name\": \"bolt\"}]}\n```";
        let records = parse_batch_records(raw).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_parse_batch_records_truncated() {
        // Output limit cut the response mid-record; repair recovers the rest.
        let raw = r#"[{"name": "bolt", "page": 1}, {"name": "nut", "pa"#;
        let records = parse_batch_records(raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], "bolt");
    }

    #[test]
    fn test_parse_batch_records_non_array() {
        assert!(parse_batch_records(r#"{"message": "no records here"}"#).is_err());
        assert!(parse_batch_records(r#""just a string""#).is_err());
    }

    #[test]
    fn test_evidence_page_clamped_to_range() {
        let in_range = serde_json::json!({"page": 7});
        assert_eq!(evidence_from_record(&in_range, 6, 10).page_number, Some(7));

        let out_of_range = serde_json::json!({"page": 99});
        assert_eq!(evidence_from_record(&out_of_range, 6, 10).page_number, Some(6));

        let missing = serde_json::json!({});
        assert_eq!(evidence_from_record(&missing, 6, 10).page_number, Some(6));
    }

    /// Minimal valid multi-page PDF built with lopdf.
    fn make_pdf(pages: usize) -> Vec<u8> {
        use lopdf::{dictionary, Document, Object};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let kids: Vec<Object> = (0..pages)
            .map(|_| {
                doc.add_object(dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                })
                .into()
            })
            .collect();

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
            }),
        );

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    /// Model stub that records prompts and replays scripted responses.
    struct ScriptedModel {
        responses: Mutex<Vec<Result<String, ModelError>>>,
        prompts: Mutex<Vec<String>>,
        correlations: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String, ModelError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
                correlations: Mutex::new(Vec::new()),
            }
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
            unreachable!("extractor uses generate_with_buffers")
        }

        async fn generate_with_buffers(
            &self,
            _system_prompt: &str,
            user_prompt: &str,
            _file_bytes: &[u8],
            _mime_type: &str,
            _criticality: Criticality,
            _options: GenerateOptions,
            correlation_id: Option<&str>,
        ) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(user_prompt.to_string());
            self.correlations
                .lock()
                .unwrap()
                .push(correlation_id.map(str::to_string));
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn sample_schema() -> CompiledSchema {
        CompiledSchema {
            id: Uuid::new_v4(),
            name: "invoices".to_string(),
            json_schema: serde_json::json!({"type": "object"}),
            prompt: "Extract invoice line items.".to_string(),
            examples: vec![],
            agents: vec![],
        }
    }

    #[tokio::test]
    async fn test_extract_tags_pages_and_survives_bad_batch() {
        // 12 pages -> 3 batches; middle batch returns garbage.
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(r#"[{"item": "bolt", "page": 2}]"#.to_string()),
            Err(ModelError::Provider("rate limit".to_string())),
            Ok(r#"[{"item": "nut", "page": 11}]"#.to_string()),
        ]));
        let extractor = PdfBatchExtractor::new(model.clone());
        let schema = sample_schema();
        let pdf = make_pdf(12);
        let job_id = Uuid::new_v4();

        let outcome = extractor
            .extract(&pdf, job_id, &schema, &NoProgress)
            .await
            .unwrap();

        assert_eq!(outcome.total_pages, 12);
        assert_eq!(outcome.num_batches, 3);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].evidence.page_number, Some(2));
        assert_eq!(outcome.results[1].evidence.page_number, Some(11));

        assert_eq!(outcome.failed_batches.len(), 1);
        assert_eq!(outcome.failed_batches[0].start_page, 6);
        assert_eq!(outcome.failed_batches[0].end_page, 10);

        // Each batch prompt embeds its page range for boundary context.
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("pages 1 to 5 of a 12-page"));
        assert!(prompts[2].contains("pages 11 to 12 of a 12-page"));

        // Every call carried a job-scoped correlation id for its range.
        let correlations = model.correlations.lock().unwrap();
        assert_eq!(
            correlations.as_slice(),
            [
                Some(format!("{job_id}:1-5")),
                Some(format!("{job_id}:6-10")),
                Some(format!("{job_id}:11-12")),
            ]
        );
    }

    #[tokio::test]
    async fn test_extract_rejects_garbage_bytes() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let extractor = PdfBatchExtractor::new(model);
        let schema = sample_schema();

        let err = extractor
            .extract(b"definitely not a pdf", Uuid::new_v4(), &schema, &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidPdf(_)));
    }
}
