//! Top-level job orchestration.
//!
//! One background task owns a job end to end: archive expansion, per-file
//! extraction, agent post-processing, buffered persistence and progress
//! reporting. Files are processed sequentially to bound concurrent model
//! calls; per-file failures are contained and never abort the job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::{Persistence, PersistenceError};
use crate::models::data_layer::{DataLayerRef, DataLayerStatus, FileType};
use crate::models::extraction::ExtractionResult;
use crate::models::job::{JobLogEntry, JobStatus, JobSummary};
use crate::models::schema::CompiledSchema;
use crate::services::agents::AgentPipeline;
use crate::services::archive::ArchiveExpander;
use crate::services::diagnostics;
use crate::services::pdf::{PdfBatchExtractor, ProgressSink};
use crate::services::schema::{SchemaError, SchemaProvider};
use crate::services::storage::{ObjectStore, StorageError};

/// Extraction progress is reported within [0, 95]; the final 5 points are
/// reserved for the closing flush and summary.
const EXTRACTION_PROGRESS_SPAN: u32 = 95;

/// Orchestrator tuning knobs, sourced from `AppConfig`.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Results buffered in memory before a bulk persist.
    pub flush_size: usize,
    /// Wall-clock deadline for one job.
    pub job_deadline: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            flush_size: 10,
            job_deadline: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("At least one data layer is required")]
    NoDataLayers,

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job deadline of {0}s exceeded")]
    DeadlineExceeded(u64),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Sequences the whole extraction pipeline for submitted jobs.
pub struct Orchestrator {
    persistence: Arc<dyn Persistence>,
    storage: Arc<dyn ObjectStore>,
    schemas: Arc<dyn SchemaProvider>,
    archive: Arc<dyn ArchiveExpander>,
    extractor: PdfBatchExtractor,
    pipeline: AgentPipeline,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        storage: Arc<dyn ObjectStore>,
        schemas: Arc<dyn SchemaProvider>,
        archive: Arc<dyn ArchiveExpander>,
        extractor: PdfBatchExtractor,
        pipeline: AgentPipeline,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            persistence,
            storage,
            schemas,
            archive,
            extractor,
            pipeline,
            config,
        }
    }

    /// Validate and persist a new job, then kick off background processing.
    /// Returns as soon as the job row exists; the caller never waits on
    /// pipeline work.
    pub async fn submit(
        self: &Arc<Self>,
        schema_id: Uuid,
        data_layer_ids: Vec<Uuid>,
    ) -> Result<crate::models::job::Job, OrchestratorError> {
        if data_layer_ids.is_empty() {
            return Err(OrchestratorError::NoDataLayers);
        }

        let job = self
            .persistence
            .create_job(schema_id, &data_layer_ids)
            .await?;
        metrics::counter!("extraction_jobs_submitted").increment(1);

        let orchestrator = Arc::clone(self);
        let job_id = job.id;
        tokio::spawn(async move {
            orchestrator.process(job_id).await;
        });

        Ok(job)
    }

    /// Process a job to a terminal state. The task calling this is the only
    /// writer of the job's mutable state, so no locking is needed.
    pub async fn process(&self, job_id: Uuid) {
        let started = Instant::now();
        tracing::info!(job_id = %job_id, "Starting job processing");

        match self.run(job_id).await {
            Ok(summary) => {
                metrics::counter!("extraction_jobs_completed").increment(1);
                metrics::histogram!("extraction_job_seconds")
                    .record(started.elapsed().as_secs_f64());
                tracing::info!(
                    job_id = %job_id,
                    files = summary.files_processed,
                    records = summary.total_records,
                    "Job completed"
                );
            }
            Err(e) => {
                metrics::counter!("extraction_jobs_failed").increment(1);
                tracing::error!(job_id = %job_id, error = %e, "Job failed");
                self.fail_job(job_id, &e.to_string()).await;
            }
        }
    }

    async fn run(&self, job_id: Uuid) -> Result<JobSummary, OrchestratorError> {
        // Missing job or schema is genuinely unexpected and fails the job.
        let job = self
            .persistence
            .get_job(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        let schema = self.schemas.get_and_compile_by_id(job.schema_id).await?;

        self.persistence
            .update_job_status(
                job_id,
                JobStatus::Running,
                Some(0),
                None,
                Some(serde_json::json!({"stage": "expanding_archives"})),
            )
            .await?;
        self.log(job_id, JobLogEntry::info("Processing started")).await;

        let deadline = Instant::now() + self.config.job_deadline;

        self.expand_archives(job_id, deadline).await?;

        let layers = self.persistence.get_job_data_layers(job_id).await?;
        let files: Vec<DataLayerRef> = layers
            .into_iter()
            .filter(|l| l.file_type != FileType::Zip && l.status == DataLayerStatus::Pending)
            .collect();
        let num_files = files.len().max(1) as u32;

        self.persistence
            .update_job_status(
                job_id,
                JobStatus::Running,
                None,
                None,
                Some(serde_json::json!({
                    "stage": "extracting",
                    "total_files": files.len(),
                })),
            )
            .await?;

        let mut buffer: Vec<ExtractionResult> = Vec::new();
        let mut summary = JobSummary {
            files_processed: 0,
            total_records: 0,
            average_confidence: None,
            processed_files: Vec::new(),
        };
        let mut confidence_sum = 0.0;
        let mut confidence_count = 0usize;

        for (idx, layer) in files.iter().enumerate() {
            self.check_deadline(deadline)?;

            self.persistence
                .update_data_layer_status(job_id, layer.id, DataLayerStatus::Processing)
                .await?;

            let base = idx as u32 * EXTRACTION_PROGRESS_SPAN / num_files;
            let next = (idx as u32 + 1) * EXTRACTION_PROGRESS_SPAN / num_files;

            match self
                .process_file(job_id, &schema, layer, base, next - base)
                .await
            {
                Ok(results) => {
                    summary.files_processed += 1;
                    summary.processed_files.push(layer.file_name.clone());
                    summary.total_records += results.len();
                    for result in &results {
                        if let Some(c) = result.confidence_score {
                            confidence_sum += c;
                            confidence_count += 1;
                        }
                    }

                    buffer.extend(results);
                    let flush_size = self.config.flush_size.max(1);
                    while buffer.len() >= flush_size {
                        let batch: Vec<ExtractionResult> = buffer.drain(..flush_size).collect();
                        self.persistence.bulk_insert_results(job_id, &batch).await?;
                        tracing::debug!(job_id = %job_id, flushed = batch.len(), "Flushed result buffer");
                    }

                    self.persistence
                        .update_data_layer_status(job_id, layer.id, DataLayerStatus::Completed)
                        .await?;
                }
                Err(e) => {
                    // File-level isolation: mark the layer failed, tell the
                    // user, move on to the next file.
                    tracing::warn!(
                        job_id = %job_id,
                        file = %layer.file_name,
                        error = %e,
                        "File processing failed, continuing with next file"
                    );
                    self.persistence
                        .update_data_layer_status(job_id, layer.id, DataLayerStatus::Failed)
                        .await?;
                    self.log(
                        job_id,
                        JobLogEntry::error(format!(
                            "File '{}' failed: {e}",
                            layer.file_name
                        )),
                    )
                    .await;
                }
            }

            self.persistence
                .update_job_status(job_id, JobStatus::Running, Some(next as u8), None, None)
                .await?;
        }

        if !buffer.is_empty() {
            self.persistence.bulk_insert_results(job_id, &buffer).await?;
        }

        summary.average_confidence = if confidence_count > 0 {
            Some(confidence_sum / confidence_count as f64)
        } else {
            None
        };

        self.persistence
            .update_job_status(
                job_id,
                JobStatus::Completed,
                Some(100),
                None,
                Some(serde_json::json!({
                    "stage": "completed",
                    "summary": summary,
                })),
            )
            .await?;
        self.log(
            job_id,
            JobLogEntry::info(format!(
                "Completed: {} file(s), {} record(s)",
                summary.files_processed, summary.total_records
            )),
        )
        .await;

        Ok(summary)
    }

    /// Expand pending zip layers, appending member layers to the same job,
    /// until none remain. Members can themselves be zips, so the pass
    /// repeats; each round only sees layers the previous round created.
    /// The original zip reference stays attached and is marked completed;
    /// a failed expansion marks only that zip failed.
    async fn expand_archives(
        &self,
        job_id: Uuid,
        deadline: Instant,
    ) -> Result<(), OrchestratorError> {
        loop {
            let layers = self.persistence.get_job_data_layers(job_id).await?;
            let mut next_order = layers.len() as i32;
            let pending: Vec<DataLayerRef> = layers
                .into_iter()
                .filter(|l| l.file_type == FileType::Zip && l.status == DataLayerStatus::Pending)
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            for layer in &pending {
                self.check_deadline(deadline)?;

                self.persistence
                    .update_data_layer_status(job_id, layer.id, DataLayerStatus::Processing)
                    .await?;

                match self.expand_one(job_id, layer, &mut next_order).await {
                    Ok(count) => {
                        self.persistence
                            .update_data_layer_status(job_id, layer.id, DataLayerStatus::Completed)
                            .await?;
                        self.log(
                            job_id,
                            JobLogEntry::info(format!(
                                "Expanded archive '{}' into {count} file(s)",
                                layer.file_name
                            )),
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = %job_id,
                            file = %layer.file_name,
                            error = %e,
                            "Archive expansion failed"
                        );
                        self.persistence
                            .update_data_layer_status(job_id, layer.id, DataLayerStatus::Failed)
                            .await?;
                        self.log(
                            job_id,
                            JobLogEntry::error(format!(
                                "Archive '{}' could not be expanded: {e}",
                                layer.file_name
                            )),
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn expand_one(
        &self,
        job_id: Uuid,
        layer: &DataLayerRef,
        next_order: &mut i32,
    ) -> Result<usize, String> {
        let zip_bytes = self
            .storage
            .get_bytes(&layer.storage_path)
            .await
            .map_err(|e| e.to_string())?;
        let members = self
            .archive
            .expand(&zip_bytes)
            .await
            .map_err(|e| e.to_string())?;
        let count = members.len();

        for member in members {
            let member_id = Uuid::new_v4();
            let path = format!("jobs/{job_id}/expanded/{member_id}/{}", member.name);
            let stored_path = self
                .storage
                .put_bytes(&path, &member.bytes, &member.mime_type)
                .await
                .map_err(|e| e.to_string())?;

            let member_layer = DataLayerRef {
                id: member_id,
                file_name: member.name.clone(),
                file_type: FileType::from_name(&member.name),
                storage_path: stored_path,
                status: DataLayerStatus::Pending,
                parent_id: Some(layer.id),
            };
            self.persistence
                .add_data_layer_to_job(job_id, &member_layer, *next_order)
                .await
                .map_err(|e| e.to_string())?;
            *next_order += 1;
        }

        Ok(count)
    }

    /// Extract one file and run the agent pipeline over its records.
    /// Errors are stringified: they mark the file failed, never the job.
    async fn process_file(
        &self,
        job_id: Uuid,
        schema: &CompiledSchema,
        layer: &DataLayerRef,
        progress_base: u32,
        progress_span: u32,
    ) -> Result<Vec<ExtractionResult>, String> {
        if layer.file_type != FileType::Pdf {
            tracing::warn!(
                job_id = %job_id,
                file = %layer.file_name,
                file_type = %layer.file_type,
                "Unsupported file type, skipping"
            );
            self.log(
                job_id,
                JobLogEntry::warning(format!(
                    "Skipping '{}': unsupported file type",
                    layer.file_name
                )),
            )
            .await;
            return Ok(Vec::new());
        }

        let bytes = self
            .storage
            .get_bytes(&layer.storage_path)
            .await
            .map_err(|e| e.to_string())?;

        let reporter = BatchProgress {
            persistence: self.persistence.as_ref(),
            job_id,
            base: progress_base,
            span: progress_span,
        };
        let outcome = self
            .extractor
            .extract(&bytes, job_id, schema, &reporter)
            .await
            .map_err(|e| e.to_string())?;

        for failed in &outcome.failed_batches {
            self.log(
                job_id,
                JobLogEntry::warning(format!(
                    "File '{}': pages {}-{} failed: {}",
                    layer.file_name, failed.start_page, failed.end_page, failed.error
                )),
            )
            .await;
        }

        let mut results = outcome.results;

        let agents = schema.active_agents();
        if !agents.is_empty() && !results.is_empty() {
            results = self
                .run_agents(job_id, schema, &agents, results)
                .await;
        }

        for result in &mut results {
            result.source_file_id = Some(layer.id);
            result.source_file_name = Some(layer.file_name.clone());
        }

        Ok(results)
    }

    /// Run the agent pipeline over a file's records and fold its output
    /// back into extraction results. A pipeline with errors still yields
    /// usable records (failed stages forward their input).
    async fn run_agents(
        &self,
        job_id: Uuid,
        schema: &CompiledSchema,
        agents: &[crate::models::schema::AgentDefinition],
        results: Vec<ExtractionResult>,
    ) -> Vec<ExtractionResult> {
        let records: Vec<serde_json::Value> =
            results.iter().map(|r| r.raw_extraction.clone()).collect();
        let input_count = records.len();

        let outcome = self
            .pipeline
            .run_batch(agents, &schema.json_schema, records)
            .await;

        if outcome.has_errors {
            let report = diagnostics::analyze(&outcome.metadata);
            self.log(
                job_id,
                JobLogEntry::warning(format!(
                    "Agent pipeline finished with errors (success rate {:.0}%)",
                    report.overall_success_rate
                )),
            )
            .await;
            for recommendation in &report.recommendations {
                self.log(job_id, JobLogEntry::info(recommendation.clone())).await;
            }
        }

        if outcome.records.len() == input_count {
            // Shape preserved: keep the original results (immutable raw
            // extraction, original evidence) and attach the verified layer
            // plus execution history.
            results
                .into_iter()
                .zip(outcome.records)
                .zip(outcome.metadata)
                .map(|((mut result, record), history)| {
                    if record != result.raw_extraction {
                        result.verified_data = Some(record);
                    }
                    result.agent_execution_metadata = history;
                    result
                })
                .collect()
        } else {
            // Agents filtered or merged records; rebuild results from the
            // final array, re-deriving evidence from record fields.
            outcome
                .records
                .into_iter()
                .zip(outcome.metadata)
                .map(|(record, history)| {
                    let mut result = ExtractionResult::from_raw(
                        job_id,
                        record,
                        crate::models::extraction::Evidence::default(),
                    );
                    result.evidence.page_number = result
                        .raw_extraction
                        .get("page")
                        .and_then(|v| v.as_u64())
                        .map(|p| p as u32);
                    result.agent_execution_metadata = history;
                    result
                })
                .collect()
        }
    }

    /// Terminal failure path: record the error and force-fail anything
    /// still pending. Cleanup is best-effort; its own errors are only
    /// logged.
    async fn fail_job(&self, job_id: Uuid, message: &str) {
        if let Err(e) = self
            .persistence
            .update_job_status(job_id, JobStatus::Failed, None, Some(message), None)
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job failed");
        }
        self.log(job_id, JobLogEntry::error(format!("Job failed: {message}")))
            .await;

        match self.persistence.get_job_data_layers(job_id).await {
            Ok(layers) => {
                for layer in layers.iter().filter(|l| {
                    matches!(
                        l.status,
                        DataLayerStatus::Pending | DataLayerStatus::Processing
                    )
                }) {
                    if let Err(e) = self
                        .persistence
                        .update_data_layer_status(job_id, layer.id, DataLayerStatus::Failed)
                        .await
                    {
                        tracing::warn!(
                            job_id = %job_id,
                            data_layer_id = %layer.id,
                            error = %e,
                            "Failed to force-fail data layer"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Could not list data layers for cleanup");
            }
        }
    }

    fn check_deadline(&self, deadline: Instant) -> Result<(), OrchestratorError> {
        if Instant::now() >= deadline {
            Err(OrchestratorError::DeadlineExceeded(
                self.config.job_deadline.as_secs(),
            ))
        } else {
            Ok(())
        }
    }

    /// Append to the user-visible job log. Log failures never interrupt
    /// processing.
    async fn log(&self, job_id: Uuid, entry: JobLogEntry) {
        if let Err(e) = self.persistence.append_job_log(job_id, entry).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to append job log entry");
        }
    }
}

/// Advances job progress proportionally to batches completed within one
/// file's progress share.
struct BatchProgress<'a> {
    persistence: &'a dyn Persistence,
    job_id: Uuid,
    base: u32,
    span: u32,
}

#[async_trait]
impl ProgressSink for BatchProgress<'_> {
    async fn batch_completed(&self, batches_done: u32, total_batches: u32) {
        let pct = self.base + self.span * batches_done / total_batches.max(1);
        if let Err(e) = self
            .persistence
            .update_job_status(
                self.job_id,
                JobStatus::Running,
                Some(pct.min(100) as u8),
                None,
                None,
            )
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to update batch progress");
        }
    }
}
