use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::db::store::{RecordStore, Settlement};
use crate::models::generation::{record_id_from_job_name, GenerationRequest};
use crate::services::generation::{GenerationAdapter, GenerationError};
use crate::services::prompt;
use crate::services::queue::{FailOutcome, JobQueue, Lease, QueueError};
use crate::services::storage::{ArtifactStore, StorageError};
use crate::services::watermark::{WatermarkError, Watermarker};

/// One job, end to end: prompt, generate, watermark, upload, settle.
pub struct Pipeline {
    generator: GenerationAdapter,
    watermarker: Arc<Watermarker>,
    artifacts: Arc<dyn ArtifactStore>,
    records: Arc<dyn RecordStore>,
}

impl Pipeline {
    pub fn new(
        generator: GenerationAdapter,
        watermarker: Arc<Watermarker>,
        artifacts: Arc<dyn ArtifactStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            generator,
            watermarker,
            artifacts,
            records,
        }
    }

    /// Run the job. Nothing touches the ledger before the final settlement,
    /// so any error returned here leaves the owner's balance unchanged.
    pub async fn execute(&self, job: &GenerationRequest) -> Result<Settlement, PipelineError> {
        let prompt = prompt::compose_prompt(job);

        let generated = self.generator.generate(job, &prompt).await?;
        tracing::debug!(
            record_id = %job.record_id,
            bytes = generated.bytes.len(),
            mime = %generated.mime,
            "Image generated"
        );

        let watermarker = Arc::clone(&self.watermarker);
        let tier = job.tier;
        let finished = tokio::task::spawn_blocking(move || watermarker.finish(tier, generated))
            .await
            .map_err(|e| WatermarkError::Aborted(e.to_string()))??;

        let image_url = self.artifacts.upload(&finished.bytes, &finished.mime).await?;
        tracing::debug!(record_id = %job.record_id, image_url = %image_url, "Image uploaded");

        Ok(self.records.settle_completed(job, &prompt, &image_url).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Watermarking failed: {0}")]
    Watermark(#[from] WatermarkError),

    #[error("Upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Persisting result failed: {0}")]
    Persistence(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Persistence(#[from] sqlx::Error),
}

/// What a single pass of the worker loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing was ready.
    Idle,
    Completed(Settlement),
    Retrying { delay: Duration },
    /// Terminally failed; the record is closed.
    Failed,
    /// Another delivery owns the job now.
    Stale,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Fixed-size pool of tasks draining the job queue.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, pipeline: Arc<Pipeline>, config: WorkerConfig) -> Self {
        Self {
            queue,
            pipeline,
            config,
        }
    }

    /// Run until `shutdown` flips to `true`. In-flight jobs finish first.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        for worker in 0..self.config.concurrency.max(1) {
            let queue = Arc::clone(&self.queue);
            let pipeline = Arc::clone(&self.pipeline);
            let poll_interval = self.config.poll_interval;
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                worker_loop(worker, queue, pipeline, poll_interval, shutdown).await;
            });
        }

        tracing::info!(concurrency = tasks.len(), "Worker pool started");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match process_next_job(worker, queue.as_ref(), &pipeline).await {
            Ok(JobOutcome::Idle) => {
                tracing::trace!(worker, "No jobs available, sleeping");
                if wait_or_shutdown(poll_interval, &mut shutdown).await {
                    break;
                }
            }
            Ok(outcome) => {
                tracing::debug!(worker, outcome = ?outcome, "Job processed, checking for next job");
            }
            Err(e) => {
                tracing::error!(worker, error = %e, "Error processing job, will retry");
                if wait_or_shutdown(poll_interval, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    tracing::debug!(worker, "Worker stopped");
}

/// Sleep for `interval`. Returns `true` if shutdown was requested meanwhile.
async fn wait_or_shutdown(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Claim and process at most one job.
///
/// The job is acknowledged only after its result is committed, so a crash in
/// between leads to redelivery and the settlement guard turns the repeat
/// commit into a no-op.
pub async fn process_next_job(
    worker: usize,
    queue: &dyn JobQueue,
    pipeline: &Pipeline,
) -> Result<JobOutcome, WorkerError> {
    let lease = match queue.claim().await {
        Ok(Some(lease)) => lease,
        Ok(None) => return Ok(JobOutcome::Idle),
        Err(QueueError::Corrupt { name }) => {
            // Payload is gone; close the record so the owner is not left waiting.
            if let Some(record_id) = record_id_from_job_name(&name) {
                close_record(pipeline, record_id, "Thumbnail request could not be processed").await?;
            }
            return Ok(JobOutcome::Failed);
        }
        Err(e) => return Err(e.into()),
    };

    let job = &lease.job;
    tracing::info!(
        worker,
        record_id = %job.record_id,
        owner_id = %job.owner_id,
        attempt = lease.attempt,
        max_attempts = lease.max_attempts,
        tier = %job.tier,
        "Processing thumbnail job"
    );

    // Redelivered after a lost ack, or closed meanwhile: nothing left to generate.
    if let Some(settlement) = pipeline.records.prior_settlement(job.record_id).await? {
        record_settlement(worker, job, settlement);
        if !queue.ack(&lease).await? {
            tracing::warn!(worker, record_id = %job.record_id, "Lease was stale at acknowledgement");
        }
        return Ok(JobOutcome::Completed(settlement));
    }

    if lease.is_exhausted() {
        tracing::warn!(
            worker,
            record_id = %job.record_id,
            attempt = lease.attempt,
            "Job redelivered past its retry budget"
        );
        let summary = format!(
            "Thumbnail generation did not finish after {} attempts",
            lease.max_attempts
        );
        return fail_terminally(queue, pipeline, &lease, &summary).await;
    }

    let started = Instant::now();
    match pipeline.execute(job).await {
        Ok(settlement) => {
            metrics::histogram!("thumbnail_generation_seconds")
                .record(started.elapsed().as_secs_f64());
            record_settlement(worker, job, settlement);

            if !queue.ack(&lease).await? {
                tracing::warn!(worker, record_id = %job.record_id, "Lease was stale at acknowledgement");
            }
            Ok(JobOutcome::Completed(settlement))
        }
        Err(e) => {
            tracing::error!(
                worker,
                record_id = %job.record_id,
                attempt = lease.attempt,
                error = %e,
                "Thumbnail generation attempt failed"
            );

            if lease.is_final_attempt() {
                let summary = format!(
                    "Thumbnail generation failed after {} attempts: {}",
                    lease.attempt, e
                );
                return fail_terminally(queue, pipeline, &lease, &summary).await;
            }

            match queue.fail(&lease, &e.to_string()).await? {
                FailOutcome::Retry { delay } => {
                    metrics::counter!("thumbnail_jobs_retried_total").increment(1);
                    tracing::info!(
                        worker,
                        record_id = %job.record_id,
                        attempt = lease.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Job scheduled for retry"
                    );
                    Ok(JobOutcome::Retrying { delay })
                }
                FailOutcome::Exhausted => {
                    close_record(pipeline, job.record_id, &e.to_string()).await?;
                    Ok(JobOutcome::Failed)
                }
                FailOutcome::Stale => Ok(JobOutcome::Stale),
            }
        }
    }
}

/// Close the record, then retire the job. If the record update fails the
/// lease is left to expire and the job comes back for another try.
async fn fail_terminally(
    queue: &dyn JobQueue,
    pipeline: &Pipeline,
    lease: &Lease,
    summary: &str,
) -> Result<JobOutcome, WorkerError> {
    close_record(pipeline, lease.job.record_id, summary).await?;

    match queue.fail(lease, summary).await? {
        FailOutcome::Stale => Ok(JobOutcome::Stale),
        FailOutcome::Retry { .. } | FailOutcome::Exhausted => Ok(JobOutcome::Failed),
    }
}

async fn close_record(pipeline: &Pipeline, record_id: Uuid, summary: &str) -> Result<(), WorkerError> {
    if pipeline.records.mark_failed(record_id, summary).await? {
        metrics::counter!("thumbnail_jobs_failed_total").increment(1);
        tracing::warn!(record_id = %record_id, error = summary, "Thumbnail marked failed");
    } else {
        tracing::debug!(record_id = %record_id, "Record already terminal");
    }
    Ok(())
}

fn record_settlement(worker: usize, job: &GenerationRequest, settlement: Settlement) {
    match settlement {
        Settlement::Debited { remaining } => {
            metrics::counter!("thumbnail_jobs_completed_total", "tier" => job.tier.to_string())
                .increment(1);
            metrics::counter!("thumbnail_credits_debited_total")
                .increment(job.credits_required.max(0) as u64);
            tracing::info!(
                worker,
                record_id = %job.record_id,
                owner_id = %job.owner_id,
                debited = job.credits_required,
                remaining,
                "Thumbnail completed"
            );
        }
        Settlement::Underfunded => {
            metrics::counter!("thumbnail_jobs_completed_total", "tier" => job.tier.to_string())
                .increment(1);
            tracing::warn!(
                worker,
                record_id = %job.record_id,
                owner_id = %job.owner_id,
                required = job.credits_required,
                "Thumbnail completed but balance no longer covered the cost"
            );
        }
        Settlement::AlreadySettled => {
            tracing::info!(worker, record_id = %job.record_id, "Job already settled by an earlier delivery");
        }
        Settlement::RecordClosed => {
            tracing::warn!(worker, record_id = %job.record_id, "Record was already terminal; result discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::Tier;
    use crate::models::generation::{job_name, ReferenceImage};
    use crate::models::thumbnail::{AspectRatio, ColorScheme, Style, ThumbnailStatus};
    use crate::services::generation::{GeneratedImage, GenerationInput, ImageGenerator};
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ---- queue ----

    struct Entry {
        name: String,
        priority: u32,
        attempts: u32,
        job: GenerationRequest,
    }

    #[derive(Default)]
    struct QueueState {
        ready: VecDeque<Entry>,
        leased: HashMap<String, (String, Entry)>,
        completed: Vec<String>,
        failed: Vec<String>,
        corrupt: Vec<String>,
    }

    #[derive(Default)]
    struct FakeQueue {
        state: Mutex<QueueState>,
        fail_next_ack: AtomicBool,
    }

    impl FakeQueue {
        fn push(&self, job: GenerationRequest, priority: u32) {
            self.push_with_attempts(job, priority, 0);
        }

        fn push_with_attempts(&self, job: GenerationRequest, priority: u32, attempts: u32) {
            self.state.lock().unwrap().ready.push_back(Entry {
                name: job.job_name(),
                priority,
                attempts,
                job,
            });
        }

        /// Simulate lease expiry after a worker crash.
        fn expire_leases(&self) {
            let mut state = self.state.lock().unwrap();
            let leased: Vec<_> = state.leased.drain().map(|(_, (_, e))| e).collect();
            state.ready.extend(leased);
        }

        fn completed(&self) -> Vec<String> {
            self.state.lock().unwrap().completed.clone()
        }

        fn failed(&self) -> Vec<String> {
            self.state.lock().unwrap().failed.clone()
        }
    }

    fn holds(state: &QueueState, lease: &Lease) -> bool {
        state
            .leased
            .get(&lease.name)
            .is_some_and(|(token, _)| *token == lease.token)
    }

    #[async_trait]
    impl JobQueue for FakeQueue {
        async fn enqueue(&self, job: &GenerationRequest, priority: u32) -> Result<bool, QueueError> {
            self.push(job.clone(), priority);
            Ok(true)
        }

        async fn claim(&self) -> Result<Option<Lease>, QueueError> {
            let mut state = self.state.lock().unwrap();
            if let Some(name) = state.corrupt.pop() {
                state.failed.push(name.clone());
                return Err(QueueError::Corrupt { name });
            }
            let Some(best) = state
                .ready
                .iter()
                .enumerate()
                .min_by_key(|(i, e)| (e.priority, *i))
                .map(|(i, _)| i)
            else {
                return Ok(None);
            };
            let mut entry = state.ready.remove(best).unwrap();
            entry.attempts += 1;
            let token = Uuid::new_v4().to_string();
            let lease = Lease {
                name: entry.name.clone(),
                token: token.clone(),
                attempt: entry.attempts,
                max_attempts: 3,
                job: entry.job.clone(),
            };
            state.leased.insert(entry.name.clone(), (token, entry));
            Ok(Some(lease))
        }

        async fn ack(&self, lease: &Lease) -> Result<bool, QueueError> {
            if self.fail_next_ack.swap(false, Ordering::SeqCst) {
                return Err(QueueError::Serialize(
                    serde_json::from_str::<u8>("connection reset").unwrap_err(),
                ));
            }
            let mut state = self.state.lock().unwrap();
            if !holds(&state, lease) {
                return Ok(false);
            }
            state.leased.remove(&lease.name);
            state.completed.push(lease.name.clone());
            Ok(true)
        }

        async fn fail(&self, lease: &Lease, _error: &str) -> Result<FailOutcome, QueueError> {
            let mut state = self.state.lock().unwrap();
            if !holds(&state, lease) {
                return Ok(FailOutcome::Stale);
            }
            let (_, entry) = state.leased.remove(&lease.name).unwrap();
            if entry.attempts < 3 {
                state.ready.push_back(entry);
                Ok(FailOutcome::Retry {
                    delay: Duration::from_millis(0),
                })
            } else {
                state.failed.push(entry.name);
                Ok(FailOutcome::Exhausted)
            }
        }

        async fn depth(&self) -> Result<u64, QueueError> {
            Ok(self.state.lock().unwrap().ready.len() as u64)
        }
    }

    // ---- records ----

    #[derive(Default)]
    struct RecordState {
        status: HashMap<Uuid, ThumbnailStatus>,
        image_url: HashMap<Uuid, String>,
        balances: HashMap<Uuid, i32>,
        settlements: HashSet<Uuid>,
    }

    #[derive(Default)]
    struct FakeRecords {
        state: Mutex<RecordState>,
    }

    impl FakeRecords {
        fn open(&self, job: &GenerationRequest) {
            self.state
                .lock()
                .unwrap()
                .status
                .insert(job.record_id, ThumbnailStatus::Generating);
        }

        fn fund(&self, owner: Uuid, credits: i32) {
            self.state.lock().unwrap().balances.insert(owner, credits);
        }

        fn balance(&self, owner: Uuid) -> i32 {
            self.state.lock().unwrap().balances[&owner]
        }

        fn status(&self, record: Uuid) -> ThumbnailStatus {
            self.state.lock().unwrap().status[&record]
        }
    }

    #[async_trait]
    impl RecordStore for FakeRecords {
        async fn settle_completed(
            &self,
            job: &GenerationRequest,
            _prompt: &str,
            image_url: &str,
        ) -> Result<Settlement, sqlx::Error> {
            let mut state = self.state.lock().unwrap();
            if state.settlements.contains(&job.record_id) {
                return Ok(Settlement::AlreadySettled);
            }
            if state.status.get(&job.record_id) != Some(&ThumbnailStatus::Generating) {
                return Ok(Settlement::RecordClosed);
            }
            state.settlements.insert(job.record_id);
            state
                .status
                .insert(job.record_id, ThumbnailStatus::Completed);
            state
                .image_url
                .insert(job.record_id, image_url.to_string());

            let balance = state.balances.entry(job.owner_id).or_insert(0);
            if *balance >= job.credits_required {
                *balance -= job.credits_required;
                Ok(Settlement::Debited {
                    remaining: *balance,
                })
            } else {
                Ok(Settlement::Underfunded)
            }
        }

        async fn mark_failed(&self, record_id: Uuid, _error: &str) -> Result<bool, sqlx::Error> {
            let mut state = self.state.lock().unwrap();
            match state.status.get(&record_id) {
                Some(ThumbnailStatus::Generating) => {
                    state.status.insert(record_id, ThumbnailStatus::Failed);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn prior_settlement(
            &self,
            record_id: Uuid,
        ) -> Result<Option<Settlement>, sqlx::Error> {
            let state = self.state.lock().unwrap();
            if state.settlements.contains(&record_id) {
                return Ok(Some(Settlement::AlreadySettled));
            }
            match state.status.get(&record_id) {
                Some(ThumbnailStatus::Generating) => Ok(None),
                _ => Ok(Some(Settlement::RecordClosed)),
            }
        }
    }

    // ---- generator / storage ----

    struct FakeGenerator {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeGenerator {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl ImageGenerator for FakeGenerator {
        async fn generate(&self, _input: &GenerationInput) -> Result<GeneratedImage, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GenerationError::NoImage);
            }
            Ok(GeneratedImage {
                bytes: black_png(),
                mime: "image/png".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct FakeArtifacts {
        uploads: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    #[async_trait]
    impl ArtifactStore for FakeArtifacts {
        async fn upload(&self, data: &[u8], _content_type: &str) -> Result<String, StorageError> {
            if self.fail {
                return Err(StorageError::Rejected { status: 503 });
            }
            let mut uploads = self.uploads.lock().unwrap();
            uploads.push(data.to_vec());
            Ok(format!("https://cdn.test/thumbnails/{}.png", uploads.len()))
        }
    }

    fn black_png() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(200, 100, Rgba([0, 0, 0, 255])))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    struct Harness {
        queue: Arc<FakeQueue>,
        records: Arc<FakeRecords>,
        artifacts: Arc<FakeArtifacts>,
        generator: Arc<FakeGenerator>,
        pipeline: Arc<Pipeline>,
    }

    fn harness(generator_fails: bool, upload_fails: bool) -> Harness {
        let queue = Arc::new(FakeQueue::default());
        let records = Arc::new(FakeRecords::default());
        let artifacts = Arc::new(FakeArtifacts {
            uploads: Mutex::new(Vec::new()),
            fail: upload_fails,
        });
        let generator = Arc::new(FakeGenerator::new(generator_fails));
        let mark = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 20, Rgba([255, 0, 0, 255])));
        let pipeline = Arc::new(Pipeline::new(
            GenerationAdapter::new(generator.clone(), generator.clone()),
            Arc::new(Watermarker::new(mark)),
            artifacts.clone(),
            records.clone(),
        ));
        Harness {
            queue,
            records,
            artifacts,
            generator,
            pipeline,
        }
    }

    fn job(owner: Uuid, tier: Tier, with_reference: bool) -> GenerationRequest {
        GenerationRequest {
            record_id: Uuid::new_v4(),
            owner_id: owner,
            title: "Ten Rust Tips".to_string(),
            detail: None,
            style: Style::BoldGraphic,
            color_scheme: ColorScheme::Vibrant,
            aspect_ratio: AspectRatio::Landscape,
            reference_image: with_reference.then(|| ReferenceImage {
                bytes: black_png(),
                mime: "image/png".to_string(),
            }),
            tier,
            credits_required: tier.generation_cost(with_reference),
            uses_reference_image: with_reference,
        }
    }

    impl Harness {
        fn submit(&self, job: &GenerationRequest) {
            self.records.open(job);
            self.queue.push(job.clone(), job.tier.priority());
        }

        async fn step(&self) -> JobOutcome {
            process_next_job(0, &*self.queue, &self.pipeline)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_success_debits_exactly_once() {
        let h = harness(false, false);
        let owner = Uuid::new_v4();
        h.records.fund(owner, 50);
        let job = job(owner, Tier::Creator, false);
        h.submit(&job);

        assert_eq!(
            h.step().await,
            JobOutcome::Completed(Settlement::Debited { remaining: 45 })
        );
        assert_eq!(h.records.balance(owner), 45);
        assert_eq!(h.records.status(job.record_id), ThumbnailStatus::Completed);
        assert_eq!(h.queue.completed(), vec![job_name(job.record_id)]);
        assert_eq!(h.step().await, JobOutcome::Idle);
    }

    #[tokio::test]
    async fn test_failing_job_exhausts_budget_without_charge() {
        let h = harness(true, false);
        let owner = Uuid::new_v4();
        h.records.fund(owner, 50);
        let job = job(owner, Tier::Creator, true);
        h.submit(&job);

        assert!(matches!(h.step().await, JobOutcome::Retrying { .. }));
        assert_eq!(h.records.status(job.record_id), ThumbnailStatus::Generating);
        assert!(matches!(h.step().await, JobOutcome::Retrying { .. }));
        assert_eq!(h.step().await, JobOutcome::Failed);

        assert_eq!(h.records.status(job.record_id), ThumbnailStatus::Failed);
        assert_eq!(h.records.balance(owner), 50);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.queue.failed(), vec![job.job_name()]);
        assert_eq!(h.step().await, JobOutcome::Idle);
    }

    #[tokio::test]
    async fn test_redelivery_after_commit_does_not_double_debit() {
        let h = harness(false, false);
        let owner = Uuid::new_v4();
        h.records.fund(owner, 50);
        let job = job(owner, Tier::Creator, false);
        h.submit(&job);

        // Commit succeeds, acknowledgement is lost.
        h.queue.fail_next_ack.store(true, Ordering::SeqCst);
        assert!(process_next_job(0, &*h.queue, &h.pipeline).await.is_err());
        assert_eq!(h.records.balance(owner), 45);

        h.queue.expire_leases();
        assert_eq!(
            h.step().await,
            JobOutcome::Completed(Settlement::AlreadySettled)
        );
        assert_eq!(h.records.balance(owner), 45);
        assert_eq!(h.queue.completed(), vec![job.job_name()]);

        // The redelivery was settled from the ledger, not generated again.
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.artifacts.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_record_is_acked_without_generating() {
        let h = harness(false, false);
        let owner = Uuid::new_v4();
        h.records.fund(owner, 50);
        let job = job(owner, Tier::Pro, false);
        h.submit(&job);
        h.records.mark_failed(job.record_id, "cancelled").await.unwrap();

        assert_eq!(
            h.step().await,
            JobOutcome::Completed(Settlement::RecordClosed)
        );
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert!(h.artifacts.uploads.lock().unwrap().is_empty());
        assert_eq!(h.queue.completed(), vec![job.job_name()]);
        assert_eq!(h.records.balance(owner), 50);
    }

    #[tokio::test]
    async fn test_upload_failure_leaves_balance_untouched() {
        let h = harness(false, true);
        let owner = Uuid::new_v4();
        h.records.fund(owner, 50);
        let job = job(owner, Tier::Pro, false);
        h.submit(&job);

        assert!(matches!(h.step().await, JobOutcome::Retrying { .. }));
        assert_eq!(h.records.balance(owner), 50);
        assert_eq!(h.records.status(job.record_id), ThumbnailStatus::Generating);
    }

    #[tokio::test]
    async fn test_free_tier_output_is_watermarked() {
        let h = harness(false, false);
        let free_owner = Uuid::new_v4();
        let pro_owner = Uuid::new_v4();
        h.records.fund(free_owner, 25);
        h.records.fund(pro_owner, 25);
        h.submit(&job(free_owner, Tier::Free, false));
        h.submit(&job(pro_owner, Tier::Pro, false));

        // Pro has the better priority and is claimed first.
        h.step().await;
        h.step().await;

        let uploads = h.artifacts.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0], black_png());

        let marked = image::load_from_memory(&uploads[1]).unwrap().to_rgba8();
        // 30x15 mark placed 20px from the bottom-right corner.
        let inside = marked.get_pixel(165, 72);
        assert!(inside[0] > 200 && inside[1] < 50);
        assert_eq!(marked.get_pixel(10, 10)[0], 0);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_never_overdraw() {
        let h = harness(false, false);
        let owner = Uuid::new_v4();
        h.records.fund(owner, 12);
        let jobs: Vec<_> = (0..3).map(|_| job(owner, Tier::Creator, false)).collect();
        for job in &jobs {
            h.submit(job);
        }

        let outcomes = futures::future::join_all(
            (0..3).map(|worker| process_next_job(worker, &*h.queue, &h.pipeline)),
        )
        .await;

        let mut debited = 0;
        let mut underfunded = 0;
        for outcome in outcomes {
            match outcome.unwrap() {
                JobOutcome::Completed(Settlement::Debited { .. }) => debited += 1,
                JobOutcome::Completed(Settlement::Underfunded) => underfunded += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!((debited, underfunded), (2, 1));
        assert_eq!(h.records.balance(owner), 2);
        for job in &jobs {
            assert_eq!(h.records.status(job.record_id), ThumbnailStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_lease_past_budget_fails_without_generating() {
        let h = harness(false, false);
        let owner = Uuid::new_v4();
        h.records.fund(owner, 50);
        let job = job(owner, Tier::Creator, false);
        h.records.open(&job);
        h.queue.push_with_attempts(job.clone(), 2, 3);

        assert_eq!(h.step().await, JobOutcome::Failed);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.records.status(job.record_id), ThumbnailStatus::Failed);
        assert_eq!(h.records.balance(owner), 50);
    }

    #[tokio::test]
    async fn test_corrupt_payload_closes_record() {
        let h = harness(false, false);
        let job = job(Uuid::new_v4(), Tier::Pro, false);
        h.records.open(&job);
        h.queue.state.lock().unwrap().corrupt.push(job.job_name());

        assert_eq!(h.step().await, JobOutcome::Failed);
        assert_eq!(h.records.status(job.record_id), ThumbnailStatus::Failed);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops_on_shutdown() {
        let h = harness(false, false);
        let owner = Uuid::new_v4();
        h.records.fund(owner, 100);
        let jobs: Vec<_> = (0..4).map(|_| job(owner, Tier::Pro, false)).collect();
        for job in &jobs {
            h.submit(job);
        }

        let (tx, rx) = watch::channel(false);
        let pool = WorkerPool::new(
            h.queue.clone(),
            h.pipeline.clone(),
            WorkerConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(10),
            },
        );
        let running = tokio::spawn(pool.run(rx));

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.completed().len() < jobs.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.records.balance(owner), 80);
    }
}
