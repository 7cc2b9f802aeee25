use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::{sync::mpsc, time};
use tracing::{error, info, warn};

use crate::{
    models::{CacheState, ErrorPayload, JobState},
    pipeline::{PipelineState, StateObserver},
    AppState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedTask {
    Import(String),
    Cache(String),
}

impl QueuedTask {
    fn job_id(&self) -> &str {
        match self {
            Self::Import(job_id) | Self::Cache(job_id) => job_id,
        }
    }
}

pub fn spawn_task_worker(state: AppState, mut queue_rx: mpsc::Receiver<QueuedTask>) {
    tokio::spawn(async move {
        while let Some(task) = queue_rx.recv().await {
            info!(job_id = %task.job_id(), task = ?task, "Worker picked task");
            let result = match &task {
                QueuedTask::Import(job_id) => process_import_job(&state, job_id).await,
                QueuedTask::Cache(job_id) => process_cache_job(&state, job_id).await,
            };
            if let Err(err) = result {
                let job_id = task.job_id();
                error!("Task for job {job_id} failed: {err:#}");
                let mut jobs = state.jobs.write().await;
                if let Some(job) = jobs.get_mut(job_id) {
                    match &task {
                        QueuedTask::Import(_) => {
                            job.status = JobState::Failed;
                            job.progress = 100.0;
                            job.message = Some("Import failed".to_string());
                            job.request = None;
                        }
                        QueuedTask::Cache(_) => {
                            job.cache_state = CacheState::Failed;
                            job.message = Some("Cache build failed".to_string());
                        }
                    }
                    job.updated_at = Utc::now();
                    job.error = Some(ErrorPayload {
                        code: "INTERNAL_ERROR".to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    });
}

pub fn spawn_cleanup_worker(state: AppState) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let pruned = prune_finished_jobs(&state).await;
            if pruned > 0 {
                info!(pruned, "Pruned finished import jobs");
            }
        }
    });
}

struct JobObserver {
    state: AppState,
    job_id: String,
}

fn progress_for(state: PipelineState) -> f64 {
    match state {
        PipelineState::Start => 5.0,
        PipelineState::Detect => 10.0,
        PipelineState::Fresh | PipelineState::Versioned => 30.0,
        PipelineState::Done | PipelineState::Cached | PipelineState::Failed => 100.0,
    }
}

fn message_for(state: PipelineState) -> &'static str {
    match state {
        PipelineState::Start => "Import started",
        PipelineState::Detect => "Detecting existing model entity",
        PipelineState::Fresh => "Provisioning new model entity",
        PipelineState::Versioned => "Versioning existing model entity",
        PipelineState::Done => "Import completed",
        PipelineState::Cached => "Data cache built",
        PipelineState::Failed => "Import failed",
    }
}

#[async_trait]
impl StateObserver for JobObserver {
    async fn on_state(&self, pipeline_state: PipelineState) {
        let mut jobs = self.state.jobs.write().await;
        let Some(job) = jobs.get_mut(&self.job_id) else {
            warn!(job_id = %self.job_id, "State update for unknown job");
            return;
        };
        job.pipeline_state = pipeline_state;
        job.updated_at = Utc::now();
        // cache stage transitions leave the import progress alone
        if matches!(job.status, JobState::Running) {
            job.progress = progress_for(pipeline_state);
            job.message = Some(message_for(pipeline_state).to_string());
        }
        info!(
            job_id = %self.job_id,
            state = ?pipeline_state,
            progress = job.progress,
            "Pipeline state update"
        );
    }
}

async fn process_import_job(state: &AppState, job_id: &str) -> Result<()> {
    let request = {
        let mut jobs = state.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            anyhow::bail!("Unknown job id: {job_id}");
        };

        job.status = JobState::Running;
        job.progress = 1.0;
        job.message = Some("Import running".to_string());
        job.updated_at = Utc::now();
        job.error = None;

        job.request.clone().context("Missing request payload")?
    };

    info!(
        job_id = %job_id,
        file_id = %request.source_file_id,
        package = %request.source_file_name,
        files = request.files.len(),
        "Import job started"
    );

    let observer = JobObserver {
        state: state.clone(),
        job_id: job_id.to_string(),
    };
    let result = state.pipeline.run(&request, &observer).await;

    let mut jobs = state.jobs.write().await;
    let Some(job) = jobs.get_mut(job_id) else {
        anyhow::bail!("Job {job_id} disappeared while running");
    };
    job.updated_at = Utc::now();
    job.progress = 100.0;
    job.request = None;
    match result {
        Ok(output) => {
            info!(
                job_id = %job_id,
                entity_id = %output.composite_entity_id,
                elements = output.written.elements,
                types = output.written.types,
                "Import job completed"
            );
            job.status = JobState::Completed;
            job.message = Some("Import completed".to_string());
            job.output = Some(output);
            job.error = None;
        }
        Err(err) => {
            job.status = JobState::Failed;
            job.message = Some("Import failed".to_string());
            job.error = Some(ErrorPayload {
                code: err.code().to_string(),
                message: err.to_string(),
            });
        }
    }
    Ok(())
}

async fn process_cache_job(state: &AppState, job_id: &str) -> Result<()> {
    let output = {
        let mut jobs = state.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            anyhow::bail!("Unknown job id: {job_id}");
        };
        job.cache_state = CacheState::Running;
        job.updated_at = Utc::now();
        job.output.clone().context("Import output missing for cache build")?
    };

    let observer = JobObserver {
        state: state.clone(),
        job_id: job_id.to_string(),
    };
    let result = state.pipeline.build_cache(&output, &observer).await;

    let mut jobs = state.jobs.write().await;
    let Some(job) = jobs.get_mut(job_id) else {
        anyhow::bail!("Job {job_id} disappeared while building cache");
    };
    job.updated_at = Utc::now();
    match result {
        Ok(records) => {
            info!(job_id = %job_id, records, "Cache build completed");
            job.cache_state = CacheState::Completed;
            job.cache_records = Some(records);
            job.message = Some("Data cache built".to_string());
        }
        Err(err) => {
            job.cache_state = CacheState::Failed;
            job.message = Some("Cache build failed".to_string());
            job.error = Some(ErrorPayload {
                code: err.code().to_string(),
                message: err.to_string(),
            });
        }
    }
    Ok(())
}

async fn prune_finished_jobs(state: &AppState) -> usize {
    let cutoff = Utc::now() - ChronoDuration::seconds(state.config.job_retention_seconds as i64);
    let mut jobs = state.jobs.write().await;
    let before = jobs.len();
    jobs.retain(|job_id, job| {
        let expired = job.is_finished() && job.updated_at <= cutoff;
        if expired {
            info!(job_id = %job_id, "Expiring finished import job");
        }
        !expired
    });
    before - jobs.len()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};

    use tokio::sync::RwLock;

    use super::*;
    use crate::{
        config::Config,
        extract::tests::sample_request,
        ids::RandomIds,
        models::JobRecord,
        pipeline::ImportPipeline,
        store::SqliteItemStore,
    };

    pub(crate) fn test_config() -> Config {
        Config {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            api_key: "test-key".to_string(),
            api_key_is_fallback: false,
            store_path: PathBuf::from(":memory:"),
            namespace: "default".to_string(),
            short_name_len: 11,
            queue_capacity: 8,
            job_retention_seconds: 60,
            cache_fanout_warn: 50,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }

    pub(crate) fn test_state() -> (AppState, mpsc::Receiver<QueuedTask>) {
        let config = test_config();
        let store = Arc::new(SqliteItemStore::open_in_memory().unwrap());
        let pipeline = ImportPipeline::new(store, Arc::new(RandomIds), config.pipeline_options());
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let state = AppState {
            config,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            queue_tx,
            pipeline: Arc::new(pipeline),
        };
        (state, queue_rx)
    }

    async fn wait_for<F>(state: &AppState, job_id: &str, done: F) -> JobRecord
    where
        F: Fn(&JobRecord) -> bool,
    {
        for _ in 0..200 {
            if let Some(job) = state.jobs.read().await.get(job_id) {
                if done(job) {
                    return job.clone();
                }
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not settle");
    }

    #[tokio::test]
    async fn worker_runs_import_then_cache() {
        let (state, queue_rx) = test_state();
        spawn_task_worker(state.clone(), queue_rx);
        state
            .jobs
            .write()
            .await
            .insert("job-1".to_string(), JobRecord::queued("job-1".to_string(), sample_request()));

        state.queue_tx.send(QueuedTask::Import("job-1".to_string())).await.unwrap();
        let job = wait_for(&state, "job-1", |job| job.status == JobState::Completed).await;
        assert_eq!(job.pipeline_state, PipelineState::Done);
        assert_eq!(job.progress, 100.0);
        assert!(job.request.is_none());
        assert_eq!(job.output.as_ref().unwrap().written.elements, 2);

        state.queue_tx.send(QueuedTask::Cache("job-1".to_string())).await.unwrap();
        let job = wait_for(&state, "job-1", |job| job.cache_state == CacheState::Completed).await;
        assert_eq!(job.cache_records, Some(1));
        assert_eq!(job.pipeline_state, PipelineState::Cached);
    }

    #[tokio::test]
    async fn failed_import_records_the_error_code() {
        let (state, queue_rx) = test_state();
        spawn_task_worker(state.clone(), queue_rx);
        let mut request = sample_request();
        request.files[0].occurrences[0].content.properties.clear();
        state
            .jobs
            .write()
            .await
            .insert("job-2".to_string(), JobRecord::queued("job-2".to_string(), request));

        state.queue_tx.send(QueuedTask::Import("job-2".to_string())).await.unwrap();
        let job = wait_for(&state, "job-2", |job| job.status == JobState::Failed).await;

        assert_eq!(job.pipeline_state, PipelineState::Failed);
        assert_eq!(job.error.unwrap().code, "MALFORMED_INPUT");
    }

    #[tokio::test]
    async fn prune_keeps_recent_and_unfinished_jobs() {
        let (state, _queue_rx) = test_state();
        let old = Utc::now() - ChronoDuration::seconds(3600);
        {
            let mut jobs = state.jobs.write().await;
            let mut finished = JobRecord::queued("old".to_string(), sample_request());
            finished.status = JobState::Completed;
            finished.updated_at = old;
            jobs.insert("old".to_string(), finished);

            let mut caching = JobRecord::queued("caching".to_string(), sample_request());
            caching.status = JobState::Completed;
            caching.cache_state = CacheState::Queued;
            caching.updated_at = old;
            jobs.insert("caching".to_string(), caching);

            let mut recent = JobRecord::queued("recent".to_string(), sample_request());
            recent.status = JobState::Failed;
            jobs.insert("recent".to_string(), recent);
        }

        assert_eq!(prune_finished_jobs(&state).await, 1);
        let jobs = state.jobs.read().await;
        assert!(!jobs.contains_key("old"));
        assert!(jobs.contains_key("caching"));
        assert!(jobs.contains_key("recent"));
    }
}
