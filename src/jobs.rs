use crate::{
    models::{ApiError, BatchSummary},
    security::AuthContext,
    service::DelistService,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tracing::{info, warn};
use uuid::Uuid;

/// A validated batch, ready to run.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub product_ids: Vec<i64>,
    pub max_threads: usize,
    pub mark_status: Option<i32>,
}

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
    retention: Duration,
}

/// A job's state plus the account that owns it. Finished records are
/// dropped once older than the queue's retention.
struct JobRecord {
    account_id: String,
    state: JobState,
    finished_at: Option<Instant>,
}

struct Job {
    id: Uuid,
    request: BatchRequest,
    context: AuthContext,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: BatchSummary,
        #[serde(skip_serializing_if = "Option::is_none")]
        marked: Option<usize>,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

/// Runs a batch and, when asked, marks the delisted products.
pub async fn run_batch(
    service: &DelistService,
    account_id: &str,
    request: &BatchRequest,
) -> Result<(BatchSummary, Option<usize>), crate::service::DelistError> {
    let summary = service
        .offline_products(account_id, &request.product_ids, request.max_threads)
        .await?;
    let marked = match request.mark_status {
        Some(status) => Some(service.mark_succeeded(account_id, &summary, status).await),
        None => None,
    };
    Ok((summary, marked))
}

impl JobQueue {
    pub fn spawn(service: DelistService) -> (Self, JoinHandle<()>) {
        Self::spawn_with(service, queue_capacity_from_env(), retention_from_env())
    }

    pub fn spawn_with(
        service: DelistService,
        capacity: usize,
        retention: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity);
        let statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Some(record) = statuses_bg.lock().await.get_mut(&job.id) {
                    record.state = JobState::Running;
                }
                info!(
                    target = "delist.jobs",
                    job_id = %job.id,
                    account_id = %job.context.account_id,
                    products = job.request.product_ids.len(),
                    "job_started"
                );

                let result = run_batch(&service, &job.context.account_id, &job.request).await;
                let state = match result {
                    Ok((summary, marked)) => JobState::Completed { result: summary, marked },
                    Err(err) => {
                        warn!(target = "delist.jobs", job_id = %job.id, error = %err, "job_failed");
                        JobState::Failed {
                            error: err.to_string(),
                            stage: Some(err.stage().to_string()),
                        }
                    }
                };
                if let Some(record) = statuses_bg.lock().await.get_mut(&job.id) {
                    record.state = state;
                    record.finished_at = Some(Instant::now());
                }
            }
        });

        (
            Self {
                tx,
                statuses,
                retention,
            },
            handle,
        )
    }

    pub async fn enqueue(&self, request: BatchRequest, context: AuthContext) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            let retention = self.retention;
            guard.retain(|_, record| {
                record
                    .finished_at
                    .is_none_or(|finished| finished.elapsed() < retention)
            });
            guard.insert(
                id,
                JobRecord {
                    account_id: context.account_id.clone(),
                    state: JobState::Queued,
                    finished_at: None,
                },
            );
        }
        let job = Job {
            id,
            request,
            context,
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    /// The job's state, visible only to the account that submitted it.
    pub async fn get(&self, id: Uuid, account_id: &str) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard
            .get(&id)
            .filter(|record| record.account_id == account_id)
            .map(|record| JobInfo {
                id: id.to_string(),
                state: record.state.clone(),
            })
    }
}

fn queue_capacity_from_env() -> usize {
    crate::config::env_parse::<usize>("QUEUE_CAPACITY")
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

fn retention_from_env() -> Duration {
    Duration::from_secs(crate::config::env_parse::<u64>("JOB_RETENTION_SECS").unwrap_or(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelistConfig, PortalConfig};
    use crate::store::MemoryStore;
    
    fn context(account: &str) -> AuthContext {
        AuthContext {
            account_id: account.into(),
            api_key_id: "key-01".into(),
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    async fn settle(queue: &JobQueue, id: Uuid, account: &str) -> JobState {
        for _ in 0..200 {
            if let Some(info) = queue.get(id, account).await
                && matches!(info.state, JobState::Completed { .. } | JobState::Failed { .. })
            {
                return info.state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never settled");
    }

    fn service() -> DelistService {
        DelistService::with_memory(
            MemoryStore::default(),
            PortalConfig::with_base_url("http://127.0.0.1:9"),
            DelistConfig::default(),
        )
    }

    #[tokio::test]
    async fn job_without_credentials_fails_at_credentials_stage() {
        let (queue, _worker) = JobQueue::spawn_with(service(), 4, HOUR);
        let id = queue
            .enqueue(
                BatchRequest {
                    product_ids: vec![1, 2],
                    max_threads: 2,
                    mark_status: None,
                },
                context("nobody"),
            )
            .await
            .expect("enqueue");

        match settle(&queue, id, "nobody").await {
            JobState::Failed { stage, .. } => assert_eq!(stage.as_deref(), Some("credentials")),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let (queue, _worker) = JobQueue::spawn_with(service(), 1, HOUR);
        assert!(queue.get(Uuid::new_v4(), "acct").await.is_none());
    }

    #[tokio::test]
    async fn empty_batch_completes_with_empty_summary() {
        let store = MemoryStore::default();
        store
            .insert_credentials("acct", crate::session::SessionCredentials::new("c=1", "m"))
            .await;
        let service = DelistService::with_memory(
            store,
            PortalConfig::with_base_url("http://127.0.0.1:9"),
            DelistConfig::default(),
        );
        let (queue, _worker) = JobQueue::spawn_with(service, 2, HOUR);
        let id = queue
            .enqueue(
                BatchRequest {
                    product_ids: vec![],
                    max_threads: 5,
                    mark_status: Some(1),
                },
                context("acct"),
            )
            .await
            .unwrap();

        match settle(&queue, id, "acct").await {
            JobState::Completed { result, marked } => {
                assert_eq!(result.total(), 0);
                assert_eq!(marked, Some(0));
            }
            _ => panic!("expected completion"),
        }
    }

    fn empty_batch() -> BatchRequest {
        BatchRequest {
            product_ids: vec![],
            max_threads: 5,
            mark_status: None,
        }
    }

    async fn credentialed_service() -> DelistService {
        let store = MemoryStore::default();
        store
            .insert_credentials("acct", crate::session::SessionCredentials::new("c=1", "m"))
            .await;
        DelistService::with_memory(
            store,
            PortalConfig::with_base_url("http://127.0.0.1:9"),
            DelistConfig::default(),
        )
    }

    #[tokio::test]
    async fn job_is_hidden_from_other_accounts() {
        let (queue, _worker) = JobQueue::spawn_with(credentialed_service().await, 2, HOUR);
        let id = queue.enqueue(empty_batch(), context("acct")).await.unwrap();
        settle(&queue, id, "acct").await;

        assert!(queue.get(id, "acct").await.is_some());
        assert!(queue.get(id, "other-seller").await.is_none());
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_after_retention() {
        let (queue, _worker) =
            JobQueue::spawn_with(credentialed_service().await, 2, Duration::ZERO);
        let first = queue.enqueue(empty_batch(), context("acct")).await.unwrap();
        settle(&queue, first, "acct").await;

        let second = queue.enqueue(empty_batch(), context("acct")).await.unwrap();
        assert!(queue.get(first, "acct").await.is_none());
        assert!(queue.get(second, "acct").await.is_some());
    }
}
