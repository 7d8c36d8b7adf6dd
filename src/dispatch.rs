use crate::models::{BatchSummary, Counts, OutcomeState, ProductOutcome, ThreadInfo};
use crate::session::EstablishedSession;
use std::{future::Future, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tracing::{debug, warn};

/// Pool size for a batch: never more workers than products.
pub fn actual_threads(requested: usize, total: usize) -> usize {
    requested.min(total)
}

/// Drops repeated ids, keeping the first occurrence.
pub fn dedup_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Runs `job` once per id over `workers` tasks pulling from a bounded queue.
///
/// The returned outcomes are in input order. A slot whose worker died before
/// reporting is filled with a failed outcome, so the result always has one
/// entry per id.
pub async fn run_pool<F, Fut>(ids: &[i64], workers: usize, job: F) -> Vec<ProductOutcome>
where
    F: Fn(i64) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ProductOutcome> + Send + 'static,
{
    if ids.is_empty() || workers == 0 {
        return Vec::new();
    }

    let (job_tx, job_rx) = mpsc::channel::<(usize, i64)>(workers);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<(usize, ProductOutcome)>(ids.len());

    let mut set = JoinSet::new();
    for worker_id in 0..workers {
        let job_rx = job_rx.clone();
        let result_tx = result_tx.clone();
        let job = job.clone();
        set.spawn(async move {
            loop {
                let next = job_rx.lock().await.recv().await;
                let Some((slot, product_id)) = next else {
                    break;
                };
                debug!(target = "delist.dispatch", worker_id, product_id, "job_picked");
                let outcome = job(product_id).await;
                if result_tx.send((slot, outcome)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(job_rx);
    drop(result_tx);

    for (slot, product_id) in ids.iter().copied().enumerate() {
        if job_tx.send((slot, product_id)).await.is_err() {
            warn!(target = "delist.dispatch", product_id, "job_queue_closed");
            break;
        }
    }
    drop(job_tx);

    let mut slots: Vec<Option<ProductOutcome>> = vec![None; ids.len()];
    while let Some((slot, outcome)) = result_rx.recv().await {
        slots[slot] = Some(outcome);
    }
    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            warn!(target = "delist.dispatch", error = %err, "worker_aborted");
        }
    }

    slots
        .into_iter()
        .zip(ids)
        .map(|(slot, product_id)| {
            slot.unwrap_or_else(|| {
                ProductOutcome::new(
                    *product_id,
                    OutcomeState::Failed,
                    "处理异常：worker exited before reporting",
                )
            })
        })
        .collect()
}

pub fn summary_message(total: usize, success: usize) -> String {
    format!("批量下架完成，共处理 {total} 个商品，{success} 个下架成功")
}

/// Counts outcomes and assembles the batch summary.
pub fn aggregate(
    results: Vec<ProductOutcome>,
    requested: usize,
    actual: usize,
    session: Option<&EstablishedSession>,
) -> BatchSummary {
    let success = results.iter().filter(|outcome| outcome.succeeded).count();
    let total = results.len();
    BatchSummary {
        message: summary_message(total, success),
        summary: Counts {
            total,
            success,
            failed: total - success,
        },
        thread_info: ThreadInfo {
            requested,
            actual,
            product_count: total,
        },
        cache_used: session.is_some_and(|s| s.cache_used),
        parent_msg_id: session.map(|s| s.handles.parent_message_id.clone()),
        tool_id: session.map(|s| s.handles.tool_handle.clone()),
        results,
    }
}
