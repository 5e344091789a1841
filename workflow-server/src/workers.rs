//! The Executor and Timeout worker pools (§5): stateless tasks polling the
//! job queue's Execute/Timeout lanes at a configured concurrency, stopping
//! cooperatively on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use workflow_core::model::JobQueueKind;
use workflow_core::queue::JobQueue;
use workflow_core::Resumer;

use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Spawns `concurrency` executor workers, each claiming one job from the
/// Execute queue per poll.
pub fn spawn_executor_pool(state: AppState, concurrency: usize, mut shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|i| {
            let state = state.clone();
            let mut shutdown = shutdown.clone();
            let worker_id = format!("executor-{i}");
            tokio::spawn(async move {
                let executor = state.build_executor(&worker_id);
                loop {
                    if *shutdown.borrow() {
                        return;
                    }
                    match state.queue.claim(JobQueueKind::Execute, 1, &worker_id).await {
                        Ok(jobs) if !jobs.is_empty() => {
                            for job in jobs {
                                if let Err(err) = executor.process_job(job).await {
                                    error!(worker_id = %worker_id, %err, "executor job failed");
                                }
                            }
                        }
                        Ok(_) => wait_or_shutdown(&mut shutdown).await,
                        Err(err) => {
                            warn!(worker_id = %worker_id, %err, "failed to claim execute job");
                            wait_or_shutdown(&mut shutdown).await;
                        }
                    }
                }
            })
        })
        .collect()
}

/// Spawns `concurrency` timeout workers. A Timeout-queue job's `kind` is
/// `"timeout:<response|call>"`, `run_id`/`node_id` identify the wait record;
/// the Resumer decides whether the timeout still applies (§4.3).
pub fn spawn_timeout_pool(state: AppState, concurrency: usize, mut shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|i| {
            let state = state.clone();
            let mut shutdown = shutdown.clone();
            let worker_id = format!("timeout-{i}");
            let resumer: Arc<Resumer> = state.resumer.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        return;
                    }
                    match state.queue.claim(JobQueueKind::Timeout, 1, &worker_id).await {
                        Ok(jobs) if !jobs.is_empty() => {
                            for job in jobs {
                                match resumer.handle_timeout(&job.run_id, &job.node_id).await {
                                    Ok(_) => {
                                        if let Err(err) = state.queue.complete(job).await {
                                            error!(worker_id = %worker_id, %err, "failed to ack timeout job");
                                        }
                                    }
                                    Err(err) => {
                                        error!(worker_id = %worker_id, %err, "timeout resume failed");
                                        if let Err(err) = state.queue.complete(job).await {
                                            error!(worker_id = %worker_id, %err, "failed to ack failed timeout job");
                                        }
                                    }
                                }
                            }
                        }
                        Ok(_) => wait_or_shutdown(&mut shutdown).await,
                        Err(err) => {
                            warn!(worker_id = %worker_id, %err, "failed to claim timeout job");
                            wait_or_shutdown(&mut shutdown).await;
                        }
                    }
                }
            })
        })
        .collect()
}

async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(POLL_INTERVAL) => {}
        _ = shutdown.changed() => {}
    }
}

/// Periodic Supervisor pass (§4.5), run on its own interval independent of
/// the job-processing pools.
pub fn spawn_supervisor_loop(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = state.supervisor.scan_interval().to_std().unwrap_or(Duration::from_secs(60));
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(err) = state.supervisor.reclaim(None).await {
                error!(%err, "supervisor reclaim pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    })
}
