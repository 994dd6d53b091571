// End-to-end engine scenarios over the in-memory store and queue

mod support;

use chrono::{Duration, Timelike, Utc};
use common::models::{
    ExecutionFilter, ExecutionStatus, ExecutionType, FunctionCallResult, Schedule, UpdateJobRequest,
};
use common::queue::{QueueWorker, WorkQueue, WorkerConfig};
use common::schedule::RepeatSpec;
use common::store::JobStore;
use std::sync::Arc;
use support::{create_request, dispatch_entry, harness};

/// Claim everything that would be due within the next day
async fn claim_next(queue: &impl WorkQueue) -> Vec<common::queue::QueueEntry> {
    queue.claim_due(Utc::now() + Duration::days(1), 10).await.unwrap()
}

#[tokio::test]
async fn test_sequential_job_stops_at_failing_call() {
    let h = harness();
    let job = h
        .engine
        .create_job(
            "env",
            create_request(Schedule::Interval(5), &["200", "500", "201"], ExecutionType::Sequential),
        )
        .await
        .unwrap();

    let claimed = claim_next(&h.queue).await;
    assert_eq!(claimed.len(), 1);
    dispatch_entry(&h.engine, &claimed[0]).await;
    h.queue.finish(&claimed[0]).await.unwrap();

    let executions = h.store.list_executions(job.id, &ExecutionFilter::default()).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::WithCallError);
    assert_eq!(
        executions[0].results,
        vec![
            FunctionCallResult::completed("200", Some(200)),
            FunctionCallResult::completed("500", Some(500)),
        ]
    );
    assert_eq!(h.invoker.calls(), vec!["200".to_string(), "500".to_string()]);
}

#[tokio::test]
async fn test_parallel_job_runs_every_call() {
    let h = harness();
    let job = h
        .engine
        .create_job(
            "env",
            create_request(Schedule::Interval(5), &["throw", "200"], ExecutionType::Parallel),
        )
        .await
        .unwrap();

    let claimed = claim_next(&h.queue).await;
    dispatch_entry(&h.engine, &claimed[0]).await;

    let execution = &h.store.recent_executions(job.id, 1).await.unwrap()[0];
    assert_eq!(execution.status, ExecutionStatus::WithCallError);
    assert_eq!(
        execution.results,
        vec![
            FunctionCallResult::fatal("throw"),
            FunctionCallResult::completed("200", Some(200)),
        ]
    );
    assert_eq!(execution.execution_type, ExecutionType::Parallel);
}

#[tokio::test]
async fn test_reschedule_replaces_repeat_entry() {
    let h = harness();
    let job = h
        .engine
        .create_job("env", create_request(Schedule::Interval(5), &["200"], ExecutionType::Sequential))
        .await
        .unwrap();

    let update = UpdateJobRequest {
        schedule: Some(Schedule::Periodical("0 * * * *".to_string())),
        ..Default::default()
    };
    let updated = h.engine.update_job("env", job.id, update).await.unwrap();

    let records = h.queue.list_repeating().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].spec,
        RepeatSpec::Cron {
            expression: "0 * * * *".to_string()
        }
    );
    assert_eq!(h.queue.len().await.unwrap(), 1);

    let view = h.engine.job_view(&updated).await.unwrap();
    let next = view.next_execution_at.unwrap();
    assert!(next > Utc::now());
    assert!(next <= Utc::now() + Duration::hours(1));
    assert_eq!((next.minute(), next.second()), (0, 0));
}

#[tokio::test]
async fn test_execution_snapshot_keeps_schedule_at_dispatch_time() {
    let h = harness();
    let job = h
        .engine
        .create_job("env", create_request(Schedule::Interval(5), &["200"], ExecutionType::Sequential))
        .await
        .unwrap();

    let claimed = claim_next(&h.queue).await;
    dispatch_entry(&h.engine, &claimed[0]).await;

    let update = UpdateJobRequest {
        schedule: Some(Schedule::Interval(30)),
        ..Default::default()
    };
    h.engine.update_job("env", job.id, update).await.unwrap();

    let execution = &h.store.recent_executions(job.id, 1).await.unwrap()[0];
    assert_eq!(execution.schedule, Schedule::Interval(5));
}

#[tokio::test]
async fn test_job_deleted_mid_flight_records_nothing() {
    let h = harness();
    let job = h
        .engine
        .create_job("env", create_request(Schedule::Interval(5), &["200"], ExecutionType::Sequential))
        .await
        .unwrap();

    let claimed = claim_next(&h.queue).await;
    assert_eq!(claimed.len(), 1);
    h.engine.delete_job("env", job.id).await.unwrap();

    dispatch_entry(&h.engine, &claimed[0]).await;
    h.queue.finish(&claimed[0]).await.unwrap();

    assert!(h.store.recent_executions(job.id, 10).await.unwrap().is_empty());
    assert!(h.queue.list_repeating().await.unwrap().is_empty());
    assert_eq!(h.queue.len().await.unwrap(), 0);
    assert!(h.invoker.calls().is_empty());
}

#[tokio::test]
async fn test_failed_update_commit_keeps_old_schedule_queued() {
    let h = harness();
    let job = h
        .engine
        .create_job("env", create_request(Schedule::Interval(5), &["200"], ExecutionType::Sequential))
        .await
        .unwrap();
    h.store.set_fail_commits(true);

    let update = UpdateJobRequest {
        schedule: Some(Schedule::Interval(15)),
        ..Default::default()
    };
    assert!(h.engine.update_job("env", job.id, update).await.is_err());

    let records = h.queue.list_repeating().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].spec, RepeatSpec::Every { millis: 300_000 });
    assert_eq!(h.engine.get_job("env", job.id).await.unwrap().schedule, Schedule::Interval(5));
}

#[tokio::test]
async fn test_worker_runs_on_time_job_once() {
    let h = harness();
    let at = Utc::now() + Duration::milliseconds(200);
    let job = h
        .engine
        .create_job("env", create_request(Schedule::OnTime(at), &["204"], ExecutionType::Sequential))
        .await
        .unwrap();
    assert!(h.engine.job_view(&job).await.unwrap().next_execution_at.is_some());

    let worker = Arc::new(QueueWorker::new(
        Arc::new(h.queue.clone()),
        Arc::clone(&h.engine),
        WorkerConfig {
            concurrency: 2,
            poll_interval: std::time::Duration::from_millis(20),
            ..WorkerConfig::default()
        },
    ));
    let running = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.start().await })
    };

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while h.store.recent_executions(job.id, 1).await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "job never ran");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    worker.stop();
    running.await.unwrap().unwrap();

    let executions = h.store.list_executions(job.id, &ExecutionFilter::default()).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Finished);
    assert!(executions[0].processed_on.unwrap() >= at);
    assert_eq!(h.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_abandoned_claim_does_not_stall_repeating_job() {
    let h = harness();
    let job = h
        .engine
        .create_job("env", create_request(Schedule::Interval(5), &["200"], ExecutionType::Sequential))
        .await
        .unwrap();
    let first = h.queue.list_repeating().await.unwrap()[0].next.unwrap();

    // a worker claims the first fire and dies before finishing it
    assert_eq!(h.queue.claim_due(first, 10).await.unwrap().len(), 1);

    for n in 1..=288 {
        let fire = first + Duration::minutes(5 * n);
        for entry in h.queue.claim_due(fire, 10).await.unwrap() {
            dispatch_entry(&h.engine, &entry).await;
            h.queue.finish(&entry).await.unwrap();
        }
    }

    let executions = h.store.list_executions(job.id, &ExecutionFilter::default()).await.unwrap();
    assert_eq!(executions.len(), 288);
    assert!(h.store.find_job_by_id(job.id).await.unwrap().unwrap().is_enabled());
    assert!(h.engine.is_queued(&job).await.unwrap());
}

#[tokio::test]
async fn test_abandoned_on_time_claim_runs_again_after_lease() {
    let h = harness();
    let at = Utc::now() + Duration::minutes(1);
    let job = h
        .engine
        .create_job("env", create_request(Schedule::OnTime(at), &["200"], ExecutionType::Sequential))
        .await
        .unwrap();

    let claimed_at = at + Duration::minutes(1);
    assert_eq!(h.queue.claim_due(claimed_at, 10).await.unwrap().len(), 1);
    assert!(h.queue.claim_due(claimed_at + Duration::minutes(4), 10).await.unwrap().is_empty());

    let redelivered = h.queue.claim_due(claimed_at + Duration::minutes(5), 10).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    dispatch_entry(&h.engine, &redelivered[0]).await;
    h.queue.finish(&redelivered[0]).await.unwrap();

    let executions = h.store.list_executions(job.id, &ExecutionFilter::default()).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Finished);
    assert_eq!(h.queue.len().await.unwrap(), 0);
}
