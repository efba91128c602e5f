//! Behaviour every `TaskStore` must show, run against each implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::join_all;
use ulid::Ulid;

use crate::domain::sync_data::PackageSyncData;
use crate::domain::{
    ChangeRecord, Cursor, FinishState, StoreError, Task, TaskId, TaskState, TaskType,
    merge_package_sync,
};
use crate::impls::InMemoryHintQueue;
use crate::ports::{Clock, FixedClock, HintQueue, SweepPolicy, TaskStore};

pub(crate) struct Harness {
    pub clock: Arc<FixedClock>,
    pub hints: Arc<InMemoryHintQueue>,
    pub store: Arc<dyn TaskStore>,
}

const POLICY: SweepPolicy = SweepPolicy {
    processing_timeout: Duration::from_secs(600),
    max_attempts: 3,
};

impl Harness {
    pub async fn new<F, Fut>(make: &F) -> Self
    where
        F: Fn(Arc<dyn Clock>, Arc<dyn HintQueue>) -> Fut,
        Fut: Future<Output = Arc<dyn TaskStore>>,
    {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let hints = Arc::new(InMemoryHintQueue::new());
        let store = make(clock.clone(), hints.clone()).await;
        Self {
            clock,
            hints,
            store,
        }
    }

    fn sync_task(&self, name: &str, versions: &[&str]) -> Task {
        let record = ChangeRecord::new(Cursor::new(1), name, serde_json::json!({}))
            .with_versions(versions.iter().map(|v| v.to_string()).collect());
        Task::package_sync(
            TaskId::from_ulid(Ulid::new()),
            "npm",
            name,
            PackageSyncData::from_record("npm", &record),
            self.clock.now(),
        )
    }

    async fn create(&self, task: Task) -> Task {
        self.store
            .create_or_merge(task, &merge_package_sync)
            .await
            .unwrap()
            .into_task()
    }

    fn minutes(&self, m: i64) {
        self.clock.advance(chrono::Duration::minutes(m));
    }
}

pub(crate) async fn run_all<F, Fut>(make: F)
where
    F: Fn(Arc<dyn Clock>, Arc<dyn HintQueue>) -> Fut,
    Fut: Future<Output = Arc<dyn TaskStore>>,
{
    concurrent_creates_collapse_onto_one_row(Harness::new(&make).await).await;
    terminal_task_frees_its_biz_id(Harness::new(&make).await).await;
    concurrent_claims_hand_out_a_task_once(Harness::new(&make).await).await;
    claims_oldest_first_and_by_type(Harness::new(&make).await).await;
    stale_hints_are_skipped(Harness::new(&make).await).await;
    finish_is_idempotent_and_guards_stale_claims(Harness::new(&make).await).await;
    concurrent_sweeps_requeue_once(Harness::new(&make).await).await;
    sweep_fails_tasks_at_the_retry_cap(Harness::new(&make).await).await;
    sweep_rehints_stale_waiting_tasks(Harness::new(&make).await).await;
    heartbeat_keeps_a_claim_alive(Harness::new(&make).await).await;
    change_merged_while_running_is_run_again(Harness::new(&make).await).await;
}

async fn concurrent_creates_collapse_onto_one_row(h: Harness) {
    let creates = (0..16).map(|i| {
        let store = h.store.clone();
        let task = h.sync_task("@foo/bar", &[&format!("1.0.{i}")]);
        tokio::spawn(async move { store.create_or_merge(task, &merge_package_sync).await })
    });
    let outcomes: Vec<_> = join_all(creates)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let first = outcomes[0].task().task_id;
    assert!(outcomes.iter().all(|o| o.task().task_id == first));
    assert_eq!(outcomes.iter().filter(|o| o.is_created()).count(), 1);

    let row = h.store.find_task(first).await.unwrap().unwrap();
    let data = PackageSyncData::from_data(&row.data).unwrap();
    assert_eq!(data.specific_versions.map(|v| v.len()), Some(16));
    assert_eq!(data.change_count, 16);
    assert_eq!(h.store.count_by_state().await.unwrap().waiting, 1);
}

async fn terminal_task_frees_its_biz_id(h: Harness) {
    let first = h.create(h.sync_task("left-pad", &["1.0.0"])).await;
    let merged = h
        .store
        .create_or_merge(h.sync_task("left-pad", &["1.0.1"]), &merge_package_sync)
        .await
        .unwrap();
    assert!(!merged.is_created());
    assert_eq!(merged.task().task_id, first.task_id);

    let claimed = h.store.claim_next(TaskType::PackageSync).await.unwrap().unwrap();
    h.store
        .finish(&claimed, FinishState::Success, None)
        .await
        .unwrap();
    assert!(h.store.find_by_biz_id("sync_package:npm:left-pad").await.unwrap().is_none());

    let second = h.create(h.sync_task("left-pad", &["1.0.2"])).await;
    assert_ne!(second.task_id, first.task_id);
    let live = h
        .store
        .find_by_biz_id("sync_package:npm:left-pad")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.task_id, second.task_id);
}

async fn concurrent_claims_hand_out_a_task_once(h: Harness) {
    let task = h.create(h.sync_task("lodash", &[])).await;
    let claims = (0..8).map(|_| {
        let store = h.store.clone();
        tokio::spawn(async move { store.claim_next(TaskType::PackageSync).await })
    });
    let won: Vec<Task> = join_all(claims)
        .await
        .into_iter()
        .filter_map(|r| r.unwrap().unwrap())
        .collect();
    assert_eq!(won.len(), 1);
    assert_eq!(won[0].task_id, task.task_id);
    assert_eq!(won[0].state, TaskState::Processing);
    assert_eq!(won[0].attempts, 1);
}

async fn claims_oldest_first_and_by_type(h: Harness) {
    let binary = h
        .create(Task::binary_sync(TaskId::from_ulid(Ulid::new()), "node", h.clock.now()))
        .await;
    let older = h.create(h.sync_task("a", &[])).await;
    h.minutes(1);
    let newer = h.create(h.sync_task("b", &[])).await;
    // drop the hints: ordering must come from the store itself
    while h.hints.pop(TaskType::PackageSync).await.unwrap().is_some() {}

    let s = &h.store;
    assert_eq!(
        s.claim_next(TaskType::PackageSync).await.unwrap().unwrap().task_id,
        older.task_id
    );
    assert_eq!(
        s.claim_next(TaskType::PackageSync).await.unwrap().unwrap().task_id,
        newer.task_id
    );
    assert!(s.claim_next(TaskType::PackageSync).await.unwrap().is_none());
    assert_eq!(
        s.claim_next(TaskType::BinarySync).await.unwrap().unwrap().task_id,
        binary.task_id
    );
}

async fn stale_hints_are_skipped(h: Harness) {
    h.hints
        .push(TaskType::PackageSync, TaskId::from_ulid(Ulid::new()))
        .await
        .unwrap();
    let task = h.create(h.sync_task("a", &[])).await;
    // duplicate hint for the same row
    h.hints.push(TaskType::PackageSync, task.task_id).await.unwrap();

    let claimed = h.store.claim_next(TaskType::PackageSync).await.unwrap().unwrap();
    assert_eq!(claimed.task_id, task.task_id);
    assert!(h.store.claim_next(TaskType::PackageSync).await.unwrap().is_none());
    assert_eq!(h.hints.len(TaskType::PackageSync).await.unwrap(), 0);
}

async fn finish_is_idempotent_and_guards_stale_claims(h: Harness) {
    h.create(h.sync_task("a", &[])).await;
    let first_claim = h.store.claim_next(TaskType::PackageSync).await.unwrap().unwrap();

    h.minutes(11);
    let counts = h.store.sweep_timeouts(POLICY).await.unwrap();
    assert_eq!(counts.requeued, 1);
    let second_claim = h.store.claim_next(TaskType::PackageSync).await.unwrap().unwrap();
    assert_eq!(second_claim.attempts, 3);

    let err = h
        .store
        .finish(&first_claim, FinishState::Fail, Some("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { state: TaskState::Processing, .. }));

    let done = h
        .store
        .finish(&second_claim, FinishState::Fail, Some("boom"))
        .await
        .unwrap();
    assert_eq!(done.state, TaskState::Fail);
    assert_eq!(done.error(), Some("boom"));

    let again = h
        .store
        .finish(&second_claim, FinishState::Fail, Some("boom"))
        .await
        .unwrap();
    assert_eq!(again, done);
    assert!(h.store.finish(&second_claim, FinishState::Success, None).await.is_err());
}

async fn concurrent_sweeps_requeue_once(h: Harness) {
    let task = h.create(h.sync_task("a", &[])).await;
    h.store.claim_next(TaskType::PackageSync).await.unwrap().unwrap();
    h.minutes(11);

    let (a, b) = tokio::join!(h.store.sweep_timeouts(POLICY), h.store.sweep_timeouts(POLICY));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.requeued + b.requeued, 1);
    assert_eq!(a.processing + b.processing, 1);
    assert_eq!(a.failed + b.failed, 0);

    let row = h.store.find_task(task.task_id).await.unwrap().unwrap();
    assert_eq!(row.state, TaskState::Waiting);
    assert_eq!(row.attempts, 2);
}

async fn sweep_fails_tasks_at_the_retry_cap(h: Harness) {
    let policy = SweepPolicy {
        max_attempts: 1,
        ..POLICY
    };
    let task = h.create(h.sync_task("a", &[])).await;
    h.store.claim_next(TaskType::PackageSync).await.unwrap().unwrap();

    h.minutes(5);
    assert_eq!(h.store.sweep_timeouts(policy).await.unwrap().processing, 0);

    h.minutes(6);
    let counts = h.store.sweep_timeouts(policy).await.unwrap();
    assert_eq!((counts.processing, counts.failed, counts.requeued), (1, 1, 0));
    let row = h.store.find_task(task.task_id).await.unwrap().unwrap();
    assert_eq!(row.state, TaskState::Fail);
    assert!(row.error().unwrap().contains("timeout"));
    assert!(h.store.find_by_biz_id(task.biz_id.as_deref().unwrap()).await.unwrap().is_none());
}

async fn sweep_rehints_stale_waiting_tasks(h: Harness) {
    h.create(h.sync_task("a", &[])).await;
    while h.hints.pop(TaskType::PackageSync).await.unwrap().is_some() {}

    h.minutes(11);
    let counts = h.store.sweep_timeouts(POLICY).await.unwrap();
    assert_eq!((counts.waiting, counts.processing), (1, 0));
    assert_eq!(h.hints.len(TaskType::PackageSync).await.unwrap(), 1);

    // touched: not stale again right away
    assert_eq!(h.store.sweep_timeouts(POLICY).await.unwrap().waiting, 0);
}

async fn heartbeat_keeps_a_claim_alive(h: Harness) {
    h.create(h.sync_task("a", &["1.0.0"])).await;
    let claimed = h.store.claim_next(TaskType::PackageSync).await.unwrap().unwrap();

    // a merge into a running task must not extend its lease
    h.minutes(1);
    h.create(h.sync_task("a", &["1.0.1"])).await;

    h.minutes(7);
    let mut patch = serde_json::Map::new();
    patch.insert("progress".into(), 42.into());
    let beat = h.store.heartbeat(&claimed, patch).await.unwrap();
    assert_eq!(beat.data["progress"], 42);
    let versions = PackageSyncData::from_data(&beat.data).unwrap().specific_versions;
    assert_eq!(versions, Some(vec!["1.0.0".into(), "1.0.1".into()]));

    h.minutes(8);
    assert_eq!(h.store.sweep_timeouts(POLICY).await.unwrap().processing, 0);

    h.minutes(3);
    assert_eq!(h.store.sweep_timeouts(POLICY).await.unwrap().requeued, 1);
    let err = h
        .store
        .heartbeat(&claimed, serde_json::Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
}

async fn change_merged_while_running_is_run_again(h: Harness) {
    h.create(h.sync_task("a", &["1.0.0"])).await;
    let claimed = h.store.claim_next(TaskType::PackageSync).await.unwrap().unwrap();

    // 2.0.0 is published while the worker syncs 1.0.0
    let merged = h.create(h.sync_task("a", &["2.0.0"])).await;
    assert_eq!(merged.task_id, claimed.task_id);
    assert!(merged.merged_after_claim());

    let done = h
        .store
        .finish(&claimed, FinishState::Success, None)
        .await
        .unwrap();
    assert_eq!(done.state, TaskState::Waiting);
    assert_eq!(h.hints.len(TaskType::PackageSync).await.unwrap(), 1);
    let live = h.store.find_by_biz_id("sync_package:npm:a").await.unwrap().unwrap();
    assert_eq!(live.task_id, claimed.task_id);
    assert_eq!(h.store.count_by_state().await.unwrap().waiting, 1);

    let again = h.store.claim_next(TaskType::PackageSync).await.unwrap().unwrap();
    assert_eq!(again.attempts, 2);
    assert!(!again.merged_after_claim());
    let versions = PackageSyncData::from_data(&again.data).unwrap().specific_versions;
    assert_eq!(versions, Some(vec!["1.0.0".into(), "2.0.0".into()]));

    let done = h
        .store
        .finish(&again, FinishState::Success, None)
        .await
        .unwrap();
    assert_eq!(done.state, TaskState::Success);
    assert!(h.store.find_by_biz_id("sync_package:npm:a").await.unwrap().is_none());
}
