//! ChangeFeedPoll の handler
//!
//! poll タスクは registry ごとに bizId で 1 つに畳まれるので、
//! 同じ registry を 2 つの worker が同時に読むことはない。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::orchestrator::SyncOrchestrator;
use super::runtime::TaskHandler;
use crate::domain::{Outcome, SyncError, Task};
use crate::source::RegistrySource;

pub struct ChangeFeedPollHandler {
    orchestrator: Arc<SyncOrchestrator>,
    sources: HashMap<String, Arc<dyn RegistrySource>>,
}

impl ChangeFeedPollHandler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        sources: impl IntoIterator<Item = Arc<dyn RegistrySource>>,
    ) -> Self {
        let sources = sources
            .into_iter()
            .map(|s| (s.registry_id().to_string(), s))
            .collect();
        Self {
            orchestrator,
            sources,
        }
    }

    fn registry_of(task: &Task) -> &str {
        task.data
            .get("registryId")
            .and_then(|v| v.as_str())
            .unwrap_or(&task.target_name)
    }
}

#[async_trait]
impl TaskHandler for ChangeFeedPollHandler {
    async fn handle(&self, task: &Task) -> Result<Outcome, SyncError> {
        let registry = Self::registry_of(task);
        let Some(source) = self.sources.get(registry) else {
            return Err(SyncError::UnknownRegistry(registry.to_string()));
        };
        let report = self.orchestrator.ingest_leased(source.as_ref(), task).await?;
        tracing::debug!(
            %registry,
            task_id = %task.task_id,
            records = report.records,
            "poll finished"
        );
        Ok(Outcome::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::orchestrator::OrchestratorOptions;
    use crate::domain::{Cursor, TaskType};
    use crate::impls::{InMemoryCursorStore, InMemoryHintQueue, InMemoryTaskStore};
    use crate::ports::{CursorStore, FixedClock, SweepPolicy, UlidGenerator};
    use crate::source::testing::FakeFeedClient;
    use crate::source::{RegistryConfig, SourceMode, StreamingChangesSource};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn orchestrator() -> Arc<SyncOrchestrator> {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        Arc::new(SyncOrchestrator::new(
            Arc::new(InMemoryTaskStore::new(clock.clone(), Arc::new(InMemoryHintQueue::new()))),
            Arc::new(InMemoryCursorStore::new()),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            OrchestratorOptions {
                sweep: SweepPolicy {
                    processing_timeout: Duration::from_secs(600),
                    max_attempts: 3,
                },
                checkpoint_every: 1,
            },
        ))
    }

    #[tokio::test]
    async fn poll_task_ingests_and_heartbeats_its_lease() {
        let orchestrator = orchestrator();
        orchestrator.cursors().advance("npm", None, &Cursor::new(0)).await.unwrap();
        let client = FakeFeedClient::default().with_body(
            "https://r.example/_changes?since=0",
            vec![r#"{"results":[{"seq":1,"id":"a"},{"seq":2,"id":"b"}],"last_seq":2}"#],
        );
        let source: Arc<dyn RegistrySource> = Arc::new(StreamingChangesSource::new(
            RegistryConfig::new("npm", "https://r.example", SourceMode::Streaming),
            Arc::new(client),
        ));
        let handler = ChangeFeedPollHandler::new(orchestrator.clone(), [source]);

        orchestrator.schedule_poll("npm").await.unwrap();
        let report = orchestrator
            .run_execution_loop(TaskType::ChangeFeedPoll, &handler)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);

        let store = orchestrator.store();
        let poll = store
            .find_by_biz_id("change_feed_poll:npm")
            .await
            .unwrap();
        // finished tasks give their bizId back
        assert!(poll.is_none());
        assert_eq!(store.count_by_state().await.unwrap().waiting, 2);
        assert_eq!(orchestrator.cursors().load("npm").await.unwrap(), Some(Cursor::new(2)));
    }

    #[tokio::test]
    async fn unknown_registry_fails_the_poll() {
        let orchestrator = orchestrator();
        let handler =
            ChangeFeedPollHandler::new(orchestrator.clone(), Vec::<Arc<dyn RegistrySource>>::new());
        orchestrator.schedule_poll("ghost").await.unwrap();
        let report = orchestrator
            .run_execution_loop(TaskType::ChangeFeedPoll, &handler)
            .await
            .unwrap();
        assert_eq!((report.claimed, report.failed), (1, 1));
    }
}
