//! InMemoryHintQueue - プロセス内のヒントキュー
//!
//! # 実装詳細
//! - HashMap<TaskType, VecDeque<TaskId>> で task_type ごとに FIFO を管理
//! - tokio::sync::Mutex で排他制御
//! - 重複・古い ID はそのまま保持（claim 側の条件付き更新で捨てられる）

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{HintError, TaskId, TaskType};
use crate::ports::HintQueue;

#[derive(Debug, Default)]
pub struct InMemoryHintQueue {
    queues: Mutex<HashMap<TaskType, VecDeque<TaskId>>>,
}

impl InMemoryHintQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HintQueue for InMemoryHintQueue {
    async fn push(&self, task_type: TaskType, task_id: TaskId) -> Result<(), HintError> {
        self.queues
            .lock()
            .await
            .entry(task_type)
            .or_default()
            .push_back(task_id);
        Ok(())
    }

    async fn pop(&self, task_type: TaskType) -> Result<Option<TaskId>, HintError> {
        Ok(self
            .queues
            .lock()
            .await
            .get_mut(&task_type)
            .and_then(|q| q.pop_front()))
    }

    async fn len(&self, task_type: TaskType) -> Result<usize, HintError> {
        Ok(self
            .queues
            .lock()
            .await
            .get(&task_type)
            .map_or(0, |q| q.len()))
    }
}

/// A hint queue that holds nothing. Claims always fall back to the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHintQueue;

#[async_trait]
impl HintQueue for NoopHintQueue {
    async fn push(&self, _task_type: TaskType, _task_id: TaskId) -> Result<(), HintError> {
        Ok(())
    }

    async fn pop(&self, _task_type: TaskType) -> Result<Option<TaskId>, HintError> {
        Ok(None)
    }

    async fn len(&self, _task_type: TaskType) -> Result<usize, HintError> {
        Ok(0)
    }
}
