//! App - アプリケーション層
//!
//! ports と source を組み合わせて同期処理を組み立てます。
//!
//! # 主要コンポーネント
//! - **SyncOrchestrator**: change feed の取り込みとタスク実行
//! - **HandlerRegistry / TaskHandler**: task type ごとの処理
//! - **ChangeFeedPollHandler**: ChangeFeedPoll タスクで取り込みを回す
//! - **Scheduler**: poll / 実行 / sweep の定期ループ

pub mod orchestrator;
pub mod poll_handler;
pub mod runtime;
pub mod scheduler;

// 主要な型を再エクスポート
pub use self::orchestrator::{OrchestratorOptions, SyncOrchestrator};
pub use self::poll_handler::ChangeFeedPollHandler;
pub use self::runtime::{HandlerRegistry, TaskHandler, run_handler};
pub use self::scheduler::{Scheduler, SchedulerOptions};
