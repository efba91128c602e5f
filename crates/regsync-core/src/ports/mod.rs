//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（リレーショナルストア、ヒントキュー、上流 HTTP）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - HintQueue は claim 候補の通知のみ（task_id のみ、なくても動く）
//! - CursorStore は「Task 化が完了した位置」だけを記録する

pub mod clock;
pub mod cursor_store;
pub mod feed_client;
pub mod hint_queue;
pub mod id_generator;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::cursor_store::CursorStore;
pub use self::feed_client::{ByteStream, FeedClient};
pub use self::hint_queue::HintQueue;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{CreateOutcome, MergeFn, SweepPolicy, TaskStore};
