//! regsync-core
//!
//! Task queue and upstream change-feed ingestion for a package registry mirror.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_type, state, task, change, cursor, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, HintQueue, CursorStore, FeedClient, Clock, IdGenerator）
//! - **feed**: change feed の逐次パーサ（ChangeFeedTransform / ChangeFeedStream）
//! - **source**: 上流レジストリごとの wire format アダプタ
//! - **app**: アプリケーションロジック（orchestrator, handler registry, scheduler）
//! - **impls**: 実装（in-memory / SQLite store, reqwest client）
//! - **config**: TOML 設定
//! - **observability**: カウンタとレポート

pub mod app;
pub mod config;
pub mod domain;
pub mod feed;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod source;
