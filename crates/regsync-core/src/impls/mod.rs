//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore / InMemoryCursorStore**: テスト・単一プロセス用の正本
//! - **SqliteTaskStore / SqliteCursorStore**: 複数プロセスで共有する正本（sqlx）
//! - **InMemoryHintQueue / NoopHintQueue**: claim 候補のヒント
//! - **ReqwestFeedClient**: 上流レジストリへの HTTP クライアント

pub mod http_client;
pub mod inmem_hint;
pub mod inmem_store;
pub mod sqlite_store;

#[cfg(test)]
pub(crate) mod conformance;

// 主要な型を再エクスポート
pub use self::http_client::ReqwestFeedClient;
pub use self::inmem_hint::{InMemoryHintQueue, NoopHintQueue};
pub use self::inmem_store::{InMemoryCursorStore, InMemoryTaskStore};
pub use self::sqlite_store::{SqliteCursorStore, SqliteTaskStore};
